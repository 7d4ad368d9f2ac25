// SPDX-License-Identifier: GPL-3.0-or-later

//! On-disk bitbase format and the process-wide cluster cache.
//!
//! A `.btb` file holds a header, an offset table and independently
//! compressed clusters of the bit array:
//!
//! ```text
//! magic        : 4 bytes "QBTB"
//! version      : u16
//! signature    : u32 packed piece counts
//! size_in_bits : u64
//! cluster_size : u32 decompressed bytes per cluster
//! compression  : u8  (0 none, 1 miniz, 2 lz4)
//! num_clusters : u32
//! offsets      : u64[num_clusters + 1] absolute file offsets
//! clusters     : compressed bytes
//! ```

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

pub const MAGIC: &[u8; 4] = b"QBTB";
pub const FORMAT_VERSION: u16 = 1;
pub const DEFAULT_CLUSTER_SIZE: u32 = 16 * 1024;
pub const DEFAULT_CACHE_CLUSTERS: usize = 511;

const HEADER_LEN: usize = 27;

#[derive(Debug, Error)]
pub enum BitbaseError {
    #[error("bitbase I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a bitbase file (bad magic)")]
    BadMagic,
    #[error("unsupported bitbase format version {0}")]
    BadVersion(u16),
    #[error("unknown compression id {0}")]
    BadCompression(u8),
    #[error("corrupt bitbase file: {0}")]
    Corrupt(&'static str),
    #[error("cluster failed to decompress: {0}")]
    Decompress(String),
    #[error("stored bitbase differs from the generated one at bit {0}")]
    VerifyMismatch(u64),
    #[error("generation invariant violated at index {index}: {fen}")]
    InvariantViolation { index: u64, fen: String },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Compression {
    None,
    Miniz,
    Lz4,
}

impl Compression {
    pub fn id(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Miniz => 1,
            Compression::Lz4 => 2,
        }
    }

    pub fn from_id(id: u8) -> Result<Compression, BitbaseError> {
        match id {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Miniz),
            2 => Ok(Compression::Lz4),
            other => Err(BitbaseError::BadCompression(other)),
        }
    }

    pub fn from_name(name: &str) -> Option<Compression> {
        match name {
            "none" => Some(Compression::None),
            "miniz" => Some(Compression::Miniz),
            "lz4" => Some(Compression::Lz4),
            _ => None,
        }
    }

    pub fn compress(self, data: &[u8]) -> Vec<u8> {
        match self {
            Compression::None => data.to_vec(),
            Compression::Miniz => miniz_oxide::deflate::compress_to_vec(data, 6),
            Compression::Lz4 => lz4_flex::compress_prepend_size(data),
        }
    }

    pub fn decompress(self, data: &[u8], expected_len: usize) -> Result<Vec<u8>, BitbaseError> {
        let out = match self {
            Compression::None => data.to_vec(),
            Compression::Miniz => miniz_oxide::inflate::decompress_to_vec(data)
                .map_err(|e| BitbaseError::Decompress(format!("{:?}", e)))?,
            Compression::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| BitbaseError::Decompress(e.to_string()))?,
        };
        if out.len() != expected_len {
            return Err(BitbaseError::Corrupt("cluster length mismatch"));
        }
        Ok(out)
    }
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn get_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(data[at..at + 2].try_into().unwrap())
}

fn get_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
}

fn get_u64(data: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(data[at..at + 8].try_into().unwrap())
}

/// Writes a complete bitbase file: header, offset table, compressed
/// clusters. The write goes to a temp file first and lands with an
/// atomic rename.
pub fn write_file(
    path: &Path,
    signature: u32,
    size_in_bits: u64,
    data: &[u8],
    cluster_size: u32,
    compression: Compression,
) -> Result<(), BitbaseError> {
    debug_assert!(cluster_size > 0);
    debug_assert!(data.len() as u64 >= (size_in_bits + 7) / 8);

    let num_clusters = data.len().div_ceil(cluster_size as usize);
    let mut compressed = Vec::with_capacity(num_clusters);
    for chunk in data.chunks(cluster_size as usize) {
        compressed.push(compression.compress(chunk));
    }

    let mut header = Vec::with_capacity(HEADER_LEN + (num_clusters + 1) * 8);
    header.extend_from_slice(MAGIC);
    put_u16(&mut header, FORMAT_VERSION);
    put_u32(&mut header, signature);
    put_u64(&mut header, size_in_bits);
    put_u32(&mut header, cluster_size);
    header.push(compression.id());
    put_u32(&mut header, num_clusters as u32);

    let mut offset = (HEADER_LEN + (num_clusters + 1) * 8) as u64;
    put_u64(&mut header, offset);
    for c in compressed.iter() {
        offset += c.len() as u64;
        put_u64(&mut header, offset);
    }

    let tmp: PathBuf = path.with_extension("btb.tmp");
    {
        let mut out = fs::File::create(&tmp)?;
        out.write_all(&header)?;
        for c in compressed.iter() {
            out.write_all(c)?;
        }
        out.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

enum Source {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Source {
    fn bytes(&self) -> &[u8] {
        match self {
            Source::Mapped(m) => m,
            Source::Owned(v) => v,
        }
    }
}

/// A bitbase whose clusters stay compressed until probed. `attach`
/// reads the header and offset table only; cluster bytes are sliced
/// out of the mapping on demand and parked in the cluster cache.
pub struct AttachedBitbase {
    source: Source,
    signature: u32,
    size_in_bits: u64,
    cluster_size: u32,
    compression: Compression,
    offsets: Vec<u64>,
    data_len: u64,
}

impl AttachedBitbase {
    pub fn attach(path: &Path) -> Result<AttachedBitbase, BitbaseError> {
        let file = fs::File::open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        AttachedBitbase::parse(Source::Mapped(map))
    }

    /// Attaches to an in-memory blob, e.g. a compiled-in bitbase.
    pub fn load_embedded(data: Vec<u8>) -> Result<AttachedBitbase, BitbaseError> {
        AttachedBitbase::parse(Source::Owned(data))
    }

    /// Compiled-in variant stored as a word array.
    pub fn load_embedded_words(words: &[u32], byte_len: usize) -> Result<AttachedBitbase, BitbaseError> {
        let mut data = Vec::with_capacity(byte_len);
        for w in words {
            data.extend_from_slice(&w.to_le_bytes());
        }
        data.truncate(byte_len);
        AttachedBitbase::load_embedded(data)
    }

    fn parse(source: Source) -> Result<AttachedBitbase, BitbaseError> {
        let (signature, size_in_bits, cluster_size, compression, offsets, data_len) = {
            let bytes = source.bytes();
            if bytes.len() < HEADER_LEN {
                return Err(BitbaseError::Corrupt("file shorter than header"));
            }
            if &bytes[0..4] != MAGIC {
                return Err(BitbaseError::BadMagic);
            }
            let version = get_u16(bytes, 4);
            if version != FORMAT_VERSION {
                return Err(BitbaseError::BadVersion(version));
            }
            let signature = get_u32(bytes, 6);
            let size_in_bits = get_u64(bytes, 10);
            let cluster_size = get_u32(bytes, 18);
            let compression = Compression::from_id(bytes[22])?;
            let num_clusters = get_u32(bytes, 23) as usize;

            if cluster_size == 0 {
                return Err(BitbaseError::Corrupt("zero cluster size"));
            }
            let table_end = HEADER_LEN + (num_clusters + 1) * 8;
            if bytes.len() < table_end {
                return Err(BitbaseError::Corrupt("truncated offset table"));
            }
            let mut offsets = Vec::with_capacity(num_clusters + 1);
            for i in 0..=num_clusters {
                offsets.push(get_u64(bytes, HEADER_LEN + i * 8));
            }
            for w in offsets.windows(2) {
                if w[0] > w[1] || w[1] > bytes.len() as u64 {
                    return Err(BitbaseError::Corrupt("offset table out of bounds"));
                }
            }
            let data_len = (size_in_bits + 7) / 8;
            if num_clusters as u64 != data_len.div_ceil(cluster_size as u64) {
                return Err(BitbaseError::Corrupt("cluster count mismatch"));
            }
            (signature, size_in_bits, cluster_size, compression, offsets, data_len)
        };

        Ok(AttachedBitbase {
            source,
            signature,
            size_in_bits,
            cluster_size,
            compression,
            offsets,
            data_len,
        })
    }

    pub fn signature(&self) -> u32 {
        self.signature
    }

    pub fn size_in_bits(&self) -> u64 {
        self.size_in_bits
    }

    fn cluster_bytes(&self, cluster: u32) -> Result<Vec<u8>, BitbaseError> {
        let lo = self.offsets[cluster as usize] as usize;
        let hi = self.offsets[cluster as usize + 1] as usize;
        let expected = (self.data_len - cluster as u64 * self.cluster_size as u64)
            .min(self.cluster_size as u64) as usize;
        self.compression
            .decompress(&self.source.bytes()[lo..hi], expected)
    }

    /// Reads one bit, pulling its cluster through the cache.
    pub fn bit(&self, index: u64, cache: &ClusterCache) -> Result<bool, BitbaseError> {
        if index >= self.size_in_bits {
            return Ok(false);
        }
        let bits_per_cluster = self.cluster_size as u64 * 8;
        let cluster = (index / bits_per_cluster) as u32;
        let data = cache.get_or_load(self.signature, cluster, || self.cluster_bytes(cluster))?;
        let offset = (index % bits_per_cluster) as usize;
        Ok(data[offset / 8] & (1 << (offset % 8)) != 0)
    }
}

struct CacheEntry {
    age: AtomicU64,
    data: Arc<Vec<u8>>,
}

/// Process-wide cache of decompressed clusters, keyed by bitbase
/// signature and cluster number. Hits share a read lock and bump an
/// age stamp; misses decompress outside any lock and take the write
/// lock only to insert, evicting the oldest entry when full.
pub struct ClusterCache {
    entries: RwLock<HashMap<(u32, u32), CacheEntry>>,
    insert_lock: Mutex<()>,
    clock: AtomicU64,
    capacity: usize,
}

impl ClusterCache {
    pub fn new(capacity: usize) -> ClusterCache {
        ClusterCache {
            entries: RwLock::new(HashMap::new()),
            insert_lock: Mutex::new(()),
            clock: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, key: (u32, u32)) -> Option<Arc<Vec<u8>>> {
        let entries = self.entries.read();
        entries.get(&key).map(|e| {
            e.age
                .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
            Arc::clone(&e.data)
        })
    }

    pub fn get_or_load<F>(&self, sig: u32, cluster: u32, load: F) -> Result<Arc<Vec<u8>>, BitbaseError>
    where
        F: FnOnce() -> Result<Vec<u8>, BitbaseError>,
    {
        let key = (sig, cluster);
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        // Serialise loaders so a popular cluster decompresses once.
        let _guard = self.insert_lock.lock();
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }
        let data = Arc::new(load()?);

        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            if let Some((&victim, _)) = entries
                .iter()
                .min_by_key(|(_, e)| e.age.load(Ordering::Relaxed))
            {
                entries.remove(&victim);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                age: AtomicU64::new(self.clock.fetch_add(1, Ordering::Relaxed)),
                data: Arc::clone(&data),
            },
        );
        Ok(data)
    }
}

impl Default for ClusterCache {
    fn default() -> ClusterCache {
        ClusterCache::new(DEFAULT_CACHE_CLUSTERS)
    }
}

/// Emits a bitbase as a Rust source file holding a word array, the
/// compiled-in storage variant.
pub fn write_rust_source(
    path: &Path,
    name: &str,
    signature: u32,
    size_in_bits: u64,
    data: &[u8],
    compression: Compression,
) -> Result<(), BitbaseError> {
    // The blob is a complete single-cluster file image so the loader
    // can parse it like any other bitbase.
    let mut blob = Vec::new();
    {
        let tmp_cluster = data.len().max(1) as u32;
        let compressed = compression.compress(data);
        blob.extend_from_slice(MAGIC);
        put_u16(&mut blob, FORMAT_VERSION);
        put_u32(&mut blob, signature);
        put_u64(&mut blob, size_in_bits);
        put_u32(&mut blob, tmp_cluster);
        blob.push(compression.id());
        put_u32(&mut blob, 1);
        let start = (HEADER_LEN + 16) as u64;
        put_u64(&mut blob, start);
        put_u64(&mut blob, start + compressed.len() as u64);
        blob.extend_from_slice(&compressed);
    }

    let mut out = String::new();
    out.push_str("// Generated endgame bitbase, do not edit.\n\n");
    out.push_str(&format!(
        "pub const {}_BYTES: usize = {};\n",
        name,
        blob.len()
    ));
    out.push_str(&format!(
        "pub static {}: [u32; {}] = [",
        name,
        blob.len().div_ceil(4)
    ));
    for (i, chunk) in blob.chunks(4).enumerate() {
        if i % 8 == 0 {
            out.push_str("\n    ");
        }
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        out.push_str(&format!("0x{:08x}, ", u32::from_le_bytes(word)));
    }
    out.push_str("\n];\n");

    fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bits(len_bits: u64) -> Vec<u8> {
        let mut data = vec![0u8; ((len_bits + 7) / 8) as usize];
        let mut x: u64 = 0x2545f4914f6cdd1d;
        for i in 0..len_bits {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            if x & 5 == 5 {
                data[(i / 8) as usize] |= 1 << (i % 8);
            }
        }
        data
    }

    fn bit_of(data: &[u8], i: u64) -> bool {
        data[(i / 8) as usize] & (1 << (i % 8)) != 0
    }

    #[test]
    fn round_trip_all_compressions() {
        let bits = 200_000;
        let data = sample_bits(bits);
        let dir = tempfile::tempdir().unwrap();

        for compression in [Compression::None, Compression::Miniz, Compression::Lz4] {
            let path = dir.path().join(format!("t{}.btb", compression.id()));
            write_file(&path, 0x42, bits, &data, 4096, compression).unwrap();

            let attached = AttachedBitbase::attach(&path).unwrap();
            assert_eq!(attached.size_in_bits(), bits);
            assert_eq!(attached.signature(), 0x42);

            let cache = ClusterCache::new(8);
            for i in (0..bits).step_by(611) {
                assert_eq!(
                    attached.bit(i, &cache).unwrap(),
                    bit_of(&data, i),
                    "bit {}",
                    i
                );
            }
            // Out-of-range bits read as unset.
            assert!(!attached.bit(bits + 5, &cache).unwrap());
        }
    }

    #[test]
    fn cache_stays_bounded() {
        let bits = 300_000;
        let data = sample_bits(bits);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.btb");
        write_file(&path, 7, bits, &data, 1024, Compression::Lz4).unwrap();

        let attached = AttachedBitbase::attach(&path).unwrap();
        let cache = ClusterCache::new(4);
        for i in (0..bits).step_by(4096) {
            attached.bit(i, &cache).unwrap();
        }
        assert!(cache.len() <= 4);
    }

    #[test]
    fn rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.btb");
        fs::write(&path, b"QXTBgarbagegarbagegarbagegarbage").unwrap();
        assert!(matches!(
            AttachedBitbase::attach(&path),
            Err(BitbaseError::BadMagic)
        ));
    }

    #[test]
    fn embedded_words_round_trip() {
        let bits = 50_000;
        let data = sample_bits(bits);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kpk_table.rs");
        write_rust_source(&path, "KPK", 9, bits, &data, Compression::Miniz).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let byte_len: usize = text
            .lines()
            .find(|l| l.contains("_BYTES"))
            .and_then(|l| l.split('=').nth(1))
            .and_then(|v| v.trim().trim_end_matches(';').parse().ok())
            .unwrap();
        let words: Vec<u32> = text
            .split('[')
            .nth(2)
            .unwrap()
            .split(']')
            .next()
            .unwrap()
            .split(',')
            .filter_map(|t| {
                let t = t.trim().trim_start_matches("0x");
                u32::from_str_radix(t, 16).ok()
            })
            .collect();

        let attached = AttachedBitbase::load_embedded_words(&words, byte_len).unwrap();
        assert_eq!(attached.size_in_bits(), bits);
        let cache = ClusterCache::default();
        for i in (0..bits).step_by(997) {
            assert_eq!(attached.bit(i, &cache).unwrap(), bit_of(&data, i));
        }
    }
}
