// SPDX-License-Identifier: GPL-3.0-or-later

//! In-memory bitbases and the registry the search probes. A bitbase
//! records, for one piece signature, which positions the first-listed
//! side wins; the flipped viewpoint serves the other side.

use std::collections::HashMap;
use std::path::Path;

use log::warn;

use crate::bitfile::{AttachedBitbase, BitbaseError, ClusterCache};
use crate::bitindex::{compute_index, PieceList, Viewpoint};
use crate::position::Position;
use crate::signature::MaterialSignature;
use crate::types::*;

/// Bit array sized by an index cardinality; bit set means "first side
/// wins".
#[derive(Clone)]
pub struct Bitbase {
    words: Vec<u64>,
    size_in_bits: u64,
}

impl Bitbase {
    pub fn new(size_in_bits: u64) -> Bitbase {
        Bitbase {
            words: vec![0; (size_in_bits as usize).div_ceil(64)],
            size_in_bits,
        }
    }

    pub fn size_in_bits(&self) -> u64 {
        self.size_in_bits
    }

    pub fn bit(&self, index: u64) -> bool {
        if index >= self.size_in_bits {
            return false;
        }
        self.words[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    pub fn set_bit(&mut self, index: u64) {
        debug_assert!(index < self.size_in_bits);
        self.words[(index / 64) as usize] |= 1 << (index % 64);
    }

    pub fn count_set(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// Little-endian byte image, the storage layer's exchange format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let len = ((self.size_in_bits + 7) / 8) as usize;
        let mut out = Vec::with_capacity(len);
        for w in self.words.iter() {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out.truncate(len);
        out
    }

    pub fn from_bytes(bytes: &[u8], size_in_bits: u64) -> Bitbase {
        let mut bb = Bitbase::new(size_in_bits);
        for (i, &b) in bytes.iter().enumerate() {
            if b != 0 {
                bb.words[i / 8] |= (b as u64) << (8 * (i % 8));
            }
        }
        bb
    }

    /// Wraps a word snapshot, e.g. the generator's final state.
    pub fn from_words(words: Vec<u64>, size_in_bits: u64) -> Bitbase {
        debug_assert!(words.len() == (size_in_bits as usize).div_ceil(64));
        Bitbase {
            words,
            size_in_bits,
        }
    }
}

/// Probe outcome from the side to move's point of view.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BitbaseValue {
    Win,
    Loss,
    Draw,
    Unknown,
}

enum Slot {
    Memory(Bitbase),
    Attached(AttachedBitbase),
}

/// Loaded bitbases keyed by signature, owned by the engine context and
/// handed into the search by reference. Signatures whose first side
/// cannot mate are implicit all-zero bitbases and are never stored.
pub struct BitbaseRegistry {
    slots: HashMap<MaterialSignature, Slot>,
    lists: HashMap<MaterialSignature, PieceList>,
    cache: ClusterCache,
    max_men: u32,
}

impl BitbaseRegistry {
    pub fn new() -> BitbaseRegistry {
        BitbaseRegistry {
            slots: HashMap::new(),
            lists: HashMap::new(),
            cache: ClusterCache::default(),
            max_men: 0,
        }
    }

    pub fn with_cache_capacity(clusters: usize) -> BitbaseRegistry {
        BitbaseRegistry {
            cache: ClusterCache::new(clusters),
            ..BitbaseRegistry::new()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn max_men(&self) -> u32 {
        self.max_men
    }

    fn remember(&mut self, sig: MaterialSignature) {
        self.max_men = self.max_men.max(sig.men());
        self.lists
            .entry(sig)
            .or_insert_with(|| PieceList::from_signature(sig));
    }

    pub fn insert(&mut self, sig: MaterialSignature, bitbase: Bitbase) {
        self.remember(sig);
        self.slots.insert(sig, Slot::Memory(bitbase));
    }

    pub fn attach_file(&mut self, sig: MaterialSignature, path: &Path) -> Result<(), BitbaseError> {
        let attached = AttachedBitbase::attach(path)?;
        if attached.signature() != sig.0 {
            return Err(BitbaseError::Corrupt("signature does not match file name"));
        }
        self.remember(sig);
        self.slots.insert(sig, Slot::Attached(attached));
        Ok(())
    }

    /// Attaches to a compiled-in word blob.
    pub fn load_embedded(
        &mut self,
        sig: MaterialSignature,
        words: &[u32],
        byte_len: usize,
    ) -> Result<(), BitbaseError> {
        let attached = AttachedBitbase::load_embedded_words(words, byte_len)?;
        self.remember(sig);
        self.slots.insert(sig, Slot::Attached(attached));
        Ok(())
    }

    /// A signature counts as covered when a bitbase is loaded or its
    /// first side cannot mate at all.
    pub fn covers(&self, sig: MaterialSignature) -> bool {
        self.slots.contains_key(&sig) || !sig.has_enough_material_to_mate(WHITE)
    }

    /// Reads one bit of the signature's bitbase. Storage failures
    /// degrade to "not won" with a warning; the search then falls back
    /// to its evaluation.
    pub fn bit(&self, sig: MaterialSignature, index: u64) -> Option<bool> {
        match self.slots.get(&sig) {
            Some(Slot::Memory(bb)) => Some(bb.bit(index)),
            Some(Slot::Attached(bb)) => match bb.bit(index, &self.cache) {
                Ok(b) => Some(b),
                Err(e) => {
                    warn!("bitbase {} probe failed: {}", sig, e);
                    Some(false)
                }
            },
            None => {
                if !sig.has_enough_material_to_mate(WHITE) {
                    Some(false)
                } else {
                    None
                }
            }
        }
    }

    fn list_for(&self, sig: MaterialSignature) -> Option<&PieceList> {
        self.lists.get(&sig)
    }

    /// Whether the first side of `sig` wins the given position. The
    /// `flipped` viewpoint is used when the probing position has the
    /// signature's colors reversed.
    fn wins(&self, sig: MaterialSignature, pos: &Position, viewpoint: Viewpoint) -> Option<bool> {
        if !sig.has_enough_material_to_mate(WHITE) {
            return Some(false);
        }
        if !self.slots.contains_key(&sig) {
            return None;
        }
        let list = self.list_for(sig)?;
        let index = compute_index(pos, list, viewpoint);
        self.bit(sig, index)
    }

    /// One-sided lookup used by the generator's capture resolution:
    /// does white (the first-listed side) win this position? `None`
    /// when no bitbase covers the signature.
    pub fn white_wins(&self, pos: &Position) -> Option<bool> {
        self.wins(pos.material_signature(), pos, Viewpoint::Direct)
    }

    /// Two-sided lookup: first ask whether white wins, then flip the
    /// signature and ask whether black does. Missing material turns
    /// "does not win" into a definite draw.
    pub fn probe_value(&self, pos: &Position) -> BitbaseValue {
        if self.slots.is_empty() {
            return BitbaseValue::Unknown;
        }
        let sig = pos.material_signature();
        if sig.men() > self.max_men {
            return BitbaseValue::Unknown;
        }
        let wtm = pos.side_to_move() == WHITE;

        let white_wins = self.wins(sig, pos, Viewpoint::Direct);
        if white_wins == Some(true) {
            return if wtm { BitbaseValue::Win } else { BitbaseValue::Loss };
        }
        if white_wins == Some(false) && !sig.has_enough_material_to_mate(BLACK) {
            return BitbaseValue::Draw;
        }

        let flipped = sig.flip();
        let black_wins = self.wins(flipped, pos, Viewpoint::Flipped);
        if black_wins == Some(true) {
            return if wtm { BitbaseValue::Loss } else { BitbaseValue::Win };
        }
        if black_wins == Some(false) && white_wins == Some(false) {
            return BitbaseValue::Draw;
        }

        BitbaseValue::Unknown
    }
}

impl Default for BitbaseRegistry {
    fn default() -> BitbaseRegistry {
        BitbaseRegistry::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_array_round_trip() {
        let mut bb = Bitbase::new(1000);
        for i in (0..1000).step_by(37) {
            bb.set_bit(i);
        }
        let bytes = bb.to_bytes();
        let back = Bitbase::from_bytes(&bytes, 1000);
        for i in 0..1000 {
            assert_eq!(bb.bit(i), back.bit(i), "bit {}", i);
        }
        assert_eq!(bb.count_set(), back.count_set());
    }

    #[test]
    fn out_of_range_bits_read_unset() {
        let bb = Bitbase::new(10);
        assert!(!bb.bit(10));
        assert!(!bb.bit(1 << 40));
    }

    #[test]
    fn empty_registry_is_unknown() {
        let reg = BitbaseRegistry::new();
        let pos = Position::from_fen("4k3/8/8/8/8/8/4P3/4K3 w - - 0 1").unwrap();
        assert_eq!(reg.probe_value(&pos), BitbaseValue::Unknown);
    }

    #[test]
    fn kk_is_draw_once_anything_is_loaded() {
        let mut reg = BitbaseRegistry::new();
        let sig = MaterialSignature::parse("KPK").unwrap();
        let list = PieceList::from_signature(sig);
        reg.insert(sig, Bitbase::new(list.size_in_bits()));

        let kk = Position::from_fen("8/8/8/4k3/8/4K3/8/8 w - - 0 1").unwrap();
        assert_eq!(reg.probe_value(&kk), BitbaseValue::Draw);
    }

    #[test]
    fn all_zero_kpk_reads_draw_for_both() {
        // With an all-zero KPK table, white never wins and black has
        // no material: every KPK position reads as a draw.
        let mut reg = BitbaseRegistry::new();
        let sig = MaterialSignature::parse("KPK").unwrap();
        let list = PieceList::from_signature(sig);
        reg.insert(sig, Bitbase::new(list.size_in_bits()));

        let pos = Position::from_fen("4k3/8/8/8/8/8/4P3/4K3 w - - 0 1").unwrap();
        assert_eq!(reg.probe_value(&pos), BitbaseValue::Draw);
    }
}
