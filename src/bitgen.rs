// SPDX-License-Identifier: GPL-3.0-or-later

//! Retrograde bitbase generator. For a piece signature the generator
//! classifies every index as won-for-the-first-side or not, by seeding
//! mates and capture resolutions against simpler bitbases, then
//! propagating wins backwards through reverse moves until a fixed
//! point is reached.
//!
//! Sweeps run on a worker pool. Indices are handed out in packages of
//! fifty thousand from a shared counter; classification bitmaps take
//! word-wide atomic ORs, and each worker collects candidate
//! predecessors locally for the merge at the sweep join.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Instant;

use log::{debug, info, warn};

use crate::bitbase::{Bitbase, BitbaseRegistry};
use crate::bitboard::attacks_bb;
use crate::bitfile::{
    self, BitbaseError, Compression, DEFAULT_CLUSTER_SIZE,
};
use crate::bitindex::{decode, index_after_move, DecodedIndex, PieceList};
use crate::movegen::{Legal, MoveList};
use crate::position::Position;
use crate::signature::MaterialSignature;
use crate::types::*;

const WORK_PACKAGE: u64 = 50_000;

#[derive(Clone)]
pub struct GeneratorConfig {
    pub cores: usize,
    pub path: PathBuf,
    pub compression: Compression,
    pub cluster_size: u32,
    pub emit_rust_source: bool,
}

impl Default for GeneratorConfig {
    fn default() -> GeneratorConfig {
        GeneratorConfig {
            cores: 0,
            path: PathBuf::from("."),
            compression: Compression::Miniz,
            cluster_size: DEFAULT_CLUSTER_SIZE,
            emit_rust_source: false,
        }
    }
}

impl GeneratorConfig {
    fn worker_count(&self) -> usize {
        if self.cores > 0 {
            self.cores
        } else {
            thread::available_parallelism().map_or(1, |n| n.get())
        }
    }
}

/// The documented shortcut sets accepted by `bitgenerate`.
pub fn expand_signature_set(token: &str) -> Option<Vec<&'static str>> {
    match token {
        "3" => Some(vec!["KQK", "KRK", "KBK", "KNK", "KPK"]),
        "4" => Some(vec![
            "KQKQ", "KQKR", "KQKB", "KQKN", "KQKP", "KRKR", "KRKB", "KRKN", "KRKP", "KQQK",
            "KRRK", "KBBK", "KBNK", "KBPK", "KNPK", "KPPK", "KPKP", "KPKN", "KPKB",
        ]),
        "5" => Some(vec!["KQQKQ", "KQRKQ", "KRRKR"]),
        "5s" => Some(vec!["KQQKQ"]),
        _ => None,
    }
}

/// Shared classification state, one bit per index in each plane.
struct GenState {
    size: u64,
    won: Vec<AtomicU64>,
    computed: Vec<AtomicU64>,
    candidate: Vec<AtomicU64>,
}

fn word_count(size: u64) -> usize {
    ((size + 63) / 64) as usize
}

fn make_plane(size: u64) -> Vec<AtomicU64> {
    (0..word_count(size)).map(|_| AtomicU64::new(0)).collect()
}

fn plane_get(plane: &[AtomicU64], index: u64) -> bool {
    plane[(index / 64) as usize].load(Ordering::Relaxed) & (1 << (index % 64)) != 0
}

fn plane_set(plane: &[AtomicU64], index: u64) {
    plane[(index / 64) as usize].fetch_or(1 << (index % 64), Ordering::Relaxed);
}

impl GenState {
    fn new(size: u64) -> GenState {
        GenState {
            size,
            won: make_plane(size),
            computed: make_plane(size),
            candidate: make_plane(size),
        }
    }

    fn is_won(&self, index: u64) -> bool {
        plane_get(&self.won, index)
    }

    fn is_computed(&self, index: u64) -> bool {
        plane_get(&self.computed, index)
    }

    fn is_candidate(&self, index: u64) -> bool {
        plane_get(&self.candidate, index)
    }

    fn set_won(&self, index: u64) {
        plane_set(&self.won, index);
        plane_set(&self.computed, index);
    }

    fn set_not_won(&self, index: u64) {
        plane_set(&self.computed, index);
    }

    fn replace_candidates(&mut self, lists: Vec<Vec<u64>>) {
        self.candidate = make_plane(self.size);
        for list in lists {
            for index in list {
                if index < self.size {
                    plane_set(&self.candidate, index);
                }
            }
        }
    }

    fn won_snapshot(&self) -> Bitbase {
        let words = self
            .won
            .iter()
            .map(|w| w.load(Ordering::Relaxed))
            .collect();
        Bitbase::from_words(words, self.size)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SweepKind {
    /// Mates, stalemates, illegal indices and capture resolution.
    Initial,
    /// Min/max propagation over quiet moves.
    Propagate { only_candidates: bool },
    /// A full pass after the fixed point that must find nothing new.
    Verify,
}

/// Generates the bitbase for `sig` plus everything it depends on, and
/// leaves all of them registered. Files land in `cfg.path`.
pub fn generate(
    sig: MaterialSignature,
    registry: &mut BitbaseRegistry,
    cfg: &GeneratorConfig,
) -> Result<(), BitbaseError> {
    // The caller names the stronger side first by convention; a
    // reversed signature denotes the same bitbase mirrored.
    if !sig.has_enough_material_to_mate(WHITE) && sig.flip().has_enough_material_to_mate(WHITE) {
        return generate(sig.flip(), registry, cfg);
    }
    generate_rec(sig, registry, cfg)
}

fn generate_rec(
    sig: MaterialSignature,
    registry: &mut BitbaseRegistry,
    cfg: &GeneratorConfig,
) -> Result<(), BitbaseError> {
    if registry.covers(sig) {
        return Ok(());
    }

    let file = cfg.path.join(format!("{}.btb", sig));
    if file.exists() {
        match registry.attach_file(sig, &file) {
            Ok(()) => {
                info!("attached existing bitbase {}", file.display());
                return Ok(());
            }
            Err(e) => warn!("ignoring {}: {}", file.display(), e),
        }
    }

    // Prerequisites: every signature reachable by a capture, and every
    // promotion substitution of a pawn.
    for succ in sig.capture_successors() {
        generate_rec(succ, registry, cfg)?;
    }
    for succ in sig.promotion_successors() {
        generate_rec(succ, registry, cfg)?;
    }

    let bitbase = generate_one(sig, registry, cfg)?;
    registry.insert(sig, bitbase);
    Ok(())
}

fn generate_one(
    sig: MaterialSignature,
    registry: &BitbaseRegistry,
    cfg: &GeneratorConfig,
) -> Result<Bitbase, BitbaseError> {
    let list = PieceList::from_signature(sig);
    let size = list.size_in_bits();
    let workers = cfg.worker_count();
    let started = Instant::now();
    info!(
        "generating {} ({} indices, {} workers)",
        sig, size, workers
    );

    let mut state = GenState::new(size);

    let (seeded, cands) = sweep(&list, &state, registry, SweepKind::Initial, workers)?;
    state.replace_candidates(cands);
    info!("{}: initial sweep marked {} wins", sig, seeded);

    let mut sweep_no = 0u32;
    loop {
        let kind = SweepKind::Propagate {
            only_candidates: sweep_no > 0,
        };
        let (new_wins, cands) = sweep(&list, &state, registry, kind, workers)?;
        state.replace_candidates(cands);
        debug!("{}: sweep {} marked {} wins", sig, sweep_no, new_wins);
        if new_wins == 0 {
            break;
        }
        sweep_no += 1;
    }

    // Nothing may change once the fixed point is reached; a late win
    // means the candidate propagation missed a predecessor, which is a
    // bug the result cannot be trusted after. The verify sweep turns
    // any such find into a fatal error.
    sweep(&list, &state, registry, SweepKind::Verify, workers)?;

    let bitbase = state.won_snapshot();
    info!(
        "{}: {} of {} indices won after {} sweeps in {:.1}s",
        sig,
        bitbase.count_set(),
        size,
        sweep_no + 1,
        started.elapsed().as_secs_f32()
    );

    store_and_verify(sig, &bitbase, cfg)?;
    Ok(bitbase)
}

/// Writes the finished bitbase and proves the file round-trips before
/// anyone relies on it.
fn store_and_verify(
    sig: MaterialSignature,
    bitbase: &Bitbase,
    cfg: &GeneratorConfig,
) -> Result<(), BitbaseError> {
    std::fs::create_dir_all(&cfg.path)?;
    let path = cfg.path.join(format!("{}.btb", sig));
    let bytes = bitbase.to_bytes();
    bitfile::write_file(
        &path,
        sig.0,
        bitbase.size_in_bits(),
        &bytes,
        cfg.cluster_size,
        cfg.compression,
    )?;

    let reread = bitfile::AttachedBitbase::attach(&path)?;
    let cache = bitfile::ClusterCache::default();
    for index in 0..bitbase.size_in_bits() {
        if reread.bit(index, &cache)? != bitbase.bit(index) {
            return Err(BitbaseError::VerifyMismatch(index));
        }
    }
    info!("stored {}", path.display());

    if cfg.emit_rust_source {
        let rs = cfg.path.join(format!("{}.rs", sig.to_string().to_lowercase()));
        bitfile::write_rust_source(
            &rs,
            &sig.to_string(),
            sig.0,
            bitbase.size_in_bits(),
            &bytes,
            cfg.compression,
        )?;
        info!("emitted {}", rs.display());
    }
    Ok(())
}

fn sweep(
    list: &PieceList,
    state: &GenState,
    registry: &BitbaseRegistry,
    kind: SweepKind,
    workers: usize,
) -> Result<(u64, Vec<Vec<u64>>), BitbaseError> {
    let counter = AtomicU64::new(0);
    let size = state.size;

    let results: Vec<Result<(u64, Vec<u64>), BitbaseError>> = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            handles.push(scope.spawn(|| -> Result<(u64, Vec<u64>), BitbaseError> {
                let mut new_wins = 0u64;
                let mut candidates: Vec<u64> = Vec::new();
                loop {
                    let start = counter.fetch_add(WORK_PACKAGE, Ordering::Relaxed);
                    if start >= size {
                        break;
                    }
                    let end = (start + WORK_PACKAGE).min(size);
                    for index in start..end {
                        new_wins +=
                            process_index(list, state, registry, kind, index, &mut candidates)?
                                as u64;
                    }
                }
                Ok((new_wins, candidates))
            }));
        }
        handles
            .into_iter()
            .map(|h| h.join().expect("generator worker panicked"))
            .collect()
    });

    let mut total = 0;
    let mut cands = Vec::with_capacity(workers);
    for r in results {
        let (wins, c) = r?;
        total += wins;
        cands.push(c);
    }
    Ok((total, cands))
}

fn build_position(list: &PieceList, d: &DecodedIndex) -> Option<Position> {
    let pieces: Vec<(Piece, Square)> = (0..list.len())
        .map(|i| (list.piece(i), d.squares[i]))
        .collect();
    let stm = if d.white_to_move { WHITE } else { BLACK };
    Position::from_pieces(&pieces, stm)
}

fn process_index(
    list: &PieceList,
    state: &GenState,
    registry: &BitbaseRegistry,
    kind: SweepKind,
    index: u64,
    candidates: &mut Vec<u64>,
) -> Result<bool, BitbaseError> {
    if state.is_computed(index) {
        return Ok(false);
    }
    if let SweepKind::Propagate {
        only_candidates: true,
    } = kind
    {
        if !state.is_candidate(index) {
            return Ok(false);
        }
    }

    let decoded = match decode(index, list) {
        Some(d) => d,
        None => {
            if kind == SweepKind::Initial {
                state.set_not_won(index);
            }
            return Ok(false);
        }
    };
    let mut pos = match build_position(list, &decoded) {
        Some(p) => p,
        None => {
            if kind == SweepKind::Initial {
                state.set_not_won(index);
            }
            return Ok(false);
        }
    };
    debug_assert!(
        crate::bitindex::compute_index(&pos, list, crate::bitindex::Viewpoint::Direct) == index
    );

    match kind {
        SweepKind::Initial => initial_classify(list, state, registry, index, &decoded, &mut pos, candidates),
        SweepKind::Propagate { .. } => {
            Ok(propagate_classify(list, state, index, &decoded, &pos, candidates))
        }
        SweepKind::Verify => {
            if propagate_classify(list, state, index, &decoded, &pos, candidates) {
                return Err(BitbaseError::InvariantViolation {
                    index,
                    fen: pos.fen(),
                });
            }
            Ok(false)
        }
    }
}

/// Terminal positions and capture resolution against the prerequisite
/// bitbases.
fn initial_classify(
    list: &PieceList,
    state: &GenState,
    registry: &BitbaseRegistry,
    index: u64,
    decoded: &DecodedIndex,
    pos: &mut Position,
    candidates: &mut Vec<u64>,
) -> Result<bool, BitbaseError> {
    let white_to_move = decoded.white_to_move;
    let moves: Vec<Move> = MoveList::new(pos, Legal).collect();

    if moves.is_empty() {
        // Mate counts for white only when black is the mated side.
        if pos.in_check() && !white_to_move {
            state.set_won(index);
            mark_candidates(list, state, decoded, pos, candidates);
            return Ok(true);
        }
        state.set_not_won(index);
        return Ok(false);
    }

    for m in moves {
        if !pos.capture_or_promotion(m) {
            continue;
        }
        let gives_check = pos.gives_check(m);
        pos.do_move(m, gives_check);
        let white_wins_child = registry.white_wins(pos).unwrap_or(false);
        pos.undo_move(m);

        if white_to_move && white_wins_child {
            // A capture or promotion wins on the spot.
            state.set_won(index);
            mark_candidates(list, state, decoded, pos, candidates);
            return Ok(true);
        }
        if !white_to_move && !white_wins_child {
            // Black bails out into a position white does not win; no
            // amount of propagation changes that.
            state.set_not_won(index);
            return Ok(false);
        }
    }

    Ok(false)
}

/// One application of the retrograde min/max rule over quiet moves:
/// white needs a single won successor, black must be forced into one
/// everywhere.
fn propagate_classify(
    list: &PieceList,
    state: &GenState,
    index: u64,
    decoded: &DecodedIndex,
    pos: &Position,
    candidates: &mut Vec<u64>,
) -> bool {
    let white_to_move = decoded.white_to_move;
    let mut all_won = true;
    let mut any_won = false;

    for m in MoveList::new(pos, Legal) {
        if pos.capture_or_promotion(m) {
            // Captures were settled in the initial sweep: reaching this
            // point means none of black's saves and none of white's
            // direct wins exist among them.
            continue;
        }
        let piece_no = decoded
            .squares
            .iter()
            .position(|&s| s == m.from())
            .expect("moved piece in decoded squares");
        let child = index_after_move(list, &decoded.squares, !white_to_move, piece_no, m.to());
        if state.is_won(child) {
            any_won = true;
            if white_to_move {
                break;
            }
        } else {
            all_won = false;
            if !white_to_move {
                break;
            }
        }
    }

    let won = if white_to_move { any_won } else { all_won };
    if won {
        state.set_won(index);
        mark_candidates(list, state, decoded, pos, candidates);
    }
    won
}

/// Flags every predecessor of a freshly won position for the next
/// sweep: reverse moves of the side that just moved into it, pawns
/// stepping back one square (or two from their fourth rank). The set
/// is a superset of the true frontier; a stray candidate only costs a
/// recheck.
fn mark_candidates(
    list: &PieceList,
    _state: &GenState,
    decoded: &DecodedIndex,
    pos: &Position,
    candidates: &mut Vec<u64>,
) {
    let mover_is_white = !decoded.white_to_move;
    let mover = if mover_is_white { WHITE } else { BLACK };
    let occupied = pos.pieces();

    for piece_no in 0..list.len() {
        let pc = list.piece(piece_no);
        if pc.color() != mover {
            continue;
        }
        let from = decoded.squares[piece_no];

        if pc.piece_type() == PAWN {
            let back = -crate::types::pawn_push(mover);
            let start_rank = relative_rank(mover, RANK_4);
            if from.relative_rank(mover) >= RANK_3 {
                let one = from + back;
                if occupied & one == 0 {
                    candidates.push(index_after_move(
                        list,
                        &decoded.squares,
                        mover_is_white,
                        piece_no,
                        one,
                    ));
                }
                if from.rank() == start_rank {
                    let two = one + back;
                    if occupied & two == 0 {
                        candidates.push(index_after_move(
                            list,
                            &decoded.squares,
                            mover_is_white,
                            piece_no,
                            two,
                        ));
                    }
                }
            }
            continue;
        }

        let mut reach = attacks_bb(pc.piece_type(), from, occupied) & !occupied;
        if pc.piece_type() == KING {
            let enemy_king = decoded.squares[if piece_no == 0 { 1 } else { 0 }];
            reach &= !crate::bitboard::pseudo_attacks(KING, enemy_king);
        }
        for to in reach {
            candidates.push(index_after_move(
                list,
                &decoded.squares,
                mover_is_white,
                piece_no,
                to,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitbase::BitbaseValue;
    use crate::bitindex::{compute_index, Viewpoint};

    fn quiet_config(dir: &std::path::Path) -> GeneratorConfig {
        GeneratorConfig {
            cores: 2,
            path: dir.to_path_buf(),
            compression: Compression::Lz4,
            cluster_size: 4096,
            emit_rust_source: false,
        }
    }

    fn generate_kpk() -> BitbaseRegistry {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = BitbaseRegistry::new();
        let sig = MaterialSignature::parse("KPK").unwrap();
        generate(sig, &mut registry, &quiet_config(dir.path())).unwrap();
        registry
    }

    fn probe(registry: &BitbaseRegistry, fen: &str) -> BitbaseValue {
        let pos = Position::from_fen(fen).unwrap();
        registry.probe_value(&pos)
    }

    #[test]
    fn kqk_counts_look_classical() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = BitbaseRegistry::new();
        let sig = MaterialSignature::parse("KQK").unwrap();
        generate(sig, &mut registry, &quiet_config(dir.path())).unwrap();

        // KQK is almost always won for the queen's side.
        let list = PieceList::from_signature(sig);
        let mut legal = 0u64;
        let mut won = 0u64;
        for index in 0..list.size_in_bits() {
            if let Some(d) = decode(index, &list) {
                if build_position(&list, &d).is_some() {
                    legal += 1;
                    let pos = build_position(&list, &d).unwrap();
                    if registry.probe_value(&pos)
                        == if d.white_to_move {
                            BitbaseValue::Win
                        } else {
                            BitbaseValue::Loss
                        }
                    {
                        won += 1;
                    }
                }
            }
        }
        assert!(legal > 0);
        let ratio = won as f64 / legal as f64;
        assert!(ratio > 0.80, "KQK won ratio {}", ratio);
    }

    #[test]
    fn kqk_specific_positions() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = BitbaseRegistry::new();
        generate(
            MaterialSignature::parse("KQK").unwrap(),
            &mut registry,
            &quiet_config(dir.path()),
        )
        .unwrap();

        // Queen and king against bare king: win with either side to move.
        assert_eq!(probe(&registry, "4k3/8/8/8/8/8/8/Q3K3 w - - 0 1"), BitbaseValue::Win);
        assert_eq!(probe(&registry, "4k3/8/8/8/8/8/8/Q3K3 b - - 0 1"), BitbaseValue::Loss);
        // Immediate stalemate trap is not a win.
        assert_eq!(probe(&registry, "k7/2Q5/8/8/8/8/8/4K3 b - - 0 1"), BitbaseValue::Draw);
    }

    #[test]
    fn kpk_theory_positions() {
        let registry = generate_kpk();

        // Kings on e1/e8, pawn e2: white to move wins (the king walks
        // to a key square in front of the pawn first).
        assert_eq!(
            probe(&registry, "4k3/8/8/8/8/8/4P3/4K3 w - - 0 1"),
            BitbaseValue::Win
        );

        // King on the sixth in front of its pawn always wins.
        assert_eq!(
            probe(&registry, "4k3/8/4K3/4P3/8/8/8/8 w - - 0 1"),
            BitbaseValue::Win
        );

        // Rook pawn with the defender in the corner is the classical
        // draw.
        assert_eq!(
            probe(&registry, "k7/8/8/8/8/8/P7/K7 w - - 0 1"),
            BitbaseValue::Draw
        );

        // Reserve pawn tempo wrests the opposition back: win.
        assert_eq!(
            probe(&registry, "8/8/8/4k3/8/4K3/4P3/8 w - - 0 1"),
            BitbaseValue::Win
        );
        // Defender camps on the square in front of the pawn while the
        // attacking king sits behind it: dead draw.
        assert_eq!(
            probe(&registry, "8/8/8/4k3/4P3/4K3/8/8 w - - 0 1"),
            BitbaseValue::Draw
        );
    }

    #[test]
    fn kpk_won_share_is_plausible() {
        let registry = generate_kpk();
        let sig = MaterialSignature::parse("KPK").unwrap();
        let list = PieceList::from_signature(sig);

        let mut legal = 0u64;
        let mut won = 0u64;
        for index in 0..list.size_in_bits() {
            if let Some(d) = decode(index, &list) {
                if let Some(pos) = build_position(&list, &d) {
                    legal += 1;
                    let direct = compute_index(&pos, &list, Viewpoint::Direct);
                    assert_eq!(direct, index);
                    if registry.bit(sig, index) == Some(true) {
                        won += 1;
                    }
                }
            }
        }
        let ratio = won as f64 / legal as f64;
        assert!(
            (0.40..0.80).contains(&ratio),
            "KPK won share {} of {} legal",
            ratio,
            legal
        );
    }

    #[test]
    fn generated_file_attaches_and_agrees() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = BitbaseRegistry::new();
        let sig = MaterialSignature::parse("KPK").unwrap();
        generate(sig, &mut registry, &quiet_config(dir.path())).unwrap();

        let mut from_disk = BitbaseRegistry::new();
        from_disk
            .attach_file(sig, &dir.path().join("KPK.btb"))
            .unwrap();

        let list = PieceList::from_signature(sig);
        for index in (0..list.size_in_bits()).step_by(101) {
            assert_eq!(registry.bit(sig, index), from_disk.bit(sig, index));
        }
    }

    #[test]
    fn reversed_signature_generates_the_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = BitbaseRegistry::new();
        // "KKQ" names the same table as KQK.
        generate(
            MaterialSignature::parse("KKQ").unwrap(),
            &mut registry,
            &quiet_config(dir.path()),
        )
        .unwrap();
        assert!(registry.covers(MaterialSignature::parse("KQK").unwrap()));

        // A black queen mates through the flipped viewpoint.
        assert_eq!(
            probe(&registry, "4k3/8/8/8/8/8/q7/4K3 b - - 0 1"),
            BitbaseValue::Win
        );
    }
}
