// SPDX-License-Identifier: GPL-3.0-or-later

//! Dense index for endgame bitbases: a bijection between the legal
//! placements of a piece signature (plus side to move) and an integer
//! range. Symmetries shrink the range: the first-listed king lives on
//! files A-D when pawns are present, and inside the A1-D1-D4 triangle
//! otherwise, with the diagonal tie broken by the remaining pieces.
//!
//! Index layout, innermost first: side-to-move bit, king-pair index,
//! one slot per pawn, one slot per remaining piece with skip-occupied
//! square coding.

use once_cell::sync::Lazy;

use crate::bitboard::{distance, popcount, Bitboard, EMPTY_BB};
use crate::position::Position;
use crate::signature::MaterialSignature;
use crate::types::*;

pub const KING_PAIRS_WITH_PAWN: u32 = 1806;
pub const KING_PAIRS_NO_PAWN: u32 = 462;
const PAWN_SQUARES: u64 = 48;
const COLORS: u64 = 2;

const MAP_FILE: u32 = 1;
const MAP_RANK: u32 = 2;
const MAP_TRIANGLE: u32 = 4;

fn on_diagonal(s: Square) -> bool {
    s.file() == s.rank()
}

fn above_diagonal(s: Square) -> bool {
    s.file() < s.rank()
}

fn map_square(s: Square, map_type: u32) -> Square {
    let mut sq = s;
    if map_type & MAP_FILE != 0 {
        sq = sq.flip_file();
    }
    if map_type & MAP_RANK != 0 {
        sq = sq.flip_rank();
    }
    if map_type & MAP_TRIANGLE != 0 {
        sq = Square((sq.0 >> 3) | ((sq.0 & 7) << 3));
    }
    sq
}

/// The first king's canonical squares when no pawn is on the board.
const TRIANGLE_SQUARES: [Square; 10] = [
    Square::A1,
    Square::B1,
    Square::C1,
    Square::D1,
    Square(9),  // B2
    Square(10), // C2
    Square(11), // D2
    Square(18), // C3
    Square(19), // D3
    Square(27), // D4
];

struct KingMaps {
    pair_to_index_pawn: [u32; 64 * 64],
    index_to_pair_pawn: [u16; KING_PAIRS_WITH_PAWN as usize],
    pair_to_index_free: [u32; 64 * 64],
    index_to_pair_free: [u16; KING_PAIRS_NO_PAWN as usize],
}

static KING_MAPS: Lazy<Box<KingMaps>> = Lazy::new(|| {
    let mut maps = Box::new(KingMaps {
        pair_to_index_pawn: [u32::MAX; 64 * 64],
        index_to_pair_pawn: [0; KING_PAIRS_WITH_PAWN as usize],
        pair_to_index_free: [u32::MAX; 64 * 64],
        index_to_pair_free: [0; KING_PAIRS_NO_PAWN as usize],
    });

    // With pawns: first king on files A-D, any rank.
    let mut index = 0u32;
    for k1 in (0..64).map(Square).filter(|s| s.file() <= FILE_D) {
        for k2 in (0..64).map(Square) {
            let pair = (k1.0 + k2.0 * 64) as usize;
            maps.pair_to_index_pawn[pair] = index;
            if distance(k1, k2) > 1 {
                maps.index_to_pair_pawn[index as usize] = pair as u16;
                index += 1;
            }
        }
    }
    debug_assert!(index == KING_PAIRS_WITH_PAWN);

    // Without pawns: first king inside the triangle; placements with
    // both kings on the long diagonal mirrored above it are skipped,
    // their canonical twin lies below.
    let mut index = 0u32;
    for &k1 in TRIANGLE_SQUARES.iter() {
        for k2 in (0..64).map(Square) {
            if on_diagonal(k1) && above_diagonal(k2) {
                continue;
            }
            let pair = (k1.0 + k2.0 * 64) as usize;
            maps.pair_to_index_free[pair] = index;
            if distance(k1, k2) > 1 {
                maps.index_to_pair_free[index as usize] = pair as u16;
                index += 1;
            }
        }
    }
    debug_assert!(index == KING_PAIRS_NO_PAWN);

    maps
});

/// Ordered piece tuple of a signature: first-listed king, other king,
/// all pawns, then the remaining pieces. Pieces of one kind stay
/// adjacent so duplicate placements can be canonicalised.
#[derive(Clone)]
pub struct PieceList {
    pieces: Vec<Piece>,
    pawn_count: usize,
}

impl PieceList {
    pub fn from_signature(sig: MaterialSignature) -> PieceList {
        let mut pieces = vec![W_KING, B_KING];
        let mut pawn_count = 0;
        for c in [WHITE, BLACK] {
            for _ in 0..sig.count(c, PAWN) {
                pieces.push(Piece::make(c, PAWN));
                pawn_count += 1;
            }
        }
        for c in [WHITE, BLACK] {
            for pt in [KNIGHT, BISHOP, ROOK, QUEEN] {
                for _ in 0..sig.count(c, pt) {
                    pieces.push(Piece::make(c, pt));
                }
            }
        }
        PieceList { pieces, pawn_count }
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece(&self, i: usize) -> Piece {
        self.pieces[i]
    }

    pub fn pawn_count(&self) -> usize {
        self.pawn_count
    }

    pub fn has_pawns(&self) -> bool {
        self.pawn_count != 0
    }

    /// Total index cardinality for this signature.
    pub fn size_in_bits(&self) -> u64 {
        let king_pairs = if self.has_pawns() {
            KING_PAIRS_WITH_PAWN
        } else {
            KING_PAIRS_NO_PAWN
        } as u64;
        let mut size = COLORS * king_pairs;
        for i in 0..self.pawn_count {
            size *= PAWN_SQUARES - i as u64;
        }
        let non_pawns = self.len() - 2 - self.pawn_count;
        for j in 0..non_pawns {
            size *= 64 - 2 - self.pawn_count as u64 - j as u64;
        }
        size
    }

    /// Extracts the squares of a position in list order. Duplicate
    /// pieces are read in ascending square order.
    pub fn squares_of(&self, pos: &Position) -> Vec<Square> {
        let mut squares = Vec::with_capacity(self.len());
        let mut cursor = EMPTY_BB;
        let mut prev = NO_PIECE;
        for &pc in self.pieces.iter() {
            if pc != prev {
                cursor = pos.pieces_cp(pc.color(), pc.piece_type());
                prev = pc;
            }
            debug_assert!(cursor != 0);
            let s = crate::bitboard::pop_lsb(&mut cursor);
            squares.push(s);
        }
        squares
    }
}

/// Encodes a placement into its index. `white_to_move` refers to the
/// first-listed side. The caller passes squares parallel to the piece
/// list; duplicate groups are canonicalised internally.
pub fn encode(list: &PieceList, squares: &[Square], white_to_move: bool) -> u64 {
    debug_assert!(squares.len() == list.len());
    let has_pawn = list.has_pawns();

    let mut k1 = squares[0];
    let mut k2 = squares[1];

    // Orient the board.
    let mut map_type = 0;
    if k1.file() >= FILE_E {
        map_type |= MAP_FILE;
    }
    let mut diag_count = 0;
    if !has_pawn {
        if map_square(k1, map_type).rank() >= RANK_5 {
            map_type |= MAP_RANK;
        }
        let m1 = map_square(k1, map_type);
        if above_diagonal(m1) {
            map_type |= MAP_TRIANGLE;
        } else if on_diagonal(m1) {
            diag_count = 1;
            let m2 = map_square(k2, map_type);
            if above_diagonal(m2) {
                map_type |= MAP_TRIANGLE;
            } else if on_diagonal(m2) {
                diag_count = 2;
            }
        }
    }
    k1 = map_square(squares[0], map_type);
    k2 = map_square(squares[1], map_type);

    let mut index = if white_to_move { 0 } else { 1 };
    let mut size: u64 = COLORS;

    let pair = (k1.0 + k2.0 * 64) as usize;
    let (pair_index, king_pairs) = if has_pawn {
        (KING_MAPS.pair_to_index_pawn[pair], KING_PAIRS_WITH_PAWN)
    } else {
        (KING_MAPS.pair_to_index_free[pair], KING_PAIRS_NO_PAWN)
    };
    debug_assert!(pair_index != u32::MAX);
    index += pair_index as u64 * size;
    size *= king_pairs as u64;

    // Pawns: slots over the 48 pawn squares, skipping earlier pawns.
    let mapped: Vec<Square> = squares.iter().map(|&s| map_square(s, map_type)).collect();
    // Canonical order inside duplicate groups: ascending mapped square.
    // Groups keep their piece-list position.
    let mut group_start = vec![0usize; list.len()];
    for i in 2..list.len() {
        group_start[i] = if i > 2 && list.piece(i) == list.piece(i - 1) {
            group_start[i - 1]
        } else {
            i
        };
    }
    let mut order: Vec<usize> = (2..list.len()).collect();
    order.sort_by_key(|&i| (group_start[i], mapped[i].0));

    let mut pawn_bb = EMPTY_BB;
    let mut placed_bb = k1.bb() | k2;
    let mut pawns_placed = 0u64;
    let mut total_placed = 2u64;

    for &i in order.iter().filter(|&&i| list.piece(i).piece_type() == PAWN) {
        let m = mapped[i];
        debug_assert!(m.rank() >= RANK_2 && m.rank() <= RANK_7);
        let below = pawn_bb & Bitboard(m.bb().0.wrapping_sub(1));
        let slot = (m.0 - 8) as u64 - popcount(below) as u64;
        index += slot * size;
        size *= PAWN_SQUARES - pawns_placed;
        pawn_bb |= m;
        placed_bb |= m;
        pawns_placed += 1;
        total_placed += 1;
    }

    // Remaining pieces: slots over the whole board, skipping every
    // square already holding a piece. The diagonal tie breaking makes
    // the first off-diagonal piece fix the orientation.
    let mut map_type = map_type;
    for &i in order.iter().filter(|&&i| list.piece(i).piece_type() != PAWN) {
        let mut m = map_square(squares[i], map_type);
        if !has_pawn && diag_count as u64 == total_placed {
            if above_diagonal(m) {
                map_type |= MAP_TRIANGLE;
                // Reorient everything placed so far; squares placed up
                // to here all sit on the diagonal, which the swap
                // leaves in place.
                m = map_square(squares[i], map_type);
                placed_bb = remap_bb(placed_bb);
            } else if on_diagonal(m) {
                diag_count += 1;
            }
        }
        let below = placed_bb & Bitboard(m.bb().0.wrapping_sub(1));
        let slot = m.0 as u64 - popcount(below) as u64;
        index += slot * size;
        size *= 64 - total_placed;
        placed_bb |= m;
        total_placed += 1;
    }

    index
}

fn remap_bb(bb: Bitboard) -> Bitboard {
    let mut out = EMPTY_BB;
    for s in bb {
        out |= Square((s.0 >> 3) | ((s.0 & 7) << 3));
    }
    out
}

/// Decoded placement of an index, or `None` when the index falls into
/// a symmetry hole (overlap, mirrored duplicate, pawn off the board).
pub struct DecodedIndex {
    pub squares: Vec<Square>,
    pub white_to_move: bool,
}

pub fn decode(index: u64, list: &PieceList) -> Option<DecodedIndex> {
    let has_pawn = list.has_pawns();
    let mut rest = index;

    let white_to_move = rest % COLORS == 0;
    rest /= COLORS;

    let (king_pairs, pair) = if has_pawn {
        let n = KING_PAIRS_WITH_PAWN as u64;
        let p = KING_MAPS.index_to_pair_pawn[(rest % n) as usize];
        (n, p)
    } else {
        let n = KING_PAIRS_NO_PAWN as u64;
        let p = KING_MAPS.index_to_pair_free[(rest % n) as usize];
        (n, p)
    };
    rest /= king_pairs;

    let k1 = Square(pair as u32 % 64);
    let k2 = Square(pair as u32 / 64);
    let mut squares = vec![k1, k2];
    let mut occupied = k1.bb() | k2;

    // Pawns: walk the 48-square band, skipping earlier pawns.
    let mut pawn_bb = EMPTY_BB;
    for i in 0..list.pawn_count() {
        let slots = PAWN_SQUARES - i as u64;
        let raw = rest % slots;
        rest /= slots;
        let band = real_square(pawn_bb.0 >> 8, raw);
        if band >= PAWN_SQUARES {
            return None; // walked past H7
        }
        let s = Square(band as u32 + 8);
        if occupied & s != 0 {
            return None;
        }
        pawn_bb |= s;
        occupied |= s;
        squares.push(s);
    }

    let mut all_on_diagonal = !has_pawn && on_diagonal(k1) && on_diagonal(k2);

    let non_pawns = list.len() - 2 - list.pawn_count();
    for j in 0..non_pawns {
        let slots = 64 - 2 - list.pawn_count() as u64 - j as u64;
        let raw = rest % slots;
        rest /= slots;
        let s = Square(real_square(occupied.0, raw) as u32);
        debug_assert!(s.is_ok());
        // The mirrored twin of an all-diagonal placement is a hole.
        if all_on_diagonal && above_diagonal(s) {
            return None;
        }
        if !on_diagonal(s) {
            all_on_diagonal = false;
        }
        occupied |= s;
        squares.push(s);
    }

    // Duplicate pieces are canonical in ascending order only.
    for i in 3..list.len() {
        if list.piece(i) == list.piece(i - 1) && squares[i] <= squares[i - 1] {
            return None;
        }
    }

    Some(DecodedIndex {
        squares,
        white_to_move,
    })
}

// Finds the raw-th free square of a band: every occupied square at or
// below the cursor pushes it up by one.
fn real_square(occupied_band: u64, raw: u64) -> u64 {
    let mut real = raw;
    let mut occ = occupied_band;
    while occ != 0 {
        let lowest = occ.trailing_zeros() as u64;
        if lowest <= real {
            real += 1;
            occ &= occ - 1;
        } else {
            break;
        }
    }
    real
}

/// Viewpoint of an index computation: `Flipped` mirrors the board
/// vertically and swaps colors, so the second-listed side's bitbase
/// can be probed with the same tables.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Viewpoint {
    Direct,
    Flipped,
}

/// Index of a position under a signature's piece list. The flipped
/// viewpoint folds the side-to-move bit accordingly.
pub fn compute_index(pos: &Position, list: &PieceList, viewpoint: Viewpoint) -> u64 {
    match viewpoint {
        Viewpoint::Direct => {
            let squares = list.squares_of(pos);
            encode(list, &squares, pos.side_to_move() == WHITE)
        }
        Viewpoint::Flipped => {
            // Collect per mirrored color: the list's "white" is the
            // position's black with the board upside down.
            let mut squares = Vec::with_capacity(list.len());
            let mut cursor = EMPTY_BB;
            let mut prev = NO_PIECE;
            for i in 0..list.len() {
                let pc = list.piece(i);
                if pc != prev {
                    cursor = pos.pieces_cp(!pc.color(), pc.piece_type());
                    prev = pc;
                }
                let s = crate::bitboard::pop_lsb(&mut cursor);
                squares.push(s.flip_rank());
            }
            encode(list, &squares, pos.side_to_move() == BLACK)
        }
    }
}

/// Cheap successor index during retrograde generation: the piece at
/// `from` is relocated to `to`, the side to move flips.
pub fn index_after_move(
    list: &PieceList,
    squares: &[Square],
    white_to_move: bool,
    piece_no: usize,
    to: Square,
) -> u64 {
    let mut moved = squares.to_vec();
    moved[piece_no] = to;
    encode(list, &moved, white_to_move)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(sig: &str) -> PieceList {
        PieceList::from_signature(MaterialSignature::parse(sig).unwrap())
    }

    #[test]
    fn king_pair_counts() {
        assert_eq!(KING_MAPS.index_to_pair_pawn.len(), 1806);
        assert_eq!(KING_MAPS.index_to_pair_free.len(), 462);
    }

    #[test]
    fn kpk_size() {
        let l = list("KPK");
        assert_eq!(l.size_in_bits(), 2 * 1806 * 48);
    }

    #[test]
    fn kqk_size() {
        let l = list("KQK");
        assert_eq!(l.size_in_bits(), 2 * 462 * 62);
    }

    #[test]
    fn decode_then_encode_round_trip_kpk() {
        let l = list("KPK");
        let size = l.size_in_bits();
        let mut legal = 0u64;
        // Sampling the whole range keeps the test fast enough while
        // still crossing every symmetry case.
        for index in (0..size).step_by(7) {
            if let Some(d) = decode(index, &l) {
                legal += 1;
                let back = encode(&l, &d.squares, d.white_to_move);
                assert_eq!(back, index, "squares {:?}", d.squares);
            }
        }
        assert!(legal > 0);
    }

    #[test]
    fn decode_then_encode_round_trip_krk() {
        let l = list("KRK");
        let size = l.size_in_bits();
        for index in (0..size).step_by(5) {
            if let Some(d) = decode(index, &l) {
                let back = encode(&l, &d.squares, d.white_to_move);
                assert_eq!(back, index, "squares {:?}", d.squares);
            }
        }
    }

    #[test]
    fn position_round_trip_with_pawn() {
        let l = list("KPK");
        let pos = Position::from_fen("4k3/8/8/8/8/8/4P3/4K3 w - - 0 1").unwrap();
        let index = compute_index(&pos, &l, Viewpoint::Direct);
        assert!(index < l.size_in_bits());
        let d = decode(index, &l).unwrap();
        assert!(d.white_to_move);
        // The e-file maps onto the d-file under the left-right fold.
        assert_eq!(d.squares[0], Square::D1);
        assert_eq!(d.squares[1], Square::D8);
        assert_eq!(d.squares[2], Square(11)); // d2
    }

    #[test]
    fn flipped_viewpoint_mirrors_colors() {
        let l = list("KPK");
        // Black king e8 vs white king e1 with a *black* pawn on e7:
        // under the flipped viewpoint this is the same placement as a
        // white pawn on e2.
        let black_pawn = Position::from_fen("4k3/4p3/8/8/8/8/8/4K3 b - - 0 1").unwrap();
        let white_pawn = Position::from_fen("4k3/8/8/8/8/8/4P3/4K3 w - - 0 1").unwrap();
        assert_eq!(
            compute_index(&black_pawn, &l, Viewpoint::Flipped),
            compute_index(&white_pawn, &l, Viewpoint::Direct)
        );
    }

    #[test]
    fn mirrored_placements_share_an_index() {
        let l = list("KQK");
        // A position and its horizontal mirror canonicalise equally.
        let a = Position::from_fen("7k/8/8/8/8/8/8/QK6 w - - 0 1").unwrap();
        let b = Position::from_fen("k7/8/8/8/8/8/8/6KQ w - - 0 1").unwrap();
        assert_eq!(
            compute_index(&a, &l, Viewpoint::Direct),
            compute_index(&b, &l, Viewpoint::Direct)
        );
    }

    #[test]
    fn index_after_move_matches_full_encode() {
        let l = list("KQK");
        let pos = Position::from_fen("4k3/8/8/8/8/8/8/2Q1K3 b - - 0 1").unwrap();
        let squares = l.squares_of(&pos);
        // Black king steps e8 -> d7; the successor has white to move.
        let after = index_after_move(&l, &squares, true, 1, Square(51));
        let moved = Position::from_fen("8/3k4/8/8/8/8/8/2Q1K3 w - - 0 1").unwrap();
        assert_eq!(after, compute_index(&moved, &l, Viewpoint::Direct));
    }
}
