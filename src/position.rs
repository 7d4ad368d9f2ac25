// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;

use once_cell::sync::Lazy;
use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use thiserror::Error;

use crate::bitboard::*;
use crate::movegen::{MoveList, Legal};
use crate::signature::MaterialSignature;
use crate::types::*;

pub type CastlingRights = u32;

pub const NO_CASTLING: CastlingRights = 0;
pub const WHITE_OO: CastlingRights = 1;
pub const WHITE_OOO: CastlingRights = 2;
pub const BLACK_OO: CastlingRights = 4;
pub const BLACK_OOO: CastlingRights = 8;
pub const ANY_CASTLING: CastlingRights = 15;

pub mod zobrist {
    use super::*;

    pub struct Keys {
        pub psq: [[Key; 64]; 16],
        pub enpassant: [Key; 8],
        pub castling: [Key; 16],
        pub side: Key,
    }

    // Fixed seed: hash keys must be stable across runs so that stored
    // search artifacts stay comparable.
    static KEYS: Lazy<Box<Keys>> = Lazy::new(|| {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0x1070372);
        let mut k = Box::new(Keys {
            psq: [[Key(0); 64]; 16],
            enpassant: [Key(0); 8],
            castling: [Key(0); 16],
            side: Key(0),
        });
        for pc in 1..15 {
            if pc == 7 || pc == 8 {
                continue;
            }
            for s in 0..64 {
                k.psq[pc][s] = Key(rng.next_u64());
            }
        }
        for f in 0..8 {
            k.enpassant[f] = Key(rng.next_u64());
        }
        for cr in 1..16 {
            k.castling[cr] = Key(rng.next_u64());
        }
        k.side = Key(rng.next_u64());
        k
    });

    pub fn psq(pc: Piece, s: Square) -> Key {
        KEYS.psq[pc.idx()][s.idx()]
    }

    pub fn enpassant(f: File) -> Key {
        KEYS.enpassant[f as usize]
    }

    pub fn castling(cr: CastlingRights) -> Key {
        KEYS.castling[cr as usize]
    }

    pub fn side() -> Key {
        KEYS.side
    }
}

#[derive(Debug, Error)]
pub enum FenError {
    #[error("FEN is missing the {0} field")]
    MissingField(&'static str),
    #[error("bad piece placement character '{0}'")]
    BadPiece(char),
    #[error("piece placement runs off the board")]
    Overflow,
    #[error("bad side to move '{0}'")]
    BadSideToMove(String),
    #[error("bad castling field '{0}'")]
    BadCastling(String),
    #[error("bad en passant field '{0}'")]
    BadEnPassant(String),
    #[error("bad counter '{0}'")]
    BadCounter(String),
    #[error("illegal position: {0}")]
    Illegal(&'static str),
}

/// State restored on `undo_move`, kept as a stack so the in-tree line
/// and the game history share one repetition table.
#[derive(Clone)]
pub struct StateInfo {
    pub castling_rights: CastlingRights,
    pub rule50: i32,
    pub plies_from_null: i32,
    pub ep_square: Square,
    pub key: Key,
    pub checkers_bb: Bitboard,
    pub captured_piece: Piece,
    pub blockers_for_king: [Bitboard; 2],
    pub pinners_for_king: [Bitboard; 2],
    pub check_squares: [Bitboard; 8],
}

impl StateInfo {
    fn new() -> StateInfo {
        StateInfo {
            castling_rights: NO_CASTLING,
            rule50: 0,
            plies_from_null: 0,
            ep_square: Square::NONE,
            key: Key(0),
            checkers_bb: EMPTY_BB,
            captured_piece: NO_PIECE,
            blockers_for_king: [EMPTY_BB; 2],
            pinners_for_king: [EMPTY_BB; 2],
            check_squares: [EMPTY_BB; 8],
        }
    }

    fn copied(&self) -> StateInfo {
        StateInfo {
            castling_rights: self.castling_rights,
            rule50: self.rule50,
            plies_from_null: self.plies_from_null,
            ep_square: self.ep_square,
            ..StateInfo::new()
        }
    }
}

pub const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

pub struct Position {
    board: [Piece; 64],
    by_color_bb: [Bitboard; 2],
    by_type_bb: [Bitboard; 8],
    piece_count: [i32; 16],
    castling_rights_mask: [CastlingRights; 64],
    side_to_move: Color,
    game_ply: i32,
    states: Vec<StateInfo>,
}

const PIECE_TO_CHAR: &str = " PNBRQK  pnbrqk";

impl Position {
    fn empty_board() -> Position {
        Position {
            board: [NO_PIECE; 64],
            by_color_bb: [EMPTY_BB; 2],
            by_type_bb: [EMPTY_BB; 8],
            piece_count: [0; 16],
            castling_rights_mask: [NO_CASTLING; 64],
            side_to_move: WHITE,
            game_ply: 0,
            states: vec![StateInfo::new()],
        }
    }

    pub fn startpos() -> Position {
        Position::from_fen(START_FEN).expect("start position FEN")
    }

    pub fn from_fen(fen: &str) -> Result<Position, FenError> {
        let mut pos = Position::empty_board();
        let mut it = fen.split_whitespace();

        let placement = it.next().ok_or(FenError::MissingField("placement"))?;
        let mut f = 0u32;
        let mut r = 7i32;
        for c in placement.chars() {
            if let Some(d) = c.to_digit(10) {
                f += d;
            } else if c == '/' {
                r -= 1;
                f = 0;
                if r < 0 {
                    return Err(FenError::Overflow);
                }
            } else if let Some(idx) = PIECE_TO_CHAR.find(c) {
                if f > 7 {
                    return Err(FenError::Overflow);
                }
                pos.put_piece(Piece(idx as u32), Square::make(f, r as u32));
                f += 1;
            } else {
                return Err(FenError::BadPiece(c));
            }
        }

        let stm = it.next().ok_or(FenError::MissingField("side to move"))?;
        pos.side_to_move = match stm {
            "w" => WHITE,
            "b" => BLACK,
            _ => return Err(FenError::BadSideToMove(stm.to_string())),
        };

        if pos.piece_count[W_KING.idx()] != 1 || pos.piece_count[B_KING.idx()] != 1 {
            return Err(FenError::Illegal("both sides need exactly one king"));
        }

        let castling = it.next().ok_or(FenError::MissingField("castling"))?;
        if castling != "-" {
            for c in castling.chars() {
                let (color, cr) = match c {
                    'K' => (WHITE, WHITE_OO),
                    'Q' => (WHITE, WHITE_OOO),
                    'k' => (BLACK, BLACK_OO),
                    'q' => (BLACK, BLACK_OOO),
                    _ => return Err(FenError::BadCastling(castling.to_string())),
                };
                let rsq = rook_home(cr);
                if pos.piece_on(rsq) == Piece::make(color, ROOK)
                    && pos.square(color, KING) == Square::E1.relative(color)
                {
                    pos.set_castling_right(color, cr);
                }
            }
        }

        let ep = it.next().ok_or(FenError::MissingField("en passant"))?;
        if ep != "-" {
            let mut chars = ep.chars();
            let fc = chars.next().ok_or_else(|| FenError::BadEnPassant(ep.to_string()))?;
            if !('a'..='h').contains(&fc) {
                return Err(FenError::BadEnPassant(ep.to_string()));
            }
            let file = fc as u32 - 'a' as u32;
            let rank = if pos.side_to_move == WHITE { RANK_6 } else { RANK_3 };
            let ep_sq = Square::make(file, rank);
            // Accept only when a pawn can actually capture there.
            let us = pos.side_to_move;
            if pawn_attacks(!us, ep_sq) & pos.pieces_cp(us, PAWN) != 0
                && pos.pieces_cp(!us, PAWN) & (ep_sq - pawn_push(us)).bb() != EMPTY_BB
            {
                pos.st_mut().ep_square = ep_sq;
            }
        }

        if let Some(halfmove) = it.next() {
            pos.st_mut().rule50 = halfmove
                .parse()
                .map_err(|_| FenError::BadCounter(halfmove.to_string()))?;
        }
        if let Some(fullmove) = it.next() {
            let n: i32 = fullmove
                .parse()
                .map_err(|_| FenError::BadCounter(fullmove.to_string()))?;
            pos.game_ply = (2 * (n - 1)).max(0);
        }
        if pos.side_to_move == BLACK {
            pos.game_ply += 1;
        }

        if pos.attackers_to(pos.square(!pos.side_to_move, KING)) & pos.pieces_c(pos.side_to_move)
            != 0
        {
            return Err(FenError::Illegal("side not to move is in check"));
        }

        pos.refresh_state();
        Ok(pos)
    }

    /// Builds a bare position (no castling, no en passant) from piece
    /// placements, as the bitbase generator does. Returns `None` when
    /// two pieces share a square, a pawn stands on a promotion rank or
    /// the side not to move is in check.
    pub fn from_pieces(pieces: &[(Piece, Square)], stm: Color) -> Option<Position> {
        let mut pos = Position::empty_board();
        for &(pc, s) in pieces {
            if !s.is_ok() || pos.board[s.idx()] != NO_PIECE {
                return None;
            }
            if pc.piece_type() == PAWN && (s.rank() == RANK_1 || s.rank() == RANK_8) {
                return None;
            }
            pos.put_piece(pc, s);
        }
        pos.side_to_move = stm;
        if pos.piece_count[W_KING.idx()] != 1 || pos.piece_count[B_KING.idx()] != 1 {
            return None;
        }
        if distance(pos.square(WHITE, KING), pos.square(BLACK, KING)) <= 1 {
            return None;
        }
        if pos.attackers_to(pos.square(!stm, KING)) & pos.pieces_c(stm) != 0 {
            return None;
        }
        pos.refresh_state();
        Some(pos)
    }

    fn st(&self) -> &StateInfo {
        self.states.last().unwrap()
    }

    fn st_mut(&mut self) -> &mut StateInfo {
        self.states.last_mut().unwrap()
    }

    pub fn side_to_move(&self) -> Color {
        self.side_to_move
    }

    pub fn empty(&self, s: Square) -> bool {
        self.board[s.idx()] == NO_PIECE
    }

    pub fn piece_on(&self, s: Square) -> Piece {
        self.board[s.idx()]
    }

    pub fn moved_piece(&self, m: Move) -> Piece {
        self.board[m.from().idx()]
    }

    pub fn pieces(&self) -> Bitboard {
        self.by_type_bb[ALL_PIECES.idx()]
    }

    pub fn pieces_p(&self, pt: PieceType) -> Bitboard {
        self.by_type_bb[pt.idx()]
    }

    pub fn pieces_pp(&self, pt1: PieceType, pt2: PieceType) -> Bitboard {
        self.pieces_p(pt1) | self.pieces_p(pt2)
    }

    pub fn pieces_c(&self, c: Color) -> Bitboard {
        self.by_color_bb[c.idx()]
    }

    pub fn pieces_cp(&self, c: Color, pt: PieceType) -> Bitboard {
        self.pieces_c(c) & self.pieces_p(pt)
    }

    pub fn pieces_cpp(&self, c: Color, pt1: PieceType, pt2: PieceType) -> Bitboard {
        self.pieces_c(c) & self.pieces_pp(pt1, pt2)
    }

    pub fn count(&self, c: Color, pt: PieceType) -> i32 {
        self.piece_count[Piece::make(c, pt).idx()]
    }

    pub fn square(&self, c: Color, pt: PieceType) -> Square {
        debug_assert!(self.pieces_cp(c, pt) != 0);
        lsb(self.pieces_cp(c, pt))
    }

    pub fn ep_square(&self) -> Square {
        self.st().ep_square
    }

    pub fn has_castling_right(&self, cr: CastlingRights) -> bool {
        self.st().castling_rights & cr != 0
    }

    pub fn can_castle(&self, c: Color) -> bool {
        self.st().castling_rights & (3 << (2 * c.0)) != 0
    }

    pub fn castling_impeded(&self, cr: CastlingRights) -> bool {
        self.pieces() & castling_path(cr) != EMPTY_BB
    }

    pub fn checkers(&self) -> Bitboard {
        self.st().checkers_bb
    }

    pub fn in_check(&self) -> bool {
        self.st().checkers_bb != EMPTY_BB
    }

    pub fn blockers_for_king(&self, c: Color) -> Bitboard {
        self.st().blockers_for_king[c.idx()]
    }

    pub fn pinned_pieces(&self, c: Color) -> Bitboard {
        self.blockers_for_king(c) & self.pieces_c(c)
    }

    pub fn discovered_check_candidates(&self) -> Bitboard {
        self.blockers_for_king(!self.side_to_move) & self.pieces_c(self.side_to_move)
    }

    pub fn check_squares(&self, pt: PieceType) -> Bitboard {
        self.st().check_squares[pt.idx()]
    }

    pub fn key(&self) -> Key {
        self.st().key
    }

    pub fn game_ply(&self) -> i32 {
        self.game_ply
    }

    pub fn rule50_count(&self) -> i32 {
        self.st().rule50
    }

    pub fn captured_piece(&self) -> Piece {
        self.st().captured_piece
    }

    pub fn material_signature(&self) -> MaterialSignature {
        let mut sig = MaterialSignature::empty();
        for c in [WHITE, BLACK] {
            for pt in [PAWN, KNIGHT, BISHOP, ROOK, QUEEN] {
                for _ in 0..self.count(c, pt).min(7) {
                    sig = sig.with_piece(c, pt);
                }
            }
        }
        sig
    }

    pub fn has_enough_material_to_mate(&self, c: Color) -> bool {
        self.material_signature().has_enough_material_to_mate(c)
    }

    /// Neither side retains mating material.
    pub fn is_material_draw(&self) -> bool {
        let sig = self.material_signature();
        !sig.has_enough_material_to_mate(WHITE) && !sig.has_enough_material_to_mate(BLACK)
    }

    pub fn non_pawn_material(&self, c: Color) -> Value {
        let mut v = Value::ZERO;
        for pt in [KNIGHT, BISHOP, ROOK, QUEEN] {
            v += self.count(c, pt) * piece_value(Piece::make(WHITE, pt));
        }
        v
    }

    pub fn attacks_from(&self, pt: PieceType, s: Square) -> Bitboard {
        debug_assert!(pt != PAWN);
        attacks_bb(pt, s, self.pieces())
    }

    pub fn attackers_to_occ(&self, s: Square, occ: Bitboard) -> Bitboard {
        (pawn_attacks(BLACK, s) & self.pieces_cp(WHITE, PAWN))
            | (pawn_attacks(WHITE, s) & self.pieces_cp(BLACK, PAWN))
            | (pseudo_attacks(KNIGHT, s) & self.pieces_p(KNIGHT))
            | (attacks_bb(ROOK, s, occ) & self.pieces_pp(ROOK, QUEEN))
            | (attacks_bb(BISHOP, s, occ) & self.pieces_pp(BISHOP, QUEEN))
            | (pseudo_attacks(KING, s) & self.pieces_p(KING))
    }

    pub fn attackers_to(&self, s: Square) -> Bitboard {
        self.attackers_to_occ(s, self.pieces())
    }

    pub fn capture(&self, m: Move) -> bool {
        debug_assert!(m.is_ok());
        (!self.empty(m.to()) && m.kind() != CASTLING) || m.kind() == ENPASSANT
    }

    pub fn capture_or_promotion(&self, m: Move) -> bool {
        debug_assert!(m.is_ok());
        if m.kind() != NORMAL {
            m.kind() != CASTLING
        } else {
            !self.empty(m.to())
        }
    }

    fn set_castling_right(&mut self, c: Color, cr: CastlingRights) {
        self.st_mut().castling_rights |= cr;
        let kfrom = self.square(c, KING);
        self.castling_rights_mask[kfrom.idx()] |= cr;
        self.castling_rights_mask[rook_home(cr).idx()] |= cr;
    }

    fn set_check_info(&mut self) {
        let mut w_pinners = EMPTY_BB;
        let mut b_pinners = EMPTY_BB;
        let wk = self.square(WHITE, KING);
        let bk = self.square(BLACK, KING);
        let w_blockers = self.slider_blockers(self.pieces_c(BLACK), wk, &mut w_pinners);
        let b_blockers = self.slider_blockers(self.pieces_c(WHITE), bk, &mut b_pinners);

        let st = self.st_mut();
        st.blockers_for_king[WHITE.idx()] = w_blockers;
        st.pinners_for_king[WHITE.idx()] = w_pinners;
        st.blockers_for_king[BLACK.idx()] = b_blockers;
        st.pinners_for_king[BLACK.idx()] = b_pinners;

        let them = !self.side_to_move;
        let ksq = self.square(them, KING);
        let occ = self.pieces();
        let st = self.st_mut();
        st.check_squares[PAWN.idx()] = pawn_attacks(them, ksq);
        st.check_squares[KNIGHT.idx()] = pseudo_attacks(KNIGHT, ksq);
        st.check_squares[BISHOP.idx()] = attacks_bb(BISHOP, ksq, occ);
        st.check_squares[ROOK.idx()] = attacks_bb(ROOK, ksq, occ);
        st.check_squares[QUEEN.idx()] =
            st.check_squares[BISHOP.idx()] | st.check_squares[ROOK.idx()];
        st.check_squares[KING.idx()] = EMPTY_BB;
    }

    /// Recomputes the hash key, checkers and check info from scratch.
    fn refresh_state(&mut self) {
        let mut key = Key(0);
        for s in self.pieces() {
            key ^= zobrist::psq(self.piece_on(s), s);
        }
        if self.st().ep_square != Square::NONE {
            key ^= zobrist::enpassant(self.st().ep_square.file());
        }
        if self.side_to_move == BLACK {
            key ^= zobrist::side();
        }
        key ^= zobrist::castling(self.st().castling_rights);
        self.st_mut().key = key;

        let checkers = self.attackers_to(self.square(self.side_to_move, KING))
            & self.pieces_c(!self.side_to_move);
        self.st_mut().checkers_bb = checkers;
        self.set_check_info();
    }

    pub fn slider_blockers(&self, sliders: Bitboard, s: Square, pinners: &mut Bitboard) -> Bitboard {
        let mut result = EMPTY_BB;
        *pinners = EMPTY_BB;

        let snipers = ((pseudo_attacks(ROOK, s) & self.pieces_pp(QUEEN, ROOK))
            | (pseudo_attacks(BISHOP, s) & self.pieces_pp(QUEEN, BISHOP)))
            & sliders;

        for sniper_sq in snipers {
            let b = between_bb(s, sniper_sq) & self.pieces();
            if b != 0 && !more_than_one(b) {
                result |= b;
                if b & self.pieces_c(self.piece_on(s).color()) != 0 {
                    *pinners |= sniper_sq;
                }
            }
        }
        result
    }

    pub fn legal(&self, m: Move) -> bool {
        debug_assert!(m.is_ok());

        let us = self.side_to_move;
        let from = m.from();
        let to = m.to();

        if m.kind() == ENPASSANT {
            let ksq = self.square(us, KING);
            let capsq = to - pawn_push(us);
            let occupied = (self.pieces() ^ from ^ capsq) | to;

            return attacks_bb(ROOK, ksq, occupied) & self.pieces_cpp(!us, QUEEN, ROOK) == 0
                && attacks_bb(BISHOP, ksq, occupied) & self.pieces_cpp(!us, QUEEN, BISHOP) == 0;
        }

        if self.piece_on(from).piece_type() == KING {
            // Castling legality (squares crossed not attacked) is
            // checked during generation.
            return m.kind() == CASTLING
                || self.attackers_to_occ(to, self.pieces() ^ from) & self.pieces_c(!us) == 0;
        }

        self.pinned_pieces(us) & from == 0 || aligned(from, to, self.square(us, KING))
    }

    /// Validates a move from the transposition table or the killer slots
    /// against the current position.
    pub fn pseudo_legal(&self, m: Move) -> bool {
        let us = self.side_to_move;
        let from = m.from();
        let to = m.to();
        let pc = self.moved_piece(m);

        if m.kind() != NORMAL {
            return MoveList::new(self, Legal).contains(m);
        }

        if m.promotion_type() != KNIGHT {
            return false;
        }

        if pc == NO_PIECE || pc.color() != us {
            return false;
        }

        if self.pieces_c(us) & to != 0 {
            return false;
        }

        if pc.piece_type() == PAWN {
            if to.rank() == relative_rank(us, RANK_8) {
                return false;
            }
            if pawn_attacks(us, from) & self.pieces_c(!us) & to == 0
                && !(from + pawn_push(us) == to && self.empty(to))
                && !(from + 2 * pawn_push(us) == to
                    && from.rank() == relative_rank(us, RANK_2)
                    && self.empty(to)
                    && self.empty(to - pawn_push(us)))
            {
                return false;
            }
        } else if self.attacks_from(pc.piece_type(), from) & to == 0 {
            return false;
        }

        if self.in_check() {
            if pc.piece_type() != KING {
                if more_than_one(self.checkers()) {
                    return false;
                }
                if (between_bb(lsb(self.checkers()), self.square(us, KING)) | self.checkers())
                    & to
                    == 0
                {
                    return false;
                }
            } else if self.attackers_to_occ(to, self.pieces() ^ from) & self.pieces_c(!us) != 0 {
                return false;
            }
        }

        true
    }

    pub fn gives_check(&self, m: Move) -> bool {
        debug_assert!(m.is_ok());
        let us = self.side_to_move;
        let from = m.from();
        let to = m.to();
        let ksq = self.square(!us, KING);

        if self.check_squares(self.piece_on(from).piece_type()) & to != 0 {
            return true;
        }

        if self.discovered_check_candidates() & from != 0 && !aligned(from, to, ksq) {
            return true;
        }

        match m.kind() {
            NORMAL => false,
            PROMOTION => attacks_bb(m.promotion_type(), to, self.pieces() ^ from) & ksq != 0,
            ENPASSANT => {
                let capsq = Square::make(to.file(), from.rank());
                let b = (self.pieces() ^ from ^ capsq) | to;
                (attacks_bb(ROOK, ksq, b) & self.pieces_cpp(us, QUEEN, ROOK))
                    | (attacks_bb(BISHOP, ksq, b) & self.pieces_cpp(us, QUEEN, BISHOP))
                    != 0
            }
            _ => {
                // Castling: only the rook can give the check.
                let (rfrom, rto) = rook_castle_squares(us, to);
                let occ = (self.pieces() ^ from ^ rfrom) | rto | to;
                attacks_bb(ROOK, rto, occ) & ksq != 0
            }
        }
    }

    pub fn do_move(&mut self, m: Move, gives_check: bool) {
        debug_assert!(m.is_ok());

        let mut k = self.st().key ^ zobrist::side();
        let copy = self.st().copied();
        self.states.push(copy);
        self.game_ply += 1;
        self.st_mut().rule50 += 1;
        self.st_mut().plies_from_null += 1;

        let us = self.side_to_move;
        let them = !us;
        let from = m.from();
        let to = m.to();
        let pc = self.piece_on(from);
        let mut captured = if m.kind() == ENPASSANT {
            Piece::make(them, PAWN)
        } else {
            self.piece_on(to)
        };

        debug_assert!(pc.color() == us);
        debug_assert!(captured.piece_type() != KING);

        if m.kind() == CASTLING {
            // The move carries the king; the rook is relocated here. The
            // king destination square is always empty in standard chess.
            let (rfrom, rto) = rook_castle_squares(us, to);
            let rook = Piece::make(us, ROOK);
            self.remove_piece(rook, rfrom);
            self.put_piece(rook, rto);
            k ^= zobrist::psq(rook, rfrom) ^ zobrist::psq(rook, rto);
            captured = NO_PIECE;
        }

        if captured != NO_PIECE {
            let mut capsq = to;
            if m.kind() == ENPASSANT {
                capsq = to - pawn_push(us);
                debug_assert!(self.piece_on(capsq) == Piece::make(them, PAWN));
            }
            self.remove_piece(captured, capsq);
            k ^= zobrist::psq(captured, capsq);
            self.st_mut().rule50 = 0;
        }

        k ^= zobrist::psq(pc, from) ^ zobrist::psq(pc, to);

        if self.st().ep_square != Square::NONE {
            k ^= zobrist::enpassant(self.st().ep_square.file());
            self.st_mut().ep_square = Square::NONE;
        }

        if self.st().castling_rights != 0 {
            let cr = self.castling_rights_mask[from.idx()] | self.castling_rights_mask[to.idx()];
            if cr != 0 {
                let old = self.st().castling_rights;
                let new = old & !cr;
                if new != old {
                    k ^= zobrist::castling(old) ^ zobrist::castling(new);
                    self.st_mut().castling_rights = new;
                }
            }
        }

        self.move_piece(pc, from, to);

        if pc.piece_type() == PAWN {
            if to.0 ^ from.0 == 16
                && pawn_attacks(us, to - pawn_push(us)) & self.pieces_cp(them, PAWN) != 0
            {
                let ep = to - pawn_push(us);
                self.st_mut().ep_square = ep;
                k ^= zobrist::enpassant(ep.file());
            } else if m.kind() == PROMOTION {
                let promotion = Piece::make(us, m.promotion_type());
                self.remove_piece(pc, to);
                self.put_piece(promotion, to);
                k ^= zobrist::psq(pc, to) ^ zobrist::psq(promotion, to);
            }
            self.st_mut().rule50 = 0;
        }

        self.st_mut().captured_piece = captured;
        self.st_mut().key = k;

        self.st_mut().checkers_bb = if gives_check {
            self.attackers_to(self.square(them, KING)) & self.pieces_c(us)
        } else {
            EMPTY_BB
        };

        self.side_to_move = them;
        self.set_check_info();

        debug_assert!(self.is_consistent());
    }

    pub fn undo_move(&mut self, m: Move) {
        debug_assert!(m.is_ok());

        self.side_to_move = !self.side_to_move;
        let us = self.side_to_move;
        let from = m.from();
        let to = m.to();
        let mut pc = self.piece_on(to);

        if m.kind() == PROMOTION {
            self.remove_piece(pc, to);
            pc = Piece::make(us, PAWN);
            self.put_piece(pc, to);
        }

        self.move_piece(pc, to, from);

        if m.kind() == CASTLING {
            let (rfrom, rto) = rook_castle_squares(us, to);
            let rook = Piece::make(us, ROOK);
            self.remove_piece(rook, rto);
            self.put_piece(rook, rfrom);
        } else {
            let captured = self.st().captured_piece;
            if captured != NO_PIECE {
                let capsq = if m.kind() == ENPASSANT {
                    to - pawn_push(us)
                } else {
                    to
                };
                self.put_piece(captured, capsq);
            }
        }

        self.states.pop();
        self.game_ply -= 1;

        debug_assert!(self.is_consistent());
    }

    /// Draw by 50-move rule or repetition. The state stack holds both
    /// the game history handed in by the driver and the current search
    /// line, so in-tree repetitions against game positions count.
    pub fn is_draw(&self, ply: i32) -> bool {
        if self.st().rule50 > 99
            && (!self.in_check() || MoveList::new(self, Legal).len() != 0)
        {
            return true;
        }

        let end = self.st().rule50.min(self.st().plies_from_null);
        if end < 4 {
            return false;
        }

        let mut k = self.states.len() - 3;
        let mut cnt = 0;
        let mut i = 4;
        while i <= end {
            k -= 2;
            // One repetition strictly inside the search tree suffices;
            // repetitions at or before the root need a second hit.
            if self.states[k].key == self.st().key {
                cnt += 1;
                if cnt + ((ply > i) as i32) == 2 {
                    return true;
                }
            }
            i += 2;
        }
        false
    }

    fn put_piece(&mut self, pc: Piece, s: Square) {
        self.board[s.idx()] = pc;
        self.by_type_bb[ALL_PIECES.idx()] |= s;
        self.by_type_bb[pc.piece_type().idx()] |= s;
        self.by_color_bb[pc.color().idx()] |= s;
        self.piece_count[pc.idx()] += 1;
    }

    fn remove_piece(&mut self, pc: Piece, s: Square) {
        debug_assert!(self.board[s.idx()] == pc);
        self.board[s.idx()] = NO_PIECE;
        self.by_type_bb[ALL_PIECES.idx()] ^= s;
        self.by_type_bb[pc.piece_type().idx()] ^= s;
        self.by_color_bb[pc.color().idx()] ^= s;
        self.piece_count[pc.idx()] -= 1;
    }

    fn move_piece(&mut self, pc: Piece, from: Square, to: Square) {
        let from_to = from.bb() ^ to.bb();
        self.by_type_bb[ALL_PIECES.idx()] ^= from_to;
        self.by_type_bb[pc.piece_type().idx()] ^= from_to;
        self.by_color_bb[pc.color().idx()] ^= from_to;
        self.board[from.idx()] = NO_PIECE;
        self.board[to.idx()] = pc;
    }

    /// Static exchange evaluation: is the exchange on `m` at least
    /// `threshold`? Null-window swap algorithm.
    pub fn see_ge(&self, m: Move, threshold: Value) -> bool {
        debug_assert!(m.is_ok());

        if m.kind() != NORMAL {
            return Value::ZERO >= threshold;
        }

        let from = m.from();
        let to = m.to();

        let mut swap = piece_value(self.piece_on(to)) - threshold;
        if swap < Value::ZERO {
            return false;
        }

        swap = piece_value(self.piece_on(from)) - swap;
        if swap <= Value::ZERO {
            return true;
        }

        let mut occ = self.pieces() ^ from ^ to;
        let mut stm = self.piece_on(from).color();
        let mut attackers = self.attackers_to_occ(to, occ);
        let mut res = 1;

        loop {
            stm = !stm;
            attackers &= occ;
            let stm_attackers = attackers & self.pieces_c(stm);
            if stm_attackers == 0 {
                break;
            }
            res ^= 1;

            let mut next_attacker = NO_PIECE_TYPE;
            for pt in [PAWN, KNIGHT, BISHOP, ROOK, QUEEN] {
                if stm_attackers & self.pieces_p(pt) != 0 {
                    next_attacker = pt;
                    break;
                }
            }

            if next_attacker == NO_PIECE_TYPE {
                // Only the king is left. The capture is possible only if
                // the opponent has no further attackers.
                return if attackers & !self.pieces_c(stm) != 0 {
                    res == 0
                } else {
                    res != 0
                };
            }

            swap = piece_value(Piece::make(WHITE, next_attacker)) - swap;
            if swap < Value(res) {
                break;
            }

            let bb = stm_attackers & self.pieces_p(next_attacker);
            occ = Bitboard(occ.0 ^ (bb.0 & bb.0.wrapping_neg()));
            match next_attacker {
                PAWN | BISHOP => {
                    attackers |= attacks_bb(BISHOP, to, occ) & self.pieces_pp(BISHOP, QUEEN);
                }
                ROOK => {
                    attackers |= attacks_bb(ROOK, to, occ) & self.pieces_pp(ROOK, QUEEN);
                }
                QUEEN => {
                    attackers |= (attacks_bb(BISHOP, to, occ) & self.pieces_pp(BISHOP, QUEEN))
                        | (attacks_bb(ROOK, to, occ) & self.pieces_pp(ROOK, QUEEN));
                }
                _ => {}
            }
        }
        res != 0
    }

    pub fn fen(&self) -> String {
        let mut ss = String::new();
        for r in (0..8).rev() {
            let mut f = 0;
            while f < 8 {
                let mut empty_cnt = 0u8;
                while f < 8 && self.empty(Square::make(f, r)) {
                    empty_cnt += 1;
                    f += 1;
                }
                if empty_cnt > 0 {
                    ss.push((b'0' + empty_cnt) as char);
                }
                if f < 8 {
                    ss.push(
                        PIECE_TO_CHAR
                            .chars()
                            .nth(self.piece_on(Square::make(f, r)).idx())
                            .unwrap(),
                    );
                    f += 1;
                }
            }
            if r > 0 {
                ss.push('/');
            }
        }

        ss.push_str(if self.side_to_move == WHITE { " w " } else { " b " });

        if self.st().castling_rights == 0 {
            ss.push('-');
        } else {
            for (cr, c) in [(WHITE_OO, 'K'), (WHITE_OOO, 'Q'), (BLACK_OO, 'k'), (BLACK_OOO, 'q')] {
                if self.has_castling_right(cr) {
                    ss.push(c);
                }
            }
        }

        if self.ep_square() == Square::NONE {
            ss.push_str(" - ");
        } else {
            ss.push(' ');
            ss.push_str(&self.ep_square().to_string());
            ss.push(' ');
        }

        ss.push_str(&self.rule50_count().to_string());
        ss.push(' ');
        ss.push_str(&(1 + self.game_ply / 2).to_string());
        ss
    }

    fn is_consistent(&self) -> bool {
        if self.piece_count[W_KING.idx()] != 1 || self.piece_count[B_KING.idx()] != 1 {
            return false;
        }
        if self.attackers_to(self.square(!self.side_to_move, KING))
            & self.pieces_c(self.side_to_move)
            != 0
        {
            return false;
        }
        popcount(self.pieces()) as i32 == self.piece_count[1..15].iter().sum::<i32>()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "+---+---+---+---+---+---+---+---+")?;
        for r in (0..8).rev() {
            for file in 0..8 {
                let pc = self.piece_on(Square::make(file, r));
                write!(f, "| {} ", PIECE_TO_CHAR.chars().nth(pc.idx()).unwrap())?;
            }
            writeln!(f, "|")?;
            writeln!(f, "+---+---+---+---+---+---+---+---+")?;
        }
        writeln!(f, "Fen: {}", self.fen())?;
        write!(f, "Key: {}", self.key())
    }
}

fn rook_home(cr: CastlingRights) -> Square {
    match cr {
        WHITE_OO => Square::H1,
        WHITE_OOO => Square::A1,
        BLACK_OO => Square::H8,
        _ => Square::A8,
    }
}

/// From and to squares of the rook for a castling move given the king
/// destination.
fn rook_castle_squares(us: Color, kto: Square) -> (Square, Square) {
    if kto.file() == FILE_G {
        (Square::H1.relative(us), Square::F1.relative(us))
    } else {
        (Square::A1.relative(us), Square::D1.relative(us))
    }
}

pub fn castling_path(cr: CastlingRights) -> Bitboard {
    match cr {
        WHITE_OO => Square::F1.bb() | Square::G1,
        WHITE_OOO => Square::B1.bb() | Square::C1 | Square::D1,
        BLACK_OO => Square::F8.bb() | Square::G8,
        _ => Square(57).bb() | Square::C8 | Square::D8,
    }
}

/// Looks a move up by its long algebraic name, for tests.
#[cfg(test)]
pub fn find_move(pos: &Position, lan: &str) -> Move {
    for m in MoveList::new(pos, Legal) {
        if m.to_string() == lan {
            return m;
        }
    }
    panic!("move {} not found in {}", lan, pos.fen());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fen_round_trip() {
        for fen in [
            START_FEN,
            "4k3/8/8/8/8/8/4P3/4K3 w - - 0 1",
            "7k/5Q2/5K2/8/8/8/8/8 w - - 0 1",
            "r3k2r/8/8/8/8/8/8/R3K2R w KQkq - 4 20",
        ] {
            let pos = Position::from_fen(fen).unwrap();
            assert_eq!(pos.fen(), fen);
        }
    }

    #[test]
    fn rejects_bad_fens() {
        assert!(Position::from_fen("8/8/8/8/8/8/8/8 w - - 0 1").is_err());
        assert!(Position::from_fen("4k3/8/8/8/8/8/4P3/4K3 x - - 0 1").is_err());
        // White king attacked with black to move would mean white just
        // captured the king.
        assert!(Position::from_fen("4k3/8/8/8/8/8/4r3/4K3 b - - 0 1").is_err());
    }

    #[test]
    fn make_unmake_restores_position() {
        let mut pos = Position::startpos();
        let key = pos.key();
        let fen = pos.fen();
        let moves: Vec<Move> = MoveList::new(&pos, Legal).collect();
        assert_eq!(moves.len(), 20);
        for m in moves {
            let gives_check = pos.gives_check(m);
            pos.do_move(m, gives_check);
            pos.undo_move(m);
            assert_eq!(pos.key(), key);
            assert_eq!(pos.fen(), fen);
        }
    }

    #[test]
    fn incremental_key_matches_refresh() {
        let mut pos = Position::startpos();
        for lan in ["e2e4", "c7c5", "g1f3", "d7d6", "f1b5", "c8d7", "e1g1"] {
            let m = find_move(&pos, lan);
            let gives_check = pos.gives_check(m);
            pos.do_move(m, gives_check);
            let incremental = pos.key();
            pos.refresh_state();
            assert_eq!(pos.key(), incremental, "after {}", lan);
        }
    }

    #[test]
    fn en_passant_round_trip() {
        let mut pos =
            Position::from_fen("rnbqkbnr/ppp1pppp/8/8/3pP3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 3")
                .unwrap();
        let before = pos.fen();
        let m = find_move(&pos, "d4e3");
        assert_eq!(m.kind(), ENPASSANT);
        let gives_check = pos.gives_check(m);
        pos.do_move(m, gives_check);
        pos.undo_move(m);
        assert_eq!(pos.fen(), before);
    }

    #[test]
    fn fifty_move_draw() {
        let pos = Position::from_fen("8/8/8/4k3/8/4K3/8/7R w - - 100 80").unwrap();
        assert!(pos.is_draw(2));
        let pos = Position::from_fen("8/8/8/4k3/8/4K3/8/7R w - - 99 80").unwrap();
        assert!(!pos.is_draw(2));
    }

    #[test]
    fn see_signs() {
        let pos =
            Position::from_fen("1k1r4/1pp4p/p7/4p3/8/P5P1/1PP4P/2K1R3 w - - 0 1").unwrap();
        let m = find_move(&pos, "e1e5");
        assert!(pos.see_ge(m, Value::ZERO));

        let pos =
            Position::from_fen("1k1r3q/1ppn3p/p4b2/4p3/8/P2N2P1/1PP1R1BP/2K1Q3 w - - 0 1")
                .unwrap();
        let m = find_move(&pos, "d3e5");
        assert!(!pos.see_ge(m, Value::ZERO));
    }

}
