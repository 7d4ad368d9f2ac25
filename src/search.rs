// SPDX-License-Identifier: GPL-3.0-or-later

//! Iterative-deepening alpha-beta search with quiescence, transposition
//! table, staged move ordering and aspiration windows. Single threaded;
//! a driver thread may raise the abort flag at any time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;

use crate::bitbase::{BitbaseRegistry, BitbaseValue};
use crate::eval::evaluate;
use crate::movegen::{Legal, MoveList};
use crate::movepick::{history_bonus, HistoryTable, MovePicker};
use crate::position::Position;
use crate::timeman::TimeManager;
use crate::tt::{Probe, TranspositionTable};
use crate::types::*;

/// Search limits handed over by the driver.
#[derive(Clone, Debug)]
pub struct Limits {
    pub depth: Depth,
    pub movetime: i64,
    pub nodes: u64,
    pub mate: i32,
    pub infinite: bool,
    pub time: [i64; 2],
    pub inc: [i64; 2],
    pub movestogo: i32,
    pub multi_pv: usize,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            depth: 0,
            movetime: 0,
            nodes: 0,
            mate: 0,
            infinite: false,
            time: [0; 2],
            inc: [0; 2],
            movestogo: 0,
            multi_pv: 1,
        }
    }
}

impl Limits {
    pub fn use_time_management(&self) -> bool {
        self.depth == 0
            && self.movetime == 0
            && self.nodes == 0
            && self.mate == 0
            && !self.infinite
            && (self.time[0] != 0 || self.time[1] != 0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Score {
    Cp(i32),
    Mate(i32),
}

impl Score {
    pub fn from_value(v: Value) -> Score {
        if v >= Value::MATE_IN_MAX_PLY {
            Score::Mate((Value::MATE - v + 1).0 / 2)
        } else if v <= Value::MATED_IN_MAX_PLY {
            Score::Mate(-(Value::MATE + v).0 / 2)
        } else {
            Score::Cp(v.0)
        }
    }
}

/// Published after every completed iteration and on every new PV line.
#[derive(Clone, Debug)]
pub struct SearchInfo {
    pub depth: Depth,
    pub seldepth: i32,
    pub multipv: usize,
    pub score: Score,
    pub nodes: u64,
    pub time_ms: i64,
    pub pv: Vec<Move>,
}

pub trait InfoSink {
    fn on_info(&mut self, info: &SearchInfo);
}

/// Sink for tests and silent searches.
pub struct NullSink;

impl InfoSink for NullSink {
    fn on_info(&mut self, _info: &SearchInfo) {}
}

#[derive(Clone, Debug)]
pub struct SearchResult {
    pub best_move: Move,
    pub ponder_move: Move,
    pub value: Value,
    pub depth: Depth,
    pub nodes: u64,
    pub pv: Vec<Move>,
}

#[derive(Clone)]
struct RootMove {
    mv: Move,
    score: Value,
    previous_score: Value,
    pv: Vec<Move>,
}

impl RootMove {
    fn new(mv: Move) -> RootMove {
        RootMove {
            mv,
            score: -Value::INFINITE,
            previous_score: -Value::INFINITE,
            pv: vec![mv],
        }
    }
}

/// Aspiration state: a window around the previous score that widens
/// asymmetrically, doubling delta on each fail, fully open after three
/// widenings.
pub struct AspirationWindow {
    pub alpha: Value,
    pub beta: Value,
    delta: Value,
    widenings: u32,
}

pub const ASPIRATION_MIN_DEPTH: Depth = 5;
const ASPIRATION_DELTA: Value = Value(16);
const ASPIRATION_MAX_WIDENINGS: u32 = 3;

impl AspirationWindow {
    pub fn new(previous: Value, depth: Depth) -> AspirationWindow {
        if depth >= ASPIRATION_MIN_DEPTH && previous.abs() < Value::KNOWN_WIN {
            AspirationWindow {
                alpha: (previous - ASPIRATION_DELTA).max(-Value::MATE),
                beta: (previous + ASPIRATION_DELTA).min(Value::MATE),
                delta: ASPIRATION_DELTA,
                widenings: 0,
            }
        } else {
            AspirationWindow::full()
        }
    }

    pub fn full() -> AspirationWindow {
        AspirationWindow {
            alpha: -Value::MATE,
            beta: Value::MATE,
            delta: ASPIRATION_DELTA,
            widenings: ASPIRATION_MAX_WIDENINGS,
        }
    }

    pub fn failed(&self, v: Value) -> bool {
        v <= self.alpha || v >= self.beta
    }

    /// Rewiden after a fail. Only the failing bound moves.
    pub fn widen(&mut self, v: Value) {
        self.widenings += 1;
        if self.widenings >= ASPIRATION_MAX_WIDENINGS {
            self.alpha = -Value::MATE;
            self.beta = Value::MATE;
            return;
        }
        self.delta = self.delta * 2;
        if v <= self.alpha {
            self.alpha = (v - self.delta).max(-Value::MATE);
        } else {
            self.beta = (v + self.delta).min(Value::MATE);
        }
    }
}

struct StackEntry {
    killers: [Move; 2],
    current_move: Move,
    excluded: Move,
    static_eval: Value,
    move_count: i32,
    pv: Vec<Move>,
}

impl StackEntry {
    fn new() -> StackEntry {
        StackEntry {
            killers: [Move::NONE; 2],
            current_move: Move::NONE,
            excluded: Move::NONE,
            static_eval: Value::NONE,
            move_count: 0,
            pv: Vec::new(),
        }
    }
}

// Late move reductions, indexed by depth and move number.
static REDUCTIONS: Lazy<Box<[[i32; 64]; 64]>> = Lazy::new(|| {
    let mut r = Box::new([[0; 64]; 64]);
    for d in 1..64 {
        for mc in 1..64 {
            let v = (d as f64).ln() * (mc as f64).ln() / 1.95;
            r[d][mc] = v.round() as i32;
        }
    }
    r
});

fn reduction(depth: Depth, move_count: i32) -> Depth {
    REDUCTIONS[depth.clamp(0, 63) as usize][move_count.clamp(0, 63) as usize]
}

fn futility_margin(depth: Depth) -> Value {
    Value(150 * depth)
}

fn late_move_threshold(depth: Depth) -> i32 {
    3 + depth * depth
}

const POLL_INTERVAL: i32 = 4096;

pub struct Searcher<'a> {
    tt: &'a mut TranspositionTable,
    bitbases: &'a BitbaseRegistry,
    limits: Limits,
    abort: Arc<AtomicBool>,
    timeman: TimeManager,
    history: HistoryTable,
    stack: Vec<StackEntry>,
    root_moves: Vec<RootMove>,
    nodes: u64,
    seldepth: i32,
    poll_countdown: i32,
    stopped: bool,
    previous_score: Value,
}

impl<'a> Searcher<'a> {
    pub fn new(
        tt: &'a mut TranspositionTable,
        bitbases: &'a BitbaseRegistry,
        limits: Limits,
        abort: Arc<AtomicBool>,
        us: Color,
    ) -> Searcher<'a> {
        let timeman = TimeManager::new(&limits, us);
        let mut stack = Vec::with_capacity((MAX_PLY + 4) as usize);
        for _ in 0..MAX_PLY + 4 {
            stack.push(StackEntry::new());
        }
        Searcher {
            tt,
            bitbases,
            limits,
            abort,
            timeman,
            history: HistoryTable::new(),
            stack,
            root_moves: Vec::new(),
            nodes: 0,
            seldepth: 0,
            poll_countdown: POLL_INTERVAL,
            stopped: false,
            previous_score: Value::NONE,
        }
    }

    pub fn nodes(&self) -> u64 {
        self.nodes
    }

    /// The iterative deepening loop. Publishes one info event per
    /// completed iteration (one per line in MultiPV mode) and returns
    /// the move of the last completed iteration.
    pub fn run(&mut self, pos: &mut Position, sink: &mut dyn InfoSink) -> SearchResult {
        let start = Instant::now();
        self.tt.advance_age();

        self.root_moves = MoveList::new(pos, Legal)
            .map(RootMove::new)
            .collect();

        if self.root_moves.is_empty() {
            let value = if pos.in_check() { mated_in(0) } else { Value::DRAW };
            sink.on_info(&SearchInfo {
                depth: 0,
                seldepth: 0,
                multipv: 1,
                score: Score::from_value(value),
                nodes: 0,
                time_ms: 0,
                pv: Vec::new(),
            });
            return SearchResult {
                best_move: Move::NONE,
                ponder_move: Move::NONE,
                value,
                depth: 0,
                nodes: 0,
                pv: Vec::new(),
            };
        }

        let multi_pv = self.limits.multi_pv.max(1).min(self.root_moves.len());
        let max_depth = if self.limits.depth > 0 {
            self.limits.depth.min(MAX_PLY - 1)
        } else {
            MAX_PLY - 1
        };

        let mut completed_depth = 0;
        let mut best_value = -Value::INFINITE;

        for depth in 1..=max_depth {
            let iteration_start = Instant::now();

            for rm in self.root_moves.iter_mut() {
                rm.previous_score = rm.score;
            }

            for pv_idx in 0..multi_pv {
                self.seldepth = 0;
                let previous = self.root_moves[pv_idx].previous_score;
                let mut window = AspirationWindow::new(previous, depth);

                loop {
                    let v = self.search_root(pos, window.alpha, window.beta, depth, pv_idx);
                    // Partial iterations keep the previous ordering: the
                    // stable sort only promotes fully searched moves.
                    self.root_moves[pv_idx..].sort_by(|a, b| b.score.cmp(&a.score));
                    if self.stopped {
                        break;
                    }
                    if window.failed(v) {
                        window.widen(v);
                    } else {
                        best_value = v;
                        break;
                    }
                }
                if self.stopped {
                    break;
                }
            }

            if self.stopped {
                break;
            }

            completed_depth = depth;
            let elapsed = start.elapsed().as_millis() as i64;
            for (i, rm) in self.root_moves.iter().take(multi_pv).enumerate() {
                sink.on_info(&SearchInfo {
                    depth,
                    seldepth: self.seldepth,
                    multipv: i + 1,
                    score: Score::from_value(rm.score),
                    nodes: self.nodes,
                    time_ms: elapsed,
                    pv: rm.pv.clone(),
                });
            }

            // Mate limit: stop once a short enough mate is proven.
            if self.limits.mate > 0
                && best_value >= Value::MATE_IN_MAX_PLY
                && (Value::MATE - best_value).0 <= 2 * self.limits.mate
            {
                break;
            }

            let iteration_ms = iteration_start.elapsed().as_millis() as i64;
            if !self
                .timeman
                .may_compute_next_depth(iteration_ms, self.root_moves[0].score, self.previous_score)
            {
                break;
            }
            self.previous_score = self.root_moves[0].score;
        }

        let best = self.root_moves[0].clone();
        SearchResult {
            best_move: best.mv,
            ponder_move: best.pv.get(1).copied().unwrap_or(Move::NONE),
            value: if best.score != -Value::INFINITE {
                best.score
            } else {
                best.previous_score
            },
            depth: completed_depth,
            nodes: self.nodes,
            pv: best.pv,
        }
    }

    fn search_root(
        &mut self,
        pos: &mut Position,
        mut alpha: Value,
        beta: Value,
        depth: Depth,
        pv_idx: usize,
    ) -> Value {
        let mut best_value = -Value::INFINITE;

        for i in pv_idx..self.root_moves.len() {
            let m = self.root_moves[i].mv;
            let gives_check = pos.gives_check(m);
            self.stack[0].current_move = m;
            self.stack[0].move_count = (i - pv_idx + 1) as i32;

            pos.do_move(m, gives_check);
            self.nodes += 1;

            let mut value;
            if i == pv_idx {
                value = -self.search(pos, -beta, -alpha, depth - 1, 1, false, true);
            } else {
                value = -self.search(pos, -alpha - 1, -alpha, depth - 1, 1, true, false);
                if value > alpha && !self.stopped {
                    value = -self.search(pos, -beta, -alpha, depth - 1, 1, false, true);
                }
            }
            pos.undo_move(m);

            if self.stopped {
                return Value::ZERO;
            }

            if i == pv_idx || value > alpha {
                let rm = &mut self.root_moves[i];
                rm.score = value;
                rm.pv.truncate(1);
                let child_pv = std::mem::take(&mut self.stack[1].pv);
                rm.pv.extend(child_pv);
            } else {
                self.root_moves[i].score = -Value::INFINITE;
            }

            if value > best_value {
                best_value = value;
            }
            if value > alpha {
                alpha = value;
                if alpha >= beta {
                    break;
                }
            }
        }

        best_value
    }

    fn search(
        &mut self,
        pos: &mut Position,
        mut alpha: Value,
        mut beta: Value,
        depth: Depth,
        ply: i32,
        cut_node: bool,
        pv_node: bool,
    ) -> Value {
        if depth <= 0 {
            return self.qsearch(pos, alpha, beta, ply, pv_node);
        }

        debug_assert!(-Value::INFINITE <= alpha && alpha < beta && beta <= Value::INFINITE);
        debug_assert!(pv_node || alpha == beta - 1);

        self.poll();
        if self.stopped {
            return Value::ZERO;
        }

        if pv_node {
            self.stack[ply as usize].pv.clear();
            if self.seldepth < ply {
                self.seldepth = ply;
            }
        }

        // Step 2: terminal draws and ply limit.
        if pos.is_draw(ply) || pos.is_material_draw() {
            return Value::DRAW;
        }
        if ply >= MAX_PLY {
            return if pos.in_check() { Value::DRAW } else { evaluate(pos) };
        }

        // Mate distance pruning: a shorter mate elsewhere makes this
        // subtree irrelevant.
        alpha = alpha.max(mated_in(ply));
        beta = beta.min(mate_in(ply + 1));
        if alpha >= beta {
            return alpha;
        }

        let in_check = pos.in_check();
        let excluded = self.stack[ply as usize].excluded;

        // Step 3: transposition table.
        let pos_key = pos.key() ^ Key((excluded.0 as u64) << 16);
        let probe = self.tt.probe(pos_key, depth, alpha, beta, ply);
        let tt_move = match probe {
            Probe::Hit { mv, .. } => mv,
            Probe::Miss { mv } => mv,
        };
        if !pv_node && excluded == Move::NONE {
            if let Probe::Hit { value, .. } = probe {
                return value;
            }
        }

        // Step 4: stand-pat bitbase probe at material transitions.
        if excluded == Move::NONE
            && !self.bitbases.is_empty()
            && !pos.can_castle(WHITE)
            && !pos.can_castle(BLACK)
        {
            match self.bitbases.probe_value(pos) {
                BitbaseValue::Win => {
                    let v = (Value::KNOWN_WIN + evaluate(pos)).min(Value::MATE_IN_MAX_PLY - 1);
                    self.tt.store(
                        pos_key,
                        (depth + 6).min(DEPTH_MAX - 1),
                        v,
                        Bound::EXACT,
                        Move::NONE,
                        ply,
                    );
                    return v;
                }
                BitbaseValue::Loss => {
                    let v = (-Value::KNOWN_WIN + evaluate(pos)).max(Value::MATED_IN_MAX_PLY + 1);
                    self.tt.store(
                        pos_key,
                        (depth + 6).min(DEPTH_MAX - 1),
                        v,
                        Bound::EXACT,
                        Move::NONE,
                        ply,
                    );
                    return v;
                }
                BitbaseValue::Draw => {
                    self.tt.store(
                        pos_key,
                        (depth + 6).min(DEPTH_MAX - 1),
                        Value::DRAW,
                        Bound::EXACT,
                        Move::NONE,
                        ply,
                    );
                    return Value::DRAW;
                }
                BitbaseValue::Unknown => {}
            }
        }

        // Step 5: static evaluation.
        let eval = if in_check { Value::NONE } else { evaluate(pos) };
        self.stack[ply as usize].static_eval = eval;

        // Step 6: reverse futility pruning. Null move search is
        // deliberately absent from this engine.
        if !pv_node
            && !in_check
            && excluded == Move::NONE
            && depth < 7
            && eval - futility_margin(depth) >= beta
            && eval < Value::KNOWN_WIN
        {
            return eval;
        }

        // Singular extension candidate: the hash entry proved at least
        // this value at depth >= depth - 3. With the probe contract a
        // usable hit survives to this point only at PV nodes.
        let (tt_value, tt_bound) = match probe {
            Probe::Hit { value, bound, .. } => (value, bound),
            _ => (Value::NONE, Bound::NONE),
        };
        let singular_node = ply > 0
            && depth >= 8
            && tt_move != Move::NONE
            && tt_value != Value::NONE
            && tt_value.abs() < Value::KNOWN_WIN
            && excluded == Move::NONE
            && tt_bound & Bound::LOWER != Bound::NONE;

        let killers = self.stack[ply as usize].killers;
        self.stack[(ply + 2) as usize].killers = [Move::NONE; 2];
        self.stack[ply as usize].move_count = 0;

        let mut mp = MovePicker::new(pos, tt_move, depth, killers);
        let mut best_value = -Value::INFINITE;
        let mut best_move = Move::NONE;
        let mut move_count = 0;
        let mut skip_quiets = false;
        let mut quiets_searched: Vec<Move> = Vec::new();

        loop {
            let m = mp.next_move(pos, &self.history, skip_quiets);
            if m == Move::NONE {
                break;
            }
            if m == excluded {
                continue;
            }
            if !pos.legal(m) {
                continue;
            }

            move_count += 1;
            self.stack[ply as usize].move_count = move_count;

            let capture_or_promotion = pos.capture_or_promotion(m);
            let gives_check = pos.gives_check(m);
            let moved_piece = pos.moved_piece(m);

            // Late move pruning: quiet moves far down the list at
            // shallow depth are not worth a visit.
            if !pv_node
                && depth < 8
                && best_value > Value::MATED_IN_MAX_PLY
                && !capture_or_promotion
                && !gives_check
                && !in_check
                && move_count >= late_move_threshold(depth)
            {
                skip_quiets = true;
                continue;
            }

            let mut extension = 0;

            // Singular extension: verify no other move reaches the hash
            // value with a tight window, then extend the hash move.
            if singular_node && m == tt_move {
                let rbeta = (tt_value - Value(2 * depth)).max(-Value::MATE);
                let d = depth / 2;
                self.stack[ply as usize].excluded = m;
                let v = self.search(pos, rbeta - 1, rbeta, d, ply, cut_node, false);
                self.stack[ply as usize].excluded = Move::NONE;
                if self.stopped {
                    return Value::ZERO;
                }
                if v < rbeta {
                    extension = 1;
                }
            } else if gives_check && pos.see_ge(m, Value::ZERO) {
                extension = 1;
            }

            let new_depth = depth - 1 + extension;

            self.stack[ply as usize].current_move = m;
            pos.do_move(m, gives_check);
            self.nodes += 1;

            let mut value;
            let mut do_full_depth = move_count > 1 || !pv_node;

            // Late move reduction with null window; a fail high above
            // alpha triggers the re-search ladder.
            if depth >= 3
                && move_count > 1
                && !capture_or_promotion
                && !in_check
                && !gives_check
                && extension == 0
            {
                let hist = self.history.get(moved_piece, m.to());
                let mut r = reduction(depth, move_count) - hist / 8192;
                r = r.clamp(0, new_depth - 1);
                if cut_node {
                    r += 1;
                }
                let d = (new_depth - r).max(1);
                value = -self.search(pos, -alpha - 1, -alpha, d, ply + 1, true, false);
                do_full_depth = value > alpha && d != new_depth;
            } else {
                value = -Value::INFINITE;
            }

            if do_full_depth {
                value = -self.search(pos, -alpha - 1, -alpha, new_depth, ply + 1, !cut_node, false);
            }

            if pv_node && (move_count == 1 || (value > alpha && value < beta)) {
                self.stack[(ply + 1) as usize].pv.clear();
                value = -self.search(pos, -beta, -alpha, new_depth, ply + 1, false, true);
            }

            pos.undo_move(m);

            if self.stopped {
                return Value::ZERO;
            }

            debug_assert!(value > -Value::INFINITE && value < Value::INFINITE);

            if value > best_value {
                best_value = value;
                if value > alpha {
                    best_move = m;
                    if pv_node {
                        let child_pv = std::mem::take(&mut self.stack[(ply + 1) as usize].pv);
                        let entry = &mut self.stack[ply as usize];
                        entry.pv.clear();
                        entry.pv.push(m);
                        entry.pv.extend(child_pv);
                    }
                    if pv_node && value < beta {
                        alpha = value;
                    } else {
                        break; // Fail high.
                    }
                }
            }

            if !capture_or_promotion && m != best_move && quiets_searched.len() < 64 {
                quiets_searched.push(m);
            }
        }

        if move_count == 0 {
            best_value = if excluded != Move::NONE {
                alpha
            } else if in_check {
                mated_in(ply)
            } else {
                Value::DRAW
            };
        } else if best_move != Move::NONE && !pos.capture_or_promotion(best_move) {
            self.update_quiet_stats(pos, ply, best_move, &quiets_searched, depth);
        }

        if excluded == Move::NONE {
            let bound = if best_value >= beta {
                Bound::LOWER
            } else if pv_node && best_move != Move::NONE {
                Bound::EXACT
            } else {
                Bound::UPPER
            };
            self.tt.store(pos_key, depth, best_value, bound, best_move, ply);
        }

        debug_assert!(best_value > -Value::INFINITE && best_value < Value::INFINITE);
        best_value
    }

    fn qsearch(
        &mut self,
        pos: &mut Position,
        mut alpha: Value,
        beta: Value,
        ply: i32,
        pv_node: bool,
    ) -> Value {
        debug_assert!(alpha >= -Value::INFINITE && alpha < beta && beta <= Value::INFINITE);

        self.poll();
        if self.stopped {
            return Value::ZERO;
        }

        if pos.is_draw(ply) || pos.is_material_draw() {
            return Value::DRAW;
        }
        let in_check = pos.in_check();
        if ply >= MAX_PLY {
            return if in_check { Value::DRAW } else { evaluate(pos) };
        }

        let pos_key = pos.key();
        let probe = self.tt.probe(pos_key, DEPTH_ZERO, alpha, beta, ply);
        let tt_move = match probe {
            Probe::Hit { mv, .. } => mv,
            Probe::Miss { mv } => mv,
        };
        if !pv_node {
            if let Probe::Hit { value, .. } = probe {
                return value;
            }
        }

        let mut best_value;
        let old_alpha = alpha;

        if in_check {
            best_value = -Value::INFINITE;
        } else {
            // Stand pat.
            best_value = evaluate(pos);
            if best_value >= beta {
                self.tt.store(pos_key, DEPTH_ZERO, best_value, Bound::LOWER, Move::NONE, ply);
                return best_value;
            }
            if best_value > alpha {
                alpha = best_value;
            }
        }

        let mut best_move = Move::NONE;
        let mut move_count = 0;
        let mut mp = MovePicker::new_quiescence(pos, tt_move);

        loop {
            let m = mp.next_move(pos, &self.history, false);
            if m == Move::NONE {
                break;
            }
            if !pos.legal(m) {
                continue;
            }

            // Skip losing captures; check evasions are exempt.
            if !in_check && !pos.see_ge(m, Value::ZERO) {
                continue;
            }

            move_count += 1;
            let gives_check = pos.gives_check(m);
            pos.do_move(m, gives_check);
            self.nodes += 1;
            let value = -self.qsearch(pos, -beta, -alpha, ply + 1, pv_node);
            pos.undo_move(m);

            if self.stopped {
                return Value::ZERO;
            }

            if value > best_value {
                best_value = value;
                if value > alpha {
                    best_move = m;
                    if value < beta {
                        alpha = value;
                    } else {
                        self.tt.store(pos_key, DEPTH_ZERO, value, Bound::LOWER, m, ply);
                        return value;
                    }
                }
            }
        }

        if in_check && move_count == 0 {
            return mated_in(ply);
        }

        let bound = if pv_node && best_value > old_alpha {
            Bound::EXACT
        } else {
            Bound::UPPER
        };
        self.tt.store(pos_key, DEPTH_ZERO, best_value, bound, best_move, ply);

        debug_assert!(best_value > -Value::INFINITE && best_value < Value::INFINITE);
        best_value
    }

    /// Promotes a cutting quiet move to the killer slots and feeds the
    /// history table, penalising the quiets tried before it.
    fn update_quiet_stats(
        &mut self,
        pos: &Position,
        ply: i32,
        best_move: Move,
        quiets: &[Move],
        depth: Depth,
    ) {
        let entry = &mut self.stack[ply as usize];
        if entry.killers[0] != best_move {
            entry.killers[1] = entry.killers[0];
            entry.killers[0] = best_move;
        }

        let bonus = history_bonus(depth);
        self.history
            .add(pos.moved_piece(best_move), best_move.to(), bonus);
        for &m in quiets {
            self.history.add(pos.moved_piece(m), m.to(), -bonus);
        }
    }

    /// Cooperative interruption: the abort flag and the clock are
    /// consulted every few thousand nodes.
    fn poll(&mut self) {
        self.poll_countdown -= 1;
        if self.poll_countdown > 0 {
            return;
        }
        self.poll_countdown = POLL_INTERVAL;

        if self.abort.load(Ordering::Relaxed) {
            self.stopped = true;
            return;
        }
        if self.limits.nodes > 0 && self.nodes >= self.limits.nodes {
            self.stopped = true;
            return;
        }
        if self.limits.movetime > 0 && self.timeman.elapsed_ms() >= self.limits.movetime {
            self.stopped = true;
            return;
        }
        if self.timeman.out_of_time() {
            self.stopped = true;
        }
    }
}

/// Counts leaf nodes of the move-generation tree, the classical move
/// generator verification.
pub fn perft(pos: &mut Position, depth: Depth) -> u64 {
    let mut nodes = 0;
    let leaf = depth == 2;
    for m in MoveList::new(pos, Legal) {
        if depth <= 1 {
            nodes += 1;
        } else {
            let gives_check = pos.gives_check(m);
            pos.do_move(m, gives_check);
            nodes += if leaf {
                MoveList::new(pos, Legal).len() as u64
            } else {
                perft(pos, depth - 1)
            };
            pos.undo_move(m);
        }
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitbase::BitbaseRegistry;
    use crate::tt::TranspositionTable;

    fn run_search(fen: &str, limits: Limits) -> SearchResult {
        let mut pos = Position::from_fen(fen).unwrap();
        let mut tt = TranspositionTable::new(8);
        let bitbases = BitbaseRegistry::new();
        let abort = Arc::new(AtomicBool::new(false));
        let us = pos.side_to_move();
        let mut searcher = Searcher::new(&mut tt, &bitbases, limits, abort, us);
        searcher.run(&mut pos, &mut NullSink)
    }

    fn depth_limits(depth: Depth) -> Limits {
        Limits {
            depth,
            ..Limits::default()
        }
    }

    #[test]
    fn finds_mate_in_one_at_depth_one() {
        // Qg7 is mate: the queen covers g8 and h7, the king guards it.
        let r = run_search("7k/5Q2/5K2/8/8/8/8/8 w - - 0 1", depth_limits(1));
        assert_eq!(r.value, mate_in(1));
        assert_eq!(r.best_move.to(), Square(54));
    }

    #[test]
    fn mate_in_one_score_at_depth_three() {
        let r = run_search("7k/5Q2/5K2/8/8/8/8/8 w - - 0 1", depth_limits(3));
        assert_eq!(r.value, mate_in(1));
        assert_eq!(r.value, Value::MATE - 1);
    }

    #[test]
    fn finds_mate_in_two() {
        // Two-rook ladder: 1.Rb7 (any) 2.Ra8#.
        let r = run_search("4k3/8/8/8/8/8/RR6/4K3 w - - 0 1", depth_limits(5));
        assert_eq!(r.value, mate_in(3));
    }

    #[test]
    fn stalemate_is_zero() {
        let r = run_search("7k/5Q2/6K1/8/8/8/8/8 b - - 0 1", depth_limits(4));
        assert_eq!(r.value, Value::DRAW);
        assert_eq!(r.best_move, Move::NONE);
    }

    #[test]
    fn checkmated_position_reports_mate() {
        // Back-rank corner: the black king has no square and no mover.
        let r = run_search("6kR/5p2/5K2/8/8/8/8/8 b - - 0 1", depth_limits(3));
        assert_eq!(r.value, mated_in(0));
        assert_eq!(r.best_move, Move::NONE);
    }

    #[test]
    fn bare_kings_draw() {
        let r = run_search("8/8/8/4k3/8/4K3/8/8 w - - 0 1", depth_limits(6));
        assert_eq!(r.value, Value::DRAW);
    }

    #[test]
    fn search_respects_abort_flag() {
        let mut pos = Position::startpos();
        let mut tt = TranspositionTable::new(8);
        let bitbases = BitbaseRegistry::new();
        let abort = Arc::new(AtomicBool::new(true));
        let mut searcher = Searcher::new(
            &mut tt,
            &bitbases,
            Limits {
                depth: 30,
                ..Limits::default()
            },
            abort,
            WHITE,
        );
        let r = searcher.run(&mut pos, &mut NullSink);
        // The first few iterations may complete before the first poll;
        // anything deeper means the flag was ignored.
        assert!(r.depth <= 4);
        assert!(r.best_move != Move::NONE);
    }

    #[test]
    fn repetition_draw_in_tree() {
        // Start position shuffling knights: the third occurrence is a
        // draw no matter the material.
        let mut pos = Position::startpos();
        for lan in [
            "g1f3", "g8f6", "f3g1", "f6g8", "g1f3", "g8f6", "f3g1", "f6g8",
        ] {
            let m = crate::position::find_move(&pos, lan);
            let gives_check = pos.gives_check(m);
            pos.do_move(m, gives_check);
        }
        assert!(pos.is_draw(1));
    }

    #[test]
    fn aspiration_window_widens_and_opens() {
        let mut w = AspirationWindow::new(Value::ZERO, 6);
        assert_eq!(w.alpha, Value(-16));
        assert_eq!(w.beta, Value(16));

        assert!(w.failed(Value(16)));
        w.widen(Value(16));
        assert!(w.beta > Value(16));
        assert_eq!(w.alpha, Value(-16));

        w.widen(w.beta);
        assert!(w.beta > Value(48));

        // Third widening opens completely.
        w.widen(w.beta);
        assert_eq!(w.alpha, -Value::MATE);
        assert_eq!(w.beta, Value::MATE);
    }

    #[test]
    fn score_reporting_converts_mates() {
        assert_eq!(Score::from_value(mate_in(1)), Score::Mate(1));
        assert_eq!(Score::from_value(mate_in(3)), Score::Mate(2));
        assert_eq!(Score::from_value(mated_in(2)), Score::Mate(-1));
        assert_eq!(Score::from_value(Value(123)), Score::Cp(123));
    }

    #[test]
    fn deeper_search_keeps_sane_values() {
        let r = run_search(
            "r1bqkbnr/pppp1ppp/2n5/1B2p3/4P3/5N2/PPPP1PPP/RNBQK2R w KQkq - 4 4",
            depth_limits(6),
        );
        assert!(r.value.abs() < Value(300));
        assert!(r.best_move != Move::NONE);
        assert!(!r.pv.is_empty());
    }
}
