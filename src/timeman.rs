// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::Instant;

use crate::search::Limits;
use crate::types::*;

/// Budgets one move's thinking time: a soft target derived from the
/// clock and a hard cap of four times the target. The iteration gate
/// predicts the next depth at four times the previous one.
pub struct TimeManager {
    start: Instant,
    soft_ms: i64,
    hard_ms: i64,
    managed: bool,
}

const MOVE_HORIZON: i32 = 80;
const HARD_CAP_FACTOR: i64 = 4;
const NEXT_DEPTH_FACTOR: i64 = 4;
const CRITICAL_SCORE_DROP: Value = Value(50);

impl TimeManager {
    pub fn new(limits: &Limits, us: Color) -> TimeManager {
        let managed = limits.use_time_management();
        let time_left = limits.time[us.idx()];
        let inc = limits.inc[us.idx()];
        let soft_ms = time_left / limits.movestogo.max(MOVE_HORIZON) as i64 + inc;
        // Leave a little slack so the flag never falls on the cap itself.
        let hard_ms = (HARD_CAP_FACTOR * soft_ms).min((time_left - 20).max(1));
        TimeManager {
            start: Instant::now(),
            soft_ms,
            hard_ms,
            managed,
        }
    }

    pub fn elapsed_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    pub fn soft_budget_ms(&self) -> i64 {
        self.soft_ms
    }

    pub fn hard_cap_ms(&self) -> i64 {
        self.hard_ms
    }

    /// Hard stop, polled from the search.
    pub fn out_of_time(&self) -> bool {
        self.managed && self.elapsed_ms() >= self.hard_ms
    }

    /// Decides after a completed iteration whether the next depth fits.
    /// The estimate for the next iteration is four times the last one;
    /// after a critical score drop the search may run to the hard cap.
    pub fn may_compute_next_depth(&self, last_iteration_ms: i64, score: Value, previous: Value) -> bool {
        if !self.managed {
            return true;
        }
        let elapsed = self.elapsed_ms();
        if previous != Value::NONE && previous - score >= CRITICAL_SCORE_DROP {
            return elapsed < self.hard_ms;
        }
        let estimate = NEXT_DEPTH_FACTOR * last_iteration_ms.max(1);
        elapsed + estimate <= self.hard_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clocked_limits(time: i64, inc: i64, movestogo: i32) -> Limits {
        Limits {
            time: [time, time],
            inc: [inc, inc],
            movestogo,
            ..Limits::default()
        }
    }

    #[test]
    fn soft_budget_uses_move_horizon() {
        let tm = TimeManager::new(&clocked_limits(80_000, 0, 0), WHITE);
        assert_eq!(tm.soft_budget_ms(), 1_000);
        assert_eq!(tm.hard_cap_ms(), 4_000);
    }

    #[test]
    fn increment_feeds_budget() {
        let tm = TimeManager::new(&clocked_limits(80_000, 500, 0), WHITE);
        assert_eq!(tm.soft_budget_ms(), 1_500);
    }

    #[test]
    fn hard_cap_never_exceeds_clock() {
        let tm = TimeManager::new(&clocked_limits(1_000, 2_000, 0), WHITE);
        assert!(tm.hard_cap_ms() < 1_000);
    }

    #[test]
    fn next_depth_gate() {
        let tm = TimeManager::new(&clocked_limits(80_000, 0, 0), WHITE);
        // A fast iteration leaves room, a slow one does not.
        assert!(tm.may_compute_next_depth(10, Value(20), Value(25)));
        assert!(!tm.may_compute_next_depth(10_000, Value(20), Value(25)));
        // A collapsing score keeps the search alive to the hard cap.
        assert!(tm.may_compute_next_depth(10_000, Value(-60), Value(0)));
    }

    #[test]
    fn unmanaged_limits_never_gate() {
        let limits = Limits {
            depth: 7,
            ..Limits::default()
        };
        let tm = TimeManager::new(&limits, WHITE);
        assert!(tm.may_compute_next_depth(1 << 30, Value::ZERO, Value::ZERO));
        assert!(!tm.out_of_time());
    }
}
