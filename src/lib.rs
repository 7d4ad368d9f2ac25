// SPDX-License-Identifier: GPL-3.0-or-later

//! Quartz: a chess engine core built around an iterative-deepening
//! alpha-beta search and a retrograde endgame bitbase generator.

pub mod bitbase;
pub mod bitboard;
pub mod bitfile;
pub mod bitgen;
pub mod bitindex;
pub mod eval;
pub mod movegen;
pub mod movepick;
pub mod position;
pub mod search;
pub mod signature;
pub mod timeman;
pub mod tt;
pub mod types;

pub fn engine_info() -> String {
    format!("Quartz {}", env!("CARGO_PKG_VERSION"))
}
