// SPDX-License-Identifier: GPL-3.0-or-later

//! End-to-end scenarios: bitbase generation feeding the search.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use quartz::bitbase::{BitbaseRegistry, BitbaseValue};
use quartz::bitfile::Compression;
use quartz::bitgen::{generate, GeneratorConfig};
use quartz::position::Position;
use quartz::search::{Limits, NullSink, SearchResult, Searcher};
use quartz::signature::MaterialSignature;
use quartz::tt::TranspositionTable;
use quartz::types::*;

fn kpk_registry(dir: &std::path::Path) -> BitbaseRegistry {
    let mut registry = BitbaseRegistry::new();
    let cfg = GeneratorConfig {
        cores: 2,
        path: dir.to_path_buf(),
        compression: Compression::Lz4,
        ..GeneratorConfig::default()
    };
    generate(MaterialSignature::parse("KPK").unwrap(), &mut registry, &cfg).unwrap();
    registry
}

fn search_with(registry: &BitbaseRegistry, fen: &str, depth: Depth) -> SearchResult {
    let mut pos = Position::from_fen(fen).unwrap();
    let mut tt = TranspositionTable::new(8);
    let abort = Arc::new(AtomicBool::new(false));
    let us = pos.side_to_move();
    let limits = Limits {
        depth,
        ..Limits::default()
    };
    let mut searcher = Searcher::new(&mut tt, registry, limits, abort, us);
    searcher.run(&mut pos, &mut NullSink)
}

#[test]
fn kpk_probe_reports_the_win() {
    let dir = tempfile::tempdir().unwrap();
    let registry = kpk_registry(dir.path());

    let pos = Position::from_fen("4k3/8/8/8/8/8/4P3/4K3 w - - 0 1").unwrap();
    assert_eq!(registry.probe_value(&pos), BitbaseValue::Win);

    // Same pieces, black to move: still lost for the defender.
    let pos = Position::from_fen("4k3/8/8/8/8/8/4P3/4K3 b - - 0 1").unwrap();
    assert_eq!(registry.probe_value(&pos), BitbaseValue::Loss);
}

#[test]
fn kpk_search_with_bitbase_sees_the_win_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let registry = kpk_registry(dir.path());

    let r = search_with(&registry, "4k3/8/8/8/8/8/4P3/4K3 w - - 0 1", 6);
    assert!(
        r.value >= Value::KNOWN_WIN - 500,
        "expected a tablebase win, got {:?}",
        r.value
    );
}

#[test]
fn kpk_search_without_bitbase_still_prefers_white() {
    let registry = BitbaseRegistry::new();
    let r = search_with(&registry, "4k3/8/8/8/8/8/4P3/4K3 w - - 0 1", 13);
    assert!(
        r.value >= Value(100),
        "white should be clearly better, got {:?}",
        r.value
    );
}

#[test]
fn bare_kings_draw_and_no_mating_material() {
    let pos = Position::from_fen("8/8/8/4k3/8/4K3/8/8 w - - 0 1").unwrap();
    assert!(!pos.has_enough_material_to_mate(WHITE));
    assert!(!pos.has_enough_material_to_mate(BLACK));

    let registry = BitbaseRegistry::new();
    let r = search_with(&registry, "8/8/8/4k3/8/4K3/8/8 w - - 0 1", 8);
    assert_eq!(r.value, Value::DRAW);
}

#[test]
fn queen_mate_at_shallow_depth() {
    let registry = BitbaseRegistry::new();
    let r = search_with(&registry, "7k/5Q2/5K2/8/8/8/8/8 w - - 0 1", 3);
    assert_eq!(r.value, Value::MATE - 1);
    // Qg7 delivers it.
    assert_eq!(r.best_move.to(), Square(54));
}

#[test]
fn draw_against_attached_bitbase_is_zero() {
    let dir = tempfile::tempdir().unwrap();
    let registry = kpk_registry(dir.path());

    // The classical rook-pawn corner draw scores zero with the bitbase
    // attached, whatever the evaluation thinks of the extra pawn.
    let r = search_with(&registry, "k7/8/8/8/8/8/P7/K7 w - - 0 1", 6);
    assert_eq!(r.value, Value::DRAW);
}
