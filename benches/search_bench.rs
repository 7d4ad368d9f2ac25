// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};

use quartz::bitbase::BitbaseRegistry;
use quartz::position::Position;
use quartz::search::{perft, Limits, NullSink, Searcher};
use quartz::tt::TranspositionTable;

fn bench_search(c: &mut Criterion) {
    c.bench_function("search middlegame depth 7", |b| {
        b.iter(|| {
            let mut pos = Position::from_fen(
                "r1bqkbnr/pppp1ppp/2n5/1B2p3/4P3/5N2/PPPP1PPP/RNBQK2R w KQkq - 4 4",
            )
            .unwrap();
            let mut tt = TranspositionTable::new(16);
            let registry = BitbaseRegistry::new();
            let abort = Arc::new(AtomicBool::new(false));
            let us = pos.side_to_move();
            let limits = Limits {
                depth: 7,
                ..Limits::default()
            };
            let mut searcher = Searcher::new(&mut tt, &registry, limits, abort, us);
            searcher.run(&mut pos, &mut NullSink)
        })
    });
}

fn bench_perft(c: &mut Criterion) {
    c.bench_function("perft startpos 4", |b| {
        b.iter(|| {
            let mut pos = Position::startpos();
            perft(&mut pos, 4)
        })
    });
}

criterion_group!(benches, bench_search, bench_perft);
criterion_main!(benches);
