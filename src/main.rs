// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use log::warn;

use quartz::bitbase::BitbaseRegistry;
use quartz::bitfile::Compression;
use quartz::bitgen::{self, GeneratorConfig};
use quartz::position::Position;
use quartz::search::{perft, InfoSink, Limits, Score, SearchInfo, Searcher};
use quartz::signature::MaterialSignature;
use quartz::tt::{TranspositionTable, DEFAULT_TT_MB};

#[derive(Parser)]
#[command(name = "quartz", version, about = "Chess engine core: search and endgame bitbase generator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search a position and print the best move.
    Search {
        /// Position in FEN, or "startpos".
        #[arg(num_args = 1.., required = true)]
        fen: Vec<String>,
        /// Fixed search depth in plies.
        #[arg(long)]
        depth: Option<i32>,
        /// Fixed time per move in milliseconds.
        #[arg(long)]
        movetime: Option<i64>,
        /// Node budget.
        #[arg(long)]
        nodes: Option<u64>,
        /// White / black clock time in milliseconds.
        #[arg(long)]
        wtime: Option<i64>,
        #[arg(long)]
        btime: Option<i64>,
        /// White / black increment in milliseconds.
        #[arg(long, default_value_t = 0)]
        winc: i64,
        #[arg(long, default_value_t = 0)]
        binc: i64,
        /// Moves to the next time control.
        #[arg(long, default_value_t = 0)]
        movestogo: i32,
        /// Number of principal variations to report.
        #[arg(long, default_value_t = 1)]
        multipv: usize,
        /// Transposition table size in MiB.
        #[arg(long, default_value_t = DEFAULT_TT_MB)]
        hash: usize,
        /// Directory with .btb endgame bitbases to attach.
        #[arg(long)]
        bitbase_path: Option<PathBuf>,
    },
    /// Generate endgame bitbases. The signature may be a piece string
    /// such as KPK, or one of the documented sets 3, 4, 5, 5s.
    Bitgenerate {
        signature: String,
        /// Worker threads; 0 uses all cores.
        #[arg(long, default_value_t = 0)]
        cores: usize,
        /// Output directory.
        #[arg(long, default_value = ".")]
        path: PathBuf,
        /// Cluster compression: none, miniz or lz4.
        #[arg(long, default_value = "miniz")]
        compression: String,
        /// Additionally emit each table as a Rust source file for
        /// compiling in.
        #[arg(long)]
        rust_source: bool,
    },
    /// Count move-generation leaf nodes.
    Perft {
        depth: i32,
        #[arg(num_args = 1.., required = true)]
        fen: Vec<String>,
    },
    /// Search a fixed position set and report nodes per second.
    Bench {
        #[arg(long, default_value_t = 11)]
        depth: i32,
    },
}

struct StdoutSink;

impl InfoSink for StdoutSink {
    fn on_info(&mut self, info: &SearchInfo) {
        let score = match info.score {
            Score::Cp(cp) => format!("cp {}", cp),
            Score::Mate(m) => format!("mate {}", m),
        };
        let nps = if info.time_ms > 0 {
            info.nodes * 1000 / info.time_ms as u64
        } else {
            info.nodes
        };
        print!(
            "info depth {} seldepth {} multipv {} score {} nodes {} nps {} time {} pv",
            info.depth, info.seldepth, info.multipv, score, info.nodes, nps, info.time_ms
        );
        for m in info.pv.iter() {
            print!(" {}", m);
        }
        println!();
    }
}

fn parse_position(words: &[String]) -> Result<Position> {
    let joined = words.join(" ");
    if joined == "startpos" {
        return Ok(Position::startpos());
    }
    Position::from_fen(&joined).with_context(|| format!("bad FEN '{}'", joined))
}

fn load_bitbases(dir: &Path) -> BitbaseRegistry {
    let mut registry = BitbaseRegistry::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!("cannot read bitbase directory {}: {}", dir.display(), e);
            return registry;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("btb") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match MaterialSignature::parse(stem) {
            Ok(sig) => {
                if let Err(e) = registry.attach_file(sig, &path) {
                    warn!("skipping {}: {}", path.display(), e);
                }
            }
            Err(e) => warn!("skipping {}: {}", path.display(), e),
        }
    }
    registry
}

#[allow(clippy::too_many_arguments)]
fn run_search(
    fen: Vec<String>,
    depth: Option<i32>,
    movetime: Option<i64>,
    nodes: Option<u64>,
    wtime: Option<i64>,
    btime: Option<i64>,
    winc: i64,
    binc: i64,
    movestogo: i32,
    multipv: usize,
    hash: usize,
    bitbase_path: Option<PathBuf>,
) -> Result<()> {
    let mut pos = parse_position(&fen)?;

    let registry = match bitbase_path {
        Some(dir) => load_bitbases(&dir),
        None => BitbaseRegistry::new(),
    };
    if !registry.is_empty() {
        println!("info string {} bitbases attached", registry.len());
    }

    let limits = Limits {
        depth: depth.unwrap_or(0),
        movetime: movetime.unwrap_or(0),
        nodes: nodes.unwrap_or(0),
        time: [wtime.unwrap_or(0), btime.unwrap_or(0)],
        inc: [winc, binc],
        movestogo,
        multi_pv: multipv,
        ..Limits::default()
    };
    if limits.depth == 0 && limits.movetime == 0 && limits.nodes == 0 && !limits.use_time_management()
    {
        bail!("no limit given: pass --depth, --movetime, --nodes or clock times");
    }

    let mut tt = TranspositionTable::new(hash);
    let abort = Arc::new(AtomicBool::new(false));
    let us = pos.side_to_move();
    let mut searcher = Searcher::new(&mut tt, &registry, limits, abort, us);
    let result = searcher.run(&mut pos, &mut StdoutSink);

    if result.ponder_move != quartz::types::Move::NONE {
        println!("bestmove {} ponder {}", result.best_move, result.ponder_move);
    } else {
        println!("bestmove {}", result.best_move);
    }
    Ok(())
}

fn run_bitgenerate(
    signature: String,
    cores: usize,
    path: PathBuf,
    compression: String,
    rust_source: bool,
) -> Result<()> {
    let compression = Compression::from_name(&compression)
        .ok_or_else(|| anyhow!("unknown compression '{}'", compression))?;
    let cfg = GeneratorConfig {
        cores,
        path,
        compression,
        emit_rust_source: rust_source,
        ..GeneratorConfig::default()
    };

    let signatures: Vec<String> = match bitgen::expand_signature_set(&signature) {
        Some(set) => set.into_iter().map(str::to_string).collect(),
        None => vec![signature],
    };

    let mut registry = BitbaseRegistry::new();
    for s in signatures {
        let sig = MaterialSignature::parse(&s).with_context(|| format!("bad signature '{}'", s))?;
        bitgen::generate(sig, &mut registry, &cfg)
            .with_context(|| format!("generating {}", sig))?;
    }
    Ok(())
}

fn run_bench(depth: i32) -> Result<()> {
    const BENCH_FENS: [&str; 6] = [
        quartz::position::START_FEN,
        "r3k2r/p1ppqpb1/bn2pnp1/3PN3/1p2P3/2N2Q1p/PPPBBPPP/R3K2R w KQkq - 0 1",
        "8/2p5/3p4/KP5r/1R3p1k/8/4P1P1/8 w - - 0 1",
        "r1bqkbnr/pppp1ppp/2n5/1B2p3/4P3/5N2/PPPP1PPP/RNBQK2R w KQkq - 4 4",
        "4k3/8/8/8/8/8/4P3/4K3 w - - 0 1",
        "7k/5Q2/5K2/8/8/8/8/8 w - - 0 1",
    ];

    let registry = BitbaseRegistry::new();
    let mut total_nodes = 0u64;
    let started = std::time::Instant::now();

    for fen in BENCH_FENS {
        let mut pos = Position::from_fen(fen)?;
        let mut tt = TranspositionTable::new(DEFAULT_TT_MB);
        let abort = Arc::new(AtomicBool::new(false));
        let us = pos.side_to_move();
        let limits = Limits {
            depth,
            ..Limits::default()
        };
        let mut searcher = Searcher::new(&mut tt, &registry, limits, abort, us);
        let result = searcher.run(&mut pos, &mut quartz::search::NullSink);
        println!("{:64} {:>12} nodes", fen, result.nodes);
        total_nodes += result.nodes;
    }

    let ms = started.elapsed().as_millis().max(1) as u64;
    println!("===========================");
    println!("Total nodes : {}", total_nodes);
    println!("Total time  : {} ms", ms);
    println!("Nodes/second: {}", total_nodes * 1000 / ms);
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    println!("{}", quartz::engine_info());

    match Cli::parse().command {
        Command::Search {
            fen,
            depth,
            movetime,
            nodes,
            wtime,
            btime,
            winc,
            binc,
            movestogo,
            multipv,
            hash,
            bitbase_path,
        } => run_search(
            fen, depth, movetime, nodes, wtime, btime, winc, binc, movestogo, multipv, hash,
            bitbase_path,
        ),
        Command::Bitgenerate {
            signature,
            cores,
            path,
            compression,
            rust_source,
        } => run_bitgenerate(signature, cores, path, compression, rust_source),
        Command::Perft { depth, fen } => {
            let mut pos = parse_position(&fen)?;
            let started = std::time::Instant::now();
            let nodes = perft(&mut pos, depth);
            println!(
                "perft({}) = {} in {} ms",
                depth,
                nodes,
                started.elapsed().as_millis()
            );
            Ok(())
        }
        Command::Bench { depth } => run_bench(depth),
    }
}
