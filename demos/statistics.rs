//! Distributed statistics over a random array.
//!
//! Root generates N uniform values in [0, 100), scatters them, every rank
//! computes min / max / sum over its chunk, the results are reduced to root
//! and the array is gathered back and checked.
//!
//! Standalone (ranks are threads in this process):
//!
//!     cargo run --example statistics -- <N> [RANKS]
//!
//! Under a launcher, every process gets FERROLINK_PEERS and a rank variable
//! and RANKS is ignored:
//!
//!     FERROLINK_PEERS=127.0.0.1:7000,127.0.0.1:7001 FERROLINK_RANK=0 \
//!         cargo run --example statistics -- 16

use ferrolink::stats::{run_statistics, Verification};
use ferrolink::{logging, run_local, Group, LaunchInfo, Result, StatsConfig, Transport};
use std::process::ExitCode;

const DEFAULT_RANKS: usize = 4;

struct Args {
    len: usize,
    ranks: usize,
}

fn parse_positive(raw: &str, what: &str) -> std::result::Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("{what} must be a positive integer, got '{raw}'")),
    }
}

fn parse_args() -> std::result::Result<Args, String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(len) = args.first() else {
        return Err("usage: statistics <N> [RANKS]".to_string());
    };
    Ok(Args {
        len: parse_positive(len, "array size")?,
        ranks: match args.get(1) {
            Some(raw) => parse_positive(raw, "rank count")?,
            None => DEFAULT_RANKS,
        },
    })
}

/// Run the pipeline on one rank. Returns whether verification passed.
fn run<T: Transport>(group: &Group<T>, config: &StatsConfig) -> Result<bool> {
    let mut source = config.source();
    let outcome = match run_statistics(group, config, &mut source) {
        Ok(outcome) => outcome,
        Err(e) => {
            if group.rank() == config.root {
                eprintln!("error: {e}");
            }
            return Err(e);
        }
    };

    let Some(global) = outcome.global else {
        return Ok(true);
    };

    println!(
        "Statistics over {} elements on {} ranks ({} per rank)",
        global.count,
        group.size(),
        outcome.chunk_len
    );
    println!("  min     = {:.6}", global.min);
    println!("  max     = {:.6}", global.max);
    println!("  sum     = {:.6}", global.sum);
    println!("  average = {:.6}", global.average);
    match global.verification {
        Verification::Passed => println!("Gather verification: passed"),
        Verification::Failed {
            index,
            expected,
            found,
        } => println!("Gather verification: FAILED at index {index} (expected {expected}, found {found})"),
    }
    Ok(global.verification.passed())
}

fn main() -> ExitCode {
    logging::init();

    let launch = match LaunchInfo::detect() {
        Ok(launch) => launch,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let reporter = launch.as_ref().map_or(true, |info| info.rank == 0);

    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            if reporter {
                eprintln!("error: {msg}");
            }
            return ExitCode::FAILURE;
        }
    };
    let config = StatsConfig::new(args.len);

    let passed = match launch {
        Some(info) => info.connect().and_then(|group| run(&group, &config)),
        None => run_local(args.ranks, |group| run(&group, &config))
            .and_then(|results| results.into_iter().collect::<Result<Vec<_>>>())
            .map(|passed| passed.into_iter().all(|p| p)),
    };

    match passed {
        Ok(true) => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    }
}
