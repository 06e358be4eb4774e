//! Ping-pong latency between two ranks.
//!
//! By default times 1 B, 1 KiB and 1 MiB messages, starting from ITERATIONS
//! round trips (10000 if omitted) and never fewer than 100. With `sweep`,
//! times every power of two up to 10 MiB instead.
//!
//! Standalone (two threads in this process):
//!
//!     cargo run --release --example latency -- [ITERATIONS | sweep]
//!
//! Under a launcher with exactly two peers in FERROLINK_PEERS:
//!
//!     FERROLINK_PEERS=hostA:7000,hostB:7000 FERROLINK_RANK=<0|1> \
//!         cargo run --release --example latency

use ferrolink::latency::run_latency;
use ferrolink::{logging, run_local, Group, LatencyConfig, LaunchInfo, Result, Transport};
use std::process::ExitCode;

const DEFAULT_ITERATIONS: usize = 10_000;

fn parse_config() -> std::result::Result<LatencyConfig, String> {
    match std::env::args().nth(1) {
        None => Ok(LatencyConfig::landmarks(DEFAULT_ITERATIONS)),
        Some(arg) if arg == "sweep" => Ok(LatencyConfig::default()),
        Some(arg) => match arg.parse::<usize>() {
            Ok(n) if n > 0 => Ok(LatencyConfig::landmarks(n)),
            _ => Err(format!(
                "iteration count must be a positive integer or 'sweep', got '{arg}'"
            )),
        },
    }
}

fn run<T: Transport>(group: &Group<T>, config: &LatencyConfig) -> Result<()> {
    let samples = match run_latency(group, config) {
        Ok(samples) => samples,
        Err(e) => {
            if group.rank() == 0 {
                eprintln!("error: {e}");
            }
            return Err(e);
        }
    };

    if group.rank() == 0 {
        println!(
            "{:>12} {:>12} {:>18} {:>14}",
            "size (B)", "iterations", "round trip (us)", "one way (us)"
        );
        for s in &samples {
            println!(
                "{:>12} {:>12} {:>18.3} {:>14.3}",
                s.message_size_bytes,
                s.iterations,
                s.average_round_trip_us,
                s.one_way_us()
            );
        }
    }
    Ok(())
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

    let config = match parse_config() {
        Ok(config) => config,
        Err(msg) => {
            if reporter {
                eprintln!("error: {msg}");
            }
            return ExitCode::FAILURE;
        }
    };

    let result = match launch {
        Some(info) => info.connect().and_then(|group| run(&group, &config)),
        None => run_local(2, |group| run(&group, &config))
            .and_then(|results| results.into_iter().collect::<Result<Vec<_>>>())
            .map(|_| ()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
