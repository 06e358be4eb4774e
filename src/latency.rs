//! Ping-pong latency harness.
//!
//! Exactly two ranks take part. Rank 0 sends a message of the given size,
//! rank 1 echoes it back, and rank 0 times the round trips with [`wtime`].
//!
//! ```
//! use ferrolink::latency::run_latency;
//! use ferrolink::{run_local, IterationPolicy, LatencyConfig};
//!
//! let config = LatencyConfig::new(vec![1, 64], IterationPolicy::Fixed(50));
//! let out = run_local(2, |group| run_latency(&group, &config)).unwrap();
//!
//! let samples = out[0].as_ref().unwrap();
//! assert_eq!(samples.len(), 2);
//! assert!(out[1].as_ref().unwrap().is_empty());
//! ```

use crate::error::{Error, Result};
use crate::group::Group;
use crate::transport::Transport;
use crate::{wtime, Tag};
use tracing::{debug, info};

/// Tag of the outgoing ping.
const PING: Tag = 0;
/// Tag of the echo.
const PONG: Tag = 1;

/// Bytes per "kilobyte" in the size-dependent policies.
const KIB: usize = 1024;

/// How many round trips to time for a message size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationPolicy {
    /// Same count for every size.
    Fixed(usize),
    /// `max(floor, base / (size / 1024 + 1))`: fewer iterations for
    /// larger messages, never below `floor`.
    Adaptive {
        /// Count for messages under 1 KiB
        base: usize,
        /// Lower bound
        floor: usize,
    },
    /// `max(floor, base / max(1, size / 1024))`: like `Adaptive`, but the
    /// count only starts dropping at 2 KiB. Used by the size sweep.
    Scaled {
        /// Count for messages under 2 KiB
        base: usize,
        /// Lower bound
        floor: usize,
    },
}

impl IterationPolicy {
    /// Iteration count for a message of `size` bytes.
    pub fn iterations(&self, size: usize) -> usize {
        match *self {
            IterationPolicy::Fixed(n) => n,
            IterationPolicy::Adaptive { base, floor } => floor.max(base / (size / KIB + 1)),
            IterationPolicy::Scaled { base, floor } => floor.max(base / (size / KIB).max(1)),
        }
    }
}

/// Message sizes to sweep and the iteration policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatencyConfig {
    /// Message sizes in bytes; sorted and deduplicated before use.
    pub sizes: Vec<usize>,
    /// Round trips per size.
    pub policy: IterationPolicy,
}

impl Default for LatencyConfig {
    /// Powers of two up to 10 MiB, 1000 iterations for small messages and
    /// at least 10 for large ones.
    fn default() -> Self {
        Self::powers_of_two(10 * KIB * KIB, IterationPolicy::Scaled { base: 1000, floor: 10 })
    }
}

impl LatencyConfig {
    /// Explicit size list.
    pub fn new(sizes: Vec<usize>, policy: IterationPolicy) -> Self {
        LatencyConfig { sizes, policy }
    }

    /// Sizes 1, 2, 4, ... up to and including `ceiling`.
    pub fn powers_of_two(ceiling: usize, policy: IterationPolicy) -> Self {
        let sizes = std::iter::successors(Some(1usize), |s| s.checked_mul(2))
            .take_while(|&s| s <= ceiling)
            .collect();
        LatencyConfig { sizes, policy }
    }

    /// 1 B, 1 KiB and 1 MiB, starting from `iterations` and never timing
    /// fewer than 100 round trips.
    pub fn landmarks(iterations: usize) -> Self {
        LatencyConfig {
            sizes: vec![1, KIB, KIB * KIB],
            policy: IterationPolicy::Adaptive {
                base: iterations,
                floor: 100,
            },
        }
    }

    /// Sorted, deduplicated sizes with their iteration counts.
    ///
    /// Fails with [`Error::InvalidConfiguration`] when there are no sizes or
    /// any size would get zero iterations.
    pub fn plan(&self) -> Result<Vec<(usize, usize)>> {
        let mut sizes = self.sizes.clone();
        sizes.sort_unstable();
        sizes.dedup();
        if sizes.is_empty() {
            return Err(Error::config("no message sizes to measure"));
        }
        sizes
            .into_iter()
            .map(|size| match self.policy.iterations(size) {
                0 => Err(Error::config(format!(
                    "message size {size} would be timed over zero iterations"
                ))),
                n => Ok((size, n)),
            })
            .collect()
    }
}

/// Timing result for one message size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySample {
    /// Bytes per message
    pub message_size_bytes: usize,
    /// Round trips timed
    pub iterations: usize,
    /// Mean round-trip time in microseconds
    pub average_round_trip_us: f64,
}

impl LatencySample {
    /// Estimated one-way latency: half the round trip.
    pub fn one_way_us(&self) -> f64 {
        self.average_round_trip_us / 2.0
    }
}

fn check_pair<T: Transport>(group: &Group<T>) -> Result<()> {
    if group.size() != 2 {
        return Err(Error::config(format!(
            "latency measurement needs exactly 2 ranks, got {}",
            group.size()
        )));
    }
    Ok(())
}

/// Time `iterations` round trips of `size`-byte messages.
///
/// Both ranks must call this. Returns the mean round trip in microseconds
/// at rank 0 and `None` at rank 1. The timed loop reuses one byte buffer
/// and does not allocate per round trip beyond what the transport needs.
pub fn ping_pong<T: Transport>(
    group: &Group<T>,
    size: usize,
    iterations: usize,
) -> Result<Option<f64>> {
    check_pair(group)?;
    if iterations == 0 {
        return Err(Error::config("iteration count must be at least 1"));
    }

    let mut buf: Vec<u8> = (0..size).map(|i| i as u8).collect();
    group.barrier()?;

    if group.rank() == 0 {
        let start = wtime();
        for _ in 0..iterations {
            group.send(&buf, 1, PING)?;
            group.recv(&mut buf, 1, PONG)?;
        }
        let elapsed = wtime() - start;
        Ok(Some(elapsed / iterations as f64 * 1e6))
    } else {
        for _ in 0..iterations {
            group.recv(&mut buf, 0, PING)?;
            group.send(&buf, 0, PONG)?;
        }
        Ok(None)
    }
}

/// Sweep every size in `config`.
///
/// The configuration and group size are checked on both ranks before any
/// message is timed. Rank 0 gets one sample per distinct size in ascending
/// order; rank 1 gets an empty vector.
pub fn run_latency<T: Transport>(
    group: &Group<T>,
    config: &LatencyConfig,
) -> Result<Vec<LatencySample>> {
    check_pair(group)?;
    let plan = config.plan()?;

    let mut samples = Vec::new();
    for (size, iterations) in plan {
        debug!(rank = group.rank(), size, iterations, "measuring");
        if let Some(average_round_trip_us) = ping_pong(group, size, iterations)? {
            let sample = LatencySample {
                message_size_bytes: size,
                iterations,
                average_round_trip_us,
            };
            info!(
                size,
                iterations,
                round_trip_us = average_round_trip_us,
                one_way_us = sample.one_way_us(),
                "latency sample"
            );
            samples.push(sample);
        }
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_local;

    #[test]
    fn adaptive_policy_scales_down_with_size() {
        let policy = IterationPolicy::Adaptive {
            base: 1000,
            floor: 10,
        };
        assert_eq!(policy.iterations(0), 1000);
        assert_eq!(policy.iterations(1023), 1000);
        assert_eq!(policy.iterations(KIB), 500);
        assert_eq!(policy.iterations(4 * KIB), 200);
        assert_eq!(policy.iterations(KIB * KIB), 10);
        assert_eq!(IterationPolicy::Fixed(7).iterations(1 << 20), 7);
    }

    #[test]
    fn sweep_policy_drops_from_two_kib() {
        let policy = IterationPolicy::Scaled {
            base: 1000,
            floor: 10,
        };
        assert_eq!(policy.iterations(1), 1000);
        assert_eq!(policy.iterations(KIB), 1000);
        assert_eq!(policy.iterations(2 * KIB), 500);
        assert_eq!(policy.iterations(4 * KIB), 250);
        assert_eq!(policy.iterations(64 * KIB), 15);
        assert_eq!(policy.iterations(KIB * KIB), 10);

        let plan = LatencyConfig::default().plan().unwrap();
        assert_eq!(plan[10], (KIB, 1000));
        assert_eq!(plan[12], (4 * KIB, 250));
        assert_eq!(plan.last(), Some(&(8 * KIB * KIB, 10)));
    }

    #[test]
    fn powers_of_two_include_ceiling() {
        let config = LatencyConfig::powers_of_two(16, IterationPolicy::Fixed(1));
        assert_eq!(config.sizes, vec![1, 2, 4, 8, 16]);
        let config = LatencyConfig::powers_of_two(20, IterationPolicy::Fixed(1));
        assert_eq!(config.sizes.last(), Some(&16));

        let default = LatencyConfig::default();
        assert_eq!(default.sizes.len(), 24);
        assert_eq!(default.sizes.last(), Some(&(8 * KIB * KIB)));
    }

    #[test]
    fn landmarks_keep_a_floor_of_100() {
        let config = LatencyConfig::landmarks(1000);
        let plan = config.plan().unwrap();
        assert_eq!(plan, vec![(1, 1000), (1024, 500), (1 << 20, 100)]);
    }

    #[test]
    fn plan_sorts_and_deduplicates() {
        let config = LatencyConfig::new(vec![64, 0, 8, 64, 1], IterationPolicy::Fixed(3));
        let sizes: Vec<_> = config.plan().unwrap().into_iter().map(|p| p.0).collect();
        assert_eq!(sizes, vec![0, 1, 8, 64]);
    }

    #[test]
    fn plan_rejects_empty_or_zero_iterations() {
        assert!(LatencyConfig::new(vec![], IterationPolicy::Fixed(1))
            .plan()
            .unwrap_err()
            .is_configuration());
        assert!(LatencyConfig::new(vec![1], IterationPolicy::Fixed(0))
            .plan()
            .unwrap_err()
            .is_configuration());
        let starved = IterationPolicy::Adaptive { base: 1, floor: 0 };
        assert!(LatencyConfig::new(vec![1, 4096], starved)
            .plan()
            .unwrap_err()
            .is_configuration());
    }

    #[test]
    fn one_byte_thousand_iterations() {
        let config = LatencyConfig::new(vec![1], IterationPolicy::Fixed(1000));
        let out = run_local(2, |group| run_latency(&group, &config)).unwrap();

        let samples = out[0].as_ref().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].message_size_bytes, 1);
        assert_eq!(samples[0].iterations, 1000);
        assert!(samples[0].average_round_trip_us > 0.0);
        assert_eq!(samples[0].one_way_us(), samples[0].average_round_trip_us / 2.0);
        assert!(out[1].as_ref().unwrap().is_empty());
    }

    #[test]
    fn empty_messages_are_measured() {
        let out = run_local(2, |group| ping_pong(&group, 0, 10)).unwrap();
        assert!(out[0].as_ref().unwrap().unwrap() >= 0.0);
        assert_eq!(out[1].as_ref().unwrap(), &None);
    }

    #[test]
    fn wrong_group_size_fails_everywhere() {
        let config = LatencyConfig::new(vec![1], IterationPolicy::Fixed(10));
        for size in [1, 3] {
            let out = run_local(size, |group| run_latency(&group, &config)).unwrap();
            for r in out {
                assert!(r.unwrap_err().is_configuration());
            }
        }
    }

    #[test]
    fn zero_iterations_fail_before_timing() {
        let out = run_local(2, |group| {
            let result = ping_pong(&group, 8, 0);
            (result, group.sequence())
        })
        .unwrap();
        for (result, sequence) in out {
            assert!(result.unwrap_err().is_configuration());
            assert_eq!(sequence, 0);
        }
    }
}
