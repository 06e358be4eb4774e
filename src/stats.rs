//! Distributed statistics pipeline.
//!
//! Every rank runs [`run_statistics`] with the same configuration:
//!
//! 1. The array length is validated against the group size on every rank,
//!    before any communication.
//! 2. Root fills the dataset from a [`SampleSource`] and announces the chunk
//!    length; all ranks confirm they computed the same value.
//! 3. The dataset is scattered; each rank computes [`LocalStats`] over its
//!    chunk.
//! 4. Min, max, sum and count are reduced to root, which derives the average.
//! 5. The chunks are gathered back and root checks the reconstruction
//!    against the original dataset.

use crate::error::{Error, Result};
use crate::group::Group;
use crate::transport::Transport;
use crate::{Rank, ReduceOp};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

/// Source of the values root distributes.
pub trait SampleSource {
    /// Fill `out` with the next `out.len()` values.
    fn fill(&mut self, out: &mut [f64]);
}

impl<F: FnMut() -> f64> SampleSource for F {
    fn fill(&mut self, out: &mut [f64]) {
        for x in out {
            *x = self();
        }
    }
}

/// Uniformly distributed values from a seeded generator.
///
/// The same seed always yields the same sequence.
#[derive(Debug, Clone)]
pub struct UniformSource {
    rng: StdRng,
    low: f64,
    high: f64,
}

impl UniformSource {
    /// Values in `[0, 100)`.
    pub fn seeded(seed: u64) -> Self {
        Self::with_range(seed, 0.0, 100.0)
    }

    /// Values in `[low, high)`.
    pub fn with_range(seed: u64, low: f64, high: f64) -> Self {
        UniformSource {
            rng: StdRng::seed_from_u64(seed),
            low,
            high,
        }
    }
}

impl SampleSource for UniformSource {
    fn fill(&mut self, out: &mut [f64]) {
        for x in out {
            *x = self.rng.gen_range(self.low..self.high);
        }
    }
}

/// Closeness test `|found - expected| <= absolute + relative * |expected|`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    /// Relative part, scaled by the expected value
    pub relative: f64,
    /// Absolute floor
    pub absolute: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Tolerance {
            relative: 1e-9,
            absolute: 1e-9,
        }
    }
}

impl Tolerance {
    /// Whether `found` is close enough to `expected`.
    pub fn close(&self, found: f64, expected: f64) -> bool {
        (found - expected).abs() <= self.absolute + self.relative * expected.abs()
    }
}

/// Pipeline settings, identical on every rank.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Number of elements in the dataset.
    pub len: usize,
    /// Seed for [`UniformSource`] when the caller builds one from this config.
    pub seed: u64,
    /// Rank that generates the data and receives the results.
    pub root: Rank,
    /// Tolerance of the gather verification.
    pub tolerance: Tolerance,
}

impl StatsConfig {
    /// Settings for a dataset of `len` elements, seed 42, root 0.
    pub fn new(len: usize) -> Self {
        StatsConfig {
            len,
            seed: 42,
            root: 0,
            tolerance: Tolerance::default(),
        }
    }

    /// The source this configuration describes.
    pub fn source(&self) -> UniformSource {
        UniformSource::seeded(self.seed)
    }
}

/// Min, max, sum and count over one chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalStats {
    /// Smallest value (`+inf` for an empty chunk)
    pub min: f64,
    /// Largest value (`-inf` for an empty chunk)
    pub max: f64,
    /// Sum of values
    pub sum: f64,
    /// Number of values
    pub count: u64,
}

impl LocalStats {
    /// Compute over `chunk`.
    pub fn from_chunk(chunk: &[f64]) -> Self {
        chunk.iter().fold(
            LocalStats {
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                sum: 0.0,
                count: 0,
            },
            |acc, &x| LocalStats {
                min: acc.min.min(x),
                max: acc.max.max(x),
                sum: acc.sum + x,
                count: acc.count + 1,
            },
        )
    }

    /// Mean of the chunk, `NaN` when empty.
    pub fn average(&self) -> f64 {
        self.sum / self.count as f64
    }
}

/// Result of comparing the gathered array with the original.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verification {
    /// Every element matched within tolerance.
    Passed,
    /// First element that did not match.
    Failed {
        /// Position in the array
        index: usize,
        /// Original value
        expected: f64,
        /// Gathered value
        found: f64,
    },
}

impl Verification {
    /// Whether the reconstruction matched.
    pub fn passed(&self) -> bool {
        matches!(self, Verification::Passed)
    }
}

/// Group-wide results, held by root only.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalStats {
    /// Global minimum
    pub min: f64,
    /// Global maximum
    pub max: f64,
    /// Global sum
    pub sum: f64,
    /// Total number of elements processed
    pub count: u64,
    /// `sum / count`
    pub average: f64,
    /// Outcome of the gather round trip
    pub verification: Verification,
}

/// What one rank gets back from [`run_statistics`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatsOutcome {
    /// Statistics over this rank's chunk.
    pub local: LocalStats,
    /// Elements per rank.
    pub chunk_len: usize,
    /// Group-wide statistics; `Some` only at root.
    pub global: Option<GlobalStats>,
}

/// Elements per rank for an array of `len` over `size` ranks.
///
/// Depends only on its inputs, so every rank reaches the same verdict
/// without communicating.
pub fn chunk_len(len: usize, size: usize) -> Result<usize> {
    if size == 0 {
        return Err(Error::config("group size must be positive"));
    }
    if len == 0 {
        return Err(Error::config("array length must be positive"));
    }
    if len % size != 0 {
        return Err(Error::config(format!(
            "array length ({len}) must be divisible by the number of ranks ({size})"
        )));
    }
    Ok(len / size)
}

/// Compare `found` with `expected` element by element.
pub fn verify(expected: &[f64], found: &[f64], tolerance: Tolerance) -> Verification {
    if expected.len() != found.len() {
        let index = expected.len().min(found.len());
        return Verification::Failed {
            index,
            expected: expected.get(index).copied().unwrap_or(f64::NAN),
            found: found.get(index).copied().unwrap_or(f64::NAN),
        };
    }
    expected
        .iter()
        .zip(found)
        .position(|(&e, &f)| !tolerance.close(f, e))
        .map_or(Verification::Passed, |index| Verification::Failed {
            index,
            expected: expected[index],
            found: found[index],
        })
}

/// Run the statistics pipeline. Every rank must call this with the same
/// `config`; `source` is only consulted at root.
pub fn run_statistics<T, S>(
    group: &Group<T>,
    config: &StatsConfig,
    source: &mut S,
) -> Result<StatsOutcome>
where
    T: Transport,
    S: SampleSource + ?Sized,
{
    let chunk = chunk_len(config.len, group.size())?;
    let root = config.root;
    if root >= group.size() {
        return Err(Error::config(format!(
            "root {root} is outside a group of size {}",
            group.size()
        )));
    }

    let dataset = if group.is_root(root) {
        let mut data = vec![0.0; config.len];
        source.fill(&mut data);
        info!(
            len = config.len,
            ranks = group.size(),
            chunk,
            "dataset generated"
        );
        data
    } else {
        Vec::new()
    };

    let announced = group.broadcast_scalar(chunk as u64, root)?;
    if group.any(announced != chunk as u64)? {
        return Err(Error::config(format!(
            "ranks disagree on the chunk length (root announced {announced}, rank {} computed {chunk})",
            group.rank()
        )));
    }

    let mut local = vec![0.0; chunk];
    group.scatter(&dataset, &mut local, root)?;

    let stats = LocalStats::from_chunk(&local);
    info!(
        rank = group.rank(),
        min = stats.min,
        max = stats.max,
        average = stats.average(),
        "local statistics"
    );

    let min = group.reduce_scalar(stats.min, ReduceOp::Min, root)?;
    let max = group.reduce_scalar(stats.max, ReduceOp::Max, root)?;
    let sum = group.reduce_scalar(stats.sum, ReduceOp::Sum, root)?;
    let count = group.reduce_scalar(stats.count, ReduceOp::Sum, root)?;

    let mut reconstructed = if group.is_root(root) {
        vec![0.0; config.len]
    } else {
        Vec::new()
    };
    group.gather(&local, &mut reconstructed, root)?;

    let global = match (min, max, sum, count) {
        (Some(min), Some(max), Some(sum), Some(count)) => {
            let verification = verify(&dataset, &reconstructed, config.tolerance);
            if let Verification::Failed {
                index,
                expected,
                found,
            } = verification
            {
                warn!(index, expected, found, "gathered array differs from the original");
            }
            let average = sum / count as f64;
            info!(min, max, average, count, verified = verification.passed(), "global statistics");
            Some(GlobalStats {
                min,
                max,
                sum,
                count,
                average,
                verification,
            })
        }
        _ => None,
    };

    Ok(StatsOutcome {
        local: stats,
        chunk_len: chunk,
        global,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_len_validation() {
        assert_eq!(chunk_len(16, 4).unwrap(), 4);
        assert_eq!(chunk_len(7, 1).unwrap(), 7);
        assert!(chunk_len(15, 4).unwrap_err().is_configuration());
        assert!(chunk_len(0, 4).unwrap_err().is_configuration());
        assert!(chunk_len(4, 0).unwrap_err().is_configuration());
    }

    #[test]
    fn local_stats_over_chunk() {
        let stats = LocalStats::from_chunk(&[3.0, -1.0, 4.0, 1.5]);
        assert_eq!(stats.min, -1.0);
        assert_eq!(stats.max, 4.0);
        assert_eq!(stats.sum, 7.5);
        assert_eq!(stats.count, 4);
        assert!((stats.average() - 1.875).abs() < 1e-12);
    }

    #[test]
    fn empty_chunk_yields_identities() {
        let stats = LocalStats::from_chunk(&[]);
        assert_eq!(stats.min, f64::INFINITY);
        assert_eq!(stats.max, f64::NEG_INFINITY);
        assert_eq!(stats.count, 0);
        assert!(stats.average().is_nan());
    }

    #[test]
    fn uniform_source_is_reproducible_and_in_range() {
        let mut a = vec![0.0; 64];
        let mut b = vec![0.0; 64];
        UniformSource::seeded(42).fill(&mut a);
        UniformSource::seeded(42).fill(&mut b);
        assert_eq!(a, b);
        assert!(a.iter().all(|&x| (0.0..100.0).contains(&x)));

        let mut c = vec![0.0; 64];
        UniformSource::seeded(43).fill(&mut c);
        assert_ne!(a, c);
    }

    #[test]
    fn closures_are_sources() {
        let mut next = 0.0;
        let mut counter = || {
            next += 1.0;
            next
        };
        let mut out = [0.0; 3];
        counter.fill(&mut out);
        assert_eq!(out, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn tolerance_is_relative_plus_absolute() {
        let tol = Tolerance::default();
        assert!(tol.close(1e6 + 1e-4, 1e6));
        assert!(!tol.close(1e6 + 1e-2, 1e6));
        assert!(tol.close(0.0, 1e-10));
    }

    #[test]
    fn verify_reports_first_mismatch() {
        let tol = Tolerance::default();
        assert_eq!(verify(&[1.0, 2.0], &[1.0, 2.0], tol), Verification::Passed);
        assert_eq!(
            verify(&[1.0, 2.0, 3.0], &[1.0, 2.5, 9.0], tol),
            Verification::Failed {
                index: 1,
                expected: 2.0,
                found: 2.5
            }
        );
        assert!(!verify(&[1.0, 2.0], &[1.0], tol).passed());
    }
}
