//! # ferrolink
//!
//! A minimal message-passing runtime for a fixed group of cooperating ranks.
//!
//! This crate provides:
//! - Tagged, reliable, FIFO point-to-point messaging over pluggable transports
//!   (in-process channels or a TCP mesh)
//! - Type-safe generic collectives: barrier, broadcast, scatter, gather, reduce
//! - Optional collective-sequence verification that turns divergent call
//!   sequences into an error instead of a hang
//! - A distributed statistics pipeline (scatter, local stats, reduce, gather)
//! - A ping-pong latency harness
//!
//! ## Supported Types
//!
//! All communication operations are generic over [`Datatype`]:
//! `f32`, `f64`, `i32`, `i64`, `u8`, `u32`, `u64`
//!
//! ## Quick Start
//!
//! ```
//! use ferrolink::{run_local, ReduceOp};
//!
//! let results = run_local(4, |group| -> ferrolink::Result<Option<f64>> {
//!     let rank = group.rank();
//!
//!     // Generic broadcast, works with any Datatype
//!     let mut data = vec![0.0f64; 8];
//!     if rank == 0 {
//!         data.fill(42.0);
//!     }
//!     group.broadcast(&mut data, 0)?;
//!
//!     // Sum of all ranks, delivered to rank 0 only
//!     group.reduce_scalar(rank as f64, ReduceOp::Sum, 0)
//! })
//! .unwrap();
//!
//! assert_eq!(results[0].as_ref().unwrap(), &Some(6.0));
//! ```
//!
//! Across processes, build the group from the launcher's environment with
//! [`LaunchInfo`] and a [`TcpTransport`].
//!
//! ## Logging
//!
//! The library emits [`tracing`] events; call [`logging::init`] (or install
//! your own subscriber) to see them.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]

mod collective;
mod datatype;
mod error;
mod group;
pub mod latency;
pub mod launch;
pub mod logging;
pub mod stats;
mod status;
pub mod transport;

pub use datatype::{Datatype, DatatypeTag};
pub use error::{Error, Result};
pub use group::{Group, GroupConfig};
pub use latency::{IterationPolicy, LatencyConfig, LatencySample};
pub use launch::LaunchInfo;
pub use stats::{GlobalStats, LocalStats, SampleSource, StatsConfig, StatsOutcome, UniformSource};
pub use status::Status;
pub use transport::local::{run_local, run_local_with, LocalConfig, LocalTransport};
pub use transport::tcp::{TcpConfig, TcpTransport};
pub use transport::Transport;

use std::sync::OnceLock;
use std::time::Instant;

/// Identity of a process within a group, in `[0, size)`.
pub type Rank = usize;

/// Message tag. Non-negative values are free for users; negative values are
/// reserved for collectives.
pub type Tag = i32;

/// Reduction operations
///
/// Every operator is associative and commutative. Counting is a [`Sum`]
/// over an integer type.
///
/// [`Sum`]: ReduceOp::Sum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Sum of values
    Sum,
    /// Maximum value
    Max,
    /// Minimum value
    Min,
}

impl ReduceOp {
    /// Combine two values.
    pub fn apply<D: Datatype>(self, a: D, b: D) -> D {
        D::combine(self, a, b)
    }
}

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Get the current wall-clock time in seconds.
///
/// Monotonic and high-resolution, suitable for benchmarking. Only
/// differences between two readings in the same process are meaningful.
pub fn wtime() -> f64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}
