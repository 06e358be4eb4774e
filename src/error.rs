//! Error types for ferrolink

use crate::datatype::DatatypeTag;
use crate::{Rank, Tag};
use thiserror::Error;

/// Result type for ferrolink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for transport, group and collective operations
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input shared by every rank (argument, group size, environment).
    ///
    /// Every rank detects this from the same inputs, so the whole group can
    /// exit together.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Receive buffer length does not match the sent length
    #[error("Size mismatch: buffer holds {expected} bytes, message carries {actual}")]
    SizeMismatch {
        /// Length the receiver was prepared for
        expected: usize,
        /// Length actually delivered
        actual: usize,
    },

    /// Message elements are of a different type than the receive buffer
    #[error("Type mismatch: buffer holds {expected:?}, message carries {actual:?}")]
    TypeMismatch {
        /// Element type of the receive buffer
        expected: DatatypeTag,
        /// Element type the sender used
        actual: DatatypeTag,
    },

    /// Full buffer of a scatter/gather is not `parts` equal chunks
    #[error("Buffer of {len} elements cannot be split into {parts} equal chunks")]
    NotDivisible {
        /// Length of the full buffer
        len: usize,
        /// Number of ranks in the group
        parts: usize,
    },

    /// Rank outside the group
    #[error("Rank {rank} is unreachable in a group of size {size}")]
    Unreachable {
        /// Offending rank
        rank: Rank,
        /// Group size
        size: usize,
    },

    /// Ranks issued different collective call sequences
    #[error("Protocol mismatch at collective #{sequence}: {detail}")]
    ProtocolMismatch {
        /// Sequence number of the collective call where divergence was seen
        sequence: u64,
        /// What differed
        detail: String,
    },

    /// Negative tags are reserved for collectives
    #[error("Invalid tag: {0} (user tags must be non-negative)")]
    InvalidTag(Tag),

    /// Receive timed out at the transport layer
    #[error("Timed out waiting for tag {tag} from rank {peer}")]
    Timeout {
        /// Rank we were waiting on
        peer: Rank,
        /// Tag we were waiting for
        tag: Tag,
    },

    /// Peer endpoint went away
    #[error("Rank {0} disconnected")]
    Disconnected(Rank),

    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is a configuration problem that every rank reports
    /// identically (and therefore should lead to a coordinated exit).
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::InvalidConfiguration(_))
    }

    /// Shorthand for building an [`Error::InvalidConfiguration`].
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::InvalidConfiguration(msg.into())
    }

    /// Check a peer rank against the group size.
    pub(crate) fn check_rank(rank: Rank, size: usize) -> Result<()> {
        if rank < size {
            Ok(())
        } else {
            Err(Error::Unreachable { rank, size })
        }
    }
}
