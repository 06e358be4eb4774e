//! Point-to-point transports.
//!
//! A [`Transport`] moves tagged byte messages between the ranks of one group.
//! Each message also carries the [`DatatypeTag`] of its elements; a receive
//! expecting another element type fails with [`Error::TypeMismatch`].
//! Delivery is reliable and FIFO per `(source, tag)`; a receive for one tag
//! never consumes a message carrying another, which is parked in a
//! [`Mailbox`] until somebody asks for it.
//!
//! Two implementations ship with the crate:
//!
//! - [`LocalTransport`](local::LocalTransport): in-process channel mesh, one
//!   endpoint per thread.
//! - [`TcpTransport`](tcp::TcpTransport): full TCP mesh, one endpoint per
//!   process.

pub mod local;
pub mod tcp;

use crate::datatype::DatatypeTag;
use crate::error::{Error, Result};
use crate::status::Status;
use crate::{Rank, Tag};
use std::collections::{HashMap, VecDeque};

/// Reliable, ordered, tagged byte delivery between the ranks of one group.
///
/// Implementations use interior mutability for their receive state and are
/// owned by a single thread.
pub trait Transport {
    /// Rank of this endpoint.
    fn rank(&self) -> Rank;

    /// Number of endpoints in the mesh.
    fn size(&self) -> usize;

    /// Hand `payload`, encoded elements of type `datatype`, to the transport
    /// for delivery to `dest`.
    ///
    /// Returns once the payload has been handed off; `payload` may be reused
    /// immediately afterwards.
    fn send(&self, dest: Rank, tag: Tag, datatype: DatatypeTag, payload: &[u8]) -> Result<()>;

    /// Block until a message from `source` with `tag` has filled `buf`.
    ///
    /// The message is consumed either way. Returns [`Error::TypeMismatch`] if
    /// it was sent as another datatype and [`Error::SizeMismatch`] if its
    /// length differs from `buf.len()`. The returned [`Status::count`] is in
    /// bytes.
    fn recv(&self, source: Rank, tag: Tag, datatype: DatatypeTag, buf: &mut [u8])
        -> Result<Status>;
}

/// A received message body with the element type it was sent as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Parcel {
    pub(crate) datatype: DatatypeTag,
    pub(crate) payload: Vec<u8>,
}

/// Messages that arrived before anyone asked for them, keyed by
/// `(source, tag)`.
#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    pending: HashMap<(Rank, Tag), VecDeque<Parcel>>,
}

impl Mailbox {
    pub(crate) fn push(&mut self, source: Rank, tag: Tag, parcel: Parcel) {
        self.pending
            .entry((source, tag))
            .or_default()
            .push_back(parcel);
    }

    pub(crate) fn take(&mut self, source: Rank, tag: Tag) -> Option<Parcel> {
        let queue = self.pending.get_mut(&(source, tag))?;
        let payload = queue.pop_front();
        if queue.is_empty() {
            self.pending.remove(&(source, tag));
        }
        payload
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }
}

/// Copy a delivered payload into the caller's buffer.
pub(crate) fn deliver(
    source: Rank,
    tag: Tag,
    expected: DatatypeTag,
    actual: DatatypeTag,
    payload: &[u8],
    buf: &mut [u8],
) -> Result<Status> {
    if expected != actual {
        return Err(Error::TypeMismatch { expected, actual });
    }
    if payload.len() != buf.len() {
        return Err(Error::SizeMismatch {
            expected: buf.len(),
            actual: payload.len(),
        });
    }
    buf.copy_from_slice(payload);
    Ok(Status {
        source,
        tag,
        count: payload.len(),
    })
}
