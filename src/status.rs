//! Message status information.
//!
//! This module provides the [`Status`] struct returned by receive operations,
//! describing the message that satisfied the receive.

use crate::{Rank, Tag};

/// Information about a received message.
///
/// Returned by [`Transport::recv`](crate::Transport::recv), where `count` is
/// in bytes, and by [`Group::recv`](crate::Group::recv), where `count` is in
/// elements of the receive buffer's type.
///
/// # Example
///
/// ```
/// use ferrolink::run_local;
///
/// let statuses = run_local(2, |group| {
///     if group.rank() == 0 {
///         group.send(&[1.0f64, 2.0], 1, 7).map(|()| None)
///     } else {
///         let mut buf = [0.0f64; 2];
///         group.recv(&mut buf, 0, 7).map(Some)
///     }
/// })
/// .unwrap();
///
/// let status = statuses[1].as_ref().unwrap().as_ref().unwrap();
/// assert_eq!((status.source, status.tag, status.count), (0, 7, 2));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Source rank of the message.
    pub source: Rank,
    /// Tag of the message.
    pub tag: Tag,
    /// Size of the message.
    pub count: usize,
}
