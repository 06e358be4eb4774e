//! In-process transport: one endpoint per thread, connected by channels.

use super::{deliver, Mailbox, Parcel, Transport};
use crate::datatype::DatatypeTag;
use crate::error::{Error, Result};
use crate::group::{Group, GroupConfig};
use crate::status::Status;
use crate::{Rank, Tag};
use std::cell::RefCell;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

/// Receive timeout applied by [`run_local`], so a rank that fails cannot hang
/// its peers forever.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(60);

/// Options for a [`LocalTransport`] mesh.
#[derive(Debug, Clone, Default)]
pub struct LocalConfig {
    /// Upper bound on a single receive. `None` waits forever.
    pub recv_timeout: Option<Duration>,
}

struct Envelope {
    source: Rank,
    tag: Tag,
    parcel: Parcel,
}

/// One endpoint of an in-process channel mesh.
///
/// Every endpoint owns a single inbox fed by all of its peers. Since each
/// peer sends from one thread, the inbox preserves per-source order, which
/// gives FIFO delivery per `(source, tag)`.
pub struct LocalTransport {
    rank: Rank,
    size: usize,
    /// Senders to every peer; `None` at our own index.
    peers: Vec<Option<Sender<Envelope>>>,
    inbox: Receiver<Envelope>,
    mailbox: RefCell<Mailbox>,
    config: LocalConfig,
}

impl LocalTransport {
    /// Build a fully connected mesh of `size` endpoints, indexed by rank.
    pub fn mesh(size: usize) -> Vec<Self> {
        Self::mesh_with_config(size, LocalConfig::default())
    }

    /// Build a mesh with explicit options.
    pub fn mesh_with_config(size: usize, config: LocalConfig) -> Vec<Self> {
        let (senders, inboxes): (Vec<_>, Vec<_>) = (0..size).map(|_| mpsc::channel()).unzip();

        // The originals in `senders` are dropped at the end of this function,
        // so an inbox disconnects once every peer endpoint is gone.
        inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalTransport {
                rank,
                size,
                peers: senders
                    .iter()
                    .enumerate()
                    .map(|(dest, tx)| (dest != rank).then(|| tx.clone()))
                    .collect(),
                inbox,
                mailbox: RefCell::new(Mailbox::default()),
                config: config.clone(),
            })
            .collect()
    }

    fn next_envelope(&self, source: Rank, tag: Tag, deadline: Option<Instant>) -> Result<Envelope> {
        match deadline {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                self.inbox.recv_timeout(wait).map_err(|e| match e {
                    RecvTimeoutError::Timeout => Error::Timeout { peer: source, tag },
                    RecvTimeoutError::Disconnected => Error::Disconnected(source),
                })
            }
            None => self.inbox.recv().map_err(|_| Error::Disconnected(source)),
        }
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, dest: Rank, tag: Tag, datatype: DatatypeTag, payload: &[u8]) -> Result<()> {
        Error::check_rank(dest, self.size)?;
        let parcel = Parcel {
            datatype,
            payload: payload.to_vec(),
        };
        match &self.peers[dest] {
            Some(tx) => tx
                .send(Envelope {
                    source: self.rank,
                    tag,
                    parcel,
                })
                .map_err(|_| Error::Disconnected(dest)),
            None => {
                self.mailbox.borrow_mut().push(self.rank, tag, parcel);
                Ok(())
            }
        }
    }

    fn recv(
        &self,
        source: Rank,
        tag: Tag,
        datatype: DatatypeTag,
        buf: &mut [u8],
    ) -> Result<Status> {
        Error::check_rank(source, self.size)?;
        if let Some(parcel) = self.mailbox.borrow_mut().take(source, tag) {
            return deliver(source, tag, datatype, parcel.datatype, &parcel.payload, buf);
        }
        if source == self.rank {
            // Nothing was looped back and nobody else can produce it.
            return Err(Error::Timeout { peer: source, tag });
        }

        let deadline = self.config.recv_timeout.map(|t| Instant::now() + t);
        loop {
            let envelope = self.next_envelope(source, tag, deadline)?;
            if envelope.source == source && envelope.tag == tag {
                let parcel = envelope.parcel;
                return deliver(source, tag, datatype, parcel.datatype, &parcel.payload, buf);
            }
            self.mailbox
                .borrow_mut()
                .push(envelope.source, envelope.tag, envelope.parcel);
        }
    }
}

/// Run an SPMD closure on `size` threads, one [`Group`] per thread, and
/// collect the per-rank results in rank order.
///
/// Receives are bounded by [`DEFAULT_RECV_TIMEOUT`]. A panic on any rank is
/// resumed on the calling thread.
///
/// # Example
///
/// ```
/// use ferrolink::{run_local, ReduceOp};
///
/// let sums = run_local(4, |group| {
///     group.reduce_scalar(group.rank() as u64, ReduceOp::Sum, 0)
/// })
/// .unwrap();
///
/// assert_eq!(sums[0].as_ref().unwrap(), &Some(6));
/// assert_eq!(sums[1].as_ref().unwrap(), &None);
/// ```
pub fn run_local<F, R>(size: usize, f: F) -> Result<Vec<R>>
where
    F: Fn(Group<LocalTransport>) -> R + Sync,
    R: Send,
{
    let local = LocalConfig {
        recv_timeout: Some(DEFAULT_RECV_TIMEOUT),
    };
    run_local_with(size, local, GroupConfig::default(), f)
}

/// [`run_local`] with explicit transport and group options.
pub fn run_local_with<F, R>(
    size: usize,
    local: LocalConfig,
    config: GroupConfig,
    f: F,
) -> Result<Vec<R>>
where
    F: Fn(Group<LocalTransport>) -> R + Sync,
    R: Send,
{
    if size == 0 {
        return Err(Error::config("group size must be positive"));
    }
    let groups = LocalTransport::mesh_with_config(size, local)
        .into_iter()
        .map(|transport| Group::with_config(transport.rank(), size, transport, config.clone()))
        .collect::<Result<Vec<_>>>()?;

    let f = &f;
    std::thread::scope(|scope| -> Result<Vec<R>> {
        let handles = groups
            .into_iter()
            .map(|group| {
                std::thread::Builder::new()
                    .name(format!("rank-{}", group.rank()))
                    .spawn_scoped(scope, move || f(group))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
            })
            .collect())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const B: DatatypeTag = DatatypeTag::U8;

    fn pair() -> (LocalTransport, LocalTransport) {
        let mut mesh = LocalTransport::mesh_with_config(
            2,
            LocalConfig {
                recv_timeout: Some(Duration::from_secs(5)),
            },
        );
        let b = mesh.pop().unwrap();
        let a = mesh.pop().unwrap();
        (a, b)
    }

    #[test]
    fn mesh_assigns_ranks_in_order() {
        let mesh = LocalTransport::mesh(3);
        for (i, t) in mesh.iter().enumerate() {
            assert_eq!(t.rank(), i);
            assert_eq!(t.size(), 3);
        }
    }

    #[test]
    fn send_then_recv() {
        let (a, b) = pair();
        a.send(1, 3, B, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        let status = b.recv(0, 3, B, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(status.count, 3);
        assert_eq!(status.source, 0);
    }

    #[test]
    fn out_of_order_tags_are_stashed() {
        let (a, b) = pair();
        a.send(1, 1, B, &[10]).unwrap();
        a.send(1, 2, B, &[20]).unwrap();
        a.send(1, 1, B, &[11]).unwrap();

        let mut buf = [0u8; 1];
        b.recv(0, 2, B, &mut buf).unwrap();
        assert_eq!(buf, [20]);
        b.recv(0, 1, B, &mut buf).unwrap();
        assert_eq!(buf, [10]);
        b.recv(0, 1, B, &mut buf).unwrap();
        assert_eq!(buf, [11]);
    }

    #[test]
    fn self_messages_loop_back() {
        let (a, _b) = pair();
        a.send(0, 4, B, &[7, 7]).unwrap();
        let mut buf = [0u8; 2];
        a.recv(0, 4, B, &mut buf).unwrap();
        assert_eq!(buf, [7, 7]);
    }

    #[test]
    fn size_mismatch_consumes_message() {
        let (a, b) = pair();
        a.send(1, 0, B, &[1, 2, 3, 4]).unwrap();
        a.send(1, 0, B, &[5, 6]).unwrap();
        let mut small = [0u8; 2];
        assert!(matches!(
            b.recv(0, 0, B, &mut small),
            Err(Error::SizeMismatch {
                expected: 2,
                actual: 4
            })
        ));
        b.recv(0, 0, B, &mut small).unwrap();
        assert_eq!(small, [5, 6]);
    }

    #[test]
    fn type_mismatch_consumes_message() {
        let (a, b) = pair();
        a.send(1, 0, DatatypeTag::F64, &1.5f64.to_le_bytes()).unwrap();
        a.send(1, 0, DatatypeTag::U64, &7u64.to_le_bytes()).unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(
            b.recv(0, 0, DatatypeTag::U64, &mut buf),
            Err(Error::TypeMismatch {
                expected: DatatypeTag::U64,
                actual: DatatypeTag::F64
            })
        ));
        b.recv(0, 0, DatatypeTag::U64, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 7);
    }

    #[test]
    fn unknown_rank_is_unreachable() {
        let (a, _b) = pair();
        assert!(matches!(
            a.send(2, 0, B, &[]),
            Err(Error::Unreachable { rank: 2, size: 2 })
        ));
        let mut buf = [0u8; 0];
        assert!(matches!(
            a.recv(5, 0, B, &mut buf),
            Err(Error::Unreachable { rank: 5, size: 2 })
        ));
    }

    #[test]
    fn recv_times_out() {
        let mut mesh = LocalTransport::mesh_with_config(
            2,
            LocalConfig {
                recv_timeout: Some(Duration::from_millis(20)),
            },
        );
        let _b = mesh.pop().unwrap();
        let a = mesh.pop().unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(
            a.recv(1, 9, B, &mut buf),
            Err(Error::Timeout { peer: 1, tag: 9 })
        ));
    }

    #[test]
    fn dropped_peer_disconnects() {
        let (a, b) = pair();
        drop(b);
        assert!(matches!(a.send(1, 0, B, &[1]), Err(Error::Disconnected(1))));
        let mut buf = [0u8; 1];
        assert!(matches!(a.recv(1, 0, B, &mut buf), Err(Error::Disconnected(1))));
    }

    #[test]
    fn run_local_collects_in_rank_order() {
        let ranks = run_local(5, |group| group.rank()).unwrap();
        assert_eq!(ranks, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn run_local_rejects_empty_group() {
        assert!(run_local(0, |group| group.rank())
            .unwrap_err()
            .is_configuration());
    }
}
