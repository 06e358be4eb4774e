//! Process groups: a fixed set of ranks sharing one transport.

use crate::datatype::{decode_into, encode, Datatype};
use crate::error::{Error, Result};
use crate::status::Status;
use crate::transport::Transport;
use crate::{Rank, Tag};
use std::cell::Cell;
use std::fmt;
use tracing::{debug, warn};

/// Tags reserved for collective traffic. User tags are non-negative.
pub(crate) mod tags {
    use crate::Tag;

    pub const BARRIER: Tag = -1;
    pub const BROADCAST: Tag = -2;
    pub const SCATTER: Tag = -3;
    pub const GATHER: Tag = -4;
    pub const REDUCE: Tag = -5;
    pub const CHECK: Tag = -6;
    pub const CHECK_FLAG: Tag = -7;
    pub const ANY: Tag = -8;
}

/// Options for a [`Group`].
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Exchange a fingerprint of every collective call before running it, so
    /// that ranks issuing different collective sequences fail with
    /// [`Error::ProtocolMismatch`] instead of hanging.
    ///
    /// Defaults to on in debug builds and off in release builds.
    pub verify_collectives: bool,
}

impl Default for GroupConfig {
    fn default() -> Self {
        GroupConfig {
            verify_collectives: cfg!(debug_assertions),
        }
    }
}

/// Collective operations, as recorded in a call fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub(crate) enum Collective {
    Barrier = 1,
    Broadcast = 2,
    Scatter = 3,
    Gather = 4,
    Reduce = 5,
    Any = 6,
}

impl Collective {
    fn name_of(code: u64) -> &'static str {
        match code {
            1 => "barrier",
            2 => "broadcast",
            3 => "scatter",
            4 => "gather",
            5 => "reduce",
            6 => "any",
            _ => "unknown",
        }
    }
}

/// A root-side precondition failure, shared with the other ranks during
/// verification so that every rank reports the same error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
    NotDivisible { len: usize, parts: usize },
    SizeMismatch { expected: usize, actual: usize },
}

/// Verdict code for a fingerprint mismatch; outranks every rejection.
const DIVERGED: u64 = 3;

impl Rejection {
    fn to_words(self) -> [u64; 3] {
        match self {
            Rejection::NotDivisible { len, parts } => [1, len as u64, parts as u64],
            Rejection::SizeMismatch { expected, actual } => [2, expected as u64, actual as u64],
        }
    }

    fn from_words(words: [u64; 3]) -> Option<Self> {
        let (a, b) = (words[1] as usize, words[2] as usize);
        match words[0] {
            1 => Some(Rejection::NotDivisible { len: a, parts: b }),
            2 => Some(Rejection::SizeMismatch {
                expected: a,
                actual: b,
            }),
            _ => None,
        }
    }

    pub(crate) fn into_error(self) -> Error {
        match self {
            Rejection::NotDivisible { len, parts } => Error::NotDivisible { len, parts },
            Rejection::SizeMismatch { expected, actual } => Error::SizeMismatch { expected, actual },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    sequence: u64,
    op: u64,
    root: u64,
    count: u64,
}

impl Fingerprint {
    fn to_words(self) -> [u64; 4] {
        [self.sequence, self.op, self.root, self.count]
    }

    fn from_words(words: [u64; 4]) -> Self {
        Fingerprint {
            sequence: words[0],
            op: words[1],
            root: words[2],
            count: words[3],
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {}(root={}, count={})",
            self.sequence,
            Collective::name_of(self.op),
            self.root,
            self.count
        )
    }
}

/// A fixed group of ranks.
///
/// The group is the explicit handle every operation goes through; there is
/// no process-wide communicator. All ranks of a group must issue the same
/// collective calls in the same order with matching shapes.
///
/// # Example
///
/// ```
/// use ferrolink::run_local;
///
/// let ranks = run_local(3, |group| {
///     group.barrier()?;
///     Ok::<_, ferrolink::Error>((group.rank(), group.size()))
/// })
/// .unwrap();
///
/// assert_eq!(ranks[2].as_ref().unwrap(), &(2, 3));
/// ```
pub struct Group<T: Transport> {
    transport: T,
    rank: Rank,
    size: usize,
    config: GroupConfig,
    /// Number of collective calls issued so far.
    sequence: Cell<u64>,
}

impl<T: Transport> Group<T> {
    /// Create a group with default options.
    pub fn new(rank: Rank, size: usize, transport: T) -> Result<Self> {
        Self::with_config(rank, size, transport, GroupConfig::default())
    }

    /// Create a group.
    ///
    /// Fails with [`Error::InvalidConfiguration`] unless `0 <= rank < size`
    /// and the transport agrees on both values.
    pub fn with_config(rank: Rank, size: usize, transport: T, config: GroupConfig) -> Result<Self> {
        if size == 0 {
            return Err(Error::config("group size must be positive"));
        }
        if rank >= size {
            return Err(Error::config(format!(
                "rank {rank} is outside a group of size {size}"
            )));
        }
        if transport.rank() != rank || transport.size() != size {
            return Err(Error::config(format!(
                "transport is rank {} of {}, group expects rank {rank} of {size}",
                transport.rank(),
                transport.size()
            )));
        }
        Ok(Group {
            transport,
            rank,
            size,
            config,
            sequence: Cell::new(0),
        })
    }

    /// Rank of the calling process.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of ranks in the group.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the calling process is `root`.
    pub fn is_root(&self, root: Rank) -> bool {
        self.rank == root
    }

    /// Number of collective calls issued so far.
    pub fn sequence(&self) -> u64 {
        self.sequence.get()
    }

    // ========================================================================
    // Point-to-Point Communication
    // ========================================================================

    /// Send a slice to another rank.
    ///
    /// `tag` must be non-negative.
    pub fn send<D: Datatype>(&self, data: &[D], dest: Rank, tag: Tag) -> Result<()> {
        check_user_tag(tag)?;
        self.send_raw(data, dest, tag)
    }

    /// Receive a slice from another rank.
    ///
    /// The message must carry exactly `data.len()` elements of type `D`.
    /// A message sent as another element type fails with
    /// [`Error::TypeMismatch`] and is consumed. The returned
    /// [`Status::count`] is in elements.
    pub fn recv<D: Datatype>(&self, data: &mut [D], source: Rank, tag: Tag) -> Result<Status> {
        check_user_tag(tag)?;
        self.recv_raw(data, source, tag)
    }

    pub(crate) fn send_raw<D: Datatype>(&self, data: &[D], dest: Rank, tag: Tag) -> Result<()> {
        self.transport.send(dest, tag, D::TAG, &encode(data))
    }

    pub(crate) fn recv_raw<D: Datatype>(
        &self,
        data: &mut [D],
        source: Rank,
        tag: Tag,
    ) -> Result<Status> {
        let status = match D::as_wire_mut(data) {
            Some(bytes) => self.transport.recv(source, tag, D::TAG, bytes)?,
            None => {
                let mut bytes = vec![0u8; data.len() * D::SIZE];
                let status = self.transport.recv(source, tag, D::TAG, &mut bytes)?;
                decode_into(&bytes, data);
                status
            }
        };
        Ok(Status {
            count: data.len(),
            ..status
        })
    }

    // ========================================================================
    // Synchronization
    // ========================================================================

    /// Barrier synchronization.
    ///
    /// All ranks in the group must call this function. No rank returns until
    /// every rank has entered the barrier. Uses the dissemination algorithm:
    /// `ceil(log2(size))` rounds, one token out and one in per round.
    pub fn barrier(&self) -> Result<()> {
        self.begin(Collective::Barrier, 0, 0, None)?;
        self.dissemination_or(tags::BARRIER, false)?;
        Ok(())
    }

    /// Logical OR of `flag` over all ranks, returned on every rank.
    ///
    /// All ranks must call this. Lets a group agree on whether any member
    /// hit a condition, so every rank takes the same exit path.
    pub fn any(&self, flag: bool) -> Result<bool> {
        self.begin(Collective::Any, 0, 1, None)?;
        self.dissemination_or(tags::ANY, flag)
    }

    /// OR a flag across every rank using dissemination rounds.
    fn dissemination_or(&self, tag: Tag, mut flag: bool) -> Result<bool> {
        let mut distance = 1;
        while distance < self.size {
            let to = (self.rank + distance) % self.size;
            let from = (self.rank + self.size - distance) % self.size;
            self.send_raw(&[u8::from(flag)], to, tag)?;
            let mut token = [0u8; 1];
            self.recv_raw(&mut token, from, tag)?;
            flag |= token[0] != 0;
            distance *= 2;
        }
        Ok(flag)
    }

    /// Lexicographic maximum of `value` across every rank, same rounds as
    /// [`dissemination_or`](Self::dissemination_or).
    fn dissemination_max(&self, tag: Tag, mut value: [u64; 3]) -> Result<[u64; 3]> {
        let mut distance = 1;
        while distance < self.size {
            let to = (self.rank + distance) % self.size;
            let from = (self.rank + self.size - distance) % self.size;
            self.send_raw(&value, to, tag)?;
            let mut theirs = [0u64; 3];
            self.recv_raw(&mut theirs, from, tag)?;
            value = value.max(theirs);
            distance *= 2;
        }
        Ok(value)
    }

    /// Account for a collective call and, when verification is on, check it
    /// against the other ranks' calls.
    ///
    /// Each rank compares its fingerprint with its ring predecessor. The
    /// outcome, together with root's `rejection` if it has one, is then
    /// max-disseminated so every rank fails together with the same error.
    /// Without verification a rejection fails only the rank that found it.
    pub(crate) fn begin(
        &self,
        op: Collective,
        root: Rank,
        count: usize,
        rejection: Option<Rejection>,
    ) -> Result<u64> {
        let sequence = self.sequence.get();
        if self.size == 1 || !self.config.verify_collectives {
            if let Some(rejection) = rejection {
                return Err(rejection.into_error());
            }
            self.sequence.set(sequence + 1);
            return Ok(sequence);
        }
        self.sequence.set(sequence + 1);

        let mine = Fingerprint {
            sequence,
            op: op as u64,
            root: root as u64,
            count: count as u64,
        };
        let next = (self.rank + 1) % self.size;
        let prev = (self.rank + self.size - 1) % self.size;
        self.send_raw(&mine.to_words(), next, tags::CHECK)?;
        let mut words = [0u64; 4];
        self.recv_raw(&mut words, prev, tags::CHECK)?;
        let theirs = Fingerprint::from_words(words);

        let local_mismatch = theirs != mine;
        let verdict = if local_mismatch {
            [DIVERGED, 0, 0]
        } else {
            rejection.map_or([0; 3], Rejection::to_words)
        };
        let verdict = self.dissemination_max(tags::CHECK_FLAG, verdict)?;
        if verdict[0] == DIVERGED {
            let detail = if local_mismatch {
                format!(
                    "rank {} issued {mine}, rank {prev} issued {theirs}",
                    self.rank
                )
            } else {
                format!("rank {} issued {mine}; another rank diverged", self.rank)
            };
            warn!(rank = self.rank, sequence, %detail, "collective sequence diverged");
            return Err(Error::ProtocolMismatch { sequence, detail });
        }
        match Rejection::from_words(verdict) {
            Some(rejection) => {
                debug!(rank = self.rank, sequence, ?rejection, "collective rejected at root");
                Err(rejection.into_error())
            }
            None => Ok(sequence),
        }
    }
}

fn check_user_tag(tag: Tag) -> Result<()> {
    if tag < 0 {
        Err(Error::InvalidTag(tag))
    } else {
        Ok(())
    }
}
