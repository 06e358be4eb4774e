//! TCP transport: one endpoint per process, full mesh of streams.
//!
//! # Bootstrap
//!
//! Every rank is given the same ordered list of peer addresses. Rank `i`
//! binds `peers[i]`, connects to every lower rank (retrying until the
//! connect timeout, since peers start in any order) and accepts one
//! connection from every higher rank. Both sides then exchange a handshake
//! of `(rank: u64, size: u64)`, little-endian.
//!
//! # Framing
//!
//! | Field      | Width | Encoding             |
//! |------------|-------|----------------------|
//! | `tag`      | 4     | `i32` LE             |
//! | `datatype` | 1     | [`DatatypeTag`] byte |
//! | `len`      | 8     | `u64` LE             |
//! | `payload`  | `len` | bytes                |
//!
//! A receive reads frames from the source's stream only; frames with other
//! tags are parked in the mailbox. A read timeout leaves the stream in an
//! undefined position and should be treated as fatal for the group. A
//! header with an unknown datatype or a length above
//! [`TcpConfig::max_message_len`] is reported as [`Error::Io`] with
//! `InvalidData` before anything is allocated.

use super::{deliver, Mailbox, Parcel, Transport};
use crate::datatype::DatatypeTag;
use crate::error::{Error, Result};
use crate::status::Status;
use crate::{Rank, Tag};
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};
use tracing::debug;

/// Length of a frame header in bytes.
pub const HEADER_LEN: usize = 13;

/// Default for [`TcpConfig::max_message_len`]: 1 GiB.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 1 << 30;

/// Payloads up to this size are copied behind the header and written at once.
const COALESCE_LEN: usize = 64 * 1024;

const HANDSHAKE_LEN: usize = 16;

/// Options for [`TcpTransport::connect`].
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// How long to keep retrying connects and waiting for accepts.
    pub connect_timeout: Duration,
    /// Pause between connect attempts.
    pub retry_interval: Duration,
    /// Upper bound on a single blocking read. `None` waits forever.
    pub recv_timeout: Option<Duration>,
    /// Largest payload accepted in either direction.
    pub max_message_len: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            connect_timeout: Duration::from_secs(30),
            retry_interval: Duration::from_millis(50),
            recv_timeout: None,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        }
    }
}

/// One endpoint of a TCP mesh.
pub struct TcpTransport {
    rank: Rank,
    size: usize,
    /// Stream to every peer; `None` at our own index.
    streams: Vec<Option<TcpStream>>,
    mailbox: RefCell<Mailbox>,
    max_message_len: usize,
}

impl TcpTransport {
    /// Join the mesh described by `peers` as `rank`.
    ///
    /// Blocks until a stream to every other rank is established.
    pub fn connect(rank: Rank, peers: &[SocketAddr], config: &TcpConfig) -> Result<Self> {
        let size = peers.len();
        if rank >= size {
            return Err(Error::config(format!(
                "rank {rank} has no address in a peer list of {size}"
            )));
        }

        let listener = TcpListener::bind(peers[rank])?;
        let deadline = Instant::now() + config.connect_timeout;
        let mut streams: Vec<Option<TcpStream>> = (0..size).map(|_| None).collect();

        for (peer, addr) in peers.iter().enumerate().take(rank) {
            let stream = connect_with_retry(*addr, deadline, config.retry_interval)?;
            stream.set_read_timeout(Some(config.connect_timeout))?;
            write_handshake(&stream, rank, size)?;
            let (their_rank, their_size) = read_handshake(&stream, peer)?;
            if their_rank != peer || their_size != size {
                return Err(Error::config(format!(
                    "{addr} answered as rank {their_rank} of {their_size}, expected rank {peer} of {size}"
                )));
            }
            debug!(rank, peer, %addr, "connected");
            streams[peer] = Some(stream);
        }

        listener.set_nonblocking(true)?;
        for _ in rank + 1..size {
            let (stream, addr) = accept_until(&listener, deadline, config.retry_interval)?;
            stream.set_nonblocking(false)?;
            stream.set_read_timeout(Some(config.connect_timeout))?;
            let (their_rank, their_size) = read_handshake(&stream, rank)?;
            if their_size != size {
                return Err(Error::config(format!(
                    "rank {their_rank} at {addr} believes the group has {their_size} ranks, not {size}"
                )));
            }
            if their_rank <= rank || their_rank >= size || streams[their_rank].is_some() {
                return Err(Error::config(format!(
                    "unexpected connection from rank {their_rank} at {addr}"
                )));
            }
            write_handshake(&stream, rank, size)?;
            debug!(rank, peer = their_rank, %addr, "accepted");
            streams[their_rank] = Some(stream);
        }

        for stream in streams.iter().flatten() {
            stream.set_nodelay(true)?;
            stream.set_read_timeout(config.recv_timeout)?;
        }

        Ok(TcpTransport {
            rank,
            size,
            streams,
            mailbox: RefCell::new(Mailbox::default()),
            max_message_len: config.max_message_len,
        })
    }

    fn stream(&self, peer: Rank) -> Result<Option<&TcpStream>> {
        Error::check_rank(peer, self.size)?;
        Ok(self.streams[peer].as_ref())
    }
}

impl Transport for TcpTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, dest: Rank, tag: Tag, datatype: DatatypeTag, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_message_len {
            return Err(Error::config(format!(
                "message of {} bytes exceeds the {} byte limit",
                payload.len(),
                self.max_message_len
            )));
        }
        let Some(stream) = self.stream(dest)? else {
            let parcel = Parcel {
                datatype,
                payload: payload.to_vec(),
            };
            self.mailbox.borrow_mut().push(self.rank, tag, parcel);
            return Ok(());
        };

        let header = encode_header(tag, datatype, payload.len());
        let mut writer = stream;
        let written = if payload.len() <= COALESCE_LEN {
            let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
            frame.extend_from_slice(&header);
            frame.extend_from_slice(payload);
            writer.write_all(&frame)
        } else {
            writer
                .write_all(&header)
                .and_then(|()| writer.write_all(payload))
        };
        written.map_err(|e| match e.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => Error::Disconnected(dest),
            _ => Error::Io(e),
        })
    }

    fn recv(
        &self,
        source: Rank,
        tag: Tag,
        datatype: DatatypeTag,
        buf: &mut [u8],
    ) -> Result<Status> {
        let stream = self.stream(source)?;
        if let Some(parcel) = self.mailbox.borrow_mut().take(source, tag) {
            return deliver(source, tag, datatype, parcel.datatype, &parcel.payload, buf);
        }
        let Some(stream) = stream else {
            // Nothing was looped back and nobody else can produce it.
            return Err(Error::Timeout { peer: source, tag });
        };

        loop {
            let mut header = [0u8; HEADER_LEN];
            read_exact(stream, &mut header, source, tag)?;
            let (frame_tag, frame_type, len) = decode_header(&header, self.max_message_len)?;

            // Matching frames of the right shape land directly in `buf`.
            if frame_tag == tag && frame_type == datatype && len == buf.len() {
                read_exact(stream, buf, source, tag)?;
                return Ok(Status {
                    source,
                    tag,
                    count: len,
                });
            }

            let mut payload = vec![0u8; len];
            read_exact(stream, &mut payload, source, tag)?;
            if frame_tag == tag {
                return deliver(source, tag, datatype, frame_type, &payload, buf);
            }
            let parcel = Parcel {
                datatype: frame_type,
                payload,
            };
            self.mailbox.borrow_mut().push(source, frame_tag, parcel);
        }
    }
}

/// Encode a frame header.
pub fn encode_header(tag: Tag, datatype: DatatypeTag, len: usize) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&tag.to_le_bytes());
    header[4] = datatype as u8;
    header[5..].copy_from_slice(&(len as u64).to_le_bytes());
    header
}

/// Decode a frame header into `(tag, datatype, payload_len)`.
///
/// Fails with [`Error::Io`] (`InvalidData`) on an unknown datatype byte or
/// a length above `max_len`, which means the stream is out of sync.
pub fn decode_header(header: &[u8; HEADER_LEN], max_len: usize) -> Result<(Tag, DatatypeTag, usize)> {
    let mut tag = [0u8; 4];
    tag.copy_from_slice(&header[..4]);
    let datatype = DatatypeTag::try_from(header[4]).map_err(|raw| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame header names unknown datatype {raw}"),
        )
    })?;
    let mut len = [0u8; 8];
    len.copy_from_slice(&header[5..]);
    let len = u64::from_le_bytes(len);
    if len > max_len as u64 {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame header announces {len} bytes, limit is {max_len}"),
        )));
    }
    Ok((i32::from_le_bytes(tag), datatype, len as usize))
}

fn read_exact(stream: &TcpStream, buf: &mut [u8], peer: Rank, tag: Tag) -> Result<()> {
    let mut reader = stream;
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => Error::Disconnected(peer),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout { peer, tag },
        _ => Error::Io(e),
    })
}

fn write_handshake(stream: &TcpStream, rank: Rank, size: usize) -> Result<()> {
    let mut msg = [0u8; HANDSHAKE_LEN];
    msg[..8].copy_from_slice(&(rank as u64).to_le_bytes());
    msg[8..].copy_from_slice(&(size as u64).to_le_bytes());
    let mut writer = stream;
    writer.write_all(&msg)?;
    Ok(())
}

fn read_handshake(stream: &TcpStream, peer: Rank) -> Result<(Rank, usize)> {
    let mut msg = [0u8; HANDSHAKE_LEN];
    read_exact(stream, &mut msg, peer, 0)?;
    let mut rank = [0u8; 8];
    rank.copy_from_slice(&msg[..8]);
    let mut size = [0u8; 8];
    size.copy_from_slice(&msg[8..]);
    Ok((
        u64::from_le_bytes(rank) as usize,
        u64::from_le_bytes(size) as usize,
    ))
}

fn connect_with_retry(addr: SocketAddr, deadline: Instant, pause: Duration) -> Result<TcpStream> {
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() >= deadline => {
                return Err(Error::config(format!(
                    "could not reach peer at {addr} before the connect timeout: {e}"
                )));
            }
            Err(_) => std::thread::sleep(pause),
        }
    }
}

fn accept_until(
    listener: &TcpListener,
    deadline: Instant,
    pause: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    loop {
        match listener.accept() {
            Ok(accepted) => return Ok(accepted),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(Error::config(
                        "not every higher rank connected before the connect timeout",
                    ));
                }
                std::thread::sleep(pause);
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
}
