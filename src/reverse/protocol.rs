//! Control datagrams exchanged before a reversed connection is handed over.
//!
//! Every datagram is exactly [`DATAGRAM_LEN`] bytes:
//! `u16be magic` + `u8 version` + `u8 event`. There is no length prefix and no
//! payload; once the handshake completes the stream carries no framing at all.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

pub const DATAGRAM_LEN: usize = 2 + 1 + 1;
pub const DATAGRAM_MAGIC: u16 = 3553;
pub const DATAGRAM_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Event {
    Heart = 1,
    Syn = 2,
    SynAck = 3,
    Ack = 4,
}

impl Event {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Event {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Event::Heart),
            2 => Ok(Event::Syn),
            3 => Ok(Event::SynAck),
            4 => Ok(Event::Ack),
            other => Err(ProtocolError::InvalidEvent(other)),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("not supported flag={0}")]
    BadMagic(u16),
    #[error("not supported version={0}")]
    BadVersion(u8),
    #[error("not supported event={0}")]
    InvalidEvent(u8),
    #[error("unexpected event={0:?}")]
    UnexpectedEvent(Event),
}

pub fn encode(event: Event) -> [u8; DATAGRAM_LEN] {
    let [hi, lo] = DATAGRAM_MAGIC.to_be_bytes();
    [hi, lo, DATAGRAM_VERSION, event.code()]
}

pub fn decode(buf: &[u8; DATAGRAM_LEN]) -> Result<Event, ProtocolError> {
    let magic = u16::from_be_bytes([buf[0], buf[1]]);
    if magic != DATAGRAM_MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    if buf[2] > DATAGRAM_VERSION {
        return Err(ProtocolError::BadVersion(buf[2]));
    }
    Event::try_from(buf[3])
}

/// A raw stream wrapped with the read/write buffers used for control datagrams.
///
/// The wrapper is only used during the control phase; `into_inner` hands the
/// untouched stream to whoever owns the connection next.
pub struct DatagramStream<RW> {
    inner: RW,
    r: [u8; DATAGRAM_LEN],
    w: [u8; DATAGRAM_LEN],
}

impl<RW> DatagramStream<RW> {
    pub fn new(inner: RW) -> Self {
        Self {
            inner,
            r: [0; DATAGRAM_LEN],
            w: [0; DATAGRAM_LEN],
        }
    }

    pub fn into_inner(self) -> RW {
        self.inner
    }

    /// Magic of the last datagram read.
    pub fn flag(&self) -> u16 {
        u16::from_be_bytes([self.r[0], self.r[1]])
    }

    /// Version of the last datagram read.
    pub fn version(&self) -> u8 {
        self.r[2]
    }

    /// Event of the last successfully received datagram.
    pub fn event(&self) -> Option<Event> {
        Event::try_from(self.r[3]).ok()
    }
}

impl<RW> DatagramStream<RW>
where
    RW: AsyncRead + AsyncWrite + Unpin,
{
    /// Reads exactly one datagram. A non-empty `allowed` restricts which events
    /// are accepted.
    pub async fn recv(&mut self, allowed: &[Event]) -> Result<Event, Error> {
        self.inner.read_exact(&mut self.r).await?;
        let event = decode(&self.r)?;
        if !allowed.is_empty() && !allowed.contains(&event) {
            return Err(ProtocolError::UnexpectedEvent(event).into());
        }
        Ok(event)
    }

    pub async fn send(&mut self, event: Event) -> Result<(), Error> {
        if self.w[2] == 0 {
            self.w[..2].copy_from_slice(&DATAGRAM_MAGIC.to_be_bytes());
            self.w[2] = DATAGRAM_VERSION;
        }
        self.w[3] = event.code();
        self.inner.write_all(&self.w).await?;
        self.inner.flush().await?;
        Ok(())
    }
}
