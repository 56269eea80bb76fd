//! Low-level protocol logic for a minimal QUIC transport
//!
//! minquic-proto contains a fully deterministic implementation of the QUIC protocol logic needed
//! to carry multiplexed, encrypted, reliable streams. It contains no networking code and does not
//! read the system clock: every entry point takes the current time, and every output is a value
//! the caller transmits or schedules. The `minquic` crate drives it from a tokio runtime.
//!
//! The most important types are [`Endpoint`], which owns the registry of connections for a single
//! socket and dispatches incoming datagrams, and [`Connection`], which holds the state of one
//! connection: handshake progress, packet number spaces, loss recovery, congestion control and
//! streams.

#![warn(missing_docs)]
#![cfg_attr(test, allow(dead_code))]
#![allow(clippy::too_many_arguments)]

use std::{fmt, net::SocketAddr, ops, time::Duration};

use coding::Codec;

#[doc(hidden)]
pub mod coding;
mod range_set;
mod varint;
pub use varint::{VarInt, VarIntBoundsExceeded};

mod packet;
pub use packet::{DecodeError, SpaceId};

mod frame;
pub use crate::frame::{ApplicationClose, Close, ConnectionClose, FrameType, InvalidFrame};

mod transport_error;
pub use crate::transport_error::{Code as TransportErrorCode, Error as TransportError};

mod shared;
pub use crate::shared::{ConnectionEvent, ConnectionId, EndpointEvent};

pub mod congestion;
pub mod crypto;
pub mod telemetry;
pub mod transport_parameters;

mod config;
pub use crate::config::{
    ClientConfig, ConfigError, EndpointConfig, IdleTimeout, ServerConfig, TransportConfig,
};

mod connection;
pub use crate::connection::{
    ClosedStream, Connection, ConnectionError, ConnectionState, ConnectionStats, Event,
    FinishError, ReadError, RecvStream, RttEstimator, SendStream, StreamEvent, Streams,
    WriteError,
};

mod endpoint;
pub use crate::endpoint::{ConnectError, ConnectionHandle, DatagramEvent, Endpoint};

#[cfg(test)]
mod tests;

/// The QUIC protocol version implemented
pub const VERSION: u32 = 0x0000_0001;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    /// Shorthand for `self == Side::Client`
    pub fn is_client(self) -> bool {
        self == Side::Client
    }

    #[inline]
    /// Shorthand for `self == Side::Server`
    pub fn is_server(self) -> bool {
        self == Side::Server
    }
}

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl Dir {
    fn iter() -> impl Iterator<Item = Self> {
        [Dir::Bi, Dir::Uni].into_iter()
    }
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            Dir::Bi => "bidirectional",
            Dir::Uni => "unidirectional",
        })
    }
}

/// Identifier for a stream within a particular connection
///
/// Bit 0 is the initiator, bit 1 the directionality, and the remaining bits count streams of the
/// same kind.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        let dir = match self.dir() {
            Dir::Uni => "uni",
            Dir::Bi => "bi",
        };
        write!(f, "{initiator} {dir}directional stream {}", self.index())
    }
}

impl StreamId {
    /// Create a new StreamId
    pub fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        Self(index << 2 | (dir as u64) << 1 | initiator as u64)
    }

    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// Which directions data flows in
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }

    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl From<StreamId> for VarInt {
    fn from(x: StreamId) -> Self {
        // Stream indices are bounded by MAX_STREAM_COUNT, so IDs fit in 62 bits
        Self(x.0)
    }
}

impl From<VarInt> for StreamId {
    fn from(v: VarInt) -> Self {
        Self(v.0)
    }
}

impl Codec for StreamId {
    fn decode<B: bytes::Buf>(buf: &mut B) -> coding::Result<Self> {
        VarInt::decode(buf).map(Self::from)
    }
    fn encode<B: bytes::BufMut>(&self, buf: &mut B) {
        VarInt::from(*self).encode(buf);
    }
}

/// An outgoing datagram
#[derive(Debug)]
pub struct Transmit {
    /// The socket address this datagram should be sent to
    pub destination: SocketAddr,
    /// Contents of the datagram
    pub contents: Box<[u8]>,
}

//
// Useful internal constants
//

const MAX_CID_SIZE: usize = 20;
const MIN_INITIAL_SIZE: u16 = 1200;
/// Smallest datagram size every QUIC path must support, and the size we send at
const INITIAL_MTU: u16 = 1200;
const TIMER_GRANULARITY: Duration = Duration::from_millis(1);
/// Maximum number of streams that can be uniquely identified by a stream ID
const MAX_STREAM_COUNT: u64 = 1 << 60;
