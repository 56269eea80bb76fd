//! Minimal QUIC transport over tokio
//!
//! This crate binds the I/O-free state machine in `minquic-proto` to a tokio UDP socket. An
//! [`Endpoint`] owns one socket and routes datagrams to its connections; every [`Connection`] is
//! driven by its own task, which processes incoming packets, fires timers and hands outgoing
//! datagrams back to the endpoint.
//!
//! Applications exchange data over streams. [`Connection::open_bi`] and [`Connection::open_uni`]
//! start new streams, [`Connection::accept_bi`] and [`Connection::accept_uni`] yield those
//! started by the peer. Reads and writes suspend while no data or flow control credit is
//! available, and complete with an error once the stream or connection is closed or the stream's
//! [`CancellationToken`](tokio_util::sync::CancellationToken) is cancelled.
//!
//! Handshakes authenticate both peers through a pre-shared key; see [`crypto::psk`].
#![warn(missing_docs)]
#![warn(unreachable_pub)]
#![warn(clippy::use_self)]

mod connection;
mod endpoint;
mod mutex;
mod recv_stream;
mod send_stream;
pub mod telemetry;

pub use proto::{
    congestion, crypto, ApplicationClose, ClientConfig, ConfigError, ConnectionClose,
    ConnectionError, ConnectionId, ConnectionState, ConnectionStats, Dir, EndpointConfig,
    IdleTimeout, ServerConfig, Side, StreamId, Transmit, TransportConfig, TransportError,
    TransportErrorCode, VarInt,
};

pub use crate::connection::{Connecting, Connection, StreamError};
pub use crate::endpoint::{Accept, ConnectError, Endpoint};
pub use crate::recv_stream::{ReadError, ReadToEndError, RecvStream};
pub use crate::send_stream::{SendStream, WriteError};
pub use crate::telemetry::ChannelSink;


#[derive(Debug)]
enum ConnectionEvent {
    Close { error_code: VarInt, reason: bytes::Bytes },
    Proto(proto::ConnectionEvent),
}

#[derive(Debug)]
enum EndpointEvent {
    Proto(proto::EndpointEvent),
    Transmit(proto::Transmit),
}

/// Maximum number of datagrams processed in send/recv calls to make before moving on to other processing
///
/// This helps ensure we don't starve anything when the CPU is slower than the link.
const IO_LOOP_BOUND: usize = 160;
