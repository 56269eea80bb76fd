//! Typed connection events for external observers
//!
//! A [`Sink`] configured with [`TransportConfig::telemetry`](crate::TransportConfig::telemetry)
//! receives an [`Event`] for every lifecycle change, packet and congestion window update of each
//! connection using that configuration. Delivery is synchronous and happens while the connection
//! is being driven, so sinks should hand events off rather than process them inline.

use std::{net::SocketAddr, time::Instant};

use crate::{
    connection::{ConnectionError, ConnectionState},
    packet::SpaceId,
    shared::ConnectionId,
    Side,
};

/// Something that happened to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A connection was created
    ConnectionStarted {
        /// Whether we initiated the connection
        side: Side,
        /// Address of the peer
        remote: SocketAddr,
    },
    /// The connection moved between lifecycle states
    StateChanged {
        /// State before the transition
        from: ConnectionState,
        /// State after the transition
        to: ConnectionState,
    },
    /// A packet was sent
    PacketSent {
        /// Packet number space
        space: SpaceId,
        /// Full packet number
        number: u64,
        /// Size on the wire, including header and tag
        size: u16,
        /// Whether the packet will be acknowledged by the peer
        ack_eliciting: bool,
    },
    /// A packet was received and authenticated
    PacketReceived {
        /// Packet number space
        space: SpaceId,
        /// Full packet number
        number: u64,
        /// Size on the wire, including header and tag
        size: u16,
    },
    /// A packet was declared lost
    PacketLost {
        /// Packet number space
        space: SpaceId,
        /// Full packet number
        number: u64,
        /// Size on the wire
        size: u16,
    },
    /// The congestion window or the bytes in flight changed
    CongestionWindowUpdated {
        /// Current congestion window
        window: u64,
        /// Bytes sent but not yet acknowledged or declared lost
        bytes_in_flight: u64,
    },
    /// The connection was closed, locally or by the peer
    ConnectionClosed {
        /// Why the connection closed
        reason: ConnectionError,
    },
}

/// Receives connection events
pub trait Sink: Send + Sync {
    /// Called for each event of the connection identified by `cid`, our connection ID
    fn event(&self, now: Instant, cid: ConnectionId, event: Event);
}
