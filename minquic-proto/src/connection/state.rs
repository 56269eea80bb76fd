use crate::frame::Close;

use super::ConnectionError;

/// Lifecycle stage of a connection, as observed by the application
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    /// No handshake keys have been derived yet
    Initial,
    /// Handshake keys are in use; the handshake has not completed
    Handshaking,
    /// The handshake completed and application data flows
    Established,
    /// The connection was closed and waits out stray packets before being forgotten
    Draining,
    /// Terminal; the connection holds no more protocol state
    Closed,
}

#[derive(Debug, Clone)]
pub(super) enum State {
    Initial,
    Handshaking,
    Established,
    Draining {
        reason: ConnectionError,
        /// Frame repeated in response to incoming packets
        close: Close,
    },
    Closed(ConnectionError),
}

impl State {
    pub(super) fn kind(&self) -> ConnectionState {
        match *self {
            Self::Initial => ConnectionState::Initial,
            Self::Handshaking => ConnectionState::Handshaking,
            Self::Established => ConnectionState::Established,
            Self::Draining { .. } => ConnectionState::Draining,
            Self::Closed(_) => ConnectionState::Closed,
        }
    }

    pub(super) fn is_handshake(&self) -> bool {
        matches!(*self, Self::Initial | Self::Handshaking)
    }

    pub(super) fn is_established(&self) -> bool {
        matches!(*self, Self::Established)
    }

    /// Whether the connection stopped carrying application data
    pub(super) fn is_closed(&self) -> bool {
        matches!(*self, Self::Draining { .. } | Self::Closed(_))
    }

    pub(super) fn is_drained(&self) -> bool {
        matches!(*self, Self::Closed(_))
    }

    /// The frame to echo while draining
    pub(super) fn close_frame(&self) -> Option<&Close> {
        match *self {
            Self::Draining { ref close, .. } => Some(close),
            _ => None,
        }
    }

    pub(super) fn reason(&self) -> Option<&ConnectionError> {
        match *self {
            Self::Draining { ref reason, .. } | Self::Closed(ref reason) => Some(reason),
            _ => None,
        }
    }
}
