//! Observing connections from another task
//!
//! [`ChannelSink`] forwards the typed events of `minquic-proto` onto a bounded tokio channel.
//! Install it with [`TransportConfig::telemetry`](crate::TransportConfig::telemetry).

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use tokio::sync::mpsc;
use tracing::trace;

pub use proto::telemetry::{Event, Sink};

use crate::ConnectionId;

/// A telemetry record as delivered through a [`ChannelSink`]
#[derive(Debug, Clone)]
pub struct Record {
    /// When the event happened
    pub time: Instant,
    /// Local ID of the connection the event belongs to
    pub connection: ConnectionId,
    /// What happened
    pub event: Event,
}

/// A [`Sink`] that sends every event to a bounded channel
///
/// Events are dropped while the channel is full or after the receiver went away; connections are
/// never slowed down by a lagging observer.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<Record>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// Create a sink buffering up to `capacity` events, along with the receiving end
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Record>) {
        let (tx, rx) = mpsc::channel(capacity);
        let sink = Self {
            tx,
            dropped: AtomicU64::new(0),
        };
        (sink, rx)
    }

    /// Number of events discarded so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Sink for ChannelSink {
    fn event(&self, time: Instant, connection: ConnectionId, event: Event) {
        let record = Record {
            time,
            connection,
            event,
        };
        if let Err(e) = self.tx.try_send(record) {
            trace!("dropping telemetry event: {}", e);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConnectionState;

    #[test]
    fn drops_when_full() {
        let (sink, mut rx) = ChannelSink::new(1);
        let cid = ConnectionId::new(&[1; 8]);
        let event = Event::StateChanged {
            from: ConnectionState::Initial,
            to: ConnectionState::Handshaking,
        };
        sink.event(Instant::now(), cid, event.clone());
        sink.event(Instant::now(), cid, event.clone());
        assert_eq!(sink.dropped(), 1);

        let record = rx.try_recv().unwrap();
        assert_eq!(record.connection, cid);
        assert_eq!(record.event, event);
        assert!(rx.try_recv().is_err());

        drop(rx);
        sink.event(Instant::now(), cid, event);
        assert_eq!(sink.dropped(), 2);
    }
}
