//! Logic for controlling the rate at which data is sent

use std::any::Any;
use std::time::Instant;

use crate::connection::RttEstimator;

mod new_reno;

pub use new_reno::{NewReno, NewRenoConfig};

/// Common interface for different congestion controllers
pub trait Controller: Send + Sync {
    /// Packet deliveries were confirmed
    ///
    /// `app_limited` indicates whether the connection was blocked on outgoing
    /// application data prior to receiving these acknowledgements.
    fn on_ack(
        &mut self,
        now: Instant,
        sent: Instant,
        bytes: u64,
        app_limited: bool,
        rtt: &RttEstimator,
    );

    /// Packets were deemed lost
    ///
    /// `sent` is the time the most recent lost packet was sent. `is_persistent_congestion`
    /// indicates whether every packet sent over the persistent congestion period ending at `sent`
    /// was lost.
    fn on_congestion_event(
        &mut self,
        now: Instant,
        sent: Instant,
        is_persistent_congestion: bool,
        lost_bytes: u64,
    );

    /// Number of ack-eliciting bytes that may be in flight
    fn window(&self) -> u64;

    /// Slow start threshold, if the controller has one
    fn ssthresh(&self) -> Option<u64> {
        None
    }

    /// Duplicate the controller's state
    fn clone_box(&self) -> Box<dyn Controller>;

    /// Initial congestion window
    fn initial_window(&self) -> u64;

    /// Returns Self for use in down-casting to extract implementation details
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Constructs controllers on demand
pub trait ControllerFactory {
    /// Construct a fresh `Controller` for a path with the given maximum datagram size
    fn build(&self, now: Instant, current_mtu: u16) -> Box<dyn Controller>;
}

const BASE_DATAGRAM_SIZE: u64 = 1200;
