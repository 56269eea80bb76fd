use std::{cmp, mem, time::Duration, time::Instant};

use tracing::{debug, trace};

use super::{spaces::SentPacket, timer::Timer, Connection};
use crate::{frame, packet::SpaceId, telemetry, TransportError, TIMER_GRANULARITY};

/// Largest exponent applied to the probe timeout on consecutive expiries
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// RTT estimation for a particular network path
#[derive(Copy, Clone, Debug)]
pub struct RttEstimator {
    /// The most recent RTT measurement made when receiving an ack for a previously unacked packet
    latest: Duration,
    /// The smoothed RTT of the connection, computed as described in RFC6298
    smoothed: Option<Duration>,
    /// The RTT variance, computed as described in RFC6298
    var: Duration,
    /// The minimum RTT seen in the connection, ignoring ack delay.
    min: Duration,
}

impl RttEstimator {
    /// Start from `initial_rtt` until the first sample arrives
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            latest: initial_rtt,
            smoothed: None,
            var: initial_rtt / 2,
            min: initial_rtt,
        }
    }

    /// The current best RTT estimation.
    pub fn get(&self) -> Duration {
        self.smoothed.unwrap_or(self.latest)
    }

    /// Minimum RTT registered so far for this estimator.
    pub fn min(&self) -> Duration {
        self.min
    }

    /// Current RTT variance estimate
    pub fn var(&self) -> Duration {
        self.var
    }

    /// Probe timeout before the peer's ack delay allowance and backoff
    pub(crate) fn pto_base(&self) -> Duration {
        self.get() + cmp::max(4 * self.var, TIMER_GRANULARITY)
    }

    /// How long after a packet was sent it is deemed lost, once a later packet is acknowledged
    pub(crate) fn loss_delay(&self) -> Duration {
        cmp::max(self.get() + 4 * self.var, TIMER_GRANULARITY)
    }

    pub(crate) fn update(&mut self, ack_delay: Duration, rtt: Duration) {
        self.latest = rtt;
        // min_rtt ignores ack delay.
        self.min = cmp::min(self.min, self.latest);
        if let Some(smoothed) = self.smoothed {
            // The ack delay is only subtracted when that can't take the sample below min_rtt
            let adjusted_rtt = if self.min + ack_delay <= self.latest {
                self.latest - ack_delay
            } else {
                self.latest
            };
            let var_sample = if smoothed > adjusted_rtt {
                smoothed - adjusted_rtt
            } else {
                adjusted_rtt - smoothed
            };
            self.var = (3 * self.var + var_sample) / 4;
            self.smoothed = Some((7 * smoothed + adjusted_rtt) / 8);
        } else {
            self.smoothed = Some(self.latest);
            self.var = self.latest / 2;
            self.min = self.latest;
        }
    }
}

impl Connection {
    pub(super) fn on_ack_received(
        &mut self,
        now: Instant,
        space: SpaceId,
        ack: frame::Ack,
    ) -> Result<(), TransportError> {
        let largest = ack.largest();
        if largest >= self.spaces[space].next_packet_number {
            return Err(TransportError::PROTOCOL_VIOLATION("unsent packet acked"));
        }
        {
            let space = &mut self.spaces[space];
            if space.largest_acked_packet.map_or(true, |pn| largest > pn) {
                space.largest_acked_packet = Some(largest);
                if let Some(info) = space.sent_packets.get(&largest) {
                    space.largest_acked_packet_sent = info.time_sent;
                }
            }
        }

        // Only look at the records we hold, so huge bogus ranges cost nothing
        let newly_acked = ack
            .ranges
            .iter()
            .flat_map(|range| self.spaces[space].sent_packets.range(range).map(|(&n, _)| n))
            .collect::<Vec<_>>();
        if newly_acked.is_empty() {
            return Ok(());
        }

        // Every newly acknowledged ack-eliciting record yields one RTT sample
        let mut samples = Vec::with_capacity(newly_acked.len());
        for &packet in &newly_acked {
            if let Some(info) = self.spaces[space].take(packet) {
                if let Some(acked) = info.largest_acked {
                    self.spaces[space].pending_acks.subtract_below(acked);
                }
                if info.ack_eliciting {
                    samples.push(info.time_sent);
                }
                self.on_packet_acked(now, info);
            }
        }

        if !samples.is_empty() {
            let ack_delay = if space != SpaceId::Data {
                Duration::ZERO
            } else {
                cmp::min(
                    self.max_ack_delay(),
                    Duration::from_micros(
                        ack.delay
                            .checked_shl(self.peer_params.ack_delay_exponent.into_inner() as u32)
                            .unwrap_or(u64::MAX),
                    ),
                )
            };
            // Oldest first, so the newest packet's sample is the latest
            samples.sort_unstable();
            for sent in samples {
                self.rtt.update(ack_delay, now.saturating_duration_since(sent));
            }
        }

        // Must be called before pto_count is clobbered
        self.detect_lost_packets(now, space);

        self.pto_count = 0;
        self.set_loss_detection_timer();
        self.emit(
            now,
            telemetry::Event::CongestionWindowUpdated {
                window: self.congestion.window(),
                bytes_in_flight: self.bytes_in_flight(),
            },
        );
        Ok(())
    }

    fn on_packet_acked(&mut self, now: Instant, info: SentPacket) {
        if info.in_flight {
            self.congestion.on_ack(
                now,
                info.time_sent,
                info.size.into(),
                self.app_limited,
                &self.rtt,
            );
        }

        for (id, _) in info.retransmits.reset_stream {
            self.streams.reset_acked(id);
        }

        for frame in info.stream_frames {
            self.streams.ack(frame);
        }
    }

    pub(super) fn on_loss_detection_timeout(&mut self, now: Instant) {
        if let Some((_, space)) = self.earliest_time_and_space(|x| x.loss_time) {
            // Time threshold loss detection
            self.detect_lost_packets(now, space);
            self.set_loss_detection_timer();
            return;
        }

        let Some((_, space)) = self.earliest_time_and_space(|x| {
            match x.ack_eliciting_in_flight {
                0 => None,
                _ => x.time_of_last_ack_eliciting_packet,
            }
        }) else {
            return;
        };
        trace!(
            in_flight = self.bytes_in_flight(),
            count = self.pto_count,
            ?space,
            "PTO fired"
        );
        self.stats.pto_count += 1;
        self.spaces[space].loss_probes = self.spaces[space].loss_probes.saturating_add(1);
        self.pto_count = self.pto_count.saturating_add(1);
        self.set_loss_detection_timer();
    }

    pub(super) fn detect_lost_packets(&mut self, now: Instant, space_id: SpaceId) {
        let Some(largest_acked_packet) = self.spaces[space_id].largest_acked_packet else {
            return;
        };
        let loss_delay = self.rtt.loss_delay();
        // Packets sent before this time are deemed lost
        let lost_send_time = now.checked_sub(loss_delay);
        let packet_threshold = u64::from(self.config.packet_threshold);

        let mut lost_packets = Vec::<u64>::new();
        let space = &mut self.spaces[space_id];
        space.loss_time = None;
        for (&packet, info) in space.sent_packets.range(0..largest_acked_packet) {
            if lost_send_time.map_or(false, |t| info.time_sent <= t)
                || largest_acked_packet >= packet + packet_threshold
            {
                lost_packets.push(packet);
            } else {
                let next_loss_time = info.time_sent + loss_delay;
                space.loss_time = Some(
                    space
                        .loss_time
                        .map_or(next_loss_time, |x| cmp::min(x, next_loss_time)),
                );
            }
        }

        let Some(&largest_lost) = lost_packets.last() else {
            return;
        };
        let largest_lost_sent = self.spaces[space_id].sent_packets[&largest_lost].time_sent;
        self.stats.lost_packets += lost_packets.len() as u64;
        trace!("packets lost: {:?}", lost_packets);

        let mut lost_bytes = 0;
        for &packet in &lost_packets {
            let Some(info) = self.spaces[space_id].take(packet) else {
                continue;
            };
            if info.in_flight {
                lost_bytes += u64::from(info.size);
            }
            self.emit(
                now,
                telemetry::Event::PacketLost {
                    space: space_id,
                    number: packet,
                    size: info.size,
                },
            );
            for frame in info.stream_frames {
                self.streams.retransmit(frame);
            }
            self.spaces[space_id].pending |= info.retransmits;
        }

        // Lost ACK-only packets carry no congestion signal
        if lost_bytes == 0 {
            return;
        }

        // Persistent congestion: everything sent over the period ending at the newest lost
        // packet was lost
        let congestion_period = self.pto(space_id) * self.config.persistent_congestion_threshold;
        let in_persistent_congestion = self.rtt.smoothed.is_some()
            && largest_lost_sent
                .checked_sub(congestion_period)
                .map_or(false, |start| {
                    self.spaces[space_id].largest_acked_packet_sent < start
                });

        self.stats.congestion_events += 1;
        self.congestion.on_congestion_event(
            now,
            largest_lost_sent,
            in_persistent_congestion,
            lost_bytes,
        );
        debug!(
            window = self.congestion.window(),
            persistent = in_persistent_congestion,
            "congestion event"
        );
    }

    fn earliest_time_and_space(
        &self,
        get: impl Fn(&super::spaces::PacketSpace) -> Option<Instant>,
    ) -> Option<(Instant, SpaceId)> {
        SpaceId::VALUES
            .into_iter()
            .filter_map(|id| get(&self.spaces[id]).map(|x| (x, id)))
            .min_by_key(|&(time, _)| time)
    }

    pub(super) fn set_loss_detection_timer(&mut self) {
        if let Some((loss_time, _)) = self.earliest_time_and_space(|x| x.loss_time) {
            // Time threshold loss detection.
            self.timers.set(Timer::LossDetection, loss_time);
            return;
        }

        // Arm the probe timeout from the space whose deadline comes first
        let backoff = 2u32.pow(cmp::min(self.pto_count, MAX_BACKOFF_EXPONENT));
        let deadline = SpaceId::VALUES
            .into_iter()
            .filter(|&id| self.spaces[id].ack_eliciting_in_flight > 0)
            .filter_map(|id| {
                let sent = self.spaces[id].time_of_last_ack_eliciting_packet?;
                Some(sent + self.pto(id) * backoff)
            })
            .min();
        match deadline {
            Some(deadline) => self.timers.set(Timer::LossDetection, deadline),
            None => self.timers.stop(Timer::LossDetection),
        }
    }

    /// Probe timeout for packets of `space`, before backoff
    pub(super) fn pto(&self, space: SpaceId) -> Duration {
        let max_ack_delay = match space {
            SpaceId::Data => self.max_ack_delay(),
            SpaceId::Initial | SpaceId::Handshake => Duration::ZERO,
        };
        self.rtt.pto_base() + max_ack_delay
    }

    fn max_ack_delay(&self) -> Duration {
        Duration::from_millis(self.peer_params.max_ack_delay.into_inner())
    }

    /// Forget a packet number space, and every packet in flight in it
    ///
    /// Packets dropped this way are neither acknowledged nor lost for congestion control.
    pub(super) fn discard_space(&mut self, space_id: SpaceId) {
        debug_assert!(space_id != SpaceId::Data);
        trace!("discarding {:?} keys", space_id);
        let space = &mut self.spaces[space_id];
        space.crypto = None;
        space.time_of_last_ack_eliciting_packet = None;
        space.loss_time = None;
        space.loss_probes = 0;
        space.pending = Default::default();
        let dropped = mem::take(&mut space.sent_packets).len();
        trace!(dropped, "discarded {:?} packets in flight", space_id);
        space.in_flight = 0;
        space.ack_eliciting_in_flight = 0;
        self.set_loss_detection_timer();
    }

    /// Bytes of congestion-controlled packets not yet acknowledged or declared lost
    pub fn bytes_in_flight(&self) -> u64 {
        self.spaces.iter().map(|x| x.in_flight).sum()
    }

    /// Whether a congestion-controlled packet of the largest size may not be sent now
    pub(super) fn congestion_blocked(&self) -> bool {
        self.bytes_in_flight() + u64::from(self.config.mtu) > self.congestion.window()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_replaces_initial() {
        let mut rtt = RttEstimator::new(Duration::from_millis(333));
        assert_eq!(rtt.get(), Duration::from_millis(333));
        assert_eq!(rtt.pto_base(), Duration::from_millis(333 * 3));
        rtt.update(Duration::ZERO, Duration::from_millis(100));
        assert_eq!(rtt.get(), Duration::from_millis(100));
        assert_eq!(rtt.var(), Duration::from_millis(50));
        assert_eq!(rtt.min(), Duration::from_millis(100));
    }

    #[test]
    fn smoothing() {
        let mut rtt = RttEstimator::new(Duration::from_millis(333));
        rtt.update(Duration::ZERO, Duration::from_millis(80));
        rtt.update(Duration::ZERO, Duration::from_millis(160));
        // 7/8 * 80 + 1/8 * 160
        assert_eq!(rtt.get(), Duration::from_millis(90));
        // 3/4 * 40 + 1/4 * 80
        assert_eq!(rtt.var(), Duration::from_millis(50));
        assert_eq!(rtt.loss_delay(), Duration::from_millis(290));
    }

    #[test]
    fn ack_delay_respects_min_rtt() {
        let mut rtt = RttEstimator::new(Duration::from_millis(333));
        rtt.update(Duration::ZERO, Duration::from_millis(100));
        // Subtracting the delay would go below min_rtt, so the sample is used as is
        rtt.update(Duration::from_millis(50), Duration::from_millis(120));
        assert_eq!(rtt.get(), Duration::from_micros(102_500));
        // Now it can be subtracted
        rtt.update(Duration::from_millis(20), Duration::from_millis(140));
        assert_eq!(rtt.min(), Duration::from_millis(100));
        assert_eq!(rtt.get(), Duration::from_nanos(104_687_500));
    }

    #[test]
    fn loss_delay_floor() {
        let mut rtt = RttEstimator::new(Duration::from_millis(333));
        rtt.update(Duration::ZERO, Duration::from_micros(10));
        for _ in 0..100 {
            rtt.update(Duration::ZERO, Duration::from_micros(10));
        }
        assert_eq!(rtt.loss_delay(), TIMER_GRANULARITY);
    }
}
