use std::{
    cmp,
    collections::{BTreeMap, VecDeque},
    mem,
    ops::{BitOrAssign, Index, IndexMut},
    time::Instant,
};

use rustc_hash::FxHashSet;

use super::assembler::Assembler;
use crate::{crypto::Keys, frame, packet::SpaceId, range_set::RangeSet, StreamId, VarInt};

/// Most ACK ranges kept for a single space; older ranges are forgotten first
const MAX_ACK_RANGES: usize = 64;

pub(super) struct PacketSpace {
    pub(super) crypto: Option<Keys>,
    pub(super) dedup: Dedup,
    /// Highest received packet number
    pub(super) rx_packet: u64,

    /// Data to send
    pub(super) pending: Retransmits,
    /// Packet numbers to acknowledge
    pub(super) pending_acks: PendingAcks,

    /// The packet number of the next packet that will be sent, if any
    pub(super) next_packet_number: u64,
    /// The largest packet number the remote peer acknowledged in an ACK frame
    pub(super) largest_acked_packet: Option<u64>,
    pub(super) largest_acked_packet_sent: Instant,
    /// Transmitted but not acked
    pub(super) sent_packets: BTreeMap<u64, SentPacket>,
    /// Sum of the sizes of the congestion-controlled packets in `sent_packets`
    pub(super) in_flight: u64,
    /// Number of ack-eliciting packets in `sent_packets`
    pub(super) ack_eliciting_in_flight: u64,

    /// Handshake bytes received in CRYPTO frames
    pub(super) crypto_stream: Assembler,
    /// Current offset of outgoing cryptographic handshake stream
    pub(super) crypto_offset: u64,

    pub(super) time_of_last_ack_eliciting_packet: Option<Instant>,
    /// The time at which the earliest sent packet in this space will be considered lost based on
    /// exceeding the reordering window in time
    pub(super) loss_time: Option<Instant>,
    /// Number of tail loss probes to send
    pub(super) loss_probes: u32,
    pub(super) ping_pending: bool,
}

impl PacketSpace {
    pub(super) fn new(now: Instant) -> Self {
        Self {
            crypto: None,
            dedup: Dedup::new(),
            rx_packet: 0,

            pending: Retransmits::default(),
            pending_acks: PendingAcks::default(),

            next_packet_number: 0,
            largest_acked_packet: None,
            largest_acked_packet_sent: now,
            sent_packets: BTreeMap::new(),
            in_flight: 0,
            ack_eliciting_in_flight: 0,

            crypto_stream: Assembler::new(),
            crypto_offset: 0,

            time_of_last_ack_eliciting_packet: None,
            loss_time: None,
            loss_probes: 0,
            ping_pending: false,
        }
    }

    /// Queue something for a probe packet after a probe timeout
    ///
    /// New data is preferred. Without any, the retransmittable frames of the oldest packet still
    /// in flight are sent again, and as a last resort a PING.
    pub(super) fn maybe_queue_probe(&mut self, streams_pending: bool) {
        if self.loss_probes == 0 || !self.pending.is_empty() || streams_pending {
            return;
        }

        for packet in self.sent_packets.values_mut() {
            if !packet.retransmits.is_empty() {
                // Taken rather than cloned, so the frames are not resent a third time when only
                // the probe's copy is acknowledged
                self.pending |= mem::take(&mut packet.retransmits);
                return;
            }
        }

        self.ping_pending = true;
    }

    pub(super) fn get_tx_number(&mut self) -> u64 {
        assert!(self.next_packet_number < 2u64.pow(62));
        let x = self.next_packet_number;
        self.next_packet_number += 1;
        x
    }

    pub(super) fn can_send(&self, streams_pending: bool) -> SendableFrames {
        let acks = self.pending_acks.can_send();
        let other =
            !self.pending.is_empty() || self.ping_pending || (streams_pending && self.crypto.is_some());
        SendableFrames { acks, other }
    }

    /// Stop tracking a sent packet, returning its record
    pub(super) fn take(&mut self, number: u64) -> Option<SentPacket> {
        let packet = self.sent_packets.remove(&number)?;
        if packet.in_flight {
            self.in_flight -= u64::from(packet.size);
        }
        if packet.ack_eliciting {
            self.ack_eliciting_in_flight -= 1;
        }
        Some(packet)
    }

    /// Start tracking a sent packet
    pub(super) fn sent(&mut self, number: u64, packet: SentPacket) {
        if packet.in_flight {
            self.in_flight += u64::from(packet.size);
        }
        if packet.ack_eliciting {
            self.ack_eliciting_in_flight += 1;
        }
        self.sent_packets.insert(number, packet);
    }
}

impl Index<SpaceId> for [PacketSpace; 3] {
    type Output = PacketSpace;
    fn index(&self, space: SpaceId) -> &PacketSpace {
        &self.as_ref()[space as usize]
    }
}

impl IndexMut<SpaceId> for [PacketSpace; 3] {
    fn index_mut(&mut self, space: SpaceId) -> &mut PacketSpace {
        &mut self.as_mut()[space as usize]
    }
}

/// Represents one or more packets subject to retransmission
#[derive(Debug, Clone)]
pub(super) struct SentPacket {
    /// The time the packet was sent
    pub(super) time_sent: Instant,
    /// The number of bytes sent in the packet, including header and tag
    pub(super) size: u16,
    /// Whether an acknowledgement is expected directly in response to this packet
    pub(super) ack_eliciting: bool,
    /// Whether the packet counts towards bytes in flight
    pub(super) in_flight: bool,
    /// The largest packet number acknowledged by the ACK frame this packet carried, if any
    pub(super) largest_acked: Option<u64>,
    /// Data which needs to be retransmitted in case the packet is lost
    pub(super) retransmits: Retransmits,
    /// Metadata for stream frames in a packet
    pub(super) stream_frames: Vec<frame::StreamMeta>,
}

/// Retransmittable data queue
#[derive(Debug, Default, Clone)]
pub(crate) struct Retransmits {
    pub(super) max_data: bool,
    pub(super) max_stream_id: [bool; 2],
    pub(super) reset_stream: Vec<(StreamId, VarInt)>,
    pub(super) stop_sending: Vec<frame::StopSending>,
    pub(super) max_stream_data: FxHashSet<StreamId>,
    pub(super) crypto: VecDeque<frame::Crypto>,
    pub(super) handshake_done: bool,
}

impl Retransmits {
    pub(super) fn is_empty(&self) -> bool {
        !self.max_data
            && !self.max_stream_id.iter().any(|x| *x)
            && self.reset_stream.is_empty()
            && self.stop_sending.is_empty()
            && self.max_stream_data.is_empty()
            && self.crypto.is_empty()
            && !self.handshake_done
    }
}

impl BitOrAssign for Retransmits {
    fn bitor_assign(&mut self, rhs: Self) {
        // Lost handshake data goes ahead of data not yet sent
        self.max_data |= rhs.max_data;
        for dir in 0..2 {
            self.max_stream_id[dir] |= rhs.max_stream_id[dir];
        }
        self.reset_stream.extend_from_slice(&rhs.reset_stream);
        self.stop_sending.extend_from_slice(&rhs.stop_sending);
        self.max_stream_data.extend(&rhs.max_stream_data);
        for crypto in rhs.crypto.into_iter().rev() {
            self.crypto.push_front(crypto);
        }
        self.handshake_done |= rhs.handshake_done;
    }
}

/// Sliding window of recently authenticated packet numbers
///
/// Bit `n` of `window` stands for packet `next - 2 - n`; packets older than the window are
/// treated as already seen.
pub(super) struct Dedup {
    window: Window,
    /// Lowest packet number higher than all yet authenticated.
    next: u64,
}

type Window = u128;

/// Number of packets tracked by `Dedup`.
const WINDOW_SIZE: u64 = 1 + mem::size_of::<Window>() as u64 * 8;

impl Dedup {
    /// Construct an empty window positioned at the start.
    pub(super) fn new() -> Self {
        Self { window: 0, next: 0 }
    }

    /// Highest packet number authenticated.
    fn highest(&self) -> u64 {
        self.next - 1
    }

    /// Record a newly authenticated packet number.
    ///
    /// Returns whether the packet might be a duplicate.
    pub(super) fn insert(&mut self, packet: u64) -> bool {
        if let Some(diff) = packet.checked_sub(self.next) {
            // Right of window
            self.window = ((self.window << 1) | 1)
                .checked_shl(cmp::min(diff, u64::from(u32::MAX)) as u32)
                .unwrap_or(0);
            self.next = packet + 1;
            false
        } else if self.highest() - packet < WINDOW_SIZE {
            // Within window
            if let Some(bit) = (self.highest() - packet).checked_sub(1) {
                // < highest
                let mask = 1 << bit;
                let duplicate = self.window & mask != 0;
                self.window |= mask;
                duplicate
            } else {
                // == highest
                true
            }
        } else {
            // Left of window
            true
        }
    }
}

/// Indicates which data is available for sending
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(super) struct SendableFrames {
    pub(super) acks: bool,
    pub(super) other: bool,
}

/// Packet numbers we owe the peer an acknowledgement for
#[derive(Debug, Default)]
pub(super) struct PendingAcks {
    /// Whether an ack-eliciting packet arrived since the last ACK we sent
    immediate_ack_required: bool,
    /// The packet number and receive time of the largest packet received
    largest_packet: Option<(u64, Instant)>,
    ranges: RangeSet,
}

impl PendingAcks {
    /// Record a received packet, returning whether it was the largest seen so far
    pub(super) fn packet_received(&mut self, now: Instant, number: u64, ack_eliciting: bool) -> bool {
        self.immediate_ack_required |= ack_eliciting;
        self.ranges.insert_one(number);
        if self.ranges.len() > MAX_ACK_RANGES {
            self.ranges.pop_min();
        }
        match self.largest_packet {
            Some((largest, _)) if largest >= number => false,
            _ => {
                self.largest_packet = Some((number, now));
                true
            }
        }
    }

    /// Whether an ACK frame should be sent at the next opportunity
    pub(super) fn can_send(&self) -> bool {
        self.immediate_ack_required && !self.ranges.is_empty()
    }

    /// Time elapsed since the largest packet was received
    pub(super) fn ack_delay(&self, now: Instant) -> std::time::Duration {
        self.largest_packet
            .map_or(std::time::Duration::ZERO, |(_, received)| {
                now.saturating_duration_since(received)
            })
    }

    /// Should be called whenever ACKs have been sent
    pub(super) fn acks_sent(&mut self) {
        self.immediate_ack_required = false;
    }

    /// Forget packets the peer is known to have seen our acknowledgement for
    pub(super) fn subtract_below(&mut self, max: u64) {
        self.ranges.remove(0..(max + 1));
    }

    pub(super) fn ranges(&self) -> &RangeSet {
        &self.ranges
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sanity() {
        let mut dedup = Dedup::new();
        assert!(!dedup.insert(0));
        assert_eq!(dedup.next, 1);
        assert_eq!(dedup.window, 0b1);
        assert!(dedup.insert(0));
        assert_eq!(dedup.next, 1);
        assert_eq!(dedup.window, 0b1);
        assert!(!dedup.insert(1));
        assert_eq!(dedup.next, 2);
        assert_eq!(dedup.window, 0b11);
        assert!(!dedup.insert(2));
        assert_eq!(dedup.next, 3);
        assert_eq!(dedup.window, 0b111);
        assert!(!dedup.insert(4));
        assert_eq!(dedup.next, 5);
        assert_eq!(dedup.window, 0b11110);
        assert!(!dedup.insert(7));
        assert_eq!(dedup.next, 8);
        assert_eq!(dedup.window, 0b1111_0100);
        assert!(dedup.insert(4));
        assert!(!dedup.insert(3));
        assert_eq!(dedup.next, 8);
        assert_eq!(dedup.window, 0b1111_1100);
        assert!(!dedup.insert(6));
        assert_eq!(dedup.next, 8);
        assert_eq!(dedup.window, 0b1111_1101);
        assert!(!dedup.insert(5));
        assert_eq!(dedup.next, 8);
        assert_eq!(dedup.window, 0b1111_1111);
    }

    #[test]
    fn happypath() {
        let mut dedup = Dedup::new();
        for i in 0..(2 * WINDOW_SIZE) {
            assert!(!dedup.insert(i));
            for j in 0..=i {
                assert!(dedup.insert(j));
            }
        }
    }

    #[test]
    fn jump() {
        let mut dedup = Dedup::new();
        dedup.insert(2 * WINDOW_SIZE);
        assert!(dedup.insert(WINDOW_SIZE));
        assert_eq!(dedup.next, 2 * WINDOW_SIZE + 1);
        assert_eq!(dedup.window, 0);
        assert!(!dedup.insert(WINDOW_SIZE + 1));
        assert_eq!(dedup.next, 2 * WINDOW_SIZE + 1);
        assert_eq!(dedup.window, 1 << (WINDOW_SIZE - 2));
    }

    #[test]
    fn ack_ranges_bounded() {
        let now = Instant::now();
        let mut acks = PendingAcks::default();
        // Every other packet, so no two ranges merge
        for i in 0..(2 * MAX_ACK_RANGES as u64 + 10) {
            acks.packet_received(now, 2 * i, true);
        }
        assert_eq!(acks.ranges().len(), MAX_ACK_RANGES);
        assert!(acks.can_send());
        acks.acks_sent();
        assert!(!acks.can_send());
    }

    #[test]
    fn ack_ranges_pruned() {
        let now = Instant::now();
        let mut acks = PendingAcks::default();
        for i in [0, 1, 2, 5, 6, 9] {
            acks.packet_received(now, i, i != 9);
        }
        acks.subtract_below(5);
        assert_eq!(acks.ranges().iter().collect::<Vec<_>>(), [6..7, 9..10]);
    }

    #[test]
    fn probe_takes_oldest_retransmits() {
        let now = Instant::now();
        let mut space = PacketSpace::new(now);
        for (number, handshake_done) in [(0, false), (1, true), (2, true)] {
            space.sent(
                number,
                SentPacket {
                    time_sent: now,
                    size: 100,
                    ack_eliciting: true,
                    in_flight: true,
                    largest_acked: None,
                    retransmits: Retransmits {
                        handshake_done,
                        ..Retransmits::default()
                    },
                    stream_frames: Vec::new(),
                },
            );
        }
        assert_eq!(space.in_flight, 300);
        space.loss_probes = 1;
        space.maybe_queue_probe(false);
        assert!(space.pending.handshake_done);
        assert!(space.sent_packets[&1].retransmits.is_empty());
        assert!(!space.sent_packets[&2].retransmits.is_empty());
        assert!(!space.ping_pending);

        // With nothing left to retransmit, fall back on a PING
        let mut space = PacketSpace::new(now);
        space.loss_probes = 1;
        space.maybe_queue_probe(false);
        assert!(space.ping_pending);
    }
}
