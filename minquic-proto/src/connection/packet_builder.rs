use std::time::Instant;

use bytes::{BufMut, Bytes};
use tracing::{trace, trace_span};

use super::{spaces::SentPacket, Connection, SentFrames};
use crate::{
    packet::{Header, PacketNumber, PartialEncode, SpaceId},
    telemetry,
};

/// Writes one packet into a datagram buffer
///
/// The header is written by [`PacketBuilder::new`]; the caller appends frames to the same buffer,
/// staying below `max_size`, and [`PacketBuilder::finish_and_track`] pads, seals and records the
/// packet.
pub(super) struct PacketBuilder {
    pub(super) space: SpaceId,
    pub(super) partial_encode: PartialEncode,
    pub(super) exact_number: u64,
    pub(super) ack_eliciting: bool,
    /// Smallest absolute position in the buffer that must be occupied by this packet's frames
    pub(super) min_size: usize,
    /// Largest absolute position in the buffer that frames may extend to
    pub(super) max_size: usize,
    datagram_start: usize,
    pub(super) tag_len: usize,
    _span: tracing::span::EnteredSpan,
}

impl PacketBuilder {
    /// Write a new packet header to `buf`
    ///
    /// `datagram_start` and `datagram_max` bound the datagram the packet is coalesced into.
    /// Returns `None` if the space has no keys.
    pub(super) fn new(
        space_id: SpaceId,
        buf: &mut Vec<u8>,
        datagram_start: usize,
        datagram_max: usize,
        conn: &mut Connection,
    ) -> Option<Self> {
        let rem_cid = conn.rem_cid;
        let loc_cid = conn.loc_cid;
        let space = &mut conn.spaces[space_id];
        let (sample_size, tag_len) = match space.crypto {
            Some(ref crypto) => (
                crypto.header.local.sample_size(),
                crypto.packet.local.tag_len(),
            ),
            None => return None,
        };

        let exact_number = space.get_tx_number();
        let span = trace_span!("send", space = ?space_id, pn = exact_number).entered();
        let number = PacketNumber::new(exact_number, space.largest_acked_packet);
        let header = match space_id {
            SpaceId::Initial => Header::Initial {
                dst_cid: rem_cid,
                src_cid: loc_cid,
                token: Bytes::new(),
                number,
            },
            SpaceId::Handshake => Header::Handshake {
                dst_cid: rem_cid,
                src_cid: loc_cid,
                number,
            },
            SpaceId::Data => Header::Short {
                key_phase: false,
                dst_cid: rem_cid,
                number,
            },
        };
        let partial_encode = header.encode(buf);

        // pn_len + payload_len + tag_len >= sample_size + 4, so header protection can be sampled
        let min_size = buf.len() + (sample_size + 4).saturating_sub(number.len() + tag_len);
        let max_size = datagram_max - tag_len;
        debug_assert!(max_size >= min_size);

        Some(Self {
            space: space_id,
            partial_encode,
            exact_number,
            ack_eliciting: false,
            min_size,
            max_size,
            datagram_start,
            tag_len,
            _span: span,
        })
    }

    /// Pad the packet so the enclosing datagram occupies at least `min_size` bytes once sealed
    pub(super) fn pad_to(&mut self, min_size: u16) {
        self.min_size = Ord::max(
            self.min_size,
            self.datagram_start + usize::from(min_size) - self.tag_len,
        );
    }

    /// Seal the packet and start tracking it for acknowledgement and loss
    pub(super) fn finish_and_track(
        self,
        now: Instant,
        conn: &mut Connection,
        buf: &mut Vec<u8>,
        sent: SentFrames,
    ) {
        let ack_eliciting = self.ack_eliciting;
        let exact_number = self.exact_number;
        let space_id = self.space;
        let (size, padded) = self.finish(conn, buf);
        let size = u16::try_from(size).unwrap_or(u16::MAX);

        // ACK-only packets do not count against the congestion window
        let in_flight = ack_eliciting || padded;
        let packet = SentPacket {
            time_sent: now,
            size,
            ack_eliciting,
            in_flight,
            largest_acked: sent.largest_acked,
            retransmits: sent.retransmits,
            stream_frames: sent.stream_frames,
        };
        conn.spaces[space_id].sent(exact_number, packet);
        conn.stats.packets_sent += 1;
        conn.emit(
            now,
            telemetry::Event::PacketSent {
                space: space_id,
                number: exact_number,
                size,
                ack_eliciting,
            },
        );

        if in_flight {
            if ack_eliciting {
                conn.spaces[space_id].time_of_last_ack_eliciting_packet = Some(now);
                if conn.permit_idle_reset {
                    conn.reset_idle_timeout(now);
                }
                conn.permit_idle_reset = false;
            }
            conn.set_loss_detection_timer();
        }
    }

    /// Encrypt the packet, returning its length and whether padding was added
    pub(super) fn finish(self, conn: &Connection, buf: &mut Vec<u8>) -> (usize, bool) {
        debug_assert!(buf.len() <= self.max_size, "packet exceeds maximum size");
        let pad = buf.len() < self.min_size;
        if pad {
            trace!("PADDING * {}", self.min_size - buf.len());
            buf.resize(self.min_size, 0);
        }

        let Some(ref crypto) = conn.spaces[self.space].crypto else {
            unreachable!("builder created without keys for {:?}", self.space);
        };
        buf.put_bytes(0, self.tag_len);
        let start = self.partial_encode.start;
        self.partial_encode.finish(
            buf,
            &*crypto.header.local,
            self.exact_number,
            &*crypto.packet.local,
        );

        let packet_len = buf.len() - start;
        trace!(size = packet_len, "wrote packet");
        (packet_len, pad)
    }
}
