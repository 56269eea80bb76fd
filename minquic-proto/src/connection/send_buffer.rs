use std::{collections::VecDeque, ops::Range};

use bytes::{Buf, Bytes};

use crate::range_set::RangeSet;

/// Buffer of outgoing retransmittable stream data
#[derive(Default, Debug)]
pub(super) struct SendBuffer {
    /// Data queued by the application but not yet acknowledged. May or may not have been sent.
    unacked_segments: VecDeque<Bytes>,
    /// Total size of `unacked_segments`
    unacked_len: usize,
    /// The first offset that hasn't been written by the application, i.e. the offset past the end of `unacked`
    offset: u64,
    /// The first offset that hasn't been sent
    ///
    /// Always lies in (offset - unacked.len())..offset
    unsent: u64,
    /// Acknowledged ranges which couldn't be discarded yet as they don't include the earliest
    /// offset in `unacked`
    acks: RangeSet,
    /// Previously transmitted ranges deemed lost
    retransmits: RangeSet,
}

impl SendBuffer {
    /// Construct an empty buffer at the initial offset
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Append application data to the end of the stream
    pub(super) fn write(&mut self, data: Bytes) {
        self.unacked_len += data.len();
        self.offset += data.len() as u64;
        self.unacked_segments.push_back(data);
    }

    /// Discard a range of acknowledged stream data
    pub(super) fn ack(&mut self, mut range: Range<u64>) {
        // Clamp the range to data which is still tracked
        let base_offset = self.offset - self.unacked_len as u64;
        range.start = base_offset.max(range.start);
        range.end = base_offset.max(range.end);

        self.acks.insert(range);

        while self.acks.min() == Some(self.offset - self.unacked_len as u64) {
            let Some(prefix) = self.acks.pop_min() else {
                break;
            };
            let mut to_advance = (prefix.end - prefix.start) as usize;

            self.unacked_len -= to_advance;
            while to_advance > 0 {
                let Some(front) = self.unacked_segments.front_mut() else {
                    break;
                };

                if front.len() <= to_advance {
                    to_advance -= front.len();
                    self.unacked_segments.pop_front();
                } else {
                    front.advance(to_advance);
                    to_advance = 0;
                }
            }
        }
    }

    /// Compute the next range of at most `max_len` bytes to transmit and mark it sent
    ///
    /// Ranges deemed lost are sent before new data.
    pub(super) fn poll_transmit(&mut self, max_len: usize) -> Range<u64> {
        if let Some(range) = self.retransmits.pop_min() {
            let end = range.end.min((max_len as u64).saturating_add(range.start));
            if end != range.end {
                self.retransmits.insert(end..range.end);
            }
            return range.start..end;
        }

        let end = self
            .offset
            .min((max_len as u64).saturating_add(self.unsent));
        let result = self.unsent..end;
        self.unsent = end;
        result
    }

    /// Returns data which is associated with a range
    ///
    /// This function can return a subset of the range, if the data is stored
    /// in noncontiguous fashion in the send buffer. In this case callers
    /// should call the function again with an incremented start offset to
    /// retrieve more data.
    pub(super) fn get(&self, offsets: Range<u64>) -> &[u8] {
        let base_offset = self.offset - self.unacked_len as u64;

        let mut segment_offset = base_offset;
        for segment in self.unacked_segments.iter() {
            if offsets.start >= segment_offset
                && offsets.start < segment_offset + segment.len() as u64
            {
                let start = (offsets.start - segment_offset) as usize;
                let end = (offsets.end - segment_offset) as usize;

                return &segment[start..end.min(segment.len())];
            }
            segment_offset += segment.len() as u64;
        }

        &[]
    }

    /// Queue a range of sent but unacknowledged data to be retransmitted
    pub(super) fn retransmit(&mut self, range: Range<u64>) {
        debug_assert!(range.end <= self.unsent, "unsent data can't be lost");
        // Acknowledged portions need not be resent
        let base_offset = self.offset - self.unacked_len as u64;
        let start = range.start.max(base_offset);
        if start < range.end {
            self.retransmits.insert(start..range.end);
            for acked in self.acks.iter() {
                self.retransmits.remove(acked);
            }
        }
    }

    /// First stream offset unwritten by the application, i.e. the offset that the next write will
    /// begin at
    pub(super) fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether all sent data has been acknowledged
    pub(super) fn is_fully_acked(&self) -> bool {
        self.unacked_len == 0
    }

    /// Whether there's data to send
    ///
    /// There may be sent unacknowledged data even when this is false.
    pub(super) fn has_unsent_data(&self) -> bool {
        self.unsent != self.offset || !self.retransmits.is_empty()
    }

    /// Compute the amount of data that hasn't been acknowledged
    pub(super) fn unacked(&self) -> u64 {
        self.unacked_len as u64 - self.acks.iter().map(|x| x.end - x.start).sum::<u64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment() {
        let mut buf = SendBuffer::new();
        const MSG: &[u8] = b"Hello, world!";
        buf.write(MSG.into());
        assert_eq!(buf.poll_transmit(5), 0..5);
        assert_eq!(buf.get(0..5), b"Hello");
        assert_eq!(buf.poll_transmit(100), 5..MSG.len() as u64);
        assert_eq!(buf.poll_transmit(100), MSG.len() as u64..MSG.len() as u64);
        assert!(!buf.has_unsent_data());
    }

    #[test]
    fn multiple_segments() {
        let mut buf = SendBuffer::new();
        buf.write(Bytes::from_static(b"Hello, "));
        buf.write(Bytes::from_static(b"world!"));
        assert_eq!(buf.poll_transmit(100), 0..13);
        assert_eq!(buf.get(0..13), b"Hello, ");
        assert_eq!(buf.get(7..13), b"world!");
        assert_eq!(buf.get(5..9), b", ");
    }

    #[test]
    fn retransmit_before_new_data() {
        let mut buf = SendBuffer::new();
        buf.write(Bytes::from_static(b"0123456789"));
        assert_eq!(buf.poll_transmit(4), 0..4);
        assert_eq!(buf.poll_transmit(4), 4..8);
        buf.retransmit(0..4);
        assert_eq!(buf.poll_transmit(2), 0..2);
        assert_eq!(buf.poll_transmit(10), 2..4);
        assert_eq!(buf.poll_transmit(10), 8..10);
    }

    #[test]
    fn ack_discards_prefix() {
        let mut buf = SendBuffer::new();
        buf.write(Bytes::from_static(b"0123456789"));
        buf.poll_transmit(10);
        buf.ack(4..8);
        assert_eq!(buf.unacked(), 6);
        assert!(!buf.is_fully_acked());

        // Acknowledged bytes are skipped when the surrounding range is lost
        buf.retransmit(0..10);
        assert_eq!(buf.poll_transmit(100), 0..4);
        assert_eq!(buf.poll_transmit(100), 8..10);

        buf.ack(0..4);
        assert_eq!(buf.get(8..10), b"89");
        buf.ack(8..10);
        assert!(buf.is_fully_acked());
        assert_eq!(buf.offset(), 10);
    }
}
