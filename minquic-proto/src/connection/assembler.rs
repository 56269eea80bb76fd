use std::{
    cmp::Ordering,
    collections::{binary_heap::PeekMut, BinaryHeap},
    mem,
};

use bytes::{Buf, Bytes, BytesMut};

/// Helper to assemble unordered stream frames into an ordered stream
#[derive(Debug, Default)]
pub(crate) struct Assembler {
    data: BinaryHeap<Chunk>,
    defragmented: usize,
    /// Length of the contiguous prefix of the stream which has been consumed by the application
    bytes_read: u64,
    /// Whether to discard data
    stopped: bool,
}

impl Assembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Take up to `max_length` contiguous bytes starting at the read offset
    pub(crate) fn read(&mut self, max_length: usize) -> Option<Bytes> {
        loop {
            let mut chunk = self.data.peek_mut()?;

            if chunk.offset > self.bytes_read {
                // Gap before the next chunk
                return None;
            }
            if chunk.offset + chunk.bytes.len() as u64 <= self.bytes_read {
                // Entirely duplicate data
                mem::drop(chunk);
                self.pop();
                continue;
            }

            let start = (self.bytes_read - chunk.offset) as usize;
            if start > 0 {
                chunk.bytes.advance(start);
                chunk.offset += start as u64;
            }

            return Some(if max_length < chunk.bytes.len() {
                self.bytes_read += max_length as u64;
                let offset = chunk.offset;
                chunk.offset += max_length as u64;
                let data = chunk.bytes.split_to(max_length);
                debug_assert_eq!(offset + max_length as u64, chunk.offset);
                data
            } else {
                // The trimmed chunk must leave the heap itself; other chunks may now sort before it
                self.bytes_read += chunk.bytes.len() as u64;
                self.defragmented = self.defragmented.saturating_sub(1);
                PeekMut::pop(chunk).bytes
            });
        }
    }

    // Copy the buffered chunk data to new chunks backed by a single buffer to
    // make sure we're not unnecessarily holding on to many larger allocations.
    // Merge contiguous chunks in the process of doing so.
    fn defragment(&mut self) {
        let Some(first) = self.data.peek() else {
            return;
        };
        let mut offset = first.offset;
        let buffered = self.data.iter().map(|c| c.bytes.len()).sum::<usize>();
        let mut buffer = BytesMut::with_capacity(buffered);

        let new = BinaryHeap::with_capacity(self.data.len());
        let old = mem::replace(&mut self.data, new);
        for chunk in old.into_sorted_vec().into_iter().rev() {
            let end = offset + (buffer.len() as u64);
            if let Some(overlap) = end.checked_sub(chunk.offset) {
                if let Some(bytes) = chunk.bytes.get(overlap as usize..) {
                    buffer.extend_from_slice(bytes);
                }
            } else {
                let bytes = buffer.split().freeze();
                self.data.push(Chunk { offset, bytes });
                offset = chunk.offset;
                buffer.extend_from_slice(&chunk.bytes);
            }
        }

        let bytes = buffer.split().freeze();
        self.data.push(Chunk { offset, bytes });
        self.defragmented = self.data.len();
    }

    fn pop(&mut self) -> Option<(u64, Bytes)> {
        self.defragmented = self.defragmented.saturating_sub(1);
        self.data.pop().map(|x| (x.offset, x.bytes))
    }

    pub(crate) fn insert(&mut self, mut offset: u64, mut bytes: Bytes) {
        let end = offset + bytes.len() as u64;
        if self.stopped || end <= self.bytes_read {
            return;
        }
        if offset < self.bytes_read {
            // Already delivered
            bytes.advance((self.bytes_read - offset) as usize);
            offset = self.bytes_read;
        }
        if bytes.is_empty() {
            return;
        }
        self.data.push(Chunk { offset, bytes });
        // Bound the memory pinned by many small reference-counted chunks
        if self.data.len() - self.defragmented > 32 {
            self.defragment()
        }
    }

    /// Number of bytes consumed by the application
    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Discard buffered data and do not buffer future data, but continue tracking offsets.
    pub(crate) fn stop(&mut self) {
        self.stopped = true;
        self.data.clear();
        self.defragmented = 0;
    }
}

#[derive(Debug, Eq)]
struct Chunk {
    offset: u64,
    bytes: Bytes,
}

impl Ord for Chunk {
    // Invert ordering based on offset (max-heap, min offset first),
    // prioritize longer chunks at the same offset.
    fn cmp(&self, other: &Self) -> Ordering {
        self.offset
            .cmp(&other.offset)
            .reverse()
            .then(self.bytes.len().cmp(&other.bytes.len()))
    }
}

impl PartialOrd for Chunk {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        (self.offset, self.bytes.len()) == (other.offset, other.bytes.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn next(x: &mut Assembler, size: usize) -> Option<Bytes> {
        x.read(size)
    }

    fn read_all(x: &mut Assembler) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = x.read(usize::MAX) {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn assemble_ordered() {
        let mut x = Assembler::new();
        assert_matches!(next(&mut x, 32), None);
        x.insert(0, Bytes::from_static(b"123"));
        assert_matches!(next(&mut x, 1), Some(ref y) if &y[..] == b"1");
        assert_matches!(next(&mut x, 3), Some(ref y) if &y[..] == b"23");
        x.insert(3, Bytes::from_static(b"456"));
        assert_matches!(next(&mut x, 32), Some(ref y) if &y[..] == b"456");
        x.insert(6, Bytes::from_static(b"789"));
        x.insert(9, Bytes::from_static(b"10"));
        assert_eq!(read_all(&mut x), b"78910");
        assert_matches!(next(&mut x, 32), None);
    }

    #[test]
    fn assemble_unordered() {
        let mut x = Assembler::new();
        x.insert(3, Bytes::from_static(b"456"));
        assert_matches!(next(&mut x, 32), None);
        x.insert(0, Bytes::from_static(b"123"));
        assert_eq!(read_all(&mut x), b"123456");
        assert_eq!(x.bytes_read(), 6);
    }

    #[test]
    fn assemble_duplicate() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"123"));
        x.insert(0, Bytes::from_static(b"123"));
        assert_eq!(read_all(&mut x), b"123");
        x.insert(0, Bytes::from_static(b"123"));
        assert_matches!(next(&mut x, 32), None);
    }

    #[test]
    fn assemble_overlapping() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"123"));
        x.insert(1, Bytes::from_static(b"234"));
        x.insert(2, Bytes::from_static(b"3456"));
        assert_eq!(read_all(&mut x), b"123456");
        assert_eq!(x.bytes_read(), 6);
    }

    #[test]
    fn overlapping_tail_read_after_trim() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"12345"));
        x.insert(2, Bytes::from_static(b"3456"));
        x.insert(3, Bytes::from_static(b"4567"));
        assert_matches!(next(&mut x, 2), Some(ref y) if &y[..] == b"12");
        assert_eq!(read_all(&mut x), b"34567");
        x.insert(1, Bytes::from_static(b"234567"));
        assert_matches!(next(&mut x, 32), None);
        x.insert(6, Bytes::from_static(b"789"));
        assert_eq!(read_all(&mut x), b"89");
    }

    #[test]
    fn gap_blocks_reads() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"12"));
        x.insert(4, Bytes::from_static(b"56"));
        assert_eq!(read_all(&mut x), b"12");
        x.insert(2, Bytes::from_static(b"34"));
        assert_eq!(read_all(&mut x), b"3456");
    }

    #[test]
    fn stopped_discards() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"123"));
        x.stop();
        assert!(x.stopped);
        x.insert(3, Bytes::from_static(b"456"));
        assert_matches!(next(&mut x, 32), None);
        assert!(x.data.is_empty());
    }

    #[test]
    fn defragments_small_chunks() {
        let mut x = Assembler::new();
        let data = (0..100u8).collect::<Vec<_>>();
        // Leave the first byte out so nothing is readable while chunks accumulate
        for i in 1..data.len() {
            x.insert(i as u64, Bytes::copy_from_slice(&data[i..i + 1]));
        }
        assert!(x.data.len() < 40);
        x.insert(0, Bytes::copy_from_slice(&data[..1]));
        assert_eq!(read_all(&mut x), data);
    }

    proptest! {
        #[test]
        fn reassembly_is_order_and_duplication_invariant(
            data in proptest::collection::vec(any::<u8>(), 1..2048),
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..32),
            order in proptest::collection::vec(any::<prop::sample::Index>(), 0..64),
            read_size in 1usize..512,
        ) {
            // Split the payload into frames, then deliver them in an arbitrary order with
            // arbitrary repeats, interleaving reads
            let mut bounds = cuts.iter().map(|i| i.index(data.len())).collect::<Vec<_>>();
            bounds.push(0);
            bounds.push(data.len());
            bounds.sort_unstable();
            bounds.dedup();
            let frames = bounds
                .windows(2)
                .map(|w| (w[0] as u64, Bytes::copy_from_slice(&data[w[0]..w[1]])))
                .collect::<Vec<_>>();

            let mut x = Assembler::new();
            let mut out = Vec::new();
            for i in &order {
                let (offset, ref bytes) = frames[i.index(frames.len())];
                x.insert(offset, bytes.clone());
                while let Some(chunk) = x.read(read_size) {
                    out.extend_from_slice(&chunk);
                }
            }
            for (offset, bytes) in frames.iter().rev() {
                x.insert(*offset, bytes.clone());
            }
            while let Some(chunk) = x.read(read_size) {
                out.extend_from_slice(&chunk);
            }
            prop_assert_eq!(out, data);
        }

        #[test]
        fn overlapping_retransmissions_deliver_each_byte_once(
            data in proptest::collection::vec(any::<u8>(), 1..2048),
            frames in proptest::collection::vec(
                (any::<prop::sample::Index>(), 1usize..256),
                0..64,
            ),
            read_size in 1usize..512,
        ) {
            // Retransmissions may repackage the same bytes at different boundaries
            let mut x = Assembler::new();
            let mut out = Vec::new();
            for (start, len) in &frames {
                let start = start.index(data.len());
                let end = (start + len).min(data.len());
                x.insert(start as u64, Bytes::copy_from_slice(&data[start..end]));
                while let Some(chunk) = x.read(read_size) {
                    out.extend_from_slice(&chunk);
                }
            }
            x.insert(0, Bytes::copy_from_slice(&data));
            while let Some(chunk) = x.read(read_size) {
                out.extend_from_slice(&chunk);
            }
            prop_assert_eq!(out, data);
        }
    }
}
