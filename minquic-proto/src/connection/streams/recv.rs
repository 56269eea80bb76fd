use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::connection::assembler::Assembler;
use crate::{frame, TransportError, VarInt};

#[derive(Debug)]
pub(super) struct Recv {
    state: RecvState,
    pub(super) assembler: Assembler,
    /// Stream-level flow control limit most recently advertised to the peer
    pub(super) max_stream_data: u64,
    /// Offset after the highest byte received
    pub(super) end: u64,
    pub(super) stopped: bool,
}

impl Recv {
    pub(super) fn new(initial_max_data: u64) -> Self {
        Self {
            state: RecvState::default(),
            assembler: Assembler::new(),
            max_stream_data: initial_max_data,
            end: 0,
            stopped: false,
        }
    }

    /// Process a STREAM frame
    ///
    /// `received` is the connection-level amount of data received so far and `max_data` the
    /// connection-level limit. Returns the number of bytes that newly count against the
    /// connection-level limit.
    pub(super) fn ingest(
        &mut self,
        frame: frame::Stream,
        received: u64,
        max_data: u64,
    ) -> Result<u64, TransportError> {
        let end = frame.offset + frame.data.len() as u64;
        if end >= 2u64.pow(62) {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "maximum stream offset too large",
            ));
        }

        if let Some(final_offset) = self.final_offset() {
            if end > final_offset || (frame.fin && end != final_offset) {
                debug!(end, final_offset, "final size error");
                return Err(TransportError::FINAL_SIZE_ERROR(""));
            }
        }

        let new_bytes = self.credit_consumed_by(end, received, max_data)?;

        if frame.fin {
            if self.stopped {
                // Stopped streams only need the final size
                self.state = RecvState::Closed;
            } else if let RecvState::Recv { ref mut size } = self.state {
                if end < self.end {
                    debug!(end, highest = self.end, "fin below received data");
                    return Err(TransportError::FINAL_SIZE_ERROR(""));
                }
                *size = Some(end);
            }
        }

        self.end = self.end.max(end);
        self.assembler.insert(frame.offset, frame.data);
        Ok(new_bytes)
    }

    /// Process a RESET_STREAM frame
    ///
    /// Returns the number of bytes that newly count against the connection-level limit, or `None`
    /// if the reset was redundant.
    pub(super) fn reset(
        &mut self,
        error_code: VarInt,
        final_offset: VarInt,
        received: u64,
        max_data: u64,
    ) -> Result<Option<u64>, TransportError> {
        let final_offset = final_offset.into_inner();
        // Validate final_offset
        if let Some(offset) = self.final_offset() {
            if offset != final_offset {
                return Err(TransportError::FINAL_SIZE_ERROR("inconsistent value"));
            }
        } else if self.end > final_offset {
            return Err(TransportError::FINAL_SIZE_ERROR(
                "lower than high water mark",
            ));
        }
        let new_bytes = self.credit_consumed_by(final_offset, received, max_data)?;

        if matches!(self.state, RecvState::ResetRecvd { .. } | RecvState::Closed) {
            return Ok(None);
        }
        self.state = RecvState::ResetRecvd {
            size: final_offset,
            error_code,
        };
        // Unread data is discarded; the final size already accounts for it
        self.end = final_offset;
        self.assembler.stop();
        Ok(Some(new_bytes))
    }

    /// Read up to `max_length` contiguous bytes
    pub(super) fn read(&mut self, max_length: usize) -> Result<Option<Bytes>, ReadError> {
        if self.stopped {
            return Err(ReadError::ClosedStream);
        }
        if let Some(bytes) = self.assembler.read(max_length) {
            return Ok(Some(bytes));
        }
        match self.state {
            RecvState::ResetRecvd { error_code, .. } => {
                self.state = RecvState::Closed;
                Err(ReadError::Reset(error_code))
            }
            RecvState::Closed => Err(ReadError::ClosedStream),
            RecvState::Recv { size } => {
                if size == Some(self.end) && self.assembler.bytes_read() == self.end {
                    self.state = RecvState::Closed;
                    Ok(None)
                } else {
                    Err(ReadError::Blocked)
                }
            }
        }
    }

    /// Discard unread data and stop buffering
    ///
    /// Returns the number of unread bytes, which should be returned to the peer as connection
    /// credit, and whether a STOP_SENDING frame is warranted. Once the final size is known the
    /// stream closes immediately.
    pub(super) fn stop(&mut self) -> Option<(u64, bool)> {
        if self.stopped {
            return None;
        }
        self.stopped = true;
        let unread = self.final_offset().unwrap_or(self.end) - self.assembler.bytes_read();
        self.assembler.stop();
        let send_stop = self.receiving_unknown_size();
        if !send_stop {
            self.state = RecvState::Closed;
        }
        Some((unread, send_stop))
    }

    /// Compute a new limit to advertise after data was consumed
    ///
    /// Returns the new limit if the remaining credit fell to half the window or less.
    pub(super) fn max_stream_data(&mut self, stream_receive_window: u64) -> Option<u64> {
        if !self.receiving_unknown_size() {
            return None;
        }
        let consumed = self.assembler.bytes_read();
        if self.max_stream_data - consumed > stream_receive_window / 2 {
            return None;
        }
        self.max_stream_data = consumed + stream_receive_window;
        Some(self.max_stream_data)
    }

    fn receiving_unknown_size(&self) -> bool {
        matches!(self.state, RecvState::Recv { size: None })
    }

    /// No more data expected from peer
    pub(super) fn is_finished(&self) -> bool {
        !matches!(self.state, RecvState::Recv { .. })
    }

    /// All data read by application
    pub(super) fn is_closed(&self) -> bool {
        self.state == RecvState::Closed
    }

    fn final_offset(&self) -> Option<u64> {
        match self.state {
            RecvState::Recv { size } => size,
            RecvState::ResetRecvd { size, .. } => Some(size),
            RecvState::Closed => Some(self.end),
        }
    }

    /// Compute the amount of flow control credit consumed, or return an error if more was
    /// consumed than issued
    fn credit_consumed_by(
        &self,
        offset: u64,
        received: u64,
        max_data: u64,
    ) -> Result<u64, TransportError> {
        let prev_end = self.end;
        let new_bytes = offset.saturating_sub(prev_end);
        if offset > self.max_stream_data || received + new_bytes > max_data {
            debug!(
                received,
                new_bytes,
                max_data,
                offset,
                stream_max_data = self.max_stream_data,
                "flow control error"
            );
            return Err(TransportError::FLOW_CONTROL_ERROR(""));
        }

        Ok(new_bytes)
    }
}

/// Errors triggered when reading from a recv stream
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// No more data is currently available on this stream.
    ///
    /// A [`StreamEvent::Readable`] is generated once more data arrives from the peer.
    ///
    /// [`StreamEvent::Readable`]: crate::StreamEvent::Readable
    #[error("blocked")]
    Blocked,
    /// The peer abandoned transmitting data on this stream.
    ///
    /// Carries an application-defined error code.
    #[error("reset by peer: code {0}")]
    Reset(VarInt),
    /// The stream has not been opened or was already stopped, finished, or reset
    #[error("closed stream")]
    ClosedStream,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RecvState {
    Recv { size: Option<u64> },
    ResetRecvd { size: u64, error_code: VarInt },
    Closed,
}

impl Default for RecvState {
    fn default() -> Self {
        Self::Recv { size: None }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{Dir, Side, StreamId};

    fn stream(offset: u64, data: &'static [u8], fin: bool) -> frame::Stream {
        frame::Stream {
            id: StreamId::new(Side::Client, Dir::Bi, 0),
            offset,
            fin,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn read_until_finished() {
        let mut recv = Recv::new(100);
        assert_eq!(recv.ingest(stream(0, b"hello", false), 0, 100), Ok(5));
        assert_eq!(recv.ingest(stream(5, b" world", true), 5, 100), Ok(6));
        assert_eq!(recv.read(usize::MAX), Ok(Some(Bytes::from_static(b"hello"))));
        assert_eq!(recv.read(3), Ok(Some(Bytes::from_static(b" wo"))));
        assert_eq!(recv.read(usize::MAX), Ok(Some(Bytes::from_static(b"rld"))));
        assert_eq!(recv.read(usize::MAX), Ok(None));
        assert!(recv.is_closed());
        assert_eq!(recv.read(usize::MAX), Err(ReadError::ClosedStream));
    }

    #[test]
    fn blocked_until_gap_filled() {
        let mut recv = Recv::new(100);
        recv.ingest(stream(3, b"def", true), 0, 100).unwrap();
        assert_eq!(recv.read(usize::MAX), Err(ReadError::Blocked));
        // Only the gap counts against connection credit
        assert_eq!(recv.ingest(stream(0, b"abc", false), 6, 100), Ok(0));
        assert_matches!(recv.read(usize::MAX), Ok(Some(ref x)) if &x[..] == b"abc");
        assert_matches!(recv.read(usize::MAX), Ok(Some(ref x)) if &x[..] == b"def");
        assert_eq!(recv.read(usize::MAX), Ok(None));
    }

    #[test]
    fn flow_control_violations() {
        let mut recv = Recv::new(4);
        assert_matches!(recv.ingest(stream(0, b"hello", false), 0, 100), Err(_));
        assert_matches!(recv.ingest(stream(0, b"hell", false), 98, 100), Err(_));
        assert_eq!(recv.ingest(stream(0, b"hell", false), 0, 100), Ok(4));
    }

    #[test]
    fn final_size_violations() {
        let mut recv = Recv::new(100);
        recv.ingest(stream(0, b"hello", true), 0, 100).unwrap();
        assert_matches!(recv.ingest(stream(5, b"!", false), 5, 100), Err(_));
        assert_matches!(recv.ingest(stream(0, b"hel", true), 5, 100), Err(_));
        assert_matches!(
            recv.reset(VarInt::from_u32(0), VarInt::from_u32(4), 5, 100),
            Err(_)
        );
    }

    #[test]
    fn reset_surfaces_once() {
        let mut recv = Recv::new(100);
        recv.ingest(stream(0, b"abc", false), 0, 100).unwrap();
        assert_eq!(
            recv.reset(VarInt::from_u32(9), VarInt::from_u32(10), 3, 100),
            Ok(Some(7))
        );
        assert_eq!(
            recv.reset(VarInt::from_u32(9), VarInt::from_u32(10), 10, 100),
            Ok(None)
        );
        assert_eq!(recv.read(usize::MAX), Err(ReadError::Reset(VarInt::from_u32(9))));
        assert_eq!(recv.read(usize::MAX), Err(ReadError::ClosedStream));
    }

    #[test]
    fn stop_returns_unread_credit() {
        let mut recv = Recv::new(100);
        recv.ingest(stream(0, b"abcdef", false), 0, 100).unwrap();
        recv.read(2).unwrap();
        assert_eq!(recv.stop(), Some((4, true)));
        assert_eq!(recv.stop(), None);
        assert_eq!(recv.read(usize::MAX), Err(ReadError::ClosedStream));

        let mut recv = Recv::new(100);
        recv.ingest(stream(4, b"ef", true), 0, 100).unwrap();
        assert_eq!(recv.stop(), Some((6, false)));
        assert!(recv.is_closed());
    }

    #[test]
    fn window_update_at_half() {
        let mut recv = Recv::new(10);
        recv.ingest(stream(0, b"0123", false), 0, 100).unwrap();
        recv.read(usize::MAX).unwrap();
        assert_eq!(recv.max_stream_data(10), None);
        recv.ingest(stream(4, b"4", false), 4, 100).unwrap();
        recv.read(usize::MAX).unwrap();
        assert_eq!(recv.max_stream_data(10), Some(15));
    }
}
