use bytes::Bytes;
use thiserror::Error;

use crate::{connection::send_buffer::SendBuffer, frame, VarInt};

#[derive(Debug)]
pub(super) struct Send {
    /// Stream-level flow control limit granted by the peer
    pub(super) max_data: u64,
    pub(super) state: SendState,
    pub(super) pending: SendBuffer,
    pub(super) priority: i32,
    /// Position in creation order, breaking ties between streams of equal priority
    pub(super) seq: u64,
    /// Whether a frame containing a FIN bit must be transmitted, even if we don't have any new data
    pub(super) fin_pending: bool,
    /// Whether this stream is in the `connection_blocked` list of `StreamsState`
    pub(super) connection_blocked: bool,
    /// The reason the peer wants us to stop, if `STOP_SENDING` was received
    pub(super) stop_reason: Option<VarInt>,
}

impl Send {
    pub(super) fn new(max_data: u64, seq: u64) -> Self {
        Self {
            max_data,
            state: SendState::Ready,
            pending: SendBuffer::new(),
            priority: 0,
            seq,
            fin_pending: false,
            connection_blocked: false,
            stop_reason: None,
        }
    }

    /// Whether the stream has been reset
    pub(super) fn is_reset(&self) -> bool {
        matches!(self.state, SendState::ResetSent)
    }

    pub(super) fn finish(&mut self) -> Result<(), FinishError> {
        if let Some(error_code) = self.stop_reason {
            Err(FinishError::Stopped(error_code))
        } else if self.state == SendState::Ready {
            self.state = SendState::DataSent {
                finish_acked: false,
            };
            self.fin_pending = true;
            Ok(())
        } else {
            Err(FinishError::ClosedStream)
        }
    }

    /// Buffer a prefix of `data` of at most `limit` bytes, also bounded by stream credit
    pub(super) fn write(&mut self, data: &[u8], limit: u64) -> Result<usize, WriteError> {
        if !self.is_writable() {
            return Err(WriteError::ClosedStream);
        }
        if let Some(error_code) = self.stop_reason {
            return Err(WriteError::Stopped(error_code));
        }
        let budget = self.max_data - self.pending.offset();
        if budget == 0 {
            return Err(WriteError::Blocked);
        }
        let len = (data.len() as u64).min(limit).min(budget) as usize;
        if len > 0 {
            self.pending.write(Bytes::copy_from_slice(&data[..len]));
        }
        Ok(len)
    }

    /// Update stream state due to a reset sent by the local application
    pub(super) fn reset(&mut self) {
        use SendState::*;
        if let DataSent { .. } | Ready = self.state {
            self.state = ResetSent;
            self.fin_pending = false;
        }
    }

    /// Handle STOP_SENDING
    ///
    /// Returns true if the stream was stopped due to this frame, and false
    /// if it had been stopped before
    pub(super) fn try_stop(&mut self, error_code: VarInt) -> bool {
        if self.stop_reason.is_none() {
            self.stop_reason = Some(error_code);
            true
        } else {
            false
        }
    }

    /// Returns whether the stream has been finished and all data has been acknowledged by the peer
    pub(super) fn ack(&mut self, frame: frame::StreamMeta) -> bool {
        self.pending.ack(frame.offsets);
        match self.state {
            SendState::DataSent {
                ref mut finish_acked,
            } => {
                *finish_acked |= frame.fin;
                *finish_acked && self.pending.is_fully_acked()
            }
            _ => false,
        }
    }

    /// Handle increase to stream-level flow control limit
    ///
    /// Returns whether the stream was unblocked
    pub(super) fn increase_max_data(&mut self, offset: u64) -> bool {
        if offset <= self.max_data || self.state != SendState::Ready {
            return false;
        }
        let was_blocked = self.pending.offset() == self.max_data;
        self.max_data = offset;
        was_blocked
    }

    pub(super) fn offset(&self) -> u64 {
        self.pending.offset()
    }

    pub(super) fn is_pending(&self) -> bool {
        self.pending.has_unsent_data() || self.fin_pending
    }

    pub(super) fn is_writable(&self) -> bool {
        matches!(self.state, SendState::Ready)
    }
}

/// Errors triggered while writing to a send stream
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum WriteError {
    /// No credit is available right now
    ///
    /// The peer's stream or connection flow control limit, or the local send window, is
    /// exhausted. A [`StreamEvent::Writable`] event is generated once retrying might succeed.
    ///
    /// [`StreamEvent::Writable`]: crate::StreamEvent::Writable
    #[error("unable to accept further writes")]
    Blocked,
    /// The peer is no longer accepting data on this stream, and it has been implicitly reset.
    ///
    /// Carries an application-defined error code.
    #[error("stopped by peer: code {0}")]
    Stopped(VarInt),
    /// The stream has not been opened or has already been finished or reset
    #[error("closed stream")]
    ClosedStream,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum SendState {
    /// Sending new data
    Ready,
    /// Stream was finished; now sending retransmits only
    DataSent { finish_acked: bool },
    /// Sent RESET
    ResetSent,
}

/// Reasons why attempting to finish a stream might fail
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FinishError {
    /// The peer is no longer accepting data on this stream
    ///
    /// Carries an application-defined error code.
    #[error("stopped by peer: code {0}")]
    Stopped(VarInt),
    /// The stream has not been opened or was already finished or reset
    #[error("closed stream")]
    ClosedStream,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Dir, Side, StreamId};

    fn meta(offsets: std::ops::Range<u64>, fin: bool) -> frame::StreamMeta {
        frame::StreamMeta {
            id: StreamId::new(Side::Client, Dir::Bi, 0),
            offsets,
            fin,
        }
    }

    #[test]
    fn write_bounded_by_stream_credit() {
        let mut send = Send::new(10, 0);
        assert_eq!(send.write(b"0123456789abcdef", u64::MAX), Ok(10));
        assert_eq!(send.write(b"x", u64::MAX), Err(WriteError::Blocked));
        assert!(send.increase_max_data(12));
        assert_eq!(send.write(b"abcdef", 1), Ok(1));
        assert_eq!(send.offset(), 11);
    }

    #[test]
    fn finish_acked() {
        let mut send = Send::new(100, 0);
        send.write(b"hello", u64::MAX).unwrap();
        send.finish().unwrap();
        assert_eq!(send.write(b"x", u64::MAX), Err(WriteError::ClosedStream));
        assert_eq!(send.finish(), Err(FinishError::ClosedStream));
        assert_eq!(send.pending.poll_transmit(100), 0..5);
        assert!(!send.ack(meta(0..3, false)));
        assert!(send.ack(meta(3..5, true)));
    }

    #[test]
    fn stopped() {
        let mut send = Send::new(100, 0);
        assert!(send.try_stop(VarInt::from_u32(7)));
        assert!(!send.try_stop(VarInt::from_u32(8)));
        assert_eq!(
            send.write(b"x", u64::MAX),
            Err(WriteError::Stopped(VarInt::from_u32(7)))
        );
        assert_eq!(send.finish(), Err(FinishError::Stopped(VarInt::from_u32(7))));
        send.reset();
        assert!(send.is_reset());
    }
}
