use std::{cmp::Reverse, collections::hash_map};

use bytes::Bytes;
use thiserror::Error;
use tracing::trace;

use super::spaces::Retransmits;
use crate::{frame, Dir, StreamId, VarInt};

mod recv;
pub use recv::ReadError;

mod send;
pub use send::{FinishError, WriteError};

mod state;
pub(crate) use state::StreamsState;

/// Access to streams
pub struct Streams<'a> {
    pub(super) state: &'a mut StreamsState,
    pub(super) conn_state: &'a super::State,
}

impl<'a> Streams<'a> {
    /// Open a single stream if possible
    ///
    /// Returns `None` if the streams in the given direction are currently exhausted, in which
    /// case a [`StreamEvent::Available`] follows once the peer raises its limit.
    pub fn open(&mut self, dir: Dir) -> Option<StreamId> {
        if self.conn_state.is_closed() || !self.conn_state.is_established() {
            return None;
        }
        let id = self.state.open(dir)?;
        trace!(stream = %id, "opened");
        Some(id)
    }

    /// Accept a remotely initiated stream of a certain directionality, if possible
    ///
    /// Returns `None` if there are no new incoming streams for this connection.
    pub fn accept(&mut self, dir: Dir) -> Option<StreamId> {
        if self.state.next_remote[dir as usize] == self.state.next_reported_remote[dir as usize] {
            return None;
        }

        let x = self.state.next_reported_remote[dir as usize];
        self.state.next_reported_remote[dir as usize] = x + 1;
        Some(StreamId::new(!self.state.side, dir, x))
    }
}

/// Access to the receiving half of a stream
pub struct RecvStream<'a> {
    pub(super) id: StreamId,
    pub(super) state: &'a mut StreamsState,
    pub(super) pending: &'a mut Retransmits,
}

impl<'a> RecvStream<'a> {
    /// Read the next contiguous chunk of at most `max_length` bytes
    ///
    /// Returns `Ok(None)` once the peer finished the stream and everything was read. Consumed data
    /// is returned to the peer as flow control credit.
    pub fn read(&mut self, max_length: usize) -> Result<Option<Bytes>, ReadError> {
        let window = self.state.stream_receive_window();
        let Some(rs) = self.state.recv.get_mut(&self.id) else {
            return Err(ReadError::ClosedStream);
        };
        let result = rs.read(max_length);
        let read = match result {
            Ok(Some(ref bytes)) => {
                if rs.max_stream_data(window).is_some() {
                    self.pending.max_stream_data.insert(self.id);
                }
                bytes.len() as u64
            }
            _ => 0,
        };
        let closed = rs.is_closed();

        if closed {
            self.state.recv.remove(&self.id);
            self.state.stream_freed(self.id, StreamHalf::Recv);
        }
        if read > 0 && self.state.add_read_credits(read).should_transmit() {
            self.pending.max_data = true;
        }
        result
    }

    /// Stop accepting data
    ///
    /// Discards unread data and notifies the peer to stop transmitting. Once stopped, further
    /// attempts to operate on a stream will yield `ClosedStream` errors.
    pub fn stop(&mut self, error_code: VarInt) -> Result<(), ClosedStream> {
        let mut entry = match self.state.recv.entry(self.id) {
            hash_map::Entry::Occupied(s) => s,
            hash_map::Entry::Vacant(_) => return Err(ClosedStream { _private: () }),
        };
        let stream = entry.get_mut();

        let Some((unread, send_stop)) = stream.stop() else {
            return Err(ClosedStream { _private: () });
        };
        if send_stop {
            self.pending.stop_sending.push(frame::StopSending {
                id: self.id,
                error_code,
            });
        }
        if stream.is_closed() {
            entry.remove_entry();
            self.state.stream_freed(self.id, StreamHalf::Recv);
        }
        if self.state.add_read_credits(unread).should_transmit() {
            self.pending.max_data = true;
        }
        Ok(())
    }
}

/// Access to the sending half of a stream
pub struct SendStream<'a> {
    pub(super) id: StreamId,
    pub(super) state: &'a mut StreamsState,
    pub(super) pending: &'a mut Retransmits,
    pub(super) conn_state: &'a super::State,
}

impl<'a> SendStream<'a> {
    /// Send data on the given stream
    ///
    /// Returns the number of bytes successfully written, which may be fewer than `data.len()`
    /// when flow control or the send window leave less room.
    pub fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        if self.conn_state.is_closed() {
            trace!(stream = %self.id, "write on closed connection");
            return Err(WriteError::ClosedStream);
        }

        let limit = self.state.write_limit();
        let stream = self
            .state
            .send
            .get_mut(&self.id)
            .ok_or(WriteError::ClosedStream)?;

        if limit == 0 {
            trace!(
                stream = %self.id,
                "write blocked by connection-level flow control or send window"
            );
            if !stream.connection_blocked {
                stream.connection_blocked = true;
                self.state.connection_blocked.push(self.id);
            }
            return Err(WriteError::Blocked);
        }

        let was_pending = stream.is_pending();
        let written = stream.write(data, limit)?;
        self.state.data_sent += written as u64;
        self.state.unacked_data += written as u64;
        trace!(stream = %self.id, "wrote {} bytes", written);
        if !was_pending {
            self.state.push_pending(self.id);
        }
        Ok(written)
    }

    /// Check if this stream was stopped, get the reason if it was
    pub fn stopped(&self) -> Result<Option<VarInt>, ClosedStream> {
        match self.state.send.get(&self.id) {
            Some(s) => Ok(s.stop_reason),
            None => Err(ClosedStream { _private: () }),
        }
    }

    /// Finish a send stream, signalling that no more data will be sent.
    ///
    /// If this fails, no [`StreamEvent::Finished`] will be generated.
    pub fn finish(&mut self) -> Result<(), FinishError> {
        let stream = self
            .state
            .send
            .get_mut(&self.id)
            .ok_or(FinishError::ClosedStream)?;

        let was_pending = stream.is_pending();
        stream.finish()?;
        if !was_pending {
            self.state.push_pending(self.id);
        }

        Ok(())
    }

    /// Abandon transmitting data on a stream
    ///
    /// Buffered data is discarded and a RESET_STREAM frame carrying `error_code` is queued.
    pub fn reset(&mut self, error_code: VarInt) -> Result<(), ClosedStream> {
        let stream = self
            .state
            .send
            .get_mut(&self.id)
            .ok_or(ClosedStream { _private: () })?;

        if matches!(stream.state, send::SendState::ResetSent) {
            // Redundant reset call
            return Err(ClosedStream { _private: () });
        }

        // Discarded data leaves the send window; connection credit stays consumed up to the final
        // size carried by RESET_STREAM
        self.state.unacked_data -= stream.pending.unacked();
        stream.reset();
        self.pending.reset_stream.push((self.id, error_code));
        Ok(())
    }

    /// Set the priority of a stream
    ///
    /// Streams with higher priority are sent first. Streams of equal priority are served in the
    /// order they were opened.
    pub fn set_priority(&mut self, priority: i32) -> Result<(), ClosedStream> {
        let stream = self
            .state
            .send
            .get_mut(&self.id)
            .ok_or(ClosedStream { _private: () })?;
        stream.priority = priority;
        self.state.reprioritize(self.id);
        Ok(())
    }

    /// Get the priority of a stream
    pub fn priority(&self) -> Result<i32, ClosedStream> {
        let stream = self
            .state
            .send
            .get(&self.id)
            .ok_or(ClosedStream { _private: () })?;
        Ok(stream.priority)
    }
}

/// An entry in the queue of streams with data to send
///
/// Ordered by priority, then by creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PendingStream {
    // Field order matters for the derived `Ord`
    priority: i32,
    seq: Reverse<u64>,
    id: StreamId,
}

/// Application events about streams
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// One or more new streams has been opened and might be readable
    Opened {
        /// Directionality for which streams have been opened
        dir: Dir,
    },
    /// A currently open stream likely has data or errors waiting to be read
    Readable {
        /// Which stream is now readable
        id: StreamId,
    },
    /// A formerly write-blocked stream might be ready for a write or have been stopped
    ///
    /// Only generated for streams that are currently open.
    Writable {
        /// Which stream is now writable
        id: StreamId,
    },
    /// A finished stream has been fully acknowledged or stopped
    Finished {
        /// Which stream has been finished
        id: StreamId,
    },
    /// The peer asked us to stop sending on an outgoing stream
    Stopped {
        /// Which stream has been stopped
        id: StreamId,
        /// Error code supplied by the peer
        error_code: VarInt,
    },
    /// At least one new stream of a certain directionality may be opened
    Available {
        /// Directionality for which streams are newly available
        dir: Dir,
    },
}

/// Indicates whether a frame needs to be transmitted
///
/// This type wraps around bool and uses the `#[must_use]` attribute in order
/// to prevent accidental loss of the frame transmission requirement.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[must_use = "A frame might need to be enqueued"]
pub(crate) struct ShouldTransmit(bool);

impl ShouldTransmit {
    /// Returns whether a frame should be transmitted
    pub(crate) fn should_transmit(self) -> bool {
        self.0
    }
}

/// Error indicating that a stream has not been opened or has already been finished or reset
#[derive(Debug, Default, Error, Clone, PartialEq, Eq)]
#[error("closed stream")]
pub struct ClosedStream {
    _private: (),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum StreamHalf {
    Send,
    Recv,
}
