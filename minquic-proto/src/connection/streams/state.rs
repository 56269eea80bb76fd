use std::{
    cmp::Reverse,
    collections::{hash_map, BinaryHeap, VecDeque},
    mem,
};

use bytes::BufMut;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use super::{
    recv::Recv,
    send::{Send, SendState},
    PendingStream, ShouldTransmit, StreamEvent, StreamHalf,
};
use crate::{
    coding::BufMutExt,
    connection::spaces::Retransmits,
    frame::{self, FrameStruct},
    transport_parameters::TransportParameters,
    Dir, Side, StreamId, TransportError, VarInt, MAX_STREAM_COUNT,
};

/// Stream and flow control state of one connection
pub struct StreamsState {
    pub(super) side: Side,
    // Set of streams that are currently open, or could be immediately opened by the peer
    pub(super) send: FxHashMap<StreamId, Send>,
    pub(super) recv: FxHashMap<StreamId, Recv>,
    /// Number of locally initiated streams of each directionality opened so far
    pub(super) next: [u64; 2],
    /// Maximum number of locally-initiated streams that may be opened over the lifetime of the
    /// connection so far, per direction
    pub(super) max: [u64; 2],
    /// Maximum number of remotely-initiated streams that may be opened over the lifetime of the
    /// connection so far, per direction
    max_remote: [u64; 2],
    /// Number of remotely initiated streams the peer opened, per direction
    pub(super) next_remote: [u64; 2],
    /// Number of remotely initiated streams handed out by `accept`, per direction
    pub(super) next_reported_remote: [u64; 2],
    /// Whether the remote endpoint has opened any streams the application doesn't know about yet,
    /// per directionality
    opened: [bool; 2],
    /// Whether `open` failed since the peer last raised the stream limit, per direction
    pub(super) open_blocked: [bool; 2],
    /// Whether `max_remote` grew since a MAX_STREAMS frame was last queued, per direction
    max_streams_dirty: [bool; 2],
    /// Streams with outgoing data queued, sorted by priority then creation order
    pending: BinaryHeap<PendingStream>,
    /// Creation counter for locally visible streams
    next_seq: u64,

    pub(super) events: VecDeque<StreamEvent>,
    /// Streams blocked on connection-level flow control or stream window space
    ///
    /// Streams are only added to this list when a write fails.
    pub(super) connection_blocked: Vec<StreamId>,
    /// Connection-level flow control limit granted by the peer
    max_data: u64,
    /// Sum of the amount of data accepted for transmission on all streams
    pub(super) data_sent: u64,
    /// Sum of the amount of data accepted but not yet acknowledged
    pub(super) unacked_data: u64,
    /// Limit on `unacked_data`
    send_window: u64,

    /// Configured connection-level receive window
    receive_window: u64,
    /// Connection-level flow control limit most recently advertised to the peer
    local_max_data: u64,
    /// Sum of end offsets of all streams, which counts against `local_max_data`
    data_recvd: u64,
    /// Sum of the data read by the application or discarded, returned to the peer as credit
    data_read: u64,
    stream_receive_window: u64,

    // Stream-level flow control limits granted by the peer's transport parameters
    initial_max_stream_data_uni: u64,
    initial_max_stream_data_bidi_local: u64,
    initial_max_stream_data_bidi_remote: u64,
}

impl StreamsState {
    pub(crate) fn new(
        side: Side,
        max_remote_uni: VarInt,
        max_remote_bi: VarInt,
        send_window: u64,
        receive_window: VarInt,
        stream_receive_window: VarInt,
    ) -> Self {
        let mut max_remote = [0; 2];
        max_remote[Dir::Bi as usize] = max_remote_bi.into_inner();
        max_remote[Dir::Uni as usize] = max_remote_uni.into_inner();
        Self {
            side,
            send: FxHashMap::default(),
            recv: FxHashMap::default(),
            next: [0, 0],
            max: [0, 0],
            max_remote,
            next_remote: [0, 0],
            next_reported_remote: [0, 0],
            opened: [false, false],
            open_blocked: [false, false],
            max_streams_dirty: [false, false],
            pending: BinaryHeap::new(),
            next_seq: 0,
            events: VecDeque::new(),
            connection_blocked: Vec::new(),
            max_data: 0,
            data_sent: 0,
            unacked_data: 0,
            send_window,
            receive_window: receive_window.into_inner(),
            local_max_data: receive_window.into_inner(),
            data_recvd: 0,
            data_read: 0,
            stream_receive_window: stream_receive_window.into_inner(),
            initial_max_stream_data_uni: 0,
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
        }
    }

    /// Apply the peer's transport parameters
    pub(crate) fn set_params(&mut self, params: &TransportParameters) {
        self.initial_max_stream_data_bidi_local = params.initial_max_stream_data_bidi_local.into();
        self.initial_max_stream_data_bidi_remote =
            params.initial_max_stream_data_bidi_remote.into();
        self.initial_max_stream_data_uni = params.initial_max_stream_data_uni.into();
        self.max[Dir::Bi as usize] = params.initial_max_streams_bidi.into();
        self.max[Dir::Uni as usize] = params.initial_max_streams_uni.into();
        self.max_data = params.initial_max_data.into();
    }

    /// Open the next locally initiated stream of `dir`, if the peer's limit allows
    pub(super) fn open(&mut self, dir: Dir) -> Option<StreamId> {
        if self.next[dir as usize] >= self.max[dir as usize] {
            self.open_blocked[dir as usize] = true;
            return None;
        }
        self.next[dir as usize] += 1;
        let id = StreamId::new(self.side, dir, self.next[dir as usize] - 1);
        self.insert(false, id);
        Some(id)
    }

    /// Process incoming stream frame
    ///
    /// If successful, returns whether a `MAX_DATA` frame needs to be transmitted
    pub(crate) fn received(&mut self, frame: frame::Stream) -> Result<ShouldTransmit, TransportError> {
        let id = frame.id;
        self.validate_receive_id(id).map_err(|e| {
            debug!("received illegal STREAM frame");
            e
        })?;
        self.ensure_remote_open(id);

        let Some(rs) = self.recv.get_mut(&id) else {
            trace!("dropping frame for closed stream");
            return Ok(ShouldTransmit(false));
        };
        if rs.is_finished() && !rs.stopped {
            trace!("dropping frame for finished stream");
            return Ok(ShouldTransmit(false));
        }

        let new_bytes = rs.ingest(frame, self.data_recvd, self.local_max_data)?;
        self.data_recvd = self.data_recvd.saturating_add(new_bytes);

        if !rs.stopped {
            self.events.push_back(StreamEvent::Readable { id });
            return Ok(ShouldTransmit(false));
        }

        // Stopped streams become closed instantly on FIN, so check whether we need to clean up
        if rs.is_closed() {
            self.recv.remove(&id);
            self.stream_freed(id, StreamHalf::Recv);
        }

        // We don't buffer data on stopped streams, so issue flow control credit immediately
        Ok(self.add_read_credits(new_bytes))
    }

    /// Process incoming RESET_STREAM frame
    ///
    /// If successful, returns whether a `MAX_DATA` frame needs to be transmitted
    pub(crate) fn received_reset(
        &mut self,
        frame: frame::ResetStream,
    ) -> Result<ShouldTransmit, TransportError> {
        let frame::ResetStream {
            id,
            error_code,
            final_offset,
        } = frame;
        self.validate_receive_id(id).map_err(|e| {
            debug!("received illegal RESET_STREAM frame");
            e
        })?;
        self.ensure_remote_open(id);

        let Some(rs) = self.recv.get_mut(&id) else {
            trace!("received RESET_STREAM on closed stream");
            return Ok(ShouldTransmit(false));
        };
        let bytes_read = rs.assembler.bytes_read();
        let Some(new_bytes) =
            rs.reset(error_code, final_offset, self.data_recvd, self.local_max_data)?
        else {
            // Redundant reset
            return Ok(ShouldTransmit(false));
        };
        self.data_recvd = self.data_recvd.saturating_add(new_bytes);

        let credits = if rs.stopped {
            // Unread data was credited when the stream was stopped
            self.recv.remove(&id);
            self.stream_freed(id, StreamHalf::Recv);
            new_bytes
        } else {
            self.events.push_back(StreamEvent::Readable { id });
            final_offset.into_inner() - bytes_read
        };
        Ok(self.add_read_credits(credits))
    }

    /// Process incoming `STOP_SENDING` frame
    ///
    /// The stream is reset in response, with the peer's error code.
    pub(crate) fn received_stop_sending(
        &mut self,
        id: StreamId,
        error_code: VarInt,
        pending: &mut Retransmits,
    ) -> Result<(), TransportError> {
        self.validate_send_id(id)?;
        self.ensure_remote_open(id);
        let Some(stream) = self.send.get_mut(&id) else {
            return Ok(());
        };

        if stream.try_stop(error_code) {
            self.events.push_back(StreamEvent::Stopped { id, error_code });
        }
        if !stream.is_reset() {
            self.unacked_data -= stream.pending.unacked();
            stream.reset();
            pending.reset_stream.push((id, error_code));
        }
        Ok(())
    }

    pub(crate) fn reset_acked(&mut self, id: StreamId) {
        if let hash_map::Entry::Occupied(e) = self.send.entry(id) {
            if e.get().state == SendState::ResetSent {
                e.remove_entry();
                self.stream_freed(id, StreamHalf::Send);
            }
        }
    }

    /// Whether any stream data is queued, regardless of control frames
    pub(crate) fn can_send_stream_data(&self) -> bool {
        // Reset streams may linger in the pending stream list, but will never produce stream frames
        self.pending.iter().any(|stream| {
            self.send
                .get(&stream.id)
                .map_or(false, |s| !s.is_reset() && s.is_pending())
        })
    }

    /// Move stream limit increases into the set of frames to transmit
    pub(crate) fn queue_max_streams(&mut self, pending: &mut Retransmits) {
        for dir in Dir::iter() {
            if mem::replace(&mut self.max_streams_dirty[dir as usize], false) {
                pending.max_stream_id[dir as usize] = true;
            }
        }
    }

    /// Forget queued control frames for streams whose state is gone or no longer needs them
    pub(crate) fn discard_stale(&self, pending: &mut Retransmits) {
        pending
            .reset_stream
            .retain(|&(id, _)| self.send.contains_key(&id));
        pending.max_stream_data.retain(|id| {
            self.recv
                .get(id)
                .map_or(false, |rs| !rs.is_finished() && !rs.stopped)
        });
    }

    pub(crate) fn write_control_frames(
        &mut self,
        buf: &mut Vec<u8>,
        pending: &mut Retransmits,
        retransmits: &mut Retransmits,
        max_size: usize,
    ) {
        // RESET_STREAM
        while buf.len() + frame::ResetStream::SIZE_BOUND < max_size {
            let Some((id, error_code)) = pending.reset_stream.pop() else {
                break;
            };
            let Some(stream) = self.send.get(&id) else {
                continue;
            };
            trace!(stream = %id, "RESET_STREAM");
            retransmits.reset_stream.push((id, error_code));
            frame::ResetStream {
                id,
                error_code,
                final_offset: VarInt::from_u64(stream.offset()).unwrap_or(VarInt::MAX),
            }
            .encode(buf);
        }

        // STOP_SENDING
        while buf.len() + frame::StopSending::SIZE_BOUND < max_size {
            let Some(frame) = pending.stop_sending.pop() else {
                break;
            };
            // Sent even when the stream's state is gone; the peer may still be transmitting
            trace!(stream = %frame.id, "STOP_SENDING");
            frame.encode(buf);
            retransmits.stop_sending.push(frame);
        }

        // MAX_DATA
        if pending.max_data && buf.len() + 9 < max_size {
            pending.max_data = false;
            let max = VarInt::from_u64(self.local_max_data).unwrap_or(VarInt::MAX);
            trace!(value = max.into_inner(), "MAX_DATA");
            retransmits.max_data = true;
            buf.write(frame::FrameType::MAX_DATA);
            buf.write(max);
        }

        // MAX_STREAM_DATA
        while buf.len() + 17 < max_size {
            let Some(&id) = pending.max_stream_data.iter().next() else {
                break;
            };
            pending.max_stream_data.remove(&id);
            let Some(rs) = self.recv.get(&id) else {
                continue;
            };
            if rs.is_finished() || rs.stopped {
                continue;
            }
            retransmits.max_stream_data.insert(id);
            trace!(stream = %id, max = rs.max_stream_data, "MAX_STREAM_DATA");
            buf.write(frame::FrameType::MAX_STREAM_DATA);
            buf.write(id);
            buf.write_var(rs.max_stream_data);
        }

        // MAX_STREAMS
        for dir in Dir::iter() {
            if !pending.max_stream_id[dir as usize] || buf.len() + 9 >= max_size {
                continue;
            }
            pending.max_stream_id[dir as usize] = false;
            retransmits.max_stream_id[dir as usize] = true;
            trace!(
                value = self.max_remote[dir as usize],
                "MAX_STREAMS ({:?})",
                dir
            );
            buf.write(match dir {
                Dir::Uni => frame::FrameType::MAX_STREAMS_UNI,
                Dir::Bi => frame::FrameType::MAX_STREAMS_BIDI,
            });
            buf.write_var(self.max_remote[dir as usize]);
        }
    }

    /// Write STREAM frames for pending streams until `max_buf_size` is reached
    ///
    /// Higher priority streams go first; streams of equal priority are served in the order they
    /// were created, and several streams may share a packet.
    pub(crate) fn write_stream_frames(
        &mut self,
        buf: &mut Vec<u8>,
        max_buf_size: usize,
    ) -> Vec<frame::StreamMeta> {
        let mut stream_frames = Vec::new();
        while buf.len() + frame::Stream::SIZE_BOUND < max_buf_size {
            let Some(pending) = self.pending.pop() else {
                break;
            };
            let id = pending.id;
            let Some(stream) = self.send.get_mut(&id) else {
                // Stream was reset and the reset acknowledged
                continue;
            };
            if stream.is_reset() || !stream.is_pending() {
                continue;
            }

            let max_len = max_buf_size - buf.len() - frame::Stream::SIZE_BOUND;
            let offsets = stream.pending.poll_transmit(max_len);
            let fin = offsets.end == stream.pending.offset()
                && matches!(stream.state, SendState::DataSent { .. });
            if fin {
                stream.fin_pending = false;
            }

            if stream.is_pending() {
                // Keep the stream's place in line; it goes first again next packet
                self.pending.push(pending);
            }

            let meta = frame::StreamMeta { id, offsets, fin };
            trace!(id = %meta.id, off = meta.offsets.start, len = meta.offsets.end - meta.offsets.start, fin = meta.fin, "STREAM");
            meta.encode(true, buf);

            // The range may span several buffered segments
            let mut offsets = meta.offsets.clone();
            while offsets.start != offsets.end {
                let data = stream.pending.get(offsets.clone());
                offsets.start += data.len() as u64;
                buf.put_slice(data);
            }
            stream_frames.push(meta);
        }

        stream_frames
    }

    /// Queue a stream for transmission if it was idle
    pub(super) fn push_pending(&mut self, id: StreamId) {
        if let Some(stream) = self.send.get(&id) {
            self.pending.push(PendingStream {
                priority: stream.priority,
                seq: Reverse(stream.seq),
                id,
            });
        }
    }

    /// Restore scheduling order after a priority change
    pub(super) fn reprioritize(&mut self, id: StreamId) {
        let queued = mem::take(&mut self.pending);
        self.pending = queued.into_iter().filter(|x| x.id != id).collect();
        if self.send.get(&id).map_or(false, |s| s.is_pending()) {
            self.push_pending(id);
        }
    }

    pub(crate) fn ack(&mut self, frame: frame::StreamMeta) {
        let hash_map::Entry::Occupied(mut entry) = self.send.entry(frame.id) else {
            return;
        };
        let stream = entry.get_mut();
        if stream.is_reset() {
            // We account for outstanding data on reset streams at time of reset
            return;
        }
        let id = frame.id;
        let unacked = stream.pending.unacked();
        let finished = stream.ack(frame);
        self.unacked_data -= unacked - stream.pending.unacked();
        if !finished {
            // The stream is unfinished or may still need retransmits
            return;
        }

        entry.remove_entry();
        self.stream_freed(id, StreamHalf::Send);
        self.events.push_back(StreamEvent::Finished { id });
    }

    pub(crate) fn retransmit(&mut self, frame: frame::StreamMeta) {
        let Some(stream) = self.send.get_mut(&frame.id) else {
            // Loss of data on a closed stream is a noop
            return;
        };
        if stream.is_reset() {
            return;
        }
        let was_pending = stream.is_pending();
        stream.fin_pending |= frame.fin;
        stream.pending.retransmit(frame.offsets);
        if !was_pending {
            self.push_pending(frame.id);
        }
    }

    pub(crate) fn received_max_streams(
        &mut self,
        dir: Dir,
        count: u64,
    ) -> Result<(), TransportError> {
        if count > MAX_STREAM_COUNT {
            return Err(TransportError::FRAME_ENCODING_ERROR(
                "unrepresentable stream limit",
            ));
        }

        let current = &mut self.max[dir as usize];
        if count > *current {
            *current = count;
            self.open_blocked[dir as usize] = false;
            self.events.push_back(StreamEvent::Available { dir });
        }

        Ok(())
    }

    /// Handle increase to connection-level flow control limit
    pub(crate) fn received_max_data(&mut self, n: VarInt) {
        self.max_data = self.max_data.max(n.into());
    }

    pub(crate) fn received_max_stream_data(
        &mut self,
        id: StreamId,
        offset: u64,
    ) -> Result<(), TransportError> {
        self.validate_send_id(id)?;
        self.ensure_remote_open(id);

        let write_limit = self.write_limit();
        if let Some(ss) = self.send.get_mut(&id) {
            if ss.increase_max_data(offset) {
                if write_limit > 0 {
                    self.events.push_back(StreamEvent::Writable { id });
                } else if !ss.connection_blocked {
                    // Still blocked at the connection level; `poll` reports it once that clears
                    ss.connection_blocked = true;
                    self.connection_blocked.push(id);
                }
            }
        }
        Ok(())
    }

    /// Returns the maximum amount of data this is allowed to be written on the connection
    pub(crate) fn write_limit(&self) -> u64 {
        (self.max_data - self.data_sent).min(self.send_window.saturating_sub(self.unacked_data))
    }

    /// Yield stream events
    pub(crate) fn poll(&mut self) -> Option<StreamEvent> {
        if let Some(dir) = Dir::iter().find(|&i| mem::replace(&mut self.opened[i as usize], false))
        {
            return Some(StreamEvent::Opened { dir });
        }

        if self.write_limit() > 0 {
            while let Some(id) = self.connection_blocked.pop() {
                let Some(stream) = self.send.get_mut(&id) else {
                    continue;
                };
                stream.connection_blocked = false;

                // Streams that can no longer be written to are not reported
                if stream.is_writable() && stream.max_data > stream.offset() {
                    return Some(StreamEvent::Writable { id });
                }
            }
        }

        self.events.pop_front()
    }

    /// Check for errors entailed by the peer's use of `id` as a send stream
    fn validate_receive_id(&self, id: StreamId) -> Result<(), TransportError> {
        if self.side == id.initiator() {
            match id.dir() {
                Dir::Uni => {
                    return Err(TransportError::STREAM_STATE_ERROR(
                        "illegal operation on send-only stream",
                    ));
                }
                Dir::Bi if id.index() >= self.next[Dir::Bi as usize] => {
                    return Err(TransportError::STREAM_STATE_ERROR(
                        "operation on unopened stream",
                    ));
                }
                Dir::Bi => {}
            };
        } else {
            let limit = self.max_remote[id.dir() as usize];
            if id.index() >= limit {
                return Err(TransportError::STREAM_LIMIT_ERROR(""));
            }
        }
        Ok(())
    }

    /// Check for errors entailed by the peer's use of `id` as a receive stream
    fn validate_send_id(&self, id: StreamId) -> Result<(), TransportError> {
        if self.side == id.initiator() {
            if id.index() >= self.next[id.dir() as usize] {
                return Err(TransportError::STREAM_STATE_ERROR(
                    "operation on unopened stream",
                ));
            }
        } else {
            if id.dir() == Dir::Uni {
                debug!("got flow control frame on recv-only {}", id);
                return Err(TransportError::STREAM_STATE_ERROR(
                    "illegal operation on recv-only stream",
                ));
            }
            if id.index() >= self.max_remote[id.dir() as usize] {
                return Err(TransportError::STREAM_LIMIT_ERROR(""));
            }
        }
        Ok(())
    }

    /// Implicitly open every remote stream of the same type up to `id`
    fn ensure_remote_open(&mut self, id: StreamId) {
        if id.initiator() == self.side {
            return;
        }
        let dir = id.dir();
        let next = self.next_remote[dir as usize];
        if id.index() < next {
            return;
        }
        for index in next..=id.index() {
            self.insert(true, StreamId::new(!self.side, dir, index));
        }
        self.next_remote[dir as usize] = id.index() + 1;
        self.opened[dir as usize] = true;
    }

    pub(super) fn insert(&mut self, remote: bool, id: StreamId) {
        let bi = id.dir() == Dir::Bi;
        // bidirectional OR (unidirectional AND NOT remote)
        if bi || !remote {
            let seq = self.next_seq;
            self.next_seq += 1;
            let max_data = self.max_send_data(id);
            self.send.insert(id, Send::new(max_data, seq));
        }
        // bidirectional OR (unidirectional AND remote)
        if bi || remote {
            self.recv.insert(id, Recv::new(self.stream_receive_window));
        }
    }

    /// Return consumed data to the peer as connection-level credit
    ///
    /// Returns whether a `MAX_DATA` frame should be queued, which is the case once at most half
    /// of the receive window remains unconsumed.
    pub(super) fn add_read_credits(&mut self, credits: u64) -> ShouldTransmit {
        self.data_read += credits;
        if self.local_max_data - self.data_read > self.receive_window / 2 {
            return ShouldTransmit(false);
        }
        self.local_max_data = self.data_read + self.receive_window;
        ShouldTransmit(true)
    }

    /// Update counters for removal of a stream
    ///
    /// Closing a remotely initiated stream entirely lets the peer open another one.
    pub(super) fn stream_freed(&mut self, id: StreamId, half: StreamHalf) {
        if id.initiator() == self.side {
            return;
        }
        let fully_free = id.dir() == Dir::Uni
            || match half {
                StreamHalf::Send => !self.recv.contains_key(&id),
                StreamHalf::Recv => !self.send.contains_key(&id),
            };
        if fully_free {
            self.max_remote[id.dir() as usize] += 1;
            self.max_streams_dirty[id.dir() as usize] = true;
        }
    }

    pub(super) fn max_send_data(&self, id: StreamId) -> u64 {
        let remote = self.side != id.initiator();
        match id.dir() {
            Dir::Uni => self.initial_max_stream_data_uni,
            // Remote/local appear reversed here because the transport parameters are named from
            // the perspective of the peer.
            Dir::Bi if remote => self.initial_max_stream_data_bidi_local,
            Dir::Bi => self.initial_max_stream_data_bidi_remote,
        }
    }

    pub(super) fn stream_receive_window(&self) -> u64 {
        self.stream_receive_window
    }
}
