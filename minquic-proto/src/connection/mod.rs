use std::{
    cmp,
    collections::VecDeque,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    coding::BufMutExt,
    config::{EndpointConfig, TransportConfig},
    congestion::Controller,
    crypto::{self, initial_keys},
    frame::{self, Close, Frame, FrameType},
    packet::{self, DecodeError, Header, PartialDecode, SpaceId},
    shared::{ConnectionEvent, ConnectionEventInner, ConnectionId, EndpointEvent, EndpointEventInner},
    telemetry,
    transport_parameters::TransportParameters,
    Dir, Side, StreamId, Transmit, TransportError, TransportErrorCode, VarInt, MAX_CID_SIZE,
    MAX_STREAM_COUNT, MIN_INITIAL_SIZE,
};

mod assembler;

mod packet_builder;
use packet_builder::PacketBuilder;

mod recovery;
pub use recovery::RttEstimator;

mod send_buffer;

mod spaces;
use spaces::{PacketSpace, Retransmits};

mod state;
pub use state::ConnectionState;
use state::State;

mod streams;
pub use streams::{
    ClosedStream, FinishError, ReadError, RecvStream, SendStream, StreamEvent, Streams, WriteError,
};
use streams::StreamsState;

mod timer;
use timer::{Timer, TimerTable};

/// Protocol state and logic for a single QUIC connection
///
/// Objects of this type receive [`ConnectionEvent`]s and emit [`EndpointEvent`]s and application
/// [`Event`]s to make progress. To handle timeouts, a `Connection` returns timer updates and
/// expects timeouts through various methods. A number of simple getter methods are exposed
/// to allow callers to inspect some of the connection state.
///
/// `Connection` has roughly 4 types of methods:
///
/// - A. Simple getters, taking `&self`
/// - B. Handlers for incoming events from the network or system, named `handle_*`.
/// - C. State machine mutators, for incoming commands from the application. For convenience we
///   refer to this as "performing I/O" below, however as per the design of this library none of the
///   functions actually perform system-level I/O. For example, [`read`](RecvStream::read) and
///   [`write`](SendStream::write), but also things like [`reset`](SendStream::reset).
/// - D. Polling functions for outgoing events or actions for the caller to
///   take, named `poll_*`.
///
/// The simplest way to use this API correctly is to call (B) and (C) whenever
/// appropriate, then after each of those calls, as soon as feasible call all
/// polling methods (D) and deal with their outputs appropriately, e.g. by
/// passing it to the application or by making a system-level I/O call. You
/// should call the polling functions in this order:
///
/// 1. [`poll_transmit`](Self::poll_transmit)
/// 2. [`poll_timeout`](Self::poll_timeout)
/// 3. [`poll_endpoint_events`](Self::poll_endpoint_events)
/// 4. [`poll`](Self::poll)
///
/// Currently the only actual dependency is from (2) to (1), however additional
/// dependencies may be added in future, so the above order is recommended.
pub struct Connection {
    endpoint_config: Arc<EndpointConfig>,
    config: Arc<TransportConfig>,
    crypto: Box<dyn crypto::Session>,
    side: Side,
    /// Our connection ID, carried as the source of long headers
    loc_cid: ConnectionId,
    /// The peer's connection ID; a client adopts the server's choice from its first Initial
    rem_cid: ConnectionId,
    rem_cid_set: bool,
    remote: SocketAddr,
    state: State,
    spaces: [PacketSpace; 3],
    /// Highest space with keys installed
    highest_space: SpaceId,
    rtt: RttEstimator,
    congestion: Box<dyn Controller>,
    /// Number of consecutive probe timeouts without an acknowledgement
    pto_count: u32,
    /// Whether the most recent transmission ran out of stream data before filling the window
    app_limited: bool,
    timers: TimerTable,
    /// Negotiated idle timeout
    idle_timeout: Option<Duration>,
    /// Whether the idle timer should be reset the next time an ack-eliciting packet is transmitted
    permit_idle_reset: bool,
    peer_params: TransportParameters,
    streams: StreamsState,
    events: VecDeque<Event>,
    endpoint_events: VecDeque<EndpointEventInner>,
    /// Whether a CONNECTION_CLOSE should go out with the next transmission
    close_pending: bool,
    last_close_sent: Option<Instant>,
    stats: ConnectionStats,
}

impl Connection {
    pub(crate) fn new(
        endpoint_config: Arc<EndpointConfig>,
        config: Arc<TransportConfig>,
        init_cid: ConnectionId,
        loc_cid: ConnectionId,
        rem_cid: ConnectionId,
        remote: SocketAddr,
        crypto: Box<dyn crypto::Session>,
        now: Instant,
        side: Side,
    ) -> Self {
        let mut spaces = [
            PacketSpace::new(now),
            PacketSpace::new(now),
            PacketSpace::new(now),
        ];
        spaces[SpaceId::Initial].crypto = Some(initial_keys(&init_cid, side));
        let streams = StreamsState::new(
            side,
            config.max_concurrent_uni_streams,
            config.max_concurrent_bidi_streams,
            config.send_window,
            config.receive_window,
            config.stream_receive_window,
        );
        let mut this = Self {
            crypto,
            side,
            loc_cid,
            rem_cid,
            rem_cid_set: side.is_server(),
            remote,
            state: State::Initial,
            spaces,
            highest_space: SpaceId::Initial,
            rtt: RttEstimator::new(config.initial_rtt),
            congestion: config
                .congestion_controller_factory
                .build(now, config.mtu),
            pto_count: 0,
            app_limited: false,
            timers: TimerTable::default(),
            idle_timeout: config
                .max_idle_timeout
                .map(|x| Duration::from_millis(x.into_inner())),
            permit_idle_reset: true,
            peer_params: TransportParameters::default(),
            streams,
            events: VecDeque::new(),
            endpoint_events: VecDeque::new(),
            close_pending: false,
            last_close_sent: None,
            stats: ConnectionStats::default(),
            endpoint_config,
            config,
        };
        this.emit(now, telemetry::Event::ConnectionStarted { side, remote });
        this.timers
            .set(Timer::HandshakeTimeout, now + this.config.handshake_timeout);
        this.reset_idle_timeout(now);
        if side.is_client() {
            // Kick off the handshake
            this.write_crypto(now);
        }
        this
    }

    /// Returns the next time at which `handle_timeout` should be called
    ///
    /// The value returned may change after:
    /// - the application performed some I/O on the connection
    /// - a call was made to `handle_event`
    /// - a call to `poll_transmit` returned `Some`
    /// - a call was made to `handle_timeout`
    #[must_use]
    pub fn poll_timeout(&mut self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    /// Returns application-facing events
    ///
    /// Connections should be polled for events after:
    /// - a call was made to `handle_event`
    /// - a call was made to `handle_timeout`
    #[must_use]
    pub fn poll(&mut self) -> Option<Event> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        self.streams.poll().map(Event::Stream)
    }

    /// Return endpoint-facing events
    #[must_use]
    pub fn poll_endpoint_events(&mut self) -> Option<EndpointEvent> {
        self.endpoint_events.pop_front().map(EndpointEvent)
    }

    /// Provide control over streams
    #[must_use]
    pub fn streams(&mut self) -> Streams<'_> {
        Streams {
            state: &mut self.streams,
            conn_state: &self.state,
        }
    }

    /// Provide control over the receiving half of a stream
    #[must_use]
    pub fn recv_stream(&mut self, id: StreamId) -> RecvStream<'_> {
        assert!(id.dir() == Dir::Bi || id.initiator() != self.side);
        RecvStream {
            id,
            state: &mut self.streams,
            pending: &mut self.spaces[SpaceId::Data].pending,
        }
    }

    /// Provide control over the sending half of a stream
    #[must_use]
    pub fn send_stream(&mut self, id: StreamId) -> SendStream<'_> {
        assert!(id.dir() == Dir::Bi || id.initiator() == self.side);
        SendStream {
            id,
            state: &mut self.streams,
            pending: &mut self.spaces[SpaceId::Data].pending,
            conn_state: &self.state,
        }
    }

    /// Returns packets to transmit
    ///
    /// Connections should be polled for transmit after:
    /// - the application performed some I/O on the connection
    /// - a call was made to `handle_event`
    /// - a call was made to `handle_timeout`
    ///
    /// Each call yields at most one datagram, which may coalesce packets of several spaces.
    #[must_use]
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Transmit> {
        if self.state.is_drained() {
            return None;
        }
        let mtu = usize::from(self.config.mtu)
            .min(self.peer_params.max_udp_payload_size.into_inner() as usize);

        if self.close_pending {
            self.close_pending = false;
            return self.transmit_close(now, mtu);
        }
        if self.state.is_closed() {
            return None;
        }

        let pending = &mut self.spaces[SpaceId::Data].pending;
        self.streams.queue_max_streams(pending);
        self.streams.discard_stale(pending);

        let mut buf = Vec::with_capacity(mtu);
        let mut congestion_blocked = false;
        for space_id in SpaceId::VALUES {
            if self.spaces[space_id].crypto.is_none() {
                continue;
            }
            if space_id == SpaceId::Data && !self.state.is_established() {
                continue;
            }
            if buf.len() + MIN_PACKET_SPACE > mtu {
                break;
            }

            let probe = self.spaces[space_id].loss_probes > 0;
            let streams_pending = space_id == SpaceId::Data && self.streams.can_send_stream_data();
            if probe {
                self.spaces[space_id].maybe_queue_probe(streams_pending);
                if space_id == SpaceId::Data {
                    // Frames taken back from old packets may belong to streams that are gone
                    let space = &mut self.spaces[space_id];
                    self.streams.discard_stale(&mut space.pending);
                    if space.pending.is_empty() && !streams_pending {
                        space.ping_pending = true;
                    }
                }
            }
            let can_send = self.spaces[space_id].can_send(streams_pending);
            let blocked = !probe && self.congestion_blocked();
            congestion_blocked |= blocked;
            let send_other = can_send.other && !blocked;
            if !send_other && !can_send.acks {
                if can_send.other {
                    trace!(space = ?space_id, "blocked by congestion control");
                }
                continue;
            }

            if self.side.is_client()
                && space_id == SpaceId::Handshake
                && self.spaces[SpaceId::Initial].crypto.is_some()
            {
                // The client's first Handshake packet confirms the server has our Initial
                self.discard_space(SpaceId::Initial);
            }

            let Some(mut builder) = PacketBuilder::new(space_id, &mut buf, 0, mtu, self) else {
                continue;
            };
            let sent = self.populate_packet(now, space_id, &mut buf, builder.max_size, send_other);
            builder.ack_eliciting = sent.ack_eliciting;
            if probe && sent.ack_eliciting {
                let space = &mut self.spaces[space_id];
                space.loss_probes = space.loss_probes.saturating_sub(1);
            }
            if self.side.is_client() && space_id == SpaceId::Initial && sent.ack_eliciting {
                builder.pad_to(MIN_INITIAL_SIZE);
            }
            builder.finish_and_track(now, self, &mut buf, sent);
        }

        // A sender held back by the window is not limited by the application
        self.app_limited = buf.is_empty() && !congestion_blocked;
        if buf.is_empty() {
            return None;
        }
        trace!(len = buf.len(), "transmitting datagram");
        self.stats.datagrams_sent += 1;
        self.stats.bytes_sent += buf.len() as u64;
        Some(Transmit {
            destination: self.remote,
            contents: buf.into_boxed_slice(),
        })
    }

    /// Write the frames of one packet in `space_id`
    ///
    /// Only an ACK is written unless `send_other` is set. Frames follow a fixed order: ACK,
    /// HANDSHAKE_DONE, CRYPTO, flow control and stream control frames, PING, then STREAM.
    fn populate_packet(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        buf: &mut Vec<u8>,
        max_size: usize,
        send_other: bool,
    ) -> SentFrames {
        let mut sent = SentFrames::default();
        let space = &mut self.spaces[space_id];

        // ACK
        if !space.pending_acks.ranges().is_empty()
            && (space.pending_acks.can_send() || send_other)
        {
            let delay_micros = space.pending_acks.ack_delay(now).as_micros() as u64;
            let delay = delay_micros >> ACK_DELAY_EXPONENT;
            let mut ack = Vec::new();
            frame::Ack::encode(delay, space.pending_acks.ranges(), &mut ack);
            if buf.len() + ack.len() <= max_size {
                trace!(ranges = ?space.pending_acks.ranges(), "ACK");
                buf.extend_from_slice(&ack);
                sent.largest_acked = space.pending_acks.ranges().max();
                space.pending_acks.acks_sent();
            }
        }

        if !send_other {
            return sent;
        }
        let frames_start = buf.len();

        // HANDSHAKE_DONE
        if space.pending.handshake_done && buf.len() < max_size {
            trace!("HANDSHAKE_DONE");
            space.pending.handshake_done = false;
            sent.retransmits.handshake_done = true;
            buf.write(FrameType::HANDSHAKE_DONE);
        }

        // CRYPTO
        while buf.len() + frame::Crypto::SIZE_BOUND < max_size {
            let Some(mut frame) = space.pending.crypto.pop_front() else {
                break;
            };
            let room = max_size - buf.len() - frame::Crypto::SIZE_BOUND;
            let len = cmp::min(frame.data.len(), room);
            let data = frame.data.split_to(len);
            let truncated = frame::Crypto {
                offset: frame.offset,
                data,
            };
            trace!(off = truncated.offset, len, "CRYPTO");
            truncated.encode(buf);
            sent.retransmits.crypto.push_back(truncated);
            if !frame.data.is_empty() {
                frame.offset += len as u64;
                space.pending.crypto.push_front(frame);
            }
        }

        if space_id == SpaceId::Data {
            self.streams.write_control_frames(
                buf,
                &mut space.pending,
                &mut sent.retransmits,
                max_size,
            );
        }

        // PING
        if space.ping_pending && buf.len() < max_size {
            trace!("PING");
            space.ping_pending = false;
            buf.write(FrameType::PING);
        }

        // STREAM
        if space_id == SpaceId::Data {
            sent.stream_frames = self.streams.write_stream_frames(buf, max_size);
        }

        sent.ack_eliciting = buf.len() > frames_start;
        sent
    }

    /// Build a datagram carrying CONNECTION_CLOSE in every space we hold keys for
    fn transmit_close(&mut self, now: Instant, mtu: usize) -> Option<Transmit> {
        let close = self.state.close_frame()?.clone();
        let mut buf = Vec::with_capacity(mtu);
        for space_id in SpaceId::VALUES {
            if self.spaces[space_id].crypto.is_none() {
                continue;
            }
            if buf.len() + MIN_PACKET_SPACE > mtu {
                break;
            }
            let Some(builder) = PacketBuilder::new(space_id, &mut buf, 0, mtu, self) else {
                continue;
            };
            let max_len = builder.max_size - buf.len();
            match close {
                // Application errors must not leak into unauthenticated handshake packets
                Close::Application(_) if space_id != SpaceId::Data => frame::ConnectionClose {
                    error_code: TransportErrorCode::APPLICATION_ERROR,
                    frame_type: None,
                    reason: Bytes::new(),
                }
                .encode(&mut buf, max_len),
                _ => close.encode(&mut buf, max_len),
            }
            trace!(space = ?space_id, "CONNECTION_CLOSE");
            builder.finish(self, &mut buf);
        }
        if buf.is_empty() {
            return None;
        }
        self.last_close_sent = Some(now);
        self.stats.datagrams_sent += 1;
        self.stats.bytes_sent += buf.len() as u64;
        Some(Transmit {
            destination: self.remote,
            contents: buf.into_boxed_slice(),
        })
    }

    /// Process `ConnectionEvent`s generated by the associated `Endpoint`
    ///
    /// Will execute protocol logic upon receipt of a connection event, in turn preparing signals
    /// (including application `Event`s, `EndpointEvent`s and outgoing datagrams) that should be
    /// extracted through the relevant methods.
    pub fn handle_event(&mut self, event: ConnectionEvent) {
        match event.0 {
            ConnectionEventInner::Datagram {
                now,
                remote,
                first_decode,
                remaining,
            } => {
                if remote != self.remote {
                    debug!(%remote, "discarding packet from unrecognized peer");
                    return;
                }
                self.stats.datagrams_received += 1;
                self.stats.bytes_received +=
                    (first_decode.len() + remaining.as_ref().map_or(0, |x| x.len())) as u64;
                let dst_cid = *first_decode.dst_cid();
                self.handle_decode(now, first_decode);
                if let Some(data) = remaining {
                    self.handle_coalesced(now, dst_cid, data);
                }
            }
        }
    }

    /// Process timer expirations
    ///
    /// Executes protocol logic, potentially preparing signals (including application `Event`s,
    /// `EndpointEvent`s and outgoing datagrams) that should be extracted through the relevant
    /// methods.
    ///
    /// It is most efficient to call this immediately after the system clock reaches the latest
    /// `Instant` that was output by `poll_timeout`; however spurious extra calls will simply
    /// no-op.
    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some(timer) = self.timers.expire_before(now) {
            trace!(timer = ?timer, "timeout");
            match timer {
                Timer::Close => {
                    let reason = match self.state.reason() {
                        Some(reason) => reason.clone(),
                        None => ConnectionError::LocallyClosed,
                    };
                    self.set_state(now, State::Closed(reason));
                    self.endpoint_events.push_back(EndpointEventInner::Drained);
                }
                Timer::Idle => {
                    debug!("idle timeout");
                    self.enter_draining(now, ConnectionError::TimedOut, None);
                }
                Timer::HandshakeTimeout => {
                    debug!("handshake timeout");
                    self.enter_draining(now, ConnectionError::HandshakeTimedOut, None);
                }
                Timer::LossDetection => self.on_loss_detection_timeout(now),
            }
        }
    }

    /// Close a connection immediately
    ///
    /// This does not ensure delivery of outstanding data. It is the application's responsibility
    /// to call this only when all important communications have been completed, e.g. by calling
    /// [`SendStream::finish`] on outstanding streams and waiting for the corresponding
    /// [`StreamEvent::Finished`] event.
    pub fn close(&mut self, now: Instant, error_code: VarInt, reason: Bytes) {
        if self.state.is_closed() {
            return;
        }
        debug!(code = %error_code, "closing");
        let close = Close::Application(frame::ApplicationClose { error_code, reason });
        self.enter_draining(now, ConnectionError::LocallyClosed, Some(close));
        self.close_pending = true;
    }

    /// Current lifecycle stage
    pub fn state(&self) -> ConnectionState {
        self.state.kind()
    }

    /// Whether the connection is in the process of being established
    ///
    /// If this returns `false`, the connection may be either established or closed, signaled by the
    /// emission of a `Connected` or `ConnectionLost` message respectively.
    pub fn is_handshaking(&self) -> bool {
        self.state.is_handshake()
    }

    /// Whether the connection is closed
    ///
    /// Closed connections cannot transport any further data. A connection becomes closed when
    /// either peer application intentionally closes it, or when either transport layer detects an
    /// error such as a time-out or certificate validation failure.
    ///
    /// A `ConnectionLost` event is emitted with details when the connection becomes closed.
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Whether there is no longer any need to keep the connection around
    ///
    /// Closed connections become drained after a brief timeout to absorb any remaining in-flight
    /// packets from the peer. All drained connections have been closed.
    pub fn is_drained(&self) -> bool {
        self.state.is_drained()
    }

    /// The reason the connection closed, if it did
    pub fn close_reason(&self) -> Option<&ConnectionError> {
        self.state.reason()
    }

    /// Which side of the connection this is
    pub fn side(&self) -> Side {
        self.side
    }

    /// The latest socket address for this connection's peer
    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    /// Current best estimate of this connection's latency (round-trip-time)
    pub fn rtt(&self) -> Duration {
        self.rtt.get()
    }

    /// Current state of this connection's congestion controller, for debugging purposes
    pub fn congestion_state(&self) -> &dyn Controller {
        self.congestion.as_ref()
    }

    /// Returns connection statistics
    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Handle the already-decoded first packet of a datagram, and any remainder
    fn handle_coalesced(&mut self, now: Instant, dst_cid: ConnectionId, data: BytesMut) {
        let mut remaining = Some(data);
        while let Some(data) = remaining {
            match PartialDecode::new(data, self.endpoint_config.local_cid_len) {
                Ok((partial, rest)) => {
                    remaining = rest;
                    if *partial.dst_cid() != dst_cid {
                        debug!("discarding coalesced packet with mismatched destination CID");
                        continue;
                    }
                    self.handle_decode(now, partial);
                }
                Err(e) => {
                    trace!("malformed coalesced packet: {}", e);
                    return;
                }
            }
        }
    }

    fn handle_decode(&mut self, now: Instant, partial: PartialDecode) {
        if self.state.is_drained() {
            return;
        }
        let space_id = partial.space();
        let size = partial.len();
        let result = {
            let space = &self.spaces[space_id];
            let Some(ref keys) = space.crypto else {
                trace!(space = ?space_id, "discarding packet without keys");
                return;
            };
            packet::decode(
                partial,
                &*keys.header.remote,
                &*keys.packet.remote,
                space.rx_packet + 1,
            )
        };

        match result {
            Ok(packet) => self.handle_packet(now, packet, size),
            Err(e) if e.is_fatal() => {
                warn!(space = ?space_id, "undecodable packet: {}", e);
                self.close_with_error(now, decode_error_to_transport(e));
            }
            Err(e) => trace!(space = ?space_id, "dropping packet: {}", e),
        }
    }

    fn handle_packet(&mut self, now: Instant, packet: packet::DecodedPacket, size: usize) {
        let packet::DecodedPacket {
            header,
            number,
            frames,
        } = packet;
        let space_id = header.space();
        if space_id == SpaceId::Data && self.state.is_handshake() {
            debug!(pn = number, "dropping 1-RTT packet received before handshake completion");
            return;
        }
        if self.spaces[space_id].dedup.insert(number) {
            debug!(pn = number, "discarding possible duplicate packet");
            return;
        }

        trace!(space = ?space_id, pn = number, "got packet");
        self.stats.packets_received += 1;
        self.emit(
            now,
            telemetry::Event::PacketReceived {
                space: space_id,
                number,
                size: u16::try_from(size).unwrap_or(u16::MAX),
            },
        );
        let space = &mut self.spaces[space_id];
        space.rx_packet = space.rx_packet.max(number);

        if let State::Draining { .. } = self.state {
            // Remind the peer we are closing, at most once per probe timeout
            let pto = self.pto(space_id);
            if self.last_close_sent.map_or(true, |sent| now >= sent + pto) {
                self.close_pending = true;
            }
            return;
        }

        if !self.rem_cid_set {
            if let Header::Initial { src_cid, .. } | Header::Handshake { src_cid, .. } = header {
                trace!(cid = %src_cid, "switching to remote CID");
                self.rem_cid = src_cid;
                self.rem_cid_set = true;
            }
        }
        if self.side.is_server()
            && space_id == SpaceId::Handshake
            && self.spaces[SpaceId::Initial].crypto.is_some()
        {
            // A Handshake packet proves the client has our Initial
            self.discard_space(SpaceId::Initial);
        }

        let ack_eliciting = frames.iter().any(Frame::is_ack_eliciting);
        self.spaces[space_id]
            .pending_acks
            .packet_received(now, number, ack_eliciting);
        self.reset_idle_timeout(now);
        self.permit_idle_reset = true;

        if let Err(err) = self.process_frames(now, space_id, frames) {
            warn!("protocol violation: {}", err);
            self.close_with_error(now, err);
        }
    }

    fn process_frames(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        frames: Vec<Frame>,
    ) -> Result<(), TransportError> {
        for frame in frames {
            if space_id != SpaceId::Data && !frame.is_handshake_permitted() {
                debug!(ty = %frame.ty(), "ignoring frame not permitted during the handshake");
                continue;
            }
            match frame {
                Frame::Padding | Frame::Ping => {}
                Frame::Ack(ack) => self.on_ack_received(now, space_id, ack)?,
                Frame::Crypto(frame) => self.read_crypto(now, space_id, frame)?,
                Frame::Close(reason) => {
                    debug!("peer closed the connection");
                    self.enter_draining(now, reason.into(), None);
                    return Ok(());
                }
                Frame::HandshakeDone => {
                    if self.side.is_server() {
                        return Err(TransportError::PROTOCOL_VIOLATION(
                            "client sent HANDSHAKE_DONE",
                        ));
                    }
                    if self.spaces[SpaceId::Handshake].crypto.is_some() {
                        self.discard_space(SpaceId::Handshake);
                    }
                }
                Frame::Stream(frame) => {
                    if self.streams.received(frame)?.should_transmit() {
                        self.spaces[SpaceId::Data].pending.max_data = true;
                    }
                }
                Frame::ResetStream(frame) => {
                    if self.streams.received_reset(frame)?.should_transmit() {
                        self.spaces[SpaceId::Data].pending.max_data = true;
                    }
                }
                Frame::StopSending(frame) => {
                    self.streams.received_stop_sending(
                        frame.id,
                        frame.error_code,
                        &mut self.spaces[SpaceId::Data].pending,
                    )?;
                }
                Frame::MaxData(bytes) => self.streams.received_max_data(bytes),
                Frame::MaxStreamData { id, offset } => {
                    self.streams.received_max_stream_data(id, offset)?
                }
                Frame::MaxStreams { dir, count } => self.streams.received_max_streams(dir, count)?,
                Frame::DataBlocked { offset } => {
                    debug!(offset, "peer claims to be blocked at connection level");
                }
                Frame::StreamDataBlocked { id, offset } => {
                    debug!(stream = %id, offset, "peer claims to be blocked at stream level");
                }
                Frame::StreamsBlocked { dir, limit } => {
                    if limit > MAX_STREAM_COUNT {
                        return Err(TransportError::FRAME_ENCODING_ERROR(
                            "unrepresentable stream limit",
                        ));
                    }
                    debug!(limit, "peer claims to be blocked opening more than {} streams", dir);
                }
            }
        }
        Ok(())
    }

    fn read_crypto(
        &mut self,
        now: Instant,
        space_id: SpaceId,
        frame: frame::Crypto,
    ) -> Result<(), TransportError> {
        let space = &mut self.spaces[space_id];
        let end = frame.offset + frame.data.len() as u64;
        if end > space.crypto_stream.bytes_read() + MAX_CRYPTO_BUFFER {
            return Err(TransportError::CRYPTO_BUFFER_EXCEEDED(""));
        }
        space.crypto_stream.insert(frame.offset, frame.data);
        while let Some(chunk) = space.crypto_stream.read(usize::MAX) {
            trace!(space = ?space_id, len = chunk.len(), "read handshake data");
            self.crypto.read_handshake(space_id, &chunk)?;
        }

        self.write_crypto(now);
        if self.state.is_handshake() && !self.crypto.is_handshaking() {
            self.on_handshake_complete(now)?;
        }
        Ok(())
    }

    /// Queue outgoing handshake data and install newly derived keys
    fn write_crypto(&mut self, now: Instant) {
        loop {
            if let Some((space_id, data)) = self.crypto.write_handshake() {
                let space = &mut self.spaces[space_id];
                let offset = space.crypto_offset;
                space.crypto_offset += data.len() as u64;
                trace!(space = ?space_id, len = data.len(), "queued handshake data");
                space.pending.crypto.push_back(frame::Crypto {
                    offset,
                    data: Bytes::from(data),
                });
                continue;
            }
            if let Some((space_id, keys)) = self.crypto.next_keys() {
                debug!(space = ?space_id, "keys ready");
                self.spaces[space_id].crypto = Some(keys);
                self.highest_space = cmp::max(self.highest_space, space_id);
                if space_id == SpaceId::Handshake && matches!(self.state, State::Initial) {
                    self.set_state(now, State::Handshaking);
                }
                continue;
            }
            break;
        }
    }

    fn on_handshake_complete(&mut self, now: Instant) -> Result<(), TransportError> {
        let params = *self.crypto.transport_parameters().ok_or_else(|| {
            TransportError::TRANSPORT_PARAMETER_ERROR("transport parameters missing")
        })?;
        if params.initial_src_cid != Some(self.rem_cid) {
            debug!(
                expected = %self.rem_cid,
                got = ?params.initial_src_cid,
                "CID authentication failure"
            );
            return Err(TransportError::TRANSPORT_PARAMETER_ERROR(
                "CID authentication failure",
            ));
        }
        self.set_peer_params(params);

        self.set_state(now, State::Established);
        self.timers.stop(Timer::HandshakeTimeout);
        self.events.push_back(Event::Connected);
        if self.side.is_server() {
            self.spaces[SpaceId::Data].pending.handshake_done = true;
            if self.spaces[SpaceId::Handshake].crypto.is_some() {
                self.discard_space(SpaceId::Handshake);
            }
        }
        Ok(())
    }

    fn set_peer_params(&mut self, params: TransportParameters) {
        self.streams.set_params(&params);
        let peer_idle = match params.max_idle_timeout.into_inner() {
            0 => None,
            x => Some(Duration::from_millis(x)),
        };
        // The effective idle timeout is the smaller of the two non-zero values
        self.idle_timeout = match (self.idle_timeout, peer_idle) {
            (Some(local), Some(peer)) => Some(cmp::min(local, peer)),
            (local, peer) => local.or(peer),
        };
        self.peer_params = params;
    }

    fn set_state(&mut self, now: Instant, state: State) {
        let from = self.state.kind();
        self.state = state;
        let to = self.state.kind();
        if from != to {
            debug!(?from, ?to, "state changed");
            self.emit(now, telemetry::Event::StateChanged { from, to });
        }
    }

    /// Stop all protocol activity and wait out the drain period
    ///
    /// `close` is the locally originated frame that answers stray packets; without one, a
    /// `NO_ERROR` close is echoed.
    fn enter_draining(&mut self, now: Instant, reason: ConnectionError, close: Option<Close>) {
        if self.state.is_closed() {
            return;
        }
        self.set_state(
            now,
            State::Draining {
                reason: reason.clone(),
                close: close.unwrap_or_else(|| TransportError::NO_ERROR("").into()),
            },
        );
        self.emit(
            now,
            telemetry::Event::ConnectionClosed {
                reason: reason.clone(),
            },
        );
        self.events.push_back(Event::ConnectionLost { reason });

        for timer in [Timer::LossDetection, Timer::Idle, Timer::HandshakeTimeout] {
            self.timers.stop(timer);
        }
        let drain = 3 * self.pto(self.highest_space);
        self.timers.set(Timer::Close, now + drain);
    }

    fn close_with_error(&mut self, now: Instant, error: TransportError) {
        let close = Close::from(error.clone());
        self.enter_draining(now, ConnectionError::TransportError(error), Some(close));
        self.close_pending = true;
    }

    fn reset_idle_timeout(&mut self, now: Instant) {
        match self.idle_timeout {
            Some(timeout) => self.timers.set(Timer::Idle, now + timeout),
            None => self.timers.stop(Timer::Idle),
        }
    }

    /// Whether nothing but the idle timer is pending
    #[cfg(test)]
    pub(crate) fn is_idle(&self) -> bool {
        Timer::VALUES
            .into_iter()
            .filter(|&t| t != Timer::Idle)
            .all(|t| self.timers.get(t).is_none())
    }

    #[cfg(test)]
    pub(crate) fn queue_handshake_done(&mut self) {
        self.spaces[SpaceId::Data].pending.handshake_done = true;
    }

    #[cfg(test)]
    pub(crate) fn current_pto(&self) -> Duration {
        self.pto(SpaceId::Data)
    }

    /// Forward an event to the configured telemetry sink
    pub(crate) fn emit(&self, now: Instant, event: telemetry::Event) {
        if let Some(ref sink) = self.config.telemetry {
            sink.event(now, self.loc_cid, event);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("loc_cid", &self.loc_cid)
            .field("rem_cid", &self.rem_cid)
            .field("state", &self.state.kind())
            .finish_non_exhaustive()
    }
}

fn decode_error_to_transport(error: DecodeError) -> TransportError {
    match error {
        DecodeError::FrameParseFailure(frame) => frame.into(),
        DecodeError::TruncatedPacket(reason) => TransportError::PROTOCOL_VIOLATION(reason),
        e => TransportError::PROTOCOL_VIOLATION(e.to_string()),
    }
}

/// Frames written into a packet, kept for acknowledgement and loss handling
#[derive(Default)]
struct SentFrames {
    retransmits: Retransmits,
    largest_acked: Option<u64>,
    stream_frames: Vec<frame::StreamMeta>,
    ack_eliciting: bool,
}

/// Reasons why a connection might be lost
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The peer violated the QUIC specification as understood by this implementation
    #[error(transparent)]
    TransportError(#[from] TransportError),
    /// The peer's QUIC stack aborted the connection automatically
    #[error("aborted by peer: {0}")]
    ConnectionClosed(frame::ConnectionClose),
    /// The peer closed the connection
    #[error("closed by peer: {0}")]
    ApplicationClosed(frame::ApplicationClose),
    /// The local application closed the connection
    #[error("closed")]
    LocallyClosed,
    /// The peer has become unreachable
    #[error("timed out")]
    TimedOut,
    /// The handshake did not complete in time
    #[error("handshake timed out")]
    HandshakeTimedOut,
}

impl From<Close> for ConnectionError {
    fn from(x: Close) -> Self {
        match x {
            Close::Connection(reason) => Self::ConnectionClosed(reason),
            Close::Application(reason) => Self::ApplicationClosed(reason),
        }
    }
}

/// Events of interest to the application
#[derive(Debug)]
pub enum Event {
    /// The connection was successfully established
    Connected,
    /// The connection was lost
    ///
    /// Emitted if the peer closes the connection, an error is encountered, or the local
    /// application closes it.
    ConnectionLost {
        /// Reason that the connection was closed
        reason: ConnectionError,
    },
    /// Stream events
    Stream(StreamEvent),
}

/// Connection statistics
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ConnectionStats {
    /// UDP datagrams transmitted
    pub datagrams_sent: u64,
    /// Bytes of UDP payload transmitted
    pub bytes_sent: u64,
    /// UDP datagrams received and routed to this connection
    pub datagrams_received: u64,
    /// Bytes of UDP payload received
    pub bytes_received: u64,
    /// Packets sealed, across all spaces
    pub packets_sent: u64,
    /// Packets authenticated and processed, across all spaces
    pub packets_received: u64,
    /// Packets declared lost
    pub lost_packets: u64,
    /// Probe timeouts that fired
    pub pto_count: u64,
    /// Loss events that reduced the congestion window
    pub congestion_events: u64,
}

/// Exponent applied to the ACK Delay field of the ACK frames we send; the protocol default
const ACK_DELAY_EXPONENT: u8 = 3;
/// Most handshake data buffered ahead of what the handshake consumed
const MAX_CRYPTO_BUFFER: u64 = 64 * 1024;
/// Long header with the largest connection IDs and a 4-byte packet number
const MAX_HEADER_SIZE: usize = 1 + 4 + 1 + MAX_CID_SIZE + 1 + MAX_CID_SIZE + 1 + 2 + 4;
/// Room needed to start another packet in a datagram: a header, a tag and a few frames
const MIN_PACKET_SPACE: usize = MAX_HEADER_SIZE + 16 + 32;
