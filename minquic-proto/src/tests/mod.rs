use std::{
    iter,
    sync::Arc,
    time::{Duration, Instant},
};

use assert_matches::assert_matches;
use bytes::{Bytes, BytesMut};
use tracing::info;

use super::*;
use crate::{
    packet::{Header, PacketNumber, FIXED_BIT, LONG_HEADER_FORM},
    telemetry::Event as TelemetryEvent,
};

mod util;
use util::*;

#[test]
fn lifecycle() {
    let _guard = subscribe();
    let recorder = Arc::new(Recorder::default());
    let mut transport = TransportConfig::default();
    transport.telemetry(Some(recorder.clone() as Arc<dyn telemetry::Sink>));
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect_with(client_config_with(transport));

    assert_eq!(
        pair.client_conn_mut(client_ch).state(),
        ConnectionState::Established
    );
    assert_eq!(
        pair.server_conn_mut(server_ch).state(),
        ConnectionState::Established
    );
    assert_eq!(pair.client.endpoint.open_connections(), 1);
    assert_eq!(pair.server.endpoint.open_connections(), 1);

    let now = pair.time;
    pair.client_conn_mut(client_ch)
        .close(now, VarInt::from_u32(42), Bytes::new());
    pair.drive();

    assert_matches!(
        pair.client_conn_mut(client_ch).poll(),
        Some(Event::ConnectionLost {
            reason: ConnectionError::LocallyClosed
        })
    );
    assert_matches!(
        pair.server_conn_mut(server_ch).poll(),
        Some(Event::ConnectionLost {
            reason: ConnectionError::ApplicationClosed(ApplicationClose { error_code, .. })
        }) if error_code == VarInt::from_u32(42)
    );
    assert!(pair.client_conn_mut(client_ch).is_drained());
    assert!(pair.server_conn_mut(server_ch).is_drained());
    assert_eq!(pair.client.endpoint.open_connections(), 0);
    assert_eq!(pair.server.endpoint.open_connections(), 0);
    assert_eq!(pair.server.endpoint.known_cids(), 0);

    let states = state_changes(&recorder);
    assert_eq!(
        states,
        [
            (ConnectionState::Initial, ConnectionState::Handshaking),
            (ConnectionState::Handshaking, ConnectionState::Established),
            (ConnectionState::Established, ConnectionState::Draining),
            (ConnectionState::Draining, ConnectionState::Closed),
        ]
    );
}

#[test]
fn get_request_response() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect();

    const REQUEST: &[u8] = b"GET /\r\n";
    const RESPONSE: &[u8] = b"HTTP/1.0 200 OK\r\n\r\nhello world\n";

    let s = pair.client_streams(client_ch).open(Dir::Bi).unwrap();
    assert_eq!(pair.client_send(client_ch, s).write(REQUEST), Ok(REQUEST.len()));
    pair.client_send(client_ch, s).finish().unwrap();
    pair.drive();

    assert_matches!(
        pair.server_conn_mut(server_ch).poll(),
        Some(Event::Stream(StreamEvent::Opened { dir: Dir::Bi }))
    );
    assert_eq!(pair.server_streams(server_ch).accept(Dir::Bi), Some(s));
    assert_eq!(read_to_end(&mut pair.server_recv(server_ch, s)), REQUEST);

    assert_eq!(
        pair.server_send(server_ch, s).write(RESPONSE),
        Ok(RESPONSE.len())
    );
    pair.server_send(server_ch, s).finish().unwrap();
    pair.drive();

    let response = read_to_end(&mut pair.client_recv(client_ch, s));
    assert!(response.starts_with(b"HTTP/1.0 200 OK"));
    assert_eq!(response, RESPONSE);

    // Both sides observe the remote acknowledging their FIN
    let client_events = drain_events(pair.client_conn_mut(client_ch));
    assert!(client_events.contains(&StreamEvent::Finished { id: s }));
    let server_events = drain_events(pair.server_conn_mut(server_ch));
    assert!(server_events.contains(&StreamEvent::Finished { id: s }));
}

#[test]
fn duplicated_datagrams_delivered_once() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect();
    let before = pair.server_conn_mut(server_ch).stats();

    pair.client.fates.extend(iter::repeat(Fate::Duplicate).take(64));
    const MSG: &[u8] = b"exactly once";
    let s = pair.client_streams(client_ch).open(Dir::Uni).unwrap();
    pair.client_send(client_ch, s).write(MSG).unwrap();
    pair.client_send(client_ch, s).finish().unwrap();
    pair.drive();

    assert_eq!(pair.server_streams(server_ch).accept(Dir::Uni), Some(s));
    assert_eq!(read_to_end(&mut pair.server_recv(server_ch, s)), MSG);

    let after = pair.server_conn_mut(server_ch).stats();
    let datagrams = after.datagrams_received - before.datagrams_received;
    let packets = after.packets_received - before.packets_received;
    assert!(packets > 0);
    assert_eq!(datagrams, 2 * packets);
}

#[test]
fn idle_timeout() {
    let _guard = subscribe();
    let recorder = Arc::new(Recorder::default());
    let mut transport = TransportConfig::default();
    transport
        .max_idle_timeout(Some(IdleTimeout::try_from(Duration::from_secs(1)).unwrap()))
        .telemetry(Some(recorder.clone() as Arc<dyn telemetry::Sink>));
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect_with(client_config_with(transport));

    let start = pair.time;
    pair.drive_until(start + Duration::from_secs(3));

    assert_matches!(
        pair.client_conn_mut(client_ch).poll(),
        Some(Event::ConnectionLost {
            reason: ConnectionError::TimedOut
        })
    );
    // The smaller of the two advertised timeouts applies to both peers
    assert_matches!(
        pair.server_conn_mut(server_ch).poll(),
        Some(Event::ConnectionLost {
            reason: ConnectionError::TimedOut
        })
    );
    assert_eq!(
        pair.client_conn_mut(client_ch).state(),
        ConnectionState::Closed
    );
    assert_eq!(pair.client.endpoint.open_connections(), 0);
    assert_eq!(pair.server.endpoint.open_connections(), 0);

    let states = state_changes(&recorder);
    assert_eq!(
        &states[states.len() - 2..],
        [
            (ConnectionState::Established, ConnectionState::Draining),
            (ConnectionState::Draining, ConnectionState::Closed),
        ]
    );
    assert!(recorder.events.lock().unwrap().iter().any(|(_, e)| matches!(
        e,
        TelemetryEvent::ConnectionClosed {
            reason: ConnectionError::TimedOut
        }
    )));
}

#[test]
fn handshake_timeout() {
    let _guard = subscribe();
    let mut transport = TransportConfig::default();
    transport.handshake_timeout(Duration::from_secs(3));
    let mut pair = Pair::default();
    pair.client.fates.extend(iter::repeat(Fate::Drop).take(1000));
    let client_ch = pair.begin_connect(client_config_with(transport));
    pair.drive();

    assert_matches!(
        pair.client_conn_mut(client_ch).poll(),
        Some(Event::ConnectionLost {
            reason: ConnectionError::HandshakeTimedOut
        })
    );
    assert!(pair.client_conn_mut(client_ch).is_drained());
    assert!(pair.server.connections.is_empty());
}

#[test]
fn registry_drops_unknown_and_undersized() {
    let _guard = subscribe();
    let mut server = Endpoint::new(Default::default(), Some(Arc::new(server_config())));
    let mut client = Endpoint::new(Default::default(), None);
    let now = Instant::now();
    let remote = "[::1]:4433".parse().unwrap();
    let dst_cid = ConnectionId::new(&[0xaa; 8]);
    let src_cid = ConnectionId::new(&[0xbb; 8]);

    // Short header for a connection nobody knows
    let mut short = vec![FIXED_BIT];
    short.extend_from_slice(&[0xcc; 60]);
    assert!(server.handle(now, remote, BytesMut::from(&short[..])).is_none());

    // Unsupported version
    let mut unsupported = vec![LONG_HEADER_FORM | FIXED_BIT, 0xba, 0xba, 0xba, 0xba, 8];
    unsupported.extend_from_slice(&dst_cid);
    unsupported.push(8);
    unsupported.extend_from_slice(&src_cid);
    unsupported.resize(1200, 0);
    assert!(server
        .handle(now, remote, BytesMut::from(&unsupported[..]))
        .is_none());

    // Initial below the minimum datagram size
    assert!(server
        .handle(now, remote, initial_datagram(&dst_cid, src_cid, 600))
        .is_none());

    // Initial with a destination ID that is too short
    let short_cid = ConnectionId::new(&[0xaa; 4]);
    assert!(server
        .handle(now, remote, initial_datagram(&short_cid, src_cid, 1200))
        .is_none());

    // Initial that fails authentication
    let mut forged = initial_datagram(&dst_cid, src_cid, 1200);
    let last = forged.len() - 1;
    forged[last] ^= 0xff;
    assert!(server.handle(now, remote, forged).is_none());

    // A valid Initial reaching a client-only endpoint
    assert!(client
        .handle(now, remote, initial_datagram(&dst_cid, src_cid, 1200))
        .is_none());

    assert_eq!(server.open_connections(), 0);
    assert_eq!(server.known_cids(), 0);

    // The same Initial, well-formed, does start a connection
    assert_matches!(
        server.handle(now, remote, initial_datagram(&dst_cid, src_cid, 1200)),
        Some((_, DatagramEvent::NewConnection(_)))
    );
    assert_eq!(server.open_connections(), 1);
}

#[test]
fn connection_limit() {
    let _guard = subscribe();
    let mut endpoint_config = EndpointConfig::default();
    endpoint_config.max_concurrent_connections(1);
    let mut pair = Pair::default();
    pair.server.endpoint = Endpoint::new(
        Arc::new(endpoint_config),
        Some(Arc::new(server_config())),
    );
    pair.connect();

    // A second attempt is dropped by the server and eventually gives up
    let mut transport = TransportConfig::default();
    transport.handshake_timeout(Duration::from_secs(2));
    let client_ch = pair.begin_connect(client_config_with(transport));
    pair.drive_until(pair.time + Duration::from_secs(5));
    assert_matches!(
        pair.client_conn_mut(client_ch).poll(),
        Some(Event::ConnectionLost {
            reason: ConnectionError::HandshakeTimedOut
        })
    );
    assert_eq!(pair.server.endpoint.open_connections(), 1);
}

#[test]
fn bytes_in_flight_bounded_by_window() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect();
    let s = pair.client_streams(client_ch).open(Dir::Uni).unwrap();

    const TOTAL: usize = 4 * 1024 * 1024;
    let mut transfer = Transfer::new(s, TOTAL);
    for _ in 0..100_000 {
        transfer.write(&mut pair, client_ch);
        pair.step();
        let conn = pair.client_conn_mut(client_ch);
        assert!(
            conn.bytes_in_flight() <= conn.congestion_state().window(),
            "{} bytes in flight exceed window of {}",
            conn.bytes_in_flight(),
            conn.congestion_state().window()
        );
        if transfer.read(&mut pair, server_ch) {
            break;
        }
    }
    assert_eq!(transfer.received, TOTAL);
    assert_eq!(pair.client_conn_mut(client_ch).stats().lost_packets, 0);
}

#[test]
fn loss_reduces_window_and_is_repaired() {
    let _guard = subscribe();
    let recorder = Arc::new(Recorder::default());
    let mut transport = TransportConfig::default();
    transport.telemetry(Some(recorder.clone() as Arc<dyn telemetry::Sink>));
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect_with(client_config_with(transport));
    let s = pair.client_streams(client_ch).open(Dir::Uni).unwrap();

    pair.client.fates.extend([
        Fate::Deliver,
        Fate::Deliver,
        Fate::Drop,
        Fate::Deliver,
        Fate::Deliver,
        Fate::Deliver,
        Fate::Drop,
    ]);

    const TOTAL: usize = 256 * 1024;
    let mut transfer = Transfer::new(s, TOTAL);
    let mut window_before_loss = None;
    let mut window_after_loss = None;
    for _ in 0..100_000 {
        let window = pair.client_conn_mut(client_ch).congestion_state().window();
        transfer.write(&mut pair, client_ch);
        pair.step();
        let conn = pair.client_conn_mut(client_ch);
        if window_after_loss.is_none() && conn.stats().congestion_events > 0 {
            window_before_loss = Some(window);
            window_after_loss = Some(conn.congestion_state().window());
        }
        if transfer.read(&mut pair, server_ch) {
            break;
        }
    }
    assert_eq!(transfer.received, TOTAL);
    let stats = pair.client_conn_mut(client_ch).stats();
    info!(?stats, "transfer complete");
    assert!(stats.lost_packets >= 2);
    assert!(stats.congestion_events >= 1);
    assert!(window_after_loss.unwrap() < window_before_loss.unwrap());

    // Retransmissions use fresh packet numbers
    let events = recorder.events.lock().unwrap();
    for space in SpaceId::VALUES {
        let numbers = events
            .iter()
            .filter_map(|(_, e)| match *e {
                TelemetryEvent::PacketSent { space: s, number, .. } if s == space => Some(number),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert!(
            numbers.windows(2).all(|w| w[0] < w[1]),
            "{space:?} packet numbers not strictly increasing"
        );
    }
    assert!(events
        .iter()
        .any(|(_, e)| matches!(e, TelemetryEvent::PacketLost { .. })));
}

#[test]
fn flow_control_blocks_writes() {
    let _guard = subscribe();
    let mut server_transport = TransportConfig::default();
    server_transport.stream_receive_window(VarInt::from_u32(1000));
    let mut pair = Pair::new(Default::default(), server_config_with(server_transport));
    let (client_ch, server_ch) = pair.connect();

    let s = pair.client_streams(client_ch).open(Dir::Bi).unwrap();
    assert_eq!(pair.client_send(client_ch, s).write(&[0xab; 1500]), Ok(1000));
    assert_matches!(
        pair.client_send(client_ch, s).write(&[0xab; 500]),
        Err(WriteError::Blocked)
    );
    pair.drive();

    assert_eq!(pair.server_streams(server_ch).accept(Dir::Bi), Some(s));
    let mut read = 0;
    loop {
        match pair.server_recv(server_ch, s).read(usize::MAX) {
            Ok(Some(chunk)) => read += chunk.len(),
            Err(ReadError::Blocked) => break,
            x => panic!("unexpected read result {x:?}"),
        }
    }
    assert_eq!(read, 1000);
    pair.drive();

    let events = drain_events(pair.client_conn_mut(client_ch));
    assert!(events.contains(&StreamEvent::Writable { id: s }));
    assert_matches!(pair.client_send(client_ch, s).write(&[0xab; 500]), Ok(500));
}

#[test]
fn stream_limit_raised_after_close() {
    let _guard = subscribe();
    let mut server_transport = TransportConfig::default();
    server_transport.max_concurrent_bidi_streams(VarInt::from_u32(1));
    let mut pair = Pair::new(Default::default(), server_config_with(server_transport));
    let (client_ch, server_ch) = pair.connect();

    let s = pair.client_streams(client_ch).open(Dir::Bi).unwrap();
    assert_eq!(pair.client_streams(client_ch).open(Dir::Bi), None);
    pair.client_send(client_ch, s).write(b"ping").unwrap();
    pair.client_send(client_ch, s).finish().unwrap();
    pair.drive();

    assert_eq!(pair.server_streams(server_ch).accept(Dir::Bi), Some(s));
    assert_eq!(read_to_end(&mut pair.server_recv(server_ch, s)), b"ping");
    pair.server_send(server_ch, s).write(b"pong").unwrap();
    pair.server_send(server_ch, s).finish().unwrap();
    pair.drive();
    assert_eq!(read_to_end(&mut pair.client_recv(client_ch, s)), b"pong");
    pair.drive();

    let events = drain_events(pair.client_conn_mut(client_ch));
    assert!(events.contains(&StreamEvent::Available { dir: Dir::Bi }));
    assert!(pair.client_streams(client_ch).open(Dir::Bi).is_some());
}

#[test]
fn stop_sending_resets_stream() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect();

    let s = pair.client_streams(client_ch).open(Dir::Uni).unwrap();
    pair.client_send(client_ch, s).write(b"unwanted").unwrap();
    pair.drive();

    assert_eq!(pair.server_streams(server_ch).accept(Dir::Uni), Some(s));
    pair.server_recv(server_ch, s)
        .stop(VarInt::from_u32(7))
        .unwrap();
    pair.drive();

    let events = drain_events(pair.client_conn_mut(client_ch));
    assert!(events.contains(&StreamEvent::Stopped {
        id: s,
        error_code: VarInt::from_u32(7)
    }));
    assert_matches!(
        pair.client_send(client_ch, s).write(b"more"),
        Err(WriteError::ClosedStream)
    );
}

#[test]
fn reset_stream_reported_to_reader() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect();

    let s = pair.client_streams(client_ch).open(Dir::Uni).unwrap();
    pair.client_send(client_ch, s).write(b"partial").unwrap();
    pair.drive();
    pair.client_send(client_ch, s)
        .reset(VarInt::from_u32(3))
        .unwrap();
    pair.drive();

    assert_eq!(pair.server_streams(server_ch).accept(Dir::Uni), Some(s));
    let mut recv = pair.server_recv(server_ch, s);
    loop {
        match recv.read(usize::MAX) {
            Ok(Some(_)) => continue,
            Err(ReadError::Reset(code)) => {
                assert_eq!(code, VarInt::from_u32(3));
                break;
            }
            x => panic!("unexpected read result {x:?}"),
        }
    }
}

#[test]
fn peer_protocol_violation_closes_connection() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect();

    // HANDSHAKE_DONE is only ever sent by servers
    pair.client_conn_mut(client_ch).queue_handshake_done();
    pair.drive();

    assert_matches!(
        pair.server_conn_mut(server_ch).poll(),
        Some(Event::ConnectionLost {
            reason: ConnectionError::TransportError(ref e)
        }) if e.code == TransportErrorCode::PROTOCOL_VIOLATION
    );
    assert_matches!(
        pair.client_conn_mut(client_ch).poll(),
        Some(Event::ConnectionLost {
            reason: ConnectionError::ConnectionClosed(ConnectionClose { error_code, .. })
        }) if error_code == TransportErrorCode::PROTOCOL_VIOLATION
    );
}

/// Build a client Initial carrying a PING, padded to `size` bytes
#[test]
fn draining_answers_stray_packets_once_per_pto() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect();
    let s = pair.client_streams(client_ch).open(Dir::Uni).unwrap();

    // Fresh 1-RTT packets, held back until the server is draining
    let mut stray = Vec::new();
    for _ in 0..3 {
        assert_eq!(pair.client_send(client_ch, s).write(b"stray"), Ok(5));
        pair.drive_client();
        stray.extend(pair.server.inbound.drain(..).map(|(_, x)| x));
    }
    assert_eq!(stray.len(), 3);

    let now = pair.time;
    pair.client_conn_mut(client_ch)
        .close(now, VarInt::from_u32(0), Bytes::new());
    pair.drive_client();
    pair.drive_server();
    assert_eq!(
        pair.server_conn_mut(server_ch).state(),
        ConnectionState::Draining
    );
    assert!(pair.client.inbound.is_empty());

    fn deliver_to_server(pair: &mut Pair, datagram: Box<[u8]>) {
        let at = pair.time;
        pair.server.inbound.push_back((at, datagram));
        pair.drive_server();
    }

    let pto = pair.server_conn_mut(server_ch).current_pto();
    let mut stray = stray.into_iter();
    deliver_to_server(&mut pair, stray.next().unwrap());
    assert_eq!(pair.client.inbound.len(), 1);
    assert_eq!(pair.client.inbound[0].1[0] & LONG_HEADER_FORM, 0);

    deliver_to_server(&mut pair, stray.next().unwrap());
    assert_eq!(
        pair.client.inbound.len(),
        1,
        "CONNECTION_CLOSE repeated within one PTO"
    );

    pair.time += pto;
    deliver_to_server(&mut pair, stray.next().unwrap());
    assert_eq!(pair.client.inbound.len(), 2);
    assert_eq!(
        pair.server_conn_mut(server_ch).state(),
        ConnectionState::Draining
    );

    pair.drive();
    assert!(pair.server_conn_mut(server_ch).is_drained());
    assert_eq!(pair.server.endpoint.open_connections(), 0);
}

#[test]
fn tail_loss_repaired_by_pto() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let (client_ch, server_ch) = pair.connect();
    let s = pair.client_streams(client_ch).open(Dir::Uni).unwrap();
    let pto = pair.client_conn_mut(client_ch).current_pto();

    const LEN: usize = 3000;
    assert_eq!(pair.client_send(client_ch, s).write(&[0xab; LEN]), Ok(LEN));
    pair.client_send(client_ch, s).finish().unwrap();
    let sent_at = pair.time;
    pair.drive_client();
    // The whole flight vanishes, so no later acknowledgement can reveal the loss
    assert!(pair.server.inbound.len() >= 2);
    pair.server.inbound.clear();

    pair.drive_until(sent_at + pto - Duration::from_millis(1));
    assert_eq!(pair.client_conn_mut(client_ch).stats().pto_count, 0);
    assert_eq!(pair.server_streams(server_ch).accept(Dir::Uni), None);

    pair.drive();
    let stats = pair.client_conn_mut(client_ch).stats();
    info!(?stats, "repaired");
    assert!(stats.pto_count >= 1);
    assert_eq!(pair.server_streams(server_ch).accept(Dir::Uni), Some(s));
    let data = read_to_end(&mut pair.server_recv(server_ch, s));
    assert_eq!(data, [0xab; LEN]);
}

#[test]
fn window_held_until_post_loss_packet_acknowledged() {
    let _guard = subscribe();
    let recorder = Arc::new(Recorder::default());
    let mut client_transport = TransportConfig::default();
    client_transport.telemetry(Some(recorder.clone() as Arc<dyn telemetry::Sink>));
    let mut server_transport = TransportConfig::default();
    server_transport.telemetry(Some(recorder.clone() as Arc<dyn telemetry::Sink>));
    let mut pair = Pair::new(Default::default(), server_config_with(server_transport));
    let (client_ch, server_ch) = pair.connect_with(client_config_with(client_transport));
    let s = pair.client_streams(client_ch).open(Dir::Uni).unwrap();

    pair.client
        .fates
        .extend([Fate::Deliver, Fate::Deliver, Fate::Deliver, Fate::Drop]);

    const TOTAL: usize = 512 * 1024;
    let mut transfer = Transfer::new(s, TOTAL);
    // Window right after the loss, and the newest packet number sent by then
    let mut recovery = None;
    let mut acked_after_loss = false;
    for _ in 0..100_000 {
        transfer.write(&mut pair, client_ch);
        pair.step();
        let conn = pair.client_conn_mut(client_ch);
        let window = conn.congestion_state().window();
        if let Some((reduced, boundary)) = recovery {
            if !acked_after_loss {
                // Only an ACK for a packet sent after the loss may move the window, and the peer
                // must have received such a packet before acknowledging it
                assert_eq!(window, reduced, "window moved during recovery");
                acked_after_loss =
                    largest_data_packet(&recorder, Side::Server, true) > Some(boundary);
            }
        } else if conn.stats().congestion_events > 0 {
            let boundary = largest_data_packet(&recorder, Side::Client, false).unwrap();
            recovery = Some((window, boundary));
        }
        if transfer.read(&mut pair, server_ch) {
            break;
        }
    }
    assert_eq!(transfer.received, TOTAL);
    let (reduced, _) = recovery.expect("no congestion event");
    assert!(acked_after_loss);
    assert!(pair.client_conn_mut(client_ch).congestion_state().window() > reduced);
}

#[test]
fn every_acknowledged_packet_contributes_rtt_sample() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.latency = Duration::from_millis(10);
    let (client_ch, _) = pair.connect();
    let s = pair.client_streams(client_ch).open(Dir::Uni).unwrap();
    let before = pair.client_conn_mut(client_ch).rtt();

    // Hold an early packet back so a single ACK covers it along with a later one
    assert_eq!(pair.client_send(client_ch, s).write(b"early"), Ok(5));
    pair.drive_client();
    let (_, early) = pair.server.inbound.pop_front().unwrap();
    assert!(pair.server.inbound.is_empty());
    pair.time += Duration::from_millis(30);
    assert_eq!(pair.client_send(client_ch, s).write(b"late"), Ok(4));
    pair.drive_client();
    let at = pair.server.inbound[0].0;
    pair.server.inbound.push_front((at, early));
    pair.drive();

    // Sampling the late packet alone would leave the estimate where it was
    let after = pair.client_conn_mut(client_ch).rtt();
    assert!(
        after > before + Duration::from_millis(2),
        "smoothed RTT {after:?}, was {before:?}"
    );
}

#[test]
fn window_grows_after_flight_fills_it() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let (client_ch, _) = pair.connect();
    let s = pair.client_streams(client_ch).open(Dir::Uni).unwrap();
    let mtu = u64::from(TransportConfig::default().mtu);

    // Small writes, each sent in full, until the window has no room for a full-size packet
    loop {
        let conn = pair.client_conn_mut(client_ch);
        if conn.bytes_in_flight() + mtu > conn.congestion_state().window() {
            break;
        }
        assert_eq!(pair.client_send(client_ch, s).write(&[0x5a; 500]), Ok(500));
        pair.drive_client();
    }
    let window = pair.client_conn_mut(client_ch).congestion_state().window();
    pair.drive();
    assert!(pair.client_conn_mut(client_ch).congestion_state().window() > window);
}

fn initial_datagram(dst_cid: &ConnectionId, src_cid: ConnectionId, size: usize) -> BytesMut {
    let keys = crypto::initial_keys(dst_cid, Side::Client);
    let mut buf = Vec::new();
    let header = Header::Initial {
        dst_cid: *dst_cid,
        src_cid,
        token: Bytes::new(),
        number: PacketNumber::new(0, None),
    };
    let partial = header.encode(&mut buf);
    buf.push(0x01); // PING
    buf.resize(size, 0);
    partial.finish(&mut buf, &*keys.header.local, 0, &*keys.packet.local);
    BytesMut::from(&buf[..])
}

fn read_to_end(stream: &mut RecvStream<'_>) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        match stream.read(usize::MAX) {
            Ok(Some(chunk)) => out.extend_from_slice(&chunk),
            Ok(None) => return out,
            Err(e) => panic!("stream not finished: {e}"),
        }
    }
}

fn drain_events(conn: &mut Connection) -> Vec<StreamEvent> {
    iter::from_fn(|| conn.poll())
        .filter_map(|e| match e {
            Event::Stream(e) => Some(e),
            _ => None,
        })
        .collect()
}

fn state_changes(recorder: &Recorder) -> Vec<(ConnectionState, ConnectionState)> {
    recorder
        .events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|(_, e)| match *e {
            TelemetryEvent::StateChanged { from, to } => Some((from, to)),
            _ => None,
        })
        .collect()
}

/// Largest 1-RTT packet number the `side` connection sent, or received if `received` is set
fn largest_data_packet(recorder: &Recorder, side: Side, received: bool) -> Option<u64> {
    let events = recorder.events.lock().unwrap();
    let cid = events.iter().find_map(|(cid, e)| match *e {
        TelemetryEvent::ConnectionStarted { side: s, .. } if s == side => Some(*cid),
        _ => None,
    })?;
    events
        .iter()
        .filter(|(c, _)| *c == cid)
        .filter_map(|(_, e)| match *e {
            TelemetryEvent::PacketSent {
                space: SpaceId::Data,
                number,
                ..
            } if !received => Some(number),
            TelemetryEvent::PacketReceived {
                space: SpaceId::Data,
                number,
                ..
            } if received => Some(number),
            _ => None,
        })
        .max()
}

/// A one-directional bulk transfer on a client-initiated stream
struct Transfer {
    stream: StreamId,
    total: usize,
    sent: usize,
    received: usize,
    finished: bool,
    accepted: bool,
    chunk: Vec<u8>,
}

impl Transfer {
    fn new(stream: StreamId, total: usize) -> Self {
        Self {
            stream,
            total,
            sent: 0,
            received: 0,
            finished: false,
            accepted: false,
            chunk: vec![0x5a; 64 * 1024],
        }
    }

    fn write(&mut self, pair: &mut Pair, client_ch: ConnectionHandle) {
        while self.sent < self.total {
            let len = self.chunk.len().min(self.total - self.sent);
            match pair.client_send(client_ch, self.stream).write(&self.chunk[..len]) {
                Ok(n) => self.sent += n,
                Err(WriteError::Blocked) => return,
                Err(e) => panic!("write failed: {e}"),
            }
        }
        if !self.finished {
            pair.client_send(client_ch, self.stream).finish().unwrap();
            self.finished = true;
        }
    }

    /// Returns whether the whole stream has been read
    fn read(&mut self, pair: &mut Pair, server_ch: ConnectionHandle) -> bool {
        if !self.accepted {
            match pair.server_streams(server_ch).accept(self.stream.dir()) {
                Some(id) => {
                    assert_eq!(id, self.stream);
                    self.accepted = true;
                }
                None => return false,
            }
        }
        loop {
            match pair.server_recv(server_ch, self.stream).read(usize::MAX) {
                Ok(Some(chunk)) => {
                    assert!(chunk.iter().all(|&b| b == 0x5a));
                    self.received += chunk.len();
                }
                Ok(None) => return true,
                Err(ReadError::Blocked) => return false,
                Err(e) => panic!("read failed: {e}"),
            }
        }
    }
}
