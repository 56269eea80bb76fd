use std::{
    cmp,
    collections::VecDeque,
    io::{self, Write},
    net::{Ipv6Addr, SocketAddr},
    ops::RangeFrom,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tracing::{info_span, trace};

use super::*;

pub(super) const PSK: &[u8] = b"correct horse battery staple";

pub(super) struct Pair {
    pub(super) server: TestEndpoint,
    pub(super) client: TestEndpoint,
    pub(super) time: Instant,
    /// One-way
    pub(super) latency: Duration,
}

impl Pair {
    pub(super) fn new(endpoint_config: Arc<EndpointConfig>, server_config: ServerConfig) -> Self {
        let server = Endpoint::new(endpoint_config.clone(), Some(Arc::new(server_config)));
        let client = Endpoint::new(endpoint_config, None);

        let server_addr = SocketAddr::new(
            Ipv6Addr::LOCALHOST.into(),
            SERVER_PORTS.lock().unwrap().next().unwrap(),
        );
        let client_addr = SocketAddr::new(
            Ipv6Addr::LOCALHOST.into(),
            CLIENT_PORTS.lock().unwrap().next().unwrap(),
        );
        Self {
            server: TestEndpoint::new(Side::Server, server, server_addr),
            client: TestEndpoint::new(Side::Client, client, client_addr),
            time: Instant::now(),
            latency: Duration::new(0, 0),
        }
    }

    /// Returns whether the connection is not idle
    pub(super) fn step(&mut self) -> bool {
        self.drive_client();
        self.drive_server();
        if self.client.is_idle() && self.server.is_idle() {
            return false;
        }

        let client_t = self.client.next_wakeup();
        let server_t = self.server.next_wakeup();
        match min_opt(client_t, server_t) {
            Some(t) => {
                if t > self.time {
                    self.time = t;
                    trace!("advancing to {:?}", self.time);
                }
                true
            }
            None => false,
        }
    }

    /// Advance time until both connections are idle
    pub(super) fn drive(&mut self) {
        while self.step() {}
    }

    /// Advance time until `deadline`, even if nothing else happens before
    pub(super) fn drive_until(&mut self, deadline: Instant) {
        loop {
            self.drive_client();
            self.drive_server();
            let next = min_opt(self.client.next_wakeup(), self.server.next_wakeup());
            match next {
                Some(t) if t <= deadline => self.time = cmp::max(self.time, t),
                _ => break,
            }
        }
        self.time = cmp::max(self.time, deadline);
        self.drive_client();
        self.drive_server();
    }

    pub(super) fn drive_client(&mut self) {
        let _guard = info_span!("client").entered();
        self.client.drive(self.time, self.server.addr);
        for x in self.client.outbound.drain(..) {
            deliver(&mut self.client.fates, &mut self.server.inbound, self.time + self.latency, x);
        }
    }

    pub(super) fn drive_server(&mut self) {
        let _guard = info_span!("server").entered();
        self.server.drive(self.time, self.client.addr);
        for x in self.server.outbound.drain(..) {
            deliver(&mut self.server.fates, &mut self.client.inbound, self.time + self.latency, x);
        }
    }

    pub(super) fn connect(&mut self) -> (ConnectionHandle, ConnectionHandle) {
        self.connect_with(client_config())
    }

    pub(super) fn connect_with(
        &mut self,
        config: ClientConfig,
    ) -> (ConnectionHandle, ConnectionHandle) {
        let client_ch = self.begin_connect(config);
        self.drive();
        let server_ch = self.server.assert_accept();
        assert_matches!(self.client_conn_mut(client_ch).poll(), Some(Event::Connected));
        assert_matches!(self.server_conn_mut(server_ch).poll(), Some(Event::Connected));
        (client_ch, server_ch)
    }

    pub(super) fn begin_connect(&mut self, config: ClientConfig) -> ConnectionHandle {
        let (client_ch, client_conn) = self
            .client
            .endpoint
            .connect(self.time, config, self.server.addr)
            .unwrap();
        self.client.connections.insert(client_ch, client_conn);
        client_ch
    }

    pub(super) fn client_conn_mut(&mut self, ch: ConnectionHandle) -> &mut Connection {
        self.client.connections.get_mut(&ch).unwrap()
    }

    pub(super) fn client_streams(&mut self, ch: ConnectionHandle) -> Streams<'_> {
        self.client_conn_mut(ch).streams()
    }

    pub(super) fn client_send(&mut self, ch: ConnectionHandle, s: StreamId) -> SendStream<'_> {
        self.client_conn_mut(ch).send_stream(s)
    }

    pub(super) fn client_recv(&mut self, ch: ConnectionHandle, s: StreamId) -> RecvStream<'_> {
        self.client_conn_mut(ch).recv_stream(s)
    }

    pub(super) fn server_conn_mut(&mut self, ch: ConnectionHandle) -> &mut Connection {
        self.server.connections.get_mut(&ch).unwrap()
    }

    pub(super) fn server_streams(&mut self, ch: ConnectionHandle) -> Streams<'_> {
        self.server_conn_mut(ch).streams()
    }

    pub(super) fn server_send(&mut self, ch: ConnectionHandle, s: StreamId) -> SendStream<'_> {
        self.server_conn_mut(ch).send_stream(s)
    }

    pub(super) fn server_recv(&mut self, ch: ConnectionHandle, s: StreamId) -> RecvStream<'_> {
        self.server_conn_mut(ch).recv_stream(s)
    }
}

impl Default for Pair {
    fn default() -> Self {
        Self::new(Default::default(), server_config())
    }
}

/// What the simulated network does with the next datagram an endpoint sends
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum Fate {
    Deliver,
    Drop,
    Duplicate,
}

fn deliver(
    fates: &mut VecDeque<Fate>,
    inbound: &mut VecDeque<(Instant, Box<[u8]>)>,
    at: Instant,
    x: Transmit,
) {
    match fates.pop_front().unwrap_or(Fate::Deliver) {
        Fate::Deliver => inbound.push_back((at, x.contents)),
        Fate::Drop => trace!(len = x.contents.len(), "dropping datagram"),
        Fate::Duplicate => {
            inbound.push_back((at, x.contents.clone()));
            inbound.push_back((at, x.contents));
        }
    }
}

pub(super) struct TestEndpoint {
    side: Side,
    pub(super) endpoint: Endpoint,
    pub(super) addr: SocketAddr,
    pub(super) outbound: VecDeque<Transmit>,
    pub(super) inbound: VecDeque<(Instant, Box<[u8]>)>,
    /// Applied in order to outgoing datagrams; delivered normally once exhausted
    pub(super) fates: VecDeque<Fate>,
    accepted: Option<ConnectionHandle>,
    pub(super) connections: FxHashMap<ConnectionHandle, Connection>,
    conn_events: FxHashMap<ConnectionHandle, VecDeque<ConnectionEvent>>,
}

impl TestEndpoint {
    fn new(side: Side, endpoint: Endpoint, addr: SocketAddr) -> Self {
        Self {
            side,
            endpoint,
            addr,
            outbound: VecDeque::new(),
            inbound: VecDeque::new(),
            fates: VecDeque::new(),
            accepted: None,
            connections: FxHashMap::default(),
            conn_events: FxHashMap::default(),
        }
    }

    pub(super) fn drive(&mut self, now: Instant, remote: SocketAddr) {
        while self.inbound.front().map_or(false, |x| x.0 <= now) {
            let (_, packet) = self.inbound.pop_front().unwrap();
            if let Some((ch, event)) = self
                .endpoint
                .handle(now, remote, BytesMut::from(&packet[..]))
            {
                match event {
                    DatagramEvent::NewConnection(conn) => {
                        self.connections.insert(ch, conn);
                        self.accepted = Some(ch);
                    }
                    DatagramEvent::ConnectionEvent(event) => {
                        self.conn_events.entry(ch).or_default().push_back(event);
                    }
                }
            }
        }

        let mut endpoint_events: Vec<(ConnectionHandle, EndpointEvent)> = vec![];
        for (ch, conn) in self.connections.iter_mut() {
            if let Some(events) = self.conn_events.remove(ch) {
                for event in events {
                    conn.handle_event(event);
                }
            }

            if conn.poll_timeout().map_or(false, |t| t <= now) {
                trace!(side = ?self.side, "timeout");
                conn.handle_timeout(now);
            }

            while let Some(event) = conn.poll_endpoint_events() {
                endpoint_events.push((*ch, event));
            }

            while let Some(x) = conn.poll_transmit(now) {
                self.outbound.push_back(x);
            }
        }

        for (ch, event) in endpoint_events {
            self.endpoint.handle_event(ch, event);
        }
    }

    pub(super) fn next_wakeup(&mut self) -> Option<Instant> {
        let next_timer = self
            .connections
            .values_mut()
            .filter_map(|conn| conn.poll_timeout())
            .min();
        let next_inbound = self.inbound.front().map(|x| x.0);
        min_opt(next_timer, next_inbound)
    }

    fn is_idle(&self) -> bool {
        self.inbound.is_empty() && self.connections.values().all(|conn| conn.is_idle())
    }

    pub(super) fn assert_accept(&mut self) -> ConnectionHandle {
        self.accepted.take().expect("server didn't connect")
    }
}

/// Records every telemetry event, tagged with the connection it belongs to
#[derive(Debug, Default)]
pub(super) struct Recorder {
    pub(super) events: Mutex<Vec<(ConnectionId, telemetry::Event)>>,
}

impl telemetry::Sink for Recorder {
    fn event(&self, _now: Instant, cid: ConnectionId, event: telemetry::Event) {
        self.events.lock().unwrap().push((cid, event));
    }
}

pub(super) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            std::str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}

pub(super) fn server_config() -> ServerConfig {
    ServerConfig::with_psk(PSK)
}

pub(super) fn server_config_with(transport: TransportConfig) -> ServerConfig {
    let mut config = server_config();
    config.transport_config(Arc::new(transport));
    config
}

pub(super) fn client_config() -> ClientConfig {
    ClientConfig::with_psk(PSK)
}

pub(super) fn client_config_with(transport: TransportConfig) -> ClientConfig {
    let mut config = client_config();
    config.transport_config(Arc::new(transport));
    config
}

pub(super) fn min_opt<T: Ord>(x: Option<T>, y: Option<T>) -> Option<T> {
    match (x, y) {
        (Some(x), Some(y)) => Some(cmp::min(x, y)),
        (Some(x), _) => Some(x),
        (_, Some(y)) => Some(y),
        _ => None,
    }
}

static SERVER_PORTS: Mutex<RangeFrom<u16>> = Mutex::new(4433..);
static CLIENT_PORTS: Mutex<RangeFrom<u16>> = Mutex::new(44433..);
