use std::{
    fmt,
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use bytes::BytesMut;
use rand::{rngs::StdRng, SeedableRng};
use rustc_hash::FxHashMap;
use slab::Slab;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    config::{ClientConfig, EndpointConfig, ServerConfig},
    connection::Connection,
    packet::{DecodeError, PartialDecode},
    shared::{ConnectionEvent, ConnectionEventInner, ConnectionId, EndpointEvent, EndpointEventInner},
    transport_parameters::TransportParameters,
    Side, MAX_CID_SIZE, MIN_INITIAL_SIZE,
};

/// The main entry point to the library
///
/// This object performs no I/O whatsoever. It routes incoming datagrams to the [`Connection`]s it
/// knows about by destination connection ID, creates new server-side connections from valid
/// Initial packets, and forgets connections once they report [`EndpointEvent::drained`].
/// Connections themselves are owned by the caller.
pub struct Endpoint {
    rng: StdRng,
    /// Destination IDs chosen by clients for their first Initial packets
    connection_ids_initial: FxHashMap<ConnectionId, ConnectionHandle>,
    /// Locally issued IDs
    connection_ids: FxHashMap<ConnectionId, ConnectionHandle>,
    connections: Slab<ConnectionMeta>,
    config: Arc<EndpointConfig>,
    server_config: Option<Arc<ServerConfig>>,
}

impl Endpoint {
    /// Create a new endpoint
    ///
    /// An endpoint without a `server_config` only initiates connections.
    pub fn new(config: Arc<EndpointConfig>, server_config: Option<Arc<ServerConfig>>) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            connection_ids_initial: FxHashMap::default(),
            connection_ids: FxHashMap::default(),
            connections: Slab::new(),
            config,
            server_config,
        }
    }

    /// Replace the server configuration, affecting new incoming connections only
    pub fn set_server_config(&mut self, server_config: Option<Arc<ServerConfig>>) {
        self.server_config = server_config;
    }

    fn is_server(&self) -> bool {
        self.server_config.is_some()
    }

    /// Process `EndpointEvent`s emitted from related `Connection`s
    pub fn handle_event(&mut self, ch: ConnectionHandle, event: EndpointEvent) {
        match event.0 {
            EndpointEventInner::Drained => {
                if !self.connections.contains(ch.0) {
                    return;
                }
                let conn = self.connections.remove(ch.0);
                if let Some(init_cid) = conn.init_cid {
                    self.connection_ids_initial.remove(&init_cid);
                }
                self.connection_ids.remove(&conn.loc_cid);
                trace!(id = ch.0, "connection drained");
            }
        }
    }

    /// Process an incoming UDP datagram
    ///
    /// Datagrams that belong to no connection and cannot start one are dropped without a
    /// response.
    pub fn handle(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        data: BytesMut,
    ) -> Option<(ConnectionHandle, DatagramEvent)> {
        let datagram_len = data.len();
        let (first_decode, remaining) = match PartialDecode::new(data, self.config.local_cid_len) {
            Ok(x) => x,
            Err(DecodeError::UnsupportedVersion { version, .. }) => {
                debug!(version, "dropping packet with unsupported version");
                return None;
            }
            Err(e) => {
                trace!("malformed header: {}", e);
                return None;
            }
        };

        //
        // Handle packet on existing connection, if any
        //

        let dst_cid = *first_decode.dst_cid();
        let known_ch = self.connection_ids.get(&dst_cid).or_else(|| {
            if first_decode.is_initial() {
                self.connection_ids_initial.get(&dst_cid)
            } else {
                None
            }
        });
        if let Some(&ch) = known_ch {
            return Some((
                ch,
                DatagramEvent::ConnectionEvent(ConnectionEvent(ConnectionEventInner::Datagram {
                    now,
                    remote,
                    first_decode,
                    remaining,
                })),
            ));
        }

        //
        // Potentially create a new connection
        //

        let Some(server_config) = self.server_config.clone() else {
            debug!(%dst_cid, "packet for unrecognized connection");
            return None;
        };
        if !first_decode.is_initial() {
            debug!(%dst_cid, "ignoring non-initial packet for unknown connection");
            return None;
        }
        if datagram_len < usize::from(MIN_INITIAL_SIZE) {
            debug!(%dst_cid, len = datagram_len, "ignoring short initial");
            return None;
        }
        if dst_cid.len() < 8 {
            debug!(len = dst_cid.len(), "ignoring initial with short destination CID");
            return None;
        }
        if self.connections.len() >= self.config.max_concurrent_connections {
            debug!("refusing connection: too many connections");
            return None;
        }
        let Some(&src_cid) = first_decode.src_cid() else {
            return None;
        };

        let loc_cid = self.new_cid();
        let params = TransportParameters::new(&server_config.transport, &self.config, loc_cid);
        let crypto = server_config.crypto.start_session(&params);
        let mut conn = Connection::new(
            Arc::clone(&self.config),
            Arc::clone(&server_config.transport),
            dst_cid,
            loc_cid,
            src_cid,
            remote,
            crypto,
            now,
            Side::Server,
        );
        let ch = self.insert(loc_cid, Some(dst_cid));

        conn.handle_event(ConnectionEvent(ConnectionEventInner::Datagram {
            now,
            remote,
            first_decode,
            remaining,
        }));
        if conn.stats().packets_received == 0 {
            // Nothing authenticated; forget the attempt without a trace
            debug!(icid = %dst_cid, "dropping unauthenticated connection attempt");
            self.handle_event(ch, EndpointEvent::drained());
            return None;
        }

        trace!(id = ch.0, icid = %dst_cid, "connection incoming");
        Some((ch, DatagramEvent::NewConnection(conn)))
    }

    /// Initiate a connection
    pub fn connect(
        &mut self,
        now: Instant,
        config: ClientConfig,
        remote: SocketAddr,
    ) -> Result<(ConnectionHandle, Connection), ConnectError> {
        if remote.port() == 0 || remote.ip().is_unspecified() {
            return Err(ConnectError::InvalidRemoteAddress(remote));
        }
        if self.connections.len() >= self.config.max_concurrent_connections {
            return Err(ConnectError::TooManyConnections);
        }
        let rem_cid = ConnectionId::random(&mut self.rng, MAX_CID_SIZE);
        let loc_cid = self.new_cid();
        trace!(initial_dcid = %rem_cid, "connecting");

        let params = TransportParameters::new(&config.transport, &self.config, loc_cid);
        let crypto = config.crypto.start_session(&params);
        let conn = Connection::new(
            Arc::clone(&self.config),
            config.transport,
            rem_cid,
            loc_cid,
            rem_cid,
            remote,
            crypto,
            now,
            Side::Client,
        );
        let ch = self.insert(loc_cid, None);
        Ok((ch, conn))
    }

    fn insert(&mut self, loc_cid: ConnectionId, init_cid: Option<ConnectionId>) -> ConnectionHandle {
        let ch = ConnectionHandle(self.connections.insert(ConnectionMeta { init_cid, loc_cid }));
        self.connection_ids.insert(loc_cid, ch);
        if let Some(init_cid) = init_cid {
            self.connection_ids_initial.insert(init_cid, ch);
        }
        ch
    }

    fn new_cid(&mut self) -> ConnectionId {
        loop {
            let cid = ConnectionId::random(&mut self.rng, self.config.local_cid_len);
            if !self.connection_ids.contains_key(&cid) {
                break cid;
            }
        }
    }

    /// Access the configuration used by this endpoint
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Number of connections that have not drained yet
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub(crate) fn known_cids(&self) -> usize {
        self.connection_ids.len() + self.connection_ids_initial.len()
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Endpoint")
            .field("connections", &self.connections.len())
            .field("config", &self.config)
            .field("server", &self.is_server())
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct ConnectionMeta {
    init_cid: Option<ConnectionId>,
    loc_cid: ConnectionId,
}

/// Internal identifier for a `Connection` currently associated with an endpoint
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

impl From<ConnectionHandle> for usize {
    fn from(x: ConnectionHandle) -> Self {
        x.0
    }
}

/// Event resulting from processing a single datagram
#[allow(clippy::large_enum_variant)]
pub enum DatagramEvent {
    /// The datagram is redirected to its `Connection`
    ConnectionEvent(ConnectionEvent),
    /// The datagram has resulted in starting a new `Connection`
    NewConnection(Connection),
}

impl fmt::Debug for DatagramEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionEvent(event) => f.debug_tuple("ConnectionEvent").field(event).finish(),
            Self::NewConnection(conn) => f.debug_tuple("NewConnection").field(conn).finish(),
        }
    }
}

/// Errors in the parameters being used to create a new connection
///
/// These arise before any I/O has been performed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The number of active connections on the local endpoint is at the limit
    ///
    /// Try a larger [`EndpointConfig::max_concurrent_connections`].
    #[error("too many connections")]
    TooManyConnections,
    /// The remote [`SocketAddr`] supplied was malformed
    ///
    /// Examples include attempting to connect to port 0, or using an inappropriate address family.
    #[error("invalid remote address: {0}")]
    InvalidRemoteAddress(SocketAddr),
}
