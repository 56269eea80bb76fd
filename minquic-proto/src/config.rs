use std::{fmt, num::TryFromIntError, sync::Arc, time::Duration};

use thiserror::Error;

use crate::{
    congestion, crypto, telemetry, VarInt, VarIntBoundsExceeded, INITIAL_MTU, MAX_CID_SIZE,
};

/// Parameters governing the core QUIC state machine
///
/// Default values should be suitable for most internet applications. Applications protocols which
/// forbid remotely-initiated streams should set `max_concurrent_bidi_streams` and
/// `max_concurrent_uni_streams` to zero.
///
/// Data window sizes can be tuned for a particular expected round trip time, link capacity, and
/// memory availability. The default configuration is tuned for a 100Mbps link with a 100ms round
/// trip time.
pub struct TransportConfig {
    pub(crate) max_concurrent_bidi_streams: VarInt,
    pub(crate) max_concurrent_uni_streams: VarInt,
    pub(crate) max_idle_timeout: Option<VarInt>,
    pub(crate) handshake_timeout: Duration,
    pub(crate) stream_receive_window: VarInt,
    pub(crate) receive_window: VarInt,
    pub(crate) send_window: u64,

    pub(crate) packet_threshold: u32,
    pub(crate) initial_rtt: Duration,
    pub(crate) max_ack_delay: Duration,
    pub(crate) persistent_congestion_threshold: u32,
    pub(crate) mtu: u16,

    pub(crate) congestion_controller_factory: Arc<dyn congestion::ControllerFactory + Send + Sync>,
    pub(crate) telemetry: Option<Arc<dyn telemetry::Sink>>,
}

impl TransportConfig {
    /// Maximum number of incoming bidirectional streams that may be open concurrently
    ///
    /// Must be nonzero for the peer to open any bidirectional streams.
    pub fn max_concurrent_bidi_streams(&mut self, value: VarInt) -> &mut Self {
        self.max_concurrent_bidi_streams = value;
        self
    }

    /// Variant of `max_concurrent_bidi_streams` affecting unidirectional streams
    pub fn max_concurrent_uni_streams(&mut self, value: VarInt) -> &mut Self {
        self.max_concurrent_uni_streams = value;
        self
    }

    /// Maximum duration of inactivity to accept before timing out the connection
    ///
    /// The true idle timeout is the minimum of this and the peer's own max idle timeout. `None`
    /// represents an infinite timeout.
    pub fn max_idle_timeout(&mut self, value: Option<IdleTimeout>) -> &mut Self {
        self.max_idle_timeout = value.map(|t| t.0);
        self
    }

    /// Time allowed for the handshake to complete before the connection is abandoned
    pub fn handshake_timeout(&mut self, value: Duration) -> &mut Self {
        self.handshake_timeout = value;
        self
    }

    /// Maximum number of bytes the peer may transmit without acknowledgement on any one stream
    /// before becoming blocked.
    ///
    /// This should be set to at least the expected connection latency multiplied by the maximum
    /// desired throughput.
    pub fn stream_receive_window(&mut self, value: VarInt) -> &mut Self {
        self.stream_receive_window = value;
        self
    }

    /// Maximum number of bytes the peer may transmit across all streams of a connection before
    /// becoming blocked.
    pub fn receive_window(&mut self, value: VarInt) -> &mut Self {
        self.receive_window = value;
        self
    }

    /// Maximum number of bytes to transmit to a peer without acknowledgment
    ///
    /// Writes beyond this are refused with [`WriteError::Blocked`](crate::WriteError::Blocked)
    /// until data is acknowledged.
    pub fn send_window(&mut self, value: u64) -> &mut Self {
        self.send_window = value;
        self
    }

    /// Maximum reordering in packet number space before FACK style loss detection considers a
    /// packet lost. Should not be less than 3, per RFC5681.
    pub fn packet_threshold(&mut self, value: u32) -> &mut Self {
        self.packet_threshold = value;
        self
    }

    /// The RTT used before an RTT sample is taken
    pub fn initial_rtt(&mut self, value: Duration) -> &mut Self {
        self.initial_rtt = value;
        self
    }

    /// Maximum delay we advertise for our acknowledgements
    ///
    /// Acknowledgements are sent at the next transmission opportunity, so this only informs the
    /// peer's probe timeout.
    pub fn max_ack_delay(&mut self, value: Duration) -> Result<&mut Self, ConfigError> {
        if value.as_millis() >= 1 << 14 {
            return Err(ConfigError::OutOfBounds);
        }
        self.max_ack_delay = value;
        Ok(self)
    }

    /// Number of consecutive PTOs after which network is considered to be experiencing persistent
    /// congestion.
    pub fn persistent_congestion_threshold(&mut self, value: u32) -> &mut Self {
        self.persistent_congestion_threshold = value;
        self
    }

    /// Size of the datagrams we send, and the congestion controller's maximum segment size
    ///
    /// Must be at least 1200, the smallest size every QUIC path supports.
    pub fn mtu(&mut self, value: u16) -> Result<&mut Self, ConfigError> {
        if value < INITIAL_MTU {
            return Err(ConfigError::OutOfBounds);
        }
        self.mtu = value;
        Ok(self)
    }

    /// How to construct new `congestion::Controller`s
    ///
    /// Typically the refcounted configuration of a `congestion::Controller`,
    /// e.g. a `congestion::NewRenoConfig`.
    ///
    /// # Example
    /// ```
    /// # use minquic_proto::*; use std::sync::Arc;
    /// let mut config = TransportConfig::default();
    /// config.congestion_controller_factory(Arc::new(Arc::new(congestion::NewRenoConfig::default())));
    /// ```
    pub fn congestion_controller_factory(
        &mut self,
        factory: Arc<dyn congestion::ControllerFactory + Send + Sync + 'static>,
    ) -> &mut Self {
        self.congestion_controller_factory = factory;
        self
    }

    /// Where to deliver [`telemetry::Event`]s, if anywhere
    pub fn telemetry(&mut self, sink: Option<Arc<dyn telemetry::Sink>>) -> &mut Self {
        self.telemetry = sink;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        const EXPECTED_RTT: u32 = 100; // ms
        const MAX_STREAM_BANDWIDTH: u32 = 12500 * 1000; // bytes/s
        // Window size needed to avoid pipeline stalls
        const STREAM_RWND: u32 = MAX_STREAM_BANDWIDTH / 1000 * EXPECTED_RTT;

        Self {
            max_concurrent_bidi_streams: 100u32.into(),
            max_concurrent_uni_streams: 100u32.into(),
            max_idle_timeout: Some(VarInt(10_000)),
            handshake_timeout: Duration::from_secs(10),
            stream_receive_window: STREAM_RWND.into(),
            receive_window: (8 * STREAM_RWND).into(),
            send_window: (8 * STREAM_RWND).into(),

            packet_threshold: 3,
            initial_rtt: Duration::from_millis(333),
            max_ack_delay: Duration::from_millis(25),
            persistent_congestion_threshold: 3,
            mtu: INITIAL_MTU,

            congestion_controller_factory: Arc::new(Arc::new(
                congestion::NewRenoConfig::default(),
            )),
            telemetry: None,
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("TransportConfig")
            .field(
                "max_concurrent_bidi_streams",
                &self.max_concurrent_bidi_streams,
            )
            .field(
                "max_concurrent_uni_streams",
                &self.max_concurrent_uni_streams,
            )
            .field("max_idle_timeout", &self.max_idle_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("stream_receive_window", &self.stream_receive_window)
            .field("receive_window", &self.receive_window)
            .field("send_window", &self.send_window)
            .field("packet_threshold", &self.packet_threshold)
            .field("initial_rtt", &self.initial_rtt)
            .field("max_ack_delay", &self.max_ack_delay)
            .field(
                "persistent_congestion_threshold",
                &self.persistent_congestion_threshold,
            )
            .field("mtu", &self.mtu)
            .field("congestion_controller_factory", &"[ opaque ]")
            .field("telemetry", &self.telemetry.as_ref().map(|_| "[ opaque ]"))
            .finish()
    }
}

/// Global configuration for the endpoint, affecting all connections
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub(crate) local_cid_len: usize,
    pub(crate) max_udp_payload_size: VarInt,
    pub(crate) max_concurrent_connections: usize,
}

impl EndpointConfig {
    /// Length of the connection IDs we issue
    ///
    /// Short headers carry no length, so every ID issued by one endpoint has this length. Clients
    /// always choose at least 8 bytes for the destination ID of their first Initial packet.
    pub fn local_cid_len(&mut self, value: usize) -> Result<&mut Self, ConfigError> {
        if value > MAX_CID_SIZE {
            return Err(ConfigError::OutOfBounds);
        }
        self.local_cid_len = value;
        Ok(self)
    }

    /// Maximum UDP payload size accepted from peers, excluding UDP and IP overhead
    ///
    /// Must be greater or equal than 1200.
    pub fn max_udp_payload_size(&mut self, value: u16) -> Result<&mut Self, ConfigError> {
        if !(1200..=65_527).contains(&value) {
            return Err(ConfigError::OutOfBounds);
        }
        self.max_udp_payload_size = value.into();
        Ok(self)
    }

    /// Maximum number of simultaneous connections; further Initial packets are dropped
    pub fn max_concurrent_connections(&mut self, value: usize) -> &mut Self {
        self.max_concurrent_connections = value;
        self
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            local_cid_len: 8,
            max_udp_payload_size: 1472u32.into(),
            max_concurrent_connections: 100_000,
        }
    }
}

/// Parameters governing incoming connections
#[derive(Clone)]
pub struct ServerConfig {
    /// Transport configuration to use for incoming connections
    pub transport: Arc<TransportConfig>,

    /// Handshake configuration used for incoming connections
    pub crypto: Arc<dyn crypto::ServerConfig>,
}

impl ServerConfig {
    /// Create a default config with a particular handshake config
    pub fn new(crypto: Arc<dyn crypto::ServerConfig>) -> Self {
        Self {
            transport: Arc::new(TransportConfig::default()),
            crypto,
        }
    }

    /// Create a server config authenticating clients by a pre-shared key
    pub fn with_psk(psk: &[u8]) -> Self {
        Self::new(Arc::new(crypto::psk::PskConfig::new(psk)))
    }

    /// Set a custom [`TransportConfig`]
    pub fn transport_config(&mut self, transport: Arc<TransportConfig>) -> &mut Self {
        self.transport = transport;
        self
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ServerConfig")
            .field("transport", &self.transport)
            .field("crypto", &"ServerConfig { elided }")
            .finish()
    }
}

/// Configuration for outgoing connections
///
/// Default values should be suitable for most internet applications.
#[derive(Clone)]
pub struct ClientConfig {
    /// Transport configuration to use
    pub(crate) transport: Arc<TransportConfig>,

    /// Cryptographic configuration to use
    pub(crate) crypto: Arc<dyn crypto::ClientConfig>,
}

impl ClientConfig {
    /// Create a default config with a particular cryptographic config
    pub fn new(crypto: Arc<dyn crypto::ClientConfig>) -> Self {
        Self {
            transport: Arc::new(TransportConfig::default()),
            crypto,
        }
    }

    /// Create a client config authenticating the server by a pre-shared key
    pub fn with_psk(psk: &[u8]) -> Self {
        Self::new(Arc::new(crypto::psk::PskConfig::new(psk)))
    }

    /// Set a custom [`TransportConfig`]
    pub fn transport_config(&mut self, transport: Arc<TransportConfig>) -> &mut Self {
        self.transport = transport;
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ClientConfig")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

/// Errors in the configuration of an endpoint
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Value exceeds supported bounds
    #[error("value exceeds supported bounds")]
    OutOfBounds,
}

impl From<TryFromIntError> for ConfigError {
    fn from(_: TryFromIntError) -> Self {
        Self::OutOfBounds
    }
}

impl From<VarIntBoundsExceeded> for ConfigError {
    fn from(_: VarIntBoundsExceeded) -> Self {
        Self::OutOfBounds
    }
}

/// Maximum duration of inactivity to accept before timing out the connection.
///
/// This wraps an underlying [`VarInt`], representing the duration in milliseconds. Values can be
/// constructed by converting directly from `VarInt`, or using `TryFrom<Duration>`.
#[derive(Default, Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct IdleTimeout(VarInt);

impl From<VarInt> for IdleTimeout {
    fn from(inner: VarInt) -> Self {
        Self(inner)
    }
}

impl std::convert::TryFrom<Duration> for IdleTimeout {
    type Error = VarIntBoundsExceeded;

    fn try_from(timeout: Duration) -> Result<Self, Self::Error> {
        let millis = u64::try_from(timeout.as_millis()).map_err(|_| VarIntBoundsExceeded)?;
        let inner = VarInt::from_u64(millis)?;
        Ok(Self(inner))
    }
}

impl fmt::Debug for IdleTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
