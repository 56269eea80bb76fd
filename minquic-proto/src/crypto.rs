//! Traits and implementations for the handshake and packet protection
//!
//! The connection talks to the handshake through [`Session`], which has exactly three protocol
//! operations: consume handshake bytes received at an encryption level
//! ([`Session::read_handshake`]), produce handshake bytes to send ([`Session::write_handshake`]),
//! and yield keys for the next encryption level once they are derived ([`Session::next_keys`]).
//! Everything else about the handshake is opaque to the transport.

use bytes::BytesMut;
use thiserror::Error;

use crate::{packet::SpaceId, transport_parameters::TransportParameters, TransportError};

/// Pre-shared-key handshake
pub mod psk;
/// ring-backed packet and header protection
pub(crate) mod ring_like;

pub use ring_like::initial_keys;

/// A cryptographic session, driving the handshake for one connection
pub trait Session: Send + 'static {
    /// Consume handshake bytes received in CRYPTO frames at `space`
    ///
    /// Bytes are delivered contiguously and in order; the session buffers incomplete messages.
    fn read_handshake(&mut self, space: SpaceId, buf: &[u8]) -> Result<(), TransportError>;

    /// Produce the next handshake bytes to send, with the space they must be sent in
    fn write_handshake(&mut self) -> Option<(SpaceId, Vec<u8>)>;

    /// Keys for the next encryption level, once derived
    fn next_keys(&mut self) -> Option<(SpaceId, Keys)>;

    /// Whether the handshake is still in progress
    fn is_handshaking(&self) -> bool;

    /// The peer's transport parameters, once received
    fn transport_parameters(&self) -> Option<&TransportParameters>;
}

/// Client-side configuration for the crypto protocol
pub trait ClientConfig: Send + Sync {
    /// Start a client session
    fn start_session(&self, params: &TransportParameters) -> Box<dyn Session>;
}

/// Server-side configuration for the crypto protocol
pub trait ServerConfig: Send + Sync {
    /// Start a server session
    fn start_session(&self, params: &TransportParameters) -> Box<dyn Session>;
}

/// Keys used to protect packet payloads
pub trait PacketKey: Send + Sync {
    /// Encrypt the packet payload in place
    ///
    /// `buf` holds the header, the payload, and `tag_len` trailing bytes reserved for the tag.
    fn encrypt(&self, packet: u64, buf: &mut [u8], header_len: usize);
    /// Decrypt the packet payload in place, truncating the tag
    fn decrypt(&self, packet: u64, header: &[u8], payload: &mut BytesMut) -> Result<(), CryptoError>;
    /// The length of the AEAD tag appended to packets on encryption
    fn tag_len(&self) -> usize;
}

/// Keys used to protect packet headers
pub trait HeaderKey: Send + Sync {
    /// Remove header protection; `pn_offset` locates the packet number
    fn decrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// Apply header protection
    fn encrypt(&self, pn_offset: usize, packet: &mut [u8]);
    /// Number of bytes of ciphertext sampled after the packet number
    fn sample_size(&self) -> usize;
}

/// A pair of keys for bidirectional communication
pub struct KeyPair<T> {
    /// Key for encrypting data
    pub local: T,
    /// Key for decrypting data
    pub remote: T,
}

/// Complete set of keys for one encryption level
pub struct Keys {
    /// Header protection keys
    pub header: KeyPair<Box<dyn HeaderKey>>,
    /// Packet protection keys
    pub packet: KeyPair<Box<dyn PacketKey>>,
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys").finish_non_exhaustive()
    }
}

/// Packet authentication failed
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("packet failed authentication")]
pub struct CryptoError;
