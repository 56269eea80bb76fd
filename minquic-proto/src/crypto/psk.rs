//! A two-flight handshake authenticated by a pre-shared key
//!
//! The client sends a hello carrying a fresh random and its transport parameters in the Initial
//! space. The server answers with its own random, then, under Handshake keys, its transport
//! parameters and a finished MAC over the transcript. The client verifies that MAC and returns
//! its own. Handshake secrets are extracted from the PSK with the transcript hash after both
//! hellos as salt, so both sides must hold the same key to read anything past the server hello.
//!
//! Every message is framed as a one-byte type and a two-byte big-endian body length.

use std::collections::VecDeque;

use bytes::{Buf, BufMut};
use rand::RngCore;
use ring::{digest, hkdf, hmac};
use tracing::trace;

use super::{
    ring_like::{expand_label, keys_from_secrets},
    ClientConfig, Keys, ServerConfig, Session,
};
use crate::{
    packet::SpaceId, transport_parameters::TransportParameters, Side, TransportError,
};

const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;
const ENCRYPTED_PARAMETERS: u8 = 8;
const FINISHED: u8 = 20;

const RANDOM_LEN: usize = 32;
const SECRET_LEN: usize = 32;
const HEADER_LEN: usize = 3;

/// Handshake configuration holding a pre-shared key
///
/// The same value serves as [`ClientConfig`] and [`ServerConfig`].
pub struct PskConfig {
    psk: Vec<u8>,
}

impl PskConfig {
    /// Construct a configuration from the shared key
    pub fn new(psk: &[u8]) -> Self {
        Self { psk: psk.to_vec() }
    }
}

impl ClientConfig for PskConfig {
    fn start_session(&self, params: &TransportParameters) -> Box<dyn Session> {
        let mut session = PskSession::new(Side::Client, &self.psk, *params);
        let mut random = [0; RANDOM_LEN];
        rand::thread_rng().fill_bytes(&mut random);
        let mut body = random.to_vec();
        params.write(&mut body);
        session.send(SpaceId::Initial, CLIENT_HELLO, &body);
        session.state = State::AwaitServerHello;
        Box::new(session)
    }
}

impl ServerConfig for PskConfig {
    fn start_session(&self, params: &TransportParameters) -> Box<dyn Session> {
        Box::new(PskSession::new(Side::Server, &self.psk, *params))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    AwaitClientHello,
    AwaitServerHello,
    AwaitParameters,
    AwaitServerFinished,
    AwaitClientFinished,
    Complete,
}

/// Handshake state of one connection
pub struct PskSession {
    side: Side,
    psk: Vec<u8>,
    state: State,
    local_params: TransportParameters,
    peer_params: Option<TransportParameters>,
    transcript: digest::Context,
    /// Partial messages, per space
    incoming: [Vec<u8>; 3],
    outgoing: VecDeque<(SpaceId, Vec<u8>)>,
    keys: VecDeque<(SpaceId, Keys)>,
    secrets: Option<Secrets>,
}

struct Secrets {
    handshake: hkdf::Prk,
    client: Vec<u8>,
    server: Vec<u8>,
}

impl PskSession {
    fn new(side: Side, psk: &[u8], local_params: TransportParameters) -> Self {
        Self {
            side,
            psk: psk.to_vec(),
            state: State::AwaitClientHello,
            local_params,
            peer_params: None,
            transcript: digest::Context::new(&digest::SHA256),
            incoming: Default::default(),
            outgoing: VecDeque::new(),
            keys: VecDeque::new(),
            secrets: None,
        }
    }

    fn send(&mut self, space: SpaceId, ty: u8, body: &[u8]) {
        let mut msg = Vec::with_capacity(HEADER_LEN + body.len());
        msg.put_u8(ty);
        msg.put_u16(body.len() as u16);
        msg.put_slice(body);
        self.transcript.update(&msg);
        trace!(%space, ty, len = body.len(), "handshake message out");
        match self.outgoing.back_mut() {
            Some((last, buf)) if *last == space => buf.extend_from_slice(&msg),
            _ => self.outgoing.push_back((space, msg)),
        }
    }

    fn transcript_hash(&self) -> digest::Digest {
        self.transcript.clone().finish()
    }

    /// Derive the Handshake secrets once both hellos are in the transcript
    fn derive_handshake(&mut self) {
        let hash = self.transcript_hash();
        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, hash.as_ref()).extract(&self.psk);
        let client = expand_label(&prk, b"c hs traffic", hash.as_ref(), SECRET_LEN);
        let server = expand_label(&prk, b"s hs traffic", hash.as_ref(), SECRET_LEN);
        self.keys.push_back((
            SpaceId::Handshake,
            keys_from_secrets(self.side, &client, &server),
        ));
        self.secrets = Some(Secrets {
            handshake: prk,
            client,
            server,
        });
    }

    /// Derive the 1-RTT secrets once the server's finished message is in the transcript
    fn derive_data(&mut self) {
        let hash = self.transcript_hash();
        let keys = match self.secrets {
            Some(ref s) => {
                let client = expand_label(&s.handshake, b"c ap traffic", hash.as_ref(), SECRET_LEN);
                let server = expand_label(&s.handshake, b"s ap traffic", hash.as_ref(), SECRET_LEN);
                keys_from_secrets(self.side, &client, &server)
            }
            None => return,
        };
        self.keys.push_back((SpaceId::Data, keys));
    }

    fn finished_key(&self, side: Side) -> Option<hmac::Key> {
        let secrets = self.secrets.as_ref()?;
        let secret = match side {
            Side::Client => &secrets.client,
            Side::Server => &secrets.server,
        };
        let prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, secret);
        Some(hmac::Key::new(
            hmac::HMAC_SHA256,
            &expand_label(&prk, b"finished", &[], SECRET_LEN),
        ))
    }

    /// MAC over the current transcript with the finished key of `side`
    fn finished_mac(&self, side: Side) -> Result<hmac::Tag, TransportError> {
        let key = self
            .finished_key(side)
            .ok_or_else(|| TransportError::INTERNAL_ERROR("missing handshake secrets"))?;
        Ok(hmac::sign(&key, self.transcript_hash().as_ref()))
    }

    fn verify_finished(&self, side: Side, body: &[u8]) -> Result<(), TransportError> {
        let key = self
            .finished_key(side)
            .ok_or_else(|| TransportError::INTERNAL_ERROR("missing handshake secrets"))?;
        hmac::verify(&key, self.transcript_hash().as_ref(), body)
            .map_err(|_| TransportError::CRYPTO_ERROR("finished MAC mismatch"))
    }

    fn handle(&mut self, space: SpaceId, ty: u8, msg: &[u8]) -> Result<(), TransportError> {
        let body = &msg[HEADER_LEN..];
        trace!(%space, ty, len = body.len(), "handshake message in");
        match (self.state, space, ty) {
            (State::AwaitClientHello, SpaceId::Initial, CLIENT_HELLO) => {
                if body.len() < RANDOM_LEN {
                    return Err(TransportError::PROTOCOL_VIOLATION("short client hello"));
                }
                let params = TransportParameters::read(Side::Client, &mut &body[RANDOM_LEN..])?;
                self.peer_params = Some(params);
                self.transcript.update(msg);

                let mut random = [0; RANDOM_LEN];
                rand::thread_rng().fill_bytes(&mut random);
                self.send(SpaceId::Initial, SERVER_HELLO, &random);
                self.derive_handshake();

                let mut params = Vec::new();
                self.local_params.write(&mut params);
                self.send(SpaceId::Handshake, ENCRYPTED_PARAMETERS, &params);
                let tag = self.finished_mac(Side::Server)?;
                self.send(SpaceId::Handshake, FINISHED, tag.as_ref());
                self.derive_data();
                self.state = State::AwaitClientFinished;
            }
            (State::AwaitServerHello, SpaceId::Initial, SERVER_HELLO) => {
                if body.len() != RANDOM_LEN {
                    return Err(TransportError::PROTOCOL_VIOLATION("malformed server hello"));
                }
                self.transcript.update(msg);
                self.derive_handshake();
                self.state = State::AwaitParameters;
            }
            (State::AwaitParameters, SpaceId::Handshake, ENCRYPTED_PARAMETERS) => {
                let params = TransportParameters::read(Side::Server, &mut &body[..])?;
                self.peer_params = Some(params);
                self.transcript.update(msg);
                self.state = State::AwaitServerFinished;
            }
            (State::AwaitServerFinished, SpaceId::Handshake, FINISHED) => {
                self.verify_finished(Side::Server, body)?;
                self.transcript.update(msg);
                self.derive_data();
                let tag = self.finished_mac(Side::Client)?;
                self.send(SpaceId::Handshake, FINISHED, tag.as_ref());
                self.state = State::Complete;
            }
            (State::AwaitClientFinished, SpaceId::Handshake, FINISHED) => {
                self.verify_finished(Side::Client, body)?;
                self.transcript.update(msg);
                self.state = State::Complete;
            }
            _ => {
                return Err(TransportError::PROTOCOL_VIOLATION(
                    "unexpected handshake message",
                ))
            }
        }
        Ok(())
    }
}

impl Session for PskSession {
    fn read_handshake(&mut self, space: SpaceId, buf: &[u8]) -> Result<(), TransportError> {
        let mut pending = std::mem::take(&mut self.incoming[space as usize]);
        pending.extend_from_slice(buf);
        let mut consumed = 0;
        while pending.len() - consumed >= HEADER_LEN {
            let mut header = &pending[consumed..];
            let ty = header.get_u8();
            let len = header.get_u16() as usize;
            let end = consumed + HEADER_LEN + len;
            if pending.len() < end {
                break;
            }
            self.handle(space, ty, &pending[consumed..end])?;
            consumed = end;
        }
        pending.drain(..consumed);
        self.incoming[space as usize] = pending;
        Ok(())
    }

    fn write_handshake(&mut self) -> Option<(SpaceId, Vec<u8>)> {
        self.outgoing.pop_front()
    }

    fn next_keys(&mut self) -> Option<(SpaceId, Keys)> {
        self.keys.pop_front()
    }

    fn is_handshaking(&self) -> bool {
        self.state != State::Complete
    }

    fn transport_parameters(&self) -> Option<&TransportParameters> {
        self.peer_params.as_ref()
    }
}
