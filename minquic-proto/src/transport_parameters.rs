//! QUIC connection transport parameters
//!
//! `TransportParameters` carry the limits each peer imposes on the other. They are exchanged
//! inside the handshake, so the types here are mostly of interest to implementations of
//! [`crypto::Session`](crate::crypto::Session).

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::{
    coding::{BufExt, BufMutExt, UnexpectedEnd},
    config::{EndpointConfig, TransportConfig},
    shared::ConnectionId,
    Side, TransportError, VarInt, MAX_CID_SIZE, MAX_STREAM_COUNT,
};

// Integer-valued parameters with their RFC 9000 §18.2 ids and defaults. Encoding, decoding and
// the defaults all expand this one list.
macro_rules! apply_params {
    ($macro:ident) => {
        $macro! {
            // #[doc] name (id) = default,
            /// Milliseconds, disabled if zero
            max_idle_timeout(0x01) = 0,
            /// Limits the size of UDP payloads that the endpoint is willing to receive
            max_udp_payload_size(0x03) = 65527,

            /// Initial value for the maximum amount of data that can be sent on the connection
            initial_max_data(0x04) = 0,
            /// Initial flow control limit for locally-initiated bidirectional streams
            initial_max_stream_data_bidi_local(0x05) = 0,
            /// Initial flow control limit for peer-initiated bidirectional streams
            initial_max_stream_data_bidi_remote(0x06) = 0,
            /// Initial flow control limit for unidirectional streams
            initial_max_stream_data_uni(0x07) = 0,

            /// Initial maximum number of bidirectional streams the peer may initiate
            initial_max_streams_bidi(0x08) = 0,
            /// Initial maximum number of unidirectional streams the peer may initiate
            initial_max_streams_uni(0x09) = 0,

            /// Exponent used to decode the ACK Delay field in the ACK frame
            ack_delay_exponent(0x0a) = 3,
            /// Maximum amount of time in milliseconds by which the endpoint will delay sending
            /// acknowledgments
            max_ack_delay(0x0b) = 25,
        }
    };
}

const INITIAL_SOURCE_CONNECTION_ID: u64 = 0x0f;

macro_rules! make_struct {
    {$($(#[$doc:meta])* $name:ident ($id:expr) = $default:expr,)*} => {
        /// Transport parameters used to negotiate connection-level preferences between peers
        #[derive(Debug, Copy, Clone, Eq, PartialEq)]
        pub struct TransportParameters {
            $($(#[$doc])* pub $name : VarInt,)*

            /// The value the endpoint put in the Source Connection ID field of its first Initial
            /// packet
            pub initial_src_cid: Option<ConnectionId>,
        }

        impl Default for TransportParameters {
            /// Protocol defaults, used for any parameter the peer does not supply
            fn default() -> Self {
                Self {
                    $($name: VarInt::from_u32($default),)*
                    initial_src_cid: None,
                }
            }
        }
    }
}

apply_params!(make_struct);

impl TransportParameters {
    pub(crate) fn new(
        config: &TransportConfig,
        endpoint_config: &EndpointConfig,
        initial_src_cid: ConnectionId,
    ) -> Self {
        Self {
            initial_src_cid: Some(initial_src_cid),
            initial_max_streams_bidi: config.max_concurrent_bidi_streams,
            initial_max_streams_uni: config.max_concurrent_uni_streams,
            initial_max_data: config.receive_window,
            initial_max_stream_data_bidi_local: config.stream_receive_window,
            initial_max_stream_data_bidi_remote: config.stream_receive_window,
            initial_max_stream_data_uni: config.stream_receive_window,
            max_udp_payload_size: endpoint_config.max_udp_payload_size,
            max_idle_timeout: config.max_idle_timeout.unwrap_or(VarInt(0)),
            max_ack_delay: VarInt::from_u64(config.max_ack_delay.as_millis() as u64)
                .unwrap_or(VarInt::MAX),
            ..Self::default()
        }
    }

    /// Encode `TransportParameters` into buffer
    ///
    /// Parameters equal to their protocol default are omitted.
    pub fn write<W: BufMut>(&self, w: &mut W) {
        macro_rules! write_params {
            {$($(#[$doc:meta])* $name:ident ($id:expr) = $default:expr,)*} => {
                $(
                    if self.$name.0 != $default {
                        w.write_var($id);
                        w.write_var(self.$name.size() as u64);
                        w.write(self.$name);
                    }
                )*
            }
        }
        apply_params!(write_params);

        if let Some(ref cid) = self.initial_src_cid {
            w.write_var(INITIAL_SOURCE_CONNECTION_ID);
            w.write_var(cid.len() as u64);
            w.put_slice(cid);
        }
    }

    /// Decode `TransportParameters` from buffer
    ///
    /// `side` is the side of the endpoint that sent the parameters.
    pub fn read<R: Buf>(side: Side, r: &mut R) -> Result<Self, Error> {
        let mut params = Self::default();

        // Duplicates are a protocol violation
        macro_rules! param_state {
            {$($(#[$doc:meta])* $name:ident ($id:expr) = $default:expr,)*} => {{
                struct ParamState {
                    $($name: bool,)*
                }

                ParamState {
                    $($name: false,)*
                }
            }}
        }
        let mut got = apply_params!(param_state);

        while r.has_remaining() {
            let id = r.get_var()?;
            let len = r.get_var()?;
            if (r.remaining() as u64) < len {
                return Err(Error::Malformed);
            }
            let len = len as usize;

            if id == INITIAL_SOURCE_CONNECTION_ID {
                if len > MAX_CID_SIZE || params.initial_src_cid.is_some() {
                    return Err(Error::Malformed);
                }
                let mut cid = [0; MAX_CID_SIZE];
                r.copy_to_slice(&mut cid[..len]);
                params.initial_src_cid = Some(ConnectionId::new(&cid[..len]));
                continue;
            }

            macro_rules! parse {
                {$($(#[$doc:meta])* $name:ident ($id:expr) = $default:expr,)*} => {
                    match id {
                        $($id => {
                            let value = r.get::<VarInt>()?;
                            if len != value.size() || got.$name {
                                return Err(Error::Malformed);
                            }
                            params.$name = value;
                            got.$name = true;
                        })*
                        // Unknown parameters are ignored
                        _ => r.advance(len),
                    }
                }
            }
            apply_params!(parse);
        }

        if params.ack_delay_exponent.0 > 20
            || params.max_ack_delay.0 >= 1 << 14
            || params.max_udp_payload_size.0 < 1200
            || params.initial_max_streams_bidi.0 > MAX_STREAM_COUNT
            || params.initial_max_streams_uni.0 > MAX_STREAM_COUNT
            || params.initial_src_cid.is_none()
        {
            return Err(Error::IllegalValue);
        }
        let _ = side;

        Ok(params)
    }
}

/// Errors encountered while decoding `TransportParameters`
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum Error {
    /// Parameters that are semantically invalid
    #[error("parameter had illegal value")]
    IllegalValue,
    /// Catch-all error for problems while decoding transport parameters
    #[error("parameters were malformed")]
    Malformed,
}

impl From<Error> for TransportError {
    fn from(e: Error) -> Self {
        match e {
            Error::IllegalValue => Self::TRANSPORT_PARAMETER_ERROR("illegal value"),
            Error::Malformed => Self::TRANSPORT_PARAMETER_ERROR("malformed"),
        }
    }
}

impl From<UnexpectedEnd> for Error {
    fn from(_: UnexpectedEnd) -> Self {
        Self::Malformed
    }
}
