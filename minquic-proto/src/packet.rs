use std::{fmt, io};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{
    coding::{self, BufExt, BufMutExt},
    crypto::{CryptoError, HeaderKey, PacketKey},
    frame::{self, Frame, InvalidFrame},
    shared::ConnectionId,
    VERSION,
};

// Due to packet number protection, it is impossible to fully decode a header (which includes a
// variable-length packet number) without the keys of the connection it belongs to. We therefore
// decode the invariant part first, which yields the destination connection ID used to find that
// connection, then finish decoding with its keys.
#[derive(Debug)]
pub struct PartialDecode {
    plain_header: PlainHeader,
    buf: io::Cursor<BytesMut>,
}

impl PartialDecode {
    /// Parse the unprotected part of the first packet in `bytes`
    ///
    /// Returns the remainder of the datagram when packets are coalesced.
    pub fn new(
        bytes: BytesMut,
        local_cid_len: usize,
    ) -> Result<(Self, Option<BytesMut>), DecodeError> {
        let mut buf = io::Cursor::new(bytes);
        let plain_header = PlainHeader::decode(&mut buf, local_cid_len)?;
        let dgram_len = buf.get_ref().len();
        let packet_len = plain_header
            .payload_len()
            .map(|len| (buf.position() + len) as usize)
            .unwrap_or(dgram_len);
        if packet_len > dgram_len {
            return Err(DecodeError::TruncatedPacket("packet too short to contain payload length"));
        }

        let header_len = buf.position();
        let mut bytes = buf.into_inner();
        let rest = if packet_len != dgram_len {
            Some(bytes.split_off(packet_len))
        } else {
            None
        };
        let mut buf = io::Cursor::new(bytes);
        buf.set_position(header_len);
        Ok((Self { plain_header, buf }, rest))
    }

    pub(crate) fn is_initial(&self) -> bool {
        self.space() == SpaceId::Initial
    }

    pub(crate) fn space(&self) -> SpaceId {
        match self.plain_header {
            PlainHeader::Initial { .. } => SpaceId::Initial,
            PlainHeader::Handshake { .. } => SpaceId::Handshake,
            PlainHeader::Short { .. } => SpaceId::Data,
        }
    }

    pub(crate) fn dst_cid(&self) -> &ConnectionId {
        self.plain_header.dst_cid()
    }

    pub(crate) fn src_cid(&self) -> Option<&ConnectionId> {
        match self.plain_header {
            PlainHeader::Initial { ref src_cid, .. }
            | PlainHeader::Handshake { ref src_cid, .. } => Some(src_cid),
            PlainHeader::Short { .. } => None,
        }
    }

    /// Length of QUIC packet being decoded
    pub(crate) fn len(&self) -> usize {
        self.buf.get_ref().len()
    }

    /// Remove header protection, yielding the full header and the still-encrypted payload
    pub(crate) fn finish(self, header_crypto: &dyn HeaderKey) -> Result<Packet, DecodeError> {
        let Self {
            plain_header,
            mut buf,
        } = self;
        let pn_offset = buf.position() as usize;
        let number = decrypt_header(&mut buf, header_crypto)?;
        let header_len = pn_offset + number.len();
        let header = match plain_header {
            PlainHeader::Initial {
                dst_cid,
                src_cid,
                token_pos,
                ..
            } => Header::Initial {
                dst_cid,
                src_cid,
                token: buf.get_ref().clone().freeze().slice(token_pos),
                number,
            },
            PlainHeader::Handshake {
                dst_cid, src_cid, ..
            } => Header::Handshake {
                dst_cid,
                src_cid,
                number,
            },
            PlainHeader::Short { first, dst_cid } => Header::Short {
                key_phase: first & KEY_PHASE_BIT != 0,
                dst_cid,
                number,
            },
        };

        let mut bytes = buf.into_inner();
        let header_data = bytes.split_to(header_len).freeze();
        Ok(Packet {
            header,
            header_data,
            payload: bytes,
        })
    }
}

fn decrypt_header(
    buf: &mut io::Cursor<BytesMut>,
    header_crypto: &dyn HeaderKey,
) -> Result<PacketNumber, DecodeError> {
    let packet_length = buf.get_ref().len();
    let pn_offset = buf.position() as usize;
    if packet_length < pn_offset + 4 + header_crypto.sample_size() {
        return Err(DecodeError::TruncatedPacket(
            "packet too short to extract header protection sample",
        ));
    }

    header_crypto.decrypt(pn_offset, buf.get_mut());

    let len = PacketNumber::decode_len(buf.get_ref()[0]);
    PacketNumber::decode(len, buf)
}

/// A packet with header protection removed
pub(crate) struct Packet {
    pub(crate) header: Header,
    pub(crate) header_data: Bytes,
    pub(crate) payload: BytesMut,
}

/// A fully decoded packet: header, reconstructed packet number, and frames
#[derive(Debug)]
pub(crate) struct DecodedPacket {
    pub(crate) header: Header,
    pub(crate) number: u64,
    pub(crate) frames: Vec<Frame>,
}

/// Remove packet protection and parse the frames of a packet
///
/// `expected` is one more than the largest packet number received so far in the packet's space.
pub(crate) fn decode(
    partial: PartialDecode,
    header_crypto: &dyn HeaderKey,
    packet_crypto: &dyn PacketKey,
    expected: u64,
) -> Result<DecodedPacket, DecodeError> {
    let mut packet = partial.finish(header_crypto)?;
    let number = packet.header.number().expand(expected);
    packet_crypto
        .decrypt(number, &packet.header_data, &mut packet.payload)
        .map_err(|CryptoError| DecodeError::Undecryptable)?;
    let reserved = match packet.header.is_short() {
        true => SHORT_RESERVED_BITS,
        false => LONG_RESERVED_BITS,
    };
    if packet.header_data[0] & reserved != 0 {
        return Err(DecodeError::FrameParseFailure(InvalidFrame {
            ty: None,
            reason: "reserved header bits set",
        }));
    }
    if packet.payload.is_empty() {
        return Err(InvalidFrame::empty_payload().into());
    }
    let frames = frame::Iter::new(packet.payload.freeze()).collect::<Result<Vec<_>, _>>()?;
    Ok(DecodedPacket {
        header: packet.header,
        number,
        frames,
    })
}

/// Encode and protect a packet carrying `frames`
///
/// The payload is padded so that it can be sampled for header protection, and further to
/// `min_size` bytes.
#[cfg(test)]
pub(crate) fn encode(
    header: &Header,
    number: u64,
    frames: &[Frame],
    header_crypto: &dyn HeaderKey,
    packet_crypto: &dyn PacketKey,
    min_size: usize,
) -> Vec<u8> {
    let mut buf = Vec::new();
    let partial = header.encode(&mut buf);
    for frame in frames {
        frame.encode(&mut buf);
    }
    let tag_len = packet_crypto.tag_len();
    let min_payload = partial.header_len + 4 + header_crypto.sample_size() - tag_len;
    let padded = min_payload.max(min_size.saturating_sub(tag_len));
    if buf.len() < padded {
        buf.resize(padded, 0);
    }
    buf.resize(buf.len() + tag_len, 0);
    partial.finish(&mut buf, header_crypto, number, packet_crypto);
    buf
}

#[derive(Debug, Clone)]
pub(crate) enum Header {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Handshake {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        number: PacketNumber,
    },
    Short {
        key_phase: bool,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
}

impl Header {
    /// Write the unprotected header; the length field of long headers is filled in by `finish`
    pub(crate) fn encode(&self, w: &mut Vec<u8>) -> PartialEncode {
        use self::Header::*;
        let start = w.len();
        match *self {
            Initial {
                ref dst_cid,
                ref src_cid,
                ref token,
                number,
            } => {
                w.write(LONG_HEADER_FORM | FIXED_BIT | number.tag());
                w.write(VERSION);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                w.write_var(token.len() as u64);
                w.put_slice(token);
                w.write::<u16>(0); // Placeholder for payload length, filled in by `PartialEncode::finish`
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn_len: number.len(),
                    long: true,
                }
            }
            Handshake {
                ref dst_cid,
                ref src_cid,
                number,
            } => {
                w.write(LONG_HEADER_FORM | FIXED_BIT | (0x2 << 4) | number.tag());
                w.write(VERSION);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                w.write::<u16>(0); // Placeholder for payload length, filled in by `PartialEncode::finish`
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn_len: number.len(),
                    long: true,
                }
            }
            Short {
                ref dst_cid,
                number,
                key_phase,
            } => {
                w.write(
                    FIXED_BIT | if key_phase { KEY_PHASE_BIT } else { 0 } | number.tag(),
                );
                w.put_slice(dst_cid);
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn_len: number.len(),
                    long: false,
                }
            }
        }
    }

    pub(crate) fn number(&self) -> PacketNumber {
        use self::Header::*;
        match *self {
            Initial { number, .. } | Handshake { number, .. } | Short { number, .. } => number,
        }
    }

    pub(crate) fn space(&self) -> SpaceId {
        use self::Header::*;
        match *self {
            Initial { .. } => SpaceId::Initial,
            Handshake { .. } => SpaceId::Handshake,
            Short { .. } => SpaceId::Data,
        }
    }

    pub(crate) fn is_short(&self) -> bool {
        matches!(*self, Header::Short { .. })
    }

    #[cfg(test)]
    pub(crate) fn dst_cid(&self) -> &ConnectionId {
        use self::Header::*;
        match *self {
            Initial { ref dst_cid, .. }
            | Handshake { ref dst_cid, .. }
            | Short { ref dst_cid, .. } => dst_cid,
        }
    }
}

/// A header written by [`Header::encode`], awaiting its payload
pub(crate) struct PartialEncode {
    /// Offset of the packet within the datagram buffer
    pub(crate) start: usize,
    /// Header length, relative to `start`
    pub(crate) header_len: usize,
    pn_len: usize,
    long: bool,
}

impl PartialEncode {
    /// Fill in the length field, seal the payload, and apply header protection
    ///
    /// The packet runs from `start` to the end of `buf`, which must already contain room for the
    /// AEAD tag after the payload.
    pub(crate) fn finish(
        self,
        buf: &mut [u8],
        header_crypto: &dyn HeaderKey,
        number: u64,
        packet_crypto: &dyn PacketKey,
    ) {
        let Self {
            start,
            header_len,
            pn_len,
            long,
        } = self;
        let buf = &mut buf[start..];

        let pn_pos = header_len - pn_len;
        if long {
            let len = buf.len() - header_len + pn_len;
            assert!(len < 2usize.pow(14)); // Fits in reserved space
            let mut slice = &mut buf[pn_pos - 2..pn_pos];
            slice.put_u16(len as u16 | 0b01 << 14);
        }

        packet_crypto.encrypt(number, buf, header_len);

        debug_assert!(
            pn_pos + 4 + header_crypto.sample_size() <= buf.len(),
            "packet must be padded to at least {} bytes for header protection sampling",
            pn_pos + 4 + header_crypto.sample_size()
        );
        header_crypto.encrypt(pn_pos, buf);
    }
}

/// The parts of a header readable without keys
#[derive(Debug)]
enum PlainHeader {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token_pos: std::ops::Range<usize>,
        len: u64,
    },
    Handshake {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        len: u64,
    },
    Short {
        first: u8,
        dst_cid: ConnectionId,
    },
}

impl PlainHeader {
    fn dst_cid(&self) -> &ConnectionId {
        use self::PlainHeader::*;
        match self {
            Initial { dst_cid, .. } | Handshake { dst_cid, .. } | Short { dst_cid, .. } => dst_cid,
        }
    }

    fn payload_len(&self) -> Option<u64> {
        use self::PlainHeader::*;
        match self {
            Initial { len, .. } | Handshake { len, .. } => Some(*len),
            Short { .. } => None,
        }
    }

    fn decode(buf: &mut io::Cursor<BytesMut>, local_cid_len: usize) -> Result<Self, DecodeError> {
        let first = buf.get::<u8>()?;
        if first & FIXED_BIT == 0 {
            return Err(DecodeError::TruncatedPacket("fixed bit unset"));
        }
        if first & LONG_HEADER_FORM == 0 {
            if buf.remaining() < local_cid_len {
                return Err(DecodeError::TruncatedPacket(
                    "destination connection ID longer than packet",
                ));
            }
            let mut cid = vec![0; local_cid_len];
            buf.copy_to_slice(&mut cid);
            return Ok(PlainHeader::Short {
                first,
                dst_cid: ConnectionId::new(&cid),
            });
        }

        let version = buf.get::<u32>()?;
        let dst_cid = ConnectionId::decode_long(buf)
            .ok_or(DecodeError::TruncatedPacket("malformed destination connection ID"))?;
        let src_cid = ConnectionId::decode_long(buf)
            .ok_or(DecodeError::TruncatedPacket("malformed source connection ID"))?;
        if version != VERSION {
            return Err(DecodeError::UnsupportedVersion {
                version,
                src_cid,
                dst_cid,
            });
        }

        match LongType::from_byte(first) {
            LongType::Initial => {
                let token_len = buf.get_var()? as usize;
                let token_start = buf.position() as usize;
                if token_len > buf.remaining() {
                    return Err(DecodeError::TruncatedPacket("token longer than packet"));
                }
                buf.advance(token_len);
                let len = buf.get_var()?;
                Ok(PlainHeader::Initial {
                    dst_cid,
                    src_cid,
                    token_pos: token_start..token_start + token_len,
                    len,
                })
            }
            LongType::Handshake => Ok(PlainHeader::Handshake {
                dst_cid,
                src_cid,
                len: buf.get_var()?,
            }),
            LongType::ZeroRtt | LongType::Retry => Err(DecodeError::UnsupportedVersion {
                version,
                src_cid,
                dst_cid,
            }),
        }
    }
}

/// Long packet types
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

impl LongType {
    fn from_byte(b: u8) -> Self {
        match (b & 0x30) >> 4 {
            0x0 => LongType::Initial,
            0x1 => LongType::ZeroRtt,
            0x2 => LongType::Handshake,
            _ => LongType::Retry,
        }
    }
}

/// An encoded packet number
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    /// Truncate `n` to the fewest bytes that let the peer reconstruct it
    ///
    /// The encoding must span more than twice the number of packets the peer may not yet have
    /// acknowledged.
    pub(crate) fn new(n: u64, largest_acked: Option<u64>) -> Self {
        let unacked = match largest_acked {
            Some(x) => n - x,
            None => n + 1,
        };
        let range = unacked * 2;
        if range < 1 << 8 {
            PacketNumber::U8(n as u8)
        } else if range < 1 << 16 {
            PacketNumber::U16(n as u16)
        } else if range < 1 << 24 {
            PacketNumber::U24(n as u32)
        } else if range < 1 << 32 {
            PacketNumber::U32(n as u32)
        } else {
            panic!("packet number too large to encode")
        }
    }

    pub(crate) fn len(self) -> usize {
        use self::PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U24(_) => 3,
            U32(_) => 4,
        }
    }

    pub(crate) fn encode<W: BufMut>(self, w: &mut W) {
        use self::PacketNumber::*;
        match self {
            U8(x) => w.write(x),
            U16(x) => w.write(x),
            U24(x) => w.put_uint(u64::from(x), 3),
            U32(x) => w.write(x),
        }
    }

    pub(crate) fn decode<R: Buf>(len: usize, r: &mut R) -> Result<Self, DecodeError> {
        use self::PacketNumber::*;
        let pn = match len {
            1 => U8(r.get()?),
            2 => U16(r.get()?),
            3 => {
                if r.remaining() < 3 {
                    return Err(coding::UnexpectedEnd.into());
                }
                U24(r.get_uint(3) as u32)
            }
            4 => U32(r.get()?),
            _ => unreachable!(),
        };
        Ok(pn)
    }

    pub(crate) fn decode_len(tag: u8) -> usize {
        1 + (tag & 0x03) as usize
    }

    fn tag(self) -> u8 {
        use self::PacketNumber::*;
        match self {
            U8(_) => 0b00,
            U16(_) => 0b01,
            U24(_) => 0b10,
            U32(_) => 0b11,
        }
    }

    /// Reconstruct the full packet number nearest to `expected`
    pub(crate) fn expand(self, expected: u64) -> u64 {
        use self::PacketNumber::*;
        let truncated = match self {
            U8(x) => u64::from(x),
            U16(x) => u64::from(x),
            U24(x) | U32(x) => u64::from(x),
        };
        let nbits = self.len() * 8;
        let win = 1 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        // The candidate sharing expected's high bits may be up to one window away from the
        // truth; pick whichever neighbour lies within half a window of expected.
        let candidate = (expected & !mask) | truncated;
        if expected.checked_sub(hwin).map_or(false, |x| candidate <= x) {
            candidate + win
        } else if candidate > expected + hwin && candidate >= win {
            candidate - win
        } else {
            candidate
        }
    }
}

/// Why a datagram or packet could not be decoded
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// No connection is known for the destination connection ID
    #[error("unknown connection ID {0}")]
    UnknownConnectionId(ConnectionId),
    /// The packet uses a version or packet type this endpoint does not speak
    #[error("unsupported version {version:#x}")]
    UnsupportedVersion {
        /// Version field of the packet
        version: u32,
        /// Source connection ID
        src_cid: ConnectionId,
        /// Destination connection ID
        dst_cid: ConnectionId,
    },
    /// The packet ended before its header or declared payload did
    #[error("truncated packet: {0}")]
    TruncatedPacket(&'static str),
    /// A frame in an authenticated payload was malformed
    #[error("frame parse failure: {0}")]
    FrameParseFailure(#[from] InvalidFrame),
    /// Payload authentication failed
    #[error("packet failed authentication")]
    Undecryptable,
}

impl DecodeError {
    /// Whether this error terminates the connection the packet was routed to
    ///
    /// Unknown connections, unsupported versions and unauthenticated payloads are dropped
    /// without a response.
    pub fn is_fatal(&self) -> bool {
        matches!(
            *self,
            DecodeError::TruncatedPacket(_) | DecodeError::FrameParseFailure(_)
        )
    }
}

impl From<coding::UnexpectedEnd> for DecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        DecodeError::TruncatedPacket("unexpected end of packet")
    }
}

pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
pub(crate) const FIXED_BIT: u8 = 0x40;
const SHORT_RESERVED_BITS: u8 = 0x18;
const LONG_RESERVED_BITS: u8 = 0x0c;
const KEY_PHASE_BIT: u8 = 0x04;

/// Packet number space identifiers
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SpaceId {
    /// Unprotected packets, used to bootstrap the handshake
    Initial = 0,
    /// Packets protected with handshake keys
    Handshake = 1,
    /// Application data space, used for post-handshake/1-RTT packets
    Data = 2,
}

impl SpaceId {
    /// All spaces, in the order their keys become available
    pub const VALUES: [Self; 3] = [SpaceId::Initial, SpaceId::Handshake, SpaceId::Data];
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match *self {
            SpaceId::Initial => "initial",
            SpaceId::Handshake => "handshake",
            SpaceId::Data => "data",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::initial_keys, Side};
    use assert_matches::assert_matches;
    use hex_literal::hex;

    fn check_pn(typed: PacketNumber, encoded: &[u8]) {
        let mut buf = Vec::new();
        typed.encode(&mut buf);
        assert_eq!(&buf[..], encoded);
        let decoded = PacketNumber::decode(typed.len(), &mut io::Cursor::new(&buf)).unwrap();
        assert_eq!(typed, decoded);
    }

    #[test]
    fn pn_encode() {
        check_pn(PacketNumber::new(0x10, Some(0)), &[0x10]);
        check_pn(PacketNumber::new(0x100, Some(0)), &[0x01, 0x00]);
        check_pn(PacketNumber::new(0x10000, Some(0)), &[0x01, 0x00, 0x00]);
        check_pn(PacketNumber::new(0x7e, None), &[0x7e]);
        check_pn(PacketNumber::new(0x80, None), &[0x00, 0x80]);
    }

    #[test]
    fn pn_expand_roundtrip() {
        for expected in 0..1024 {
            for actual in expected..1024 {
                assert_eq!(
                    actual,
                    PacketNumber::new(actual, expected.checked_sub(1)).expand(expected)
                );
            }
        }
    }

    #[test]
    fn pn_expand_rfc9000_example() {
        // RFC 9000 appendix A.3
        assert_eq!(PacketNumber::U16(0x9b32).expand(0xa82f30eb), 0xa82f9b32);
    }

    fn keys() -> (crate::crypto::Keys, crate::crypto::Keys) {
        let cid = ConnectionId::new(&hex!("06b858ec6f80452b"));
        (
            initial_keys(&cid, Side::Client),
            initial_keys(&cid, Side::Server),
        )
    }

    #[test]
    fn initial_roundtrip() {
        let (client, server) = keys();
        let dcid = ConnectionId::new(&hex!("06b858ec6f80452b"));
        let scid = ConnectionId::new(&hex!("0102030405060708"));
        let header = Header::Initial {
            dst_cid: dcid,
            src_cid: scid,
            token: Bytes::new(),
            number: PacketNumber::new(0, None),
        };
        let datagram = encode(
            &header,
            0,
            &[Frame::Ping],
            &*client.header.local,
            &*client.packet.local,
            1200,
        );
        assert_eq!(datagram.len(), 1200);
        assert_eq!(datagram[0] & 0xf0, 0xc0);

        let (partial, rest) = PartialDecode::new(BytesMut::from(&datagram[..]), 8).unwrap();
        assert!(rest.is_none());
        assert!(partial.is_initial());
        assert_eq!(*partial.dst_cid(), dcid);
        assert_eq!(partial.src_cid(), Some(&scid));
        let decoded = decode(partial, &*server.header.remote, &*server.packet.remote, 0).unwrap();
        assert_eq!(decoded.number, 0);
        assert_matches!(decoded.frames[0], Frame::Ping);
        assert!(decoded.frames[1..]
            .iter()
            .all(|f| matches!(f, Frame::Padding)));
    }

    #[test]
    fn header_protection_removed_after_invariant_header() {
        let (client, server) = keys();
        let dcid = ConnectionId::new(&hex!("06b858ec6f80452b"));
        let scid = ConnectionId::new(&hex!("0102030405060708"));
        let datagram = encode(
            &Header::Initial {
                dst_cid: dcid,
                src_cid: scid,
                token: Bytes::new(),
                number: PacketNumber::new(0, None),
            },
            0,
            &[Frame::Ping],
            &*client.header.local,
            &*client.packet.local,
            1200,
        );

        let (partial, _) = PartialDecode::new(BytesMut::from(&datagram[..]), 8).unwrap();
        let packet = partial.finish(&*server.header.remote).unwrap();
        // First byte, version, both IDs, empty token, 2-byte length, 1-byte packet number
        assert_eq!(packet.header_data.len(), 1 + 4 + 1 + 8 + 1 + 8 + 1 + 2 + 1);
        assert_eq!(packet.header_data[0] & 0xf3, 0xc0);
        assert_eq!(&packet.header_data[1..6], &[0, 0, 0, 1, 8]);
        assert_eq!(&packet.header_data[6..14], &dcid[..]);
        assert_eq!(packet.header.number().expand(0), 0);
        assert_eq!(packet.payload.len(), datagram.len() - packet.header_data.len());
    }

    #[test]
    fn short_header_roundtrip() {
        let (client, server) = keys();
        let dcid = ConnectionId::new(&hex!("a1a2a3a4a5a6a7a8"));
        let header = Header::Short {
            key_phase: false,
            dst_cid: dcid,
            number: PacketNumber::new(300, Some(290)),
        };
        let datagram = encode(
            &header,
            300,
            &[Frame::Ping],
            &*client.header.local,
            &*client.packet.local,
            0,
        );
        let (partial, _) = PartialDecode::new(BytesMut::from(&datagram[..]), 8).unwrap();
        assert_eq!(partial.space(), SpaceId::Data);
        let decoded =
            decode(partial, &*server.header.remote, &*server.packet.remote, 291).unwrap();
        assert_eq!(decoded.number, 300);
        assert_eq!(*decoded.header.dst_cid(), dcid);
    }

    #[test]
    fn coalesced_packets_split() {
        let (client, _) = keys();
        let dcid = ConnectionId::new(&hex!("06b858ec6f80452b"));
        let mut datagram = encode(
            &Header::Initial {
                dst_cid: dcid,
                src_cid: dcid,
                token: Bytes::new(),
                number: PacketNumber::new(0, None),
            },
            0,
            &[Frame::Ping],
            &*client.header.local,
            &*client.packet.local,
            0,
        );
        let first_len = datagram.len();
        datagram.extend(encode(
            &Header::Handshake {
                dst_cid: dcid,
                src_cid: dcid,
                number: PacketNumber::new(0, None),
            },
            0,
            &[Frame::Ping],
            &*client.header.local,
            &*client.packet.local,
            0,
        ));
        let (first, rest) = PartialDecode::new(BytesMut::from(&datagram[..]), 8).unwrap();
        assert_eq!(first.len(), first_len);
        let (second, rest) = PartialDecode::new(rest.unwrap(), 8).unwrap();
        assert_eq!(second.space(), SpaceId::Handshake);
        assert!(rest.is_none());
    }

    #[test]
    fn truncated_long_header() {
        let (client, _) = keys();
        let dcid = ConnectionId::new(&hex!("06b858ec6f80452b"));
        let datagram = encode(
            &Header::Handshake {
                dst_cid: dcid,
                src_cid: dcid,
                number: PacketNumber::new(0, None),
            },
            0,
            &[Frame::Ping],
            &*client.header.local,
            &*client.packet.local,
            0,
        );
        let err = PartialDecode::new(BytesMut::from(&datagram[..datagram.len() - 3]), 8)
            .unwrap_err();
        assert_matches!(err, DecodeError::TruncatedPacket(_));
        assert!(err.is_fatal());
    }

    #[test]
    fn unsupported_version() {
        let mut buf = vec![0xc0u8];
        buf.extend_from_slice(&0xff00_001du32.to_be_bytes());
        buf.extend_from_slice(&[4, 1, 2, 3, 4, 0]);
        buf.resize(1200, 0);
        let err = PartialDecode::new(BytesMut::from(&buf[..]), 8).unwrap_err();
        assert_matches!(err, DecodeError::UnsupportedVersion { version: 0xff00_001d, .. });
        assert!(!err.is_fatal());
    }

    #[test]
    fn tampered_payload_is_undecryptable() {
        let (client, server) = keys();
        let dcid = ConnectionId::new(&hex!("a1a2a3a4a5a6a7a8"));
        let mut datagram = encode(
            &Header::Short {
                key_phase: false,
                dst_cid: dcid,
                number: PacketNumber::new(0, None),
            },
            0,
            &[Frame::Ping],
            &*client.header.local,
            &*client.packet.local,
            0,
        );
        let last = datagram.len() - 1;
        datagram[last] ^= 1;
        let (partial, _) = PartialDecode::new(BytesMut::from(&datagram[..]), 8).unwrap();
        let err = decode(partial, &*server.header.remote, &*server.packet.remote, 0).unwrap_err();
        assert_eq!(err, DecodeError::Undecryptable);
        assert!(!err.is_fatal());
    }
}
