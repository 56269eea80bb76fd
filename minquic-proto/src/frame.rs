use std::{
    fmt, mem,
    ops::{Range, RangeInclusive},
};

use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;

use crate::{
    coding::{self, BufExt, BufMutExt, UnexpectedEnd},
    range_set::RangeSet,
    Dir, StreamId, TransportError, TransportErrorCode, VarInt,
};

/// A QUIC frame type
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct FrameType(u64);

impl FrameType {
    fn stream(self) -> Option<StreamInfo> {
        if STREAM_TYS.contains(&self.0) {
            Some(StreamInfo(self.0 as u8))
        } else {
            None
        }
    }
}

impl coding::Codec for FrameType {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        Ok(Self(buf.get_var()?))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.write_var(self.0);
    }
}

pub(crate) trait FrameStruct {
    /// Smallest number of bytes this type of frame is guaranteed to fit within.
    const SIZE_BOUND: usize;
}

macro_rules! frame_types {
    {$($name:ident = $val:expr,)*} => {
        impl FrameType {
            $(pub(crate) const $name: FrameType = FrameType($val);)*
        }

        impl fmt::Debug for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    _ => write!(f, "Type({:02x})", self.0)
                }
            }
        }

        impl fmt::Display for FrameType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.0 {
                    $($val => f.write_str(stringify!($name)),)*
                    x if STREAM_TYS.contains(&x) => f.write_str("STREAM"),
                    _ => write!(f, "<unknown {:02x}>", self.0),
                }
            }
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct StreamInfo(u8);

impl StreamInfo {
    fn fin(self) -> bool {
        self.0 & 0x01 != 0
    }
    fn len(self) -> bool {
        self.0 & 0x02 != 0
    }
    fn off(self) -> bool {
        self.0 & 0x04 != 0
    }
}

frame_types! {
    PADDING = 0x00,
    PING = 0x01,
    ACK = 0x02,
    ACK_ECN = 0x03,
    RESET_STREAM = 0x04,
    STOP_SENDING = 0x05,
    CRYPTO = 0x06,
    MAX_DATA = 0x10,
    MAX_STREAM_DATA = 0x11,
    MAX_STREAMS_BIDI = 0x12,
    MAX_STREAMS_UNI = 0x13,
    DATA_BLOCKED = 0x14,
    STREAM_DATA_BLOCKED = 0x15,
    STREAMS_BLOCKED_BIDI = 0x16,
    STREAMS_BLOCKED_UNI = 0x17,
    CONNECTION_CLOSE = 0x1c,
    APPLICATION_CLOSE = 0x1d,
    HANDSHAKE_DONE = 0x1e,
}

const STREAM_TYS: RangeInclusive<u64> = RangeInclusive::new(0x08, 0x0f);

#[derive(Debug)]
pub(crate) enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream(ResetStream),
    StopSending(StopSending),
    Crypto(Crypto),
    Stream(Stream),
    MaxData(VarInt),
    MaxStreamData { id: StreamId, offset: u64 },
    MaxStreams { dir: Dir, count: u64 },
    DataBlocked { offset: u64 },
    StreamDataBlocked { id: StreamId, offset: u64 },
    StreamsBlocked { dir: Dir, limit: u64 },
    Close(Close),
    HandshakeDone,
}

impl Frame {
    pub(crate) fn ty(&self) -> FrameType {
        use self::Frame::*;
        match *self {
            Padding => FrameType::PADDING,
            Ping => FrameType::PING,
            Ack(_) => FrameType::ACK,
            ResetStream(_) => FrameType::RESET_STREAM,
            StopSending(_) => FrameType::STOP_SENDING,
            Crypto(_) => FrameType::CRYPTO,
            Stream(ref x) => {
                let mut ty = *STREAM_TYS.start();
                if x.fin {
                    ty |= 0x01;
                }
                if x.offset != 0 {
                    ty |= 0x04;
                }
                FrameType(ty)
            }
            MaxData(_) => FrameType::MAX_DATA,
            MaxStreamData { .. } => FrameType::MAX_STREAM_DATA,
            MaxStreams { dir: Dir::Bi, .. } => FrameType::MAX_STREAMS_BIDI,
            MaxStreams { dir: Dir::Uni, .. } => FrameType::MAX_STREAMS_UNI,
            DataBlocked { .. } => FrameType::DATA_BLOCKED,
            StreamDataBlocked { .. } => FrameType::STREAM_DATA_BLOCKED,
            StreamsBlocked { dir: Dir::Bi, .. } => FrameType::STREAMS_BLOCKED_BIDI,
            StreamsBlocked { dir: Dir::Uni, .. } => FrameType::STREAMS_BLOCKED_UNI,
            Close(self::Close::Connection(_)) => FrameType::CONNECTION_CLOSE,
            Close(self::Close::Application(_)) => FrameType::APPLICATION_CLOSE,
            HandshakeDone => FrameType::HANDSHAKE_DONE,
        }
    }

    pub(crate) fn is_ack_eliciting(&self) -> bool {
        !matches!(*self, Frame::Ack(_) | Frame::Padding | Frame::Close(_))
    }

    /// Whether the frame may appear in Initial and Handshake packets
    pub(crate) fn is_handshake_permitted(&self) -> bool {
        matches!(
            *self,
            Frame::Padding
                | Frame::Ping
                | Frame::Ack(_)
                | Frame::Crypto(_)
                | Frame::Close(Close::Connection(_))
        )
    }

    /// Append this frame's wire encoding to `out`
    #[cfg(test)]
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        use self::Frame::*;
        match *self {
            Padding => out.write(FrameType::PADDING),
            Ping => out.write(FrameType::PING),
            Ack(ref x) => self::Ack::encode(x.delay, &x.ranges, out),
            ResetStream(ref x) => x.encode(out),
            StopSending(ref x) => x.encode(out),
            Crypto(ref x) => x.encode(out),
            Stream(ref x) => {
                StreamMeta {
                    id: x.id,
                    offsets: x.offset..x.offset + x.data.len() as u64,
                    fin: x.fin,
                }
                .encode(true, out);
                out.put_slice(&x.data);
            }
            MaxData(x) => {
                out.write(FrameType::MAX_DATA);
                out.write(x);
            }
            MaxStreamData { id, offset } => {
                out.write(FrameType::MAX_STREAM_DATA);
                out.write(id);
                out.write_var(offset);
            }
            MaxStreams { count, .. } | StreamsBlocked { limit: count, .. } => {
                out.write(self.ty());
                out.write_var(count);
            }
            DataBlocked { offset } => {
                out.write(FrameType::DATA_BLOCKED);
                out.write_var(offset);
            }
            StreamDataBlocked { id, offset } => {
                out.write(FrameType::STREAM_DATA_BLOCKED);
                out.write(id);
                out.write_var(offset);
            }
            Close(ref x) => x.encode(out, usize::MAX),
            HandshakeDone => out.write(FrameType::HANDSHAKE_DONE),
        }
    }
}

/// Reason for a CONNECTION_CLOSE, at either layer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Close {
    /// Closed by the transport
    Connection(ConnectionClose),
    /// Closed by the application
    Application(ApplicationClose),
}

impl Close {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        match *self {
            Self::Connection(ref x) => x.encode(out, max_len),
            Self::Application(ref x) => x.encode(out, max_len),
        }
    }
}

impl From<TransportError> for Close {
    fn from(x: TransportError) -> Self {
        Self::Connection(x.into())
    }
}

impl From<ConnectionClose> for Close {
    fn from(x: ConnectionClose) -> Self {
        Self::Connection(x)
    }
}

impl From<ApplicationClose> for Close {
    fn from(x: ApplicationClose) -> Self {
        Self::Application(x)
    }
}

/// Reason given by the transport for closing the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClose {
    /// Class of error as encoded in the specification
    pub error_code: TransportErrorCode,
    /// Type of frame that caused the close
    pub frame_type: Option<FrameType>,
    /// Human-readable reason for the close
    pub reason: Bytes,
}

impl fmt::Display for ConnectionClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error_code.fmt(f)?;
        if !self.reason.is_empty() {
            f.write_str(": ")?;
            f.write_str(&String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

impl From<TransportError> for ConnectionClose {
    fn from(x: TransportError) -> Self {
        Self {
            error_code: x.code,
            frame_type: x.frame,
            reason: x.reason.into(),
        }
    }
}

impl FrameStruct for ConnectionClose {
    const SIZE_BOUND: usize = 1 + 8 + 8 + 8;
}

impl ConnectionClose {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        out.write(FrameType::CONNECTION_CLOSE);
        out.write(self.error_code);
        let ty = self.frame_type.map_or(0, |x| x.0);
        out.write_var(ty);
        let len = truncated_reason(&self.reason, max_len.saturating_sub(Self::SIZE_BOUND));
        out.write_var(len as u64);
        out.put_slice(&self.reason[..len]);
    }
}

/// Reason given by an application for closing the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationClose {
    /// Application-specific reason code
    pub error_code: VarInt,
    /// Human-readable reason for the close
    pub reason: Bytes,
}

impl fmt::Display for ApplicationClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.reason.is_empty() {
            f.write_str(&String::from_utf8_lossy(&self.reason))?;
            write!(f, " (code {})", self.error_code)
        } else {
            self.error_code.fmt(f)
        }
    }
}

impl FrameStruct for ApplicationClose {
    const SIZE_BOUND: usize = 1 + 8 + 8;
}

impl ApplicationClose {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W, max_len: usize) {
        out.write(FrameType::APPLICATION_CLOSE);
        out.write(self.error_code);
        let len = truncated_reason(&self.reason, max_len.saturating_sub(Self::SIZE_BOUND));
        out.write_var(len as u64);
        out.put_slice(&self.reason[..len]);
    }
}

fn truncated_reason(reason: &[u8], room: usize) -> usize {
    reason.len().min(room)
}

/// Acknowledged packet numbers, with the delay the peer reported for the largest
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Ack {
    /// Raw encoded delay; scaled by the peer's `ack_delay_exponent`
    pub(crate) delay: u64,
    pub(crate) ranges: RangeSet,
}

impl Ack {
    pub(crate) fn largest(&self) -> u64 {
        // Decoding guarantees at least one range
        self.ranges.max().unwrap_or(0)
    }

    /// Encode an ACK covering `ranges`, which must be non-empty
    pub(crate) fn encode<W: BufMut>(delay: u64, ranges: &RangeSet, buf: &mut W) {
        let mut rest = ranges.iter().rev();
        let first = rest.next().expect("ACK with no ranges");
        buf.write(FrameType::ACK);
        buf.write_var(first.end - 1);
        buf.write_var(delay);
        buf.write_var(ranges.len() as u64 - 1);
        buf.write_var(first.end - first.start - 1);
        let mut prev = first.start;
        for block in rest {
            buf.write_var(prev - block.end - 1);
            buf.write_var(block.end - block.start - 1);
            prev = block.start;
        }
    }

    fn decode<B: Buf>(buf: &mut B, ecn: bool) -> Result<Self, IterErr> {
        let largest = buf.get_var()?;
        let delay = buf.get_var()?;
        let extra_blocks = buf.get_var()?;
        let first = buf.get_var()?;
        let mut smallest = largest.checked_sub(first).ok_or(IterErr::Malformed)?;
        let mut ranges = RangeSet::new();
        ranges.insert(smallest..largest + 1);
        for _ in 0..extra_blocks {
            let gap = buf.get_var()?;
            let top = smallest.checked_sub(gap + 2).ok_or(IterErr::Malformed)?;
            let len = buf.get_var()?;
            smallest = top.checked_sub(len).ok_or(IterErr::Malformed)?;
            ranges.insert(smallest..top + 1);
        }
        if ecn {
            // ECN counts are parsed and ignored
            for _ in 0..3 {
                buf.get_var()?;
            }
        }
        Ok(Self { delay, ranges })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Stream {
    pub(crate) id: StreamId,
    pub(crate) offset: u64,
    pub(crate) fin: bool,
    pub(crate) data: Bytes,
}

impl FrameStruct for Stream {
    const SIZE_BOUND: usize = 1 + 8 + 8 + 8;
}

/// Metadata from a stream frame, retained for retransmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StreamMeta {
    pub(crate) id: StreamId,
    pub(crate) offsets: Range<u64>,
    pub(crate) fin: bool,
}

impl StreamMeta {
    pub(crate) fn encode<W: BufMut>(&self, length: bool, out: &mut W) {
        let mut ty = *STREAM_TYS.start();
        if self.offsets.start != 0 {
            ty |= 0x04;
        }
        if length {
            ty |= 0x02;
        }
        if self.fin {
            ty |= 0x01;
        }
        out.write_var(ty);
        out.write(self.id);
        if self.offsets.start != 0 {
            out.write_var(self.offsets.start);
        }
        if length {
            out.write_var(self.offsets.end - self.offsets.start);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Crypto {
    pub(crate) offset: u64,
    pub(crate) data: Bytes,
}

impl Crypto {
    pub(crate) const SIZE_BOUND: usize = 17;

    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::CRYPTO);
        out.write_var(self.offset);
        out.write_var(self.data.len() as u64);
        out.put_slice(&self.data);
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct ResetStream {
    pub(crate) id: StreamId,
    pub(crate) error_code: VarInt,
    pub(crate) final_offset: VarInt,
}

impl FrameStruct for ResetStream {
    const SIZE_BOUND: usize = 1 + 8 + 8 + 8;
}

impl ResetStream {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::RESET_STREAM);
        out.write(self.id);
        out.write(self.error_code);
        out.write(self.final_offset);
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct StopSending {
    pub(crate) id: StreamId,
    pub(crate) error_code: VarInt,
}

impl FrameStruct for StopSending {
    const SIZE_BOUND: usize = 1 + 8 + 8;
}

impl StopSending {
    pub(crate) fn encode<W: BufMut>(&self, out: &mut W) {
        out.write(FrameType::STOP_SENDING);
        out.write(self.id);
        out.write(self.error_code);
    }
}

/// Parses the frames of a decrypted packet payload in order
pub(crate) struct Iter {
    bytes: Bytes,
    last_ty: Option<FrameType>,
}

impl Iter {
    pub(crate) fn new(payload: Bytes) -> Self {
        Self {
            bytes: payload,
            last_ty: None,
        }
    }

    fn take_len(&mut self) -> Result<Bytes, UnexpectedEnd> {
        let len = self.bytes.get_var()?;
        if len > self.bytes.remaining() as u64 {
            return Err(UnexpectedEnd);
        }
        Ok(self.bytes.split_to(len as usize))
    }

    fn try_next(&mut self) -> Result<Frame, IterErr> {
        let ty = self.bytes.get::<FrameType>()?;
        self.last_ty = Some(ty);
        Ok(match ty {
            FrameType::PADDING => Frame::Padding,
            FrameType::PING => Frame::Ping,
            FrameType::ACK | FrameType::ACK_ECN => {
                Frame::Ack(Ack::decode(&mut self.bytes, ty == FrameType::ACK_ECN)?)
            }
            FrameType::RESET_STREAM => Frame::ResetStream(ResetStream {
                id: self.bytes.get()?,
                error_code: self.bytes.get()?,
                final_offset: self.bytes.get()?,
            }),
            FrameType::STOP_SENDING => Frame::StopSending(StopSending {
                id: self.bytes.get()?,
                error_code: self.bytes.get()?,
            }),
            FrameType::CRYPTO => Frame::Crypto(Crypto {
                offset: self.bytes.get_var()?,
                data: self.take_len()?,
            }),
            FrameType::MAX_DATA => Frame::MaxData(self.bytes.get()?),
            FrameType::MAX_STREAM_DATA => Frame::MaxStreamData {
                id: self.bytes.get()?,
                offset: self.bytes.get_var()?,
            },
            FrameType::MAX_STREAMS_BIDI => Frame::MaxStreams {
                dir: Dir::Bi,
                count: self.bytes.get_var()?,
            },
            FrameType::MAX_STREAMS_UNI => Frame::MaxStreams {
                dir: Dir::Uni,
                count: self.bytes.get_var()?,
            },
            FrameType::DATA_BLOCKED => Frame::DataBlocked {
                offset: self.bytes.get_var()?,
            },
            FrameType::STREAM_DATA_BLOCKED => Frame::StreamDataBlocked {
                id: self.bytes.get()?,
                offset: self.bytes.get_var()?,
            },
            FrameType::STREAMS_BLOCKED_BIDI => Frame::StreamsBlocked {
                dir: Dir::Bi,
                limit: self.bytes.get_var()?,
            },
            FrameType::STREAMS_BLOCKED_UNI => Frame::StreamsBlocked {
                dir: Dir::Uni,
                limit: self.bytes.get_var()?,
            },
            FrameType::CONNECTION_CLOSE => Frame::Close(Close::Connection(ConnectionClose {
                error_code: self.bytes.get()?,
                frame_type: {
                    let x = self.bytes.get_var()?;
                    if x == 0 {
                        None
                    } else {
                        Some(FrameType(x))
                    }
                },
                reason: self.take_len()?,
            })),
            FrameType::APPLICATION_CLOSE => Frame::Close(Close::Application(ApplicationClose {
                error_code: self.bytes.get()?,
                reason: self.take_len()?,
            })),
            FrameType::HANDSHAKE_DONE => Frame::HandshakeDone,
            _ => match ty.stream() {
                Some(s) => Frame::Stream(Stream {
                    id: self.bytes.get()?,
                    offset: if s.off() { self.bytes.get_var()? } else { 0 },
                    fin: s.fin(),
                    data: if s.len() {
                        self.take_len()?
                    } else {
                        mem::take(&mut self.bytes)
                    },
                }),
                None => return Err(IterErr::InvalidFrameId),
            },
        })
    }
}

impl Iterator for Iter {
    type Item = Result<Frame, InvalidFrame>;
    fn next(&mut self) -> Option<Self::Item> {
        if !self.bytes.has_remaining() {
            return None;
        }
        match self.try_next() {
            Ok(x) => Some(Ok(x)),
            Err(e) => {
                // Corrupt frame, skip it and everything that follows
                self.bytes.clear();
                Some(Err(InvalidFrame {
                    ty: self.last_ty,
                    reason: e.reason(),
                }))
            }
        }
    }
}

/// A frame that could not be parsed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason} ({ty:?})")]
pub struct InvalidFrame {
    pub(crate) ty: Option<FrameType>,
    pub(crate) reason: &'static str,
}

impl InvalidFrame {
    pub(crate) fn empty_payload() -> Self {
        Self {
            ty: None,
            reason: "packet payload is empty",
        }
    }
}

impl From<InvalidFrame> for TransportError {
    fn from(err: InvalidFrame) -> Self {
        let mut te = if err.ty.is_none() {
            Self::PROTOCOL_VIOLATION(err.reason)
        } else {
            Self::FRAME_ENCODING_ERROR(err.reason)
        };
        te.frame = err.ty;
        te
    }
}

#[derive(Debug)]
enum IterErr {
    UnexpectedEnd,
    InvalidFrameId,
    Malformed,
}

impl IterErr {
    fn reason(&self) -> &'static str {
        use self::IterErr::*;
        match *self {
            UnexpectedEnd => "unexpected end",
            InvalidFrameId => "invalid frame ID",
            Malformed => "malformed",
        }
    }
}

impl From<UnexpectedEnd> for IterErr {
    fn from(_: UnexpectedEnd) -> Self {
        Self::UnexpectedEnd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Side;
    use assert_matches::assert_matches;

    fn frames(buf: Vec<u8>) -> Vec<Frame> {
        Iter::new(Bytes::from(buf))
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn ack_coding() {
        let mut ranges = RangeSet::new();
        ranges.insert(1..3);
        ranges.insert(5..6);
        ranges.insert(9..12);
        let mut buf = Vec::new();
        Ack::encode(42, &ranges, &mut buf);
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 1);
        match &decoded[0] {
            Frame::Ack(ack) => {
                assert_eq!(ack.delay, 42);
                assert_eq!(ack.largest(), 11);
                assert_eq!(ack.ranges, ranges);
            }
            x => panic!("incorrect frame {x:?}"),
        }
    }

    #[test]
    fn ack_underflow_rejected() {
        // largest 2, first block 5
        let buf = vec![0x02, 0x02, 0x00, 0x00, 0x05];
        let err = Iter::new(Bytes::from(buf)).next().unwrap().unwrap_err();
        assert_eq!(err.ty, Some(FrameType::ACK));
        assert_eq!(err.reason, "malformed");
    }

    #[test]
    fn stream_and_padding() {
        let mut buf = Vec::new();
        let id = StreamId::new(Side::Client, Dir::Bi, 1);
        Frame::Stream(Stream {
            id,
            offset: 7,
            fin: true,
            data: Bytes::from_static(b"hello"),
        })
        .encode(&mut buf);
        Frame::Padding.encode(&mut buf);
        Frame::Padding.encode(&mut buf);
        let decoded = frames(buf);
        assert_eq!(decoded.len(), 3);
        assert_matches!(&decoded[0], Frame::Stream(s) if s.id == id && s.offset == 7 && s.fin && &s.data[..] == b"hello");
        assert_matches!(decoded[1], Frame::Padding);
    }

    #[test]
    fn close_reason_truncated() {
        let close = ConnectionClose {
            error_code: TransportErrorCode::PROTOCOL_VIOLATION,
            frame_type: Some(FrameType::STREAM_DATA_BLOCKED),
            reason: Bytes::from_static(b"a very long reason string"),
        };
        let mut buf = Vec::new();
        close.encode(&mut buf, ConnectionClose::SIZE_BOUND + 6);
        match frames(buf).pop() {
            Some(Frame::Close(Close::Connection(x))) => {
                assert_eq!(x.error_code, TransportErrorCode::PROTOCOL_VIOLATION);
                assert_eq!(&x.reason[..], b"a very");
            }
            x => panic!("incorrect frame {x:?}"),
        }
    }

    #[test]
    fn unknown_frame_type() {
        let err = Iter::new(Bytes::from_static(&[0x01, 0x21]))
            .nth(1)
            .unwrap()
            .unwrap_err();
        assert_eq!(err.reason, "invalid frame ID");
        let te = TransportError::from(err);
        assert_eq!(te.code, TransportErrorCode::FRAME_ENCODING_ERROR);
    }

    #[test]
    fn truncated_crypto() {
        let mut buf = Vec::new();
        Crypto {
            offset: 0,
            data: Bytes::from_static(&[1, 2, 3, 4]),
        }
        .encode(&mut buf);
        buf.truncate(buf.len() - 1);
        let err = Iter::new(Bytes::from(buf)).next().unwrap().unwrap_err();
        assert_eq!(err.ty, Some(FrameType::CRYPTO));
    }
}
