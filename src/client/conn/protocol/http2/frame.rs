//! HTTP/2 frame codec (RFC 7540 Section 4 and 6).
//!
//! Every frame starts with a nine byte header: a 24 bit payload length, the
//! frame type, flags, and a 31 bit stream identifier.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::settings::Settings;

/// The client connection preface.
pub(crate) const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub(crate) const HEADER_LEN: usize = 9;

/// Largest payload allowed before SETTINGS_MAX_FRAME_SIZE is negotiated.
pub(crate) const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Upper bound for SETTINGS_MAX_FRAME_SIZE.
pub(crate) const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

/// Largest flow-control window and largest stream id.
pub(crate) const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

mod kind {
    pub(super) const DATA: u8 = 0x0;
    pub(super) const HEADERS: u8 = 0x1;
    pub(super) const PRIORITY: u8 = 0x2;
    pub(super) const RST_STREAM: u8 = 0x3;
    pub(super) const SETTINGS: u8 = 0x4;
    pub(super) const PUSH_PROMISE: u8 = 0x5;
    pub(super) const PING: u8 = 0x6;
    pub(super) const GOAWAY: u8 = 0x7;
    pub(super) const WINDOW_UPDATE: u8 = 0x8;
    pub(super) const CONTINUATION: u8 = 0x9;
}

mod flag {
    pub(super) const END_STREAM: u8 = 0x1;
    pub(super) const ACK: u8 = 0x1;
    pub(super) const END_HEADERS: u8 = 0x4;
    pub(super) const PADDED: u8 = 0x8;
    pub(super) const PRIORITY: u8 = 0x20;
}

/// An HTTP/2 error code (RFC 7540 Section 7).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(u32);

impl ErrorCode {
    /// Graceful shutdown.
    pub const NO_ERROR: ErrorCode = ErrorCode(0x0);
    /// Unspecific protocol error.
    pub const PROTOCOL_ERROR: ErrorCode = ErrorCode(0x1);
    /// Unexpected internal error.
    pub const INTERNAL_ERROR: ErrorCode = ErrorCode(0x2);
    /// Flow-control limits violated.
    pub const FLOW_CONTROL_ERROR: ErrorCode = ErrorCode(0x3);
    /// SETTINGS not acknowledged in time.
    pub const SETTINGS_TIMEOUT: ErrorCode = ErrorCode(0x4);
    /// Frame received for a half-closed stream.
    pub const STREAM_CLOSED: ErrorCode = ErrorCode(0x5);
    /// Frame size incorrect.
    pub const FRAME_SIZE_ERROR: ErrorCode = ErrorCode(0x6);
    /// Stream not processed.
    pub const REFUSED_STREAM: ErrorCode = ErrorCode(0x7);
    /// Stream cancelled.
    pub const CANCEL: ErrorCode = ErrorCode(0x8);
    /// Compression state not updated.
    pub const COMPRESSION_ERROR: ErrorCode = ErrorCode(0x9);
    /// TCP connection error for CONNECT.
    pub const CONNECT_ERROR: ErrorCode = ErrorCode(0xa);
    /// Processing capacity exceeded.
    pub const ENHANCE_YOUR_CALM: ErrorCode = ErrorCode(0xb);
    /// Negotiated TLS parameters not acceptable.
    pub const INADEQUATE_SECURITY: ErrorCode = ErrorCode(0xc);
    /// Use HTTP/1.1 for the request.
    pub const HTTP_1_1_REQUIRED: ErrorCode = ErrorCode(0xd);

    /// The raw code as sent on the wire.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            0x0 => "NO_ERROR",
            0x1 => "PROTOCOL_ERROR",
            0x2 => "INTERNAL_ERROR",
            0x3 => "FLOW_CONTROL_ERROR",
            0x4 => "SETTINGS_TIMEOUT",
            0x5 => "STREAM_CLOSED",
            0x6 => "FRAME_SIZE_ERROR",
            0x7 => "REFUSED_STREAM",
            0x8 => "CANCEL",
            0x9 => "COMPRESSION_ERROR",
            0xa => "CONNECT_ERROR",
            0xb => "ENHANCE_YOUR_CALM",
            0xc => "INADEQUATE_SECURITY",
            0xd => "HTTP_1_1_REQUIRED",
            _ => return None,
        })
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        ErrorCode(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "unknown error code {:#x}", self.0),
        }
    }
}

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A frame that could not be decoded.
///
/// A `stream_id` of zero means the whole connection is unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameError {
    pub(crate) stream_id: u32,
    pub(crate) code: ErrorCode,
    pub(crate) reason: &'static str,
    /// Bytes of a rejected DATA frame, still owed to the connection window.
    pub(crate) flow_len: u32,
}

impl FrameError {
    pub(crate) fn connection(code: ErrorCode, reason: &'static str) -> Self {
        Self {
            stream_id: 0,
            code,
            reason,
            flow_len: 0,
        }
    }

    fn stream(stream_id: u32, code: ErrorCode, reason: &'static str) -> Self {
        Self {
            stream_id,
            code,
            reason,
            flow_len: 0,
        }
    }

    pub(crate) fn is_connection_error(&self) -> bool {
        self.stream_id == 0
    }
}

#[derive(Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        /// Payload length including padding, which counts against the window.
        flow_len: u32,
    },
    Headers {
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
    },
    Priority {
        stream_id: u32,
    },
    Reset {
        stream_id: u32,
        code: ErrorCode,
    },
    Settings {
        ack: bool,
        settings: Settings,
    },
    PushPromise {
        stream_id: u32,
        promised_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        code: ErrorCode,
        debug: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    Unknown {
        kind: u8,
        stream_id: u32,
    },
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Data {
                stream_id,
                data,
                end_stream,
                ..
            } => f
                .debug_struct("Data")
                .field("stream_id", stream_id)
                .field("len", &data.len())
                .field("end_stream", end_stream)
                .finish(),
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
            } => f
                .debug_struct("Headers")
                .field("stream_id", stream_id)
                .field("len", &block.len())
                .field("end_stream", end_stream)
                .field("end_headers", end_headers)
                .finish(),
            Frame::Priority { stream_id } => {
                f.debug_struct("Priority").field("stream_id", stream_id).finish()
            }
            Frame::Reset { stream_id, code } => f
                .debug_struct("Reset")
                .field("stream_id", stream_id)
                .field("code", code)
                .finish(),
            Frame::Settings { ack, settings } => f
                .debug_struct("Settings")
                .field("ack", ack)
                .field("settings", settings)
                .finish(),
            Frame::PushPromise {
                stream_id,
                promised_id,
                end_headers,
                ..
            } => f
                .debug_struct("PushPromise")
                .field("stream_id", stream_id)
                .field("promised_id", promised_id)
                .field("end_headers", end_headers)
                .finish(),
            Frame::Ping { ack, .. } => f.debug_struct("Ping").field("ack", ack).finish(),
            Frame::GoAway {
                last_stream_id,
                code,
                ..
            } => f
                .debug_struct("GoAway")
                .field("last_stream_id", last_stream_id)
                .field("code", code)
                .finish(),
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => f
                .debug_struct("WindowUpdate")
                .field("stream_id", stream_id)
                .field("increment", increment)
                .finish(),
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => f
                .debug_struct("Continuation")
                .field("stream_id", stream_id)
                .field("len", &block.len())
                .field("end_headers", end_headers)
                .finish(),
            Frame::Unknown { kind, stream_id } => f
                .debug_struct("Unknown")
                .field("kind", kind)
                .field("stream_id", stream_id)
                .finish(),
        }
    }
}

fn put_header(dst: &mut BytesMut, len: usize, kind: u8, flags: u8, stream_id: u32) {
    dst.reserve(HEADER_LEN + len);
    dst.put_uint(len as u64, 3);
    dst.put_u8(kind);
    dst.put_u8(flags);
    dst.put_u32(stream_id & MAX_WINDOW_SIZE);
}

impl Frame {
    pub(crate) fn data(stream_id: u32, data: Bytes, end_stream: bool) -> Self {
        let flow_len = data.len() as u32;
        Frame::Data {
            stream_id,
            data,
            end_stream,
            flow_len,
        }
    }

    /// Append the wire form of this frame to `dst`.
    ///
    /// Frames are never padded on the way out.
    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::Data {
                stream_id,
                data,
                end_stream,
                ..
            } => {
                let flags = if *end_stream { flag::END_STREAM } else { 0 };
                put_header(dst, data.len(), kind::DATA, flags, *stream_id);
                dst.extend_from_slice(data);
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
            } => {
                let mut flags = 0;
                if *end_stream {
                    flags |= flag::END_STREAM;
                }
                if *end_headers {
                    flags |= flag::END_HEADERS;
                }
                put_header(dst, block.len(), kind::HEADERS, flags, *stream_id);
                dst.extend_from_slice(block);
            }
            Frame::Priority { stream_id } => {
                put_header(dst, 5, kind::PRIORITY, 0, *stream_id);
                dst.put_u32(0);
                dst.put_u8(15);
            }
            Frame::Reset { stream_id, code } => {
                put_header(dst, 4, kind::RST_STREAM, 0, *stream_id);
                dst.put_u32(code.as_u32());
            }
            Frame::Settings { ack, settings } => {
                if *ack {
                    put_header(dst, 0, kind::SETTINGS, flag::ACK, 0);
                } else {
                    put_header(dst, settings.encoded_len(), kind::SETTINGS, 0, 0);
                    settings.encode(dst);
                }
            }
            Frame::PushPromise {
                stream_id,
                promised_id,
                block,
                end_headers,
            } => {
                let flags = if *end_headers { flag::END_HEADERS } else { 0 };
                put_header(dst, block.len() + 4, kind::PUSH_PROMISE, flags, *stream_id);
                dst.put_u32(promised_id & MAX_WINDOW_SIZE);
                dst.extend_from_slice(block);
            }
            Frame::Ping { ack, payload } => {
                let flags = if *ack { flag::ACK } else { 0 };
                put_header(dst, 8, kind::PING, flags, 0);
                dst.extend_from_slice(payload);
            }
            Frame::GoAway {
                last_stream_id,
                code,
                debug,
            } => {
                put_header(dst, 8 + debug.len(), kind::GOAWAY, 0, 0);
                dst.put_u32(last_stream_id & MAX_WINDOW_SIZE);
                dst.put_u32(code.as_u32());
                dst.extend_from_slice(debug);
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                put_header(dst, 4, kind::WINDOW_UPDATE, 0, *stream_id);
                dst.put_u32(increment & MAX_WINDOW_SIZE);
            }
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => {
                let flags = if *end_headers { flag::END_HEADERS } else { 0 };
                put_header(dst, block.len(), kind::CONTINUATION, flags, *stream_id);
                dst.extend_from_slice(block);
            }
            Frame::Unknown { .. } => {}
        }
    }

    pub(crate) fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::new();
        self.encode(&mut dst);
        dst.freeze()
    }
}

/// Remove padding from a frame payload that has the PADDED flag.
///
/// Errors are connection errors; DATA narrows them to its stream.
fn strip_padding(mut payload: Bytes, flags: u8) -> Result<Bytes, FrameError> {
    if flags & flag::PADDED == 0 {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(FrameError::connection(
            ErrorCode::FRAME_SIZE_ERROR,
            "padded frame without pad length",
        ));
    }
    let pad = payload.get_u8() as usize;
    if pad > payload.len() {
        return Err(FrameError::connection(
            ErrorCode::PROTOCOL_ERROR,
            "padding exceeds payload",
        ));
    }
    payload.truncate(payload.len() - pad);
    Ok(payload)
}

/// Incremental frame parser over a receive buffer.
#[derive(Debug)]
pub(crate) struct FrameDecoder {
    buffer: BytesMut,
    max_frame_size: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl FrameDecoder {
    /// The largest payload we accept, as advertised in our SETTINGS.
    pub(crate) fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub(crate) fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Take the next complete frame, if one is buffered.
    ///
    /// A stream-level error consumes the offending frame so parsing can
    /// continue. After a connection-level error the decoder is unusable.
    pub(crate) fn next_frame(&mut self) -> Option<Result<Frame, FrameError>> {
        if self.buffer.len() < HEADER_LEN {
            return None;
        }

        let len = ((self.buffer[0] as usize) << 16)
            | ((self.buffer[1] as usize) << 8)
            | self.buffer[2] as usize;

        if len > self.max_frame_size as usize {
            return Some(Err(FrameError::connection(
                ErrorCode::FRAME_SIZE_ERROR,
                "frame larger than SETTINGS_MAX_FRAME_SIZE",
            )));
        }
        if self.buffer.len() < HEADER_LEN + len {
            return None;
        }

        let mut head = self.buffer.split_to(HEADER_LEN);
        let payload = self.buffer.split_to(len).freeze();
        head.advance(3);
        let kind = head.get_u8();
        let flags = head.get_u8();
        let stream_id = head.get_u32() & MAX_WINDOW_SIZE;

        Some(parse(kind, flags, stream_id, payload))
    }
}

fn require_stream(stream_id: u32, reason: &'static str) -> Result<(), FrameError> {
    if stream_id == 0 {
        return Err(FrameError::connection(ErrorCode::PROTOCOL_ERROR, reason));
    }
    Ok(())
}

fn require_connection(stream_id: u32, reason: &'static str) -> Result<(), FrameError> {
    if stream_id != 0 {
        return Err(FrameError::connection(ErrorCode::PROTOCOL_ERROR, reason));
    }
    Ok(())
}

fn parse(kind: u8, flags: u8, stream_id: u32, mut payload: Bytes) -> Result<Frame, FrameError> {
    match kind {
        kind::DATA => {
            require_stream(stream_id, "DATA on stream 0")?;
            let flow_len = payload.len() as u32;
            let data = strip_padding(payload, flags).map_err(|error| FrameError {
                stream_id,
                flow_len,
                ..error
            })?;
            Ok(Frame::Data {
                stream_id,
                data,
                end_stream: flags & flag::END_STREAM != 0,
                flow_len,
            })
        }
        kind::HEADERS => {
            require_stream(stream_id, "HEADERS on stream 0")?;
            let mut block = strip_padding(payload, flags)?;
            if flags & flag::PRIORITY != 0 {
                if block.len() < 5 {
                    return Err(FrameError::connection(
                        ErrorCode::FRAME_SIZE_ERROR,
                        "HEADERS priority fields truncated",
                    ));
                }
                block.advance(5);
            }
            Ok(Frame::Headers {
                stream_id,
                block,
                end_stream: flags & flag::END_STREAM != 0,
                end_headers: flags & flag::END_HEADERS != 0,
            })
        }
        kind::PRIORITY => {
            require_stream(stream_id, "PRIORITY on stream 0")?;
            if payload.len() != 5 {
                return Err(FrameError::stream(
                    stream_id,
                    ErrorCode::FRAME_SIZE_ERROR,
                    "PRIORITY length is not 5",
                ));
            }
            Ok(Frame::Priority { stream_id })
        }
        kind::RST_STREAM => {
            require_stream(stream_id, "RST_STREAM on stream 0")?;
            if payload.len() != 4 {
                return Err(FrameError::stream(
                    stream_id,
                    ErrorCode::FRAME_SIZE_ERROR,
                    "RST_STREAM length is not 4",
                ));
            }
            Ok(Frame::Reset {
                stream_id,
                code: ErrorCode(payload.get_u32()),
            })
        }
        kind::SETTINGS => {
            require_connection(stream_id, "SETTINGS on a stream")?;
            if flags & flag::ACK != 0 {
                if !payload.is_empty() {
                    return Err(FrameError::connection(
                        ErrorCode::FRAME_SIZE_ERROR,
                        "SETTINGS ack with payload",
                    ));
                }
                return Ok(Frame::Settings {
                    ack: true,
                    settings: Settings::default(),
                });
            }
            let settings = Settings::decode(&payload)?;
            Ok(Frame::Settings {
                ack: false,
                settings,
            })
        }
        kind::PUSH_PROMISE => {
            require_stream(stream_id, "PUSH_PROMISE on stream 0")?;
            let mut block = strip_padding(payload, flags)?;
            if block.len() < 4 {
                return Err(FrameError::connection(
                    ErrorCode::FRAME_SIZE_ERROR,
                    "PUSH_PROMISE truncated",
                ));
            }
            let promised_id = block.get_u32() & MAX_WINDOW_SIZE;
            Ok(Frame::PushPromise {
                stream_id,
                promised_id,
                block,
                end_headers: flags & flag::END_HEADERS != 0,
            })
        }
        kind::PING => {
            require_connection(stream_id, "PING on a stream")?;
            if payload.len() != 8 {
                return Err(FrameError::connection(
                    ErrorCode::FRAME_SIZE_ERROR,
                    "PING length is not 8",
                ));
            }
            let mut data = [0u8; 8];
            payload.copy_to_slice(&mut data);
            Ok(Frame::Ping {
                ack: flags & flag::ACK != 0,
                payload: data,
            })
        }
        kind::GOAWAY => {
            require_connection(stream_id, "GOAWAY on a stream")?;
            if payload.len() < 8 {
                return Err(FrameError::connection(
                    ErrorCode::FRAME_SIZE_ERROR,
                    "GOAWAY truncated",
                ));
            }
            let last_stream_id = payload.get_u32() & MAX_WINDOW_SIZE;
            let code = ErrorCode(payload.get_u32());
            Ok(Frame::GoAway {
                last_stream_id,
                code,
                debug: payload,
            })
        }
        kind::WINDOW_UPDATE => {
            if payload.len() != 4 {
                // Fatal only for the connection window.
                return Err(FrameError {
                    stream_id,
                    ..FrameError::connection(
                        ErrorCode::FRAME_SIZE_ERROR,
                        "WINDOW_UPDATE length is not 4",
                    )
                });
            }
            // Zero increments are left for the connection to judge.
            Ok(Frame::WindowUpdate {
                stream_id,
                increment: payload.get_u32() & MAX_WINDOW_SIZE,
            })
        }
        kind::CONTINUATION => {
            require_stream(stream_id, "CONTINUATION on stream 0")?;
            Ok(Frame::Continuation {
                stream_id,
                block: payload,
                end_headers: flags & flag::END_HEADERS != 0,
            })
        }
        kind => Ok(Frame::Unknown { kind, stream_id }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(frame: &Frame) -> Frame {
        let mut decoder = FrameDecoder::default();
        decoder.extend(&frame.to_bytes());
        decoder.next_frame().unwrap().unwrap()
    }

    #[test]
    fn preface_is_24_bytes() {
        assert_eq!(PREFACE.len(), 24);
    }

    #[test]
    fn data_frame_wire_format() {
        let frame = Frame::data(1, Bytes::from_static(b"hello"), true);
        assert_eq!(
            &frame.to_bytes()[..],
            &[0, 0, 5, 0, 1, 0, 0, 0, 1, b'h', b'e', b'l', b'l', b'o']
        );
        assert_eq!(decode_one(&frame), frame);
    }

    #[test]
    fn control_frames_survive_the_codec() {
        let frames = [
            Frame::Reset {
                stream_id: 3,
                code: ErrorCode::CANCEL,
            },
            Frame::Ping {
                ack: true,
                payload: *b"12345678",
            },
            Frame::GoAway {
                last_stream_id: 7,
                code: ErrorCode::ENHANCE_YOUR_CALM,
                debug: Bytes::from_static(b"slow down"),
            },
            Frame::WindowUpdate {
                stream_id: 0,
                increment: 65_535,
            },
            Frame::PushPromise {
                stream_id: 1,
                promised_id: 2,
                block: Bytes::from_static(b"\x82"),
                end_headers: true,
            },
        ];
        for frame in frames {
            assert_eq!(decode_one(&frame), frame);
        }
    }

    #[test]
    fn padding_is_stripped_but_counted() {
        // DATA, PADDED, stream 1: pad length 2, "hi", two pad bytes.
        let wire = [0, 0, 5, 0, 0x8, 0, 0, 0, 1, 2, b'h', b'i', 0, 0];
        let mut decoder = FrameDecoder::default();
        decoder.extend(&wire);
        match decoder.next_frame().unwrap().unwrap() {
            Frame::Data { data, flow_len, .. } => {
                assert_eq!(&data[..], b"hi");
                assert_eq!(flow_len, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn oversized_data_padding_only_affects_its_stream() {
        let wire = [0, 0, 2, 0, 0x8, 0, 0, 0, 1, 9, b'h'];
        let mut decoder = FrameDecoder::default();
        decoder.extend(&wire);
        decoder.extend(&Frame::data(3, Bytes::from_static(b"ok"), true).to_bytes());

        let error = decoder.next_frame().unwrap().unwrap_err();
        assert!(!error.is_connection_error());
        assert_eq!(error.stream_id, 1);
        assert_eq!(error.code, ErrorCode::PROTOCOL_ERROR);
        assert_eq!(error.flow_len, 2);
        assert!(matches!(
            decoder.next_frame().unwrap().unwrap(),
            Frame::Data { stream_id: 3, .. }
        ));
    }

    #[test]
    fn oversized_headers_padding_is_a_connection_error() {
        let wire = [0, 0, 2, 1, 0x8 | 0x4, 0, 0, 0, 1, 9, 0x88];
        let mut decoder = FrameDecoder::default();
        decoder.extend(&wire);
        let error = decoder.next_frame().unwrap().unwrap_err();
        assert!(error.is_connection_error());
    }

    #[test]
    fn short_reset_and_window_update_are_stream_errors() {
        let mut decoder = FrameDecoder::default();
        decoder.extend(&[0, 0, 2, 3, 0, 0, 0, 0, 1, 0, 0]);
        decoder.extend(&[0, 0, 3, 8, 0, 0, 0, 0, 3, 0, 0, 1]);
        decoder.extend(&[0, 0, 3, 8, 0, 0, 0, 0, 0, 0, 0, 1]);

        let error = decoder.next_frame().unwrap().unwrap_err();
        assert_eq!((error.stream_id, error.code), (1, ErrorCode::FRAME_SIZE_ERROR));
        let error = decoder.next_frame().unwrap().unwrap_err();
        assert_eq!((error.stream_id, error.code), (3, ErrorCode::FRAME_SIZE_ERROR));
        assert!(decoder.next_frame().unwrap().unwrap_err().is_connection_error());
    }

    #[test]
    fn partial_frames_wait() {
        let bytes = Frame::data(1, Bytes::from_static(b"abcdef"), false).to_bytes();
        let mut decoder = FrameDecoder::default();
        decoder.extend(&bytes[..4]);
        assert!(decoder.next_frame().is_none());
        decoder.extend(&bytes[4..10]);
        assert!(decoder.next_frame().is_none());
        decoder.extend(&bytes[10..]);
        assert!(decoder.next_frame().unwrap().is_ok());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut decoder = FrameDecoder::default();
        decoder.extend(&[0x00, 0x40, 0x01, 0, 0, 0, 0, 0, 1]);
        let error = decoder.next_frame().unwrap().unwrap_err();
        assert_eq!(error.code, ErrorCode::FRAME_SIZE_ERROR);
        assert!(error.is_connection_error());
    }

    #[test]
    fn bad_priority_frame_only_affects_its_stream() {
        let mut decoder = FrameDecoder::default();
        decoder.extend(&[0, 0, 1, 2, 0, 0, 0, 0, 5, 0]);
        decoder.extend(&Frame::data(1, Bytes::new(), true).to_bytes());

        let error = decoder.next_frame().unwrap().unwrap_err();
        assert_eq!(error.stream_id, 5);
        assert!(decoder.next_frame().unwrap().is_ok());
    }

    #[test]
    fn data_on_stream_zero_is_fatal() {
        let mut decoder = FrameDecoder::default();
        decoder.extend(&[0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(decoder
            .next_frame()
            .unwrap()
            .unwrap_err()
            .is_connection_error());
    }

    #[test]
    fn zero_window_update_decodes() {
        let frame = Frame::WindowUpdate {
            stream_id: 0,
            increment: 0,
        };
        assert_eq!(decode_one(&frame), frame);
    }

    #[test]
    fn unknown_frames_are_kept() {
        let mut decoder = FrameDecoder::default();
        decoder.extend(&[0, 0, 1, 0xfa, 0, 0, 0, 0, 3, 7]);
        assert_eq!(
            decoder.next_frame().unwrap().unwrap(),
            Frame::Unknown {
                kind: 0xfa,
                stream_id: 3
            }
        );
    }

    #[test]
    fn error_code_display() {
        assert_eq!(ErrorCode::REFUSED_STREAM.to_string(), "REFUSED_STREAM");
        assert_eq!(ErrorCode::from(0xff).to_string(), "unknown error code 0xff");
    }
}
