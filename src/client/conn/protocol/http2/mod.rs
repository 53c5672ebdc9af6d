//! HTTP/2 client engine.
//!
//! [`Http2Connection`](connection::Http2Connection) reads frames off a tube
//! and routes them to [`Stream`](stream::Stream)s; streams send their own
//! HEADERS and DATA through the connection's send lock. Header blocks are
//! compressed with HPACK and both directions are flow controlled.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::BytesMut;
use http::HeaderValue;

pub(crate) mod connection;
mod frame;
mod headers;
mod hpack;
mod push;
pub(crate) mod registry;
mod settings;
pub(crate) mod stream;
mod window;

pub use self::frame::ErrorCode;
pub use self::push::{PushPromiseHandler, PushPromises, PushedResponse};

use self::frame::{DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE};
use self::settings::DEFAULT_INITIAL_WINDOW_SIZE;

/// HTTP/2 connection settings.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Http2Config {
    /// Receive window advertised for each stream.
    pub initial_stream_window_size: u32,

    /// Receive window for the connection as a whole.
    pub initial_connection_window_size: u32,

    /// Largest frame we accept.
    pub max_frame_size: u32,

    /// HPACK dynamic table size the peer's encoder may use.
    pub header_table_size: u32,

    /// How many pushed streams may be open at once. Zero disables push.
    pub max_concurrent_pushes: u32,

    /// Tolerate WINDOW_UPDATE frames with a zero increment instead of
    /// treating them as a protocol error.
    pub lenient_window_update: bool,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            initial_stream_window_size: 1 << 20,
            initial_connection_window_size: 1 << 24,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            header_table_size: hpack::DEFAULT_TABLE_SIZE as u32,
            max_concurrent_pushes: 0,
            lenient_window_update: true,
        }
    }
}

impl Http2Config {
    /// Clamp values the protocol does not allow.
    pub(crate) fn normalized(mut self) -> Self {
        self.max_frame_size = self
            .max_frame_size
            .clamp(DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE);
        self.initial_stream_window_size = self
            .initial_stream_window_size
            .min(frame::MAX_WINDOW_SIZE);
        self.initial_connection_window_size = self
            .initial_connection_window_size
            .clamp(DEFAULT_INITIAL_WINDOW_SIZE, frame::MAX_WINDOW_SIZE);
        self
    }

    /// The `HTTP2-Settings` header for an `Upgrade: h2c` request: our
    /// SETTINGS payload, base64url encoded without padding.
    pub(crate) fn upgrade_header(&self) -> HeaderValue {
        let settings = connection::Http2Connection::local_settings(self);
        let mut payload = BytesMut::with_capacity(settings.encoded_len());
        settings.encode(&mut payload);
        let encoded = URL_SAFE_NO_PAD.encode(&payload);
        HeaderValue::from_str(&encoded).unwrap_or_else(|_| HeaderValue::from_static(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrade_header_is_settings_payload() {
        let config = Http2Config {
            initial_stream_window_size: 65_535,
            ..Default::default()
        };
        let header = config.upgrade_header();
        let decoded = URL_SAFE_NO_PAD.decode(header.as_bytes()).unwrap();
        let settings = settings::Settings::decode(&decoded).unwrap();
        assert_eq!(settings.enable_push, Some(false));
        assert_eq!(settings.initial_window_size, Some(65_535));
        assert!(!header.as_bytes().contains(&b'='));
    }

    #[test]
    fn normalized_clamps_frame_size() {
        let config = Http2Config {
            max_frame_size: 10,
            initial_connection_window_size: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(
            config.initial_connection_window_size,
            DEFAULT_INITIAL_WINDOW_SIZE
        );
    }
}
