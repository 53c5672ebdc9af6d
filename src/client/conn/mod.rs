//! Client connection types.
//!
//! A client connection is composed of a transport, a tube, and a protocol, which each serve a
//! different purpose in the client connection lifecycle.
//!
//! ## Transport
//!
//! The transport is responsible for establishing a connection to a remote server. Transports
//! implement the [`Transport`] trait, effectively making them a service which accepts a URI and
//! returns a bidirectional [`TransportStream`].
//!
//! Two builtin transports are provided:
//! - [`TcpTransport`](transport::tcp::TcpTransport): Connects to a remote server over TCP/IP.
//!   This is the default transport, and what usually powers HTTP connections.
//! - [`DuplexTransport`](transport::duplex::DuplexTransport): Connects over an in-memory
//!   duplex stream, which can be used for testing or embedding.
//!
//! TLS and CONNECT tunnels are layered over whatever the transport returns.
//!
//! ## Tube
//!
//! Once established, a stream is handed to a tube: a reader task which only reads when the
//! protocol asks for bytes, and a writer task with an ordered and a priority lane.
//!
//! ## Protocol
//!
//! The protocol encodes requests and decodes responses over the tube. HTTP/1.1 connections
//! carry one exchange at a time and are pooled between exchanges; HTTP/2 connections
//! multiplex streams and are shared for as long as they stay open.

mod connection;
pub(crate) mod protocol;
mod proxy;
pub mod transport;
pub(crate) mod tube;
mod tunnel;

pub(crate) use self::connection::{Connector, ConnectorParts, HttpConnection, Route};
pub use self::connection::ConnectionKind;
pub use self::protocol::http1::Http1Config;
pub use self::protocol::http2::{
    ErrorCode, Http2Config, PushPromiseHandler, PushPromises, PushedResponse,
};
pub use self::protocol::HttpProtocol;
pub use self::proxy::{Proxy, ProxySelector};
pub(crate) use self::proxy::SharedProxySelector;
pub use self::transport::{Transport, TransportStream};
