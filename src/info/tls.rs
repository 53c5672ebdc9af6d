//! Information about a TLS connection.

use crate::info::Protocol;

/// Information about a TLS connection, available once the handshake is done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConnectionInfo {
    /// The server name sent in the SNI extension.
    pub server_name: Option<String>,

    /// The application layer protocol negotiated for this connection.
    pub alpn: Option<Protocol>,
}

impl TlsConnectionInfo {
    #[cfg(feature = "tls")]
    pub(crate) fn client(client_info: &rustls::ClientConnection, server_name: &str) -> Self {
        let alpn = client_info
            .alpn_protocol()
            .and_then(|s| std::str::from_utf8(s).ok())
            .and_then(|s| s.parse().ok());

        Self {
            server_name: Some(server_name.to_owned()).filter(|s| !s.is_empty()),
            alpn,
        }
    }

    /// Build connection info for a client which negotiated `alpn`.
    pub fn new_client(alpn: Option<Protocol>) -> Self {
        Self {
            server_name: None,
            alpn,
        }
    }
}
