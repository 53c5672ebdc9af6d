//! TLS for client connections, layered over any [`TransportStream`].
//!
//! The handshake runs after the transport (and any proxy tunnel) is
//! established, so the same connector secures direct and tunneled streams.

use std::io;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::ClientConfig as TlsClientConfig;

use super::TransportStream;
use crate::info::{Protocol, TlsConnectionInfo};

/// Performs client TLS handshakes, offering ALPN tokens for the HTTP
/// versions the client is allowed to use.
#[derive(Debug, Clone)]
pub struct TlsConnector {
    h2: Arc<TlsClientConfig>,
    http1: Arc<TlsClientConfig>,
}

impl TlsConnector {
    /// Create a connector from a base configuration. Any ALPN protocols it
    /// carries are replaced per handshake.
    pub fn new(config: TlsClientConfig) -> Self {
        let mut h2 = config.clone();
        h2.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

        let mut http1 = config;
        http1.alpn_protocols = vec![b"http/1.1".to_vec()];

        Self {
            h2: Arc::new(h2),
            http1: Arc::new(http1),
        }
    }

    /// Create a connector which trusts the platform's root certificates.
    pub fn native_roots() -> io::Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        let loaded = rustls_native_certs::load_native_certs();
        for error in &loaded.errors {
            tracing::warn!(%error, "failed to load a native certificate");
        }
        let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
        tracing::trace!(added, ignored, "native roots loaded");

        if roots.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no native root certificates found",
            ));
        }

        let config = TlsClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self::new(config))
    }

    /// Run the handshake over `stream`, verifying `host`.
    ///
    /// `offer_h2` controls whether `h2` is offered in ALPN.
    #[tracing::instrument(skip(self, stream), level = "debug")]
    pub async fn handshake(
        &self,
        stream: TransportStream,
        host: &str,
        offer_h2: bool,
    ) -> io::Result<TransportStream> {
        let config = if offer_h2 {
            self.h2.clone()
        } else {
            self.http1.clone()
        };

        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;

        let (io, mut info) = stream.into_parts();
        let tls = tokio_rustls::TlsConnector::from(config)
            .connect(server_name, io)
            .await?;

        let tls_info = TlsConnectionInfo::client(tls.get_ref().1, host);
        tracing::trace!(alpn = ?tls_info.alpn.as_ref().map(Protocol::to_string), "tls established");
        info.tls = Some(tls_info);

        Ok(TransportStream::new(tls, info))
    }
}
