//! HTTP CONNECT tunnels through a proxy.

use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode, Uri};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tracing::{debug, trace};

use super::protocol::http1::decode::HeadParser;
use super::protocol::http1::encode::{self, Framing, RequestTarget};
use super::transport::TransportStream;
use crate::client::{Error, ProtocolError};

const MAX_TUNNEL_HEAD: usize = 16 * 1024;

/// Ask the proxy at the other end of `stream` to open a tunnel to
/// `destination`'s authority. `headers` are sent on the CONNECT request,
/// e.g. `Proxy-Authorization`.
///
/// On success the stream carries raw bytes to the destination.
#[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(%destination), level = "debug"))]
pub(crate) async fn establish(
    mut stream: TransportStream,
    destination: &Uri,
    headers: &http::HeaderMap,
) -> Result<TransportStream, Error> {
    let mut request = http::Request::builder()
        .method(Method::CONNECT)
        .uri(destination.clone())
        .body(())
        .map_err(|error| Error::InvalidRequest(error.to_string()))?;
    request.headers_mut().extend(headers.clone());
    let (parts, ()) = request.into_parts();

    let head = encode::request_head(&parts, RequestTarget::Authority, Framing::None)?;
    stream.write_all(&head).await.map_err(Error::io)?;
    stream.flush().await.map_err(Error::io)?;
    trace!("CONNECT sent");

    let mut parser = HeadParser::new(MAX_TUNNEL_HEAD);
    let mut buf = BytesMut::with_capacity(1024);
    let response = loop {
        buf.clear();
        let n = stream.read_buf(&mut buf).await.map_err(Error::io)?;
        if n == 0 {
            return Err(Error::Closed);
        }
        let mut data: Bytes = buf.split().freeze();
        if let Some(head) = parser.parse(&mut data)? {
            if !data.is_empty() {
                // The proxy spoke before the tunnel was ours to use.
                return Err(ProtocolError::Upgrade("data after CONNECT response").into());
            }
            break head;
        }
    };

    match response.status {
        status if status.is_success() => {
            debug!(%status, "tunnel established");
            Ok(stream)
        }
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => Err(Error::ProxyAuthenticationRequired),
        status => {
            debug!(%status, "tunnel refused");
            Err(Error::TunnelFailed(status))
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::DuplexStream;

    use super::*;
    use crate::info::ConnectionInfo;

    fn stream() -> (TransportStream, DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        (TransportStream::new(client, ConnectionInfo::default()), server)
    }

    async fn proxy(mut server: DuplexStream, reply: &'static [u8]) -> (String, DuplexStream) {
        let mut request = Vec::new();
        let mut byte = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            server.read_exact(&mut byte).await.unwrap();
            request.push(byte[0]);
        }
        server.write_all(reply).await.unwrap();
        (String::from_utf8(request).unwrap(), server)
    }

    #[tokio::test]
    async fn tunnel_established() {
        let (client, server) = stream();
        let proxy = tokio::spawn(proxy(server, b"HTTP/1.1 200 Connection established\r\n\r\n"));

        let mut headers = http::HeaderMap::new();
        headers.insert("proxy-authorization", "Basic Zm9vOmJhcg==".parse().unwrap());
        let uri: Uri = "https://example.com/".parse().unwrap();
        let mut tunnel = establish(client, &uri, &headers).await.unwrap();

        let (request, mut server) = proxy.await.unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("host: example.com\r\n"));
        assert!(request.contains("proxy-authorization: Basic Zm9vOmJhcg==\r\n"));

        tunnel.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn proxy_auth_required() {
        let (client, server) = stream();
        tokio::spawn(proxy(
            server,
            b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n",
        ));
        let uri: Uri = "https://example.com/".parse().unwrap();
        let error = establish(client, &uri, &http::HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::ProxyAuthenticationRequired));
    }

    #[tokio::test]
    async fn tunnel_refused() {
        let (client, server) = stream();
        tokio::spawn(proxy(server, b"HTTP/1.1 502 Bad Gateway\r\n\r\n"));
        let uri: Uri = "https://example.com/".parse().unwrap();
        let error = establish(client, &uri, &http::HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::TunnelFailed(StatusCode::BAD_GATEWAY)));
    }
}
