//! Sending one request and receiving its response.
//!
//! An [`Exchange`] is a single attempt: it finds a connection, hands the
//! request to the protocol engine for that connection and waits for the
//! final response head. [`MultiExchange`](multi::MultiExchange) strings
//! attempts together for retries and redirects.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http::header::{self, HeaderValue};
use http::{Method, StatusCode};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, Instrument as _};

use crate::body::{Body, Request, Response};
use crate::client::conn::protocol::http1::decode::ResponseHead;
use crate::client::conn::protocol::http1::encode::Framing;
use crate::client::conn::protocol::http1::exchange::{Home, Http1Exchange};
use crate::client::conn::protocol::http1::Http1Connection;
use crate::client::conn::protocol::http2::connection::Http2Connection;
use crate::client::conn::protocol::http2::stream::Stream;
use crate::client::conn::{Connector, HttpConnection, HttpProtocol, Route};
use crate::client::{Error, ProtocolError};

pub(crate) mod multi;

/// The protocol engine carrying an exchange.
#[derive(Debug, Clone)]
pub(crate) enum ExchangeImpl {
    Http1(Arc<Http1Exchange>),
    Http2(Arc<Stream>),
}

impl ExchangeImpl {
    fn cancel(&self, cause: Error) {
        match self {
            ExchangeImpl::Http1(exchange) => exchange.cancel(cause),
            ExchangeImpl::Http2(stream) => stream.cancel(cause),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    imp: Option<ExchangeImpl>,
    cause: Option<Error>,
}

/// One attempt at sending a request.
pub(crate) struct Exchange {
    connector: Connector,
    route: Route,
    version: HttpProtocol,
    slot: Mutex<Slot>,
    cancelled: watch::Sender<bool>,
    upgrading: AtomicBool,
    upgraded: AtomicBool,
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("route", &self.route.key)
            .field("version", &self.version)
            .field("upgrading", &self.upgrading.load(Ordering::Relaxed))
            .field("upgraded", &self.upgraded.load(Ordering::Relaxed))
            .finish()
    }
}

impl Exchange {
    pub(crate) fn new(connector: Connector, route: Route, version: HttpProtocol) -> Arc<Self> {
        Arc::new(Self {
            connector,
            route,
            version,
            slot: Mutex::new(Slot::default()),
            cancelled: watch::channel(false).0,
            upgrading: AtomicBool::new(false),
            upgraded: AtomicBool::new(false),
        })
    }

    /// Cancel the attempt. If no protocol engine is attached yet, the cause
    /// is kept and replayed onto it as soon as it is.
    pub(crate) fn cancel(&self, cause: Error) {
        let imp = {
            let mut slot = self.slot.lock();
            if slot.cause.is_none() {
                slot.cause = Some(cause.clone());
            }
            slot.imp.clone()
        };
        self.cancelled.send_replace(true);
        if let Some(imp) = imp {
            imp.cancel(cause);
        }
    }

    pub(crate) fn is_upgraded(&self) -> bool {
        self.upgraded.load(Ordering::Acquire)
    }

    fn cancel_cause(&self) -> Error {
        self.slot
            .lock()
            .cause
            .clone()
            .unwrap_or_else(|| Error::cancelled(None))
    }

    fn set_impl(&self, imp: ExchangeImpl) {
        let cause = {
            let mut slot = self.slot.lock();
            slot.imp = Some(imp.clone());
            slot.cause.clone()
        };
        if let Some(cause) = cause {
            trace!("replaying cancellation onto new exchange");
            imp.cancel(cause);
        }
    }

    /// Send `request` and wait for its final response head.
    ///
    /// `connect_deadline` bounds finding or establishing a connection.
    pub(crate) async fn response(
        self: &Arc<Self>,
        request: Request,
        connect_deadline: Option<Instant>,
    ) -> Result<Response, Error> {
        match self.connect(connect_deadline).await? {
            HttpConnection::Http1 {
                conn,
                home,
                upgrade,
                pooled,
            } => {
                trace!(conn = conn.id(), pooled, upgrade, "exchange over http/1.1");
                self.http1(conn, home, upgrade, request).await
            }
            HttpConnection::Http2(conn) => {
                trace!(conn = conn.id(), "exchange over http/2");
                self.http2(conn, request).await
            }
        }
    }

    async fn connect(&self, deadline: Option<Instant>) -> Result<HttpConnection, Error> {
        let mut cancelled = self.cancelled.subscribe();
        let connect = async {
            let connect = self.connector.get_connection(&self.route, self.version);
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, connect)
                    .await
                    .map_err(|_| Error::ConnectTimeout)?,
                None => connect.await,
            }
        };

        tokio::select! {
            result = connect => result,
            _ = cancelled.wait_for(|cancelled| *cancelled) => {
                debug!("cancelled while connecting");
                Err(self.cancel_cause())
            }
        }
    }

    async fn http1(
        &self,
        conn: Http1Connection,
        home: Home,
        upgrade: bool,
        request: Request,
    ) -> Result<Response, Error> {
        let key = home.key.clone();
        let exchange = Http1Exchange::new(conn, Some(home));
        self.set_impl(ExchangeImpl::Http1(exchange.clone()));

        let (mut parts, body) = request.into_parts();
        let framing = Framing::for_body(&parts.method, body.content_length());

        if let Some(headers) = self.route.proxy_headers() {
            for (name, value) in headers {
                parts.headers.append(name.clone(), value.clone());
            }
        }

        let upgrading = upgrade && framing.is_none() && parts.method != Method::CONNECT;
        if upgrading {
            self.upgrading.store(true, Ordering::Release);
            parts.headers.insert(
                header::CONNECTION,
                HeaderValue::from_static("Upgrade, HTTP2-Settings"),
            );
            parts
                .headers
                .insert(header::UPGRADE, HeaderValue::from_static("h2c"));
            parts.headers.insert(
                "http2-settings",
                self.connector.http2_config().upgrade_header(),
            );
        }

        let expect_continue = !framing.is_none() && expects_continue(&parts.headers);
        exchange.send_headers(&parts, framing).await?;

        let head = if expect_continue {
            let first = exchange.read_head();
            tokio::pin!(first);
            let early = match self.connector.http1_config().expect_continue_timeout {
                Some(wait) => tokio::select! {
                    head = &mut first => Some(head),
                    _ = tokio::time::sleep(wait) => None,
                },
                None => Some(first.as_mut().await),
            };

            match early {
                Some(head) => {
                    let head = head?;
                    if head.status.is_informational() {
                        trace!(status = %head.status, "sending body after interim response");
                        spawn_body(&exchange, body, framing);
                        final_head(&exchange, None).await?
                    } else {
                        debug!(status = %head.status, "final response before body was sent");
                        exchange.skip_body();
                        head
                    }
                }
                None => {
                    trace!("no 100 Continue in time, sending body");
                    spawn_body(&exchange, body, framing);
                    let head = first.await?;
                    final_head(&exchange, Some(head)).await?
                }
            }
        } else {
            spawn_body(&exchange, body, framing);
            final_head(&exchange, None).await?
        };

        if head.status == StatusCode::SWITCHING_PROTOCOLS {
            if !upgrading {
                return Err(exchange.fail(ProtocolError::Upgrade("unexpected 101 response").into()));
            }
            return self.upgrade(&exchange, &key, &parts.method).await;
        }

        if upgrading {
            debug!(%key, "server declined h2c upgrade");
            self.connector.registry().mark_http1_only(key);
        }

        let body = exchange.read_body(&head, &parts.method)?;
        Ok(head.into_response(body))
    }

    async fn upgrade(
        &self,
        exchange: &Arc<Http1Exchange>,
        key: &crate::client::pool::CacheKey,
        method: &Method,
    ) -> Result<Response, Error> {
        let (tube, buffered) = exchange.upgrade();
        debug!(conn = tube.id(), buffered = buffered.len(), "switching to http/2");
        let stream = self
            .connector
            .upgraded(key, tube, buffered, *method == Method::HEAD)
            .await?;
        self.upgraded.store(true, Ordering::Release);
        self.set_impl(ExchangeImpl::Http2(stream.clone()));
        stream.read_head().await
    }

    async fn http2(&self, conn: Arc<Http2Connection>, request: Request) -> Result<Response, Error> {
        let stream = conn.new_stream()?;
        self.set_impl(ExchangeImpl::Http2(stream.clone()));

        let (parts, body) = request.into_parts();
        let length = body.content_length();
        let end_stream = length == Some(0);
        stream.send_headers(&parts, end_stream, length)?;

        if !end_stream {
            let sender = stream.clone();
            let span = tracing::trace_span!("request-body", stream.id = stream.id());
            tokio::spawn(
                async move {
                    if let Err(error) = sender.send_body(body, length).await {
                        debug!(%error, "request body not sent");
                    }
                }
                .instrument(span),
            );
        }

        stream.read_head().await
    }
}

fn expects_continue(headers: &http::HeaderMap) -> bool {
    headers
        .get(header::EXPECT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("100-continue"))
}

fn spawn_body(exchange: &Arc<Http1Exchange>, body: Body, framing: Framing) {
    if framing.is_none() {
        return;
    }
    let exchange = exchange.clone();
    let span = tracing::trace_span!("request-body", conn = exchange.connection().id());
    tokio::spawn(
        async move {
            if let Err(error) = exchange.send_body(body, framing).await {
                debug!(%error, "request body not sent");
            }
        }
        .instrument(span),
    );
}

/// Read heads until one is final. `101` counts as final here.
async fn final_head(
    exchange: &Http1Exchange,
    mut next: Option<ResponseHead>,
) -> Result<ResponseHead, Error> {
    loop {
        let head = match next.take() {
            Some(head) => head,
            None => exchange.read_head().await?,
        };
        if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
            trace!(status = %head.status, "skipping informational response");
            continue;
        }
        return Ok(head);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http_body_util::BodyExt as _;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};

    use super::*;
    use crate::client::conn::transport::duplex::{self, DuplexIncoming};
    use crate::client::conn::ConnectorParts;
    use crate::client::tracker::OperationTracker;

    fn connector(parts: ConnectorParts) -> (Connector, DuplexIncoming) {
        let (transport, incoming) = duplex::pair();
        (
            Connector::new(Arc::new(transport), parts, OperationTracker::default()),
            incoming,
        )
    }

    fn exchange(connector: &Connector, uri: &str, version: HttpProtocol) -> Arc<Exchange> {
        let route = Route::new(&uri.parse().unwrap(), None).unwrap();
        Exchange::new(connector.clone(), route, version)
    }

    async fn read_head(server: &mut DuplexStream) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            server.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
        }
        String::from_utf8(buf).unwrap()
    }

    #[tokio::test]
    async fn no_content_reads_nothing_more() {
        let (connector, mut incoming) = connector(ConnectorParts::default());
        let exchange = exchange(&connector, "http://example.com/", HttpProtocol::Http1);

        let server = tokio::spawn(async move {
            let mut server = incoming.accept().await.unwrap();
            read_head(&mut server).await;
            server
                .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                .await
                .unwrap();
            server
        });

        let request = http::Request::get("http://example.com/")
            .body(Body::empty())
            .unwrap();
        let response = exchange.response(request, None).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.into_body().collect().await.unwrap().to_bytes().is_empty());

        let _server = server.await.unwrap();
        assert_eq!(connector.pool().idle_count(), 1);
    }

    #[tokio::test]
    async fn expect_continue_waits_for_interim_response() {
        let (connector, mut incoming) = connector(ConnectorParts::default());
        let exchange = exchange(&connector, "http://example.com/upload", HttpProtocol::Http1);

        let server = tokio::spawn(async move {
            let mut server = incoming.accept().await.unwrap();
            let head = read_head(&mut server).await;
            assert!(head.contains("expect: 100-continue\r\n"));

            // Nothing of the body may arrive before the interim response.
            let mut probe = [0u8; 1];
            assert!(
                tokio::time::timeout(Duration::from_millis(50), server.read(&mut probe))
                    .await
                    .is_err()
            );

            server.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.unwrap();
            let mut body = [0u8; 4];
            server.read_exact(&mut body).await.unwrap();
            assert_eq!(&body, b"data");
            server
                .write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let request = http::Request::post("http://example.com/upload")
            .header(header::EXPECT, "100-continue")
            .body(Body::from("data"))
            .unwrap();
        let response = exchange.response(request, None).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn expect_continue_final_response_skips_body() {
        let (connector, mut incoming) = connector(ConnectorParts::default());
        let exchange = exchange(&connector, "http://example.com/upload", HttpProtocol::Http1);

        tokio::spawn(async move {
            let mut server = incoming.accept().await.unwrap();
            read_head(&mut server).await;
            server
                .write_all(b"HTTP/1.1 413 Payload Too Large\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            server
        });

        let request = http::Request::post("http://example.com/upload")
            .header(header::EXPECT, "100-continue")
            .body(Body::from("data"))
            .unwrap();
        let response = exchange.response(request, None).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        response.into_body().collect().await.unwrap();

        // The unsent body leaves the connection in an unknown state.
        assert_eq!(connector.pool().idle_count(), 0);
    }

    #[tokio::test]
    async fn cancel_before_connection_is_replayed() {
        let (connector, mut incoming) = connector(ConnectorParts::default());
        let exchange = exchange(&connector, "http://example.com/", HttpProtocol::Http1);
        exchange.cancel(Error::cancelled(None));

        let request = http::Request::get("http://example.com/")
            .body(Body::empty())
            .unwrap();
        let error = exchange.response(request, None).await.unwrap_err();
        assert!(error.is_cancelled());
        assert_eq!(connector.pool().idle_count(), 0);
        drop(incoming);
    }

    #[tokio::test]
    async fn declined_upgrade_is_remembered() {
        let (connector, mut incoming) = connector(ConnectorParts::default());
        let exchange = exchange(&connector, "http://example.com/", HttpProtocol::Http2);

        let server = tokio::spawn(async move {
            let mut server = incoming.accept().await.unwrap();
            let head = read_head(&mut server).await;
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            (head, server)
        });

        let request = http::Request::get("http://example.com/")
            .body(Body::empty())
            .unwrap();
        let response = exchange.response(request, None).await.unwrap();
        assert_eq!(response.into_body().collect().await.unwrap().to_bytes(), "ok");

        let (head, _server) = server.await.unwrap();
        assert!(head.contains("upgrade: h2c\r\n"));
        assert!(head.contains("http2-settings: "));
        assert!(!exchange.is_upgraded());

        let route = Route::new(&"http://example.com/".parse().unwrap(), None).unwrap();
        assert!(connector.registry().is_http1_only(&route.key));
    }
}
