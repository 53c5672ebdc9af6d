use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use http_body_util::BodyExt as _;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};
use tower::ServiceExt as _;

use switchyard::client::conn::transport::duplex::{self, DuplexIncoming};
use switchyard::client::conn::{HttpProtocol, TransportStream};
use switchyard::client::Builder;
use switchyard::{Body, Client};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

fn builder() -> (Builder, DuplexIncoming) {
    let (transport, incoming) = duplex::pair();
    let builder = Client::builder()
        .with_duplex(transport)
        .with_version(HttpProtocol::Http1);
    (builder, incoming)
}

async fn read_head(server: &mut DuplexStream) -> io::Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        server.read_exact(&mut byte).await?;
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

async fn respond(server: &mut DuplexStream, body: &str) {
    let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}", body.len());
    server.write_all(response.as_bytes()).await.unwrap();
}

#[tokio::test]
async fn stale_pooled_connection_is_replaced() -> Result<(), BoxError> {
    let _ = tracing_subscriber::fmt::try_init();
    let (builder, mut incoming) = builder();
    let client = builder.build();

    let first = tokio::spawn(async move {
        let mut stream = incoming.accept().await.unwrap();
        read_head(&mut stream).await.unwrap();
        respond(&mut stream, "first").await;
        (stream, incoming)
    });

    let response = client.get("http://example.com/".parse()?).await?;
    assert_eq!(response.into_body().collect().await?.to_bytes(), "first");

    // The server closes the idle connection.
    let (stream, mut incoming) = first.await?;
    drop(stream);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = tokio::spawn(async move {
        let mut stream = incoming.accept().await.unwrap();
        read_head(&mut stream).await.unwrap();
        respond(&mut stream, "second").await;
        stream
    });

    let response = client.get("http://example.com/".parse()?).await?;
    assert_eq!(response.into_body().collect().await?.to_bytes(), "second");
    let _stream = second.await?;
    Ok(())
}

#[tokio::test]
async fn expired_connection_is_retried_on_a_fresh_one() -> Result<(), BoxError> {
    let _ = tracing_subscriber::fmt::try_init();
    let (builder, mut incoming) = builder();
    let client = builder.build();
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = connections.clone();
    tokio::spawn(async move {
        let mut stream = incoming.accept().await.unwrap();
        counter.fetch_add(1, Ordering::SeqCst);
        read_head(&mut stream).await.unwrap();
        respond(&mut stream, "one").await;

        // Read the second request, then hang up without answering.
        read_head(&mut stream).await.unwrap();
        drop(stream);

        let mut stream = incoming.accept().await.unwrap();
        counter.fetch_add(1, Ordering::SeqCst);
        read_head(&mut stream).await.unwrap();
        respond(&mut stream, "two").await;
        stream
    });

    let response = client.get("http://example.com/".parse()?).await?;
    assert_eq!(response.into_body().collect().await?.to_bytes(), "one");

    let response = client.get("http://example.com/".parse()?).await?;
    assert_eq!(response.into_body().collect().await?.to_bytes(), "two");
    assert_eq!(connections.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn cancel_while_connecting() -> Result<(), BoxError> {
    let _ = tracing_subscriber::fmt::try_init();
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    let transport = tower::service_fn(move |_uri: http::Uri| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            futures_util::future::pending::<io::Result<TransportStream>>().await
        }
    });
    let client = Client::builder().with_transport(transport).build();

    let request = http::Request::get("http://example.com/").body(Body::empty())?;
    let future = client.send_async(request);
    let handle = future.handle();
    let task = tokio::spawn(future);

    while attempts.load(Ordering::SeqCst) == 0 {
        tokio::task::yield_now().await;
    }
    assert!(!client.is_idle());
    handle.cancel(true);

    let error = task.await?.unwrap_err();
    assert!(error.is_cancelled(), "unexpected error: {error}");
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(client.is_idle());
    Ok(())
}

#[tokio::test]
async fn connect_timeout() -> Result<(), BoxError> {
    let transport = tower::service_fn(|_uri: http::Uri| {
        futures_util::future::pending::<io::Result<TransportStream>>()
    });
    let client = Client::builder()
        .with_transport(transport)
        .with_connect_timeout(Duration::from_millis(20))
        .build();

    let error = client
        .get("http://example.com/".parse()?)
        .await
        .unwrap_err();
    assert!(error.is_timeout());
    assert!(error.is_connect());
    Ok(())
}

#[tokio::test]
async fn request_timeout() -> Result<(), BoxError> {
    let (builder, mut incoming) = builder();
    let client = builder.with_timeout(Duration::from_millis(50)).build();

    tokio::spawn(async move {
        let mut stream = incoming.accept().await.unwrap();
        let _ = read_head(&mut stream).await;
        // Never answer.
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    });

    let error = client
        .get("http://example.com/".parse()?)
        .await
        .unwrap_err();
    assert!(error.is_timeout());
    assert!(!error.is_connect());
    Ok(())
}

#[tokio::test]
async fn redirect_to_another_host() -> Result<(), BoxError> {
    let (builder, mut incoming) = builder();
    let client = builder.build();

    let server = tokio::spawn(async move {
        let (first_uri, mut first) = incoming.accept_with_uri().await.unwrap();
        let head = read_head(&mut first).await.unwrap();
        assert!(head.contains("authorization: secret\r\n"));
        first
            .write_all(
                b"HTTP/1.1 308 Permanent Redirect\r\n\
                  Location: http://other.example/moved\r\n\
                  Content-Length: 0\r\n\r\n",
            )
            .await
            .unwrap();

        let (second_uri, mut second) = incoming.accept_with_uri().await.unwrap();
        let head = read_head(&mut second).await.unwrap();
        respond(&mut second, "moved").await;
        (first_uri, second_uri, head, first, second)
    });

    let request = http::Request::get("http://example.com/")
        .header("authorization", "secret")
        .body(Body::empty())?;
    let response = client.request(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.into_body().collect().await?.to_bytes(), "moved");

    let (first_uri, second_uri, head, _first, _second) = server.await?;
    assert_eq!(first_uri.host(), Some("example.com"));
    assert_eq!(second_uri.host(), Some("other.example"));
    assert!(head.starts_with("GET /moved HTTP/1.1\r\n"));
    assert!(!head.contains("authorization"));
    Ok(())
}

#[tokio::test]
async fn redirect_body_is_drained_and_connection_reused() -> Result<(), BoxError> {
    let (builder, mut incoming) = builder();
    let client = builder.build();

    let server = tokio::spawn(async move {
        let mut stream = incoming.accept().await.unwrap();
        let first = read_head(&mut stream).await.unwrap();
        stream
            .write_all(
                b"HTTP/1.1 302 Found\r\n\
                  Location: /next\r\n\
                  Content-Length: 11\r\n\r\n\
                  redirecting",
            )
            .await
            .unwrap();

        let second = read_head(&mut stream).await.unwrap();
        respond(&mut stream, "arrived").await;
        (first, second, stream, incoming)
    });

    let response = client.get("http://example.com/start".parse()?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.into_body().collect().await?.to_bytes(), "arrived");

    let (first, second, _stream, mut incoming) = server.await?;
    assert!(first.starts_with("GET /start HTTP/1.1\r\n"));
    assert!(second.starts_with("GET /next HTTP/1.1\r\n"));
    assert!(incoming.try_accept().is_none());
    Ok(())
}

#[tokio::test]
async fn redirects_can_be_disabled() -> Result<(), BoxError> {
    let (builder, mut incoming) = builder();
    let client = builder.without_redirects().build();

    tokio::spawn(async move {
        let mut stream = incoming.accept().await.unwrap();
        read_head(&mut stream).await.unwrap();
        stream
            .write_all(b"HTTP/1.1 302 Found\r\nLocation: /elsewhere\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        stream
    });

    let response = client.get("http://example.com/".parse()?).await?;
    assert_eq!(response.status(), StatusCode::FOUND);
    Ok(())
}

#[tokio::test]
async fn client_is_a_tower_service() -> Result<(), BoxError> {
    let (builder, mut incoming) = builder();
    let client = builder.build();

    tokio::spawn(async move {
        let mut stream = incoming.accept().await.unwrap();
        read_head(&mut stream).await.unwrap();
        respond(&mut stream, "tower").await;
        stream
    });

    let request = http::Request::get("http://example.com/").body(Body::empty())?;
    let response = client.clone().oneshot(request).await?;
    assert_eq!(response.into_body().collect().await?.to_bytes(), "tower");
    assert!(client.is_idle());
    Ok(())
}

#[tokio::test]
async fn unsupported_scheme() -> Result<(), BoxError> {
    let (builder, _incoming) = builder();
    let client = builder.build();
    let error = client
        .get("ftp://example.com/file".parse()?)
        .await
        .unwrap_err();
    assert!(matches!(error, switchyard::Error::UnsupportedProtocol(_)));
    Ok(())
}
