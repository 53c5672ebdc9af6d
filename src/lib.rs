//! Switchyard
//!
//! A client-side HTTP/1.1 and HTTP/2 engine: connection pooling, request
//! multiplexing, demand-driven bodies, retries and redirects.
//!
//! Most users want [`Client`]:
//!
//! ```no_run
//! # async fn run() -> Result<(), switchyard::Error> {
//! use http_body_util::BodyExt as _;
//!
//! let client = switchyard::Client::builder().build();
//! let response = client.get("http://example.com/".parse().unwrap()).await?;
//! let body = response.into_body().collect().await?.to_bytes();
//! # drop(body);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod body;
pub use body::Body;
pub mod client;
pub use client::{Client, Error};
pub(crate) mod flow;
pub mod info;

/// A boxed error which can cross threads.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
