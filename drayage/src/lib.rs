//! An on-premises UDP ingestion proxy.
//!
//! drayage accepts line-oriented or JSON datagrams on one or more UDP
//! ports, groups them into per-tenant/per-dataset batches, encodes each
//! batch as (optionally gzipped) newline-delimited JSON and forwards the
//! batches over HTTP to a downstream receiver. Batches the receiver cannot
//! take are persisted to a local spool directory and retried
//! asynchronously; batches that exhaust their retry budget are preserved on
//! disk for manual recovery.
//!
//! The crate is organized around the pipeline:
//!
//! ```text
//! UDP socket -> listener -> batcher -> encoder -> forwarder -> receiver
//!                                                    |
//!                                                  spool <- retry worker
//! ```
//!
//! [`proxy::Proxy`] wires the pieces together; the `drayage` binary adds
//! configuration loading, logging and signal handling on top.

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};

pub mod admin;
pub mod alert;
pub mod batcher;
pub mod buffer_pool;
pub mod config;
pub mod encoder;
pub mod forwarder;
pub mod listener;
pub mod proxy;
pub mod spool;
pub mod stats;

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
