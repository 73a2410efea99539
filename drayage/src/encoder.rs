//! Batch encoding: messages to NDJSON, optionally gzipped.
//!
//! Payloads that already parse as JSON are re-serialized canonically, so a
//! given input always produces the same output bytes. Anything else is
//! wrapped in a three-field envelope carrying the payload, its source
//! endpoint and the receive timestamp.

use std::io::Write;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::{write::GzEncoder, Compression};
use serde::Serialize;

use crate::batcher::Batch;

/// Errors produced by [`Encoder`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A message could not be serialized.
    #[error("Failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    /// Gzip writer error.
    #[error("Compression failure: {0}")]
    Compress(#[from] std::io::Error),
}

/// A sealed batch in wire form, ready for the forwarder or the spool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBatch {
    /// The batch id
    pub id: String,
    /// Tenant key of the batch
    pub tenant_id: String,
    /// Dataset key of the batch
    pub dataset_id: String,
    /// NDJSON bytes, gzipped when `compressed`
    pub body: Bytes,
    /// Whether `body` is gzipped
    pub compressed: bool,
    /// Messages encoded into `body`
    pub line_count: u64,
    /// Pre-encoding payload bytes
    pub original_bytes: u64,
    /// When the batch was opened
    pub created_at: DateTime<Utc>,
}

/// Envelope for payloads that are not themselves JSON.
#[derive(Serialize)]
struct Envelope<'a> {
    message: &'a str,
    source: &'a str,
    timestamp: String,
}

/// The NDJSON encoder.
#[derive(Debug, Clone, Copy)]
pub struct Encoder {
    compress: bool,
    level: u32,
}

impl Encoder {
    /// Create a new [`Encoder`]. `level` follows gzip semantics, 0 through 9.
    #[must_use]
    pub fn new(compress: bool, level: u32) -> Self {
        Self { compress, level }
    }

    /// Encode a batch. Returns `None` for a zero-message batch, which the
    /// batcher never produces but the encoder does not trust it not to.
    ///
    /// # Errors
    ///
    /// Function will return an error if serialization or compression fails.
    pub fn encode(&self, batch: &Batch) -> Result<Option<EncodedBatch>, Error> {
        if batch.messages.is_empty() {
            return Ok(None);
        }

        let mut ndjson: Vec<u8> = Vec::with_capacity(batch.total_bytes as usize + batch.messages.len());
        for (idx, message) in batch.messages.iter().enumerate() {
            if idx > 0 {
                ndjson.push(b'\n');
            }
            match serde_json::from_slice::<serde_json::Value>(&message.payload) {
                Ok(value) => serde_json::to_writer(&mut ndjson, &value)?,
                Err(_) => {
                    let text = String::from_utf8_lossy(&message.payload);
                    let envelope = Envelope {
                        message: text.as_ref(),
                        source: &message.source,
                        timestamp: message
                            .received_at
                            .to_rfc3339_opts(SecondsFormat::Nanos, true),
                    };
                    serde_json::to_writer(&mut ndjson, &envelope)?;
                }
            }
        }

        let (body, compressed) = if self.compress {
            let mut encoder = GzEncoder::new(
                Vec::with_capacity(ndjson.len() / 2),
                Compression::new(self.level),
            );
            encoder.write_all(&ndjson)?;
            (Bytes::from(encoder.finish()?), true)
        } else {
            (Bytes::from(ndjson), false)
        };

        Ok(Some(EncodedBatch {
            id: batch.id.clone(),
            tenant_id: batch.tenant_id.clone(),
            dataset_id: batch.dataset_id.clone(),
            body,
            compressed,
            line_count: batch.line_count(),
            original_bytes: batch.total_bytes,
            created_at: batch.created_at,
        }))
    }
}
