//! HTTP delivery of encoded batches to the downstream receiver.
//!
//! A forward attempt classifies into three outcomes: delivered, terminal
//! (the receiver rejected the batch and retrying cannot help) and
//! retryable (everything else). Retryable failures are retried in place up
//! to the configured budget; exhaustion is reported as retryable so the
//! caller can route the batch to the spool.
//!
//! ## Metrics
//!
//! `batches_forwarded`: Batches accepted by the receiver
//! `bytes_forwarded`: Encoded body bytes accepted by the receiver
//! `request_failure`: Individual failed attempts
//!

use std::time::Duration;

use chrono::SecondsFormat;
use metrics::counter;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT};
use tracing::{debug, warn};

use crate::config::{AppConfig, ReceiverConfig};
use crate::encoder::EncodedBatch;

/// Content type of every forwarded body.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Batch id header.
pub const BATCH_ID_HEADER: &str = "X-Proxy-Batch-ID";
/// Line count header.
pub const LINE_COUNT_HEADER: &str = "X-Proxy-Line-Count";
/// Pre-encoding byte count header.
pub const ORIGINAL_BYTES_HEADER: &str = "X-Proxy-Original-Bytes";
/// Batch creation time header, RFC 3339.
pub const CREATED_AT_HEADER: &str = "X-Proxy-Created-At";

/// Errors produced while constructing a [`Forwarder`].
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    /// The HTTP client could not be built.
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// A forward that did not deliver.
#[derive(thiserror::Error, Debug)]
pub enum ForwardError {
    /// The receiver rejected the batch; retrying cannot help.
    #[error("receiver returned {status}")]
    Terminal {
        /// The 4xx status observed
        status: u16,
    },
    /// Every attempt failed on a retryable error.
    #[error("retries exhausted: {reason}")]
    Retryable {
        /// The last observed failure
        reason: String,
    },
}

impl ForwardError {
    /// Whether this failure forbids further automatic retries.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ForwardError::Terminal { .. })
    }
}

enum Attempt {
    Terminal(u16),
    Retryable(String),
}

/// The HTTP forwarding client.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
    user_agent: String,
    retry_count: u32,
    retry_delay: Duration,
    metric_labels: Vec<(String, String)>,
}

impl Forwarder {
    /// Create a new [`Forwarder`].
    ///
    /// # Errors
    ///
    /// Function will return an error if the HTTP client cannot be built.
    pub fn new(
        receiver: &ReceiverConfig,
        app: &AppConfig,
        bearer_token: Option<String>,
    ) -> Result<Self, BuildError> {
        let client = reqwest::Client::builder()
            .timeout(receiver.timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: receiver.base_url.clone(),
            bearer_token,
            user_agent: app.user_agent(),
            retry_count: receiver.retry_count,
            retry_delay: receiver.retry_delay(),
            metric_labels: vec![("component".to_string(), "forwarder".to_string())],
        })
    }

    /// The receiver URL for a (tenant, dataset) pair.
    ///
    /// Substitution is literal: identifiers are the operator's problem to
    /// keep URL-safe, and silently encoding them here would change the path
    /// the receiver observes.
    #[must_use]
    pub fn url_for(&self, tenant_id: &str, dataset_id: &str) -> String {
        self.base_url
            .replace("{tenantid}", tenant_id)
            .replace("{datasetid}", dataset_id)
    }

    /// Deliver one encoded batch, retrying retryable failures in place.
    ///
    /// # Errors
    ///
    /// Function will return [`ForwardError::Terminal`] on a 4xx response and
    /// [`ForwardError::Retryable`] once the retry budget is exhausted.
    pub async fn forward(&self, batch: &EncodedBatch) -> Result<(), ForwardError> {
        let url = self.url_for(&batch.tenant_id, &batch.dataset_id);
        let mut last_failure = String::from("no attempts made");

        for attempt in 0..=self.retry_count {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
            }
            match self.attempt(&url, batch).await {
                Ok(()) => {
                    debug!(batch_id = %batch.id, attempt, "batch forwarded");
                    counter!("batches_forwarded", &self.metric_labels).increment(1);
                    counter!("bytes_forwarded", &self.metric_labels)
                        .increment(batch.body.len() as u64);
                    return Ok(());
                }
                Err(Attempt::Terminal(status)) => {
                    warn!(batch_id = %batch.id, status, "receiver rejected batch");
                    counter!("request_failure", &self.metric_labels).increment(1);
                    return Err(ForwardError::Terminal { status });
                }
                Err(Attempt::Retryable(reason)) => {
                    warn!(batch_id = %batch.id, attempt, %reason, "forward attempt failed");
                    counter!("request_failure", &self.metric_labels).increment(1);
                    last_failure = reason;
                }
            }
        }

        Err(ForwardError::Retryable {
            reason: last_failure,
        })
    }

    async fn attempt(&self, url: &str, batch: &EncodedBatch) -> Result<(), Attempt> {
        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, NDJSON_CONTENT_TYPE)
            .header(USER_AGENT, &self.user_agent)
            .header(BATCH_ID_HEADER, &batch.id)
            .header(LINE_COUNT_HEADER, batch.line_count)
            .header(ORIGINAL_BYTES_HEADER, batch.original_bytes)
            .header(
                CREATED_AT_HEADER,
                batch
                    .created_at
                    .to_rfc3339_opts(SecondsFormat::Nanos, true),
            )
            .body(batch.body.clone());
        if batch.compressed {
            request = request.header(CONTENT_ENCODING, "gzip");
        }
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                Attempt::Retryable(String::from("request timed out"))
            } else {
                Attempt::Retryable(err.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(Attempt::Terminal(status.as_u16()))
        } else {
            Err(Attempt::Retryable(format!("receiver returned {status}")))
        }
    }
}
