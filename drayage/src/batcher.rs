//! Per-(tenant, dataset) batch accumulation.
//!
//! A single task owns the map of open batches, so no lock guards it. A
//! batch seals as soon as the configured line or byte trigger is met; a
//! shared timer seals every open batch that has been waiting longer than
//! the batch timeout. Sealed batches are handed to the forwarding task in
//! seal order, which preserves ordering within each key.
//!
//! ## Metrics
//!
//! `batches_sealed`: Batches handed to the forwarder
//! `batch_seal_lines`: Lines across sealed batches
//!

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::UdpConfig;
use crate::listener::Message;
use crate::stats::Stats;

/// An accumulating group of messages for one (tenant, dataset).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Unique id, `<unix_nanos>_<tenant>:<dataset>`
    pub id: String,
    /// Tenant key of the batch
    pub tenant_id: String,
    /// Dataset key of the batch
    pub dataset_id: String,
    /// Messages in arrival order
    pub messages: Vec<Message>,
    /// Sum of payload byte lengths, pre-encoding
    pub total_bytes: u64,
    /// When the first message entered this batch
    pub created_at: DateTime<Utc>,
}

impl Batch {
    fn open(tenant_id: &str, dataset_id: &str) -> Self {
        let now = Utc::now();
        let nanos =
            i128::from(now.timestamp()) * 1_000_000_000 + i128::from(now.timestamp_subsec_nanos());
        Self {
            id: format!("{nanos}_{tenant_id}:{dataset_id}"),
            tenant_id: tenant_id.to_string(),
            dataset_id: dataset_id.to_string(),
            messages: Vec::new(),
            total_bytes: 0,
            created_at: now,
        }
    }

    fn push(&mut self, message: Message) {
        self.total_bytes += message.payload.len() as u64;
        self.messages.push(message);
    }

    /// Number of messages in this batch.
    #[must_use]
    pub fn line_count(&self) -> u64 {
        self.messages.len() as u64
    }
}

/// Errors produced by [`Batcher`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The forwarding task hung up before the batcher finished.
    #[error("Sealed batch channel closed")]
    Handoff,
}

/// The batching task.
#[derive(Debug)]
pub struct Batcher {
    ingress: mpsc::Receiver<Message>,
    sealed: mpsc::Sender<Batch>,
    max_lines: u64,
    max_bytes: u64,
    timeout: Duration,
    stats: Arc<Stats>,
    open: FxHashMap<(String, String), Batch>,
    metric_labels: Vec<(String, String)>,
}

impl Batcher {
    /// Create a new [`Batcher`] consuming `ingress` and emitting sealed
    /// batches on `sealed`.
    #[must_use]
    pub fn new(
        config: &UdpConfig,
        ingress: mpsc::Receiver<Message>,
        sealed: mpsc::Sender<Batch>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            ingress,
            sealed,
            max_lines: config.max_batch_lines,
            max_bytes: config.max_batch_bytes.get_bytes() as u64,
            timeout: config.batch_timeout(),
            stats,
            open: FxHashMap::default(),
            metric_labels: vec![("component".to_string(), "batcher".to_string())],
        }
    }

    /// Run the [`Batcher`] until the ingress channel closes, then seal and
    /// drain every open batch.
    ///
    /// # Errors
    ///
    /// Function will return an error if the sealed-batch channel closes
    /// while batches remain to hand off.
    pub async fn spin(mut self) -> Result<(), Error> {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.timeout,
            self.timeout,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe = self.ingress.recv() => {
                    match maybe {
                        Some(message) => {
                            if self.absorb(message).await? {
                                ticker.reset();
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    self.flush_all().await?;
                }
            }
        }

        info!(
            open_batches = self.open.len(),
            "ingress closed; draining open batches"
        );
        self.flush_all().await
    }

    /// Fold one message into its batch; returns whether a batch sealed.
    async fn absorb(&mut self, message: Message) -> Result<bool, Error> {
        let key = (message.tenant_id.clone(), message.dataset_id.clone());
        let batch = self.open.entry(key.clone()).or_insert_with(|| {
            self.stats.record_batch_created();
            Batch::open(&key.0, &key.1)
        });
        batch.push(message);

        let full = (self.max_lines > 0 && batch.line_count() >= self.max_lines)
            || (self.max_bytes > 0 && batch.total_bytes >= self.max_bytes);
        if !full {
            return Ok(false);
        }
        if let Some(batch) = self.open.remove(&key) {
            self.seal(batch).await?;
        }
        Ok(true)
    }

    /// Seal every open batch. Batches are non-empty by construction, but a
    /// zero-message batch would be skipped by the encoder anyway.
    async fn flush_all(&mut self) -> Result<(), Error> {
        if self.open.is_empty() {
            return Ok(());
        }
        let open = std::mem::take(&mut self.open);
        for (_, batch) in open {
            self.seal(batch).await?;
        }
        Ok(())
    }

    async fn seal(&self, batch: Batch) -> Result<(), Error> {
        debug!(
            batch_id = %batch.id,
            lines = batch.line_count(),
            bytes = batch.total_bytes,
            "sealing batch"
        );
        counter!("batches_sealed", &self.metric_labels).increment(1);
        counter!("batch_seal_lines", &self.metric_labels).increment(batch.line_count());
        self.sealed.send(batch).await.map_err(|_| Error::Handoff)
    }
}

#[cfg(test)]
mod tests {
    use byte_unit::Byte;
    use bytes::Bytes;

    use super::*;
    use crate::config::ListenerConfig;

    fn test_config(max_lines: u64, max_bytes: u64, timeout_seconds: u64) -> UdpConfig {
        UdpConfig {
            host: String::from("127.0.0.1"),
            listeners: vec![ListenerConfig {
                port: 0,
                dataset_id: String::from("d1"),
                tenant_id: None,
            }],
            read_buffer_size_bytes: Byte::from_bytes(4096),
            channel_capacity: 16,
            max_batch_lines: max_lines,
            max_batch_bytes: Byte::from_bytes(u128::from(max_bytes)),
            batch_timeout_seconds: timeout_seconds,
            enable_compression: false,
            compression_level: 6,
        }
    }

    fn message(tenant: &str, dataset: &str, payload: &str) -> Message {
        Message {
            payload: Bytes::copy_from_slice(payload.as_bytes()),
            source: String::from("10.0.0.1:55555"),
            received_at: Utc::now(),
            tenant_id: tenant.to_string(),
            dataset_id: dataset.to_string(),
        }
    }

    fn spawn_batcher(
        config: &UdpConfig,
    ) -> (
        mpsc::Sender<Message>,
        mpsc::Receiver<Batch>,
        tokio::task::JoinHandle<Result<(), Error>>,
    ) {
        let (ingress_tx, ingress_rx) = mpsc::channel(64);
        let (sealed_tx, sealed_rx) = mpsc::channel(64);
        let batcher = Batcher::new(config, ingress_rx, sealed_tx, Arc::new(Stats::new()));
        (ingress_tx, sealed_rx, tokio::spawn(batcher.spin()))
    }

    #[tokio::test(start_paused = true)]
    async fn seals_on_the_line_that_reaches_the_limit() {
        let config = test_config(2, 0, 3600);
        let (ingress, mut sealed, _handle) = spawn_batcher(&config);

        ingress.send(message("t1", "d1", "{\"a\":1}")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sealed.try_recv().is_err(), "one line must not seal");

        ingress.send(message("t1", "d1", "{\"b\":2}")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let batch = sealed.try_recv().expect("second line seals");
        assert_eq!(batch.line_count(), 2);
        assert_eq!(batch.tenant_id, "t1");
        assert_eq!(batch.dataset_id, "d1");
        assert_eq!(batch.total_bytes, 14);
    }

    #[tokio::test(start_paused = true)]
    async fn seals_when_bytes_cross_the_threshold() {
        let config = test_config(0, 10, 3600);
        let (ingress, mut sealed, _handle) = spawn_batcher(&config);

        // nine bytes: one short of the threshold
        ingress.send(message("t1", "d1", "abcdefghi")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sealed.try_recv().is_err(), "below the byte threshold");

        ingress.send(message("t1", "d1", "x")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let batch = sealed.try_recv().expect("crossing the threshold seals");
        assert_eq!(batch.total_bytes, 10);
        assert_eq!(batch.line_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_seals_every_open_batch() {
        let config = test_config(0, 0, 5);
        let (ingress, mut sealed, _handle) = spawn_batcher(&config);

        ingress.send(message("t1", "d1", "one")).await.unwrap();
        ingress.send(message("t2", "d2", "two")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sealed.try_recv().is_err(), "nothing seals before timeout");

        tokio::time::sleep(Duration::from_secs(6)).await;
        let first = sealed.try_recv().expect("timer seals first batch");
        let second = sealed.try_recv().expect("timer seals second batch");
        let mut keys = vec![
            (first.tenant_id, first.dataset_id),
            (second.tenant_id, second.dataset_id),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                (String::from("t1"), String::from("d1")),
                (String::from("t2"), String::from("d2")),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keys_batch_independently() {
        let config = test_config(2, 0, 3600);
        let (ingress, mut sealed, _handle) = spawn_batcher(&config);

        ingress.send(message("t1", "d1", "a")).await.unwrap();
        ingress.send(message("t2", "d2", "b")).await.unwrap();
        ingress.send(message("t1", "d1", "c")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let batch = sealed.try_recv().expect("t1/d1 seals at two lines");
        assert_eq!(batch.tenant_id, "t1");
        assert_eq!(batch.line_count(), 2);
        assert!(sealed.try_recv().is_err(), "t2/d2 stays open at one line");
    }

    #[tokio::test(start_paused = true)]
    async fn messages_keep_arrival_order() {
        let config = test_config(3, 0, 3600);
        let (ingress, mut sealed, _handle) = spawn_batcher(&config);

        for payload in ["first", "second", "third"] {
            ingress.send(message("t1", "d1", payload)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        let batch = sealed.try_recv().expect("three lines seal");
        let payloads: Vec<_> = batch
            .messages
            .iter()
            .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
            .collect();
        assert_eq!(payloads, vec!["first", "second", "third"]);
    }

    #[tokio::test(start_paused = true)]
    async fn drains_open_batches_when_ingress_closes() {
        let config = test_config(100, 0, 3600);
        let (ingress, mut sealed, handle) = spawn_batcher(&config);

        ingress.send(message("t1", "d1", "straggler")).await.unwrap();
        drop(ingress);

        handle
            .await
            .expect("batcher join")
            .expect("batcher exits clean");
        let batch = sealed.recv().await.expect("drained batch");
        assert_eq!(batch.line_count(), 1);
        assert!(sealed.recv().await.is_none(), "sealed channel closes");
    }
}
