//! The durable spool: failed batches parked on disk and retried.
//!
//! Each record is a pair of sibling files sharing a stem: `<id>.ndjson`
//! holds the encoded body exactly as the forwarder would have sent it, and
//! `<id>.meta` holds a small JSON document describing the record. The
//! payload is written before its meta and the meta is removed before its
//! payload, so a meta on disk always points at a readable payload. Meta
//! rewrites go through a temp file and rename.
//!
//! A single async mutex serializes directory mutations and the running
//! size account. The retry and cleanup workers take it per record, never
//! across a network round-trip.
//!
//! ## Metrics
//!
//! `spool_records_written`: Records persisted
//! `spool_bytes_written`: Payload bytes persisted
//! `spool_records_replayed`: Records delivered on retry
//! `spool_records_reclaimed`: Records removed by cleanup
//!

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Duration as AgeDuration, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::alert::{AlertSink, Severity};
use crate::config::SpoolingConfig;
use crate::encoder::EncodedBatch;
use crate::forwarder::Forwarder;
use crate::stats::Stats;

/// Extension of the payload file in a record pair.
pub const PAYLOAD_EXTENSION: &str = "ndjson";
/// Extension of the metadata file in a record pair.
pub const META_EXTENSION: &str = "meta";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Errors produced by [`Spool`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Metadata could not be encoded or decoded.
    #[error("Spool metadata error: {0}")]
    Meta(#[from] serde_json::Error),
    /// The spool byte budget would be exceeded.
    #[error("Spool full: {needed} bytes needed, {available} available")]
    Full {
        /// Bytes the rejected payload requires
        needed: u64,
        /// Bytes left under the budget
        available: u64,
    },
}

impl Error {
    /// Whether this is the budget-exhausted rejection.
    #[must_use]
    pub fn is_full(&self) -> bool {
        matches!(self, Error::Full { .. })
    }
}

/// Lifecycle state of a spooled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Written, not yet attempted.
    Pending,
    /// At least one retry has been attempted.
    Retrying,
    /// Retry budget exhausted; preserved for manual recovery.
    Failed,
}

/// The on-disk metadata document, one per record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Record id, shared by both files
    pub id: String,
    /// Tenant key of the spooled batch
    pub tenant_id: String,
    /// Dataset key of the spooled batch
    pub dataset_id: String,
    /// Payload file name, relative to the spool directory
    pub filename: String,
    /// Payload size in bytes, recorded at write time
    pub size: u64,
    /// When the record was written
    pub created_at: DateTime<Utc>,
    /// When the record was last attempted, if ever
    #[serde(default)]
    pub last_retry: Option<DateTime<Utc>>,
    /// Retry attempts consumed so far
    pub retry_count: u32,
    /// Lifecycle state
    pub status: Status,
    /// Last observed failure text
    pub failure_reason: String,
}

#[derive(Debug)]
struct State {
    current_size: u64,
}

/// The durable spool.
#[derive(Debug)]
pub struct Spool {
    dir: PathBuf,
    max_size_bytes: u64,
    retry_attempts: u32,
    retry_interval: Duration,
    cleanup_interval: Duration,
    preserve_failed: bool,
    state: Mutex<State>,
    metric_labels: Vec<(String, String)>,
}

impl Spool {
    /// Open the spool directory, creating it if needed, and rebuild the
    /// size account from the metadata already present.
    ///
    /// # Errors
    ///
    /// Function will return an error if the directory cannot be created or
    /// scanned.
    pub async fn open(config: &SpoolingConfig) -> Result<Arc<Self>, Error> {
        tokio::fs::create_dir_all(&config.directory).await?;
        set_mode(&config.directory, 0o755).await?;

        let mut current_size = 0_u64;
        let mut records = 0_usize;
        let mut entries = tokio::fs::read_dir(&config.directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXTENSION) {
                continue;
            }
            match read_meta(&path).await {
                Ok(meta) => {
                    current_size += meta.size;
                    records += 1;
                }
                Err(err) => {
                    warn!(path = %path.display(), "skipping unreadable spool metadata: {err}");
                }
            }
        }
        info!(
            directory = %config.directory.display(),
            records, current_size, "spool opened"
        );

        Ok(Arc::new(Self {
            dir: config.directory.clone(),
            max_size_bytes: config.max_size_bytes.get_bytes() as u64,
            retry_attempts: config.retry_attempts,
            retry_interval: config.retry_interval(),
            cleanup_interval: config.cleanup_interval(),
            preserve_failed: config.preserve_failed,
            state: Mutex::new(State { current_size }),
            metric_labels: vec![("component".to_string(), "spool".to_string())],
        }))
    }

    /// Persist a batch the receiver would not take.
    ///
    /// # Errors
    ///
    /// Function will return [`Error::Full`] when the payload does not fit
    /// under the byte budget even after a cleanup pass, or an IO error if
    /// the files cannot be written.
    pub async fn store(&self, batch: &EncodedBatch, reason: &str) -> Result<(), Error> {
        let needed = batch.body.len() as u64;
        let mut state = self.state.lock().await;

        if state.current_size + needed > self.max_size_bytes {
            let reclaimed = self.sweep_locked(&mut state).await?;
            debug!(reclaimed, "cleanup pass before spool write");
        }
        if state.current_size + needed > self.max_size_bytes {
            return Err(Error::Full {
                needed,
                available: self.max_size_bytes.saturating_sub(state.current_size),
            });
        }

        let now = Utc::now();
        let nanos =
            i128::from(now.timestamp()) * 1_000_000_000 + i128::from(now.timestamp_subsec_nanos());
        let id = format!(
            "{nanos}_{tenant}_{dataset}",
            tenant = batch.tenant_id,
            dataset = batch.dataset_id
        );
        let filename = format!("{id}.{PAYLOAD_EXTENSION}");
        let payload_path = self.dir.join(&filename);

        tokio::fs::write(&payload_path, &batch.body).await?;
        set_mode(&payload_path, 0o644).await?;

        let meta = Meta {
            id,
            tenant_id: batch.tenant_id.clone(),
            dataset_id: batch.dataset_id.clone(),
            filename,
            size: needed,
            created_at: now,
            last_retry: None,
            retry_count: 0,
            status: Status::Pending,
            failure_reason: reason.to_string(),
        };
        if let Err(err) = self.write_meta(&meta).await {
            // half a record is worse than none
            let _ = tokio::fs::remove_file(&payload_path).await;
            return Err(err);
        }

        state.current_size += needed;
        counter!("spool_records_written", &self.metric_labels).increment(1);
        counter!("spool_bytes_written", &self.metric_labels).increment(needed);
        info!(record_id = %meta.id, size = needed, "batch spooled");
        Ok(())
    }

    /// Rewrite a record's metadata in place.
    ///
    /// # Errors
    ///
    /// Function will return an error if the metadata cannot be written.
    pub async fn update_meta(&self, meta: &Meta) -> Result<(), Error> {
        let _state = self.state.lock().await;
        self.write_meta(meta).await
    }

    /// Every readable record, oldest first. Unreadable metadata is skipped
    /// with a warning and left for the age sweep.
    ///
    /// # Errors
    ///
    /// Function will return an error if the directory cannot be listed.
    pub async fn records(&self) -> Result<Vec<Meta>, Error> {
        let _state = self.state.lock().await;
        let mut records = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXTENSION) {
                continue;
            }
            match read_meta(&path).await {
                Ok(meta) => records.push(meta),
                Err(err) => {
                    warn!(path = %path.display(), "skipping unreadable spool metadata: {err}");
                }
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Read the stored payload of a record, byte-identical to what was
    /// written at spool time.
    ///
    /// # Errors
    ///
    /// Function will return an error if the payload file cannot be read.
    pub async fn read_payload(&self, meta: &Meta) -> Result<Bytes, Error> {
        let _state = self.state.lock().await;
        let bytes = tokio::fs::read(self.dir.join(&meta.filename)).await?;
        Ok(Bytes::from(bytes))
    }

    /// Remove a record and release its bytes from the budget.
    ///
    /// # Errors
    ///
    /// Function will return an error if a file cannot be removed.
    pub async fn delete(&self, meta: &Meta) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        self.remove_record_locked(&mut state, meta).await?;
        Ok(())
    }

    /// Run one cleanup pass; returns the bytes reclaimed.
    ///
    /// # Errors
    ///
    /// Function will return an error if the directory cannot be listed.
    pub async fn cleanup(&self) -> Result<u64, Error> {
        let mut state = self.state.lock().await;
        self.sweep_locked(&mut state).await
    }

    /// The bytes currently accounted against the budget.
    pub async fn current_size(&self) -> u64 {
        self.state.lock().await.current_size
    }

    /// Retry budget per record.
    #[must_use]
    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    /// Cadence of the retry worker.
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Cadence of the cleanup worker.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{META_EXTENSION}"))
    }

    async fn write_meta(&self, meta: &Meta) -> Result<(), Error> {
        let tmp = self.dir.join(format!("{id}.{META_EXTENSION}.tmp", id = meta.id));
        let path = self.meta_path(&meta.id);
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(meta)?).await?;
        set_mode(&tmp, 0o644).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Remove a record's files. Returns the bytes released, zero when the
    /// record was already gone; the meta goes first so a half-removed
    /// record is an orphan payload, never a dangling meta.
    async fn remove_record_locked(&self, state: &mut State, meta: &Meta) -> Result<u64, Error> {
        match tokio::fs::remove_file(self.meta_path(&meta.id)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        }
        match tokio::fs::remove_file(self.dir.join(&meta.filename)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(record_id = %meta.id, "spool payload was already missing");
            }
            Err(err) => return Err(err.into()),
        }
        state.current_size = state.current_size.saturating_sub(meta.size);
        Ok(meta.size)
    }

    /// Remove aged-out records and corrupt halves. The `failed` state is a
    /// no-retry marker, not a delete marker: exhausted records go only when
    /// the age rule catches them, or immediately when the operator disabled
    /// `preserve_failed`.
    async fn sweep_locked(&self, state: &mut State) -> Result<u64, Error> {
        let now = Utc::now();
        let max_age = AgeDuration::seconds(
            i64::from(self.retry_attempts) * self.retry_interval.as_secs() as i64 * 2,
        );

        let mut metas: Vec<Meta> = Vec::new();
        let mut payload_stems: Vec<String> = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(META_EXTENSION) => match read_meta(&path).await {
                    Ok(meta) => metas.push(meta),
                    Err(err) => {
                        warn!(path = %path.display(), "unreadable spool metadata: {err}");
                        if file_age(&path).await.map_or(false, |age| age > max_age) {
                            let _ = tokio::fs::remove_file(&path).await;
                        }
                    }
                },
                Some(PAYLOAD_EXTENSION) => {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        payload_stems.push(stem.to_string());
                    }
                }
                Some("tmp") => {
                    // interrupted meta rewrite; reap once it is clearly stale
                    if file_age(&path).await.map_or(false, |age| age > max_age) {
                        let _ = tokio::fs::remove_file(&path).await;
                    }
                }
                _ => {}
            }
        }

        let mut reclaimed = 0_u64;
        for meta in &metas {
            let orphan_meta = !payload_stems.iter().any(|stem| *stem == meta.id);
            let aged_out = now.signed_duration_since(meta.created_at) > max_age;
            let exhausted = !self.preserve_failed && meta.retry_count >= self.retry_attempts;
            if orphan_meta || aged_out || exhausted {
                debug!(
                    record_id = %meta.id,
                    orphan_meta, aged_out, exhausted, "reclaiming spool record"
                );
                reclaimed += self.remove_record_locked(state, meta).await?;
                counter!("spool_records_reclaimed", &self.metric_labels).increment(1);
            }
        }

        // payloads whose meta is gone are unaccounted; remove them outright
        for stem in payload_stems {
            if metas.iter().any(|meta| meta.id == stem) {
                continue;
            }
            let path = self.dir.join(format!("{stem}.{PAYLOAD_EXTENSION}"));
            warn!(path = %path.display(), "removing orphan spool payload");
            let _ = tokio::fs::remove_file(&path).await;
        }

        Ok(reclaimed)
    }
}

async fn read_meta(path: &Path) -> Result<Meta, Error> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn file_age(path: &Path) -> Option<AgeDuration> {
    let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
    let elapsed = modified.elapsed().ok()?;
    AgeDuration::from_std(elapsed).ok()
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Rebuild a forwardable batch from a stored record. Compression is
/// recovered from the gzip magic; the line count is not recorded in spool
/// metadata, so replays advertise zero.
fn replay_batch(meta: &Meta, payload: Bytes) -> EncodedBatch {
    EncodedBatch {
        id: meta.id.clone(),
        tenant_id: meta.tenant_id.clone(),
        dataset_id: meta.dataset_id.clone(),
        compressed: payload.starts_with(&GZIP_MAGIC),
        line_count: 0,
        original_bytes: meta.size,
        body: payload,
        created_at: meta.created_at,
    }
}

/// The retry worker: replays spooled records against the forwarder.
#[derive(Debug)]
pub struct RetryWorker {
    spool: Arc<Spool>,
    forwarder: Arc<Forwarder>,
    stats: Arc<Stats>,
    alert: Arc<dyn AlertSink>,
    shutdown: drayage_signal::Watcher,
}

impl RetryWorker {
    /// Create a new [`RetryWorker`].
    #[must_use]
    pub fn new(
        spool: Arc<Spool>,
        forwarder: Arc<Forwarder>,
        stats: Arc<Stats>,
        alert: Arc<dyn AlertSink>,
        shutdown: drayage_signal::Watcher,
    ) -> Self {
        Self {
            spool,
            forwarder,
            stats,
            alert,
            shutdown,
        }
    }

    /// Run the worker until shutdown, ticking at the spool's retry
    /// interval. Per-record failures are logged, never fatal.
    pub async fn spin(self) {
        let interval = self.spool.retry_interval();
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let shutdown = self.shutdown.clone().recv();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown signal received");
                    return;
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        let records = match self.spool.records().await {
            Ok(records) => records,
            Err(err) => {
                warn!("unable to list spool records: {err}");
                return;
            }
        };
        let now = Utc::now();
        let min_age = AgeDuration::seconds(self.spool.retry_interval().as_secs() as i64);

        for meta in records {
            if meta.status == Status::Failed {
                continue;
            }
            if let Some(last) = meta.last_retry {
                if now.signed_duration_since(last) < min_age {
                    continue;
                }
            }
            if meta.retry_count >= self.spool.retry_attempts() {
                self.mark_failed(meta).await;
                continue;
            }
            self.replay(meta).await;
        }
    }

    async fn mark_failed(&self, meta: Meta) {
        let mut failed = meta;
        failed.status = Status::Failed;
        match self.spool.update_meta(&failed).await {
            Ok(()) => {
                self.alert.alert(
                    Severity::High,
                    "spool record reached max retries",
                    &format!(
                        "record {id} exhausted {attempts} attempts and is preserved for manual recovery",
                        id = failed.id,
                        attempts = failed.retry_count
                    ),
                    Some(&failed.failure_reason),
                );
            }
            Err(err) => {
                warn!(record_id = %failed.id, "unable to mark spool record failed: {err}");
            }
        }
    }

    async fn replay(&self, meta: Meta) {
        let payload = match self.spool.read_payload(&meta).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(record_id = %meta.id, "unable to read spool payload: {err}");
                return;
            }
        };
        let batch = replay_batch(&meta, payload);
        match self.forwarder.forward(&batch).await {
            Ok(()) => {
                if let Err(err) = self.spool.delete(&meta).await {
                    warn!(record_id = %meta.id, "unable to remove replayed record: {err}");
                    return;
                }
                self.stats.record_batch_forwarded(meta.size);
                counter!("spool_records_replayed", &self.spool.metric_labels).increment(1);
                info!(record_id = %meta.id, "spooled batch delivered");
            }
            Err(err) => {
                // a terminal response still consumes one attempt; receivers
                // should not 4xx a well-formed retry, and if one does the
                // record must not live forever
                let mut updated = meta;
                updated.retry_count += 1;
                updated.last_retry = Some(Utc::now());
                updated.status = Status::Retrying;
                updated.failure_reason = err.to_string();
                if let Err(err) = self.spool.update_meta(&updated).await {
                    warn!(record_id = %updated.id, "unable to update spool record: {err}");
                }
            }
        }
    }
}

/// The cleanup worker: age-based pruning of the spool directory.
#[derive(Debug)]
pub struct CleanupWorker {
    spool: Arc<Spool>,
    shutdown: drayage_signal::Watcher,
}

impl CleanupWorker {
    /// Create a new [`CleanupWorker`].
    #[must_use]
    pub fn new(spool: Arc<Spool>, shutdown: drayage_signal::Watcher) -> Self {
        Self { spool, shutdown }
    }

    /// Run the worker until shutdown, ticking at the spool's cleanup
    /// interval.
    pub async fn spin(self) {
        let interval = self.spool.cleanup_interval();
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let shutdown = self.shutdown.clone().recv();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown signal received");
                    return;
                }
                _ = ticker.tick() => {
                    match self.spool.cleanup().await {
                        Ok(0) => {}
                        Ok(reclaimed) => info!(reclaimed, "spool cleanup pass"),
                        Err(err) => warn!("spool cleanup failed: {err}"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use warp::Filter;

    use super::*;
    use crate::config::{AppConfig, ReceiverConfig};

    fn spool_config(dir: &Path, max_size: u64, retry_attempts: u32) -> SpoolingConfig {
        SpoolingConfig {
            enabled: true,
            directory: dir.to_path_buf(),
            max_size_bytes: byte_unit::Byte::from_bytes(u128::from(max_size)),
            retry_attempts,
            retry_interval_seconds: 60,
            cleanup_interval_seconds: 300,
            preserve_failed: true,
        }
    }

    fn encoded_batch(body: &'static [u8]) -> EncodedBatch {
        EncodedBatch {
            id: String::from("1700000000000000000_t1:d1"),
            tenant_id: String::from("t1"),
            dataset_id: String::from("d1"),
            body: Bytes::from_static(body),
            compressed: false,
            line_count: 1,
            original_bytes: body.len() as u64,
            created_at: Utc::now(),
        }
    }

    fn forwarder_to(base_url: String, retry_count: u32) -> Arc<Forwarder> {
        let receiver = ReceiverConfig {
            base_url,
            timeout_seconds: 5,
            retry_count,
            retry_delay_seconds: 0,
        };
        Arc::new(Forwarder::new(&receiver, &AppConfig::default(), None).expect("client builds"))
    }

    #[derive(Debug, Default)]
    struct RecordingSink {
        alerts: StdMutex<Vec<(Severity, String)>>,
    }

    impl RecordingSink {
        fn count(&self) -> usize {
            self.alerts.lock().expect("alert mutex").len()
        }
    }

    impl AlertSink for RecordingSink {
        fn alert(&self, severity: Severity, title: &str, _message: &str, _detail: Option<&str>) {
            self.alerts
                .lock()
                .expect("alert mutex")
                .push((severity, title.to_string()));
        }
    }

    #[tokio::test]
    async fn store_writes_the_documented_record_pair() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = Spool::open(&spool_config(dir.path(), 1024 * 1024, 5))
            .await
            .expect("spool opens");

        spool
            .store(&encoded_batch(b"{\"a\":1}"), "receiver returned 503")
            .await
            .expect("store succeeds");
        assert_eq!(spool.current_size().await, 7);

        let records = spool.records().await.expect("records list");
        assert_eq!(records.len(), 1);
        let meta = &records[0];
        assert_eq!(meta.tenant_id, "t1");
        assert_eq!(meta.dataset_id, "d1");
        assert_eq!(meta.size, 7);
        assert_eq!(meta.retry_count, 0);
        assert_eq!(meta.status, Status::Pending);
        assert_eq!(meta.failure_reason, "receiver returned 503");
        assert!(meta.id.ends_with("_t1_d1"));

        // the payload is byte-identical to the encoded body
        let payload = spool.read_payload(meta).await.expect("payload readable");
        assert_eq!(payload, Bytes::from_static(b"{\"a\":1}"));

        // the meta document carries exactly the documented fields
        let raw = std::fs::read(dir.path().join(format!("{}.meta", meta.id))).expect("meta file");
        let doc: serde_json::Value = serde_json::from_slice(&raw).expect("meta is JSON");
        let object = doc.as_object().expect("meta is an object");
        let mut keys: Vec<_> = object.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec![
                "created_at",
                "dataset_id",
                "failure_reason",
                "filename",
                "id",
                "last_retry",
                "retry_count",
                "size",
                "status",
                "tenant_id",
            ]
        );
        assert_eq!(doc["status"], "pending");
    }

    #[tokio::test]
    async fn store_rejects_when_over_budget() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = Spool::open(&spool_config(dir.path(), 10, 5))
            .await
            .expect("spool opens");

        spool
            .store(&encoded_batch(b"12345678"), "x")
            .await
            .expect("first record fits");
        let err = spool
            .store(&encoded_batch(b"12345678"), "x")
            .await
            .expect_err("second record does not fit");
        assert!(err.is_full());
        assert_eq!(spool.current_size().await, 8, "rejected write leaves no trace");

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert_eq!(files.len(), 2, "one payload plus one meta");
    }

    #[tokio::test]
    async fn delete_restores_the_size_account() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = Spool::open(&spool_config(dir.path(), 1024, 5))
            .await
            .expect("spool opens");

        spool
            .store(&encoded_batch(b"payload"), "x")
            .await
            .expect("store succeeds");
        let before = spool.current_size().await;
        let meta = spool.records().await.expect("records")[0].clone();

        spool.delete(&meta).await.expect("delete succeeds");
        assert_eq!(spool.current_size().await, before - meta.size);
        // deleting again must not double-decrement
        spool.delete(&meta).await.expect("idempotent delete");
        assert_eq!(spool.current_size().await, before - meta.size);
    }

    #[tokio::test]
    async fn reopen_rebuilds_the_size_account() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = spool_config(dir.path(), 1024, 5);
        {
            let spool = Spool::open(&config).await.expect("spool opens");
            spool
                .store(&encoded_batch(b"0123456789"), "x")
                .await
                .expect("store succeeds");
        }
        let reopened = Spool::open(&config).await.expect("spool reopens");
        assert_eq!(reopened.current_size().await, 10);
    }

    #[tokio::test]
    async fn sweep_reaps_orphans_and_aged_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = Spool::open(&spool_config(dir.path(), 1024, 2))
            .await
            .expect("spool opens");

        // an orphan payload with no meta sibling
        std::fs::write(dir.path().join("999_t_d.ndjson"), b"orphan").expect("write orphan");
        // a record far past the age cutoff (2 attempts * 60s * 2)
        spool
            .store(&encoded_batch(b"ancient"), "x")
            .await
            .expect("store succeeds");
        let mut old = spool.records().await.expect("records")[0].clone();
        old.created_at = Utc::now() - AgeDuration::seconds(100_000);
        spool.update_meta(&old).await.expect("meta rewrite");
        // a fresh record that must survive
        spool
            .store(&encoded_batch(b"fresh"), "x")
            .await
            .expect("store succeeds");

        let reclaimed = spool.cleanup().await.expect("cleanup pass");
        assert_eq!(reclaimed, 7, "only the aged record's bytes return");

        let survivors = spool.records().await.expect("records");
        assert_eq!(survivors.len(), 1);
        assert_eq!(
            spool.read_payload(&survivors[0]).await.expect("payload"),
            Bytes::from_static(b"fresh")
        );
        assert!(!dir.path().join("999_t_d.ndjson").exists(), "orphan removed");
    }

    #[tokio::test]
    async fn failed_records_survive_cleanup_by_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = Spool::open(&spool_config(dir.path(), 1024, 2))
            .await
            .expect("spool opens");

        spool
            .store(&encoded_batch(b"stubborn"), "x")
            .await
            .expect("store succeeds");
        let mut meta = spool.records().await.expect("records")[0].clone();
        meta.retry_count = 2;
        meta.status = Status::Failed;
        spool.update_meta(&meta).await.expect("meta rewrite");

        spool.cleanup().await.expect("cleanup pass");
        assert_eq!(
            spool.records().await.expect("records").len(),
            1,
            "failed record preserved for manual recovery"
        );
    }

    #[tokio::test]
    async fn exhausted_records_are_reaped_when_not_preserving() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = spool_config(dir.path(), 1024, 2);
        config.preserve_failed = false;
        let spool = Spool::open(&config).await.expect("spool opens");

        spool
            .store(&encoded_batch(b"stubborn"), "x")
            .await
            .expect("store succeeds");
        let mut meta = spool.records().await.expect("records")[0].clone();
        meta.retry_count = 2;
        spool.update_meta(&meta).await.expect("meta rewrite");

        spool.cleanup().await.expect("cleanup pass");
        assert!(spool.records().await.expect("records").is_empty());
    }

    #[tokio::test]
    async fn retry_worker_delivers_and_deletes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = Spool::open(&spool_config(dir.path(), 1024, 5))
            .await
            .expect("spool opens");
        spool
            .store(&encoded_batch(b"{\"a\":1}"), "receiver returned 503")
            .await
            .expect("store succeeds");

        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let routes = warp::any().and(warp::body::bytes()).map(move |body: Bytes| {
            tx.try_send(body).ok();
            warp::reply()
        });
        let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let (_broadcaster, watcher) = drayage_signal::signal();
        let worker = RetryWorker::new(
            Arc::clone(&spool),
            forwarder_to(format!("http://{addr}/in"), 0),
            Arc::new(Stats::new()),
            Arc::new(RecordingSink::default()),
            watcher,
        );
        worker.tick().await;

        let replayed = rx.recv().await.expect("replay observed");
        assert_eq!(replayed, Bytes::from_static(b"{\"a\":1}"));
        assert!(spool.records().await.expect("records").is_empty());
        assert_eq!(spool.current_size().await, 0);
    }

    #[tokio::test]
    async fn retry_worker_marks_failed_once_and_stops_attempting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = Spool::open(&spool_config(dir.path(), 1024, 2))
            .await
            .expect("spool opens");
        spool
            .store(&encoded_batch(b"doomed"), "receiver returned 503")
            .await
            .expect("store succeeds");
        let mut meta = spool.records().await.expect("records")[0].clone();
        meta.retry_count = 2;
        spool.update_meta(&meta).await.expect("meta rewrite");

        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        let routes = warp::any().map(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            warp::reply::with_status("down", warp::http::StatusCode::SERVICE_UNAVAILABLE)
        });
        let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let alert = Arc::new(RecordingSink::default());
        let (_broadcaster, watcher) = drayage_signal::signal();
        let worker = RetryWorker::new(
            Arc::clone(&spool),
            forwarder_to(format!("http://{addr}/in"), 0),
            Arc::new(Stats::new()),
            Arc::clone(&alert) as Arc<dyn AlertSink>,
            watcher,
        );

        worker.tick().await;
        worker.tick().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 0, "exhausted records never forward");
        assert_eq!(alert.count(), 1, "exactly one alert on the transition");
        let records = spool.records().await.expect("records");
        assert_eq!(records.len(), 1, "files remain for manual recovery");
        assert_eq!(records[0].status, Status::Failed);
    }

    #[tokio::test]
    async fn terminal_response_consumes_one_attempt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = Spool::open(&spool_config(dir.path(), 1024, 5))
            .await
            .expect("spool opens");
        spool
            .store(&encoded_batch(b"rejected"), "receiver returned 503")
            .await
            .expect("store succeeds");

        let routes = warp::any().map(|| {
            warp::reply::with_status("nope", warp::http::StatusCode::BAD_REQUEST)
        });
        let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let (_broadcaster, watcher) = drayage_signal::signal();
        let worker = RetryWorker::new(
            Arc::clone(&spool),
            forwarder_to(format!("http://{addr}/in"), 0),
            Arc::new(Stats::new()),
            Arc::new(RecordingSink::default()),
            watcher,
        );
        worker.tick().await;

        let records = spool.records().await.expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].retry_count, 1);
        assert_eq!(records[0].status, Status::Retrying);
        assert!(records[0].last_retry.is_some());
        assert!(records[0].failure_reason.contains("400"));
    }

    #[tokio::test]
    async fn recent_attempts_are_not_repeated_within_the_interval() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spool = Spool::open(&spool_config(dir.path(), 1024, 5))
            .await
            .expect("spool opens");
        spool
            .store(&encoded_batch(b"patience"), "x")
            .await
            .expect("store succeeds");
        let mut meta = spool.records().await.expect("records")[0].clone();
        meta.retry_count = 1;
        meta.status = Status::Retrying;
        meta.last_retry = Some(Utc::now());
        spool.update_meta(&meta).await.expect("meta rewrite");

        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&attempts);
        let routes = warp::any().map(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            warp::reply()
        });
        let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        let (_broadcaster, watcher) = drayage_signal::signal();
        let worker = RetryWorker::new(
            Arc::clone(&spool),
            forwarder_to(format!("http://{addr}/in"), 0),
            Arc::new(Stats::new()),
            Arc::new(RecordingSink::default()),
            watcher,
        );
        worker.tick().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 0, "just-attempted record waits");
    }
}
