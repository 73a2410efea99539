//! Process-wide ingest and forwarding counters.
//!
//! Counters are plain atomics: every component increments without locking
//! and the management API reads a best-effort snapshot. Readers accept that
//! counters may advance between successive fields of a snapshot.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

/// Shared counters for the whole pipeline.
#[derive(Debug)]
pub struct Stats {
    started_at: Instant,
    messages_received: AtomicU64,
    message_errors: AtomicU64,
    bytes_received: AtomicU64,
    batches_created: AtomicU64,
    batches_forwarded: AtomicU64,
    bytes_forwarded: AtomicU64,
    forwarding_errors: AtomicU64,
    spooled_batches: AtomicU64,
    /// Unix seconds of the most recent datagram; 0 until the first one.
    last_activity: AtomicI64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    /// Create a zeroed [`Stats`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            messages_received: AtomicU64::new(0),
            message_errors: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            batches_created: AtomicU64::new(0),
            batches_forwarded: AtomicU64::new(0),
            bytes_forwarded: AtomicU64::new(0),
            forwarding_errors: AtomicU64::new(0),
            spooled_batches: AtomicU64::new(0),
            last_activity: AtomicI64::new(0),
        }
    }

    /// Record one accepted datagram of `bytes` sanitized payload bytes.
    pub fn record_message(&self, bytes: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Record one datagram lost to a read error or a full channel.
    pub fn record_message_error(&self) {
        self.message_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the opening of a new batch.
    pub fn record_batch_created(&self) {
        self.batches_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch delivered to the receiver, of `bytes` pre-encoding
    /// payload bytes.
    pub fn record_batch_forwarded(&self, bytes: u64) {
        self.batches_forwarded.fetch_add(1, Ordering::Relaxed);
        self.bytes_forwarded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a batch the receiver would not take.
    pub fn record_forwarding_error(&self) {
        self.forwarding_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch persisted to the spool.
    pub fn record_spooled(&self) {
        self.spooled_batches.fetch_add(1, Ordering::Relaxed);
    }

    /// A point-in-time read of every counter.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let last_activity = match self.last_activity.load(Ordering::Relaxed) {
            0 => None,
            secs => Utc.timestamp_opt(secs, 0).single(),
        };
        Snapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            message_errors: self.message_errors.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            batches_created: self.batches_created.load(Ordering::Relaxed),
            batches_forwarded: self.batches_forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            forwarding_errors: self.forwarding_errors.load(Ordering::Relaxed),
            spooled_batches: self.spooled_batches.load(Ordering::Relaxed),
            last_activity,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Seconds since this process started counting.
    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// A consistent-enough read of [`Stats`], served by the management API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Snapshot {
    /// Datagrams accepted across all listeners
    pub messages_received: u64,
    /// Datagrams lost to read errors or backpressure
    pub message_errors: u64,
    /// Sanitized payload bytes accepted
    pub bytes_received: u64,
    /// Batches opened by the batcher
    pub batches_created: u64,
    /// Batches delivered to the receiver
    pub batches_forwarded: u64,
    /// Pre-encoding payload bytes delivered
    pub bytes_forwarded: u64,
    /// Batches the receiver would not take
    pub forwarding_errors: u64,
    /// Batches persisted to the spool
    pub spooled_batches: u64,
    /// Time of the most recent datagram, if any
    pub last_activity: Option<DateTime<Utc>>,
    /// Seconds since process start
    pub uptime_seconds: u64,
}
