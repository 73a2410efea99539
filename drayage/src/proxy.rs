//! The supervisor: wires the pipeline together and runs it to completion.
//!
//! Startup order is leaves-first: spool workers, then the forwarding
//! drain, then the batcher, then the UDP listeners, then the management
//! API. Shutdown runs the same order in reverse without any explicit
//! sequencing: listeners observe the signal and exit, which closes the
//! ingress channel, which drains the batcher, which closes the sealed
//! channel, which finishes the forwarding drain. A hard deadline bounds
//! the whole unwind.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::admin;
use crate::alert::AlertSink;
use crate::batcher::{self, Batch, Batcher};
use crate::buffer_pool::BufferPool;
use crate::config::Config;
use crate::encoder::{EncodedBatch, Encoder};
use crate::forwarder::{self, ForwardError, Forwarder};
use crate::listener::{self, Pool};
use crate::spool::{self, CleanupWorker, RetryWorker, Spool};
use crate::stats::Stats;

/// Sealed batches in flight between the batcher and the forwarding drain.
const SEALED_CHANNEL_CAPACITY: usize = 32;

/// Errors produced by [`Proxy`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// See [`crate::listener::Error`] for details.
    #[error(transparent)]
    Listener(#[from] listener::Error),
    /// See [`crate::batcher::Error`] for details.
    #[error(transparent)]
    Batcher(#[from] batcher::Error),
    /// See [`crate::forwarder::BuildError`] for details.
    #[error(transparent)]
    Forwarder(#[from] forwarder::BuildError),
    /// See [`crate::spool::Error`] for details.
    #[error(transparent)]
    Spool(#[from] spool::Error),
    /// See [`crate::admin::Error`] for details.
    #[error(transparent)]
    Admin(#[from] admin::Error),
}

/// The assembled proxy.
#[derive(Debug)]
pub struct Proxy {
    config: Config,
    stats: Arc<Stats>,
    alert: Arc<dyn AlertSink>,
}

impl Proxy {
    /// Create a new [`Proxy`] around a validated configuration.
    #[must_use]
    pub fn new(config: Config, alert: Arc<dyn AlertSink>) -> Self {
        Self {
            config,
            stats: Arc::new(Stats::new()),
            alert,
        }
    }

    /// The proxy's statistics handle, shared with the management API.
    #[must_use]
    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    /// Run the pipeline until `shutdown` fires, then drain it within the
    /// configured deadline.
    ///
    /// # Errors
    ///
    /// Function will return an error if any component fails to start. Once
    /// the pipeline is up, component failures are logged, not returned:
    /// one broken piece must not take down the rest of the proxy.
    pub async fn run(self, shutdown: drayage_signal::Watcher) -> Result<(), Error> {
        let Proxy {
            config,
            stats,
            alert,
        } = self;

        let forwarder = Arc::new(Forwarder::new(
            &config.receiver,
            &config.app,
            config.bearer_token.clone(),
        )?);
        let encoder = Encoder::new(config.udp.enable_compression, config.udp.compression_level);
        let spool = if config.spooling.enabled {
            Some(Spool::open(&config.spooling).await?)
        } else {
            None
        };

        let (ingress_tx, ingress_rx) = mpsc::channel(config.udp.channel_capacity);
        let (sealed_tx, sealed_rx) = mpsc::channel::<Batch>(SEALED_CHANNEL_CAPACITY);

        let mut tasks: Vec<(&'static str, JoinHandle<Result<(), Error>>)> = Vec::new();

        if let Some(spool) = &spool {
            let retry = RetryWorker::new(
                Arc::clone(spool),
                Arc::clone(&forwarder),
                Arc::clone(&stats),
                Arc::clone(&alert),
                shutdown.clone(),
            );
            tasks.push((
                "spool-retry",
                tokio::spawn(async move {
                    retry.spin().await;
                    Ok(())
                }),
            ));
            let cleanup = CleanupWorker::new(Arc::clone(spool), shutdown.clone());
            tasks.push((
                "spool-cleanup",
                tokio::spawn(async move {
                    cleanup.spin().await;
                    Ok(())
                }),
            ));
        }

        {
            let forwarder = Arc::clone(&forwarder);
            let stats = Arc::clone(&stats);
            let alert = Arc::clone(&alert);
            let spool = spool.clone();
            tasks.push((
                "forward",
                tokio::spawn(async move {
                    drain_sealed(sealed_rx, encoder, forwarder, spool, stats, alert).await;
                    Ok(())
                }),
            ));
        }

        let batcher = Batcher::new(&config.udp, ingress_rx, sealed_tx, Arc::clone(&stats));
        tasks.push((
            "batcher",
            tokio::spawn(async move { batcher.spin().await.map_err(Error::from) }),
        ));

        let buffers = BufferPool::new(
            config.udp.read_buffer_size_bytes.get_bytes() as usize,
            config.udp.listeners.len().saturating_mul(2).max(2),
        );
        let pool = Pool::new(
            &config.udp,
            &config.tenant_id,
            ingress_tx,
            buffers,
            Arc::clone(&stats),
            Arc::clone(&alert),
            shutdown.clone(),
        )?;
        tasks.push((
            "listeners",
            tokio::spawn(async move { pool.spin().await.map_err(Error::from) }),
        ));

        if config.api.enabled {
            let server =
                admin::Server::new(&config.api, &config, Arc::clone(&stats), shutdown.clone());
            tasks.push((
                "admin",
                tokio::spawn(async move { server.run().await.map_err(Error::from) }),
            ));
        }

        info!(
            listeners = config.udp.listeners.len(),
            spooling = config.spooling.enabled,
            "drayage pipeline running"
        );
        shutdown.clone().recv().await;
        info!("shutdown signal received; draining pipeline");

        let deadline = config.shutdown_timeout();
        let drain = async {
            for (name, handle) in tasks {
                match handle.await {
                    Ok(Ok(())) => debug!(task = name, "task drained"),
                    Ok(Err(err)) => error!(task = name, "task failed: {err}"),
                    Err(err) => error!(task = name, "task panicked: {err}"),
                }
            }
        };
        if tokio::time::timeout(deadline, drain).await.is_err() {
            warn!(
                deadline_seconds = deadline.as_secs(),
                "shutdown deadline expired; abandoning unfinished work"
            );
        }
        Ok(())
    }
}

/// The forwarding drain: encode each sealed batch and deliver it, routing
/// failures to the spool when one is configured.
async fn drain_sealed(
    mut sealed: mpsc::Receiver<Batch>,
    encoder: Encoder,
    forwarder: Arc<Forwarder>,
    spool: Option<Arc<Spool>>,
    stats: Arc<Stats>,
    alert: Arc<dyn AlertSink>,
) {
    while let Some(batch) = sealed.recv().await {
        let encoded = match encoder.encode(&batch) {
            Ok(Some(encoded)) => encoded,
            Ok(None) => continue,
            Err(err) => {
                stats.record_forwarding_error();
                alert.warning(
                    "batch encoding failed",
                    &format!("dropping batch {id}", id = batch.id),
                    Some(&err.to_string()),
                );
                continue;
            }
        };
        match forwarder.forward(&encoded).await {
            Ok(()) => stats.record_batch_forwarded(encoded.original_bytes),
            Err(err) => {
                stats.record_forwarding_error();
                if err.is_terminal() {
                    alert.warning(
                        "receiver rejected batch",
                        &format!("batch {id} was refused by the receiver", id = encoded.id),
                        Some(&err.to_string()),
                    );
                }
                route_to_spool(spool.as_ref(), &encoded, &err, &stats, alert.as_ref()).await;
            }
        }
    }
    debug!("sealed channel closed; forwarding drain complete");
}

async fn route_to_spool(
    spool: Option<&Arc<Spool>>,
    encoded: &EncodedBatch,
    err: &ForwardError,
    stats: &Stats,
    alert: &dyn AlertSink,
) {
    let Some(spool) = spool else {
        warn!(batch_id = %encoded.id, "spooling disabled; dropping undeliverable batch");
        return;
    };
    match spool.store(encoded, &err.to_string()).await {
        Ok(()) => stats.record_spooled(),
        Err(store_err) if store_err.is_full() => {
            alert.critical(
                "spool full",
                &format!("dropping batch {id}", id = encoded.id),
                Some(&store_err.to_string()),
            );
        }
        Err(store_err) => {
            alert.critical(
                "spool write failed",
                &format!("dropping batch {id}", id = encoded.id),
                Some(&store_err.to_string()),
            );
        }
    }
}
