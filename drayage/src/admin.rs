//! The management API.
//!
//! Read-only HTTP surface over the pipeline's statistics and a masked echo
//! of the loaded configuration. Serves three endpoints: `GET /healthz`,
//! `GET /stats` and `GET /config`. Everything else is a 404; non-GET
//! methods are a 405.
//!
//! ## Metrics
//!
//! `requests_received`: Total management requests received
//!

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::{header, service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use metrics::counter;
use tokio::{pin, task::JoinSet};
use tracing::{debug, error, info};

use crate::config::{ApiConfig, Config};
use crate::stats::Stats;

const CONCURRENT_REQUESTS_MAX: usize = 16;

/// Errors produced by [`Server`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`hyper::Error`].
    #[error(transparent)]
    Hyper(#[from] hyper::Error),
    /// Serialization Error
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

async fn srv(
    req: Request<hyper::body::Incoming>,
    stats: Arc<Stats>,
    config_echo: Arc<serde_json::Value>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Error> {
    counter!("requests_received", "component" => "admin").increment(1);

    let mut response = Response::default();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );

    match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => {
            let body = serde_json::to_vec(&serde_json::json!({
                "status": "ok",
                "uptime_seconds": stats.uptime_seconds(),
            }))?;
            *response.body_mut() = crate::full(body);
        }
        (&Method::GET, "/stats") => {
            let body = serde_json::to_vec(&stats.snapshot())?;
            *response.body_mut() = crate::full(body);
        }
        (&Method::GET, "/config") => {
            let body = serde_json::to_vec(config_echo.as_ref())?;
            *response.body_mut() = crate::full(body);
        }
        (&Method::GET, _) => {
            *response.status_mut() = StatusCode::NOT_FOUND;
        }
        _ => {
            *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED;
        }
    }

    Ok(response)
}

/// The management API server.
#[derive(Debug)]
pub struct Server {
    binding_addr: SocketAddr,
    stats: Arc<Stats>,
    config_echo: Arc<serde_json::Value>,
    shutdown: drayage_signal::Watcher,
}

impl Server {
    /// Create a new [`Server`] instance.
    ///
    /// The config echo is computed once at startup: the configuration does
    /// not change while the process runs.
    #[must_use]
    pub fn new(
        api: &ApiConfig,
        config: &Config,
        stats: Arc<Stats>,
        shutdown: drayage_signal::Watcher,
    ) -> Self {
        Self {
            binding_addr: api.binding_addr,
            stats,
            config_echo: Arc::new(config.masked_echo()),
            shutdown,
        }
    }

    /// Run [`Server`] to completion
    ///
    /// This function runs the management API forever, unless a shutdown
    /// signal is received or an unrecoverable error is encountered.
    ///
    /// # Errors
    ///
    /// Function will return an error if the server cannot bind its address.
    pub async fn run(self) -> Result<(), Error> {
        let listener = tokio::net::TcpListener::bind(&self.binding_addr).await?;
        info!(binding_addr = %self.binding_addr, "management API listening");
        let sem = Arc::new(tokio::sync::Semaphore::new(CONCURRENT_REQUESTS_MAX));
        let mut join_set = JoinSet::new();

        let shutdown = self.shutdown.recv();
        pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("shutdown signal received");
                    break;
                }
                incoming = listener.accept() => {
                    let (stream, addr) = match incoming {
                        Ok((s, a)) => (s, a),
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let stats = Arc::clone(&self.stats);
                    let config_echo = Arc::clone(&self.config_echo);
                    let sem = Arc::clone(&sem);
                    join_set.spawn(async move {
                        debug!("accepted connection from {addr}");
                        let permit = match sem.acquire_owned().await {
                            Ok(p) => p,
                            Err(e) => {
                                error!("semaphore closed: {e}");
                                return;
                            }
                        };
                        let builder = auto::Builder::new(TokioExecutor::new());
                        let serve_future = builder.serve_connection(
                            TokioIo::new(stream),
                            service_fn(move |req| {
                                srv(req, Arc::clone(&stats), Arc::clone(&config_echo))
                            }),
                        );

                        if let Err(e) = serve_future.await {
                            error!("error serving management request: {e}");
                        }
                        drop(permit);
                    });
                }
            }
        }

        drop(listener);
        while join_set.join_next().await.is_some() {}
        Ok(())
    }
}
