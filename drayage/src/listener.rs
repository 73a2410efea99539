//! The UDP listener pool.
//!
//! One socket and one reader task per configured listener entry. Readers
//! borrow a buffer from the shared [`BufferPool`], read a single datagram,
//! sanitize it and hand the result to the batcher over a bounded channel.
//! The channel enqueue never blocks: when the batcher cannot keep up the
//! datagram is dropped at the edge, which is the correct end of the pipe to
//! lose lossy traffic at.
//!
//! ## Metrics
//!
//! `datagrams_received`: Datagrams accepted and enqueued
//! `bytes_received`: Sanitized payload bytes accepted
//! `datagrams_dropped`: Datagrams lost to a full channel
//! `receive_errors`: Failed socket reads
//!

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use metrics::counter;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use crate::alert::AlertSink;
use crate::buffer_pool::BufferPool;
use crate::config::UdpConfig;
use crate::stats::Stats;

/// One successfully received, sanitized datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Sanitized datagram bytes; never empty
    pub payload: Bytes,
    /// Printable remote endpoint, `address:port`
    pub source: String,
    /// Wall-clock time of the read
    pub received_at: DateTime<Utc>,
    /// Tenant of the listener that received the datagram
    pub tenant_id: String,
    /// Dataset of the listener that received the datagram
    pub dataset_id: String,
}

/// Errors produced by [`Pool`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The configured host does not parse as an IP address.
    #[error("Invalid bind host: {0}")]
    Host(#[from] std::net::AddrParseError),
    /// Child sub-task error.
    #[error("Child join error: {0}")]
    Child(JoinError),
}

/// The UDP listener pool.
///
/// Binds every configured socket up front, so a port that cannot be taken
/// fails startup instead of surfacing minutes later.
#[derive(Debug)]
pub struct Pool {
    handles: Vec<JoinHandle<Result<(), Error>>>,
    shutdown: drayage_signal::Watcher,
}

impl Pool {
    /// Create a new [`Pool`], binding one socket per listener entry and
    /// spawning its reader task.
    ///
    /// # Errors
    ///
    /// Function will return an error if any socket cannot be created or
    /// bound.
    pub fn new(
        config: &UdpConfig,
        default_tenant: &str,
        ingress: mpsc::Sender<Message>,
        buffers: Arc<BufferPool>,
        stats: Arc<Stats>,
        alert: Arc<dyn AlertSink>,
        shutdown: drayage_signal::Watcher,
    ) -> Result<Self, Error> {
        let host = IpAddr::from_str(&config.host)?;
        let read_buffer_size = config.read_buffer_size_bytes.get_bytes() as usize;

        let mut handles = Vec::with_capacity(config.listeners.len());
        for entry in &config.listeners {
            let addr = SocketAddr::new(host, entry.port);
            let socket = bind_socket(addr, read_buffer_size)?;
            let tenant_id = entry
                .tenant_id
                .clone()
                .unwrap_or_else(|| default_tenant.to_string());
            let reader = Reader {
                socket,
                port: entry.port,
                tenant_id,
                dataset_id: entry.dataset_id.clone(),
                ingress: ingress.clone(),
                buffers: Arc::clone(&buffers),
                stats: Arc::clone(&stats),
                alert: Arc::clone(&alert),
                shutdown: shutdown.clone(),
            };
            handles.push(tokio::spawn(reader.spin()));
        }

        Ok(Self { handles, shutdown })
    }

    /// Run the [`Pool`] until a shutdown signal is received, then wait for
    /// every reader to exit.
    ///
    /// # Errors
    ///
    /// Function will return an error if any reader loop failed.
    pub async fn spin(mut self) -> Result<(), Error> {
        self.shutdown.recv().await;
        info!("shutdown signal received");
        for res in join_all(self.handles.drain(..)).await {
            match res {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => return Err(err),
                Err(err) => return Err(Error::Child(err)),
            }
        }
        Ok(())
    }
}

fn bind_socket(addr: SocketAddr, read_buffer_size: usize) -> Result<UdpSocket, Error> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    // A kernel capped below rmem_max silently clamps this; not fatal.
    if let Err(err) = socket.set_recv_buffer_size(read_buffer_size) {
        warn!(
            %addr,
            read_buffer_size, "unable to raise socket read buffer: {err}"
        );
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

#[derive(Debug)]
struct Reader {
    socket: UdpSocket,
    port: u16,
    tenant_id: String,
    dataset_id: String,
    ingress: mpsc::Sender<Message>,
    buffers: Arc<BufferPool>,
    stats: Arc<Stats>,
    alert: Arc<dyn AlertSink>,
    shutdown: drayage_signal::Watcher,
}

impl Reader {
    async fn spin(self) -> Result<(), Error> {
        debug!(
            port = self.port,
            dataset_id = %self.dataset_id,
            "listener running"
        );
        let labels = vec![
            ("component".to_string(), "listener".to_string()),
            ("port".to_string(), self.port.to_string()),
            ("dataset_id".to_string(), self.dataset_id.clone()),
        ];

        let shutdown = self.shutdown.clone().recv();
        tokio::pin!(shutdown);
        loop {
            let mut buf = self.buffers.acquire();
            tokio::select! {
                () = &mut shutdown => {
                    info!(port = self.port, "shutdown signal received");
                    return Ok(());
                }
                res = self.socket.recv_from(&mut buf) => {
                    match res {
                        Ok((len, peer)) => {
                            let Some(payload) = sanitize(&buf[..len]) else {
                                continue;
                            };
                            let message = Message {
                                payload,
                                source: peer.to_string(),
                                received_at: Utc::now(),
                                tenant_id: self.tenant_id.clone(),
                                dataset_id: self.dataset_id.clone(),
                            };
                            let bytes = message.payload.len() as u64;
                            match deliver(message, &self.ingress, &self.stats) {
                                Delivery::Accepted => {
                                    counter!("datagrams_received", &labels).increment(1);
                                    counter!("bytes_received", &labels).increment(bytes);
                                }
                                Delivery::Dropped => {
                                    counter!("datagrams_dropped", &labels).increment(1);
                                }
                                Delivery::Closed => {
                                    // batcher is gone; nothing left to feed
                                    return Ok(());
                                }
                            }
                        }
                        Err(err) => {
                            self.stats.record_message_error();
                            counter!("receive_errors", &labels).increment(1);
                            self.alert.warning(
                                "udp listener failure",
                                &format!("read failed on port {port}", port = self.port),
                                Some(&err.to_string()),
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Outcome of a non-blocking handoff to the batcher.
#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    Accepted,
    Dropped,
    Closed,
}

fn deliver(message: Message, ingress: &mpsc::Sender<Message>, stats: &Stats) -> Delivery {
    let bytes = message.payload.len() as u64;
    match ingress.try_send(message) {
        Ok(()) => {
            stats.record_message(bytes);
            Delivery::Accepted
        }
        Err(TrySendError::Full(_)) => {
            stats.record_message_error();
            Delivery::Dropped
        }
        Err(TrySendError::Closed(_)) => Delivery::Closed,
    }
}

/// Strip NUL and backspace bytes and trim surrounding ASCII whitespace.
/// Returns `None` when nothing survives.
fn sanitize(data: &[u8]) -> Option<Bytes> {
    let mut cleaned: Vec<u8> = data
        .iter()
        .copied()
        .filter(|byte| *byte != 0x00 && *byte != 0x08)
        .collect();
    let start = cleaned.iter().position(|byte| !byte.is_ascii_whitespace())?;
    let end = cleaned
        .iter()
        .rposition(|byte| !byte.is_ascii_whitespace())?
        + 1;
    cleaned.truncate(end);
    cleaned.drain(..start);
    Some(Bytes::from(cleaned))
}
