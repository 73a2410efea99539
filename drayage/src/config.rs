//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Most startup crashes
//! originate here, intentionally: a proxy with a half-understood
//! configuration must not touch the network.

use std::{net::SocketAddr, path::Path, path::PathBuf, time::Duration};

use byte_unit::Byte;
use rustc_hash::FxHashMap;
use serde::Deserialize;

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Configuration file could not be read.
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    /// Configuration parsed but described an unusable proxy.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_tenant_id() -> String {
    String::from("default")
}

fn default_app_name() -> String {
    String::from(env!("CARGO_PKG_NAME"))
}

fn default_app_version() -> String {
    String::from(env!("CARGO_PKG_VERSION"))
}

fn default_host() -> String {
    String::from("0.0.0.0")
}

fn default_read_buffer_size() -> Byte {
    Byte::from_bytes(64 * 1024)
}

fn default_channel_capacity() -> usize {
    1_000
}

fn default_max_batch_lines() -> u64 {
    1_000
}

fn default_max_batch_bytes() -> Byte {
    Byte::from_bytes(1024 * 1024)
}

fn default_batch_timeout_seconds() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_compression_level() -> u32 {
    6
}

fn default_receiver_timeout_seconds() -> u64 {
    30
}

fn default_retry_count() -> u32 {
    2
}

fn default_retry_delay_seconds() -> u64 {
    1
}

fn default_spool_directory() -> PathBuf {
    PathBuf::from("/var/spool/drayage")
}

fn default_spool_max_size() -> Byte {
    Byte::from_bytes(1024 * 1024 * 1024)
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_interval_seconds() -> u64 {
    60
}

fn default_cleanup_interval_seconds() -> u64 {
    300
}

fn default_soc_timeout_seconds() -> u64 {
    5
}

fn default_api_binding_addr() -> SocketAddr {
    "127.0.0.1:8385"
        .parse()
        .expect("Not possible to parse to SocketAddr")
}

fn default_shutdown_timeout_seconds() -> u64 {
    30
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Application identity, used for the outbound `User-Agent`
    #[serde(default)]
    pub app: AppConfig,
    /// Tenant applied to listeners that do not name their own
    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,
    /// Bearer token presented to the receiver, if any
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// The UDP ingest side: listeners and batching behavior
    pub udp: UdpConfig,
    /// The HTTP egress side: receiver endpoint and retry policy
    pub receiver: ReceiverConfig,
    /// Durable spooling of batches the receiver would not take
    #[serde(default)]
    pub spooling: SpoolingConfig,
    /// Outbound operational alerts
    #[serde(default)]
    pub soc: Option<SocConfig>,
    /// The management API
    #[serde(default)]
    pub api: ApiConfig,
    /// The method by which to express telemetry
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
    /// Upper bound on graceful shutdown, in seconds
    #[serde(default = "default_shutdown_timeout_seconds")]
    pub shutdown_timeout_seconds: u64,
}

/// Application identity configuration.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Name reported in the `User-Agent` header
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Version reported in the `User-Agent` header
    #[serde(default = "default_app_version")]
    pub version: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            version: default_app_version(),
        }
    }
}

impl AppConfig {
    /// The `User-Agent` value for outbound HTTP requests.
    #[must_use]
    pub fn user_agent(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }
}

/// One UDP listener entry.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Port to bind on the shared host address
    pub port: u16,
    /// Dataset id stamped on every datagram this listener receives
    pub dataset_id: String,
    /// Tenant id for this listener, falling back to the global tenant
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// Configuration of the UDP ingest side.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct UdpConfig {
    /// Address the listeners bind on
    #[serde(default = "default_host")]
    pub host: String,
    /// The listener entries, one socket each
    pub listeners: Vec<ListenerConfig>,
    /// Socket read buffer size; also the maximum accepted datagram size
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size_bytes: Byte,
    /// Capacity of the listener-to-batcher channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Seal a batch at this many lines; 0 disables the trigger
    #[serde(default = "default_max_batch_lines")]
    pub max_batch_lines: u64,
    /// Seal a batch at this many pre-encoding bytes; 0 disables the trigger
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: Byte,
    /// Seal all open batches this often
    #[serde(default = "default_batch_timeout_seconds")]
    pub batch_timeout_seconds: u64,
    /// Whether to gzip encoded batches
    #[serde(default = "default_true")]
    pub enable_compression: bool,
    /// Gzip level, 0 through 9
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
}

impl UdpConfig {
    /// The batch timeout as a [`Duration`].
    #[must_use]
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_seconds)
    }
}

/// Configuration of the downstream receiver.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
pub struct ReceiverConfig {
    /// Receiver URL; `{tenantid}` and `{datasetid}` are substituted
    /// literally per batch
    pub base_url: String,
    /// Per-request timeout, in seconds
    #[serde(default = "default_receiver_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Additional attempts after the initial try
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Fixed delay between attempts, in seconds
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
}

impl ReceiverConfig {
    /// The per-request timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// The inter-attempt delay as a [`Duration`].
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }
}

/// Configuration of the on-disk spool.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SpoolingConfig {
    /// Whether failed batches are spooled at all
    #[serde(default)]
    pub enabled: bool,
    /// Directory holding payload and metadata files
    #[serde(default = "default_spool_directory")]
    pub directory: PathBuf,
    /// Byte budget across all spooled payloads
    #[serde(default = "default_spool_max_size")]
    pub max_size_bytes: Byte,
    /// Retry budget per spooled record
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Seconds between retry passes, and the minimum age between attempts
    /// on a single record
    #[serde(default = "default_retry_interval_seconds")]
    pub retry_interval_seconds: u64,
    /// Seconds between cleanup passes
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    /// Keep records that exhausted their retry budget on disk for manual
    /// recovery; when false, cleanup deletes them
    #[serde(default = "default_true")]
    pub preserve_failed: bool,
}

impl Default for SpoolingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: default_spool_directory(),
            max_size_bytes: default_spool_max_size(),
            retry_attempts: default_retry_attempts(),
            retry_interval_seconds: default_retry_interval_seconds(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            preserve_failed: true,
        }
    }
}

impl SpoolingConfig {
    /// The retry cadence as a [`Duration`].
    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_seconds)
    }

    /// The cleanup cadence as a [`Duration`].
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

/// Configuration of the SOC alert endpoint.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
pub struct SocConfig {
    /// Whether alerts are delivered at all
    #[serde(default)]
    pub enabled: bool,
    /// Endpoint alerts are POSTed to
    pub endpoint: String,
    /// Per-delivery timeout, in seconds
    #[serde(default = "default_soc_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl SocConfig {
    /// The delivery timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Configuration of the management API.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    /// Whether the management API is served
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Address -- IP plus port -- to bind to
    #[serde(default = "default_api_binding_addr")]
    pub binding_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binding_addr: default_api_binding_addr(),
        }
    }
}

/// Defines the manner of drayage's telemetry.
///
/// When present, internal metrics are exposed for scraping at a prometheus
/// poll endpoint.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Address and port for prometheus exporter
    pub prometheus_addr: SocketAddr,
    /// Additional labels to include in every metric
    #[serde(default)]
    pub global_labels: FxHashMap<String, String>,
}

impl Config {
    /// Read and validate a configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Function will return an error if the file cannot be read, does not
    /// parse or fails validation.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Function will return an error if the string does not parse or fails
    /// validation.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.udp.listeners.is_empty() {
            return Err(Error::Invalid(String::from(
                "at least one udp listener must be configured",
            )));
        }
        if self.receiver.base_url.is_empty() {
            return Err(Error::Invalid(String::from(
                "receiver.base_url must not be empty",
            )));
        }
        if self.udp.compression_level > 9 {
            return Err(Error::Invalid(format!(
                "compression_level must be 0..=9, got {level}",
                level = self.udp.compression_level
            )));
        }
        if self.udp.read_buffer_size_bytes.get_bytes() == 0 {
            return Err(Error::Invalid(String::from(
                "read_buffer_size_bytes must be positive",
            )));
        }
        Ok(())
    }

    /// The graceful shutdown deadline as a [`Duration`].
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    /// The loaded configuration as a JSON document with secrets masked,
    /// served by the management API.
    #[must_use]
    pub fn masked_echo(&self) -> serde_json::Value {
        serde_json::json!({
            "app": {
                "name": self.app.name,
                "version": self.app.version,
            },
            "tenant_id": mask_secret(&self.tenant_id),
            "bearer_token": self.bearer_token.as_deref().map(mask_secret),
            "udp": {
                "host": self.udp.host,
                "listeners": self.udp.listeners.iter().map(|l| {
                    serde_json::json!({
                        "port": l.port,
                        "dataset_id": l.dataset_id,
                        "tenant_id": l.tenant_id.as_deref().map(mask_secret),
                    })
                }).collect::<Vec<_>>(),
                "read_buffer_size_bytes": self.udp.read_buffer_size_bytes.get_bytes() as u64,
                "channel_capacity": self.udp.channel_capacity,
                "max_batch_lines": self.udp.max_batch_lines,
                "max_batch_bytes": self.udp.max_batch_bytes.get_bytes() as u64,
                "batch_timeout_seconds": self.udp.batch_timeout_seconds,
                "enable_compression": self.udp.enable_compression,
                "compression_level": self.udp.compression_level,
            },
            "receiver": {
                "base_url": self.receiver.base_url,
                "timeout_seconds": self.receiver.timeout_seconds,
                "retry_count": self.receiver.retry_count,
                "retry_delay_seconds": self.receiver.retry_delay_seconds,
            },
            "spooling": {
                "enabled": self.spooling.enabled,
                "directory": self.spooling.directory.display().to_string(),
                "max_size_bytes": self.spooling.max_size_bytes.get_bytes() as u64,
                "retry_attempts": self.spooling.retry_attempts,
                "retry_interval_seconds": self.spooling.retry_interval_seconds,
                "cleanup_interval_seconds": self.spooling.cleanup_interval_seconds,
                "preserve_failed": self.spooling.preserve_failed,
            },
            "soc": self.soc.as_ref().map(|soc| serde_json::json!({
                "enabled": soc.enabled,
                "endpoint": soc.endpoint,
                "timeout_seconds": soc.timeout_seconds,
            })),
            "api": {
                "enabled": self.api.enabled,
                "binding_addr": self.api.binding_addr.to_string(),
            },
            "telemetry": self.telemetry.as_ref().map(|telemetry| serde_json::json!({
                "prometheus_addr": telemetry.prometheus_addr.to_string(),
            })),
            "shutdown_timeout_seconds": self.shutdown_timeout_seconds,
        })
    }
}

/// Mask a sensitive value as `<first4>***<last4>`.
///
/// Values of eight characters or fewer are fully masked: revealing both
/// ends would reveal most of the secret.
#[must_use]
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return String::from("***");
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}***{tail}")
}
