//! Operational alert emission.
//!
//! Core components hold an [`AlertSink`] capability rather than a concrete
//! client, which keeps the data path testable. Alerts are fire-and-forget:
//! a sink that cannot deliver logs the failure and never propagates it into
//! the pipeline.

use std::fmt;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{AppConfig, Config, SocConfig};

/// How urgently an operator should care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Data is being lost right now.
    Critical,
    /// Data will be lost without intervention.
    High,
    /// Degraded but recovering on its own.
    Warning,
    /// Operational notice.
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        f.write_str(name)
    }
}

/// Errors produced while constructing a sink.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The alert HTTP client could not be built.
    #[error("Failed to build alert client: {0}")]
    Client(#[from] reqwest::Error),
}

/// The alert capability handed to every component.
pub trait AlertSink: Send + Sync + fmt::Debug {
    /// Emit an alert at the given severity.
    fn alert(&self, severity: Severity, title: &str, message: &str, detail: Option<&str>);

    /// Emit a [`Severity::Critical`] alert.
    fn critical(&self, title: &str, message: &str, detail: Option<&str>) {
        self.alert(Severity::Critical, title, message, detail);
    }

    /// Emit a [`Severity::Warning`] alert.
    fn warning(&self, title: &str, message: &str, detail: Option<&str>) {
        self.alert(Severity::Warning, title, message, detail);
    }

    /// Emit a [`Severity::Info`] alert.
    fn info(&self, title: &str, message: &str, detail: Option<&str>) {
        self.alert(Severity::Info, title, message, detail);
    }
}

/// A sink that only writes to the process log. The development default.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl AlertSink for LogSink {
    fn alert(&self, severity: Severity, title: &str, message: &str, detail: Option<&str>) {
        match severity {
            Severity::Critical | Severity::High => {
                error!(%severity, title, detail, "{message}");
            }
            Severity::Warning => warn!(%severity, title, detail, "{message}"),
            Severity::Info => info!(%severity, title, detail, "{message}"),
        }
    }
}

#[derive(Serialize)]
struct SocAlert<'a> {
    severity: Severity,
    title: &'a str,
    message: &'a str,
    detail: Option<&'a str>,
    source: &'a str,
    timestamp: String,
}

/// A sink that POSTs alerts to a SOC endpoint as JSON.
#[derive(Debug)]
pub struct SocSink {
    client: reqwest::Client,
    endpoint: String,
    source: String,
}

impl SocSink {
    /// Create a new [`SocSink`] from configuration.
    ///
    /// # Errors
    ///
    /// Function will return an error if the HTTP client cannot be built.
    pub fn new(config: &SocConfig, app: &AppConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(app.user_agent())
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            source: app.name.clone(),
        })
    }
}

impl AlertSink for SocSink {
    fn alert(&self, severity: Severity, title: &str, message: &str, detail: Option<&str>) {
        // keep the operator's log trail even when delivery works
        LogSink.alert(severity, title, message, detail);

        let body = serde_json::to_value(SocAlert {
            severity,
            title,
            message,
            detail,
            source: &self.source,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
        });
        let body = match body {
            Ok(body) => body,
            Err(err) => {
                warn!("unable to serialize alert payload: {err}");
                return;
            }
        };

        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            match client.post(&endpoint).json(&body).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    warn!(status = %response.status(), "alert delivery rejected");
                }
                Err(err) => warn!("alert delivery failed: {err}"),
            }
        });
    }
}

/// Build the sink described by the configuration: a [`SocSink`] when the
/// `soc` section is present and enabled, a [`LogSink`] otherwise.
///
/// # Errors
///
/// Function will return an error if the SOC HTTP client cannot be built.
pub fn from_config(config: &Config) -> Result<Arc<dyn AlertSink>, Error> {
    match &config.soc {
        Some(soc) if soc.enabled => Ok(Arc::new(SocSink::new(soc, &config.app)?)),
        _ => Ok(Arc::new(LogSink)),
    }
}
