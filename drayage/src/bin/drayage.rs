use std::path::PathBuf;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};

use drayage::{alert, config::Config, proxy::Proxy};

#[derive(Parser, Debug)]
#[clap(author, version, about = "An on-premises UDP ingestion proxy", long_about = None)]
struct Args {
    /// Path to the drayage configuration file
    #[clap(short, long)]
    config: PathBuf,

    /// Validate the configuration and exit
    #[clap(long)]
    check: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] drayage::config::Error),
    #[error(transparent)]
    Alert(#[from] drayage::alert::Error),
    #[error(transparent)]
    Proxy(#[from] drayage::proxy::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Failed to install prometheus exporter: {0}")]
    Telemetry(#[from] metrics_exporter_prometheus::BuildError),
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .finish()
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    if args.check {
        info!(
            path = %args.config.display(),
            "configuration OK"
        );
        return Ok(());
    }

    if let Some(telemetry) = &config.telemetry {
        let mut builder = PrometheusBuilder::new().with_http_listener(telemetry.prometheus_addr);
        for (key, value) in &telemetry.global_labels {
            builder = builder.add_global_label(key.as_str(), value.as_str());
        }
        builder.install()?;
        info!(prometheus_addr = %telemetry.prometheus_addr, "telemetry exporter installed");
    }

    let alert = alert::from_config(&config)?;
    let (broadcaster, watcher) = drayage_signal::signal();

    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::spawn(async move {
        #[cfg(unix)]
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("interrupt received");
        }
        broadcaster.signal();
    });

    let proxy = Proxy::new(config, alert);
    proxy.run(watcher).await?;
    info!("drayage exited cleanly");
    Ok(())
}
