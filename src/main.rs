//! Vigil Binary Entry Point
//!
//! Runs the agent: collectors polled on every tick, the ingestion listener,
//! and the configured outputter draining the shared queue.
//! Core functionality is provided by the `vigil` library crate.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil::{
    collector::{CollectorContext, CollectorRegistry, MeasurementSender},
    config::{AgentConfig, OutputKind, parse_duration},
    output,
};

/// Configuration file read when `--config` is not given. May be absent.
const DEFAULT_CONFIG_PATH: &str = "configs/config.yaml";

/// Vigil - Host Metrics Agent
#[derive(Parser, Debug)]
#[command(name = "vigil", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file [default: configs/config.yaml, optional]
    #[arg(short, long, env = "VIGIL_CONFIG")]
    config: Option<PathBuf>,

    /// Tick interval, e.g. "10s" (overrides config file)
    #[arg(long, env = "VIGIL_INTERVAL", value_parser = parse_duration)]
    interval: Option<Duration>,

    /// Comma separated collector names (overrides config file)
    #[arg(long, env = "VIGIL_COLLECTORS", value_delimiter = ',')]
    collectors: Option<Vec<String>>,

    /// Outputter: stdout-derived, stdout-raw or http (overrides config file)
    #[arg(long, env = "VIGIL_OUTPUT")]
    output: Option<OutputKind>,

    /// Metric name prefix (overrides config file)
    #[arg(long, env = "VIGIL_PREFIX")]
    prefix: Option<String>,

    /// Measurement source (overrides config file)
    #[arg(long, env = "VIGIL_SOURCE")]
    source: Option<String>,

    /// Listener address as <transport>,<address> (overrides config file)
    #[arg(long, env = "VIGIL_LISTEN")]
    listen: Option<String>,

    /// Metrics API URL (overrides config file)
    #[arg(long, env = "VIGIL_HTTP_URL")]
    http_url: Option<String>,

    /// Metrics API user (overrides config file)
    #[arg(long, env = "VIGIL_HTTP_USER")]
    http_user: Option<String>,

    /// Metrics API token (overrides config file)
    #[arg(long, env = "VIGIL_HTTP_TOKEN", hide_env_values = true)]
    http_token: Option<String>,
}

impl Cli {
    /// Apply CLI/env overrides (CLI > ENV > config file).
    fn apply(self, config: &mut AgentConfig) {
        if let Some(interval) = self.interval {
            config.interval = interval;
        }
        if let Some(collectors) = self.collectors {
            config.collectors = collectors;
        }
        if let Some(output) = self.output {
            config.output = output;
        }
        if let Some(prefix) = self.prefix {
            config.prefix = Some(prefix);
        }
        if let Some(source) = self.source {
            config.source = Some(source);
        }
        if let Some(listen) = self.listen {
            config.listen.address = listen;
        }
        if let Some(url) = self.http_url {
            config.http.url = url;
        }
        if let Some(user) = self.http_user {
            config.http.user = Some(user);
        }
        if let Some(token) = self.http_token {
            config.http.token = Some(token);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let started_at = Instant::now();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration from file; validated once overrides are applied
    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!(path = %path.display(), "Loading configuration");
            AgentConfig::read(path)?
        }
        None => {
            tracing::debug!(path = DEFAULT_CONFIG_PATH, "Loading configuration if present");
            AgentConfig::read_or_default(DEFAULT_CONFIG_PATH)?
        }
    };
    cli.apply(&mut config);
    config.validate()?;
    let config = Arc::new(config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        interval = ?config.interval,
        output = %config.output,
        collectors = ?config.collectors,
        "Vigil starting"
    );

    // Shared queue: collectors -> outputter
    let (sender, rx) = MeasurementSender::channel(config.channel_capacity);
    let _output_tasks = output::build(&config)?.start(rx);

    // Collectors are built once; a listener that cannot bind aborts startup here.
    let ctx = CollectorContext::new(sender, config.clone()).with_started_at(started_at);
    let registry =
        CollectorRegistry::from_names(&config.collectors, &ctx, config.strict_collectors)?;
    tracing::info!(collectors = ?registry.names(), "Collectors ready");

    registry.run(config.interval, shutdown_signal()).await;

    tracing::info!("Shutting down collectors...");
    registry.shutdown();

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }
}
