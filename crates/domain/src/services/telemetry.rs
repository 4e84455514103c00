use std::{env, net::SocketAddr};

use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::hydrate_env_file;

const DEFAULT_LOG_FILTER: &str = "info";

static TRACING_READY: OnceCell<()> = OnceCell::new();
static RECORDER_READY: OnceCell<()> = OnceCell::new();

/// Logging and metrics knobs read from `<PREFIX>_LOG_FILTER` and
/// `<PREFIX>_METRICS_ADDRESS`.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    log_filter: String,
    metrics_address: Option<String>,
}

/// Where recorded metrics end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsSink {
    /// Recorded in process only; nothing scrapes them.
    InProcess,
    /// Served to Prometheus scrapers on this address.
    Scrape(SocketAddr),
}

impl TelemetryConfig {
    pub fn from_env(prefix: &str) -> Self {
        let _ = hydrate_env_file();
        let prefix = prefix.trim().to_ascii_uppercase();
        Self {
            log_filter: non_blank_var(&format!("{prefix}_LOG_FILTER"))
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            metrics_address: non_blank_var(&format!("{prefix}_METRICS_ADDRESS")),
        }
    }

    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    pub fn metrics_address(&self) -> Option<&str> {
        self.metrics_address.as_deref()
    }

    pub fn metrics_sink(&self) -> Result<MetricsSink, TelemetryError> {
        match self.metrics_address() {
            None => Ok(MetricsSink::InProcess),
            Some(addr) => addr.parse().map(MetricsSink::Scrape).map_err(
                |err: std::net::AddrParseError| {
                    TelemetryError::InvalidMetricsAddress(addr.to_string(), err.to_string())
                },
            ),
        }
    }
}

fn non_blank_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Installs the tracing subscriber and the metrics recorder. Repeated calls
/// are no-ops. A scrape listener needs a running tokio runtime.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = parse_filter(config.log_filter())?;
    let sink = config.metrics_sink()?;

    TRACING_READY.get_or_try_init(|| {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .map_err(|err| TelemetryError::Tracing(err.to_string()))
    })?;
    RECORDER_READY.get_or_try_init(|| install_recorder(sink))?;
    Ok(())
}

fn parse_filter(directives: &str) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(directives).map_err(|err| TelemetryError::InvalidLogFilter(err.to_string()))
}

fn install_recorder(sink: MetricsSink) -> Result<(), TelemetryError> {
    let builder = PrometheusBuilder::new();
    let MetricsSink::Scrape(socket) = sink else {
        builder
            .install_recorder()
            .map_err(|err| TelemetryError::Metrics(err.to_string()))?;
        return Ok(());
    };

    let (recorder, exporter) = builder
        .with_http_listener(socket)
        .build()
        .map_err(|err| TelemetryError::Metrics(err.to_string()))?;
    metrics::set_global_recorder(recorder)
        .map_err(|err| TelemetryError::Metrics(err.to_string()))?;
    tokio::spawn(async move {
        if let Err(err) = exporter.await {
            warn!(?err, "metrics listener stopped");
        }
    });
    info!(%socket, "serving prometheus metrics");
    Ok(())
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    InvalidLogFilter(String),
    #[error("failed to install tracing subscriber: {0}")]
    Tracing(String),
    #[error("invalid metrics address `{0}`: {1}")]
    InvalidMetricsAddress(String, String),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}
