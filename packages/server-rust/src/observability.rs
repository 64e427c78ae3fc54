//! Logging and metrics initialization for the server binary.

use std::net::SocketAddr;
use std::sync::Once;

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Human-readable logs (for development).
    #[default]
    Pretty,
}

/// Installs the global tracing subscriber.
///
/// Levels come from `RUST_LOG` (default `info`). Subsequent calls are no-ops.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json().with_current_span(false))
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer())
                    .init();
            }
        }
    });
}

/// Installs the Prometheus recorder with a scrape endpoint on `addr` and
/// registers the server's metric descriptions.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or the listener
/// cannot be set up.
pub fn init_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    describe_counter!(
        "livesync_live_query_messages_total",
        "Diff messages published, by message type"
    );
    describe_counter!(
        "livesync_live_query_resyncs_total",
        "Diffs replaced by a full `all` message"
    );
    describe_counter!(
        "livesync_live_query_reevaluation_failures_total",
        "Live queries whose re-evaluation after a mutation failed"
    );
    describe_counter!(
        "livesync_transport_dropped_total",
        "Events dropped because a push stream's queue was full"
    );
    describe_gauge!("livesync_connections", "Open push streams");
}
