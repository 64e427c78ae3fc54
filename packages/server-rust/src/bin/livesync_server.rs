//! # livesync-server
//!
//! Standalone live query server: SSE push streams, the live query registry,
//! and the diff publisher over in-memory entity repositories.
//!
//! ```bash
//! # In-memory registry, two entities
//! livesync-server --port 8080 --entity tasks,projects
//!
//! # Durable registry with JSON logs and a Prometheus endpoint
//! livesync-server --storage redb --redb-path /var/lib/livesync/queries.redb \
//!     --log-format json --metrics-addr 0.0.0.0:9090
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use livesync_server::live_query::{LiveQueryGc, LiveQueryStorage, MemoryLiveQueryStorage};
use livesync_server::network::{LiveQueryWiring, TlsConfig};
use livesync_server::observability::{init_logging, init_metrics, LogFormat};
use livesync_server::repository::MemoryRepositoryProvider;
use livesync_server::service::BackgroundWorker;
use livesync_server::transport::{BrokerConfig, BrokerSubscriptionServer};
use livesync_server::{
    LiveQueryConfig, LiveQueryPublisher, NetworkConfig, NetworkModule, ServerConfig,
    SubscriptionServer,
};

// ============================================================================
// CLI Arguments
// ============================================================================

/// Live query registry backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StorageKind {
    Memory,
    Redb,
    Postgres,
}

/// livesync live query server.
#[derive(Debug, Parser)]
#[command(name = "livesync-server")]
#[command(about = "Pushes live query diffs to subscribed clients over SSE")]
#[command(version)]
struct Args {
    /// Bind address.
    #[arg(long, env = "LIVESYNC_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "LIVESYNC_PORT", default_value_t = 8080)]
    port: u16,

    /// Path prefix of the stream and live query routes.
    #[arg(long, env = "LIVESYNC_API_PREFIX", default_value = "/api")]
    api_prefix: String,

    /// Allowed CORS origins (comma separated, `*` for any).
    #[arg(
        long = "cors-origin",
        env = "LIVESYNC_CORS_ORIGINS",
        value_delimiter = ',',
        default_value = "*"
    )]
    cors_origins: Vec<String>,

    /// PEM certificate; enables TLS together with `--tls-key`.
    #[arg(long, env = "LIVESYNC_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    #[arg(long, env = "LIVESYNC_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    #[arg(long, env = "LIVESYNC_STORAGE", value_enum, default_value_t = StorageKind::Memory)]
    storage: StorageKind,

    #[arg(long, env = "LIVESYNC_REDB_PATH", default_value = "livesync.redb")]
    redb_path: PathBuf,

    /// Connection string of the `PostgreSQL` registry.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Publish through an external broker instead of this server's streams.
    #[arg(long, env = "LIVESYNC_BROKER_URL")]
    broker_url: Option<String>,

    #[arg(long, env = "LIVESYNC_BROKER_API_KEY", hide_env_values = true)]
    broker_api_key: Option<String>,

    /// Entity keys served by the in-memory repositories (comma separated).
    #[arg(long = "entity", env = "LIVESYNC_ENTITIES", value_delimiter = ',')]
    entities: Vec<String>,

    /// Primary key field of every entity row.
    #[arg(long, env = "LIVESYNC_KEY_FIELD", default_value = "id")]
    key_field: String,

    /// Row field holding the owning user; scopes queries that carry a user id.
    #[arg(long, env = "LIVESYNC_OWNER_FIELD")]
    owner_field: Option<String>,

    #[arg(long, env = "LIVESYNC_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "LIVESYNC_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[arg(long, env = "LIVESYNC_NODE_ID", default_value = "livesync-0")]
    node_id: String,

    /// Close push streams not touched by any request for this long.
    #[arg(long, env = "LIVESYNC_IDLE_TIMEOUT_SECS", default_value_t = 60)]
    idle_timeout_secs: u64,

    #[arg(long, env = "LIVESYNC_SSE_KEEP_ALIVE_SECS", default_value_t = 15)]
    sse_keep_alive_secs: u64,

    /// Drop live queries not kept alive for this long.
    #[arg(long, env = "LIVESYNC_QUERY_TTL_SECS", default_value_t = 300)]
    query_ttl_secs: u64,

    #[arg(long, env = "LIVESYNC_GC_INTERVAL_SECS", default_value_t = 30)]
    gc_interval_secs: u64,

    /// Diffs larger than this fraction of the result are sent as `all`.
    #[arg(long, env = "LIVESYNC_RESYNC_THRESHOLD", default_value_t = 0.5)]
    resync_threshold: f64,

    #[arg(long, env = "LIVESYNC_RESYNC_MIN_CHANGES", default_value_t = 16)]
    resync_min_changes: usize,
}

impl Args {
    fn network_config(&self) -> NetworkConfig {
        let mut config = NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            cors_origins: self.cors_origins.clone(),
            api_prefix: self.api_prefix.clone(),
            ..NetworkConfig::default()
        };
        config.connection.idle_timeout = Duration::from_secs(self.idle_timeout_secs);
        config.connection.sse_keep_alive_interval = Duration::from_secs(self.sse_keep_alive_secs);
        if let (Some(cert_path), Some(key_path)) = (&self.tls_cert, &self.tls_key) {
            config.tls = Some(TlsConfig {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            });
        }
        config
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            node_id: self.node_id.clone(),
            live_query: LiveQueryConfig {
                resync_threshold: self.resync_threshold,
                resync_min_changes: self.resync_min_changes,
                query_ttl: Duration::from_secs(self.query_ttl_secs),
                gc_interval: Duration::from_secs(self.gc_interval_secs),
            },
        }
    }
}

// ============================================================================
// Wiring
// ============================================================================

async fn open_storage(args: &Args) -> anyhow::Result<Arc<dyn LiveQueryStorage>> {
    match args.storage {
        StorageKind::Memory => Ok(Arc::new(MemoryLiveQueryStorage::new())),
        StorageKind::Redb => open_redb(&args.redb_path),
        StorageKind::Postgres => open_postgres(args.database_url.as_deref()).await,
    }
}

#[cfg(feature = "redb")]
fn open_redb(path: &Path) -> anyhow::Result<Arc<dyn LiveQueryStorage>> {
    use livesync_server::live_query::RedbLiveQueryStorage;

    info!(path = %path.display(), "opening redb live query registry");
    Ok(Arc::new(RedbLiveQueryStorage::open(path)?))
}

#[cfg(not(feature = "redb"))]
fn open_redb(_path: &Path) -> anyhow::Result<Arc<dyn LiveQueryStorage>> {
    anyhow::bail!("this build does not include the `redb` feature")
}

#[cfg(feature = "postgres")]
async fn open_postgres(url: Option<&str>) -> anyhow::Result<Arc<dyn LiveQueryStorage>> {
    use livesync_server::live_query::PostgresLiveQueryStorage;

    let url = url.ok_or_else(|| anyhow::anyhow!("--database-url is required for postgres storage"))?;
    Ok(Arc::new(PostgresLiveQueryStorage::connect(url).await?))
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres(_url: Option<&str>) -> anyhow::Result<Arc<dyn LiveQueryStorage>> {
    anyhow::bail!("this build does not include the `postgres` feature")
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);
    if let Some(addr) = args.metrics_addr {
        init_metrics(addr)?;
        info!(%addr, "metrics endpoint listening");
    }

    let server = args.server_config();
    let network = args.network_config();
    let idle_timeout = network.connection.idle_timeout;
    let mut module = NetworkModule::new(network);

    let storage = open_storage(&args).await?;
    let broker = match &args.broker_url {
        Some(url) => {
            let mut config = BrokerConfig::new(url.as_str());
            config.api_key.clone_from(&args.broker_api_key);
            info!(broker = %config.base_url, "publishing through external broker");
            Some(BrokerSubscriptionServer::new(config)?)
        }
        None => None,
    };
    let local_push = broker.is_none();
    let transport: Arc<dyn SubscriptionServer> = match broker {
        Some(broker) => Arc::new(broker),
        None => module.registry(),
    };

    let mut provider = MemoryRepositoryProvider::new(args.key_field.as_str());
    if let Some(field) = &args.owner_field {
        provider = provider.with_owner_field(field.as_str());
    }
    let provider = Arc::new(provider);
    for entity in &args.entities {
        let _ = provider.entity(entity);
    }

    let publisher = Arc::new(LiveQueryPublisher::new(
        storage,
        transport,
        provider.clone(),
        server.live_query.clone(),
    ));
    provider.set_notifier(publisher.clone());

    let gc = LiveQueryGc::new(
        module.registry(),
        publisher.clone(),
        idle_timeout,
        server.live_query.query_ttl,
    );
    let mut worker = BackgroundWorker::start(gc, server.live_query.gc_interval);

    module.attach_live_queries(LiveQueryWiring {
        publisher,
        gc: worker.sender(),
        local_push,
    });

    let port = module.start().await?;
    info!(
        node_id = %server.node_id,
        port,
        entities = ?args.entities,
        storage = ?args.storage,
        "livesync server started"
    );

    let served = module.serve(shutdown_signal()).await;
    worker.stop().await;
    served?;
    info!("livesync server stopped");
    Ok(())
}
