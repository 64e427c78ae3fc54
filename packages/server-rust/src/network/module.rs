//! Network module with deferred startup lifecycle.
//!
//! Implements the deferred startup pattern: `new()` creates resources,
//! `start()` binds the TCP listener, and `serve()` starts accepting
//! connections. Between `new()` and `serve()` the rest of the application
//! builds the live query publisher on top of [`NetworkModule::registry`] and
//! hands it back through [`NetworkModule::attach_live_queries`].

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::connection::{ConnectionRegistry, OutboundMessage};
use super::handlers::{
    health_handler, keep_alive_handler, live_query_subscribe_handler,
    live_query_unsubscribe_handler, liveness_handler, readiness_handler, stream_handler,
    subscribe_handler, unsubscribe_handler, AppState,
};
use super::middleware::build_http_layers;
use super::shutdown::ShutdownController;
use crate::live_query::{GcTask, LiveQueryPublisher};

/// Maximum time to wait for in-flight requests after the shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Live query services the HTTP layer serves.
pub struct LiveQueryWiring {
    pub publisher: Arc<LiveQueryPublisher>,
    /// Queue of the GC worker, if one runs.
    pub gc: Option<mpsc::Sender<GcTask>>,
    /// `false` when diffs go to an external broker instead of this
    /// process's push streams.
    pub local_push: bool,
}

/// Manages the full HTTP server lifecycle.
///
/// 1. `new()` -- allocates shared state (registry, shutdown controller)
/// 2. `attach_live_queries()` -- plugs in the publisher built on the registry
/// 3. `start()` -- binds TCP listener to the configured address
/// 4. `serve()` -- begins accepting connections until shutdown is signalled
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownController>,
    live_queries: Option<LiveQueryWiring>,
    start_time: Instant,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        Self::with_registry(config, Arc::new(ConnectionRegistry::new()))
    }

    /// Creates a network module around an existing connection registry.
    #[must_use]
    pub fn with_registry(config: NetworkConfig, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            config,
            listener: None,
            registry,
            shutdown: Arc::new(ShutdownController::new()),
            live_queries: None,
            start_time: Instant::now(),
        }
    }

    /// Returns a shared reference to the connection registry.
    ///
    /// The live query publisher uses it as its push transport.
    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Returns a shared reference to the shutdown controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    pub fn attach_live_queries(&mut self, wiring: LiveQueryWiring) {
        self.live_queries = Some(wiring);
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes (`{prefix}` is [`NetworkConfig::api_prefix`]):
    /// - `GET /health`, `/health/live`, `/health/ready`
    /// - `GET {prefix}/stream` -- SSE push stream
    /// - `POST {prefix}/stream/subscribe`, `{prefix}/stream/unsubscribe`
    /// - `POST {prefix}/stream/keep-alive`
    /// - `POST {prefix}/live-query`, `{prefix}/live-query/unsubscribe`
    ///
    /// # Errors
    ///
    /// Returns an error if [`attach_live_queries`](Self::attach_live_queries)
    /// was not called.
    pub fn build_router(&self) -> anyhow::Result<Router> {
        let wiring = self
            .live_queries
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("live queries must be attached before serving"))?;

        let state = AppState {
            registry: Arc::clone(&self.registry),
            shutdown: Arc::clone(&self.shutdown),
            config: Arc::new(self.config.clone()),
            publisher: Arc::clone(&wiring.publisher),
            gc: wiring.gc.clone(),
            local_push: wiring.local_push,
            start_time: self.start_time,
        };

        let api = Router::new()
            .route("/stream", get(stream_handler))
            .route("/stream/subscribe", post(subscribe_handler))
            .route("/stream/unsubscribe", post(unsubscribe_handler))
            .route("/stream/keep-alive", post(keep_alive_handler))
            .route("/live-query", post(live_query_subscribe_handler))
            .route("/live-query/unsubscribe", post(live_query_unsubscribe_handler));

        let router = Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler));

        let prefix = self.config.api_prefix.trim_end_matches('/');
        let router = if prefix.is_empty() {
            router.merge(api)
        } else {
            router.nest(prefix, api)
        };

        Ok(router
            .layer(build_http_layers(&self.config))
            .with_state(state))
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Starts serving connections until the shutdown signal fires.
    ///
    /// After the shutdown signal:
    /// 1. Health state transitions to Draining
    /// 2. Every push stream receives a Close and ends
    /// 3. Waits up to 30 seconds for in-flight requests to complete
    /// 4. Health state transitions to Stopped
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called, if live queries were
    /// not attached, or if the server encounters a fatal I/O error.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow::anyhow!("start() must be called before serve()"))?;
        let router = self.build_router()?;
        let registry = self.registry;
        let shutdown_ctrl = self.shutdown;

        // Push streams never finish on their own, so they are closed as soon
        // as the signal fires; the server then only waits for requests.
        let signal = {
            let registry = Arc::clone(&registry);
            let shutdown_ctrl = Arc::clone(&shutdown_ctrl);
            async move {
                shutdown.await;
                begin_drain(&registry, &shutdown_ctrl);
            }
        };

        // Transition to Ready so readiness probes pass.
        shutdown_ctrl.set_ready();

        if let Some(ref tls_config) = self.config.tls {
            serve_tls(listener, router, tls_config, signal).await?;
        } else {
            serve_plain(listener, router, signal).await?;
        }

        finish_drain(&shutdown_ctrl).await;
        Ok(())
    }
}

/// Serves plain HTTP connections using axum's built-in server.
async fn serve_plain(
    listener: TcpListener,
    router: Router,
    signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("Serving plain HTTP connections");

    axum::serve(listener, router)
        .with_graceful_shutdown(signal)
        .await?;
    Ok(())
}

/// Serves TLS connections using `axum-server` with rustls.
///
/// Reuses the pre-bound TCP listener by converting it to a `std::net::TcpListener`.
async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls_config: &super::config::TlsConfig,
    signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    use axum_server::tls_rustls::RustlsConfig;

    let rustls_config = RustlsConfig::from_pem_file(&tls_config.cert_path, &tls_config.key_path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load TLS certificates: {e}"))?;

    let addr = listener.local_addr()?;
    let std_listener = listener.into_std()?;
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        signal.await;
        shutdown_handle.graceful_shutdown(Some(DRAIN_TIMEOUT));
    });

    info!("Serving TLS connections on {}", addr);

    axum_server::from_tcp_rustls(std_listener, rustls_config)
        .handle(handle)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}

/// Moves to Draining and closes every push stream.
fn begin_drain(registry: &ConnectionRegistry, shutdown_ctrl: &ShutdownController) {
    shutdown_ctrl.trigger_shutdown();

    let handles = registry.drain_all();
    if !handles.is_empty() {
        info!("Closing {} push streams", handles.len());
        for handle in &handles {
            let _ = handle.try_send(OutboundMessage::Close(Some(
                "server shutting down".to_string(),
            )));
        }
    }
}

/// Waits for in-flight requests and transitions to Stopped.
async fn finish_drain(shutdown_ctrl: &ShutdownController) {
    if shutdown_ctrl.wait_for_drain(DRAIN_TIMEOUT).await {
        info!("All requests drained successfully");
    } else {
        warn!("Drain timeout expired with in-flight requests remaining");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live_query::MemoryLiveQueryStorage;
    use crate::network::HealthState;
    use crate::repository::MemoryRepositoryProvider;
    use crate::service::LiveQueryConfig;

    fn local_config() -> NetworkConfig {
        NetworkConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..NetworkConfig::default()
        }
    }

    fn attached(config: NetworkConfig) -> NetworkModule {
        let mut module = NetworkModule::new(config);
        let publisher = Arc::new(LiveQueryPublisher::new(
            Arc::new(MemoryLiveQueryStorage::new()),
            module.registry(),
            Arc::new(MemoryRepositoryProvider::new("id")),
            LiveQueryConfig::default(),
        ));
        module.attach_live_queries(LiveQueryWiring {
            publisher,
            gc: None,
            local_push: true,
        });
        module
    }

    #[test]
    fn new_creates_module_without_binding() {
        let module = NetworkModule::new(NetworkConfig::default());
        assert!(module.listener.is_none());
    }

    #[test]
    fn registry_returns_shared_arc() {
        let module = NetworkModule::new(NetworkConfig::default());
        assert!(Arc::ptr_eq(&module.registry(), &module.registry()));
        assert!(Arc::ptr_eq(
            &module.shutdown_controller(),
            &module.shutdown_controller()
        ));
    }

    #[test]
    fn build_router_requires_live_queries() {
        let module = NetworkModule::new(NetworkConfig::default());
        assert!(module.build_router().is_err());
        assert!(attached(NetworkConfig::default()).build_router().is_ok());
    }

    #[test]
    fn empty_prefix_mounts_routes_at_root() {
        let config = NetworkConfig {
            api_prefix: "/".to_string(),
            ..NetworkConfig::default()
        };
        assert!(attached(config).build_router().is_ok());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let module = attached(local_config());
        let err = module.serve(std::future::pending::<()>()).await.unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn serves_health_and_drains_streams_on_shutdown() {
        let mut module = attached(local_config());
        let port = module.start().await.unwrap();
        assert!(port > 0);
        let shutdown_ctrl = module.shutdown_controller();
        let registry = module.registry();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(module.serve(async move {
            let _ = rx.await;
        }));

        let client = reqwest::Client::new();
        let base = format!("http://127.0.0.1:{port}");
        let health: serde_json::Value = client
            .get(format!("{base}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["state"], "ready");

        let stream = client.get(format!("{base}/api/stream")).send().await.unwrap();
        assert_eq!(stream.status(), reqwest::StatusCode::OK);
        for _ in 0..100 {
            if registry.count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.count(), 1);

        tx.send(()).unwrap();
        // The open stream must not hold the server up.
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(shutdown_ctrl.health_state(), HealthState::Stopped);
        assert_eq!(registry.count(), 0);
        drop(stream);
    }
}
