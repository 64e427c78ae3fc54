//! Periodic cleanup of idle connections and abandoned live queries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::publisher::LiveQueryPublisher;
use crate::network::ConnectionRegistry;
use crate::service::worker::BackgroundRunnable;

/// On-demand work for the GC worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcTask {
    /// Run a full sweep now instead of waiting for the next tick.
    Sweep,
    /// Drop every live query owned by a connection that went away.
    DropClient { client_id: String },
}

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub connections: usize,
    pub queries: usize,
}

/// Expires idle push connections and queries no client keeps alive.
///
/// Runs on a [`BackgroundWorker`](crate::service::BackgroundWorker); every
/// tick performs a [`sweep`](Self::sweep).
pub struct LiveQueryGc {
    connections: Arc<ConnectionRegistry>,
    publisher: Arc<LiveQueryPublisher>,
    idle_timeout: Duration,
    query_ttl: Duration,
}

impl LiveQueryGc {
    #[must_use]
    pub fn new(
        connections: Arc<ConnectionRegistry>,
        publisher: Arc<LiveQueryPublisher>,
        idle_timeout: Duration,
        query_ttl: Duration,
    ) -> Self {
        Self {
            connections,
            publisher,
            idle_timeout,
            query_ttl,
        }
    }

    /// Closes idle connections, drops their queries, and removes queries
    /// whose keep-alive lapsed.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let idle = self.connections.expire_idle(self.idle_timeout);
        report.connections = idle.len();
        for connection_id in idle {
            report.queries += self.drop_client(connection_id.as_str()).await;
        }

        match self.publisher.storage().remove_expired(self.query_ttl).await {
            Ok(expired) => {
                for id in &expired {
                    self.publisher.forget(id);
                }
                report.queries += expired.len();
            }
            Err(err) => warn!(error = %err, "failed to expire live queries"),
        }

        if report != SweepReport::default() {
            info!(
                connections = report.connections,
                queries = report.queries,
                "live query gc sweep"
            );
        }
        report
    }

    /// Drops the queries owned by `client_id`, returning how many were removed.
    pub async fn drop_client(&self, client_id: &str) -> usize {
        match self.publisher.storage().remove_for_client(client_id).await {
            Ok(removed) => {
                for id in &removed {
                    self.publisher.forget(id);
                }
                debug!(client_id, queries = removed.len(), "dropped client live queries");
                removed.len()
            }
            Err(err) => {
                warn!(client_id, error = %err, "failed to drop client live queries");
                0
            }
        }
    }
}

#[async_trait]
impl BackgroundRunnable for LiveQueryGc {
    type Task = GcTask;

    async fn run(&mut self, task: GcTask) {
        match task {
            GcTask::Sweep => {
                self.sweep().await;
            }
            GcTask::DropClient { client_id } => {
                self.drop_client(&client_id).await;
            }
        }
    }

    async fn on_tick(&mut self) {
        self.sweep().await;
    }
}
