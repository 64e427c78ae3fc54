use std::time::Duration;

/// Server-level configuration outside the network layer.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Unique identifier for this server node, used in logs.
    pub node_id: String,
    /// Live query diffing and expiry settings.
    pub live_query: LiveQueryConfig,
}

/// Tuning knobs for the live query publisher and its GC loop.
#[derive(Debug, Clone)]
pub struct LiveQueryConfig {
    /// Fraction of the new result size above which a diff is replaced by a
    /// single `all` message.
    pub resync_threshold: f64,
    /// Diffs with fewer messages than this are never replaced by `all`.
    pub resync_min_changes: usize,
    /// A query not kept alive for this long is dropped from the registry.
    pub query_ttl: Duration,
    /// Interval between GC sweeps of idle connections and expired queries.
    pub gc_interval: Duration,
}

impl Default for LiveQueryConfig {
    fn default() -> Self {
        Self {
            resync_threshold: 0.5,
            resync_min_changes: 16,
            query_ttl: Duration::from_secs(300),
            gc_interval: Duration::from_secs(30),
        }
    }
}

impl LiveQueryConfig {
    /// Whether a diff of `diff_len` messages should be sent as a full resync.
    #[must_use]
    pub fn should_resync(&self, diff_len: usize, result_len: usize) -> bool {
        #[allow(clippy::cast_precision_loss)]
        let limit = self.resync_threshold * result_len.max(1) as f64;
        #[allow(clippy::cast_precision_loss)]
        let diff = diff_len as f64;
        diff_len >= self.resync_min_changes && diff > limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert!(config.node_id.is_empty());
        assert!((config.live_query.resync_threshold - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.live_query.resync_min_changes, 16);
        assert_eq!(config.live_query.query_ttl, Duration::from_secs(300));
        assert_eq!(config.live_query.gc_interval, Duration::from_secs(30));
    }

    #[test]
    fn small_diffs_never_resync() {
        let config = LiveQueryConfig::default();
        // Every row changed, but below the minimum.
        assert!(!config.should_resync(3, 3));
        assert!(!config.should_resync(15, 0));
    }

    #[test]
    fn large_diffs_relative_to_result_resync() {
        let config = LiveQueryConfig::default();
        assert!(config.should_resync(16, 20));
        assert!(!config.should_resync(16, 40));
        assert!(config.should_resync(100, 0));
    }
}
