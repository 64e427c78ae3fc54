//! Client configuration.

use std::time::Duration;

use rand::Rng;

/// Connection and subscription settings of a [`StreamClient`](crate::StreamClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server origin, e.g. `http://localhost:8080`.
    pub base_url: String,
    /// Path prefix of the stream and live query routes.
    pub api_prefix: String,
    /// Delay before the first reconnect attempt; doubles per failed attempt.
    pub reconnect_initial_delay: Duration,
    /// Upper bound of the reconnect delay.
    pub reconnect_max_delay: Duration,
    /// Interval of keep-alive requests. Must stay below the server's idle
    /// timeout and query TTL.
    pub keep_alive_interval: Duration,
    /// Grace period between the last listener leaving and the unsubscribe.
    pub unsubscribe_debounce: Duration,
    /// Timeout of individual requests (not of the push stream).
    pub request_timeout: Duration,
}

impl ClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_prefix: "/api".to_string(),
            reconnect_initial_delay: Duration::from_millis(250),
            reconnect_max_delay: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(30),
            unsubscribe_debounce: Duration::from_millis(100),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Absolute URL of an API route such as `/stream/subscribe`.
    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}{}{}",
            self.base_url,
            self.api_prefix.trim_end_matches('/'),
            path
        )
    }

    /// Delay before reconnect attempt `attempt` (0-based): exponential
    /// backoff capped at `reconnect_max_delay`, with +/-20% jitter.
    #[must_use]
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let base = self
            .reconnect_initial_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(self.reconnect_max_delay);
        base.mul_f64(rand::rng().random_range(0.8..=1.2))
    }
}
