//! Broker connection configuration.

use std::time::Duration;

use crate::error::{QueueError, QueueResult};

/// Connection settings for the Redis broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Redis URL
    pub redis_url: String,
    /// Prefix for every key written by jobline
    pub key_prefix: String,
    /// Timeout for establishing a connection
    pub connection_timeout: Duration,
    /// Timeout for a single command
    pub response_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "jobline".to_string(),
            connection_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(10),
        }
    }
}

impl BrokerConfig {
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            ..Default::default()
        }
    }

    /// Create config from environment variables.
    ///
    /// `REDIS_URL` is required. In development (`ENVIRONMENT=development`)
    /// timeouts are relaxed so a local broker can be restarted without
    /// tripping every in-flight command.
    pub fn from_env() -> QueueResult<Self> {
        dotenvy::dotenv().ok();

        let redis_url = std::env::var("REDIS_URL")
            .map_err(|_| QueueError::Config("REDIS_URL is not set".to_string()))?;

        let is_development = std::env::var("ENVIRONMENT")
            .map(|v| v.eq_ignore_ascii_case("development"))
            .unwrap_or(false);

        let mut config = Self::new(redis_url).with_development_timeouts(is_development);
        if let Ok(prefix) = std::env::var("REDIS_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        Ok(config)
    }

    /// Switch between production and development timeouts.
    pub fn with_development_timeouts(mut self, is_development: bool) -> Self {
        if is_development {
            self.connection_timeout = Duration::from_secs(30);
            self.response_timeout = Duration::from_secs(60);
        } else {
            self.connection_timeout = Duration::from_secs(5);
            self.response_timeout = Duration::from_secs(10);
        }
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}
