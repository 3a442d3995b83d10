//! Worker configuration.

use std::collections::HashMap;
use std::time::Duration;

use jobline_models::KeepJobs;
use tracing::warn;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Per-queue concurrency overrides
    pub queue_concurrency: HashMap<String, usize>,
    /// Concurrency for queues without an override; `None` uses the binding's
    pub default_concurrency: Option<usize>,
    /// Lock TTL of an active job
    pub lock_duration: Duration,
    /// How often active job locks are renewed
    pub heartbeat_interval: Duration,
    /// How often expired locks are swept
    pub stalled_interval: Duration,
    /// Stalls tolerated before a job is failed
    pub max_stalled_count: u32,
    /// Idle wait when a queue is empty
    pub poll_interval: Duration,
    /// Wait after a failed fetch
    pub error_backoff: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Ceiling on completed-job retention. A tighter job setting wins.
    pub keep_completed: KeepJobs,
    /// Ceiling on failed-job retention. A tighter job setting wins.
    pub keep_failed: KeepJobs,
    /// Broker ping retries at startup
    pub startup_retries: u32,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_concurrency: HashMap::new(),
            default_concurrency: None,
            lock_duration: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            stalled_interval: Duration::from_secs(30),
            max_stalled_count: 1,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            keep_completed: KeepJobs::new(100, Duration::from_secs(3600)),
            keep_failed: KeepJobs::new(500, Duration::from_secs(24 * 3600)),
            startup_retries: 5,
            metrics_enabled: false,
            metrics_port: 9090,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(key).unwrap_or(default))
}

fn env_millis(key: &str, default: u64) -> Duration {
    Duration::from_millis(env_parse(key).unwrap_or(default))
}

/// Parse `email=10,reports=2`. Malformed entries are skipped with a warning.
pub fn parse_queue_concurrency(raw: &str) -> HashMap<String, usize> {
    let mut out = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let parsed = entry
            .split_once('=')
            .and_then(|(queue, n)| Some((queue.trim(), n.trim().parse::<usize>().ok()?)));
        match parsed {
            Some((queue, n)) if !queue.is_empty() && n > 0 => {
                out.insert(queue.to_string(), n);
            }
            _ => warn!("Ignoring malformed queue concurrency entry '{}'", entry),
        }
    }
    out
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let lock_duration = env_secs("WORKER_LOCK_DURATION_SECS", 30);

        Self {
            queue_concurrency: std::env::var("WORKER_QUEUE_CONCURRENCY")
                .map(|raw| parse_queue_concurrency(&raw))
                .unwrap_or_default(),
            default_concurrency: env_parse::<usize>("WORKER_DEFAULT_CONCURRENCY").filter(|n| *n > 0),
            lock_duration,
            heartbeat_interval: std::env::var("WORKER_HEARTBEAT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(lock_duration / 2),
            stalled_interval: env_secs("WORKER_STALLED_INTERVAL_SECS", 30),
            max_stalled_count: env_parse("WORKER_MAX_STALLED_COUNT").unwrap_or(1),
            poll_interval: env_millis("WORKER_POLL_INTERVAL_MS", 1000),
            error_backoff: env_millis("WORKER_ERROR_BACKOFF_MS", 5000),
            shutdown_timeout: env_secs("WORKER_SHUTDOWN_TIMEOUT", 30),
            keep_completed: KeepJobs::new(
                env_parse("WORKER_KEEP_COMPLETED").unwrap_or(100),
                env_secs("WORKER_KEEP_COMPLETED_SECS", 3600),
            ),
            keep_failed: KeepJobs::new(
                env_parse("WORKER_KEEP_FAILED").unwrap_or(500),
                env_secs("WORKER_KEEP_FAILED_SECS", 24 * 3600),
            ),
            startup_retries: env_parse("WORKER_STARTUP_RETRIES").unwrap_or(defaults.startup_retries),
            metrics_enabled: std::env::var("METRICS_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            metrics_port: env_parse("METRICS_PORT").unwrap_or(defaults.metrics_port),
        }
    }

    /// Concurrency for `queue`: explicit override, then the worker default,
    /// then the binding's own.
    pub fn concurrency_for(&self, queue: &str, binding_default: usize) -> usize {
        self.queue_concurrency
            .get(queue)
            .copied()
            .or(self.default_concurrency)
            .unwrap_or(binding_default)
            .max(1)
    }
}
