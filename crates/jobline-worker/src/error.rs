//! Worker error types.

use jobline_jobs::JobsError;
use jobline_queue::QueueError;
use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("Startup hook failed: {0:#}")]
    Startup(anyhow::Error),

    #[error("Consumer for queue {queue} stopped: {reason}")]
    ConsumerStopped { queue: String, reason: String },

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Jobs error: {0}")]
    Jobs(#[from] JobsError),
}

impl WorkerError {
    pub fn health_check(msg: impl Into<String>) -> Self {
        Self::HealthCheck(msg.into())
    }

    pub fn consumer_stopped(queue: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConsumerStopped {
            queue: queue.into(),
            reason: reason.into(),
        }
    }

    pub fn metrics(msg: impl Into<String>) -> Self {
        Self::Metrics(msg.into())
    }
}
