//! Worker runtime.
//!
//! This crate provides:
//! - [`WorkerRuntime`]: one consumer per registered queue with bounded
//!   concurrency, lock heartbeats, stalled-job recovery and backoff retries
//! - Graceful shutdown on SIGINT/SIGTERM
//! - Structured logging setup and Prometheus metrics
//! - Startup health checks for the broker and the handlers' data context

mod consumer;

pub mod config;
pub mod error;
pub mod health;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod retry;
pub mod runtime;

pub use config::{parse_queue_concurrency, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use health::HealthCheck;
pub use logging::init_tracing;
pub use runtime::{shutdown_signal, WorkerRuntime};
