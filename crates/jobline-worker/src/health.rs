//! Startup health checks for the data context handed to handlers.

use async_trait::async_trait;

/// Implemented by the data-access context so the worker can refuse to start
/// when its dependencies are unreachable.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn health_check(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Context-free workers.
impl HealthCheck for () {}
