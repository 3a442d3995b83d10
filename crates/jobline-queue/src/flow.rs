//! Flow submission.

use std::sync::Arc;

use tracing::info;

use jobline_models::{FlowJob, FlowNodeHandle};

use crate::broker::Broker;
use crate::error::QueueResult;

/// Dedicated handle for submitting job trees atomically.
#[derive(Clone)]
pub struct FlowProducer {
    broker: Arc<dyn Broker>,
}

impl FlowProducer {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Submit a job tree. Children may target other queues than the root.
    pub async fn add(&self, flow: FlowJob) -> QueueResult<FlowNodeHandle> {
        let nodes = flow.node_count();
        let root = flow.name.clone();
        let handle = self.broker.add_flow(flow).await?;

        info!(
            "Submitted flow {} ({}) with {} jobs",
            handle.job.id, root, nodes
        );
        Ok(handle)
    }

    pub async fn close(&self) -> QueueResult<()> {
        self.broker.close().await
    }
}
