//! Wire format for job trees (flows).

use serde::{Deserialize, Serialize};

use crate::job::JobHandle;
use crate::options::ResolvedJobOptions;

/// One node of a flow as handed to the broker.
///
/// The parent is stored waiting on its children; each child carries a
/// reference to the parent. Children may live on other queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowJob {
    pub name: String,
    pub queue_name: String,
    pub data: serde_json::Value,
    pub opts: ResolvedJobOptions,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FlowJob>,
}

impl FlowJob {
    /// Total number of jobs in this subtree.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(FlowJob::node_count).sum::<usize>()
    }
}

/// Handles of a submitted flow, mirroring its shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowNodeHandle {
    pub job: JobHandle,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FlowNodeHandle>,
}
