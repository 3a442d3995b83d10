//! A job currently held by a worker.

use std::collections::BTreeMap;

use tokio::sync::broadcast;
use tracing::debug;

use jobline_models::{Dependencies, DependenciesCount, JobId, JobRecord};

use crate::error::QueueResult;
use crate::events::WorkerEvent;
use crate::queue::QueueHandle;

/// Active job as seen by a handler: the broker record plus the lock token
/// needed to talk about it.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    record: JobRecord,
    queue: QueueHandle,
    token: String,
    events: Option<broadcast::Sender<WorkerEvent>>,
}

impl ActiveJob {
    pub fn new(record: JobRecord, queue: QueueHandle, token: impl Into<String>) -> Self {
        Self {
            record,
            queue,
            token: token.into(),
            events: None,
        }
    }

    /// Publish progress updates on `events` as well.
    pub fn with_events(mut self, events: broadcast::Sender<WorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> &JobId {
        &self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.record.data
    }

    /// 1-based number of the current attempt.
    pub fn attempt(&self) -> u32 {
        self.record.attempt()
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Report progress (0-100).
    pub async fn update_progress(&mut self, progress: u8) -> QueueResult<()> {
        let progress = progress.min(100);
        self.queue
            .broker()
            .update_progress(self.queue.name(), &self.record.id, progress)
            .await?;
        self.record.progress = progress;

        if let Some(events) = &self.events {
            // No receivers is fine.
            let _ = events.send(WorkerEvent::Progress {
                queue: self.queue.name().to_string(),
                job_id: self.record.id.clone(),
                progress,
            });
        }
        debug!("Job {} progress {}%", self.record.id, progress);
        Ok(())
    }

    /// Return values of completed children, keyed by child job key.
    pub async fn children_values(&self) -> QueueResult<BTreeMap<String, serde_json::Value>> {
        Ok(self.dependencies().await?.processed)
    }

    pub async fn dependencies(&self) -> QueueResult<Dependencies> {
        self.queue
            .broker()
            .dependencies(self.queue.name(), &self.record.id)
            .await
    }

    pub async fn dependencies_count(&self) -> QueueResult<DependenciesCount> {
        let deps = self.dependencies().await?;
        Ok(DependenciesCount {
            processed: deps.processed.len() as u64,
            unprocessed: deps.unprocessed.len() as u64,
        })
    }
}
