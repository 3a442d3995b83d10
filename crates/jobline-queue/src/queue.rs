//! Live queue handles.

use std::sync::Arc;

use tracing::{debug, info};

use jobline_models::{
    JobCounts, JobHandle, JobId, JobRecord, NewJob, SchedulerEntry, SchedulerSpec,
};

use crate::binding::QueueBinding;
use crate::broker::Broker;
use crate::error::QueueResult;

/// A [`QueueBinding`] attached to a broker connection.
#[derive(Clone)]
pub struct QueueHandle {
    binding: QueueBinding,
    broker: Arc<dyn Broker>,
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

impl QueueHandle {
    pub fn new(binding: QueueBinding, broker: Arc<dyn Broker>) -> Self {
        Self { binding, broker }
    }

    pub fn name(&self) -> &str {
        self.binding.name()
    }

    pub fn binding(&self) -> &QueueBinding {
        &self.binding
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Enqueue a job.
    pub async fn add(&self, job: NewJob) -> QueueResult<JobHandle> {
        let name = job.name.clone();
        let id = self.broker.add(self.name(), job).await?;

        info!("Enqueued job {} ({}) on queue {}", id, name, self.name());
        Ok(JobHandle {
            id,
            name,
            queue: self.name().to_string(),
        })
    }

    /// Enqueue several jobs in one broker round trip.
    pub async fn add_bulk(&self, jobs: Vec<NewJob>) -> QueueResult<Vec<JobHandle>> {
        let names: Vec<String> = jobs.iter().map(|j| j.name.clone()).collect();
        let ids = self.broker.add_bulk(self.name(), jobs).await?;

        info!("Enqueued {} jobs on queue {}", ids.len(), self.name());
        Ok(ids
            .into_iter()
            .zip(names)
            .map(|(id, name)| JobHandle {
                id,
                name,
                queue: self.name().to_string(),
            })
            .collect())
    }

    /// Create or replace a scheduler on this queue.
    pub async fn upsert_scheduler(
        &self,
        scheduler_id: &str,
        spec: SchedulerSpec,
    ) -> QueueResult<SchedulerEntry> {
        let entry = self
            .broker
            .upsert_scheduler(self.name(), scheduler_id, spec)
            .await?;

        debug!(
            "Scheduler {} on queue {} next fires at {:?}",
            scheduler_id,
            self.name(),
            entry.next_millis
        );
        Ok(entry)
    }

    pub async fn remove_scheduler(&self, scheduler_id: &str) -> QueueResult<bool> {
        self.broker.remove_scheduler(self.name(), scheduler_id).await
    }

    pub async fn get_scheduler(&self, scheduler_id: &str) -> QueueResult<Option<SchedulerEntry>> {
        self.broker.get_scheduler(self.name(), scheduler_id).await
    }

    pub async fn schedulers(&self) -> QueueResult<Vec<SchedulerEntry>> {
        self.broker.schedulers(self.name()).await
    }

    pub async fn get_job(&self, job_id: &JobId) -> QueueResult<Option<JobRecord>> {
        self.broker.get_job(self.name(), job_id).await
    }

    pub async fn counts(&self) -> QueueResult<JobCounts> {
        self.broker.counts(self.name()).await
    }

    pub async fn close(&self) -> QueueResult<()> {
        debug!("Closing queue {}", self.name());
        self.broker.close().await
    }
}
