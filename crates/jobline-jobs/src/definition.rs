//! Job definitions and their trigger APIs.

use std::marker::PhantomData;
use std::time::Duration;

use serde_json::Value;

use jobline_models::{FlowNodeHandle, JobHandle, JobOptions, RepeatOptions};
use jobline_queue::QueueBinding;

use crate::error::{JobsError, JobsResult};
use crate::flow::FlowNode;
use crate::registry::Registry;
use crate::schema::{self, Payload};

/// Queue and default options of a job, given at registration.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub queue: QueueBinding,
    pub options: JobOptions,
}

impl JobConfig {
    pub fn new(queue: impl Into<QueueBinding>) -> Self {
        Self {
            queue: queue.into(),
            options: JobOptions::default(),
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

/// A registered job with input type `T`.
///
/// Definitions hold only the name of their queue; every trigger resolves a
/// live handle through the registry.
pub struct JobDefinition<T, D> {
    id: String,
    queue: String,
    options: JobOptions,
    registry: Registry<D>,
    _payload: PhantomData<fn(T)>,
}

impl<T, D> Clone for JobDefinition<T, D> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            queue: self.queue.clone(),
            options: self.options.clone(),
            registry: self.registry.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T, D> std::fmt::Debug for JobDefinition<T, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("options", &self.options)
            .finish()
    }
}

impl<T, D> JobDefinition<T, D> {
    pub(crate) fn new(registry: Registry<D>, id: String, queue: String, options: JobOptions) -> Self {
        Self {
            id,
            queue,
            options,
            registry,
            _payload: PhantomData,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Options declared at registration.
    pub fn options(&self) -> &JobOptions {
        &self.options
    }
}

impl<T: Payload, D: Send + Sync + 'static> JobDefinition<T, D> {
    fn encode(&self, payload: &T) -> JobsResult<Value> {
        schema::encode(payload).map_err(|v| JobsError::validation(&self.id, v))
    }

    /// Validate and enqueue one job.
    pub async fn trigger(&self, payload: &T, opts: JobOptions) -> JobsResult<JobHandle> {
        let value = self.encode(payload)?;
        self.trigger_json(value, opts).await
    }

    /// Same as [`trigger`](Self::trigger) for a payload that is still JSON.
    pub async fn trigger_json(&self, value: Value, opts: JobOptions) -> JobsResult<JobHandle> {
        let job = self.registry.prepare_job(&self.id, &value, &opts)?;
        self.registry.submit(&self.id, job).await
    }

    /// Validate every item, then enqueue all of them in one bulk call.
    /// An invalid item fails the whole batch before anything is enqueued.
    pub async fn batch_trigger(
        &self,
        items: impl IntoIterator<Item = (T, JobOptions)>,
    ) -> JobsResult<Vec<JobHandle>> {
        let mut jobs = Vec::new();
        for (payload, opts) in items {
            let value = self.encode(&payload)?;
            jobs.push(self.registry.prepare_job(&self.id, &value, &opts)?);
        }
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        self.registry.submit_bulk(&self.id, jobs).await
    }

    /// Enqueue a job that becomes eligible after `delay`.
    pub async fn trigger_delayed(
        &self,
        payload: &T,
        delay: Duration,
        opts: JobOptions,
    ) -> JobsResult<JobHandle> {
        self.trigger(payload, opts.delay(delay)).await
    }

    /// Run this job on a cron pattern. Timezone, bounds and limit are taken
    /// from `opts.repeat` when present. Returns the first pending iteration.
    pub async fn trigger_recurring(
        &self,
        payload: &T,
        cron: &str,
        opts: JobOptions,
    ) -> JobsResult<JobHandle> {
        let repeat = match opts.repeat.clone() {
            Some(mut repeat) => {
                repeat.pattern = cron.to_string();
                repeat
            }
            None => RepeatOptions::cron(cron),
        };
        self.trigger(payload, opts.repeat(repeat)).await
    }

    /// Flow node for this job, to be used as a child in a flow.
    pub fn flow_node(&self, payload: &T) -> FlowNode {
        FlowNode::new(self, payload)
    }

    /// Submit this job as the root of a flow with `children`.
    pub async fn trigger_flow(
        &self,
        payload: &T,
        opts: JobOptions,
        children: Vec<FlowNode>,
    ) -> JobsResult<FlowNodeHandle> {
        let root = FlowNode::new(self, payload).options(opts).children(children);
        self.registry.trigger_flow(root).await
    }
}
