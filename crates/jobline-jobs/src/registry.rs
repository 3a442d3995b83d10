//! Job registry.
//!
//! One [`Registry`] per process maps job IDs to type-erased definitions and
//! queue names, and resolves live queue handles in one of two modes:
//!
//! - worker processes install a resolver returning the handles their
//!   consumers already own ([`QueueMode::ResolverInstalled`]);
//! - every other process lazily opens and caches one handle per queue
//!   through the registry's [`BrokerConnector`]
//!   ([`QueueMode::ExternalCacheInUse`]).
//!
//! A resolver miss falls back to the external cache with a warning.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use jobline_models::{
    FlowNodeHandle, JobHandle, JobId, JobOptions, NewJob, ResolvedJobOptions, SchedulerSpec,
};
use jobline_queue::{
    ActiveJob, BrokerConnector, FlowProducer, QueueBinding, QueueError, QueueHandle, RedisConnector,
};

use crate::context::JobContext;
use crate::definition::{JobConfig, JobDefinition};
use crate::error::{JobsError, JobsResult, ResolutionError, SchemaViolation};
use crate::flow::{FlowNode, FlowTree};
use crate::logging::JobLogger;
use crate::schema::{self, Payload};

/// Maps `(job_id, queue_name)` to a handle owned by the worker runtime.
pub type QueueResolver = Arc<dyn Fn(&str, &str) -> Option<QueueHandle> + Send + Sync>;

/// How the registry currently obtains queue handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Nothing resolved yet
    Uninitialized,
    /// A worker runtime installed its resolver
    ResolverInstalled,
    /// Handles are opened and cached by the registry itself
    ExternalCacheInUse,
}

type Normalize = Box<dyn Fn(&Value) -> Result<Value, SchemaViolation> + Send + Sync>;
type Run<D> = Box<dyn Fn(Value, JobContext<D>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// A registered job with its input type and handler erased.
struct StoredJob<D> {
    id: String,
    queue: String,
    options: JobOptions,
    normalize: Normalize,
    run: Run<D>,
}

struct Resolution {
    mode: QueueMode,
    resolver: Option<QueueResolver>,
    external: HashMap<String, QueueHandle>,
    flow_producer: Option<FlowProducer>,
}

struct Inner<D> {
    connector: Arc<dyn BrokerConnector>,
    jobs: RwLock<HashMap<String, Arc<StoredJob<D>>>>,
    bindings: RwLock<BTreeMap<String, QueueBinding>>,
    resolution: Mutex<Resolution>,
}

/// Catalog of job definitions for one process.
///
/// `D` is the data-access context handed to every handler. Cloning is cheap
/// and clones share state.
pub struct Registry<D> {
    inner: Arc<Inner<D>>,
}

impl<D> Clone for Registry<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Scheduler ID for an ad-hoc recurring trigger: stable for the same job,
/// pattern, timezone and payload.
fn recurring_scheduler_id(job_id: &str, spec: &SchedulerSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spec.repeat.pattern.as_bytes());
    hasher.update(spec.repeat.tz.as_bytes());
    hasher.update(spec.data.to_string().as_bytes());
    let digest = hasher.finalize();

    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("repeat:{}:{}", job_id, hex)
}

impl<D: Send + Sync + 'static> Registry<D> {
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                jobs: RwLock::new(HashMap::new()),
                bindings: RwLock::new(BTreeMap::new()),
                resolution: Mutex::new(Resolution {
                    mode: QueueMode::Uninitialized,
                    resolver: None,
                    external: HashMap::new(),
                    flow_producer: None,
                }),
            }),
        }
    }

    /// Registry whose external connections go to `REDIS_URL`.
    pub fn from_env() -> JobsResult<Self> {
        Ok(Self::new(Arc::new(RedisConnector::from_env()?)))
    }

    fn resolution(&self) -> MutexGuard<'_, Resolution> {
        self.inner
            .resolution
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a job. IDs are unique: a second registration of the same ID
    /// fails with [`JobsError::DuplicateJob`] and leaves the first in place.
    pub fn job<T, R, F, Fut>(
        &self,
        id: impl Into<String>,
        config: JobConfig,
        handler: F,
    ) -> JobsResult<JobDefinition<T, D>>
    where
        T: Payload,
        R: Serialize + Send + 'static,
        F: Fn(T, JobContext<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let id = id.into();
        let queue = config.queue.name().to_string();

        let run: Run<D> = Box::new(
            move |value: Value, ctx: JobContext<D>| -> BoxFuture<'static, anyhow::Result<Value>> {
                match serde_json::from_value::<T>(value) {
                    Ok(payload) => {
                        let fut = handler(payload, ctx);
                        Box::pin(async move {
                            let result = fut.await?;
                            let value = serde_json::to_value(result)?;
                            Ok::<Value, anyhow::Error>(value)
                        })
                    }
                    Err(e) => {
                        let err = anyhow::Error::from(e);
                        Box::pin(async move { Err::<Value, anyhow::Error>(err) })
                    }
                }
            },
        );

        let stored = StoredJob {
            id: id.clone(),
            queue: queue.clone(),
            options: config.options.clone(),
            normalize: Box::new(schema::normalize::<T>),
            run,
        };

        {
            let mut jobs = write(&self.inner.jobs);
            if jobs.contains_key(&id) {
                warn!("Job '{}' is already registered; keeping the first definition", id);
                return Err(JobsError::DuplicateJob(id));
            }
            jobs.insert(id.clone(), Arc::new(stored));
        }
        self.register_queue(config.queue);

        debug!("Registered job '{}' on queue {}", id, queue);
        Ok(JobDefinition::new(self.clone(), id, queue, config.options))
    }

    /// Declare a queue. The first binding registered under a name wins.
    pub fn register_queue(&self, binding: QueueBinding) {
        let mut bindings = write(&self.inner.bindings);
        match bindings.get(binding.name()) {
            Some(existing) if existing != &binding => {
                warn!(
                    "Queue {} already declared with different defaults; keeping the first",
                    binding.name()
                );
            }
            Some(_) => {}
            None => {
                bindings.insert(binding.name().to_string(), binding);
            }
        }
    }

    pub fn queue_name(&self, job_id: &str) -> Option<String> {
        read(&self.inner.jobs).get(job_id).map(|j| j.queue.clone())
    }

    /// Every declared queue, sorted by name.
    pub fn bindings(&self) -> Vec<QueueBinding> {
        read(&self.inner.bindings).values().cloned().collect()
    }

    pub fn binding(&self, queue_name: &str) -> Option<QueueBinding> {
        read(&self.inner.bindings).get(queue_name).cloned()
    }

    pub fn queue_mode(&self) -> QueueMode {
        self.resolution().mode
    }

    fn stored(&self, job_id: &str) -> Option<Arc<StoredJob<D>>> {
        read(&self.inner.jobs).get(job_id).cloned()
    }

    /// Install the worker's resolver. Resolution prefers it from now on.
    pub fn set_queue_resolver<F>(&self, resolver: F)
    where
        F: Fn(&str, &str) -> Option<QueueHandle> + Send + Sync + 'static,
    {
        let mut resolution = self.resolution();
        if !resolution.external.is_empty() {
            warn!(
                "Installing a queue resolver while {} external queue handles are open; \
                 call close_external_queues to release them",
                resolution.external.len()
            );
        }
        resolution.resolver = Some(Arc::new(resolver));
        resolution.mode = QueueMode::ResolverInstalled;
        info!("Queue resolver installed");
    }

    /// Live handle for the queue `job_id` is bound to.
    pub fn resolve_queue(&self, job_id: &str) -> JobsResult<QueueHandle> {
        let queue = self
            .queue_name(job_id)
            .ok_or_else(|| ResolutionError::NoQueue(job_id.to_string()))?;
        self.queue(job_id, &queue)
    }

    /// Live handle for `queue_name`, asked for on behalf of `job_id`.
    pub fn queue(&self, job_id: &str, queue_name: &str) -> JobsResult<QueueHandle> {
        let resolver = self.resolution().resolver.clone();
        if let Some(resolver) = resolver {
            if let Some(handle) = resolver(job_id, queue_name) {
                return Ok(handle);
            }
            warn!(
                job_id,
                queue = queue_name,
                "Queue resolver returned no handle; falling back to an external connection"
            );
        }
        self.external_queue(queue_name)
    }

    fn external_queue(&self, queue_name: &str) -> JobsResult<QueueHandle> {
        let binding = self
            .binding(queue_name)
            .unwrap_or_else(|| QueueBinding::new(queue_name));

        let mut resolution = self.resolution();
        if let Some(handle) = resolution.external.get(queue_name) {
            return Ok(handle.clone());
        }

        let broker = self.inner.connector.connect(Some(queue_name))?;
        let handle = QueueHandle::new(binding, broker);
        resolution.external.insert(queue_name.to_string(), handle.clone());
        if resolution.mode == QueueMode::Uninitialized {
            resolution.mode = QueueMode::ExternalCacheInUse;
        }

        info!("Opened external connection for queue {}", queue_name);
        Ok(handle)
    }

    /// The shared flow producer, created on first use.
    pub fn flow_producer(&self) -> JobsResult<FlowProducer> {
        let mut resolution = self.resolution();
        if let Some(producer) = &resolution.flow_producer {
            return Ok(producer.clone());
        }

        let producer = FlowProducer::new(self.inner.connector.connect(None)?);
        resolution.flow_producer = Some(producer.clone());
        debug!("Created flow producer");
        Ok(producer)
    }

    /// Close every cached external handle and the flow producer. Close
    /// errors are logged and swallowed.
    pub async fn close_external_queues(&self) {
        let (handles, producer) = {
            let mut resolution = self.resolution();
            let handles: Vec<QueueHandle> = resolution.external.drain().map(|(_, h)| h).collect();
            let producer = resolution.flow_producer.take();
            if resolution.resolver.is_none() {
                resolution.mode = QueueMode::Uninitialized;
            }
            (handles, producer)
        };

        for handle in &handles {
            if let Err(e) = handle.close().await {
                error!("Failed to close external queue {}: {}", handle.name(), e);
            }
        }
        if let Some(producer) = producer {
            if let Err(e) = producer.close().await {
                error!("Failed to close flow producer: {}", e);
            }
        }

        if !handles.is_empty() {
            info!("Closed {} external queue handles", handles.len());
        }
    }

    /// Validate `value` for `job_id` and merge options: call site over
    /// definition over queue defaults over hard defaults.
    pub(crate) fn prepare_job(&self, job_id: &str, value: &Value, opts: &JobOptions) -> JobsResult<NewJob> {
        let stored = self
            .stored(job_id)
            .ok_or_else(|| ResolutionError::UnknownJob(job_id.to_string()))?;

        let data = (stored.normalize)(value).map_err(|v| JobsError::validation(job_id, v))?;
        let resolved = self.effective_options(job_id, &stored.queue, opts);

        Ok(NewJob::new(stored.id.clone(), data, resolved))
    }

    /// Options a `job_id` job enqueued on `queue_name` runs with. Jobs not
    /// registered in this process only get the queue defaults.
    pub fn effective_options(&self, job_id: &str, queue_name: &str, opts: &JobOptions) -> ResolvedJobOptions {
        let definition = self
            .stored(job_id)
            .map(|stored| stored.options.clone())
            .unwrap_or_default();
        let queue_defaults = self
            .binding(queue_name)
            .map(|b| b.defaults().clone())
            .unwrap_or_default();
        opts.over(&definition).over(&queue_defaults).resolve()
    }

    /// Enqueue a prepared job, or upsert a scheduler when it repeats.
    pub(crate) async fn submit(&self, job_id: &str, job: NewJob) -> JobsResult<JobHandle> {
        let queue = self.resolve_queue(job_id)?;

        let Some(repeat) = job.opts.repeat.clone() else {
            return Ok(queue.add(job).await?);
        };

        let mut opts = job.opts;
        opts.repeat = None;
        opts.job_id = None;
        let spec = SchedulerSpec {
            repeat,
            job_name: job.name.clone(),
            data: job.data,
            opts,
        };
        let scheduler_id = recurring_scheduler_id(job_id, &spec);
        let pattern = spec.repeat.pattern.clone();

        let entry = queue.upsert_scheduler(&scheduler_id, spec).await?;
        let next = entry.next_job_id.ok_or_else(|| {
            QueueError::invalid_schedule(format!("'{}' has no upcoming fire time", pattern))
        })?;

        info!(
            "Recurring job '{}' scheduled as {} on queue {}",
            job_id,
            scheduler_id,
            queue.name()
        );
        Ok(JobHandle {
            id: JobId::from_string(next),
            name: job.name,
            queue: queue.name().to_string(),
        })
    }

    /// Enqueue prepared jobs in one bulk call when none of them repeats.
    pub(crate) async fn submit_bulk(&self, job_id: &str, jobs: Vec<NewJob>) -> JobsResult<Vec<JobHandle>> {
        if jobs.iter().any(|j| j.opts.repeat.is_some()) {
            let mut handles = Vec::with_capacity(jobs.len());
            for job in jobs {
                handles.push(self.submit(job_id, job).await?);
            }
            return Ok(handles);
        }

        let queue = self.resolve_queue(job_id)?;
        Ok(queue.add_bulk(jobs).await?)
    }

    /// Validate and lower a flow tree, then submit it through the flow
    /// producer. Nothing is submitted if any node is invalid.
    pub async fn trigger_flow(&self, root: FlowNode) -> JobsResult<FlowNodeHandle> {
        let tree = FlowTree::build(root);
        debug!("Lowering flow with {} jobs", tree.len());
        let flow = tree.lower(|job_id, data, opts| {
            let job = self.prepare_job(job_id, data, opts)?;
            let queue = self
                .queue_name(job_id)
                .ok_or_else(|| ResolutionError::NoQueue(job_id.to_string()))?;
            Ok((job, queue))
        })?;

        let producer = self.flow_producer()?;
        Ok(producer.add(flow).await?)
    }

    /// Run the handler registered under `job_id` for a dequeued job.
    ///
    /// The payload is validated again so producer/consumer schema drift
    /// surfaces as a validation error instead of a handler crash.
    pub async fn execute_job(&self, job_id: &str, job: ActiveJob, data: Arc<D>) -> JobsResult<Value> {
        let stored = self
            .stored(job_id)
            .ok_or_else(|| ResolutionError::UnknownJob(job_id.to_string()))?;
        let logger = JobLogger::new(job.id(), &stored.id, job.queue().name());

        let value = match (stored.normalize)(job.data()) {
            Ok(value) => value,
            Err(violation) => {
                logger.log_error(&format!("payload rejected: {}", violation));
                return Err(JobsError::validation(job_id, violation));
            }
        };

        let attempt = job.attempt();
        let ctx = JobContext::new(job, data, logger.clone());
        logger.log_start(attempt);
        let started = Instant::now();

        match (stored.run)(value, ctx).await {
            Ok(result) => {
                logger.log_completion(started.elapsed());
                Ok(result)
            }
            Err(e) => {
                logger.log_error(&format!("{:#}", e));
                Err(JobsError::execution(job_id, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobline_models::RepeatOptions;

    #[test]
    fn test_recurring_scheduler_id_is_stable() {
        let spec = SchedulerSpec {
            repeat: RepeatOptions::cron("0 9 * * 1"),
            job_name: "digest".to_string(),
            data: serde_json::json!({"team": "t1"}),
            opts: JobOptions::new().resolve(),
        };
        let mut other = spec.clone();
        other.data = serde_json::json!({"team": "t2"});

        let id = recurring_scheduler_id("digest", &spec);
        assert_eq!(id, recurring_scheduler_id("digest", &spec));
        assert_ne!(id, recurring_scheduler_id("digest", &other));
        assert!(id.starts_with("repeat:digest:"));
        assert_eq!(id.len(), "repeat:digest:".len() + 64);
    }
}
