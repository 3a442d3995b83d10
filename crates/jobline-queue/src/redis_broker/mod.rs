//! Redis-backed broker.
//!
//! State transitions (enqueue, fetch, complete, fail, stall recovery,
//! scheduler upserts) run as Lua scripts so each one is atomic on the
//! server. Bulk and flow submissions pipeline the add-job script inside
//! `MULTI`/`EXEC`. Scripts derive job and parent keys from the queue base
//! key, which is only cluster-safe because every key carries the prefix
//! hash tag (see `keys`).

mod codec;
mod keys;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncConnectionConfig, Script};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use jobline_models::{
    Dependencies, FlowJob, FlowNodeHandle, JobCounts, JobHandle, JobId, JobRecord, JobState,
    KeepJobs, NewJob, SchedulerEntry, SchedulerSpec,
};

use crate::broker::{Broker, BrokerConnector, FailOutcome, JobFailure, StalledJobs};
use crate::config::BrokerConfig;
use crate::error::{QueueError, QueueResult};
use crate::schedule::plan_iteration;

use codec::{add_job_args, record_from_hash, ParentArgs};
use keys::Keys;

const ADD_JOB_LUA: &str = concat!(include_str!("lua/common.lua"), include_str!("lua/add_job.lua"));
const RELEASE_IF_READY_LUA: &str = concat!(
    include_str!("lua/common.lua"),
    include_str!("lua/release_if_ready.lua")
);

struct Scripts {
    add_job: Script,
    move_to_active: Script,
    move_to_completed: Script,
    move_to_failed: Script,
    check_stalled: Script,
    extend_lock: Script,
    upsert_scheduler: Script,
    remove_scheduler: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            add_job: Script::new(ADD_JOB_LUA),
            move_to_active: Script::new(concat!(
                include_str!("lua/common.lua"),
                include_str!("lua/move_to_active.lua")
            )),
            move_to_completed: Script::new(concat!(
                include_str!("lua/common.lua"),
                include_str!("lua/move_to_completed.lua")
            )),
            move_to_failed: Script::new(concat!(
                include_str!("lua/common.lua"),
                include_str!("lua/move_to_failed.lua")
            )),
            check_stalled: Script::new(concat!(
                include_str!("lua/common.lua"),
                include_str!("lua/check_stalled.lua")
            )),
            extend_lock: Script::new(include_str!("lua/extend_lock.lua")),
            upsert_scheduler: Script::new(concat!(
                include_str!("lua/common.lua"),
                include_str!("lua/upsert_scheduler.lua")
            )),
            remove_scheduler: Script::new(include_str!("lua/remove_scheduler.lua")),
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn keep_args(keep: KeepJobs) -> (i64, i64) {
    let count = keep.count.map(|c| c as i64).unwrap_or(-1);
    let age = keep.age_secs.map(|s| (s * 1000) as i64).unwrap_or(-1);
    (count, age)
}

/// Broker backed by a Redis (or Valkey) server.
pub struct RedisBroker {
    client: redis::Client,
    config: BrokerConfig,
    keys: Keys,
    scripts: Scripts,
    conn: Mutex<Option<MultiplexedConnection>>,
    closed: AtomicBool,
}

impl RedisBroker {
    /// Create a broker. The connection is opened lazily on first use.
    pub fn new(config: BrokerConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            keys: Keys::new(config.key_prefix.clone()),
            config,
            scripts: Scripts::load(),
            conn: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(BrokerConfig::from_env()?)
    }

    async fn conn(&self) -> QueueResult<MultiplexedConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let connection_config = AsyncConnectionConfig::new()
            .set_connection_timeout(self.config.connection_timeout)
            .set_response_timeout(self.config.response_timeout);
        let conn = self
            .client
            .get_multiplexed_async_connection_with_config(&connection_config)
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))?;

        debug!("Opened Redis connection to {}", self.config.redis_url);
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn state_of(&self, conn: &mut MultiplexedConnection, queue: &str, id: &str) -> QueueResult<JobState> {
        let (completed, failed, delayed, waiting_children, waiting): (
            Option<f64>,
            Option<f64>,
            Option<f64>,
            Option<f64>,
            Option<f64>,
        ) = redis::pipe()
            .zscore(self.keys.set(queue, "completed"), id)
            .zscore(self.keys.set(queue, "failed"), id)
            .zscore(self.keys.set(queue, "delayed"), id)
            .zscore(self.keys.set(queue, "waiting-children"), id)
            .zscore(self.keys.set(queue, "wait"), id)
            .query_async(conn)
            .await?;

        Ok(if completed.is_some() {
            JobState::Completed
        } else if failed.is_some() {
            JobState::Failed
        } else if delayed.is_some() {
            JobState::Delayed
        } else if waiting_children.is_some() {
            JobState::WaitingChildren
        } else if waiting.is_some() {
            JobState::Waiting
        } else {
            JobState::Active
        })
    }

    async fn write_scheduler(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        entry: &SchedulerEntry,
        iteration: Option<NewJob>,
        now: i64,
    ) -> QueueResult<()> {
        let entry_json = serde_json::to_string(entry)?;
        let mut invocation = self.scripts.upsert_scheduler.key(self.keys.base(queue));
        invocation.arg(&entry.id).arg(entry_json);

        match iteration {
            Some(job) => {
                let id = job.opts.job_id.clone().unwrap_or_default();
                let args = add_job_args(&id, &job, now, None, false)?;
                invocation.arg("1").arg(&args[..7]);
            }
            None => {
                invocation.arg("0").arg(entry.next_job_id.clone().unwrap_or_default());
            }
        }

        invocation.invoke_async::<i64>(conn).await?;
        Ok(())
    }

    /// Materialise the iteration after `record` if it is the scheduler's
    /// pending one.
    async fn advance_scheduler(&self, conn: &mut MultiplexedConnection, record: &JobRecord) -> QueueResult<()> {
        let Some(scheduler_id) = record.scheduler_id.as_deref() else {
            return Ok(());
        };
        let Some(mut entry) = self.read_scheduler(conn, &record.queue, scheduler_id).await? else {
            return Ok(());
        };
        if entry.next_job_id.as_deref() != Some(record.id.as_str()) {
            return Ok(());
        }

        let now = now_millis();
        let iteration = plan_iteration(&mut entry, now)?;
        self.write_scheduler(conn, &record.queue, &entry, iteration, now).await?;
        debug!(
            "Scheduler {} advanced to {:?}",
            scheduler_id, entry.next_job_id
        );
        Ok(())
    }

    async fn read_scheduler(
        &self,
        conn: &mut MultiplexedConnection,
        queue: &str,
        scheduler_id: &str,
    ) -> QueueResult<Option<SchedulerEntry>> {
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.keys.set(queue, "schedulers"))
            .arg(scheduler_id)
            .query_async(conn)
            .await?;
        Ok(match raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        })
    }
}

struct FlatNode<'a> {
    job: &'a FlowJob,
    parent: Option<usize>,
}

fn flatten<'a>(job: &'a FlowJob, parent: Option<usize>, out: &mut Vec<FlatNode<'a>>) {
    let index = out.len();
    out.push(FlatNode { job, parent });
    for child in &job.children {
        flatten(child, Some(index), out);
    }
}

fn build_handles(job: &FlowJob, ids: &mut std::slice::Iter<'_, String>) -> FlowNodeHandle {
    let id = ids.next().cloned().unwrap_or_default();
    FlowNodeHandle {
        job: JobHandle {
            id: JobId::from_string(id),
            name: job.name.clone(),
            queue: job.queue_name.clone(),
        },
        children: job.children.iter().map(|c| build_handles(c, ids)).collect(),
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    async fn add(&self, queue: &str, job: NewJob) -> QueueResult<JobId> {
        let mut conn = self.conn().await?;
        let id = job.opts.job_id.clone().unwrap_or_default();
        let args = add_job_args(&id, &job, now_millis(), None, false)?;

        let (id, created): (String, i64) = self
            .scripts
            .add_job
            .key(self.keys.base(queue))
            .arg(&args)
            .invoke_async(&mut conn)
            .await?;

        if created == 0 {
            debug!("Job {} already exists on queue {}", id, queue);
        }
        Ok(JobId::from_string(id))
    }

    async fn add_bulk(&self, queue: &str, jobs: Vec<NewJob>) -> QueueResult<Vec<JobId>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        let now = now_millis();
        let base = self.keys.base(queue);

        let mut pipe = redis::pipe();
        pipe.atomic();
        for job in &jobs {
            let id = job.opts.job_id.clone().unwrap_or_default();
            let args = add_job_args(&id, job, now, None, false)?;
            pipe.cmd("EVAL").arg(ADD_JOB_LUA).arg(1).arg(&base).arg(&args);
        }

        let results: Vec<(String, i64)> = pipe.query_async(&mut conn).await?;
        if results.len() != jobs.len() {
            return Err(QueueError::enqueue_failed(format!(
                "bulk add on queue {} returned {} of {} jobs",
                queue,
                results.len(),
                jobs.len()
            )));
        }
        Ok(results.into_iter().map(|(id, _)| JobId::from_string(id)).collect())
    }

    async fn add_flow(&self, flow: FlowJob) -> QueueResult<FlowNodeHandle> {
        let mut conn = self.conn().await?;
        let now = now_millis();

        let mut nodes = Vec::new();
        flatten(&flow, None, &mut nodes);

        // Parents must know their ID before children reference them, so
        // reserve IDs for every node without an explicit one.
        let mut reserve = redis::pipe();
        let mut needs_id = Vec::new();
        for (index, node) in nodes.iter().enumerate() {
            if node.job.opts.job_id.is_none() {
                reserve.incr(self.keys.set(&node.job.queue_name, "id"), 1);
                needs_id.push(index);
            }
        }
        let reserved: Vec<i64> = if needs_id.is_empty() {
            Vec::new()
        } else {
            reserve.query_async(&mut conn).await?
        };

        let mut ids: Vec<String> = nodes
            .iter()
            .map(|n| n.job.opts.job_id.clone().unwrap_or_default())
            .collect();
        for (index, id) in needs_id.into_iter().zip(reserved) {
            ids[index] = id.to_string();
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (index, node) in nodes.iter().enumerate() {
            let parent_base;
            let parent = match node.parent {
                Some(p) => {
                    parent_base = self.keys.base(&nodes[p].job.queue_name);
                    Some(ParentArgs {
                        base: &parent_base,
                        id: &ids[p],
                        queue: &nodes[p].job.queue_name,
                    })
                }
                None => None,
            };
            let job = NewJob::new(node.job.name.clone(), node.job.data.clone(), node.job.opts.clone());
            let args = add_job_args(&ids[index], &job, now, parent.as_ref(), !node.job.children.is_empty())?;
            pipe.cmd("EVAL")
                .arg(ADD_JOB_LUA)
                .arg(1)
                .arg(self.keys.base(&node.job.queue_name))
                .arg(&args);
        }
        // Children that already existed may have completed before the flow.
        for (index, node) in nodes.iter().enumerate().rev() {
            if !node.job.children.is_empty() {
                pipe.cmd("EVAL")
                    .arg(RELEASE_IF_READY_LUA)
                    .arg(1)
                    .arg(self.keys.base(&node.job.queue_name))
                    .arg(&ids[index])
                    .ignore();
            }
        }
        let _: Vec<(String, i64)> = pipe.query_async(&mut conn).await?;

        info!(
            "Added flow '{}' with {} jobs on queue {}",
            flow.name,
            nodes.len(),
            flow.queue_name
        );
        Ok(build_handles(&flow, &mut ids.iter()))
    }

    async fn upsert_scheduler(
        &self,
        queue: &str,
        scheduler_id: &str,
        spec: SchedulerSpec,
    ) -> QueueResult<SchedulerEntry> {
        let mut conn = self.conn().await?;
        let now = now_millis();

        let mut entry = SchedulerEntry::new(scheduler_id, spec);
        if let Some(existing) = self.read_scheduler(&mut conn, queue, scheduler_id).await? {
            entry.count = existing.count;
            entry.next_job_id = existing.next_job_id;
            entry.next_millis = existing.next_millis;
        }

        let iteration = plan_iteration(&mut entry, now)?;
        self.write_scheduler(&mut conn, queue, &entry, iteration, now).await?;

        debug!(
            "Upserted scheduler {} on queue {} (next: {:?})",
            scheduler_id, queue, entry.next_millis
        );
        Ok(entry)
    }

    async fn remove_scheduler(&self, queue: &str, scheduler_id: &str) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = self
            .scripts
            .remove_scheduler
            .key(self.keys.base(queue))
            .arg(scheduler_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn get_scheduler(&self, queue: &str, scheduler_id: &str) -> QueueResult<Option<SchedulerEntry>> {
        let mut conn = self.conn().await?;
        self.read_scheduler(&mut conn, queue, scheduler_id).await
    }

    async fn schedulers(&self, queue: &str) -> QueueResult<Vec<SchedulerEntry>> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = redis::cmd("HVALS")
            .arg(self.keys.set(queue, "schedulers"))
            .query_async(&mut conn)
            .await?;

        let mut entries = raw
            .iter()
            .map(|r| serde_json::from_str::<SchedulerEntry>(r))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    async fn fetch_next(
        &self,
        queue: &str,
        token: &str,
        lock_duration: Duration,
    ) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.conn().await?;

        let fetched: Option<(String, HashMap<String, String>)> = self
            .scripts
            .move_to_active
            .key(self.keys.base(queue))
            .arg(now_millis())
            .arg(token)
            .arg(lock_duration.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        let Some((id, hash)) = fetched else {
            return Ok(None);
        };

        let record = record_from_hash(queue, &id, &hash, JobState::Active)?;
        if let Err(e) = self.advance_scheduler(&mut conn, &record).await {
            warn!(
                "Failed to schedule next iteration after job {} on {}: {}",
                id, queue, e
            );
        }
        Ok(Some(record))
    }

    async fn extend_lock(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &str,
        lock_duration: Duration,
    ) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let extended: i64 = self
            .scripts
            .extend_lock
            .key(self.keys.lock(queue, job_id.as_str()))
            .arg(token)
            .arg(lock_duration.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn complete(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &str,
        return_value: &serde_json::Value,
        keep: KeepJobs,
    ) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let (keep_count, keep_age) = keep_args(keep);

        let code: i64 = self
            .scripts
            .move_to_completed
            .key(self.keys.base(queue))
            .arg(job_id.as_str())
            .arg(token)
            .arg(serde_json::to_string(return_value)?)
            .arg(now_millis())
            .arg(keep_count)
            .arg(keep_age)
            .invoke_async(&mut conn)
            .await?;

        match code {
            -1 => Err(QueueError::JobNotFound(job_id.to_string())),
            -2 => Err(QueueError::LockMismatch(job_id.to_string())),
            _ => Ok(()),
        }
    }

    async fn fail(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &str,
        failure: &JobFailure,
        retry_delay: Option<Duration>,
        keep: KeepJobs,
    ) -> QueueResult<FailOutcome> {
        let mut conn = self.conn().await?;
        let (keep_count, keep_age) = keep_args(keep);
        let delay = retry_delay.map(|d| d.as_millis() as i64).unwrap_or(-1);

        let code: i64 = self
            .scripts
            .move_to_failed
            .key(self.keys.base(queue))
            .arg(job_id.as_str())
            .arg(token)
            .arg(now_millis())
            .arg(delay)
            .arg(&failure.reason)
            .arg(serde_json::to_string(&failure.stacktrace)?)
            .arg(keep_count)
            .arg(keep_age)
            .invoke_async(&mut conn)
            .await?;

        match code {
            -1 => Err(QueueError::JobNotFound(job_id.to_string())),
            -2 => Err(QueueError::LockMismatch(job_id.to_string())),
            1 => Ok(FailOutcome::Retrying),
            _ => Ok(FailOutcome::Failed),
        }
    }

    async fn recover_stalled(&self, queue: &str, max_stalled: u32) -> QueueResult<StalledJobs> {
        let mut conn = self.conn().await?;
        let (recovered, failed): (Vec<String>, Vec<String>) = self
            .scripts
            .check_stalled
            .key(self.keys.base(queue))
            .arg(now_millis())
            .arg(max_stalled)
            .invoke_async(&mut conn)
            .await?;

        Ok(StalledJobs {
            recovered: recovered.into_iter().map(JobId::from).collect(),
            failed: failed.into_iter().map(JobId::from).collect(),
        })
    }

    async fn update_progress(&self, queue: &str, job_id: &JobId, progress: u8) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("HSET")
            .arg(self.keys.job(queue, job_id.as_str()))
            .arg("progress")
            .arg(progress)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_job(&self, queue: &str, job_id: &JobId) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.conn().await?;
        let hash: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys.job(queue, job_id.as_str()))
            .query_async(&mut conn)
            .await?;
        if hash.is_empty() {
            return Ok(None);
        }

        let state = self.state_of(&mut conn, queue, job_id.as_str()).await?;
        Ok(Some(record_from_hash(queue, job_id.as_str(), &hash, state)?))
    }

    async fn dependencies(&self, queue: &str, job_id: &JobId) -> QueueResult<Dependencies> {
        let mut conn = self.conn().await?;
        let job_key = self.keys.job(queue, job_id.as_str());

        let (processed, mut unprocessed): (HashMap<String, String>, Vec<String>) = redis::pipe()
            .hgetall(format!("{}:processed", job_key))
            .smembers(format!("{}:dependencies", job_key))
            .query_async(&mut conn)
            .await?;
        unprocessed.sort();

        let processed = processed
            .into_iter()
            .map(|(k, v)| Ok((k, serde_json::from_str(&v)?)))
            .collect::<QueueResult<_>>()?;

        Ok(Dependencies {
            processed,
            unprocessed,
        })
    }

    async fn counts(&self, queue: &str) -> QueueResult<JobCounts> {
        let mut conn = self.conn().await?;
        let (waiting, delayed, waiting_children, active, completed, failed): (u64, u64, u64, u64, u64, u64) =
            redis::pipe()
                .zcard(self.keys.set(queue, "wait"))
                .zcard(self.keys.set(queue, "delayed"))
                .zcard(self.keys.set(queue, "waiting-children"))
                .llen(self.keys.set(queue, "active"))
                .zcard(self.keys.set(queue, "completed"))
                .zcard(self.keys.set(queue, "failed"))
                .query_async(&mut conn)
                .await?;

        Ok(JobCounts {
            waiting,
            delayed,
            waiting_children,
            active,
            completed,
            failed,
        })
    }

    async fn close(&self) -> QueueResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.conn.lock().await.take().is_some() {
            debug!("Closed Redis connection to {}", self.config.redis_url);
        }
        Ok(())
    }
}

/// Opens one [`RedisBroker`] per requested queue.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    config: BrokerConfig,
}

impl RedisConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    /// Create from environment variables (`REDIS_URL` is required).
    pub fn from_env() -> QueueResult<Self> {
        Ok(Self::new(BrokerConfig::from_env()?))
    }
}

impl BrokerConnector for RedisConnector {
    fn connect(&self, queue: Option<&str>) -> QueueResult<Arc<dyn Broker>> {
        debug!("Creating Redis broker for {}", queue.unwrap_or("flow producer"));
        Ok(Arc::new(RedisBroker::new(self.config.clone())?))
    }
}
