//! In-process broker.
//!
//! [`MemoryBroker`] mirrors the Redis broker's state machine (priorities,
//! delays, locks, stall recovery, flows, schedulers, retention) without a
//! server. Every call is recorded so tests can assert on broker traffic, and
//! the clock can be advanced to expire delays and locks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use jobline_models::{
    Dependencies, FlowJob, FlowNodeHandle, JobCounts, JobHandle, JobId, JobRecord, JobState,
    KeepJobs, NewJob, ParentRef, SchedulerEntry, SchedulerSpec,
};

use crate::broker::{Broker, BrokerConnector, FailOutcome, JobFailure, StalledJobs};
use crate::error::{QueueError, QueueResult};
use crate::schedule::plan_iteration;

const STALLED_REASON: &str = "job stalled more than allowable limit";

/// One recorded broker call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerCall {
    pub op: &'static str,
    pub queue: Option<String>,
}

struct StoredJob {
    record: JobRecord,
    lock: Option<(String, i64)>,
    dependencies: BTreeSet<String>,
    processed: BTreeMap<String, Value>,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, StoredJob>,
    wait: BTreeSet<(u32, u64, String)>,
    delayed: BTreeSet<(i64, u64, String)>,
    waiting_children: BTreeSet<String>,
    active: Vec<String>,
    completed: Vec<(i64, String)>,
    failed: Vec<(i64, String)>,
    schedulers: BTreeMap<String, SchedulerEntry>,
    next_id: u64,
    seq: u64,
}

impl QueueState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn enqueue_waiting(&mut self, id: &str) {
        let priority = self.jobs.get(id).map(|j| j.record.opts.priority).unwrap_or(1);
        let seq = self.next_seq();
        self.wait.insert((priority, seq, id.to_string()));
        if let Some(job) = self.jobs.get_mut(id) {
            job.record.state = JobState::Waiting;
        }
    }

    fn schedule_delayed(&mut self, id: &str, at: i64) {
        let seq = self.next_seq();
        self.delayed.insert((at, seq, id.to_string()));
        if let Some(job) = self.jobs.get_mut(id) {
            job.record.state = JobState::Delayed;
        }
    }

    fn remove_delayed(&mut self, id: &str) -> bool {
        let entry = self.delayed.iter().find(|(_, _, d)| d == id).cloned();
        match entry {
            Some(entry) => self.delayed.remove(&entry),
            None => false,
        }
    }

    fn promote_due(&mut self, now: i64) {
        let due: Vec<_> = self
            .delayed
            .iter()
            .take_while(|(at, _, _)| *at <= now)
            .cloned()
            .collect();
        for entry in due {
            self.delayed.remove(&entry);
            if self.jobs.contains_key(&entry.2) {
                self.enqueue_waiting(&entry.2);
            }
        }
    }

    fn release_lock(&mut self, id: &str) {
        self.active.retain(|a| a != id);
        if let Some(job) = self.jobs.get_mut(id) {
            job.lock = None;
        }
    }

    fn trim(&mut self, state: JobState, now: i64, keep: KeepJobs) {
        let set = match state {
            JobState::Completed => &mut self.completed,
            _ => &mut self.failed,
        };
        let mut removed = Vec::new();
        if let Some(age) = keep.age_secs {
            let cutoff = now - (age * 1000) as i64;
            set.retain(|(at, id)| {
                let keep = *at > cutoff;
                if !keep {
                    removed.push(id.clone());
                }
                keep
            });
        }
        if let Some(count) = keep.count {
            let count = count as usize;
            if set.len() > count {
                let excess = set.len() - count;
                removed.extend(set.drain(..excess).map(|(_, id)| id));
            }
        }
        for id in removed {
            self.jobs.remove(&id);
        }
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
}

impl State {
    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }
}

/// Broker kept entirely in memory.
pub struct MemoryBroker {
    prefix: String,
    state: Mutex<State>,
    calls: Mutex<Vec<BrokerCall>>,
    clock_offset_ms: AtomicI64,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            prefix: "{jobline}".to_string(),
            state: Mutex::new(State::default()),
            calls: Mutex::new(Vec::new()),
            clock_offset_ms: AtomicI64::new(0),
        }
    }

    /// Move the broker clock forward. Delays and lock expiry use this clock.
    pub fn advance(&self, by: Duration) {
        self.clock_offset_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    /// Current broker time in unix milliseconds.
    pub fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() + self.clock_offset_ms.load(Ordering::SeqCst)
    }

    pub async fn calls(&self) -> Vec<BrokerCall> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self, op: &str) -> usize {
        self.calls.lock().await.iter().filter(|c| c.op == op).count()
    }

    /// All jobs currently stored on `queue`, oldest first.
    pub async fn jobs(&self, queue: &str) -> Vec<JobRecord> {
        let state = self.state.lock().await;
        let mut jobs: Vec<JobRecord> = state
            .queues
            .get(queue)
            .map(|q| q.jobs.values().map(|j| j.record.clone()).collect())
            .unwrap_or_default();
        jobs.sort_by_key(|j| (j.timestamp, j.id.as_str().len(), j.id.to_string()));
        jobs
    }

    async fn record(&self, op: &'static str, queue: Option<&str>) {
        self.calls.lock().await.push(BrokerCall {
            op,
            queue: queue.map(str::to_string),
        });
    }

    fn job_key(&self, queue: &str, id: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, id)
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_job(
        &self,
        state: &mut State,
        queue: &str,
        id: Option<String>,
        job: &NewJob,
        now: i64,
        parent: Option<ParentRef>,
        wait_children: bool,
    ) -> (String, bool) {
        let q = state.queue(queue);
        let id = match id {
            Some(id) => id,
            None => {
                q.next_id += 1;
                q.next_id.to_string()
            }
        };
        if q.jobs.contains_key(&id) {
            if let Some(parent) = parent {
                self.link_existing(state, queue, &id, &parent);
            }
            return (id, false);
        }

        let record = JobRecord {
            id: JobId::from_string(id.clone()),
            name: job.name.clone(),
            queue: queue.to_string(),
            data: job.data.clone(),
            opts: job.opts.clone(),
            state: JobState::Waiting,
            progress: 0,
            attempts_made: 0,
            attempts_started: 0,
            stalled_counter: 0,
            timestamp: now,
            processed_on: None,
            finished_on: None,
            return_value: None,
            failed_reason: None,
            stacktrace: Vec::new(),
            parent: parent.clone(),
            scheduler_id: job.scheduler_id.clone(),
        };
        q.jobs.insert(
            id.clone(),
            StoredJob {
                record,
                lock: None,
                dependencies: BTreeSet::new(),
                processed: BTreeMap::new(),
            },
        );

        if wait_children {
            q.waiting_children.insert(id.clone());
            if let Some(stored) = q.jobs.get_mut(&id) {
                stored.record.state = JobState::WaitingChildren;
            }
        } else if job.opts.delay_ms > 0 {
            q.schedule_delayed(&id, now + job.opts.delay_ms as i64);
        } else {
            q.enqueue_waiting(&id);
        }

        if let Some(parent) = parent {
            let child_key = self.job_key(queue, &id);
            if let Some(p) = state.queue(&parent.queue).jobs.get_mut(parent.id.as_str()) {
                p.dependencies.insert(child_key);
            }
        }
        (id, true)
    }

    /// Attach a stored job to a flow parent. A completed job counts as
    /// processed; a job owned by another parent is not linked.
    fn link_existing(&self, state: &mut State, queue: &str, id: &str, parent: &ParentRef) {
        let child_key = self.job_key(queue, id);
        let Some(child) = state.queue(queue).jobs.get_mut(id) else {
            return;
        };
        let processed = if child.record.state == JobState::Completed {
            Some(child.record.return_value.clone().unwrap_or(Value::Null))
        } else if child.record.parent.is_none() {
            child.record.parent = Some(parent.clone());
            None
        } else {
            return;
        };

        if let Some(p) = state.queue(&parent.queue).jobs.get_mut(parent.id.as_str()) {
            match processed {
                Some(value) => {
                    p.processed.insert(child_key, value);
                }
                None => {
                    p.dependencies.insert(child_key);
                }
            }
        }
    }

    /// Store `entry` and make its planned iteration (if any) the only
    /// pending one.
    fn write_scheduler(
        &self,
        state: &mut State,
        queue: &str,
        entry: SchedulerEntry,
        iteration: Option<NewJob>,
        now: i64,
    ) {
        let new_id = iteration.as_ref().and_then(|j| j.opts.job_id.clone());
        let q = state.queue(queue);
        if let Some(prev) = q.schedulers.get(&entry.id) {
            if let Some(prev_id) = prev.next_job_id.clone() {
                if Some(&prev_id) != new_id.as_ref() && q.remove_delayed(&prev_id) {
                    q.jobs.remove(&prev_id);
                }
            }
        }
        q.schedulers.insert(entry.id.clone(), entry);

        if let Some(job) = iteration {
            self.insert_job(state, queue, new_id, &job, now, None, false);
        }
    }

    fn advance_scheduler(&self, state: &mut State, record: &JobRecord, now: i64) -> QueueResult<()> {
        let Some(scheduler_id) = record.scheduler_id.as_deref() else {
            return Ok(());
        };
        let Some(mut entry) = state.queue(&record.queue).schedulers.get(scheduler_id).cloned() else {
            return Ok(());
        };
        if entry.next_job_id.as_deref() != Some(record.id.as_str()) {
            return Ok(());
        }
        let iteration = plan_iteration(&mut entry, now)?;
        self.write_scheduler(state, &record.queue, entry, iteration, now);
        Ok(())
    }

    fn release_parent(&self, state: &mut State, child_key: &str, parent: &ParentRef, value: Option<&Value>) {
        let q = state.queue(&parent.queue);
        let ready = match q.jobs.get_mut(parent.id.as_str()) {
            Some(p) => {
                if let Some(value) = value {
                    p.processed.insert(child_key.to_string(), value.clone());
                }
                p.dependencies.remove(child_key);
                p.dependencies.is_empty()
            }
            None => false,
        };
        if ready && q.waiting_children.remove(parent.id.as_str()) {
            q.enqueue_waiting(parent.id.as_str());
        }
    }

    fn check_lock(q: &QueueState, id: &str, token: &str, now: i64) -> QueueResult<()> {
        let job = q
            .jobs
            .get(id)
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        match &job.lock {
            Some((held, expires)) if held == token && *expires > now => Ok(()),
            _ => Err(QueueError::LockMismatch(id.to_string())),
        }
    }
}

fn flow_handles(
    broker: &MemoryBroker,
    state: &mut State,
    flow: &FlowJob,
    parent: Option<ParentRef>,
    now: i64,
) -> FlowNodeHandle {
    let job = NewJob::new(flow.name.clone(), flow.data.clone(), flow.opts.clone());
    let (id, created) = broker.insert_job(
        state,
        &flow.queue_name,
        flow.opts.job_id.clone(),
        &job,
        now,
        parent,
        !flow.children.is_empty(),
    );

    let me = ParentRef {
        id: JobId::from_string(id.clone()),
        queue: flow.queue_name.clone(),
    };
    let children = flow
        .children
        .iter()
        .map(|child| flow_handles(broker, state, child, Some(me.clone()), now))
        .collect();

    // Children that already existed may have completed before the flow.
    if created && !flow.children.is_empty() {
        let q = state.queue(&flow.queue_name);
        let ready = q.jobs.get(&id).is_some_and(|j| j.dependencies.is_empty());
        if ready && q.waiting_children.remove(&id) {
            q.enqueue_waiting(&id);
        }
    }

    FlowNodeHandle {
        job: JobHandle {
            id: JobId::from_string(id),
            name: flow.name.clone(),
            queue: flow.queue_name.clone(),
        },
        children,
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> QueueResult<()> {
        self.record("ping", None).await;
        Ok(())
    }

    async fn add(&self, queue: &str, job: NewJob) -> QueueResult<JobId> {
        self.record("add", Some(queue)).await;
        let now = self.now_millis();
        let mut state = self.state.lock().await;
        let (id, _) = self.insert_job(&mut state, queue, job.opts.job_id.clone(), &job, now, None, false);
        Ok(JobId::from_string(id))
    }

    async fn add_bulk(&self, queue: &str, jobs: Vec<NewJob>) -> QueueResult<Vec<JobId>> {
        self.record("add_bulk", Some(queue)).await;
        let now = self.now_millis();
        let mut state = self.state.lock().await;
        Ok(jobs
            .iter()
            .map(|job| {
                let (id, _) = self.insert_job(&mut state, queue, job.opts.job_id.clone(), job, now, None, false);
                JobId::from_string(id)
            })
            .collect())
    }

    async fn add_flow(&self, flow: FlowJob) -> QueueResult<FlowNodeHandle> {
        self.record("add_flow", Some(&flow.queue_name)).await;
        let now = self.now_millis();
        let mut state = self.state.lock().await;
        Ok(flow_handles(self, &mut state, &flow, None, now))
    }

    async fn upsert_scheduler(
        &self,
        queue: &str,
        scheduler_id: &str,
        spec: SchedulerSpec,
    ) -> QueueResult<SchedulerEntry> {
        self.record("upsert_scheduler", Some(queue)).await;
        let now = self.now_millis();
        let mut state = self.state.lock().await;

        let mut entry = SchedulerEntry::new(scheduler_id, spec);
        if let Some(existing) = state.queue(queue).schedulers.get(scheduler_id) {
            entry.count = existing.count;
            entry.next_job_id = existing.next_job_id.clone();
            entry.next_millis = existing.next_millis;
        }

        let iteration = plan_iteration(&mut entry, now)?;
        self.write_scheduler(&mut state, queue, entry.clone(), iteration, now);
        Ok(entry)
    }

    async fn remove_scheduler(&self, queue: &str, scheduler_id: &str) -> QueueResult<bool> {
        self.record("remove_scheduler", Some(queue)).await;
        let mut state = self.state.lock().await;
        let q = state.queue(queue);
        let Some(entry) = q.schedulers.remove(scheduler_id) else {
            return Ok(false);
        };
        if let Some(pending) = entry.next_job_id {
            if q.remove_delayed(&pending) {
                q.jobs.remove(&pending);
            }
        }
        Ok(true)
    }

    async fn get_scheduler(&self, queue: &str, scheduler_id: &str) -> QueueResult<Option<SchedulerEntry>> {
        self.record("get_scheduler", Some(queue)).await;
        let mut state = self.state.lock().await;
        Ok(state.queue(queue).schedulers.get(scheduler_id).cloned())
    }

    async fn schedulers(&self, queue: &str) -> QueueResult<Vec<SchedulerEntry>> {
        self.record("schedulers", Some(queue)).await;
        let mut state = self.state.lock().await;
        Ok(state.queue(queue).schedulers.values().cloned().collect())
    }

    async fn fetch_next(
        &self,
        queue: &str,
        token: &str,
        lock_duration: Duration,
    ) -> QueueResult<Option<JobRecord>> {
        self.record("fetch_next", Some(queue)).await;
        let now = self.now_millis();
        let mut state = self.state.lock().await;

        let record = {
            let q = state.queue(queue);
            q.promote_due(now);

            let mut picked = None;
            while let Some(entry) = q.wait.pop_first() {
                if let Some(job) = q.jobs.get_mut(&entry.2) {
                    job.lock = Some((token.to_string(), now + lock_duration.as_millis() as i64));
                    job.record.state = JobState::Active;
                    job.record.processed_on = Some(now);
                    job.record.attempts_started += 1;
                    picked = Some(job.record.clone());
                    q.active.push(entry.2);
                    break;
                }
            }
            picked
        };

        if let Some(record) = &record {
            if let Err(e) = self.advance_scheduler(&mut state, record, now) {
                warn!(
                    "Failed to schedule next iteration after job {} on {}: {}",
                    record.id, queue, e
                );
            }
        }
        Ok(record)
    }

    async fn extend_lock(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &str,
        lock_duration: Duration,
    ) -> QueueResult<bool> {
        self.record("extend_lock", Some(queue)).await;
        let now = self.now_millis();
        let mut state = self.state.lock().await;
        let Some(job) = state.queue(queue).jobs.get_mut(job_id.as_str()) else {
            return Ok(false);
        };
        match job.lock.as_mut() {
            Some((held, expires)) if held == token && *expires > now => {
                *expires = now + lock_duration.as_millis() as i64;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &str,
        return_value: &Value,
        keep: KeepJobs,
    ) -> QueueResult<()> {
        self.record("complete", Some(queue)).await;
        let now = self.now_millis();
        let mut state = self.state.lock().await;
        let id = job_id.as_str();

        let parent = {
            let q = state.queue(queue);
            Self::check_lock(q, id, token, now)?;
            q.release_lock(id);
            let job = q
                .jobs
                .get_mut(id)
                .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
            job.record.attempts_made += 1;
            job.record.return_value = Some(return_value.clone());
            job.record.finished_on = Some(now);
            job.record.state = JobState::Completed;
            job.record.parent.clone()
        };

        if let Some(parent) = parent {
            let child_key = self.job_key(queue, id);
            self.release_parent(&mut state, &child_key, &parent, Some(return_value));
        }

        let q = state.queue(queue);
        q.completed.push((now, id.to_string()));
        q.trim(JobState::Completed, now, keep);
        Ok(())
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
        self.record("fail", Some(queue)).await;
        let now = self.now_millis();
        let mut state = self.state.lock().await;
        let id = job_id.as_str();
        let q = state.queue(queue);

        Self::check_lock(q, id, token, now)?;
        q.release_lock(id);
        if let Some(job) = q.jobs.get_mut(id) {
            job.record.attempts_made += 1;
            job.record.failed_reason = Some(failure.reason.clone());
            job.record.stacktrace = failure.stacktrace.clone();
        }

        match retry_delay {
            Some(delay) if !delay.is_zero() => {
                q.schedule_delayed(id, now + delay.as_millis() as i64);
                Ok(FailOutcome::Retrying)
            }
            Some(_) => {
                q.enqueue_waiting(id);
                Ok(FailOutcome::Retrying)
            }
            None => {
                if let Some(job) = q.jobs.get_mut(id) {
                    job.record.finished_on = Some(now);
                    job.record.state = JobState::Failed;
                }
                q.failed.push((now, id.to_string()));
                q.trim(JobState::Failed, now, keep);
                Ok(FailOutcome::Failed)
            }
        }
    }

    async fn recover_stalled(&self, queue: &str, max_stalled: u32) -> QueueResult<StalledJobs> {
        self.record("recover_stalled", Some(queue)).await;
        let now = self.now_millis();
        let mut state = self.state.lock().await;
        let q = state.queue(queue);

        let expired: Vec<String> = q
            .active
            .iter()
            .filter(|id| {
                q.jobs
                    .get(id.as_str())
                    .and_then(|j| j.lock.as_ref())
                    .map_or(true, |(_, expires)| *expires <= now)
            })
            .cloned()
            .collect();

        let mut outcome = StalledJobs::default();
        for id in expired {
            q.release_lock(&id);
            let Some(job) = q.jobs.get_mut(&id) else {
                continue;
            };
            job.record.stalled_counter += 1;
            if job.record.stalled_counter > max_stalled {
                job.record.attempts_made += 1;
                job.record.failed_reason = Some(STALLED_REASON.to_string());
                job.record.finished_on = Some(now);
                job.record.state = JobState::Failed;
                let keep = job.record.opts.remove_on_fail;
                q.failed.push((now, id.clone()));
                q.trim(JobState::Failed, now, keep);
                outcome.failed.push(JobId::from_string(id));
            } else {
                q.enqueue_waiting(&id);
                outcome.recovered.push(JobId::from_string(id));
            }
        }

        if !outcome.is_empty() {
            debug!(
                "Memory broker stall sweep on {}: {} recovered, {} failed",
                queue,
                outcome.recovered.len(),
                outcome.failed.len()
            );
        }
        Ok(outcome)
    }

    async fn update_progress(&self, queue: &str, job_id: &JobId, progress: u8) -> QueueResult<()> {
        self.record("update_progress", Some(queue)).await;
        let mut state = self.state.lock().await;
        if let Some(job) = state.queue(queue).jobs.get_mut(job_id.as_str()) {
            job.record.progress = progress;
        }
        Ok(())
    }

    async fn get_job(&self, queue: &str, job_id: &JobId) -> QueueResult<Option<JobRecord>> {
        self.record("get_job", Some(queue)).await;
        let mut state = self.state.lock().await;
        Ok(state
            .queue(queue)
            .jobs
            .get(job_id.as_str())
            .map(|j| j.record.clone()))
    }

    async fn dependencies(&self, queue: &str, job_id: &JobId) -> QueueResult<Dependencies> {
        self.record("dependencies", Some(queue)).await;
        let mut state = self.state.lock().await;
        Ok(match state.queue(queue).jobs.get(job_id.as_str()) {
            Some(job) => Dependencies {
                processed: job.processed.clone(),
                unprocessed: job.dependencies.iter().cloned().collect(),
            },
            None => Dependencies::default(),
        })
    }

    async fn counts(&self, queue: &str) -> QueueResult<JobCounts> {
        self.record("counts", Some(queue)).await;
        let mut state = self.state.lock().await;
        let q = state.queue(queue);
        Ok(JobCounts {
            waiting: q.wait.len() as u64,
            delayed: q.delayed.len() as u64,
            waiting_children: q.waiting_children.len() as u64,
            active: q.active.len() as u64,
            completed: q.completed.len() as u64,
            failed: q.failed.len() as u64,
        })
    }

    /// The store outlives its handles, so closing only records the call.
    async fn close(&self) -> QueueResult<()> {
        self.record("close", None).await;
        Ok(())
    }
}

/// Hands out the same [`MemoryBroker`] for every queue.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    broker: Arc<MemoryBroker>,
}

impl MemoryConnector {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> Arc<MemoryBroker> {
        self.broker.clone()
    }
}

impl BrokerConnector for MemoryConnector {
    fn connect(&self, _queue: Option<&str>) -> QueueResult<Arc<dyn Broker>> {
        Ok(self.broker.clone())
    }
}
