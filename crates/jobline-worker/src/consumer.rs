//! Per-queue consumer.
//!
//! Fetches jobs while it holds a concurrency permit, runs each one on its own
//! task with a lock heartbeat, and settles the outcome with the broker. A
//! sweep on the side returns jobs with expired locks to waiting.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use jobline_jobs::{JobsError, Registry};
use jobline_models::{JobId, JobRecord};
use jobline_queue::{ActiveJob, FailOutcome, JobFailure, QueueHandle, WorkerEvent};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::retry::FailureTracker;

pub(crate) struct Consumer<D> {
    queue: QueueHandle,
    registry: Registry<D>,
    data: Arc<D>,
    config: Arc<WorkerConfig>,
    concurrency: usize,
    events: broadcast::Sender<WorkerEvent>,
    consumer_name: String,
}

/// Messages of `error` and each of its sources, outermost first.
fn error_chain(error: &JobsError) -> Vec<String> {
    let mut chain = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    chain
}

impl<D: Send + Sync + 'static> Consumer<D> {
    pub(crate) fn new(
        queue: QueueHandle,
        registry: Registry<D>,
        data: Arc<D>,
        config: Arc<WorkerConfig>,
        events: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        let concurrency = config.concurrency_for(queue.name(), queue.binding().concurrency());
        let consumer_name = format!("{}-{}", queue.name(), Uuid::new_v4());
        Self {
            queue,
            registry,
            data,
            config,
            concurrency,
            events,
            consumer_name,
        }
    }

    fn emit(&self, event: WorkerEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Fetch loop. Returns once shutdown is signalled and in-flight jobs
    /// are done.
    pub(crate) async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> WorkerResult<()> {
        let name = self.queue.name().to_string();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let sweeper = self.clone().spawn_stalled_sweep(shutdown.clone());
        let mut failures = FailureTracker::new(3);

        info!(
            "Starting consumer '{}' with {} concurrent jobs",
            self.consumer_name, self.concurrency
        );
        self.emit(WorkerEvent::Ready { queue: name.clone() });

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|_| WorkerError::consumer_stopped(&name, "semaphore closed"))?,
            };

            let token = format!("{}:{}", self.consumer_name, Uuid::new_v4());
            let fetched = self
                .queue
                .broker()
                .fetch_next(&name, &token, self.config.lock_duration)
                .await;

            match fetched {
                Ok(Some(record)) => {
                    failures.record_success();
                    let consumer = self.clone();
                    tokio::spawn(async move {
                        consumer.process(record, token, permit).await;
                    });
                }
                Ok(None) => {
                    failures.record_success();
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    if failures.record_failure() {
                        warn!("Failed to fetch from queue {}: {}", name, e);
                        self.emit(WorkerEvent::Error {
                            queue: name.clone(),
                            error: e.to_string(),
                            job_id: None,
                        });
                    }
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        sweeper.abort();
        info!("Consumer '{}' waiting for in-flight jobs", self.consumer_name);
        let _ = semaphore.acquire_many(self.concurrency as u32).await;
        debug!("Consumer '{}' stopped", self.consumer_name);
        Ok(())
    }

    fn spawn_stalled_sweep(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let name = self.queue.name().to_string();
            let mut interval = tokio::time::interval(self.config.stalled_interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {
                        match self.queue.broker().recover_stalled(&name, self.config.max_stalled_count).await {
                            Ok(stalled) if !stalled.is_empty() => {
                                self.emit(WorkerEvent::Stalled {
                                    queue: name.clone(),
                                    recovered: stalled.recovered.len(),
                                    failed: stalled.failed.len(),
                                });
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Stalled job sweep on queue {} failed: {}", name, e),
                        }
                    }
                }
            }
        })
    }

    fn spawn_heartbeat(&self, job_id: JobId, token: String) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let interval = self.config.heartbeat_interval;
        let lock_duration = self.config.lock_duration;
        tokio::spawn(async move {
            let mut failures = FailureTracker::new(2);
            loop {
                tokio::time::sleep(interval).await;
                match queue
                    .broker()
                    .extend_lock(queue.name(), &job_id, &token, lock_duration)
                    .await
                {
                    Ok(true) => failures.record_success(),
                    Ok(false) => {
                        warn!("Lost lock on job {} in queue {}", job_id, queue.name());
                        break;
                    }
                    Err(e) => {
                        if failures.record_failure() {
                            warn!("Failed to extend lock on job {}: {}", job_id, e);
                        }
                    }
                }
            }
        })
    }

    /// Run one job and settle it with the broker.
    async fn process(self: Arc<Self>, record: JobRecord, token: String, _permit: OwnedSemaphorePermit) {
        let name = self.queue.name().to_string();
        let job_id = record.id.clone();
        let job_name = record.name.clone();
        let attempt = record.attempt();

        self.emit(WorkerEvent::Active {
            queue: name.clone(),
            job_id: job_id.clone(),
            name: job_name.clone(),
            attempt,
        });

        let heartbeat = self.spawn_heartbeat(job_id.clone(), token.clone());
        let job = ActiveJob::new(record.clone(), self.queue.clone(), token.clone())
            .with_events(self.events.clone());
        let started = Instant::now();
        let result = self
            .registry
            .execute_job(&job_name, job, self.data.clone())
            .await;
        heartbeat.abort();

        match result {
            Ok(value) => {
                let keep = record.opts.remove_on_complete.capped_by(self.config.keep_completed);
                let settled = self
                    .queue
                    .broker()
                    .complete(&name, &job_id, &token, &value, keep)
                    .await;
                match settled {
                    Ok(()) => self.emit(WorkerEvent::Completed {
                        queue: name,
                        job_id,
                        name: job_name,
                        duration: started.elapsed(),
                    }),
                    Err(e) => {
                        error!("Failed to mark job {} completed: {}", job_id, e);
                        self.emit(WorkerEvent::Error {
                            queue: name,
                            error: e.to_string(),
                            job_id: Some(job_id),
                        });
                    }
                }
            }
            Err(e) => {
                // Bad input or an unknown job fails the same way every time.
                let retry_delay = if e.is_caller_error() {
                    None
                } else {
                    record.opts.retry_delay(record.attempts_made + 1)
                };
                let failure = JobFailure::new(e.to_string()).with_stacktrace(error_chain(&e));

                let keep = record.opts.remove_on_fail.capped_by(self.config.keep_failed);
                let settled = self
                    .queue
                    .broker()
                    .fail(&name, &job_id, &token, &failure, retry_delay, keep)
                    .await;
                match settled {
                    Ok(outcome) => self.emit(WorkerEvent::Failed {
                        queue: name,
                        job_id,
                        name: job_name,
                        error: failure.reason,
                        stacktrace: failure.stacktrace,
                        data: record.data,
                        attempt,
                        will_retry: outcome == FailOutcome::Retrying,
                    }),
                    Err(settle_err) => {
                        error!("Failed to mark job {} failed: {}", job_id, settle_err);
                        self.emit(WorkerEvent::Error {
                            queue: name,
                            error: settle_err.to_string(),
                            job_id: Some(job_id),
                        });
                    }
                }
            }
        }
    }
}
