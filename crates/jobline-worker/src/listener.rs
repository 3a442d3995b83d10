//! Event listener: turns worker events into log lines and metrics.

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use jobline_queue::WorkerEvent;

use crate::metrics;

pub fn log_event(event: &WorkerEvent) {
    metrics::record_event(event.queue(), event.kind());

    match event {
        WorkerEvent::Ready { queue } => info!("Consumer for queue {} is ready", queue),
        WorkerEvent::Active {
            queue,
            job_id,
            name,
            attempt,
        } => {
            metrics::record_job_started(queue);
            debug!(job_id = %job_id, job_name = %name, queue = %queue, attempt, "Job active");
        }
        WorkerEvent::Progress {
            queue,
            job_id,
            progress,
        } => debug!(job_id = %job_id, queue = %queue, "Job progress {}%", progress),
        WorkerEvent::Completed {
            queue,
            job_id,
            name,
            duration,
        } => {
            metrics::record_job_finished(queue);
            metrics::record_job_completed(queue, name, *duration);
            info!(
                job_id = %job_id,
                job_name = %name,
                queue = %queue,
                duration_ms = duration.as_millis() as u64,
                "Job completed"
            );
        }
        WorkerEvent::Failed {
            queue,
            job_id,
            name,
            error,
            stacktrace,
            data,
            attempt,
            will_retry,
        } => {
            metrics::record_job_finished(queue);
            metrics::record_job_failed(queue, name, *will_retry);
            if *will_retry {
                warn!(
                    job_id = %job_id,
                    job_name = %name,
                    queue = %queue,
                    attempt,
                    "Job attempt failed, will retry: {}", error
                );
            } else {
                error!(
                    job_id = %job_id,
                    job_name = %name,
                    queue = %queue,
                    attempt,
                    payload = %data,
                    stack = ?stacktrace,
                    "Job failed: {}", error
                );
            }
        }
        WorkerEvent::Error { queue, error, job_id } => {
            metrics::record_consumer_error(queue);
            match job_id {
                Some(job_id) => {
                    metrics::record_job_finished(queue);
                    error!(job_id = %job_id, "Consumer error on queue {}: {}", queue, error);
                }
                None => error!("Consumer error on queue {}: {}", queue, error),
            }
        }
        WorkerEvent::Stalled {
            queue,
            recovered,
            failed,
        } => {
            metrics::record_stalled(queue, *recovered, *failed);
            warn!(
                "Stalled jobs on queue {}: {} returned to waiting, {} failed",
                queue, recovered, failed
            );
        }
        WorkerEvent::Closing { queue } => info!("Consumer for queue {} is closing", queue),
        WorkerEvent::Closed { queue } => info!("Consumer for queue {} closed", queue),
    }
}

/// Log every event until all senders are dropped.
pub fn spawn_listener(mut events: broadcast::Receiver<WorkerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event listener lagged, {} events dropped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
