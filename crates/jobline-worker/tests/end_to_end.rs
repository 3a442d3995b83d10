//! Worker runtime tests: producers trigger through the registry and a
//! runtime on the same in-memory broker executes the jobs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use jobline_jobs::{JobConfig, JobContext, QueueMode, Registry};
use jobline_models::{Backoff, JobOptions, JobState, KeepJobs, NewJob};
use jobline_queue::{Broker, MemoryBroker, MemoryConnector, WorkerEvent};
use jobline_scheduler::{SchedulerRegistry, StaticSchedulerConfig};
use jobline_worker::{HealthCheck, WorkerConfig, WorkerError, WorkerResult, WorkerRuntime};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_test::assert_ok;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct Invite {
    #[validate(email)]
    email: String,
    #[validate(length(min = 1))]
    team_id: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
struct Page {
    page: u64,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
struct Report {
    #[validate(length(min = 1))]
    title: String,
}

#[derive(Default)]
struct Db {
    sent: Mutex<Vec<String>>,
}

impl HealthCheck for Db {}

struct Unreachable;

#[async_trait]
impl HealthCheck for Unreachable {
    async fn health_check(&self) -> anyhow::Result<()> {
        Err(anyhow!("database refused connection"))
    }
}

fn test_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(10),
        error_backoff: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(2),
        startup_retries: 0,
        ..WorkerConfig::default()
    }
}

fn registry<D: Send + Sync + 'static>(broker: &Arc<MemoryBroker>) -> Registry<D> {
    Registry::new(Arc::new(MemoryConnector::new(broker.clone())))
}

struct Running {
    stop: oneshot::Sender<()>,
    task: JoinHandle<WorkerResult<()>>,
}

impl Running {
    async fn stop(self) -> WorkerResult<()> {
        let _ = self.stop.send(());
        self.task.await.unwrap()
    }
}

fn start<D: HealthCheck + Send + Sync + 'static>(runtime: WorkerRuntime<D>) -> Running {
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(runtime.run(async move {
        let _ = stopped.await;
    }));
    Running { stop, task }
}

async fn wait_for<F>(events: &mut broadcast::Receiver<WorkerEvent>, mut matches: F) -> WorkerEvent
where
    F: FnMut(&WorkerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => {}
                Err(e) => panic!("event channel failed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for worker event")
}

async fn wait_ready(events: &mut broadcast::Receiver<WorkerEvent>, queue: &str) {
    wait_for(events, |e| matches!(e, WorkerEvent::Ready { queue: q } if q == queue)).await;
}

#[tokio::test]
async fn test_send_invite_end_to_end() {
    let broker = Arc::new(MemoryBroker::new());
    let registry = registry::<Db>(&broker);
    let send_invite = registry
        .job(
            "send-invite",
            JobConfig::new("email"),
            |invite: Invite, mut ctx: JobContext<Db>| async move {
                ctx.job.update_progress(50).await?;
                ctx.data.sent.lock().unwrap().push(invite.email.clone());
                Ok::<_, anyhow::Error>(json!({ "emailSent": true }))
            },
        )
        .unwrap();

    let db = Arc::new(Db::default());
    let runtime = WorkerRuntime::new(test_config(), registry.clone(), broker.clone(), db.clone());
    let mut events = runtime.subscribe();
    let running = start(runtime);
    wait_ready(&mut events, "email").await;
    assert_eq!(registry.queue_mode(), QueueMode::ResolverInstalled);

    let handle = send_invite
        .trigger(
            &Invite {
                email: "a@b.com".to_string(),
                team_id: "t1".to_string(),
            },
            JobOptions::new(),
        )
        .await
        .unwrap();

    wait_for(&mut events, |e| matches!(e, WorkerEvent::Progress { progress: 50, .. })).await;
    let completed = wait_for(&mut events, |e| matches!(e, WorkerEvent::Completed { .. })).await;
    match completed {
        WorkerEvent::Completed { job_id, name, .. } => {
            assert_eq!(job_id, handle.id);
            assert_eq!(name, "send-invite");
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(*db.sent.lock().unwrap(), vec!["a@b.com".to_string()]);
    let record = broker.jobs("email").await.into_iter().next().unwrap();
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.return_value, Some(json!({ "emailSent": true })));
    assert_eq!(record.progress, 50);

    assert_ok!(running.stop().await);
    assert!(broker.call_count("close").await >= 1);
}

#[tokio::test]
async fn test_three_attempts_then_failed() {
    let broker = Arc::new(MemoryBroker::new());
    let registry = registry::<()>(&broker);
    let executions = Arc::new(AtomicU32::new(0));
    let counter = executions.clone();
    let job = registry
        .job(
            "send-invite",
            JobConfig::new("email"),
            move |_: Invite, _ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow!("smtp unavailable"))
                }
            },
        )
        .unwrap();

    let runtime = WorkerRuntime::new(test_config(), registry.clone(), broker.clone(), Arc::new(()));
    let mut events = runtime.subscribe();
    let running = start(runtime);
    wait_ready(&mut events, "email").await;

    job.trigger(
        &Invite {
            email: "a@b.com".to_string(),
            team_id: "t1".to_string(),
        },
        JobOptions::new().backoff(Backoff::fixed(0)),
    )
    .await
    .unwrap();

    let mut retries = 0;
    loop {
        match wait_for(&mut events, |e| matches!(e, WorkerEvent::Failed { .. })).await {
            WorkerEvent::Failed {
                will_retry: true, ..
            } => retries += 1,
            WorkerEvent::Failed {
                will_retry: false,
                attempt,
                error,
                data,
                ..
            } => {
                assert_eq!(attempt, 3);
                assert!(error.contains("smtp unavailable"));
                assert_eq!(data["email"], "a@b.com");
                break;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    assert_eq!(retries, 2);
    assert_eq!(executions.load(Ordering::SeqCst), 3);
    let record = broker.jobs("email").await.into_iter().next().unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.attempts_made, 3);
    assert!(!record.stacktrace.is_empty());

    assert_ok!(running.stop().await);
}

fn invite(n: u32) -> Invite {
    Invite {
        email: format!("user{}@b.com", n),
        team_id: "t1".to_string(),
    }
}

#[tokio::test]
async fn test_job_retention_tighter_than_worker_wins() {
    let broker = Arc::new(MemoryBroker::new());
    let registry = registry::<()>(&broker);
    let job = registry
        .job("send-invite", JobConfig::new("email"), |_: Invite, _ctx| async {
            Ok::<_, anyhow::Error>(())
        })
        .unwrap();

    let runtime = WorkerRuntime::new(test_config(), registry.clone(), broker.clone(), Arc::new(()));
    let mut events = runtime.subscribe();
    let running = start(runtime);
    wait_ready(&mut events, "email").await;

    for n in 0..3 {
        job.trigger(&invite(n), JobOptions::new().remove_on_complete(KeepJobs::count(1)))
            .await
            .unwrap();
        wait_for(&mut events, |e| matches!(e, WorkerEvent::Completed { .. })).await;
    }

    assert_eq!(broker.counts("email").await.unwrap().completed, 1);
    assert_eq!(broker.jobs("email").await.len(), 1);

    assert_ok!(running.stop().await);
}

#[tokio::test]
async fn test_queue_concurrency_override_bounds_in_flight_jobs() {
    let broker = Arc::new(MemoryBroker::new());
    let registry = registry::<()>(&broker);
    let gate = Arc::new(Semaphore::new(0));
    let in_flight = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let (handler_gate, handler_in_flight, handler_peak) = (gate.clone(), in_flight.clone(), peak.clone());
    let job = registry
        .job("send-invite", JobConfig::new("email"), move |_: Invite, _ctx| {
            let gate = handler_gate.clone();
            let in_flight = handler_in_flight.clone();
            let peak = handler_peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                gate.acquire().await?.forget();
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        })
        .unwrap();

    let config = WorkerConfig {
        queue_concurrency: HashMap::from([("email".to_string(), 2)]),
        ..test_config()
    };
    let runtime = WorkerRuntime::new(config, registry.clone(), broker.clone(), Arc::new(()));
    let mut events = runtime.subscribe();
    let running = start(runtime);
    wait_ready(&mut events, "email").await;

    for n in 0..3 {
        job.trigger(&invite(n), JobOptions::new()).await.unwrap();
    }
    for _ in 0..2 {
        wait_for(&mut events, |e| matches!(e, WorkerEvent::Active { .. })).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(in_flight.load(Ordering::SeqCst), 2);
    assert_eq!(broker.counts("email").await.unwrap().waiting, 1);

    gate.add_permits(3);
    for _ in 0..3 {
        wait_for(&mut events, |e| matches!(e, WorkerEvent::Completed { .. })).await;
    }
    assert_eq!(peak.load(Ordering::SeqCst), 2);

    assert_ok!(running.stop().await);
}

#[tokio::test]
async fn test_lost_lock_reports_job_error() {
    let broker = Arc::new(MemoryBroker::new());
    let registry = registry::<()>(&broker);
    let gate = Arc::new(Semaphore::new(0));
    let handler_gate = gate.clone();
    let job = registry
        .job("send-invite", JobConfig::new("email"), move |_: Invite, _ctx| {
            let gate = handler_gate.clone();
            async move {
                gate.acquire().await?.forget();
                Ok::<_, anyhow::Error>(())
            }
        })
        .unwrap();

    let runtime = WorkerRuntime::new(test_config(), registry.clone(), broker.clone(), Arc::new(()));
    let mut events = runtime.subscribe();
    let running = start(runtime);
    wait_ready(&mut events, "email").await;

    let handle = job.trigger(&invite(1), JobOptions::new()).await.unwrap();
    wait_for(&mut events, |e| matches!(e, WorkerEvent::Active { .. })).await;
    broker.advance(Duration::from_secs(60));
    gate.add_permits(1);

    let error = wait_for(&mut events, |e| matches!(e, WorkerEvent::Error { .. })).await;
    match error {
        WorkerEvent::Error { job_id, .. } => assert_eq!(job_id, Some(handle.id)),
        other => panic!("unexpected event {:?}", other),
    }

    assert_ok!(running.stop().await);
}

#[tokio::test]
async fn test_invalid_payload_is_not_retried() {
    let broker = Arc::new(MemoryBroker::new());
    let registry = registry::<()>(&broker);
    registry
        .job("send-invite", JobConfig::new("email"), |_: Invite, _ctx| async {
            Ok::<_, anyhow::Error>(())
        })
        .unwrap();

    let runtime = WorkerRuntime::new(test_config(), registry.clone(), broker.clone(), Arc::new(()));
    let mut events = runtime.subscribe();
    let running = start(runtime);
    wait_ready(&mut events, "email").await;

    // Written by an older producer that did not send team_id.
    broker
        .add(
            "email",
            NewJob::new("send-invite", json!({ "email": "a@b.com" }), JobOptions::new().resolve()),
        )
        .await
        .unwrap();

    let failed = wait_for(&mut events, |e| matches!(e, WorkerEvent::Failed { .. })).await;
    assert!(matches!(
        failed,
        WorkerEvent::Failed {
            will_retry: false,
            attempt: 1,
            ..
        }
    ));

    assert_ok!(running.stop().await);
}

#[tokio::test]
async fn test_flow_parent_sees_children_values() {
    let broker = Arc::new(MemoryBroker::new());
    let registry = registry::<()>(&broker);
    let report = registry
        .job(
            "build-report",
            JobConfig::new("reports"),
            |_: Report, ctx: JobContext<()>| async move {
                let counts = ctx.job.dependencies_count().await?;
                anyhow::ensure!(counts.unprocessed == 0, "{} children pending", counts.unprocessed);
                let values = ctx.job.children_values().await?;
                anyhow::ensure!(counts.processed == values.len() as u64);
                let total: u64 = values.values().filter_map(|v| v.as_u64()).sum();
                Ok::<_, anyhow::Error>(total)
            },
        )
        .unwrap();
    let fetch = registry
        .job("fetch-page", JobConfig::new("fetchers"), |page: Page, _ctx| async move {
            Ok::<_, anyhow::Error>(page.page * 10)
        })
        .unwrap();

    let runtime = WorkerRuntime::new(test_config(), registry.clone(), broker.clone(), Arc::new(()));
    let mut events = runtime.subscribe();
    let running = start(runtime);
    wait_ready(&mut events, "reports").await;

    let flow = report
        .trigger_flow(
            &Report {
                title: "q3".to_string(),
            },
            JobOptions::new(),
            vec![fetch.flow_node(&Page { page: 1 }), fetch.flow_node(&Page { page: 2 })],
        )
        .await
        .unwrap();

    wait_for(&mut events, |e| {
        matches!(e, WorkerEvent::Completed { job_id, .. } if *job_id == flow.job.id)
    })
    .await;

    let parent = broker
        .jobs("reports")
        .await
        .into_iter()
        .find(|j| j.id == flow.job.id)
        .unwrap();
    assert_eq!(parent.return_value, Some(json!(30)));

    assert_ok!(running.stop().await);
}

#[tokio::test]
async fn test_startup_hook_registers_schedulers() {
    let broker = Arc::new(MemoryBroker::new());
    let registry = registry::<()>(&broker);
    registry
        .job("escalate", JobConfig::new("collections"), |_: Report, _ctx| async {
            Ok::<_, anyhow::Error>(())
        })
        .unwrap();
    let schedulers = Arc::new(SchedulerRegistry::new(registry.clone()).with_static(
        StaticSchedulerConfig::new("collections-escalate", "collections", "0 2 * * *", "escalate")
            .with_payload(json!({ "title": "nightly" })),
    ));

    let hook_schedulers = schedulers.clone();
    let runtime = WorkerRuntime::new(test_config(), registry.clone(), broker.clone(), Arc::new(()))
        .with_startup_hook(move || async move {
            hook_schedulers.register_static_schedulers().await?;
            Ok::<_, anyhow::Error>(())
        });
    let mut events = runtime.subscribe();
    let running = start(runtime);
    wait_ready(&mut events, "collections").await;

    assert_eq!(
        schedulers.registered_static_schedulers().await,
        vec!["collections-escalate"]
    );
    let entries = broker.schedulers("collections").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, "scheduler:collections-escalate");

    assert_ok!(running.stop().await);
}

#[tokio::test]
async fn test_failing_startup_hook_aborts() {
    let broker = Arc::new(MemoryBroker::new());
    let registry = registry::<()>(&broker);
    registry
        .job("escalate", JobConfig::new("collections"), |_: Report, _ctx| async {
            Ok::<_, anyhow::Error>(())
        })
        .unwrap();

    let runtime = WorkerRuntime::new(test_config(), registry, broker.clone(), Arc::new(()))
        .with_startup_hook(|| async { Err::<(), _>(anyhow!("scheduler 'nightly' rejected")) });

    let result = runtime.run(std::future::pending()).await;

    assert!(matches!(result, Err(WorkerError::Startup(_))));
    assert_eq!(broker.call_count("fetch_next").await, 0);
}

#[tokio::test]
async fn test_unhealthy_data_context_aborts() {
    let broker = Arc::new(MemoryBroker::new());
    let registry = registry::<Unreachable>(&broker);

    let runtime = WorkerRuntime::new(test_config(), registry, broker.clone(), Arc::new(Unreachable));
    let result = runtime.run(std::future::pending()).await;

    match result {
        Err(WorkerError::HealthCheck(message)) => assert!(message.contains("database refused")),
        other => panic!("expected health check failure, got {:?}", other),
    }
    assert_eq!(broker.call_count("ping").await, 1);
}
