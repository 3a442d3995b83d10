//! Registry, trigger and flow tests against the in-memory broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use jobline_jobs::{
    FlowNode, JobConfig, JobDefinition, JobsError, QueueMode, Registry, ResolutionError,
    SchemaViolation,
};
use jobline_models::{JobOptions, JobState, KeepJobs};
use jobline_queue::{
    ActiveJob, Broker, BrokerConnector, MemoryBroker, MemoryConnector, QueueBinding, QueueHandle,
    QueueResult,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct Invite {
    #[validate(email)]
    email: String,
    #[validate(length(min = 1))]
    team_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct Page {
    #[validate(range(min = 1))]
    page: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct Report {
    #[validate(length(min = 1))]
    title: String,
}

/// Stand-in for the data-access context handlers receive.
struct Db {
    name: &'static str,
}

/// Connector that counts how many connections were opened.
struct CountingConnector {
    inner: MemoryConnector,
    connects: AtomicUsize,
}

impl CountingConnector {
    fn new(broker: Arc<MemoryBroker>) -> Self {
        Self {
            inner: MemoryConnector::new(broker),
            connects: AtomicUsize::new(0),
        }
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl BrokerConnector for CountingConnector {
    fn connect(&self, queue: Option<&str>) -> QueueResult<Arc<dyn Broker>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.inner.connect(queue)
    }
}

struct Setup {
    broker: Arc<MemoryBroker>,
    connector: Arc<CountingConnector>,
    registry: Registry<Db>,
}

fn setup() -> Setup {
    let broker = Arc::new(MemoryBroker::new());
    let connector = Arc::new(CountingConnector::new(broker.clone()));
    let registry = Registry::new(connector.clone());
    Setup {
        broker,
        connector,
        registry,
    }
}

fn send_invite(registry: &Registry<Db>, options: JobOptions) -> JobDefinition<Invite, Db> {
    registry
        .job(
            "send-invite",
            JobConfig::new("email").with_options(options),
            |_invite: Invite, ctx| async move {
                ctx.logger.log_progress(ctx.data.name);
                Ok::<_, anyhow::Error>(json!({ "emailSent": true }))
            },
        )
        .unwrap()
}

fn invite() -> Invite {
    Invite {
        email: "a@b.com".to_string(),
        team_id: "t1".to_string(),
    }
}

async fn only_job(broker: &MemoryBroker, queue: &str) -> jobline_models::JobRecord {
    let jobs = broker.jobs(queue).await;
    assert_eq!(jobs.len(), 1, "expected exactly one job on {}", queue);
    jobs.into_iter().next().unwrap()
}

#[tokio::test]
async fn test_invalid_payload_makes_no_broker_calls() {
    let s = setup();
    let job = send_invite(&s.registry, JobOptions::new());

    let bad = Invite {
        email: "not-an-email".to_string(),
        team_id: "t1".to_string(),
    };
    let err = job.trigger(&bad, JobOptions::new()).await.unwrap_err();

    match err {
        JobsError::Validation { job_id, violation } => {
            assert_eq!(job_id, "send-invite");
            assert!(matches!(violation, SchemaViolation::Rules(_)));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
    assert!(s.broker.calls().await.is_empty());
    assert_eq!(s.connector.connects(), 0);
}

#[tokio::test]
async fn test_untyped_payload_is_validated() {
    let s = setup();
    let job = send_invite(&s.registry, JobOptions::new());

    let err = job
        .trigger_json(json!({ "email": "a@b.com" }), JobOptions::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        JobsError::Validation {
            violation: SchemaViolation::Decode(_),
            ..
        }
    ));
    assert_eq!(s.broker.call_count("add").await, 0);
}

#[tokio::test]
async fn test_trigger_uses_hard_defaults() {
    let s = setup();
    let job = send_invite(&s.registry, JobOptions::new());

    let handle = job.trigger(&invite(), JobOptions::new()).await.unwrap();

    assert_eq!(handle.name, "send-invite");
    assert_eq!(handle.queue, "email");

    let record = only_job(&s.broker, "email").await;
    assert_eq!(record.id, handle.id);
    assert_eq!(record.data, json!({ "email": "a@b.com", "teamId": "t1" }));
    assert_eq!(record.opts.attempts, 3);
    assert_eq!(record.opts.priority, 1);
    assert_eq!(record.opts.remove_on_complete, KeepJobs::new(50, Duration::from_secs(24 * 3600)));
    assert_eq!(record.state, JobState::Waiting);
}

#[tokio::test]
async fn test_definition_options_apply_without_override() {
    let s = setup();
    let job = send_invite(&s.registry, JobOptions::new().attempts(5));

    job.trigger(&invite(), JobOptions::new()).await.unwrap();

    assert_eq!(only_job(&s.broker, "email").await.opts.attempts, 5);
}

#[tokio::test]
async fn test_call_site_options_win() {
    let s = setup();
    let job = send_invite(&s.registry, JobOptions::new().attempts(5));

    job.trigger(&invite(), JobOptions::new().attempts(1)).await.unwrap();

    assert_eq!(only_job(&s.broker, "email").await.opts.attempts, 1);
}

#[tokio::test]
async fn test_queue_defaults_sit_below_definition() {
    let s = setup();
    let queue = QueueBinding::new("reports").with_priority(7);
    let plain = s
        .registry
        .job("plain", JobConfig::new(queue.clone()), |_: Report, _ctx| async { Ok::<_, anyhow::Error>(()) })
        .unwrap();
    let urgent = s
        .registry
        .job(
            "urgent",
            JobConfig::new(queue).with_options(JobOptions::new().priority(2)),
            |_: Report, _ctx| async { Ok::<_, anyhow::Error>(()) },
        )
        .unwrap();

    let report = Report {
        title: "q3".to_string(),
    };
    let a = plain.trigger(&report, JobOptions::new()).await.unwrap();
    let b = urgent.trigger(&report, JobOptions::new()).await.unwrap();

    let queue = s.registry.resolve_queue("plain").unwrap();
    assert_eq!(queue.get_job(&a.id).await.unwrap().unwrap().opts.priority, 7);
    assert_eq!(queue.get_job(&b.id).await.unwrap().unwrap().opts.priority, 2);
}

#[tokio::test]
async fn test_duplicate_registration_is_rejected() {
    let s = setup();
    send_invite(&s.registry, JobOptions::new().attempts(5));

    let err = s
        .registry
        .job("send-invite", JobConfig::new("other"), |_: Invite, _ctx| async { Ok::<_, anyhow::Error>(()) })
        .unwrap_err();

    assert!(matches!(err, JobsError::DuplicateJob(ref id) if id == "send-invite"));
    assert_eq!(s.registry.queue_name("send-invite").as_deref(), Some("email"));
}

#[tokio::test]
async fn test_unregistered_job_has_no_queue() {
    let s = setup();

    let err = s.registry.resolve_queue("does-not-exist").unwrap_err();

    assert!(matches!(
        err,
        JobsError::Resolution(ResolutionError::NoQueue(ref id)) if id == "does-not-exist"
    ));
    assert!(err.to_string().contains("does-not-exist"));
}

#[tokio::test]
async fn test_external_queue_is_cached_until_closed() {
    let s = setup();
    let job = send_invite(&s.registry, JobOptions::new());
    assert_eq!(s.registry.queue_mode(), QueueMode::Uninitialized);

    job.trigger(&invite(), JobOptions::new()).await.unwrap();
    job.trigger(&invite(), JobOptions::new()).await.unwrap();

    assert_eq!(s.registry.queue_mode(), QueueMode::ExternalCacheInUse);
    assert_eq!(s.connector.connects(), 1);
    assert_eq!(s.broker.call_count("add").await, 2);

    s.registry.close_external_queues().await;
    assert_eq!(s.registry.queue_mode(), QueueMode::Uninitialized);
    assert_eq!(s.broker.call_count("close").await, 1);

    job.trigger(&invite(), JobOptions::new()).await.unwrap();
    assert_eq!(s.connector.connects(), 2);
}

#[tokio::test]
async fn test_resolver_is_preferred() {
    let s = setup();
    let job = send_invite(&s.registry, JobOptions::new());

    let worker_broker = Arc::new(MemoryBroker::new());
    let worker_queue = QueueHandle::new(QueueBinding::new("email"), worker_broker.clone());
    s.registry
        .set_queue_resolver(move |_job_id, queue| (queue == "email").then(|| worker_queue.clone()));

    job.trigger(&invite(), JobOptions::new()).await.unwrap();

    assert_eq!(s.registry.queue_mode(), QueueMode::ResolverInstalled);
    assert_eq!(worker_broker.call_count("add").await, 1);
    assert_eq!(s.broker.call_count("add").await, 0);
    assert_eq!(s.connector.connects(), 0);
}

#[tokio::test]
async fn test_resolver_miss_falls_back_to_external_queue() {
    let s = setup();
    let job = send_invite(&s.registry, JobOptions::new());
    s.registry.set_queue_resolver(|_, _| None);

    job.trigger(&invite(), JobOptions::new()).await.unwrap();

    assert_eq!(s.broker.call_count("add").await, 1);
    assert_eq!(s.connector.connects(), 1);
    assert_eq!(s.registry.queue_mode(), QueueMode::ResolverInstalled);
}

#[tokio::test]
async fn test_batch_trigger_is_all_or_nothing() {
    let s = setup();
    let job = send_invite(&s.registry, JobOptions::new());

    let bad = Invite {
        email: String::new(),
        team_id: "t2".to_string(),
    };
    let err = job
        .batch_trigger(vec![(invite(), JobOptions::new()), (bad, JobOptions::new())])
        .await
        .unwrap_err();
    assert!(matches!(err, JobsError::Validation { .. }));
    assert!(s.broker.calls().await.is_empty());

    let second = Invite {
        email: "c@d.com".to_string(),
        team_id: "t2".to_string(),
    };
    let handles = job
        .batch_trigger(vec![
            (invite(), JobOptions::new()),
            (second, JobOptions::new().priority(4)),
        ])
        .await
        .unwrap();

    assert_eq!(handles.len(), 2);
    assert_eq!(s.broker.call_count("add_bulk").await, 1);
    assert_eq!(s.broker.call_count("add").await, 0);

    let queue = s.registry.resolve_queue("send-invite").unwrap();
    let second = queue.get_job(&handles[1].id).await.unwrap().unwrap();
    assert_eq!(second.data["email"], "c@d.com");
    assert_eq!(second.opts.priority, 4);
}

#[tokio::test]
async fn test_trigger_delayed() {
    let s = setup();
    let job = send_invite(&s.registry, JobOptions::new());

    job.trigger_delayed(&invite(), Duration::from_secs(3600), JobOptions::new())
        .await
        .unwrap();

    let record = only_job(&s.broker, "email").await;
    assert_eq!(record.state, JobState::Delayed);
    assert_eq!(record.opts.delay_ms, 3_600_000);
}

#[tokio::test]
async fn test_trigger_recurring_upserts_one_scheduler() {
    let s = setup();
    let job = send_invite(&s.registry, JobOptions::new());

    let first = job
        .trigger_recurring(&invite(), "0 9 * * 1", JobOptions::new())
        .await
        .unwrap();
    let second = job
        .trigger_recurring(&invite(), "0 9 * * 1", JobOptions::new())
        .await
        .unwrap();

    let queue = s.registry.resolve_queue("send-invite").unwrap();
    let schedulers = queue.schedulers().await.unwrap();
    assert_eq!(schedulers.len(), 1);
    assert!(schedulers[0].id.starts_with("repeat:send-invite:"));
    assert_eq!(schedulers[0].next_job_id.as_deref(), Some(first.id.as_str()));
    assert_eq!(first.id, second.id);
    assert_eq!(queue.counts().await.unwrap().delayed, 1);
}

#[tokio::test]
async fn test_flow_children_keep_their_own_queue_and_data() {
    let s = setup();
    let report = s
        .registry
        .job("build-report", JobConfig::new("reports"), |_: Report, _ctx| async { Ok::<_, anyhow::Error>(()) })
        .unwrap();
    let fetch = s
        .registry
        .job(
            "fetch-page",
            JobConfig::new("fetchers").with_options(JobOptions::new().attempts(7)),
            |page: Page, _ctx| async move { Ok::<_, anyhow::Error>(page.page * 10) },
        )
        .unwrap();

    let handle = report
        .trigger_flow(
            &Report {
                title: "q3".to_string(),
            },
            JobOptions::new(),
            vec![
                fetch.flow_node(&Page { page: 1 }),
                fetch
                    .flow_node(&Page { page: 2 })
                    .options(JobOptions::new().priority(3)),
            ],
        )
        .await
        .unwrap();

    assert_eq!(handle.job.queue, "reports");
    assert_eq!(handle.children.len(), 2);

    let parent = s.broker.get_job("reports", &handle.job.id).await.unwrap().unwrap();
    assert_eq!(parent.data, json!({ "title": "q3" }));
    assert_eq!(parent.state, JobState::WaitingChildren);

    let first = s.broker.get_job("fetchers", &handle.children[0].job.id).await.unwrap().unwrap();
    assert_eq!(handle.children[0].job.queue, "fetchers");
    assert_eq!(first.data, json!({ "page": 1 }));
    assert_eq!(first.opts.attempts, 7);

    let second = s.broker.get_job("fetchers", &handle.children[1].job.id).await.unwrap().unwrap();
    assert_eq!(second.data, json!({ "page": 2 }));
    assert_eq!(second.opts.priority, 3);
    assert_eq!(second.opts.attempts, 7);
    assert_eq!(second.parent.map(|p| p.id), Some(handle.job.id));
}

#[tokio::test]
async fn test_invalid_flow_child_submits_nothing() {
    let s = setup();
    let report = s
        .registry
        .job("build-report", JobConfig::new("reports"), |_: Report, _ctx| async { Ok::<_, anyhow::Error>(()) })
        .unwrap();
    let fetch = s
        .registry
        .job("fetch-page", JobConfig::new("fetchers"), |_: Page, _ctx| async { Ok::<_, anyhow::Error>(()) })
        .unwrap();

    let err = report
        .trigger_flow(
            &Report {
                title: "q3".to_string(),
            },
            JobOptions::new(),
            vec![fetch.flow_node(&Page { page: 0 })],
        )
        .await
        .unwrap_err();

    assert!(matches!(err, JobsError::Validation { ref job_id, .. } if job_id == "fetch-page"));
    assert_eq!(s.broker.call_count("add_flow").await, 0);
}

#[tokio::test]
async fn test_execute_job_runs_handler() {
    let s = setup();
    let job = send_invite(&s.registry, JobOptions::new());
    job.trigger(&invite(), JobOptions::new()).await.unwrap();

    let queue = s.registry.resolve_queue("send-invite").unwrap();
    let record = s
        .broker
        .fetch_next("email", "token", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    let active = ActiveJob::new(record, queue, "token");

    let result = s
        .registry
        .execute_job("send-invite", active, Arc::new(Db { name: "test-db" }))
        .await
        .unwrap();

    assert_eq!(result, json!({ "emailSent": true }));
}

#[tokio::test]
async fn test_execute_job_reports_handler_failure() {
    let s = setup();
    s.registry
        .job("explode", JobConfig::new("misc"), |_: Report, _ctx| async {
            Err::<(), _>(anyhow!("smtp unavailable"))
        })
        .unwrap();
    let queue = s.registry.resolve_queue("explode").unwrap();
    queue
        .add(jobline_models::NewJob::new(
            "explode",
            json!({ "title": "x" }),
            JobOptions::new().resolve(),
        ))
        .await
        .unwrap();
    let record = s
        .broker
        .fetch_next("misc", "t", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let err = s
        .registry
        .execute_job("explode", ActiveJob::new(record, queue, "t"), Arc::new(Db { name: "db" }))
        .await
        .unwrap_err();

    match err {
        JobsError::Execution { job_id, source } => {
            assert_eq!(job_id, "explode");
            assert_eq!(source.to_string(), "smtp unavailable");
        }
        other => panic!("expected execution error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_execute_job_revalidates_payload() {
    let s = setup();
    send_invite(&s.registry, JobOptions::new());
    let queue = s.registry.resolve_queue("send-invite").unwrap();
    queue
        .add(jobline_models::NewJob::new(
            "send-invite",
            json!({ "email": "broken" }),
            JobOptions::new().resolve(),
        ))
        .await
        .unwrap();
    let record = s
        .broker
        .fetch_next("email", "t", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let err = s
        .registry
        .execute_job("send-invite", ActiveJob::new(record, queue, "t"), Arc::new(Db { name: "db" }))
        .await
        .unwrap_err();

    assert!(matches!(err, JobsError::Validation { .. }));
}

#[tokio::test]
async fn test_execute_unknown_job() {
    let s = setup();
    let queue = QueueHandle::new(QueueBinding::new("email"), s.broker.clone());
    queue
        .add(jobline_models::NewJob::new("ghost", json!({}), JobOptions::new().resolve()))
        .await
        .unwrap();
    let record = s
        .broker
        .fetch_next("email", "t", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let err = s
        .registry
        .execute_job("ghost", ActiveJob::new(record, queue, "t"), Arc::new(Db { name: "db" }))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        JobsError::Resolution(ResolutionError::UnknownJob(ref id)) if id == "ghost"
    ));
}
