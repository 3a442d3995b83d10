//! Scheduler registry tests against the in-memory broker.

use std::sync::Arc;

use jobline_jobs::{JobConfig, JobsError, Registry, ResolutionError};
use jobline_models::JobOptions;
use jobline_queue::{MemoryBroker, MemoryConnector, QueueError};
use jobline_scheduler::{
    DailySlot, DynamicSchedulerRequest, DynamicSchedulerTemplate, SchedulerError,
    SchedulerRegistration, SchedulerRegistry, StaticSchedulerConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_test::assert_ok;
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
struct SyncAccount {
    #[validate(length(min = 1))]
    account_id: String,
}

fn registry(broker: &Arc<MemoryBroker>) -> Registry<()> {
    let registry = Registry::new(Arc::new(MemoryConnector::new(broker.clone())));
    registry
        .job(
            "sync-bank",
            JobConfig::new("sync").with_options(JobOptions::new().attempts(4)),
            |_: SyncAccount, _ctx| async { Ok::<_, anyhow::Error>(()) },
        )
        .unwrap();
    registry
}

fn escalate() -> StaticSchedulerConfig {
    StaticSchedulerConfig::new("collections-escalate", "collections", "0 2 * * *", "escalate")
        .with_payload(json!({ "dryRun": false }))
}

fn bank_sync() -> DynamicSchedulerTemplate {
    DynamicSchedulerTemplate::new("bank-sync", "sync", "sync-bank")
}

#[tokio::test]
async fn test_static_registration_survives_restart() {
    let broker = Arc::new(MemoryBroker::new());

    for _ in 0..2 {
        let schedulers = SchedulerRegistry::new(registry(&broker)).with_static(escalate());
        assert_eq!(schedulers.register_static_schedulers().await.unwrap(), 1);
    }

    let jobs = broker.jobs("collections").await;
    let entries = {
        let registry = registry(&broker);
        let queue = registry.queue("escalate", "collections").unwrap();
        queue.schedulers().await.unwrap()
    };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, "scheduler:collections-escalate");
    assert_eq!(entries[0].spec.job_name, "escalate");
    assert_eq!(entries[0].spec.data, json!({ "dryRun": false }));
    assert_eq!(entries[0].spec.repeat.tz, "UTC");
    assert_eq!(jobs.len(), 1, "one pending iteration");
    assert_eq!(jobs[0].scheduler_id.as_deref(), Some("scheduler:collections-escalate"));
}

#[tokio::test]
async fn test_static_failure_aborts_registration() {
    let broker = Arc::new(MemoryBroker::new());
    let schedulers = SchedulerRegistry::new(registry(&broker))
        .with_static(StaticSchedulerConfig::new("broken", "collections", "every day", "escalate"));

    let err = schedulers.register_static_schedulers().await.unwrap_err();

    match err {
        SchedulerError::Registration { name, source } => {
            assert_eq!(name, "scheduler:broken");
            assert!(matches!(source, JobsError::Queue(QueueError::InvalidSchedule(_))));
        }
        other => panic!("expected registration error, got {:?}", other),
    }
    assert!(schedulers.registered_static_schedulers().await.is_empty());
}

#[tokio::test]
async fn test_dynamic_registration_uses_template() {
    let broker = Arc::new(MemoryBroker::new());
    let schedulers = SchedulerRegistry::new(registry(&broker)).with_template(bank_sync());

    let registration = schedulers
        .register_dynamic_scheduler(DynamicSchedulerRequest::new("bank-sync", "acct_1"))
        .await
        .unwrap();

    let SchedulerRegistration::Registered(entry) = registration else {
        panic!("expected a new registration");
    };
    assert_eq!(entry.id, "scheduler:bank-sync:acct_1");
    assert_eq!(entry.spec.repeat.pattern, DailySlot::for_id("acct_1").to_cron());
    assert_eq!(entry.spec.data, json!({ "accountId": "acct_1" }));
    assert_eq!(entry.spec.opts.attempts, 4);
    assert!(entry.next_job_id.is_some());
}

#[tokio::test]
async fn test_dynamic_request_cron_wins() {
    let broker = Arc::new(MemoryBroker::new());
    let schedulers = SchedulerRegistry::new(registry(&broker)).with_template(bank_sync());

    let registration = schedulers
        .register_dynamic_scheduler(DynamicSchedulerRequest::new("bank-sync", "acct_1").with_cron("30 5 * * *"))
        .await
        .unwrap();

    match registration {
        SchedulerRegistration::Registered(entry) => assert_eq!(entry.spec.repeat.pattern, "30 5 * * *"),
        other => panic!("expected a new registration, got {:?}", other),
    }
}

#[tokio::test]
async fn test_duplicate_dynamic_registration_is_noop() {
    let broker = Arc::new(MemoryBroker::new());
    let schedulers = SchedulerRegistry::new(registry(&broker)).with_template(bank_sync());
    let request = DynamicSchedulerRequest::new("bank-sync", "acct_1");

    let first = schedulers.register_dynamic_scheduler(request.clone()).await.unwrap();
    let second = schedulers.register_dynamic_scheduler(request).await.unwrap();

    assert!(matches!(first, SchedulerRegistration::Registered(_)));
    assert_eq!(second, SchedulerRegistration::AlreadyRegistered);
    assert_eq!(broker.call_count("upsert_scheduler").await, 1);
    assert_eq!(schedulers.registered_dynamic_schedulers().await, vec!["bank-sync:acct_1"]);
}

#[tokio::test]
async fn test_unknown_template() {
    let broker = Arc::new(MemoryBroker::new());
    let schedulers = SchedulerRegistry::new(registry(&broker));

    let err = schedulers
        .register_dynamic_scheduler(DynamicSchedulerRequest::new("xero-sync", "acct_1"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SchedulerError::Resolution(ResolutionError::UnknownTemplate(ref id)) if id == "xero-sync"
    ));
    assert!(broker.calls().await.is_empty());
}

#[tokio::test]
async fn test_unregister_dynamic_scheduler() {
    let broker = Arc::new(MemoryBroker::new());
    let schedulers = SchedulerRegistry::new(registry(&broker)).with_template(bank_sync());
    schedulers
        .register_dynamic_scheduler(DynamicSchedulerRequest::new("bank-sync", "acct_1"))
        .await
        .unwrap();

    assert!(schedulers.unregister_dynamic_scheduler("bank-sync", "acct_1").await.unwrap());
    assert!(!schedulers.unregister_dynamic_scheduler("bank-sync", "acct_1").await.unwrap());

    assert!(schedulers.registered_dynamic_schedulers().await.is_empty());
    assert!(broker.jobs("sync").await.is_empty());
    assert_eq!(broker.call_count("remove_scheduler").await, 1);
}

#[tokio::test]
async fn test_unregister_untracked_is_noop() {
    let broker = Arc::new(MemoryBroker::new());
    let schedulers = SchedulerRegistry::new(registry(&broker)).with_template(bank_sync());

    assert!(!schedulers.unregister_dynamic_scheduler("bank-sync", "acct_9").await.unwrap());
    assert!(broker.calls().await.is_empty());
}

#[tokio::test]
async fn test_registered_keys_are_sorted() {
    let broker = Arc::new(MemoryBroker::new());
    let schedulers = SchedulerRegistry::new(registry(&broker))
        .with_static(escalate())
        .with_static(StaticSchedulerConfig::new("a-digest", "reports", "0 8 * * 1", "digest"))
        .with_template(bank_sync());

    assert_ok!(schedulers.register_static_schedulers().await);
    for account in ["acct_3", "acct_1", "acct_2"] {
        schedulers
            .register_dynamic_scheduler(DynamicSchedulerRequest::new("bank-sync", account))
            .await
            .unwrap();
    }

    assert_eq!(
        schedulers.registered_static_schedulers().await,
        vec!["a-digest", "collections-escalate"]
    );
    assert_eq!(
        schedulers.registered_dynamic_schedulers().await,
        vec!["bank-sync:acct_1", "bank-sync:acct_2", "bank-sync:acct_3"]
    );
}
