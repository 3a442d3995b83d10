//! Scheduler declarations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use jobline_models::{JobOptions, RepeatOptions};

use crate::cron::DailySlot;

/// Broker key of the scheduler named `name`.
pub fn scheduler_key(name: &str) -> String {
    format!("scheduler:{}", name)
}

/// A fixed-cron recurring trigger declared at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticSchedulerConfig {
    /// Unique name; the broker key is `scheduler:<name>`
    pub name: String,
    pub queue: String,
    /// Five-field cron pattern
    pub pattern: String,
    /// Job enqueued on every fire
    pub job_name: String,
    pub payload: Value,
    /// IANA timezone the pattern is evaluated in
    pub tz: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Maximum number of iterations
    pub limit: Option<u64>,
    pub options: JobOptions,
}

impl StaticSchedulerConfig {
    pub fn new(
        name: impl Into<String>,
        queue: impl Into<String>,
        pattern: impl Into<String>,
        job_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            pattern: pattern.into(),
            job_name: job_name.into(),
            payload: json!({}),
            tz: "UTC".to_string(),
            start_date: None,
            end_date: None,
            limit: None,
            options: JobOptions::default(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_tz(mut self, tz: impl Into<String>) -> Self {
        self.tz = tz.into();
        self
    }

    pub fn with_start_date(mut self, start: DateTime<Utc>) -> Self {
        self.start_date = Some(start);
        self
    }

    pub fn with_end_date(mut self, end: DateTime<Utc>) -> Self {
        self.end_date = Some(end);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn key(&self) -> String {
        scheduler_key(&self.name)
    }

    pub fn repeat(&self) -> RepeatOptions {
        RepeatOptions {
            pattern: self.pattern.clone(),
            tz: self.tz.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
            limit: self.limit,
        }
    }
}

type AccountFn<T> = Arc<dyn Fn(&str) -> T + Send + Sync>;

/// A recurring trigger instantiated once per account.
///
/// By default each account fires daily at its [`DailySlot`], receives
/// `{"accountId": <id>}` and is keyed `<template>:<account>`.
#[derive(Clone)]
pub struct DynamicSchedulerTemplate {
    id: String,
    queue: String,
    job_name: String,
    tz: String,
    options: JobOptions,
    cron_for: AccountFn<String>,
    payload_for: AccountFn<Value>,
    job_key: AccountFn<String>,
}

impl DynamicSchedulerTemplate {
    pub fn new(id: impl Into<String>, queue: impl Into<String>, job_name: impl Into<String>) -> Self {
        let id = id.into();
        let key_prefix = id.clone();
        Self {
            id,
            queue: queue.into(),
            job_name: job_name.into(),
            tz: "UTC".to_string(),
            options: JobOptions::default(),
            cron_for: Arc::new(|account| DailySlot::for_id(account).to_cron()),
            payload_for: Arc::new(|account| json!({ "accountId": account })),
            job_key: Arc::new(move |account| format!("{}:{}", key_prefix, account)),
        }
    }

    pub fn with_cron<F>(mut self, cron_for: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.cron_for = Arc::new(cron_for);
        self
    }

    pub fn with_payload<F>(mut self, payload_for: F) -> Self
    where
        F: Fn(&str) -> Value + Send + Sync + 'static,
    {
        self.payload_for = Arc::new(payload_for);
        self
    }

    pub fn with_job_key<F>(mut self, job_key: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.job_key = Arc::new(job_key);
        self
    }

    pub fn with_tz(mut self, tz: impl Into<String>) -> Self {
        self.tz = tz.into();
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn tz(&self) -> &str {
        &self.tz
    }

    pub fn options(&self) -> &JobOptions {
        &self.options
    }

    pub fn cron_for(&self, account_id: &str) -> String {
        (self.cron_for)(account_id)
    }

    pub fn payload_for(&self, account_id: &str) -> Value {
        (self.payload_for)(account_id)
    }

    pub fn job_key(&self, account_id: &str) -> String {
        (self.job_key)(account_id)
    }
}

impl std::fmt::Debug for DynamicSchedulerTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicSchedulerTemplate")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("job_name", &self.job_name)
            .field("tz", &self.tz)
            .finish_non_exhaustive()
    }
}

/// Request to schedule one account under a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicSchedulerRequest {
    pub template: String,
    pub account_id: String,
    /// Overrides the template's cron for this account
    pub cron_pattern: Option<String>,
}

impl DynamicSchedulerRequest {
    pub fn new(template: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            account_id: account_id.into(),
            cron_pattern: None,
        }
    }

    pub fn with_cron(mut self, pattern: impl Into<String>) -> Self {
        self.cron_pattern = Some(pattern.into());
        self
    }
}
