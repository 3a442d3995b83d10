//! Execution policy for jobs.
//!
//! [`JobOptions`] is the sparse, layerable form used at declaration and call
//! sites. [`ResolvedJobOptions`] is the concrete policy handed to the broker
//! once every layer has been merged over the hard defaults.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default priority (lower runs first).
pub const DEFAULT_PRIORITY: u32 = 1;
/// Highest accepted priority. Larger values are clamped so the Redis wait
/// score (`priority * 2^32 + seq`) stays exact in a Lua double.
pub const MAX_PRIORITY: u32 = (1 << 21) - 1;
/// Default total number of execution attempts.
pub const DEFAULT_ATTEMPTS: u32 = 3;
/// Default base delay for exponential backoff.
pub const DEFAULT_BACKOFF_MS: u64 = 2_000;
/// Default number of completed jobs kept per queue.
pub const DEFAULT_KEEP_COMPLETED_COUNT: u64 = 50;
/// Default max age of completed jobs (24 hours).
pub const DEFAULT_KEEP_COMPLETED_AGE_SECS: u64 = 24 * 60 * 60;
/// Default number of failed jobs kept per queue.
pub const DEFAULT_KEEP_FAILED_COUNT: u64 = 50;
/// Default max age of failed jobs (7 days).
pub const DEFAULT_KEEP_FAILED_AGE_SECS: u64 = 7 * 24 * 60 * 60;

/// Delay strategy between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry
    Fixed { delay_ms: u64 },
    /// `delay * 2^(attempts_made - 1)`
    Exponential { delay_ms: u64 },
}

impl Backoff {
    pub fn exponential(delay_ms: u64) -> Self {
        Self::Exponential { delay_ms }
    }

    pub fn fixed(delay_ms: u64) -> Self {
        Self::Fixed { delay_ms }
    }

    /// Delay before the next attempt, given how many attempts already failed.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { delay_ms } => {
                let exp = attempts_made.saturating_sub(1).min(31);
                Duration::from_millis(delay_ms.saturating_mul(1u64 << exp))
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            delay_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

/// Retention bounds for finished jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KeepJobs {
    /// Keep at most this many jobs (newest first)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    /// Drop jobs older than this many seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_secs: Option<u64>,
}

impl KeepJobs {
    pub fn new(count: u64, age: Duration) -> Self {
        Self {
            count: Some(count),
            age_secs: Some(age.as_secs()),
        }
    }

    /// Keep only the newest `count` jobs, regardless of age.
    pub fn count(count: u64) -> Self {
        Self {
            count: Some(count),
            age_secs: None,
        }
    }

    pub fn age(&self) -> Option<Duration> {
        self.age_secs.map(Duration::from_secs)
    }

    /// The stricter of `self` and `cap`, field by field. An unset field
    /// means unbounded.
    pub fn capped_by(self, cap: KeepJobs) -> KeepJobs {
        fn min(a: Option<u64>, b: Option<u64>) -> Option<u64> {
            match (a, b) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            }
        }
        KeepJobs {
            count: min(self.count, cap.count),
            age_secs: min(self.age_secs, cap.age_secs),
        }
    }
}

/// Repeat specification attached to a job or scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatOptions {
    /// Five-field cron pattern (`minute hour day month weekday`)
    pub pattern: String,
    /// IANA timezone name
    #[serde(default = "default_tz")]
    pub tz: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    /// Maximum number of iterations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

fn default_tz() -> String {
    "UTC".to_string()
}

impl RepeatOptions {
    pub fn cron(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            tz: default_tz(),
            start_date: None,
            end_date: None,
            limit: None,
        }
    }

    pub fn with_tz(mut self, tz: impl Into<String>) -> Self {
        self.tz = tz.into();
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
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
}

/// Sparse job options. Every field is optional so several layers can be
/// merged: call site over definition over queue defaults over hard defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    /// Total execution attempts, including the first one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    /// Delay before the job becomes eligible, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<KeepJobs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<KeepJobs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatOptions>,
    /// Caller-chosen job ID; enqueueing an existing ID is a no-op
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn remove_on_complete(mut self, keep: KeepJobs) -> Self {
        self.remove_on_complete = Some(keep);
        self
    }

    pub fn remove_on_fail(mut self, keep: KeepJobs) -> Self {
        self.remove_on_fail = Some(keep);
        self
    }

    pub fn repeat(mut self, repeat: RepeatOptions) -> Self {
        self.repeat = Some(repeat);
        self
    }

    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Layer `self` over `fallback`: fields set on `self` win.
    pub fn over(&self, fallback: &JobOptions) -> JobOptions {
        JobOptions {
            priority: self.priority.or(fallback.priority),
            attempts: self.attempts.or(fallback.attempts),
            delay_ms: self.delay_ms.or(fallback.delay_ms),
            backoff: self.backoff.or(fallback.backoff),
            remove_on_complete: self.remove_on_complete.or(fallback.remove_on_complete),
            remove_on_fail: self.remove_on_fail.or(fallback.remove_on_fail),
            repeat: self.repeat.clone().or_else(|| fallback.repeat.clone()),
            job_id: self.job_id.clone().or_else(|| fallback.job_id.clone()),
        }
    }

    /// Fill every unset field with the hard defaults.
    pub fn resolve(&self) -> ResolvedJobOptions {
        ResolvedJobOptions {
            priority: self.priority.unwrap_or(DEFAULT_PRIORITY).min(MAX_PRIORITY),
            attempts: self.attempts.unwrap_or(DEFAULT_ATTEMPTS).max(1),
            delay_ms: self.delay_ms.unwrap_or(0),
            backoff: self.backoff.unwrap_or_default(),
            remove_on_complete: self.remove_on_complete.unwrap_or(KeepJobs {
                count: Some(DEFAULT_KEEP_COMPLETED_COUNT),
                age_secs: Some(DEFAULT_KEEP_COMPLETED_AGE_SECS),
            }),
            remove_on_fail: self.remove_on_fail.unwrap_or(KeepJobs {
                count: Some(DEFAULT_KEEP_FAILED_COUNT),
                age_secs: Some(DEFAULT_KEEP_FAILED_AGE_SECS),
            }),
            repeat: self.repeat.clone(),
            job_id: self.job_id.clone(),
        }
    }
}

/// Concrete execution policy stored with every job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedJobOptions {
    pub priority: u32,
    pub attempts: u32,
    pub delay_ms: u64,
    pub backoff: Backoff,
    pub remove_on_complete: KeepJobs,
    pub remove_on_fail: KeepJobs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl Default for ResolvedJobOptions {
    fn default() -> Self {
        JobOptions::default().resolve()
    }
}

impl ResolvedJobOptions {
    /// Delay before retrying, or `None` once `attempts` executions are used up.
    pub fn retry_delay(&self, attempts_made: u32) -> Option<Duration> {
        if attempts_made < self.attempts {
            Some(self.backoff.delay_for(attempts_made))
        } else {
            None
        }
    }
}
