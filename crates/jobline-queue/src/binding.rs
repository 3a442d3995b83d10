//! Queue bindings.

use jobline_models::{JobOptions, KeepJobs};

/// Default number of jobs a worker runs concurrently per queue.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Typed description of one durable queue.
///
/// A binding carries no connection. Job definitions refer to it by name
/// and many definitions may share one binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    name: String,
    concurrency: usize,
    defaults: JobOptions,
}

impl QueueBinding {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: DEFAULT_CONCURRENCY,
            defaults: JobOptions::default(),
        }
    }

    /// Set the default worker concurrency for this queue.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the default priority of jobs on this queue.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.defaults.priority = Some(priority);
        self
    }

    /// Set the default retention for finished jobs on this queue.
    pub fn with_retention(mut self, on_complete: KeepJobs, on_fail: KeepJobs) -> Self {
        self.defaults.remove_on_complete = Some(on_complete);
        self.defaults.remove_on_fail = Some(on_fail);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Queue-level option layer, applied below job definition options.
    pub fn defaults(&self) -> &JobOptions {
        &self.defaults
    }
}

impl From<&str> for QueueBinding {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}
