//! Redis key layout.
//!
//! Every queue lives under `{<prefix>}:<queue>`. The braces are a Redis
//! Cluster hash tag: all keys of one prefix share a slot, so scripts and
//! flows spanning several queues stay single-slot. Spread load across a
//! cluster with one prefix per group of queues.
//!
//! - `:id` / `:pc` counters for job IDs and FIFO order
//! - `:wait` (zset, priority then FIFO), `:delayed` (zset, ready time),
//!   `:waiting-children` (zset), `:active` (list)
//! - `:completed` / `:failed` (zset, finish time)
//! - `:schedulers` (hash, scheduler ID -> entry)
//! - `:<job id>` job hash, with `:lock`, `:dependencies` and `:processed`

#[derive(Debug, Clone)]
pub(crate) struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = if prefix.starts_with('{') && prefix.ends_with('}') {
            prefix
        } else {
            format!("{{{}}}", prefix)
        };
        Self { prefix }
    }

    pub fn base(&self, queue: &str) -> String {
        format!("{}:{}", self.prefix, queue)
    }

    pub fn job(&self, queue: &str, id: &str) -> String {
        format!("{}:{}:{}", self.prefix, queue, id)
    }

    pub fn lock(&self, queue: &str, id: &str) -> String {
        format!("{}:lock", self.job(queue, id))
    }

    pub fn set(&self, queue: &str, name: &str) -> String {
        format!("{}:{}", self.base(queue), name)
    }
}
