//! Conversion between Redis job hashes and [`JobRecord`].

use std::collections::HashMap;

use jobline_models::{JobId, JobRecord, JobState, NewJob, ParentRef};

use crate::error::{QueueError, QueueResult};

/// Parent coordinates passed to the add-job script.
pub(crate) struct ParentArgs<'a> {
    pub base: &'a str,
    pub id: &'a str,
    pub queue: &'a str,
}

/// ARGV for `add_job.lua` (and the iteration part of `upsert_scheduler.lua`).
pub(crate) fn add_job_args(
    id: &str,
    job: &NewJob,
    now: i64,
    parent: Option<&ParentArgs<'_>>,
    wait_children: bool,
) -> QueueResult<Vec<String>> {
    Ok(vec![
        id.to_string(),
        job.name.clone(),
        serde_json::to_string(&job.data)?,
        serde_json::to_string(&job.opts)?,
        now.to_string(),
        job.opts.delay_ms.to_string(),
        job.opts.priority.to_string(),
        parent.map(|p| p.base.to_string()).unwrap_or_default(),
        parent.map(|p| p.id.to_string()).unwrap_or_default(),
        parent.map(|p| p.queue.to_string()).unwrap_or_default(),
        if wait_children { "1" } else { "0" }.to_string(),
        job.scheduler_id.clone().unwrap_or_default(),
    ])
}

fn parse_num<T: std::str::FromStr>(hash: &HashMap<String, String>, field: &str) -> Option<T> {
    hash.get(field).and_then(|v| v.parse().ok())
}

/// Build a record from the fields of a job hash.
pub(crate) fn record_from_hash(
    queue: &str,
    id: &str,
    hash: &HashMap<String, String>,
    state: JobState,
) -> QueueResult<JobRecord> {
    let name = hash
        .get("name")
        .cloned()
        .ok_or_else(|| QueueError::serialization(format!("job {} has no name", id)))?;
    let data = match hash.get("data") {
        Some(raw) => serde_json::from_str(raw)?,
        None => serde_json::Value::Null,
    };
    let opts = match hash.get("opts") {
        Some(raw) => serde_json::from_str(raw)?,
        None => Default::default(),
    };
    let return_value = match hash.get("returnvalue") {
        Some(raw) => Some(serde_json::from_str(raw)?),
        None => None,
    };
    let stacktrace = match hash.get("stacktrace") {
        Some(raw) => serde_json::from_str(raw).unwrap_or_default(),
        None => Vec::new(),
    };
    let parent = match (hash.get("parentId"), hash.get("parentQueue")) {
        (Some(pid), Some(pq)) => Some(ParentRef {
            id: JobId::from_string(pid.clone()),
            queue: pq.clone(),
        }),
        _ => None,
    };

    Ok(JobRecord {
        id: JobId::from_string(id),
        name,
        queue: queue.to_string(),
        data,
        opts,
        state,
        progress: parse_num(hash, "progress").unwrap_or(0),
        attempts_made: parse_num(hash, "attemptsMade").unwrap_or(0),
        attempts_started: parse_num(hash, "attemptsStarted").unwrap_or(0),
        stalled_counter: parse_num(hash, "stalledCounter").unwrap_or(0),
        timestamp: parse_num(hash, "timestamp").unwrap_or(0),
        processed_on: parse_num(hash, "processedOn"),
        finished_on: parse_num(hash, "finishedOn"),
        return_value,
        failed_reason: hash.get("failedReason").cloned(),
        stacktrace,
        parent,
        scheduler_id: hash.get("schedulerId").cloned(),
    })
}
