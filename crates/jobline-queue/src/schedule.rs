//! Cron evaluation for schedulers.
//!
//! Patterns are standard five-field cron (`minute hour day month weekday`,
//! Sunday = 0). The `cron` crate expects a leading seconds field and numbers
//! weekdays 1-7 from Sunday, so patterns are normalized before parsing.

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use jobline_models::{NewJob, RepeatOptions, SchedulerEntry};

use crate::error::{QueueError, QueueResult};

/// Parse a five-field cron pattern.
pub fn parse_cron(pattern: &str) -> QueueResult<Schedule> {
    let fields: Vec<&str> = pattern.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(QueueError::invalid_schedule(format!(
            "expected 5 cron fields, got {} in '{}'",
            fields.len(),
            pattern
        )));
    }

    let weekday = normalize_weekday(fields[4]);
    let expression = format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], weekday
    );

    Schedule::from_str(&expression)
        .map_err(|e| QueueError::invalid_schedule(format!("'{}': {}", pattern, e)))
}

/// Map Sunday-based 0-7 weekday numbers onto the 1-7 range used by `cron`.
/// Step values (after `/`) are left alone.
fn normalize_weekday(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut number = String::new();
    let mut after_slash = false;

    let flush = |number: &mut String, out: &mut String, after_slash: bool| {
        if number.is_empty() {
            return;
        }
        if after_slash {
            out.push_str(number);
        } else if let Ok(n) = number.parse::<u32>() {
            out.push_str(&((n % 7) + 1).to_string());
        } else {
            out.push_str(number);
        }
        number.clear();
    };

    for c in field.chars() {
        if c.is_ascii_digit() {
            number.push(c);
        } else {
            flush(&mut number, &mut out, after_slash);
            after_slash = c == '/';
            out.push(c);
        }
    }
    flush(&mut number, &mut out, after_slash);
    out
}

fn parse_tz(tz: &str) -> QueueResult<Tz> {
    tz.parse::<Tz>()
        .map_err(|_| QueueError::invalid_schedule(format!("unknown timezone '{}'", tz)))
}

/// Next fire time strictly after `after_millis`, honoring timezone and
/// start/end bounds.
pub fn next_fire(repeat: &RepeatOptions, after_millis: i64) -> QueueResult<Option<i64>> {
    let schedule = parse_cron(&repeat.pattern)?;
    let tz = parse_tz(&repeat.tz)?;

    let mut after = Utc
        .timestamp_millis_opt(after_millis)
        .single()
        .ok_or_else(|| QueueError::invalid_schedule(format!("bad timestamp {}", after_millis)))?;

    if let Some(start) = repeat.start_date {
        // The start instant itself is a valid fire time.
        let just_before = start - chrono::Duration::milliseconds(1);
        if just_before > after {
            after = just_before;
        }
    }

    let next: Option<DateTime<Utc>> = schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|dt| dt.with_timezone(&Utc));

    Ok(match (next, repeat.end_date) {
        (Some(next), Some(end)) if next > end => None,
        (next, _) => next.map(|dt| dt.timestamp_millis()),
    })
}

/// Plan the iteration following `now_millis` for `entry`.
///
/// Updates `next_millis`, `next_job_id` and `count` on the entry and returns
/// the job to enqueue, or `None` when the scheduler is exhausted. Planning the
/// same fire time twice yields the same job ID, which keeps upserts
/// idempotent.
pub fn plan_iteration(entry: &mut SchedulerEntry, now_millis: i64) -> QueueResult<Option<NewJob>> {
    let repeat = &entry.spec.repeat;

    let Some(fire_at) = next_fire(repeat, now_millis)? else {
        entry.next_millis = None;
        entry.next_job_id = None;
        return Ok(None);
    };

    let job_id = entry.iteration_job_id(fire_at);
    let is_new = entry.next_job_id.as_deref() != Some(job_id.as_str());

    if is_new {
        if let Some(limit) = repeat.limit {
            if entry.count >= limit {
                entry.next_millis = None;
                entry.next_job_id = None;
                return Ok(None);
            }
        }
        entry.count += 1;
    }

    entry.next_millis = Some(fire_at);
    entry.next_job_id = Some(job_id.clone());

    let mut opts = entry.spec.opts.clone();
    opts.delay_ms = (fire_at - now_millis).max(0) as u64;
    opts.job_id = Some(job_id);
    opts.repeat = None;

    Ok(Some(
        NewJob::new(entry.spec.job_name.clone(), entry.spec.data.clone(), opts)
            .with_scheduler(entry.id.clone()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobline_models::{JobOptions, SchedulerSpec};

    fn millis(s: &str) -> i64 {
        DateTime::parse_from_rfc3339(s).unwrap().timestamp_millis()
    }

    fn entry(pattern: &str) -> SchedulerEntry {
        SchedulerEntry::new(
            "scheduler:test",
            SchedulerSpec {
                repeat: RepeatOptions::cron(pattern),
                job_name: "test-job".to_string(),
                data: serde_json::json!({"k": 1}),
                opts: JobOptions::default().resolve(),
            },
        )
    }

    #[test]
    fn test_parse_rejects_wrong_field_count() {
        assert!(parse_cron("0 2 * *").is_err());
        assert!(parse_cron("0 0 2 * * *").is_err());
        assert!(parse_cron("0 2 * * *").is_ok());
    }

    #[test]
    fn test_weekday_normalization() {
        assert_eq!(normalize_weekday("*"), "*");
        assert_eq!(normalize_weekday("0"), "1");
        assert_eq!(normalize_weekday("1-5"), "2-6");
        assert_eq!(normalize_weekday("*/2"), "*/2");
        assert_eq!(normalize_weekday("0,6"), "1,7");
    }

    #[test]
    fn test_next_fire_daily_utc() {
        let repeat = RepeatOptions::cron("0 2 * * *");
        let next = next_fire(&repeat, millis("2024-03-10T05:00:00Z")).unwrap();
        assert_eq!(next, Some(millis("2024-03-11T02:00:00Z")));
    }

    #[test]
    fn test_next_fire_respects_timezone() {
        let repeat = RepeatOptions::cron("0 9 * * *").with_tz("Europe/Stockholm");
        let next = next_fire(&repeat, millis("2024-01-15T00:00:00Z")).unwrap();
        // 09:00 CET is 08:00 UTC in January
        assert_eq!(next, Some(millis("2024-01-15T08:00:00Z")));
    }

    #[test]
    fn test_next_fire_weekday() {
        // 2024-03-10 is a Sunday; "1" means Monday in five-field cron
        let repeat = RepeatOptions::cron("30 6 * * 1");
        let next = next_fire(&repeat, millis("2024-03-10T12:00:00Z")).unwrap();
        assert_eq!(next, Some(millis("2024-03-11T06:30:00Z")));
    }

    #[test]
    fn test_next_fire_end_date() {
        let repeat = RepeatOptions::cron("0 2 * * *")
            .with_end_date(DateTime::parse_from_rfc3339("2024-03-10T12:00:00Z").unwrap().into());
        let next = next_fire(&repeat, millis("2024-03-10T05:00:00Z")).unwrap();
        assert_eq!(next, None);
    }

    #[test]
    fn test_next_fire_start_date() {
        let repeat = RepeatOptions::cron("0 2 * * *")
            .with_start_date(DateTime::parse_from_rfc3339("2024-04-01T02:00:00Z").unwrap().into());
        let next = next_fire(&repeat, millis("2024-03-10T05:00:00Z")).unwrap();
        assert_eq!(next, Some(millis("2024-04-01T02:00:00Z")));
    }

    #[test]
    fn test_unknown_timezone() {
        let repeat = RepeatOptions::cron("0 2 * * *").with_tz("Mars/Olympus");
        assert!(next_fire(&repeat, 0).is_err());
    }

    #[test]
    fn test_plan_iteration_is_idempotent() {
        let mut entry = entry("0 2 * * *");
        let now = millis("2024-03-10T05:00:00Z");

        let first = plan_iteration(&mut entry, now).unwrap().unwrap();
        let second = plan_iteration(&mut entry, now + 1_000).unwrap().unwrap();

        assert_eq!(first.opts.job_id, second.opts.job_id);
        assert_eq!(entry.count, 1);
        assert_eq!(first.scheduler_id.as_deref(), Some("scheduler:test"));
        assert_eq!(first.opts.delay_ms, (millis("2024-03-11T02:00:00Z") - now) as u64);
    }

    #[test]
    fn test_plan_iteration_honors_limit() {
        let mut entry = entry("0 2 * * *");
        entry.spec.repeat.limit = Some(1);

        assert!(plan_iteration(&mut entry, millis("2024-03-10T05:00:00Z")).unwrap().is_some());
        assert!(plan_iteration(&mut entry, millis("2024-03-11T03:00:00Z")).unwrap().is_none());
        assert_eq!(entry.next_job_id, None);
    }
}
