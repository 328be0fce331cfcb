//! Schedule policy resolver — pure next-run computation.
//!
//! Recurring tasks reschedule from **completion time**, not from the
//! previous `next_run`: drift is intentional and prevents catch-up bursts
//! after downtime. One-time tasks are terminal after their single run.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use pipeclaw_core::config::SchedulerPolicy;
use pipeclaw_core::{PipeclawError, Result};

use crate::cron::CronSchedule;

/// Full policy validation for arm time. Structural checks plus an actual
/// parse of the cron expression — a malformed policy is a `Config` error
/// and the task is never armed.
pub fn validate(task: &str, policy: &SchedulerPolicy) -> Result<()> {
    policy.validate(task)?;
    if let SchedulerPolicy::Cron { expression } = policy {
        if CronSchedule::parse(expression).is_none() {
            return Err(PipeclawError::Config(format!(
                "Task '{task}': invalid cron expression '{expression}'"
            )));
        }
    }
    Ok(())
}

/// First run for a freshly armed task. One-time policies arm at their
/// absolute timestamp; recurring policies compute from `now`.
pub fn first_run(policy: &SchedulerPolicy, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match policy {
        SchedulerPolicy::OneTime { scheduled_time } => Ok(*scheduled_time),
        _ => next_run(policy, now)?.ok_or_else(|| {
            PipeclawError::Config("Recurring policy produced no next run".into())
        }),
    }
}

/// Next run after a completed cycle. `Ok(None)` means terminal: the policy
/// never fires again (one_time) and the record is finalized.
pub fn next_run(policy: &SchedulerPolicy, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match policy {
        SchedulerPolicy::Cron { expression } => {
            let schedule = CronSchedule::parse(expression).ok_or_else(|| {
                PipeclawError::Config(format!("Invalid cron expression '{expression}'"))
            })?;
            let next = schedule.next_after(now).ok_or_else(|| {
                PipeclawError::Config(format!("Cron expression '{expression}' never matches"))
            })?;
            Ok(Some(next))
        }
        SchedulerPolicy::RandomInterval { min_minutes, max_minutes } => {
            let minutes = rand::thread_rng().gen_range(*min_minutes..=*max_minutes);
            Ok(Some(now + Duration::milliseconds((minutes * 60_000.0) as i64)))
        }
        SchedulerPolicy::OneTime { .. } => Ok(None),
    }
}

/// Retry time for a failure, or None when retries are disabled — the
/// record becomes terminally failed.
pub fn retry_run(
    retry_minutes: Option<u64>,
    failure_time: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    retry_minutes.map(|minutes| failure_time + Duration::minutes(minutes as i64))
}
