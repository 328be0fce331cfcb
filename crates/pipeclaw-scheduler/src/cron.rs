//! Lightweight cron expression parser.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds)
//! Field syntax: *, */N, N, A-B, A-B/N, comma lists.
//! All evaluation is in UTC — the engine does not infer local time zones
//! and does not handle DST.
//!
//! Day-of-month and day-of-week follow the classic union rule: when both
//! are restricted (neither written as `*`), a date matches if either does.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc, Weekday};

/// A parsed 5-field cron expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>, // 0 = Sunday … 6 = Saturday (7 normalized to 0)
    dom_restricted: bool,
    dow_restricted: bool,
}

/// Search bound: enough day/hour/minute skips to cover > 4 years, which
/// covers every satisfiable expression (worst case: Feb 29).
const MAX_STEPS: usize = 4 * 366 + 24 + 60 + 16;

impl CronSchedule {
    /// Parse a cron expression. Returns None on malformed input.
    pub fn parse(expression: &str) -> Option<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            tracing::warn!(
                "Invalid cron expression: '{}' (need 5 fields: MIN HOUR DOM MON DOW)",
                expression
            );
            return None;
        }

        let minutes = parse_field(parts[0], 0, 59)?;
        let hours = parse_field(parts[1], 0, 23)?;
        let days_of_month = parse_field(parts[2], 1, 31)?;
        let months = parse_field(parts[3], 1, 12)?;
        // Day-of-week allows 0-7 with both 0 and 7 meaning Sunday.
        let mut days_of_week: Vec<u32> = parse_field(parts[4], 0, 7)?
            .into_iter()
            .map(|d| d % 7)
            .collect();
        days_of_week.sort_unstable();
        days_of_week.dedup();

        Some(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
        })
    }

    /// Earliest timestamp strictly after `after` matching the expression.
    /// Returns None only for expressions that never match (e.g. Feb 30).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = (after + Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;

        for _ in 0..MAX_STEPS {
            if !self.months.contains(&candidate.month()) {
                candidate = first_of_next_month(candidate)?;
                continue;
            }
            if !self.day_matches(&candidate) {
                candidate = start_of_next_day(candidate)?;
                continue;
            }
            if !self.hours.contains(&candidate.hour()) {
                candidate = candidate.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(&candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }
            return Some(candidate);
        }

        None
    }

    fn day_matches(&self, t: &DateTime<Utc>) -> bool {
        let dom_ok = self.days_of_month.contains(&t.day());
        let dow_ok = self.days_of_week.contains(&dow_index(t.weekday()));
        if self.dom_restricted && self.dow_restricted {
            dom_ok || dow_ok
        } else {
            dom_ok && dow_ok
        }
    }
}

fn dow_index(weekday: Weekday) -> u32 {
    weekday.num_days_from_sunday()
}

fn start_of_next_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&next))
}

fn first_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    let first = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
    Some(Utc.from_utc_datetime(&first))
}

/// Parse one cron field into its sorted list of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    let mut values = Vec::new();

    for part in field.split(',') {
        let part = part.trim();
        let (range_part, step) = match part.split_once('/') {
            Some((r, s)) => {
                let n: u32 = s.parse().ok()?;
                if n == 0 {
                    return None;
                }
                (r, n)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            (a.trim().parse().ok()?, b.trim().parse().ok()?)
        } else {
            let n: u32 = range_part.parse().ok()?;
            // "N/step" means start at N and run to the field max.
            if step > 1 { (n, max) } else { (n, n) }
        };

        if lo < min || hi > max || lo > hi {
            return None;
        }
        values.extend((lo..=hi).step_by(step as usize));
    }

    values.sort_unstable();
    values.dedup();
    if values.is_empty() { None } else { Some(values) }
}
