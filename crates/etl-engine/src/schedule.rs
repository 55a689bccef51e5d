//! Cron expressions for workflow schedules
//!
//! Workflows store standard five-field cron (`minute hour day-of-month month
//! day-of-week`), one of the `@yearly`/`@monthly`/`@weekly`/`@daily`/`@hourly`
//! macros, or the run-once sentinel `@once`. The `cron` crate wants a seconds
//! field and numbers weekdays from 1 (Sunday), so expressions are normalised
//! here: a zero seconds field is prepended and the day-of-week field is
//! rewritten as an explicit list of day names.
//!
//! When both day-of-month and day-of-week are restricted, standard cron fires
//! on days matching either field while the `cron` crate wants both. Such an
//! expression is split into one schedule per day field and the earlier fire
//! wins.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{EngineError, EngineResult};

/// Schedule value meaning "execute once, now"
pub const RUN_ONCE: &str = "@once";

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

/// True for `@once` (or the bare alias `once`)
pub fn is_run_once(expression: &str) -> bool {
    matches!(
        expression.trim().to_ascii_lowercase().as_str(),
        "@once" | "once"
    )
}

/// What a workflow's schedule string resolves to
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    Once,
    Cron(CronSchedule),
}

impl ScheduleSpec {
    pub fn parse(expression: &str) -> EngineResult<Self> {
        if is_run_once(expression) {
            Ok(ScheduleSpec::Once)
        } else {
            CronSchedule::parse(expression).map(ScheduleSpec::Cron)
        }
    }
}

/// A validated recurring schedule
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    /// One schedule, or two when the day fields are OR-ed
    schedules: Vec<cron::Schedule>,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> EngineResult<Self> {
        let invalid = |reason: String| EngineError::InvalidCron {
            expression: expression.to_string(),
            reason,
        };

        let schedules = normalise(expression)
            .map_err(invalid)?
            .iter()
            .map(|normalised| cron::Schedule::from_str(normalised).map_err(|e| invalid(e.to_string())))
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(Self {
            expression: expression.trim().to_string(),
            schedules,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(&after).next())
            .min()
    }

    /// Next fire given the previous one. Counting from the later of the two
    /// instants keeps fires strictly increasing and skips anything missed
    /// while the process was busy or asleep.
    pub fn next_fire(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let base = previous.map_or(now, |prev| prev.max(now));
        self.next_after(base)
    }
}

fn expand_macro(expression: &str) -> Result<&str, String> {
    let expanded = match expression.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * 0",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        other if other.starts_with('@') => return Err(format!("unknown macro {other}")),
        _ => return Ok(expression),
    };
    Ok(expanded)
}

fn is_wildcard(field: &str) -> bool {
    field == "*" || field == "?"
}

/// Seven-field expressions for the `cron` crate, two when both day fields
/// are restricted
fn normalise(expression: &str) -> Result<Vec<String>, String> {
    let expression = expand_macro(expression.trim())?;
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!("expected 5 fields, found {}", fields.len()));
    }

    let (minute, hour, day_of_month, month) = (fields[0], fields[1], fields[2], fields[3]);
    let day_of_week = day_of_week_field(fields[4])?;
    let render = |dom: &str, dow: &str| format!("0 {minute} {hour} {dom} {month} {dow}");

    if is_wildcard(day_of_month) || is_wildcard(fields[4]) {
        Ok(vec![render(day_of_month, &day_of_week)])
    } else {
        Ok(vec![render(day_of_month, "*"), render("*", &day_of_week)])
    }
}

fn day_number(token: &str) -> Result<u32, String> {
    if let Ok(n) = token.parse::<u32>() {
        return if n <= 7 {
            Ok(n)
        } else {
            Err(format!("day of week {n} out of range 0-7"))
        };
    }

    let lower = token.to_ascii_lowercase();
    DAY_NAMES
        .iter()
        .position(|name| lower.starts_with(&name.to_ascii_lowercase()) && lower.len() >= 3)
        .map(|idx| idx as u32)
        .ok_or_else(|| format!("unknown day of week {token:?}"))
}

/// Rewrite the day-of-week field as day names so the numbering difference
/// between standard cron (0 or 7 = Sunday) and the `cron` crate disappears.
fn day_of_week_field(field: &str) -> Result<String, String> {
    if is_wildcard(field) {
        return Ok("*".to_string());
    }

    let mut days = BTreeSet::new();
    for part in field.split(',') {
        let (base, step) = match part.split_once('/') {
            Some((base, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step {step:?}"))?;
                if step == 0 {
                    return Err("step must be positive".to_string());
                }
                (base, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if base == "*" {
            (0, 6)
        } else if let Some((from, to)) = base.split_once('-') {
            (day_number(from)?, day_number(to)?)
        } else {
            let day = day_number(base)?;
            (day, if step.is_some() { 6 } else { day })
        };

        if start > end {
            return Err(format!("descending day range {base:?}"));
        }

        for day in (start..=end).step_by(step.unwrap_or(1) as usize) {
            days.insert(day % 7);
        }
    }

    if days.len() == 7 {
        return Ok("*".to_string());
    }

    Ok(days
        .into_iter()
        .map(|day| DAY_NAMES[day as usize])
        .collect::<Vec<_>>()
        .join(","))
}
