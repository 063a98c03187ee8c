//! Cron schedule helpers for recurring backups and prunes.
//!
//! Expressions are evaluated in the host's local timezone. Both the common
//! 5-field crontab form (`min hour dom month dow`, Sunday is 0 or 7) and the
//! 6/7-field form with a leading seconds field are accepted. The latter is
//! passed to the cron crate untouched, so its weekdays count from Sunday = 1.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use cron::Schedule;
use std::collections::BTreeSet;
use std::str::FromStr;

/// Crontab weekday numbers 0..=6, by name.
const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let expr = expr.trim();
    let normalized = normalize(expr)
        .with_context(|| format!("Invalid cron expression '{}'", expr))?;
    Schedule::from_str(&normalized)
        .with_context(|| format!("Invalid cron expression '{}'", expr))
}

/// Rewrites a crontab expression into the cron crate's dialect: a seconds
/// field first and weekdays spelled out by name.
fn normalize(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Ok(expr.to_string());
    }
    Ok(format!(
        "0 {} {} {} {} {}",
        fields[0],
        fields[1],
        fields[2],
        fields[3],
        crontab_weekdays(fields[4])?
    ))
}

fn crontab_weekdays(field: &str) -> Result<String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: usize = step
                    .parse()
                    .with_context(|| format!("invalid weekday step '{}'", step))?;
                if step == 0 {
                    bail!("weekday step must be positive");
                }
                (range, Some(step))
            }
            None => (item, None),
        };
        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((first, last)) = range.split_once('-') {
            (weekday_number(first)?, weekday_number(last)?)
        } else {
            let day = weekday_number(range)?;
            // `n/step` runs to the end of the week
            (day, if step.is_some() { day.max(6) } else { day })
        };
        if start > end {
            bail!("weekday range '{}' runs backwards", range);
        }
        for day in (start..=end).step_by(step.unwrap_or(1)) {
            days.insert(day % 7);
        }
    }

    Ok(days
        .into_iter()
        .map(|day| WEEKDAYS[day])
        .collect::<Vec<_>>()
        .join(","))
}

fn weekday_number(value: &str) -> Result<usize> {
    if let Ok(number) = value.parse::<usize>() {
        if number > 7 {
            bail!("weekday {} is out of range", number);
        }
        return Ok(number);
    }
    WEEKDAYS
        .iter()
        .position(|name| name.eq_ignore_ascii_case(value))
        .with_context(|| format!("invalid weekday '{}'", value))
}

/// First fire time strictly after `after`. Missed runs are never replayed.
pub fn next_after(expr: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let schedule = parse_schedule(expr)?;
    Ok(schedule
        .after(&after.with_timezone(&Local))
        .next()
        .map(|t| t.with_timezone(&Utc)))
}
