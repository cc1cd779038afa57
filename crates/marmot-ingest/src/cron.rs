//! Cron semantics (spec.md §4.E): 5-field cron expressions plus an
//! `@every <duration>` shorthand. The `cron` crate parses 6/7-field
//! expressions with a leading seconds column, so a 5-field expression is
//! widened by prefixing a fixed `0` seconds field.

use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("invalid cron expression: {0}")]
    InvalidExpression(String),
    #[error("invalid @every duration: {0}")]
    InvalidDuration(String),
}

#[derive(Debug, Clone)]
pub enum CronSchedule {
    Fields(cron::Schedule),
    Every(Duration),
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let expr = expr.trim();
        if let Some(rest) = expr.strip_prefix("@every ") {
            let duration = humantime::parse_duration(rest.trim())
                .map_err(|e| CronError::InvalidDuration(e.to_string()))?;
            return Ok(Self::Every(duration));
        }

        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::InvalidExpression(format!(
                "expected 5 fields (minute hour day-of-month month day-of-week), got {}",
                fields.len()
            )));
        }
        let widened = format!("0 {expr}");
        let schedule = cron::Schedule::from_str(&widened)
            .map_err(|e| CronError::InvalidExpression(e.to_string()))?;
        Ok(Self::Fields(schedule))
    }

    /// `cron.next_after(now)` from the spec's `next_fire_time` formula.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Fields(schedule) => schedule
                .after(&now)
                .next()
                .unwrap_or_else(|| now + chrono::Duration::days(365)),
            Self::Every(duration) => {
                now + chrono::Duration::from_std(*duration).unwrap_or(chrono::Duration::hours(1))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expression_computes_next_fire() {
        let schedule = CronSchedule::parse("0 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 10, 15, 0).unwrap();
        let next = schedule.next_after(now);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn every_shorthand_advances_by_duration() {
        let schedule = CronSchedule::parse("@every 5m").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let next = schedule.next_after(now);
        assert_eq!(next, now + chrono::Duration::minutes(5));
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(CronSchedule::parse("* * *").is_err());
    }
}
