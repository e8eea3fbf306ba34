// Cron port implementation on top of the `cron` crate.
//
// Endpoints store standard 5-field expressions (minute hour day month
// weekday) evaluated in UTC. The parser wants a seconds field, so the
// adapter prepends `0` before parsing.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;

use super::traits::Cron;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression `{expr}`: {reason}")]
    Invalid { expr: String, reason: String },

    #[error("cron expression `{0}` has no upcoming fire time")]
    Exhausted(String),
}

/// Parse a stored 5-field expression into a minute-resolution schedule.
fn parse(expr: &str) -> Result<Schedule, CronError> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(CronError::Invalid {
            expr: expr.to_string(),
            reason: format!("expected 5 fields, got {}", fields),
        });
    }

    Schedule::from_str(&format!("0 {}", expr)).map_err(|e| CronError::Invalid {
        expr: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Config-time validation; rejects expressions before they reach a row.
pub fn validate_expression(expr: &str) -> Result<(), CronError> {
    parse(expr).map(|_| ())
}

/// Production Cron port: UTC evaluation of 5-field expressions.
#[derive(Debug, Clone, Copy, Default)]
pub struct UtcCron;

impl Cron for UtcCron {
    fn next(&self, expr: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        let schedule = parse(expr)?;
        schedule
            .after(&from)
            .next()
            .ok_or_else(|| CronError::Exhausted(expr.to_string()))
    }
}
