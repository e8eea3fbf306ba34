//! Pure planning function: choose the next fire time for an endpoint.
//!
//! No I/O. The scheduler calls this after every run with a freshly re-read
//! endpoint row so hints written during execution take effect immediately.
//!
//! Candidate order: baseline (cron or interval), then AI interval hint,
//! then AI one-shot hint. The earliest wins, floored to `now`, clamped to
//! the guardrails relative to the last run, and a live pause overrides
//! everything.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use super::endpoint::{Endpoint, DEFAULT_BASELINE_INTERVAL_MS};
use crate::kernel::cron::CronError;
use crate::kernel::traits::Cron;

/// Which candidate produced the planned time. Diagnostic only; equal-time
/// candidates make the tag non-binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanSource {
    Paused,
    AiOneshot,
    AiInterval,
    BaselineCron,
    BaselineInterval,
    ClampedMin,
    ClampedMax,
}

impl PlanSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanSource::Paused => "paused",
            PlanSource::AiOneshot => "ai-oneshot",
            PlanSource::AiInterval => "ai-interval",
            PlanSource::BaselineCron => "baseline-cron",
            PlanSource::BaselineInterval => "baseline-interval",
            PlanSource::ClampedMin => "clamped-min",
            PlanSource::ClampedMax => "clamped-max",
        }
    }
}

impl std::fmt::Display for PlanSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub next_run_at: DateTime<Utc>,
    pub source: PlanSource,
}

#[derive(Debug, Error)]
pub enum PlanError {
    /// The stored cron expression failed to evaluate. Config-time
    /// validation should have rejected it; reaching here is an invariant
    /// violation the scheduler logs and works around.
    #[error(transparent)]
    Cron(#[from] CronError),
}

/// Compute the next fire time for `ep` as observed at `now`.
pub fn plan_next_run(
    now: DateTime<Utc>,
    ep: &Endpoint,
    cron: &dyn Cron,
) -> Result<Plan, PlanError> {
    // Pause dominates every other signal.
    if let Some(paused_until) = ep.paused_until {
        if paused_until > now {
            return Ok(Plan {
                next_run_at: paused_until,
                source: PlanSource::Paused,
            });
        }
    }

    let last = ep.last_run_at.unwrap_or(now);

    // Baseline candidate; ties keep the earlier-declared candidate.
    let (mut chosen, mut source) = if let Some(expr) = &ep.baseline_cron {
        (cron.next(expr, now)?, PlanSource::BaselineCron)
    } else {
        let interval_ms = ep
            .baseline_interval_ms
            .unwrap_or(DEFAULT_BASELINE_INTERVAL_MS);
        (
            last + Duration::milliseconds(interval_ms),
            PlanSource::BaselineInterval,
        )
    };

    if ep.has_fresh_hint(now) {
        if let Some(hint_ms) = ep.ai_hint_interval_ms {
            let candidate = last + Duration::milliseconds(hint_ms);
            if candidate < chosen {
                chosen = candidate;
                source = PlanSource::AiInterval;
            }
        }
        if let Some(at) = ep.ai_hint_next_run_at {
            if at < chosen {
                chosen = at;
                source = PlanSource::AiOneshot;
            }
        }
    }

    // Never schedule behind the wall clock.
    if chosen < now {
        chosen = now;
    }

    // Guardrails clamp relative to the last run.
    if let Some(min_ms) = ep.min_interval_ms {
        let floor = last + Duration::milliseconds(min_ms);
        if chosen < floor {
            chosen = floor;
            source = PlanSource::ClampedMin;
        }
    }
    if let Some(max_ms) = ep.max_interval_ms {
        let ceiling = last + Duration::milliseconds(max_ms);
        if chosen > ceiling {
            chosen = ceiling;
            source = PlanSource::ClampedMax;
        }
    }

    Ok(Plan {
        next_run_at: chosen,
        source,
    })
}
