//! Timing policies and next-fire computation.
//!
//! A [`Schedule`] answers one question: given the previous fire time (if
//! any) and the current instant, when is the next fire? Interval schedules
//! anchor on the *previous fire time* rather than "now" so that slow runs
//! do not drift the cadence. Cron schedules are evaluated in the engine's
//! configured time zone and always produce a timestamp strictly after the
//! anchor.
//!
//! Malformed schedules are rejected at construction with
//! [`Error::Schedule`]; nothing is silently defaulted.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::error::{Error, Result};

/// Per-job rule for a fire time arriving while a prior run is still
/// active.
///
/// There is deliberately no `Default`: the choice is required at job
/// creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Drop the tick (a skipped-tick event is emitted) and recompute the
    /// next fire time. At most one non-terminal run exists per job.
    Skip,
    /// Create the run now but defer dispatch until the prior run
    /// terminates, preserving per-job FIFO order.
    Queue,
    /// Dispatch immediately regardless of prior runs.
    Overlap,
}

impl fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skip => write!(f, "skip"),
            Self::Queue => write!(f, "queue"),
            Self::Overlap => write!(f, "overlap"),
        }
    }
}

/// A job's timing policy.
#[derive(Clone, Debug)]
pub enum Schedule {
    /// Fire once: immediately when `at` is `None`, else at the configured
    /// instant. The job exhausts once the run is terminal.
    Singleshot { at: Option<DateTime<Utc>> },
    /// Fire every `every`, anchored on the previous fire time.
    Interval {
        every: Duration,
        start_at: Option<DateTime<Utc>>,
    },
    /// Fire at the instants matching a cron expression in the engine time
    /// zone.
    Cron {
        expr: String,
        schedule: cron::Schedule,
    },
    /// Fire once at an absolute instant, then exhaust.
    Date { at: DateTime<Utc> },
}

impl Schedule {
    /// Immediate one-shot schedule.
    pub fn immediate() -> Self {
        Self::Singleshot { at: None }
    }

    /// One-shot schedule at a configured time.
    pub fn once_at(at: DateTime<Utc>) -> Self {
        Self::Singleshot { at: Some(at) }
    }

    /// Fixed-interval schedule.
    pub fn interval(every: Duration) -> Result<Self> {
        Self::interval_from(every, None)
    }

    /// Fixed-interval schedule with an explicit first fire time.
    pub fn interval_from(every: Duration, start_at: Option<DateTime<Utc>>) -> Result<Self> {
        if every.is_zero() {
            return Err(Error::Schedule("interval must be greater than zero".into()));
        }
        if chrono::Duration::from_std(every).is_err() {
            return Err(Error::Schedule(format!("interval out of range: {every:?}")));
        }
        Ok(Self::Interval { every, start_at })
    }

    /// Cron schedule from a five-field expression (minute, hour, day of
    /// month, month, day of week). Six- and seven-field expressions with
    /// an explicit seconds (and year) field are also accepted.
    pub fn cron(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let field_count = trimmed.split_whitespace().count();
        let normalized = match field_count {
            5 => format!("0 {trimmed}"),
            6 | 7 => trimmed.to_string(),
            n => {
                return Err(Error::Schedule(format!(
                    "cron expression {trimmed:?} has {n} fields, expected 5"
                )))
            }
        };
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| Error::Schedule(format!("invalid cron expression {trimmed:?}: {e}")))?;
        Ok(Self::Cron {
            expr: trimmed.to_string(),
            schedule,
        })
    }

    /// Absolute-date schedule.
    pub fn at(at: DateTime<Utc>) -> Self {
        Self::Date { at }
    }

    /// True for schedules that fire exactly once and then exhaust.
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Self::Singleshot { .. } | Self::Date { .. })
    }

    /// Computes the next fire time strictly from schedule state.
    ///
    /// `prev` is the previous fire time (`None` before the first fire).
    /// Returns `None` when the schedule has no future occurrence.
    pub fn next_fire(
        &self,
        prev: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> Option<DateTime<Utc>> {
        match self {
            Self::Singleshot { at } => match prev {
                Some(_) => None,
                None => Some(at.unwrap_or(now)),
            },
            Self::Date { at } => match prev {
                Some(_) => None,
                None => Some(*at),
            },
            Self::Interval { every, start_at } => {
                // Validated at construction.
                let step = chrono::Duration::from_std(*every).ok()?;
                match prev {
                    Some(prev) => Some(prev + step),
                    None => Some(start_at.unwrap_or(now + step)),
                }
            }
            Self::Cron { schedule, .. } => {
                let anchor = prev.unwrap_or(now).with_timezone(&tz);
                schedule.after(&anchor).next().map(|t| t.with_timezone(&Utc))
            }
        }
    }

    /// Human-readable description for logs and snapshots.
    pub fn describe(&self) -> String {
        match self {
            Self::Singleshot { at: None } => "singleshot".to_string(),
            Self::Singleshot { at: Some(at) } => format!("singleshot at {at}"),
            Self::Interval { every, .. } => format!("every {every:?}"),
            Self::Cron { expr, .. } => format!("cron {expr}"),
            Self::Date { at } => format!("date {at}"),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}
