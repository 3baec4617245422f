//! Job records.
//!
//! A job pairs a resolved target with a schedule and a concurrency
//! policy. Jobs are registered with the engine; the scheduler loop owns
//! their fire timing, the registry owns their run history.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::schedule::{ConcurrencyPolicy, Schedule};
use crate::sink::OutputPolicy;
use crate::snapshot::JobSnapshot;
use crate::target::Descriptor;

/// Stable job identifier. Generated when not supplied.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scheduling state of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Fires on schedule.
    Active,
    /// Retained with history, but the scheduler skips its fire times
    /// until resumed.
    Stopped,
    /// A one-shot schedule that has fired; never fires again.
    Exhausted,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Per-job options supplied at registration.
///
/// The concurrency policy is a required constructor argument: what
/// happens when a fire time arrives mid-run is a decision, not a default.
#[derive(Clone, Debug)]
pub struct JobOptions {
    pub policy: ConcurrencyPolicy,
    pub name: Option<String>,
    /// Output policy override; the engine default applies when `None`.
    pub output: Option<OutputPolicy>,
    /// Explicit id; generated when `None`.
    pub id: Option<JobId>,
}

impl JobOptions {
    pub fn new(policy: ConcurrencyPolicy) -> Self {
        Self {
            policy,
            name: None,
            output: None,
            id: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_output(mut self, output: OutputPolicy) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }
}

struct Timing {
    state: JobState,
    next_fire: Option<DateTime<Utc>>,
    last_fire: Option<DateTime<Utc>>,
}

/// A registered job.
pub struct Job {
    id: JobId,
    name: Option<String>,
    descriptor: Arc<Descriptor>,
    schedule: Mutex<Schedule>,
    policy: ConcurrencyPolicy,
    output: OutputPolicy,
    created_at: DateTime<Utc>,
    timing: Mutex<Timing>,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        name: Option<String>,
        descriptor: Arc<Descriptor>,
        schedule: Schedule,
        policy: ConcurrencyPolicy,
        output: OutputPolicy,
    ) -> Self {
        Self {
            id,
            name,
            descriptor,
            schedule: Mutex::new(schedule),
            policy,
            output,
            created_at: Utc::now(),
            timing: Mutex::new(Timing {
                state: JobState::Active,
                next_fire: None,
                last_fire: None,
            }),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn descriptor(&self) -> &Arc<Descriptor> {
        &self.descriptor
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
            .lock()
            .expect("job schedule lock poisoned")
            .clone()
    }

    /// Replaces the schedule. The scheduler recomputes the next fire
    /// time right after.
    pub(crate) fn set_schedule(&self, schedule: Schedule) {
        *self.schedule.lock().expect("job schedule lock poisoned") = schedule;
    }

    pub fn policy(&self) -> ConcurrencyPolicy {
        self.policy
    }

    pub fn output_policy(&self) -> &OutputPolicy {
        &self.output
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> JobState {
        self.timing.lock().expect("job timing lock poisoned").state
    }

    pub(crate) fn set_state(&self, state: JobState) {
        self.timing.lock().expect("job timing lock poisoned").state = state;
    }

    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.timing
            .lock()
            .expect("job timing lock poisoned")
            .next_fire
    }

    pub(crate) fn set_next_fire(&self, at: Option<DateTime<Utc>>) {
        self.timing
            .lock()
            .expect("job timing lock poisoned")
            .next_fire = at;
    }

    pub fn last_fire(&self) -> Option<DateTime<Utc>> {
        self.timing
            .lock()
            .expect("job timing lock poisoned")
            .last_fire
    }

    pub(crate) fn record_fire(&self, at: DateTime<Utc>) {
        self.timing
            .lock()
            .expect("job timing lock poisoned")
            .last_fire = Some(at);
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let schedule = self.schedule().describe();
        let timing = self.timing.lock().expect("job timing lock poisoned");
        JobSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            target: self.descriptor.target.source(),
            schedule,
            policy: self.policy,
            state: timing.state,
            next_fire: timing.next_fire,
            last_fire: timing.last_fire,
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("target", &self.descriptor.target.source())
            .field("schedule", &self.schedule().describe())
            .field("policy", &self.policy)
            .field("state", &self.state())
            .finish()
    }
}
