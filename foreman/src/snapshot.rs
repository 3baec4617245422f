//! State snapshots for external persistence.
//!
//! The engine is in-memory only; durability is an integration seam, not a
//! feature. A [`SnapshotSink`] receives serializable snapshots at the
//! moments that matter (job registration and removal, run creation and
//! terminal transition) and may write them wherever it likes. The default
//! sink discards everything.

use chrono::{DateTime, Utc};

use crate::engine::job::{JobId, JobState};
use crate::run::{RunId, RunState};
use crate::schedule::ConcurrencyPolicy;

/// Serializable view of a job.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub name: Option<String>,
    pub target: String,
    pub schedule: String,
    pub policy: ConcurrencyPolicy,
    pub state: JobState,
    pub next_fire: Option<DateTime<Utc>>,
    pub last_fire: Option<DateTime<Utc>>,
}

/// Serializable view of a run.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RunSnapshot {
    pub id: RunId,
    pub job_id: JobId,
    pub state: RunState,
    pub trigger_time: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

/// Receiver for engine state snapshots.
///
/// Implementations must not block: they are called from engine paths.
/// Spool to a channel if persistence is slow.
pub trait SnapshotSink: Send + Sync {
    fn record_job(&self, snapshot: &JobSnapshot);
    fn record_run(&self, snapshot: &RunSnapshot);
}

/// Discards all snapshots. The default when no persistence is wired up.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSnapshotSink;

impl SnapshotSink for NullSnapshotSink {
    fn record_job(&self, _snapshot: &JobSnapshot) {}
    fn record_run(&self, _snapshot: &RunSnapshot) {}
}

/// Appends snapshots as JSON lines to a file. Each record is tagged with
/// its kind so a replay can tell jobs from runs.
pub struct JsonlSnapshotSink {
    file: std::sync::Mutex<std::fs::File>,
}

#[derive(serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record<'a> {
    Job(&'a JobSnapshot),
    Run(&'a RunSnapshot),
}

impl JsonlSnapshotSink {
    pub fn create(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: std::sync::Mutex::new(file),
        })
    }

    fn append(&self, record: &Record<'_>) {
        use std::io::Write;
        let Ok(mut line) = serde_json::to_vec(record) else {
            return;
        };
        line.push(b'\n');
        let mut file = self.file.lock().expect("snapshot file lock poisoned");
        if let Err(err) = file.write_all(&line) {
            tracing::warn!("snapshot append failed: {err}");
        }
    }
}

impl SnapshotSink for JsonlSnapshotSink {
    fn record_job(&self, snapshot: &JobSnapshot) {
        self.append(&Record::Job(snapshot));
    }

    fn record_run(&self, snapshot: &RunSnapshot) {
        self.append(&Record::Run(snapshot));
    }
}
