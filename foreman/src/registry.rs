//! In-memory run registry.
//!
//! Runs are indexed globally by [`RunId`] and per job in creation order.
//! Per-job history is pruned to a bounded number of *terminal* runs;
//! non-terminal runs are never pruned, so an active run always stays
//! queryable.

use std::sync::Arc;

use dashmap::DashMap;

use crate::engine::job::JobId;
use crate::run::{Run, RunId};

/// Registry of all runs known to the engine.
#[derive(Default)]
pub struct RunRegistry {
    runs: DashMap<RunId, Arc<Run>>,
    /// Per-job run ids, oldest first.
    by_job: DashMap<JobId, Vec<RunId>>,
    /// Terminal runs retained per job; older terminal runs are evicted.
    max_recent_runs: usize,
}

impl RunRegistry {
    pub fn new(max_recent_runs: usize) -> Self {
        Self {
            runs: DashMap::new(),
            by_job: DashMap::new(),
            max_recent_runs,
        }
    }

    /// Records a new run under its job.
    pub fn insert(&self, run: Arc<Run>) {
        let id = run.id();
        let job_id = run.job_id().clone();
        self.runs.insert(id, run);
        self.by_job.entry(job_id).or_default().push(id);
    }

    pub fn get(&self, id: RunId) -> Option<Arc<Run>> {
        self.runs.get(&id).map(|r| Arc::clone(r.value()))
    }

    /// Runs for a job, most recent first.
    pub fn runs_for_job(&self, job_id: &JobId) -> Vec<Arc<Run>> {
        let ids = match self.by_job.get(job_id) {
            Some(ids) => ids.value().clone(),
            None => return Vec::new(),
        };
        ids.iter()
            .rev()
            .filter_map(|id| self.get(*id))
            .collect()
    }

    /// Most recent run for a job, if any.
    pub fn latest_for_job(&self, job_id: &JobId) -> Option<Arc<Run>> {
        self.runs_for_job(job_id).into_iter().next()
    }

    /// True when the job has a run that has not reached a terminal state.
    pub fn has_active(&self, job_id: &JobId) -> bool {
        let ids = match self.by_job.get(job_id) {
            Some(ids) => ids.value().clone(),
            None => return false,
        };
        ids.iter()
            .filter_map(|id| self.get(*id))
            .any(|run| !run.state().is_terminal())
    }

    /// All runs for a job that have not reached a terminal state.
    pub fn active_for_job(&self, job_id: &JobId) -> Vec<Arc<Run>> {
        self.runs_for_job(job_id)
            .into_iter()
            .filter(|run| !run.state().is_terminal())
            .collect()
    }

    /// Evicts the oldest terminal runs beyond the retention bound. Called
    /// after a run reaches a terminal state.
    pub fn prune(&self, job_id: &JobId) {
        let Some(mut ids) = self.by_job.get_mut(job_id) else {
            return;
        };
        let terminal: Vec<RunId> = ids
            .iter()
            .filter(|id| {
                self.runs
                    .get(id)
                    .is_some_and(|r| r.state().is_terminal())
            })
            .copied()
            .collect();
        if terminal.len() <= self.max_recent_runs {
            return;
        }
        let evict: Vec<RunId> = terminal[..terminal.len() - self.max_recent_runs].to_vec();
        ids.retain(|id| !evict.contains(id));
        drop(ids);
        for id in evict {
            self.runs.remove(&id);
        }
    }

    /// Drops all history for a removed job.
    pub fn remove_job(&self, job_id: &JobId) {
        if let Some((_, ids)) = self.by_job.remove(job_id) {
            for id in ids {
                self.runs.remove(&id);
            }
        }
    }

    /// All runs that have not reached a terminal state, across jobs.
    pub fn active_runs(&self) -> Vec<Arc<Run>> {
        self.runs
            .iter()
            .filter(|entry| !entry.value().state().is_terminal())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{RunOutcome, RunState};
    use crate::sink::{OutputPolicy, OutputSink};
    use crate::target::{Descriptor, Substrate, TargetSpec};
    use chrono::Utc;

    fn make_run(job: &str) -> Arc<Run> {
        let descriptor = Descriptor::resolve(TargetSpec::command("echo hi")).unwrap();
        Arc::new(Run::new(
            JobId::from(job),
            Utc::now(),
            Arc::new(descriptor),
            Substrate::ProcessDedicated,
            Arc::new(OutputSink::new(OutputPolicy::default()).unwrap()),
        ))
    }

    fn finish(run: &Run) {
        run.begin();
        run.finish(RunState::Succeeded, RunOutcome::default());
    }

    #[test]
    fn test_runs_listed_most_recent_first() {
        let registry = RunRegistry::new(8);
        let job = JobId::from("j");
        let first = make_run("j");
        let second = make_run("j");
        registry.insert(Arc::clone(&first));
        registry.insert(Arc::clone(&second));

        let runs = registry.runs_for_job(&job);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id(), second.id());
        assert_eq!(registry.latest_for_job(&job).unwrap().id(), second.id());
    }

    #[test]
    fn test_has_active_tracks_terminal_state() {
        let registry = RunRegistry::new(8);
        let job = JobId::from("j");
        let run = make_run("j");
        registry.insert(Arc::clone(&run));
        assert!(registry.has_active(&job));

        finish(&run);
        assert!(!registry.has_active(&job));
    }

    #[test]
    fn test_prune_keeps_bound_and_spares_active() {
        let registry = RunRegistry::new(2);
        let job = JobId::from("j");

        let active = make_run("j");
        registry.insert(Arc::clone(&active));
        for _ in 0..4 {
            let run = make_run("j");
            finish(&run);
            registry.insert(run);
            registry.prune(&job);
        }

        let runs = registry.runs_for_job(&job);
        // Two terminal survivors plus the untouched active run.
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().any(|r| r.id() == active.id()));
        assert_eq!(
            runs.iter().filter(|r| r.state().is_terminal()).count(),
            2
        );
    }

    #[test]
    fn test_remove_job_drops_history() {
        let registry = RunRegistry::new(8);
        let job = JobId::from("j");
        let run = make_run("j");
        let id = run.id();
        registry.insert(run);

        registry.remove_job(&job);
        assert!(registry.get(id).is_none());
        assert!(registry.runs_for_job(&job).is_empty());
    }
}
