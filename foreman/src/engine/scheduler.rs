//! The scheduler loop.
//!
//! A single task owns all fire timing: it keeps a min-heap of upcoming
//! fire times, sleeps until the earliest one, and multiplexes control
//! commands and run completions over the same `select` loop. Heap entries
//! are lazily invalidated — an entry is only acted on if it still matches
//! the job's recorded next fire time and the job is still active — so
//! removals and reschedules never have to dig entries out of the heap.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::job::{Job, JobId, JobState};
use super::EngineShared;
use crate::backend::{Backends, RunCompletion};
use crate::events::EngineEvent;
use crate::run::{Run, RunOutcome, RunState};
use crate::schedule::{ConcurrencyPolicy, Schedule};

/// Sleep horizon when nothing is scheduled; commands wake the loop early.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

/// Control messages from the engine facade to the scheduler loop.
#[derive(Debug)]
pub(crate) enum Command {
    AddJob(Arc<Job>),
    RemoveJob(JobId),
    StopJob(JobId),
    ResumeJob(JobId),
    Reschedule(JobId, Schedule),
}

#[derive(Debug, PartialEq, Eq)]
struct FireEntry {
    at: DateTime<Utc>,
    job_id: JobId,
}

impl Ord for FireEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at, &self.job_id).cmp(&(other.at, &other.job_id))
    }
}

impl PartialOrd for FireEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub(crate) struct Scheduler {
    shared: Arc<EngineShared>,
    backends: Arc<Backends>,
    commands: mpsc::UnboundedReceiver<Command>,
    completions: mpsc::UnboundedReceiver<RunCompletion>,
    heap: BinaryHeap<Reverse<FireEntry>>,
    /// Runs created under the queue policy, awaiting the prior run.
    queues: HashMap<JobId, VecDeque<Arc<Run>>>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub(crate) fn new(
        shared: Arc<EngineShared>,
        backends: Arc<Backends>,
        commands: mpsc::UnboundedReceiver<Command>,
        completions: mpsc::UnboundedReceiver<RunCompletion>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            backends,
            commands,
            completions,
            heap: BinaryHeap::new(),
            queues: HashMap::new(),
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!("scheduler loop started");
        loop {
            let sleep_for = self.until_next_deadline();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                completion = self.completions.recv() => {
                    if let Some(completion) = completion {
                        self.handle_completion(completion);
                    }
                }
                _ = tokio::time::sleep(sleep_for) => self.fire_due(),
            }
        }
        self.drain_queues();
        tracing::debug!("scheduler loop stopped");
    }

    /// Duration until the earliest still-valid heap entry.
    fn until_next_deadline(&mut self) -> Duration {
        loop {
            let Some(Reverse(entry)) = self.heap.peek() else {
                return IDLE_SLEEP;
            };
            if !self.entry_valid(entry) {
                self.heap.pop();
                continue;
            }
            let now = Utc::now();
            return (entry.at - now).to_std().unwrap_or(Duration::ZERO);
        }
    }

    /// An entry is live only while it matches the job's recorded next
    /// fire and the job still schedules.
    fn entry_valid(&self, entry: &FireEntry) -> bool {
        match self.shared.jobs.get(&entry.job_id) {
            Some(job) => {
                job.state() == JobState::Active && job.next_fire() == Some(entry.at)
            }
            None => false,
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddJob(job) => {
                // The first fire time was computed at registration so it
                // is observable before add_job returns.
                match job.next_fire() {
                    Some(at) => {
                        tracing::debug!(job_id = %job.id(), %at, "job scheduled");
                        self.heap.push(Reverse(FireEntry {
                            at,
                            job_id: job.id().clone(),
                        }));
                    }
                    None => {
                        job.set_state(JobState::Exhausted);
                        self.shared.bump_epoch();
                    }
                }
            }
            Command::RemoveJob(job_id) => {
                // Queued runs die with the job.
                if let Some(queue) = self.queues.remove(&job_id) {
                    for run in queue {
                        self.shared.finalize_run(&run, RunState::Killed, RunOutcome {
                            exit_code: None,
                            error: Some("job removed".to_string()),
                        });
                    }
                }
            }
            Command::StopJob(job_id) => {
                if let Some(job) = self.shared.jobs.get(&job_id) {
                    job.set_state(JobState::Stopped);
                    job.set_next_fire(None);
                    self.shared.bump_epoch();
                }
            }
            Command::ResumeJob(job_id) => {
                let job = self
                    .shared
                    .jobs
                    .get(&job_id)
                    .map(|j| Arc::clone(j.value()));
                if let Some(job) = job {
                    if job.state() == JobState::Stopped {
                        self.recompute_fire(&job);
                        // Runs queued before the stop dispatch again.
                        self.advance_queue(&job);
                        self.shared.bump_epoch();
                    }
                }
            }
            Command::Reschedule(job_id, schedule) => {
                let job = self
                    .shared
                    .jobs
                    .get(&job_id)
                    .map(|j| Arc::clone(j.value()));
                if let Some(job) = job {
                    job.set_schedule(schedule);
                    // A stopped job keeps the new schedule for its
                    // eventual resume.
                    if job.state() != JobState::Stopped {
                        self.recompute_fire(&job);
                    }
                    self.shared.bump_epoch();
                }
            }
        }
    }

    /// Computes a fresh next fire time from the job's last fire,
    /// dropping occurrences already in the past, and (re)activates or
    /// exhausts the job accordingly. Used on resume and reschedule.
    fn recompute_fire(&mut self, job: &Arc<Job>) {
        let now = Utc::now();
        let tz = self.shared.config.timezone;
        let schedule = job.schedule();
        let mut next = schedule.next_fire(job.last_fire(), now, tz);
        while let Some(at) = next {
            if at > now {
                break;
            }
            next = schedule.next_fire(Some(at), now, tz);
        }
        job.set_next_fire(next);
        match next {
            Some(at) => {
                job.set_state(JobState::Active);
                self.heap.push(Reverse(FireEntry {
                    at,
                    job_id: job.id().clone(),
                }));
            }
            None => job.set_state(JobState::Exhausted),
        }
    }

    /// Fires every valid entry whose time has arrived.
    fn fire_due(&mut self) {
        let now = Utc::now();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.at > now {
                break;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            if !self.entry_valid(&entry) {
                continue;
            }
            let job = self
                .shared
                .jobs
                .get(&entry.job_id)
                .map(|j| Arc::clone(j.value()));
            let Some(job) = job else { continue };
            self.fire(job, entry.at);
        }
    }

    fn fire(&mut self, job: Arc<Job>, at: DateTime<Utc>) {
        job.record_fire(at);
        let next = job
            .schedule()
            .next_fire(Some(at), Utc::now(), self.shared.config.timezone);
        job.set_next_fire(next);
        if let Some(next_at) = next {
            self.heap.push(Reverse(FireEntry {
                at: next_at,
                job_id: job.id().clone(),
            }));
        }

        let busy = self.shared.runs.has_active(job.id())
            || self
                .queues
                .get(job.id())
                .is_some_and(|q| !q.is_empty());

        match job.policy() {
            ConcurrencyPolicy::Skip if busy => {
                tracing::debug!(job_id = %job.id(), fire_time = %at, "tick skipped, prior run active");
                self.shared.bus.publish(EngineEvent::TickSkipped {
                    job_id: job.id().clone(),
                    fire_time: at,
                });
                self.shared.bump_epoch();
            }
            ConcurrencyPolicy::Queue if busy => {
                let run = self.shared.create_run(&job, at);
                tracing::debug!(job_id = %job.id(), run_id = %run.id(), "run queued behind prior run");
                self.queues
                    .entry(job.id().clone())
                    .or_default()
                    .push_back(run);
            }
            _ => {
                let run = self.shared.create_run(&job, at);
                self.backends.dispatch(run);
            }
        }
    }

    fn handle_completion(&mut self, completion: RunCompletion) {
        tracing::trace!(job_id = %completion.job_id, run_id = %completion.run_id, "run completed");
        let job = self
            .shared
            .jobs
            .get(&completion.job_id)
            .map(|j| Arc::clone(j.value()));
        let Some(job) = job else { return };

        // Advance the FIFO queue: one completion admits one queued run.
        // A stopped job holds its queue until resumed.
        if job.state() != JobState::Stopped {
            self.advance_queue(&job);
        }

        self.maybe_exhaust(&job);
    }

    /// Dispatches the next queued pending run, provided nothing for the
    /// job is currently running.
    fn advance_queue(&mut self, job: &Arc<Job>) {
        if self.shared.runs.has_active(job.id()) {
            return;
        }
        if let Some(queue) = self.queues.get_mut(job.id()) {
            while let Some(run) = queue.pop_front() {
                if run.state() == RunState::Pending {
                    self.backends.dispatch(run);
                    break;
                }
            }
        }
    }

    /// A job with no future fire, no queued run, and no active run is
    /// done for good.
    fn maybe_exhaust(&self, job: &Arc<Job>) {
        if job.state() != JobState::Active {
            return;
        }
        if job.next_fire().is_some() {
            return;
        }
        let queued = self
            .queues
            .get(job.id())
            .is_some_and(|q| q.iter().any(|r| r.state() == RunState::Pending));
        if queued || self.shared.runs.has_active(job.id()) {
            return;
        }
        tracing::debug!(job_id = %job.id(), "job exhausted");
        job.set_state(JobState::Exhausted);
        self.shared.bump_epoch();
    }

    /// On shutdown, queued runs that never dispatched are killed so
    /// waiters unblock.
    fn drain_queues(&mut self) {
        for (_, queue) in self.queues.drain() {
            for run in queue {
                self.shared.finalize_run(&run, RunState::Killed, RunOutcome {
                    exit_code: None,
                    error: Some("engine shutdown".to_string()),
                });
            }
        }
    }
}
