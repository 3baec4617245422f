//! The engine facade.
//!
//! [`Engine`] is the single entry point: job registration, ad-hoc runs,
//! run control, queries, waiting, and shutdown. Internally it owns the
//! shared state ([`EngineShared`]) and a scheduler task; every mutation
//! either happens directly on the shared maps or is sent as a command to
//! the scheduler loop.

pub mod job;
mod scheduler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backends, RunCompletion};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus, EventSubscription, SubscriberId, Topic};
use crate::guard::OrphanGuard;
use crate::registry::RunRegistry;
use crate::run::{Run, RunId, RunOutcome, RunState};
use crate::schedule::Schedule;
use crate::sink::{OutputSink, OutputSubscription, ReadMode};
use crate::snapshot::{NullSnapshotSink, RunSnapshot, SnapshotSink};
use crate::target::{ArgsMode, CallableRegistry, Descriptor, TargetSpec};

use job::{Job, JobId, JobOptions, JobState};
use scheduler::{Command, Scheduler};

/// Result of a bounded wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    TimedOut,
}

/// Job listing filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JobFilter {
    #[default]
    All,
    Active,
    Stopped,
    Exhausted,
}

impl JobFilter {
    fn matches(&self, state: JobState) -> bool {
        match self {
            Self::All => true,
            Self::Active => state == JobState::Active,
            Self::Stopped => state == JobState::Stopped,
            Self::Exhausted => state == JobState::Exhausted,
        }
    }
}

/// State shared between the facade, the scheduler loop, and backends.
pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) jobs: DashMap<JobId, Arc<Job>>,
    pub(crate) runs: RunRegistry,
    pub(crate) guard: OrphanGuard,
    pub(crate) callables: CallableRegistry,
    snapshots: Box<dyn SnapshotSink>,
    completions: mpsc::UnboundedSender<RunCompletion>,
    /// Bumped on every state change a waiter could care about.
    epoch: watch::Sender<u64>,
}

impl EngineShared {
    pub(crate) fn bump_epoch(&self) {
        self.epoch.send_modify(|e| *e += 1);
    }

    /// Marks a run dispatched and announces it. Returns false when the
    /// run already left `Pending` (killed or failed while queued).
    pub(crate) fn start_run(&self, run: &Arc<Run>) -> bool {
        if !run.begin() {
            return false;
        }
        self.bus.publish(EngineEvent::RunStarted {
            job_id: run.job_id().clone(),
            run_id: run.id(),
        });
        true
    }

    /// Records a terminal state: exactly one caller wins, and that caller
    /// publishes the finish event, prunes history, snapshots, and reports
    /// completion to the scheduler.
    pub(crate) fn finalize_run(&self, run: &Arc<Run>, state: RunState, outcome: RunOutcome) -> bool {
        if !run.finish(state, outcome.clone()) {
            return false;
        }
        tracing::info!(
            run_id = %run.id(),
            job_id = %run.job_id(),
            %state,
            exit_code = ?outcome.exit_code,
            "run finished"
        );
        self.bus.publish(EngineEvent::RunFinished {
            job_id: run.job_id().clone(),
            run_id: run.id(),
            state,
            exit_code: outcome.exit_code,
            error: outcome.error,
        });
        self.runs.prune(run.job_id());
        self.snapshots.record_run(&run_snapshot(run));
        let _ = self.completions.send(RunCompletion {
            job_id: run.job_id().clone(),
            run_id: run.id(),
        });
        self.bump_epoch();
        true
    }

    /// Creates and registers a run for a fire of `job`.
    pub(crate) fn create_run(&self, job: &Arc<Job>, trigger: DateTime<Utc>) -> Arc<Run> {
        self.create_run_with(job, trigger, Arc::clone(job.descriptor()))
    }

    /// Creates a run with an overridden descriptor (reruns).
    pub(crate) fn create_run_with(
        &self,
        job: &Arc<Job>,
        trigger: DateTime<Utc>,
        descriptor: Arc<Descriptor>,
    ) -> Arc<Run> {
        let (sink, sink_error) = match OutputSink::new(job.output_policy().clone()) {
            Ok(sink) => (sink, None),
            Err(err) => (OutputSink::discard(), Some(err.to_string())),
        };
        let substrate = descriptor.substrate;
        let run = Arc::new(Run::new(
            job.id().clone(),
            trigger,
            descriptor,
            substrate,
            Arc::new(sink),
        ));
        self.runs.insert(Arc::clone(&run));
        self.bus.publish(EngineEvent::RunCreated {
            job_id: job.id().clone(),
            run_id: run.id(),
        });
        self.snapshots.record_run(&run_snapshot(&run));

        if let Some(error) = sink_error {
            self.finalize_run(&run, RunState::Failed, RunOutcome {
                exit_code: None,
                error: Some(format!("output sink unavailable: {error}")),
            });
        }
        run
    }
}

fn run_snapshot(run: &Arc<Run>) -> RunSnapshot {
    let times = run.times();
    let outcome = run.outcome().unwrap_or_default();
    RunSnapshot {
        id: run.id(),
        job_id: run.job_id().clone(),
        state: run.state(),
        trigger_time: run.trigger_time(),
        started_at: times.started_at,
        finished_at: times.finished_at,
        exit_code: outcome.exit_code,
        error: outcome.error,
    }
}

/// The job orchestration engine.
///
/// Must be created inside a tokio runtime; construction spawns the
/// scheduler task. All methods are callable from any task.
pub struct Engine {
    shared: Arc<EngineShared>,
    backends: Arc<Backends>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
    epoch_rx: watch::Receiver<u64>,
    shutting_down: AtomicBool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_snapshot_sink(config, Box::new(NullSnapshotSink))
    }

    pub fn with_snapshot_sink(config: EngineConfig, snapshots: Box<dyn SnapshotSink>) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (epoch_tx, epoch_rx) = watch::channel(0u64);

        let shared = Arc::new(EngineShared {
            bus: Arc::new(EventBus::new(config.event_queue_capacity)),
            jobs: DashMap::new(),
            runs: RunRegistry::new(config.max_recent_runs),
            guard: OrphanGuard::new(),
            callables: CallableRegistry::new(),
            snapshots,
            completions: completions_tx,
            epoch: epoch_tx,
            config,
        });
        let backends = Arc::new(Backends::new(Arc::clone(&shared)));
        let cancel = CancellationToken::new();

        let scheduler = Scheduler::new(
            Arc::clone(&shared),
            Arc::clone(&backends),
            commands_rx,
            completions_rx,
            cancel.clone(),
        );
        let scheduler_task = tokio::spawn(scheduler.run());

        Self {
            shared,
            backends,
            commands: commands_tx,
            cancel,
            scheduler_task: Mutex::new(Some(scheduler_task)),
            epoch_rx,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Registry for in-process callables referenced by `module:entry`
    /// style targets. Registration may happen before or after `add_job`;
    /// lookup is deferred to dispatch.
    pub fn callables(&self) -> &CallableRegistry {
        &self.shared.callables
    }

    fn check_accepting(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShutdownInProgress);
        }
        Ok(())
    }

    fn send_command(&self, cmd: Command) {
        // A closed channel only happens after shutdown; commands are then
        // moot.
        let _ = self.commands.send(cmd);
    }

    // -------------------------------------------------------------------------
    // Job registration
    // -------------------------------------------------------------------------

    /// Registers a job. The target's shape is validated here; callable
    /// registry lookups are deferred to dispatch so registration order
    /// does not matter.
    pub fn add_job(
        &self,
        spec: TargetSpec,
        schedule: Schedule,
        options: JobOptions,
    ) -> Result<JobId> {
        self.check_accepting()?;
        let descriptor = Descriptor::resolve(spec)?;
        let id = options.id.clone().unwrap_or_else(JobId::generate);
        if self.shared.jobs.contains_key(&id) {
            return Err(Error::Resolution(format!("job id {id} already registered")));
        }

        let output = options
            .output
            .unwrap_or_else(|| self.shared.config.default_output.clone());
        let job = Arc::new(Job::new(
            id.clone(),
            options.name,
            Arc::new(descriptor),
            schedule,
            options.policy,
            output,
        ));
        // The first fire time is visible before this call returns, so a
        // waiter attaching right away does not see the job as settled
        // while the scheduler is still picking up the registration.
        let next = job
            .schedule()
            .next_fire(None, Utc::now(), self.shared.config.timezone);
        job.set_next_fire(next);
        tracing::info!(
            job_id = %id,
            target = %job.descriptor().target.source(),
            schedule = %job.schedule(),
            policy = %job.policy(),
            "job added"
        );
        self.shared.jobs.insert(id.clone(), Arc::clone(&job));
        self.shared.bus.publish(EngineEvent::JobAdded {
            job_id: id.clone(),
        });
        self.shared.snapshots.record_job(&job.snapshot());
        self.send_command(Command::AddJob(job));
        self.shared.bump_epoch();
        Ok(id)
    }

    /// Runs a target immediately as an implicit one-shot job. Returns
    /// both ids; the job exhausts once the run is terminal.
    ///
    /// Resolution failures that only surface at dispatch (a missing
    /// registered callable, an unspawnable program) produce a `Failed`
    /// run rather than an error here.
    pub fn run_job(&self, spec: TargetSpec, options: JobOptions) -> Result<(JobId, RunId)> {
        self.check_accepting()?;
        let descriptor = Descriptor::resolve(spec)?;
        let id = options.id.clone().unwrap_or_else(JobId::generate);
        if self.shared.jobs.contains_key(&id) {
            return Err(Error::Resolution(format!("job id {id} already registered")));
        }
        let output = options
            .output
            .unwrap_or_else(|| self.shared.config.default_output.clone());
        let job = Arc::new(Job::new(
            id.clone(),
            options.name,
            Arc::new(descriptor),
            Schedule::immediate(),
            options.policy,
            output,
        ));
        let now = Utc::now();
        job.record_fire(now);
        self.shared.jobs.insert(id.clone(), Arc::clone(&job));
        self.shared.bus.publish(EngineEvent::JobAdded {
            job_id: id.clone(),
        });
        self.shared.snapshots.record_job(&job.snapshot());

        let run = self.shared.create_run(&job, now);
        let run_id = run.id();
        tracing::info!(job_id = %id, %run_id, "ad-hoc run dispatched");
        self.backends.dispatch(run);
        Ok((id, run_id))
    }

    /// Fires an existing job now, outside its schedule. The extra run
    /// overlaps whatever is already active.
    pub fn trigger_job(&self, job_id: &JobId) -> Result<RunId> {
        self.check_accepting()?;
        let job = self.get_job(job_id).ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        let now = Utc::now();
        job.record_fire(now);
        let run = self.shared.create_run(&job, now);
        let run_id = run.id();
        self.backends.dispatch(run);
        Ok(run_id)
    }

    /// Re-executes a finished (or even live) run's target with optionally
    /// adjusted positional arguments.
    pub fn rerun(&self, run_id: RunId, args: Vec<String>, mode: ArgsMode) -> Result<RunId> {
        self.check_accepting()?;
        let run = self.get_run(run_id).ok_or(Error::RunNotFound(run_id))?;
        let job = self
            .get_job(run.job_id())
            .ok_or_else(|| Error::JobNotFound(run.job_id().to_string()))?;
        let descriptor = Arc::new(run.descriptor().bind(args, mode));
        let now = Utc::now();
        let new_run = self.shared.create_run_with(&job, now, descriptor);
        let new_id = new_run.id();
        tracing::info!(job_id = %job.id(), original = %run_id, rerun = %new_id, "rerun dispatched");
        self.backends.dispatch(new_run);
        Ok(new_id)
    }

    /// Removes a job. With `kill_running`, its in-flight runs are killed;
    /// otherwise they finish unobserved. Either way the job's run history
    /// is dropped.
    pub fn remove_job(&self, job_id: &JobId, kill_running: bool) -> Result<()> {
        self.check_accepting()?;
        let (id, job) = self
            .shared
            .jobs
            .remove(job_id)
            .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?;
        job.set_next_fire(None);

        if kill_running {
            for run in self.shared.runs.active_for_job(&id) {
                self.kill_run_inner(&run);
            }
        }
        self.send_command(Command::RemoveJob(id.clone()));
        self.shared.runs.remove_job(&id);
        self.shared.bus.publish(EngineEvent::JobRemoved { job_id: id });
        self.shared.snapshots.record_job(&job.snapshot());
        self.shared.bump_epoch();
        Ok(())
    }

    /// Stops a job's scheduling. History and identity are retained; runs
    /// already in flight are unaffected.
    pub fn stop_job(&self, job_id: &JobId) -> Result<()> {
        self.check_accepting()?;
        if !self.shared.jobs.contains_key(job_id) {
            return Err(Error::JobNotFound(job_id.to_string()));
        }
        tracing::info!(%job_id, "job stopped");
        self.send_command(Command::StopJob(job_id.clone()));
        Ok(())
    }

    /// Resumes a stopped job. Fire times missed while stopped are
    /// dropped, not replayed.
    pub fn resume_job(&self, job_id: &JobId) -> Result<()> {
        self.check_accepting()?;
        if !self.shared.jobs.contains_key(job_id) {
            return Err(Error::JobNotFound(job_id.to_string()));
        }
        tracing::info!(%job_id, "job resumed");
        self.send_command(Command::ResumeJob(job_id.clone()));
        Ok(())
    }

    /// Replaces a job's schedule; the next fire time is recomputed
    /// immediately. Rescheduling an exhausted job with a schedule that
    /// still has occurrences reactivates it.
    pub fn reschedule_job(&self, job_id: &JobId, schedule: Schedule) -> Result<()> {
        self.check_accepting()?;
        if !self.shared.jobs.contains_key(job_id) {
            return Err(Error::JobNotFound(job_id.to_string()));
        }
        tracing::info!(%job_id, schedule = %schedule, "job rescheduled");
        self.send_command(Command::Reschedule(job_id.clone(), schedule));
        Ok(())
    }

    /// Removes exhausted jobs (and their history). Returns how many were
    /// pruned.
    pub fn prune_jobs(&self) -> Result<usize> {
        self.check_accepting()?;
        let exhausted: Vec<JobId> = self
            .shared
            .jobs
            .iter()
            .filter(|e| e.value().state() == JobState::Exhausted)
            .map(|e| e.key().clone())
            .collect();
        let mut pruned = 0;
        for id in exhausted {
            if self.remove_job(&id, false).is_ok() {
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    // -------------------------------------------------------------------------
    // Run control
    // -------------------------------------------------------------------------

    /// Graceful stop: cooperative cancel plus SIGTERM, escalating to
    /// SIGKILL after the grace period. Idempotent; stopping a terminal
    /// run is a no-op.
    pub async fn stop_run(&self, run_id: RunId) -> Result<()> {
        let run = self.get_run(run_id).ok_or(Error::RunNotFound(run_id))?;
        if run.state().is_terminal() {
            return Ok(());
        }
        run.request_kill();
        if run.state() == RunState::Pending {
            self.shared.finalize_run(&run, RunState::Killed, RunOutcome {
                exit_code: None,
                error: Some("stopped before dispatch".to_string()),
            });
            return Ok(());
        }
        self.shared
            .guard
            .stop(run_id, self.shared.config.stop_grace_period)
            .await;
        Ok(())
    }

    /// Immediate kill: cooperative cancel plus SIGKILL to the process
    /// group. Idempotent.
    pub fn kill_run(&self, run_id: RunId) -> Result<()> {
        let run = self.get_run(run_id).ok_or(Error::RunNotFound(run_id))?;
        self.kill_run_inner(&run);
        Ok(())
    }

    fn kill_run_inner(&self, run: &Arc<Run>) {
        if run.state().is_terminal() {
            return;
        }
        run.request_kill();
        if run.state() == RunState::Pending {
            self.shared.finalize_run(run, RunState::Killed, RunOutcome {
                exit_code: None,
                error: Some("killed before dispatch".to_string()),
            });
            return;
        }
        self.shared.guard.kill(run.id());
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get_job(&self, job_id: &JobId) -> Option<Arc<Job>> {
        self.shared.jobs.get(job_id).map(|j| Arc::clone(j.value()))
    }

    /// First job whose name matches. Names are not enforced unique; use
    /// ids when they must be.
    pub fn get_job_by_name(&self, name: &str) -> Option<Arc<Job>> {
        self.shared
            .jobs
            .iter()
            .find(|e| e.value().name() == Some(name))
            .map(|e| Arc::clone(e.value()))
    }

    pub fn list_jobs(&self, filter: JobFilter) -> Vec<Arc<Job>> {
        let mut jobs: Vec<Arc<Job>> = self
            .shared
            .jobs
            .iter()
            .filter(|e| filter.matches(e.value().state()))
            .map(|e| Arc::clone(e.value()))
            .collect();
        jobs.sort_by_key(|j| j.created_at());
        jobs
    }

    pub fn get_run(&self, run_id: RunId) -> Option<Arc<Run>> {
        self.shared.runs.get(run_id)
    }

    /// Runs for a job, most recent first.
    pub fn list_runs(&self, job_id: &JobId) -> Vec<Arc<Run>> {
        self.shared.runs.runs_for_job(job_id)
    }

    /// Accumulated raw output of a run.
    pub fn get_output(&self, run_id: RunId, mode: ReadMode) -> Result<Bytes> {
        let run = self.get_run(run_id).ok_or(Error::RunNotFound(run_id))?;
        Ok(run.sink().read(mode))
    }

    /// Accumulated output decoded to text (lossily).
    pub fn get_output_text(&self, run_id: RunId, mode: ReadMode) -> Result<String> {
        let run = self.get_run(run_id).ok_or(Error::RunNotFound(run_id))?;
        Ok(run.sink().read_text(mode))
    }

    /// Follows a run's output: buffered history first, then live chunks.
    pub fn subscribe_output(&self, run_id: RunId) -> Result<OutputSubscription> {
        let run = self.get_run(run_id).ok_or(Error::RunNotFound(run_id))?;
        Ok(run.sink().subscribe())
    }

    /// Number of child processes currently alive under the engine.
    pub fn live_process_count(&self) -> usize {
        self.shared.guard.live_count()
    }

    /// Subscribes to engine events for a topic.
    pub fn subscribe(&self, topic: Topic) -> EventSubscription {
        self.shared.bus.subscribe(topic)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.shared.bus.unsubscribe(id);
    }

    // -------------------------------------------------------------------------
    // Waiting
    // -------------------------------------------------------------------------

    /// Waits until a run reaches a terminal state.
    pub async fn wait_run(&self, run_id: RunId, timeout: Option<Duration>) -> Result<WaitOutcome> {
        let run = self.get_run(run_id).ok_or(Error::RunNotFound(run_id))?;
        let mut rx = run.watch_state();
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            if rx.borrow_and_update().is_terminal() {
                return Ok(WaitOutcome::Completed);
            }
            if !wait_changed(&mut rx, deadline).await {
                return Ok(WaitOutcome::TimedOut);
            }
        }
    }

    /// Waits until a job has no live or queued run and no future fire.
    /// For recurring schedules this only returns via the timeout.
    pub async fn wait_job(&self, job_id: &JobId, timeout: Option<Duration>) -> Result<WaitOutcome> {
        if !self.shared.jobs.contains_key(job_id) {
            return Err(Error::JobNotFound(job_id.to_string()));
        }
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut rx = self.epoch_rx.clone();
        loop {
            rx.borrow_and_update();
            let idle = match self.get_job(job_id) {
                Some(job) => {
                    !self.shared.runs.has_active(job_id) && job.next_fire().is_none()
                }
                // Removed while waiting counts as settled.
                None => true,
            };
            if idle {
                return Ok(WaitOutcome::Completed);
            }
            if !wait_epoch(&mut rx, deadline).await {
                return Ok(WaitOutcome::TimedOut);
            }
        }
    }

    /// Waits until no run anywhere is live or queued.
    pub async fn wait_all(&self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut rx = self.epoch_rx.clone();
        loop {
            rx.borrow_and_update();
            if self.shared.runs.active_runs().is_empty() {
                return WaitOutcome::Completed;
            }
            if !wait_epoch(&mut rx, deadline).await {
                return WaitOutcome::TimedOut;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Shuts the engine down: stops scheduling, kills queued and live
    /// runs, sweeps every registered child process, and closes event
    /// streams. Further mutating calls fail with
    /// [`Error::ShutdownInProgress`].
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("engine shutting down");
        self.cancel.cancel();

        for run in self.shared.runs.active_runs() {
            run.request_kill();
            if run.state() == RunState::Pending {
                self.shared.finalize_run(&run, RunState::Killed, RunOutcome {
                    exit_code: None,
                    error: Some("engine shutdown".to_string()),
                });
            }
        }

        let grace = self.shared.config.stop_grace_period;
        self.shared.guard.sweep(grace, grace).await;
        // Thread-backed runs are cooperative; give them the same grace.
        let _ = self.wait_all(Some(grace)).await;

        let task = self
            .scheduler_task
            .lock()
            .expect("scheduler task lock poisoned")
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.shared.bus.close_all();
        tracing::info!("engine shutdown complete");
    }
}

/// Waits for a state change, bounded by an optional deadline. Returns
/// false on timeout or a closed channel.
async fn wait_changed(
    rx: &mut watch::Receiver<RunState>,
    deadline: Option<tokio::time::Instant>,
) -> bool {
    match deadline {
        Some(deadline) => matches!(
            tokio::time::timeout_at(deadline, rx.changed()).await,
            Ok(Ok(()))
        ),
        None => rx.changed().await.is_ok(),
    }
}

async fn wait_epoch(rx: &mut watch::Receiver<u64>, deadline: Option<tokio::time::Instant>) -> bool {
    match deadline {
        Some(deadline) => matches!(
            tokio::time::timeout_at(deadline, rx.changed()).await,
            Ok(Ok(()))
        ),
        None => rx.changed().await.is_ok(),
    }
}
