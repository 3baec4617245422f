//! End-to-end engine tests: real processes, real threads, real timing.
//!
//! Process-backed cases shell out to `echo`/`sleep`/`sh` and are
//! unix-only.

use std::sync::Arc;
use std::time::Duration;

use foreman::{
    ArgsMode, ConcurrencyPolicy, Engine, EngineConfig, EngineEvent, JobFilter, JobOptions,
    ReadMode, RunState, Schedule, TargetSpec, Topic, WaitOutcome,
};

fn engine() -> Engine {
    Engine::new(EngineConfig::default())
}

/// Polls until the run leaves `Pending`, so kill paths hit a live child.
async fn wait_until_running(engine: &Engine, run_id: foreman::RunId) {
    for _ in 0..500 {
        let state = engine.get_run(run_id).unwrap().state();
        if state == RunState::Running {
            return;
        }
        assert!(!state.is_terminal(), "run finished before it was observed running");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run never started");
}

/// The exhaust transition happens in the scheduler loop shortly after the
/// final run completes; poll rather than race it.
async fn wait_until_exhausted(engine: &Engine, job_id: &foreman::JobId) {
    for _ in 0..500 {
        if engine.get_job(job_id).unwrap().state() == foreman::JobState::Exhausted {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job never exhausted");
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_ad_hoc_echo_run_captures_output() {
    let engine = engine();
    let (job_id, run_id) = engine
        .run_job(
            TargetSpec::command("echo hello"),
            JobOptions::new(ConcurrencyPolicy::Overlap),
        )
        .unwrap();

    let outcome = engine.wait_run(run_id, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(outcome, WaitOutcome::Completed);

    let run = engine.get_run(run_id).unwrap();
    assert_eq!(run.state(), RunState::Succeeded);
    assert_eq!(run.outcome().unwrap().exit_code, Some(0));

    let text = engine.get_output_text(run_id, ReadMode::Full).unwrap();
    assert_eq!(text, "hello\n");

    // The implicit one-shot job exhausts once its run is terminal.
    engine
        .wait_job(&job_id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    wait_until_exhausted(&engine, &job_id).await;
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_registered_callable_runs_in_process() {
    let engine = engine();
    engine.callables().register("tasks.report:main", |ctx| {
        ctx.print(&format!("report for {}", ctx.kwarg("region").unwrap_or("all")));
        Ok(())
    });

    let (_, run_id) = engine
        .run_job(
            TargetSpec::command("tasks.report:main").with_kwargs([("region", "emea")]),
            JobOptions::new(ConcurrencyPolicy::Overlap),
        )
        .unwrap();

    engine.wait_run(run_id, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(engine.get_run(run_id).unwrap().state(), RunState::Succeeded);
    assert_eq!(
        engine.get_output_text(run_id, ReadMode::Full).unwrap(),
        "report for emea\n"
    );
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_callable_fails_run_but_not_registration() {
    let engine = engine();

    // Dispatch-time resolution failure lands on the run.
    let (_, run_id) = engine
        .run_job(
            TargetSpec::command("no.such.module:main"),
            JobOptions::new(ConcurrencyPolicy::Overlap),
        )
        .unwrap();
    engine.wait_run(run_id, Some(Duration::from_secs(10))).await.unwrap();

    let run = engine.get_run(run_id).unwrap();
    assert_eq!(run.state(), RunState::Failed);
    let error = run.outcome().unwrap().error.unwrap();
    assert!(error.contains("no callable registered"), "got: {error}");

    // The engine is unharmed; registration still works.
    let job_id = engine
        .add_job(
            TargetSpec::command("echo ok"),
            Schedule::immediate(),
            JobOptions::new(ConcurrencyPolicy::Skip),
        )
        .unwrap();
    assert!(engine.get_job(&job_id).is_some());
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_callable_panic_fails_only_its_run() {
    let engine = engine();
    engine
        .callables()
        .register("tasks.boom:main", |_ctx| panic!("kaboom"));

    let (_, run_id) = engine
        .run_job(
            TargetSpec::command("tasks.boom:main"),
            JobOptions::new(ConcurrencyPolicy::Overlap),
        )
        .unwrap();
    engine.wait_run(run_id, Some(Duration::from_secs(10))).await.unwrap();

    let run = engine.get_run(run_id).unwrap();
    assert_eq!(run.state(), RunState::Failed);
    assert!(run.outcome().unwrap().error.unwrap().contains("kaboom"));

    // The engine still dispatches after a panic.
    engine.callables().register("tasks.fine:main", |_ctx| Ok(()));
    let (_, ok_run) = engine
        .run_job(
            TargetSpec::command("tasks.fine:main"),
            JobOptions::new(ConcurrencyPolicy::Overlap),
        )
        .unwrap();
    engine.wait_run(ok_run, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(engine.get_run(ok_run).unwrap().state(), RunState::Succeeded);
    engine.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_skip_policy_drops_ticks_while_run_active() {
    let engine = engine();
    let events = engine.subscribe(Topic::All);

    let job_id = engine
        .add_job(
            TargetSpec::command("sleep 2"),
            Schedule::interval(Duration::from_millis(100)).unwrap(),
            JobOptions::new(ConcurrencyPolicy::Skip),
        )
        .unwrap();

    // First fire at ~100ms; fires at 200..700ms land mid-run and skip.
    tokio::time::sleep(Duration::from_millis(750)).await;
    engine.stop_job(&job_id).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(engine.list_runs(&job_id).len(), 1);

    let mut skipped = 0;
    while let Some(event) = events.try_recv() {
        if matches!(event, EngineEvent::TickSkipped { .. }) {
            skipped += 1;
        }
    }
    assert!(skipped >= 2, "expected skipped ticks, saw {skipped}");
    engine.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_queue_policy_never_overlaps_runs() {
    let engine = engine();
    let job_id = engine
        .add_job(
            TargetSpec::command("sleep 0.2"),
            Schedule::interval(Duration::from_millis(100)).unwrap(),
            JobOptions::new(ConcurrencyPolicy::Queue),
        )
        .unwrap();
    let events = engine.subscribe(Topic::Job(job_id.clone()));

    tokio::time::sleep(Duration::from_millis(700)).await;
    engine.remove_job(&job_id, true).unwrap();
    engine.wait_all(Some(Duration::from_secs(10))).await;

    // Replay the event stream: at most one run is ever started-but-not-
    // finished, and more than one run actually executed.
    let mut started = std::collections::HashSet::new();
    let mut live = 0usize;
    let mut total_started = 0usize;
    while let Some(event) = events.try_recv() {
        match event {
            EngineEvent::RunStarted { run_id, .. } => {
                started.insert(run_id);
                live += 1;
                total_started += 1;
                assert!(live <= 1, "queued runs overlapped");
            }
            EngineEvent::RunFinished { run_id, .. } => {
                if started.remove(&run_id) {
                    live -= 1;
                }
            }
            _ => {}
        }
    }
    assert!(total_started >= 2, "expected queued runs to execute, saw {total_started}");
    engine.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_kill_run_is_immediate_and_idempotent() {
    let engine = engine();
    let (_, run_id) = engine
        .run_job(
            TargetSpec::command("sleep 30"),
            JobOptions::new(ConcurrencyPolicy::Overlap),
        )
        .unwrap();
    wait_until_running(&engine, run_id).await;
    assert_eq!(engine.live_process_count(), 1);

    engine.kill_run(run_id).unwrap();
    engine.wait_run(run_id, Some(Duration::from_secs(10))).await.unwrap();

    let run = engine.get_run(run_id).unwrap();
    assert_eq!(run.state(), RunState::Killed);
    assert_eq!(engine.live_process_count(), 0);

    // Killing an already-terminal run is a no-op.
    engine.kill_run(run_id).unwrap();
    assert_eq!(engine.get_run(run_id).unwrap().state(), RunState::Killed);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_callable_observes_cooperative_cancel() {
    let engine = engine();
    engine.callables().register("tasks.poll:main", |ctx| {
        for _ in 0..500 {
            if ctx.is_cancelled() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Err("never cancelled".into())
    });

    let (_, run_id) = engine
        .run_job(
            TargetSpec::command("tasks.poll:main"),
            JobOptions::new(ConcurrencyPolicy::Overlap),
        )
        .unwrap();
    wait_until_running(&engine, run_id).await;

    engine.kill_run(run_id).unwrap();
    engine.wait_run(run_id, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(engine.get_run(run_id).unwrap().state(), RunState::Killed);
    engine.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_mid_run_subscriber_replays_then_tails() {
    let engine = engine();
    let events = engine.subscribe(Topic::All);

    let (_, run_id) = engine
        .run_job(
            TargetSpec::command("echo first; sleep 0.3; echo second").shell(true),
            JobOptions::new(ConcurrencyPolicy::Overlap),
        )
        .unwrap();

    // Attach only after the first chunk has already been captured.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        if matches!(event, EngineEvent::RunOutput { .. }) {
            break;
        }
    }
    let output = engine.subscribe_output(run_id).unwrap();

    let mut collected = Vec::new();
    while let Some(chunk) = tokio::time::timeout(Duration::from_secs(10), output.recv())
        .await
        .unwrap()
    {
        collected.extend_from_slice(&chunk.data);
    }
    assert_eq!(&collected[..], b"first\nsecond\n");
    assert_eq!(output.dropped(), 0);
    engine.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_rerun_append_and_replace() {
    let engine = engine();
    let (_, base) = engine
        .run_job(
            TargetSpec::command("echo").with_args(["base"]),
            JobOptions::new(ConcurrencyPolicy::Overlap),
        )
        .unwrap();
    engine.wait_run(base, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(engine.get_output_text(base, ReadMode::Full).unwrap(), "base\n");

    let appended = engine
        .rerun(base, vec!["extra".to_string()], ArgsMode::Append)
        .unwrap();
    engine.wait_run(appended, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(
        engine.get_output_text(appended, ReadMode::Full).unwrap(),
        "base extra\n"
    );

    let replaced = engine
        .rerun(base, vec!["only".to_string()], ArgsMode::Replace)
        .unwrap();
    engine.wait_run(replaced, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(
        engine.get_output_text(replaced, ReadMode::Full).unwrap(),
        "only\n"
    );
    engine.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_stop_and_resume_job() {
    let engine = engine();
    let job_id = engine
        .add_job(
            TargetSpec::command("echo tick"),
            Schedule::interval(Duration::from_millis(100)).unwrap(),
            JobOptions::new(ConcurrencyPolicy::Skip),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    engine.stop_job(&job_id).unwrap();
    // Let in-flight state settle before sampling.
    engine.wait_all(Some(Duration::from_secs(10))).await;
    let stopped_count = engine.list_runs(&job_id).len();
    assert!(stopped_count >= 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(engine.list_runs(&job_id).len(), stopped_count, "stopped job still fired");
    assert_eq!(engine.get_job(&job_id).unwrap().state(), foreman::JobState::Stopped);

    engine.resume_job(&job_id).unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        engine.list_runs(&job_id).len() > stopped_count,
        "resumed job never fired"
    );
    engine.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_queued_runs_dispatch_after_stop_and_resume() {
    let engine = engine();
    let job_id = engine
        .add_job(
            TargetSpec::command("sleep 0.5"),
            Schedule::interval(Duration::from_millis(100)).unwrap(),
            JobOptions::new(ConcurrencyPolicy::Queue),
        )
        .unwrap();

    // First run starts at ~100ms; fires at 200ms and 300ms queue behind it.
    tokio::time::sleep(Duration::from_millis(350)).await;
    engine.stop_job(&job_id).unwrap();

    // Let the active run finish while the job is stopped; the queued runs
    // must survive as pending.
    let mut pending = Vec::new();
    for _ in 0..500 {
        let runs = engine.list_runs(&job_id);
        let active = runs.iter().any(|r| r.state() == RunState::Running);
        pending = runs
            .iter()
            .filter(|r| r.state() == RunState::Pending)
            .map(|r| r.id())
            .collect();
        if !active && !pending.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!pending.is_empty(), "no runs were queued before the stop");

    engine.resume_job(&job_id).unwrap();
    for run_id in pending {
        let outcome = engine
            .wait_run(run_id, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Completed, "queued {run_id} never dispatched");
    }
    engine.remove_job(&job_id, true).unwrap();
    engine.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_remove_job_kills_running_work() {
    let engine = engine();
    let (job_id, run_id) = engine
        .run_job(
            TargetSpec::command("sleep 30"),
            JobOptions::new(ConcurrencyPolicy::Overlap),
        )
        .unwrap();
    wait_until_running(&engine, run_id).await;

    engine.remove_job(&job_id, true).unwrap();
    assert!(engine.get_job(&job_id).is_none());

    // History went with the job; the child must not linger.
    assert!(engine.get_run(run_id).is_none());
    for _ in 0..100 {
        if engine.live_process_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(engine.live_process_count(), 0);
    engine.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_wait_run_times_out_then_completes() {
    let engine = engine();
    let (_, run_id) = engine
        .run_job(
            TargetSpec::command("sleep 30"),
            JobOptions::new(ConcurrencyPolicy::Overlap),
        )
        .unwrap();

    let outcome = engine
        .wait_run(run_id, Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);

    engine.kill_run(run_id).unwrap();
    let outcome = engine.wait_run(run_id, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(outcome, WaitOutcome::Completed);
    engine.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_sweeps_live_processes() {
    let engine = Arc::new(engine());
    let (job_id, run_id) = engine
        .run_job(
            TargetSpec::command("sleep 30"),
            JobOptions::new(ConcurrencyPolicy::Overlap),
        )
        .unwrap();
    wait_until_running(&engine, run_id).await;
    assert_eq!(engine.live_process_count(), 1);

    engine.shutdown().await;

    assert_eq!(engine.live_process_count(), 0);
    assert_eq!(engine.get_run(run_id).unwrap().state(), RunState::Killed);

    // Mutations after shutdown are rejected.
    let err = engine
        .run_job(
            TargetSpec::command("echo late"),
            JobOptions::new(ConcurrencyPolicy::Overlap),
        )
        .unwrap_err();
    assert!(matches!(err, foreman::Error::ShutdownInProgress));
    assert!(matches!(
        engine.stop_job(&job_id),
        Err(foreman::Error::ShutdownInProgress)
    ));
    assert!(matches!(
        engine.remove_job(&job_id, false),
        Err(foreman::Error::ShutdownInProgress)
    ));
    assert!(matches!(
        engine.prune_jobs(),
        Err(foreman::Error::ShutdownInProgress)
    ));
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_reschedule_takes_effect_immediately() {
    let engine = engine();
    let job_id = engine
        .add_job(
            TargetSpec::command("echo tick"),
            Schedule::interval(Duration::from_secs(3600)).unwrap(),
            JobOptions::new(ConcurrencyPolicy::Skip).named("hourly"),
        )
        .unwrap();
    assert!(engine.get_job_by_name("hourly").is_some());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(engine.list_runs(&job_id).is_empty());

    engine
        .reschedule_job(&job_id, Schedule::interval(Duration::from_millis(100)).unwrap())
        .unwrap();
    for _ in 0..100 {
        if !engine.list_runs(&job_id).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!engine.list_runs(&job_id).is_empty(), "rescheduled job never fired");
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_job_pends_on_freshly_added_job() {
    let engine = engine();
    let job_id = engine
        .add_job(
            TargetSpec::command("echo tick"),
            Schedule::interval(Duration::from_secs(3600)).unwrap(),
            JobOptions::new(ConcurrencyPolicy::Skip),
        )
        .unwrap();

    // The first fire time is set before add_job returns, so an immediate
    // wait does not mistake the job for settled.
    let outcome = engine
        .wait_job(&job_id, Some(Duration::from_millis(100)))
        .await
        .unwrap();
    assert_eq!(outcome, WaitOutcome::TimedOut);
    engine.shutdown().await;
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn test_exhausted_jobs_can_be_pruned() {
    let engine = engine();
    let (job_id, run_id) = engine
        .run_job(
            TargetSpec::command("echo done"),
            JobOptions::new(ConcurrencyPolicy::Overlap),
        )
        .unwrap();
    engine.wait_run(run_id, Some(Duration::from_secs(10))).await.unwrap();
    engine.wait_job(&job_id, Some(Duration::from_secs(10))).await.unwrap();
    wait_until_exhausted(&engine, &job_id).await;

    assert_eq!(engine.list_jobs(JobFilter::Exhausted).len(), 1);
    assert_eq!(engine.prune_jobs().unwrap(), 1);
    assert!(engine.get_job(&job_id).is_none());
    assert!(engine.list_jobs(JobFilter::All).is_empty());
    engine.shutdown().await;
}
