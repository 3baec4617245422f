//! OS-process execution backend.
//!
//! Spawns the target as a child in its own process group with piped
//! stdout/stderr, pumps output incrementally into the run's sink, and
//! registers the child with the orphan guard for the exact interval it is
//! alive. Kill requests are delivered as signals by the guard; `wait`
//! observes the death and the exit is mapped to `Killed` when a kill was
//! requested first.

use std::process::Stdio;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use super::context::OutputWriter;
use crate::engine::EngineShared;
use crate::guard::ProcessHandle;
use crate::run::{Run, RunOutcome, RunState};
use crate::sink::StreamKind;

const READ_BUF_SIZE: usize = 8192;

/// Runs a process-backed target to its terminal state.
pub(crate) async fn execute(
    shared: &Arc<EngineShared>,
    interpreter: &str,
    run: &Arc<Run>,
    writer: OutputWriter,
) {
    let (program, args) = match run.descriptor().command_line(interpreter) {
        Ok(cmd) => cmd,
        Err(err) => {
            shared.finalize_run(run, RunState::Failed, RunOutcome {
                exit_code: None,
                error: Some(err.to_string()),
            });
            return;
        }
    };

    let mut command = Command::new(&program);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &run.descriptor().cwd {
        command.current_dir(cwd);
    }
    // Own process group, so signals reach forked grandchildren too.
    #[cfg(unix)]
    command.process_group(0);

    tracing::debug!(run_id = %run.id(), %program, ?args, "spawning process");
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            shared.finalize_run(run, RunState::Failed, RunOutcome {
                exit_code: None,
                error: Some(format!("failed to spawn {program:?}: {err}")),
            });
            return;
        }
    };

    let registered = match child.id() {
        Some(pid) => {
            shared.guard.register(run.id(), ProcessHandle { pid, pgid: pid });
            true
        }
        None => false,
    };
    // A kill issued before registration had no group to signal; deliver
    // it now.
    if run.kill_requested() {
        shared.guard.kill(run.id());
    }

    let (state, outcome) = pump_and_wait(run, &mut child, writer).await;

    if registered {
        shared.guard.deregister(run.id());
    }
    shared.finalize_run(run, state, outcome);
}

/// Streams both pipes until EOF and waits for the exit status.
async fn pump_and_wait(
    run: &Arc<Run>,
    child: &mut Child,
    writer: OutputWriter,
) -> (RunState, RunOutcome) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let mut readers = Vec::new();
    if let Some(stdout) = stdout {
        readers.push(tokio::spawn(pump(stdout, StreamKind::Stdout, writer.clone())));
    }
    if let Some(stderr) = stderr {
        readers.push(tokio::spawn(pump(stderr, StreamKind::Stderr, writer)));
    }

    let status = child.wait().await;
    // Drain remaining buffered output before recording the outcome.
    for reader in readers {
        let _ = reader.await;
    }

    match status {
        Ok(status) if status.success() => {
            if run.kill_requested() {
                // Kill raced a natural success; the kill verdict stands.
                (RunState::Killed, RunOutcome {
                    exit_code: status.code(),
                    error: None,
                })
            } else {
                (RunState::Succeeded, RunOutcome {
                    exit_code: status.code(),
                    error: None,
                })
            }
        }
        Ok(status) => {
            if run.kill_requested() {
                (RunState::Killed, RunOutcome {
                    exit_code: status.code(),
                    error: None,
                })
            } else {
                (RunState::Failed, RunOutcome {
                    exit_code: status.code(),
                    error: Some(describe_exit(&status)),
                })
            }
        }
        Err(err) => (RunState::Failed, RunOutcome {
            exit_code: None,
            error: Some(format!("wait failed: {err}")),
        }),
    }
}

async fn pump<R>(mut reader: R, stream: StreamKind, writer: OutputWriter)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => writer.write(stream, &buf[..n]),
            Err(err) => {
                tracing::debug!(%stream, "output pipe read failed: {err}");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn describe_exit(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exited with code {code}"),
        (None, Some(signal)) => format!("terminated by signal {signal}"),
        (None, None) => "exited abnormally".to_string(),
    }
}

#[cfg(not(unix))]
fn describe_exit(status: &std::process::ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exited with code {code}"),
        None => "exited abnormally".to_string(),
    }
}
