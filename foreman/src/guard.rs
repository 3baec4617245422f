//! Orphan-prevention guard for process-backed runs.
//!
//! Every spawned process is registered here for the exact interval it is
//! alive: registered before work starts, deregistered when the run reaches
//! a terminal state. The shutdown sweep signals everything still
//! registered, so no child outlives the engine unawares.
//!
//! Signals go to the process *group* (children spawn into their own
//! group), so grandchildren forked by the target die with it.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;

use crate::run::RunId;

/// Identity of a live child process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    /// Process group id; equals the pid because children are spawned as
    /// group leaders.
    pub pgid: u32,
}

/// Registry of live child processes, keyed by run.
#[derive(Default)]
pub struct OrphanGuard {
    live: DashMap<RunId, ProcessHandle>,
    drained: Notify,
}

impl OrphanGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a spawned child. Called by the process backend before it
    /// begins pumping output.
    pub(crate) fn register(&self, run_id: RunId, handle: ProcessHandle) {
        tracing::debug!(%run_id, pid = handle.pid, "registering child process");
        self.live.insert(run_id, handle);
    }

    /// Deregisters a child once its run is terminal.
    pub(crate) fn deregister(&self, run_id: RunId) {
        if self.live.remove(&run_id).is_some() {
            tracing::debug!(%run_id, "deregistered child process");
            self.drained.notify_waiters();
        }
    }

    pub fn handle_for(&self, run_id: RunId) -> Option<ProcessHandle> {
        self.live.get(&run_id).map(|h| *h.value())
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Graceful stop: SIGTERM now, escalate to SIGKILL if the process is
    /// still registered when the grace period expires. Returns as soon as
    /// the backend deregisters the child.
    pub(crate) async fn stop(&self, run_id: RunId, grace: Duration) {
        let Some(handle) = self.handle_for(run_id) else {
            return;
        };
        signal_group(handle, Signal::Term);
        let deadline = tokio::time::Instant::now() + grace;
        while self.live.contains_key(&run_id) {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.live.contains_key(&run_id) {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }
        if self.live.contains_key(&run_id) {
            tracing::warn!(%run_id, pid = handle.pid, "grace period expired, escalating to SIGKILL");
            signal_group(handle, Signal::Kill);
        }
    }

    /// Immediate SIGKILL to the run's process group.
    pub(crate) fn kill(&self, run_id: RunId) {
        if let Some(handle) = self.handle_for(run_id) {
            signal_group(handle, Signal::Kill);
        }
    }

    /// Shutdown sweep: gracefully stop every registered child, then wait
    /// (bounded) for their backends to deregister them.
    pub(crate) async fn sweep(&self, grace: Duration, drain_timeout: Duration) {
        let handles: Vec<(RunId, ProcessHandle)> =
            self.live.iter().map(|e| (*e.key(), *e.value())).collect();
        if handles.is_empty() {
            return;
        }
        tracing::info!(count = handles.len(), "sweeping live child processes");
        for (_, handle) in &handles {
            signal_group(*handle, Signal::Term);
        }

        let deadline = tokio::time::Instant::now() + grace;
        while !self.live.is_empty() && tokio::time::Instant::now() < deadline {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.live.is_empty() {
                break;
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }

        if !self.live.is_empty() {
            for entry in self.live.iter() {
                signal_group(*entry.value(), Signal::Kill);
            }
            let deadline = tokio::time::Instant::now() + drain_timeout;
            while !self.live.is_empty() && tokio::time::Instant::now() < deadline {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.live.is_empty() {
                    break;
                }
                let _ = tokio::time::timeout_at(deadline, notified).await;
            }
        }
        if !self.live.is_empty() {
            tracing::error!(count = self.live.len(), "child processes survived shutdown sweep");
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(handle: ProcessHandle, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // Negative errno here usually means the group already exited.
    let rc = unsafe { libc::killpg(handle.pgid as libc::pid_t, sig) };
    if rc != 0 {
        tracing::debug!(pgid = handle.pgid, ?signal, "killpg failed (group likely gone)");
    }
}

#[cfg(not(unix))]
fn signal_group(handle: ProcessHandle, signal: Signal) {
    // No process groups off unix; the backend's kill-on-drop handles the
    // direct child and grandchildren are best-effort.
    tracing::debug!(pid = handle.pid, ?signal, "process-group signalling unavailable");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_deregister_cycle() {
        let guard = OrphanGuard::new();
        let id = RunId(1);
        guard.register(id, ProcessHandle { pid: 4242, pgid: 4242 });
        assert_eq!(guard.live_count(), 1);
        assert_eq!(guard.handle_for(id).unwrap().pid, 4242);

        guard.deregister(id);
        assert_eq!(guard.live_count(), 0);
        assert!(guard.handle_for(id).is_none());
    }

    #[test]
    fn test_deregister_unknown_run_is_noop() {
        let guard = OrphanGuard::new();
        guard.deregister(RunId(99));
        assert_eq!(guard.live_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_on_empty_guard_returns_immediately() {
        let guard = OrphanGuard::new();
        guard
            .sweep(Duration::from_secs(5), Duration::from_secs(5))
            .await;
    }

    #[tokio::test]
    async fn test_stop_unknown_run_is_noop() {
        let guard = OrphanGuard::new();
        guard.stop(RunId(7), Duration::from_millis(1)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_returns_once_child_deregisters() {
        use std::os::unix::process::CommandExt;
        use std::sync::Arc;

        let mut cmd = std::process::Command::new("sleep");
        cmd.arg("30").process_group(0);
        let mut child = cmd.spawn().unwrap();
        let pid = child.id();

        let guard = Arc::new(OrphanGuard::new());
        let id = RunId(11);
        guard.register(id, ProcessHandle { pid, pgid: pid });

        // Stands in for the backend: reap the terminated child, then
        // deregister it.
        let reaper = Arc::clone(&guard);
        let waiter = tokio::task::spawn_blocking(move || {
            let _ = child.wait();
            reaper.deregister(id);
        });

        let started = std::time::Instant::now();
        guard.stop(id, Duration::from_secs(30)).await;
        // Must return on deregistration, well before the grace expires.
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(guard.live_count(), 0);
        waiter.await.unwrap();
    }
}
