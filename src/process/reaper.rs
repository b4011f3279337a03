//! Process-exit notifier
//!
//! A single background task watches for `SIGCHLD` and reaps registered
//! children with non-blocking `waitpid`, dispatching one callback per pid.
//! Only registered pids are reaped, so children owned by other subsystems
//! (the D-Bus proxy supervisor waits on its own child) are never stolen.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exit codes for signal-terminated processes are reported as base + signo
pub const SIGNAL_EXIT_BASE: i32 = 128;

/// Reported when the child's real status could not be observed (pid was
/// already gone at registration time)
pub const UNKNOWN_EXIT_CODE: i32 = 255;

type ExitCallback = Box<dyn FnOnce(i32, i32) + Send + Sync>;

/// Dispatches at most one exit callback per registered pid.
#[derive(Clone)]
pub struct ExitNotifier {
    listeners: Arc<DashMap<i32, ExitCallback>>,
    token: CancellationToken,
}

impl ExitNotifier {
    /// Create the notifier and start its reaper task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let notifier = Self {
            listeners: Arc::new(DashMap::new()),
            token: CancellationToken::new(),
        };

        notifier.spawn_reaper();
        notifier
    }

    /// Register a callback invoked once with `(pid, exit_code)` when the
    /// process exits. A repeated registration for the same pid replaces the
    /// previous callback.
    ///
    /// If the pid no longer exists the callback is invoked immediately.
    pub fn register<F>(&self, pid: i32, callback: F)
    where
        F: FnOnce(i32, i32) + Send + Sync + 'static,
    {
        self.listeners.insert(pid, Box::new(callback));

        // The child may already be gone; try to deliver right away
        self.try_reap(pid);
    }

    /// Remove a pending registration; no callback will fire for this pid.
    pub fn cancel(&self, pid: i32) {
        self.listeners.remove(&pid);
    }

    /// Number of pids currently being watched
    pub fn pending(&self) -> usize {
        self.listeners.len()
    }

    /// Stop the reaper task
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    fn spawn_reaper(&self) {
        let listeners = self.listeners.clone();
        let token = self.token.clone();

        tokio::spawn(async move {
            let mut sigchld = match signal(SignalKind::child()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("Could not install SIGCHLD handler: {}", e);
                    return;
                }
            };

            // The fallback tick covers signals coalesced while reaping
            let mut tick = tokio::time::interval(Duration::from_millis(500));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sigchld.recv() => reap_registered(&listeners),
                    _ = tick.tick() => reap_registered(&listeners),
                }
            }

            debug!("Exit notifier stopped");
        });
    }

    fn try_reap(&self, pid: i32) {
        if let Some(status) = poll_exit(pid) {
            if let Some((_, callback)) = self.listeners.remove(&pid) {
                callback(pid, status);
            }
        }
    }
}

impl Default for ExitNotifier {
    fn default() -> Self {
        Self::new()
    }
}

fn reap_registered(listeners: &DashMap<i32, ExitCallback>) {
    let pids: Vec<i32> = listeners.iter().map(|entry| *entry.key()).collect();

    for pid in pids {
        if let Some(status) = poll_exit(pid) {
            if let Some((_, callback)) = listeners.remove(&pid) {
                debug!("Process {} exited with code {}", pid, status);
                callback(pid, status);
            }
        }
    }
}

/// Non-blocking check whether `pid` has terminated.
///
/// Returns the decoded exit code: the plain code for a normal exit, or
/// `SIGNAL_EXIT_BASE + signo` for a signal death. `None` means the process
/// is still running.
fn poll_exit(pid: i32) -> Option<i32> {
    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => Some(code),
        Ok(WaitStatus::Signaled(_, sig, _)) => Some(SIGNAL_EXIT_BASE + sig as i32),
        Ok(_) => None,
        Err(Errno::ECHILD) => {
            // Not our child, or already reaped. If the process is gone
            // entirely, report the sentinel; otherwise keep waiting in case
            // it becomes observable.
            match kill(Pid::from_raw(pid), None) {
                Err(Errno::ESRCH) => Some(UNKNOWN_EXIT_CODE),
                _ => None,
            }
        }
        Err(e) => {
            warn!("waitpid({}) failed: {}", pid, e);
            None
        }
    }
}
