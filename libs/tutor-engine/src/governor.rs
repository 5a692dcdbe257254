/// Resource Governor - Wall-Clock Enforcement for Subprocesses
///
/// **Core Responsibility:**
/// Race a running child against its time budget and a cancellation token,
/// and make sure the whole process tree is gone before returning.
///
/// **Termination Routine:**
/// 1. SIGTERM to the child's process group
/// 2. Wait up to the grace period for the leader to exit
/// 3. SIGKILL the group if it is still around
/// 4. Sweep the group with SIGKILL once more for descendants that ignored SIGTERM
///
/// Timeout and cancellation both go through [`ProcessTree::terminate`], which
/// runs at most once per tree.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a supervised subprocess ended.
#[derive(Debug)]
pub enum Termination {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// The process group led by one spawned child.
///
/// Children are spawned as group leaders, so the group id equals the leader
/// pid and covers every descendant that did not start its own session.
#[derive(Debug)]
pub struct ProcessTree {
    pid: Option<u32>,
    terminated: AtomicBool,
    swept: AtomicBool,
}

impl ProcessTree {
    pub fn new(child: &Child) -> Self {
        Self {
            pid: child.id(),
            terminated: AtomicBool::new(false),
            swept: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Terminate the tree: polite signal, grace period, forced kill, sweep.
    /// Later calls return immediately.
    pub async fn terminate(&self, child: &mut Child, grace: Duration) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        if !self.signal(Signal::Terminate) {
            // No group to signal (already gone, or not unix): fall back to the leader alone.
            let _ = child.start_kill();
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!(pid = ?self.pid, ?status, "Process exited after SIGTERM"),
            Ok(Err(e)) => warn!(pid = ?self.pid, error = %e, "Wait after SIGTERM failed"),
            Err(_) => {
                debug!(pid = ?self.pid, grace_ms = grace.as_millis() as u64, "Grace period expired, killing");
                if !self.signal(Signal::Kill) {
                    let _ = child.start_kill();
                }
                if let Err(e) = child.wait().await {
                    warn!(pid = ?self.pid, error = %e, "Wait after SIGKILL failed");
                }
            }
        }

        self.sweep();
    }

    /// SIGKILL whatever is left in the group. Runs at most once.
    pub fn sweep(&self) {
        if self.swept.swap(true, Ordering::SeqCst) {
            return;
        }
        self.terminated.store(true, Ordering::SeqCst);
        self.signal(Signal::Kill);
    }

    #[cfg(unix)]
    fn signal(&self, signal: Signal) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        let sig = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // Negative pid addresses the whole process group.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), sig) };
        rc == 0
    }

    #[cfg(not(unix))]
    fn signal(&self, _signal: Signal) -> bool {
        false
    }
}

impl Drop for ProcessTree {
    fn drop(&mut self) {
        // Reached without a sweep only when the supervising future was dropped mid-run.
        self.sweep();
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Terminate,
    Kill,
}

/// Supervises one subprocess at a time against a deadline and a cancellation token.
#[derive(Debug, Clone)]
pub struct Governor {
    grace: Duration,
}

impl Governor {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Wait for `child` to exit, for `limit` to pass, or for `cancel` to fire,
    /// whichever comes first. The tree is fully terminated on every path.
    pub async fn supervise(
        &self,
        child: &mut Child,
        tree: &ProcessTree,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> std::io::Result<Termination> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(pid = ?tree.pid(), "Cancellation requested, terminating process tree");
                tree.terminate(child, self.grace).await;
                Ok(Termination::Cancelled)
            }
            status = child.wait() => {
                let status = status?;
                // The leader is done; take down any background children it left behind.
                tree.sweep();
                Ok(Termination::Exited(status))
            }
            _ = tokio::time::sleep(limit) => {
                warn!(
                    pid = ?tree.pid(),
                    limit_ms = limit.as_millis() as u64,
                    "Time limit exceeded, terminating process tree"
                );
                tree.terminate(child, self.grace).await;
                Ok(Termination::TimedOut)
            }
        }
    }
}

/// Whether `pid` names a live (non-zombie) process.
#[cfg(all(test, target_os = "linux"))]
pub(crate) fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // Field 3, after the parenthesised command name, is the state letter.
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .map(|state| state != 'Z' && state != 'X')
            .unwrap_or(false),
        Err(_) => false,
    }
}
