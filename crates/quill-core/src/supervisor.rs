//! Process lifecycle control for spawned scripts.
//!
//! Termination is two-phase: a graceful signal, a grace window, then a
//! forceful kill. On Unix every child leads its own process group and both
//! signals target the whole group, so grandchildren (a shell's `sleep`, a
//! node script's workers) go down with it.

use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    process::{Child, Command},
    time::Instant,
};
use tracing::{debug, warn};

/// How a [`Supervisor::terminate`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process had already exited before any signal was sent.
    AlreadyExited,
    /// Exited within the grace window after the graceful signal.
    Graceful,
    /// Needed the forceful kill.
    Forced,
}

/// Interval between group liveness checks once the leader has exited.
const GROUP_POLL: Duration = Duration::from_millis(50);

/// Signals address the child by the pid recorded at spawn. Once the leader
/// is reaped `Child::id` is gone, but its process group can still have
/// members holding the output pipes.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Configure `cmd` before it is spawned.
    fn prepare(&self, cmd: &mut Command);

    /// Ask the process (group) led by `pid` to exit.
    fn graceful_stop(&self, pid: u32) -> io::Result<()>;

    /// Kill the process (group) led by `pid` outright.
    fn force_stop(&self, child: &mut Child, pid: u32) -> io::Result<()>;

    /// Whether anything besides the reaped leader may still be running.
    fn group_alive(&self, _pid: u32) -> bool {
        false
    }

    /// Graceful stop, wait up to `grace`, then force stop and reap.
    async fn terminate(&self, child: &mut Child, pid: u32, grace: Duration) -> Termination {
        if matches!(child.try_wait(), Ok(Some(_))) && !self.group_alive(pid) {
            return Termination::AlreadyExited;
        }
        if let Err(e) = self.graceful_stop(pid) {
            warn!(pid, "graceful stop failed: {e}");
        }
        self.escalate(child, pid, grace).await
    }

    /// Second phase only: the graceful signal has already been sent.
    async fn escalate(&self, child: &mut Child, pid: u32, grace: Duration) -> Termination {
        let deadline = Instant::now() + grace;
        if tokio::time::timeout_at(deadline, child.wait()).await.is_ok() {
            loop {
                if !self.group_alive(pid) {
                    debug!(pid, "process exited after graceful stop");
                    return Termination::Graceful;
                }
                if Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(GROUP_POLL).await;
            }
        }
        warn!(
            pid,
            grace_ms = grace.as_millis() as u64,
            "process ignored graceful stop, killing"
        );
        if let Err(e) = self.force_stop(child, pid) {
            warn!(pid, "force stop failed: {e}");
        }
        let _ = child.wait().await;
        Termination::Forced
    }
}

/// Platform default: process groups on Unix, direct kill elsewhere.
pub fn default_supervisor() -> Arc<dyn Supervisor> {
    #[cfg(unix)]
    {
        Arc::new(ProcessGroupSupervisor)
    }
    #[cfg(not(unix))]
    {
        Arc::new(DirectSupervisor)
    }
}

// ── Unix: process groups ─────────────────────────────────────────────────

#[cfg(unix)]
pub struct ProcessGroupSupervisor;

#[cfg(unix)]
impl ProcessGroupSupervisor {
    /// Signal the group led by `pid`, falling back to the process itself.
    fn signal(pid: u32, sig: libc::c_int) -> io::Result<()> {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"));
        };
        // SAFETY: plain syscalls on a pid we spawned; no memory is shared.
        if unsafe { libc::killpg(pid, sig) } == 0 {
            return Ok(());
        }
        let group_err = io::Error::last_os_error();
        debug!(pid, sig, "killpg failed ({group_err}), signalling process directly");
        if unsafe { libc::kill(pid, sig) } == 0 {
            return Ok(());
        }
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
#[async_trait]
impl Supervisor for ProcessGroupSupervisor {
    fn prepare(&self, cmd: &mut Command) {
        cmd.process_group(0);
    }

    fn graceful_stop(&self, pid: u32) -> io::Result<()> {
        Self::signal(pid, libc::SIGTERM)
    }

    fn force_stop(&self, child: &mut Child, pid: u32) -> io::Result<()> {
        Self::signal(pid, libc::SIGKILL).or_else(|e| match child.id() {
            Some(_) => child.start_kill(),
            None => Err(e),
        })
    }

    fn group_alive(&self, pid: u32) -> bool {
        let Ok(pgid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // SAFETY: signal 0 only checks that the group exists.
        unsafe { libc::killpg(pgid, 0) == 0 }
    }
}

// ── Fallback: direct kill ────────────────────────────────────────────────

/// No process-group support: both phases kill the direct child only.
pub struct DirectSupervisor;

#[async_trait]
impl Supervisor for DirectSupervisor {
    fn prepare(&self, _cmd: &mut Command) {}

    fn graceful_stop(&self, _pid: u32) -> io::Result<()> {
        // Without signals there is nothing gentler than a kill; leave it to force_stop.
        Ok(())
    }

    fn force_stop(&self, child: &mut Child, _pid: u32) -> io::Result<()> {
        child.start_kill()
    }
}
