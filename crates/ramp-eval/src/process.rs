//! Evaluator subprocesses, each leading its own process group.
//!
//! Signalling the group rather than the child reaches everything the
//! evaluator spawned, including grandchildren that have been reparented.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use ramp_types::EvaluationError;

/// A spawned process group. Dropping it unreaped SIGKILLs the whole group.
#[derive(Debug)]
pub struct ProcessGroup {
    child: Child,
    pgid: i32,
    reaped: bool,
}

impl ProcessGroup {
    /// Spawn `command` as the leader of a new process group.
    pub fn spawn(mut command: Command) -> io::Result<Self> {
        command.process_group(0).kill_on_drop(true);
        let child = command.spawn()?;
        let pgid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "spawned child has no pid"))?;
        Ok(Self {
            child,
            pgid,
            reaped: false,
        })
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Wait for the group leader to exit.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Send `signal` to every process in the group. A group that no longer
    /// exists is not an error.
    pub fn signal(&self, signal: libc::c_int) -> io::Result<()> {
        // SAFETY: killpg has no memory-safety preconditions.
        let rc = unsafe { libc::killpg(self.pgid, signal) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }

    /// SIGTERM the group, give the leader `grace` to exit, then SIGKILL
    /// whatever is left and reap the leader.
    pub async fn terminate(&mut self, grace: Duration) -> Result<(), EvaluationError> {
        self.signal(libc::SIGTERM)
            .map_err(|e| self.cleanup_failed("SIGTERM", e))?;
        if tokio::time::timeout(grace, self.child.wait()).await.is_err() {
            debug!(pgid = self.pgid, grace = ?grace, "evaluator ignored SIGTERM");
        }
        self.kill().await
    }

    /// SIGKILL the group and reap the leader.
    pub async fn kill(&mut self) -> Result<(), EvaluationError> {
        self.signal(libc::SIGKILL)
            .map_err(|e| self.cleanup_failed("SIGKILL", e))?;
        self.child
            .wait()
            .await
            .map_err(|e| self.cleanup_failed("wait", e))?;
        self.reaped = true;
        Ok(())
    }

    /// After the leader exited on its own, kill any descendants it left
    /// behind in the group.
    pub fn reap_group(&mut self) -> Result<(), EvaluationError> {
        self.signal(libc::SIGKILL)
            .map_err(|e| self.cleanup_failed("SIGKILL", e))?;
        self.reaped = true;
        Ok(())
    }

    fn cleanup_failed(&self, step: &str, e: io::Error) -> EvaluationError {
        EvaluationError::CleanupFailed {
            pgid: self.pgid,
            message: format!("{step}: {e}"),
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        if let Err(e) = self.signal(libc::SIGKILL) {
            warn!(pgid = self.pgid, error = %e, "failed to kill evaluator process group");
        }
    }
}
