//! Lifecycle Management for the probed server
//!
//! `ServerGuard` owns the server process and any scratch directory created
//! for it. Teardown is idempotent and also runs on Drop, so every exit path
//! (return, early error, panic) releases both.
//!
//! The server stays in the caller's process group, so whoever owns that
//! group (a terminal, or the supervisor running `suitecheck probe` as a
//! task) can stop the server together with the probe. Teardown therefore
//! signals the server process itself, never a group.
//!
//! Order matters: kill processes first, then remove files they may hold.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Child;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Time the server gets to exit after SIGTERM before SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

pub struct ServerGuard {
    child: Child,
    scratch: Option<TempDir>,
    torn_down: bool,
}

impl ServerGuard {
    pub fn new(child: Child, scratch: Option<TempDir>) -> Self {
        Self {
            child,
            scratch,
            torn_down: false,
        }
    }

    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn scratch_path(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }

    /// Send `signal` to the server. An already-exited server is not an error.
    fn signal(&self, signal: Signal) -> nix::Result<()> {
        match kill(Pid::from_raw(self.child.id() as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn force_kill(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "server already gone");
        }
        let _ = self.child.wait();
    }

    /// Terminate the server and remove the scratch directory. Returns
    /// `false` if teardown already ran.
    pub fn teardown(&mut self) -> bool {
        if self.torn_down {
            return false;
        }
        self.torn_down = true;

        // Closing stdin first lets well-behaved servers exit on EOF
        drop(self.child.stdin.take());

        if let Err(e) = self.signal(Signal::SIGTERM) {
            warn!(pid = self.pid(), error = %e, "failed to signal server");
        }
        match self.child.wait_timeout(TERMINATE_GRACE) {
            Ok(Some(status)) => debug!(%status, "server exited"),
            Ok(None) => {
                debug!("server ignored SIGTERM, killing");
                self.force_kill();
            }
            Err(e) => {
                warn!(error = %e, "failed to wait for server");
                self.force_kill();
            }
        }

        if let Some(dir) = self.scratch.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!(path = %path.display(), "scratch directory removed"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove scratch directory"),
            }
        }

        true
    }
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        self.teardown();
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::{Command, Stdio};

    fn spawn_sleeper() -> Child {
        Command::new("sleep")
            .arg("30")
            .stdin(Stdio::piped())
            .spawn()
            .expect("sleep should spawn")
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let mut guard = ServerGuard::new(spawn_sleeper(), None);
        assert!(guard.teardown());
        assert!(!guard.teardown());
    }

    #[test]
    fn test_teardown_reaps_server() {
        let mut guard = ServerGuard::new(spawn_sleeper(), None);
        guard.teardown();
        // Already reaped: try_wait returns the cached status
        assert!(guard.child_mut().try_wait().unwrap().is_some());
    }

    #[test]
    fn test_server_ignoring_sigterm_is_killed() {
        let child = Command::new("sh")
            .args(["-c", "trap '' TERM; while :; do sleep 1; done"])
            .stdin(Stdio::null())
            .spawn()
            .expect("sh should spawn");
        let mut guard = ServerGuard::new(child, None);
        // Let the shell install its trap
        std::thread::sleep(Duration::from_millis(200));

        guard.teardown();

        assert!(guard.child_mut().try_wait().unwrap().is_some());
    }

    #[test]
    fn test_teardown_leaves_caller_group_alone() {
        // The server shares our group; tearing it down must not signal us
        let mut guard = ServerGuard::new(spawn_sleeper(), None);
        guard.teardown();
        assert_eq!(kill(nix::unistd::getpid(), None), Ok(()));
    }

    #[test]
    fn test_drop_removes_scratch_dir() {
        let scratch = TempDir::new().unwrap();
        let path = scratch.path().to_path_buf();
        std::fs::write(path.join("probe.db"), b"data").unwrap();

        {
            let guard = ServerGuard::new(spawn_sleeper(), Some(scratch));
            assert_eq!(guard.scratch_path(), Some(path.as_path()));
        }

        assert!(!path.exists());
    }
}
