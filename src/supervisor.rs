//! Process Supervisor
//!
//! Runs one `TestTask` to completion:
//! - the command is spawned as the leader of a new process group
//! - stdout and stderr share one pipe, drained by a background thread
//! - the wait is bounded by the task timeout and by the shutdown flag
//! - a timed-out or interrupted task's group gets SIGTERM and a short grace
//!   period to clean up (a nested `suitecheck probe` tears down its server)
//! - on every exit path the whole group is then SIGKILLed, so nothing the
//!   task spawned outlives it
//!
//! Every failure is returned as a `TaskOutcome`; nothing here panics or
//! propagates an error to the run loop.

use crate::scheduler::TaskExecutor;
use crate::signals::ShutdownFlag;
use crate::suite::{tail_chars, TaskOutcome, TestTask, FAILURE_EXCERPT_CHARS};
use crossbeam_channel::{bounded, Receiver};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{pipe2, Pid};
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Granularity at which the shutdown flag is polled while a task runs.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Grace between SIGTERM and SIGKILL for a timed-out or interrupted task.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Only the most recent output is retained; failure reports need the tail.
const MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// How long to wait for the output pipe to reach EOF after the group is gone.
/// A descendant that escaped the group (setsid) can hold the pipe open.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

// =============================================================================
// Process Groups
// =============================================================================

/// The process group owned by one spawned task, captured at spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup {
    pgid: Pid,
}

impl ProcessGroup {
    /// Group led by `child`. The child must have been spawned with
    /// `process_group(0)`.
    pub fn of(child: &Child) -> Self {
        Self {
            pgid: Pid::from_raw(child.id() as i32),
        }
    }

    pub fn id(&self) -> i32 {
        self.pgid.as_raw()
    }

    /// Signal every member. An already-empty group is not an error.
    pub fn signal(&self, signal: Signal) -> nix::Result<()> {
        match killpg(self.pgid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// SIGKILL the whole group.
    pub fn kill(&self) {
        if let Err(e) = self.signal(Signal::SIGKILL) {
            warn!(pgid = self.id(), error = %e, "failed to kill process group");
        }
    }

    /// True once no process (zombies included) remains in the group.
    pub fn is_empty(&self) -> bool {
        matches!(killpg(self.pgid, None), Err(Errno::ESRCH))
    }
}

// =============================================================================
// Output Capture
// =============================================================================

/// Create a close-on-exec pipe whose write end serves as both stdout and
/// stderr of the child.
fn output_pipe() -> io::Result<(File, Stdio, Stdio)> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
    let write_err = write.try_clone()?;
    Ok((File::from(read), Stdio::from(write), Stdio::from(write_err)))
}

/// Drains the combined output pipe on a background thread so the child can
/// never block on a full pipe buffer.
struct OutputCollector {
    buffer: Arc<Mutex<Vec<u8>>>,
    done: Receiver<()>,
}

impl OutputCollector {
    fn start(mut source: File) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let (tx, done) = bounded(1);

        let sink = Arc::clone(&buffer);
        thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match source.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut buf = sink.lock().unwrap_or_else(|e| e.into_inner());
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.len() > MAX_CAPTURE_BYTES {
                            let excess = buf.len() - MAX_CAPTURE_BYTES;
                            buf.drain(..excess);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let _ = tx.send(());
        });

        Self { buffer, done }
    }

    /// Wait (bounded) for EOF and return what was captured.
    fn finish(self) -> String {
        if self.done.recv_timeout(OUTPUT_DRAIN_GRACE).is_err() {
            debug!("output pipe still open after grace period, using partial output");
        }
        let buf = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buf).into_owned()
    }
}

// =============================================================================
// Task Execution
// =============================================================================

enum WaitResult {
    Exited(ExitStatus),
    TimedOut,
    Interrupted,
    Failed(io::Error),
}

fn wait_bounded(child: &mut Child, timeout: Duration, shutdown: &ShutdownFlag) -> WaitResult {
    let deadline = Instant::now() + timeout;
    loop {
        if shutdown.is_requested() {
            return WaitResult::Interrupted;
        }
        let now = Instant::now();
        if now >= deadline {
            return WaitResult::TimedOut;
        }
        match child.wait_timeout((deadline - now).min(WAIT_SLICE)) {
            Ok(Some(status)) => return WaitResult::Exited(status),
            Ok(None) => {}
            Err(e) => return WaitResult::Failed(e),
        }
    }
}

fn classify_exit(status: ExitStatus, output: &str) -> TaskOutcome {
    if status.success() {
        return TaskOutcome::Passed;
    }
    TaskOutcome::NonZeroExit {
        code: status.code(),
        signal: status.signal(),
        output_tail: tail_chars(output, FAILURE_EXCERPT_CHARS),
    }
}

/// SIGTERM the group, give the leader `TERMINATE_GRACE` to exit, then
/// SIGKILL whatever remains and reap the leader.
fn terminate(child: &mut Child, group: ProcessGroup) {
    if let Err(e) = group.signal(Signal::SIGTERM) {
        warn!(pgid = group.id(), error = %e, "failed to signal process group");
    }
    if !matches!(child.wait_timeout(TERMINATE_GRACE), Ok(Some(_))) {
        debug!(pgid = group.id(), "task still running after SIGTERM");
    }
    group.kill();
    let _ = child.wait();
}

/// Run one task in its own process group, bounded by its timeout.
///
/// Returns only after the task's process has been reaped and its group
/// killed, so the next task never overlaps with this one.
pub fn run_task(task: &TestTask, shutdown: &ShutdownFlag) -> TaskOutcome {
    let Some((program, args)) = task.command.split_first() else {
        return TaskOutcome::LaunchFailed {
            reason: "empty command".to_string(),
        };
    };

    let (reader, stdout, stderr) = match output_pipe() {
        Ok(pipe) => pipe,
        Err(e) => {
            return TaskOutcome::LaunchFailed {
                reason: format!("failed to create output pipe: {}", e),
            }
        }
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0);

    let spawned = command.spawn();
    // `command` holds our copies of the write end; EOF needs them closed.
    drop(command);

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            warn!(task = %task.name, command = %task.command_line(), error = %e, "failed to launch task");
            return TaskOutcome::LaunchFailed {
                reason: e.to_string(),
            };
        }
    };

    let group = ProcessGroup::of(&child);
    debug!(task = %task.name, pgid = group.id(), "task spawned");

    let output = OutputCollector::start(reader);
    let waited = wait_bounded(&mut child, task.timeout(), shutdown);

    match waited {
        WaitResult::Exited(status) => {
            // Sweep stragglers left behind by the leader
            group.kill();
            let captured = output.finish();
            classify_exit(status, &captured)
        }
        WaitResult::TimedOut => {
            terminate(&mut child, group);
            info!(task = %task.name, timeout_secs = task.timeout, "task timed out, process group killed");
            TaskOutcome::TimedOut {
                after: task.timeout(),
            }
        }
        WaitResult::Interrupted => {
            terminate(&mut child, group);
            info!(task = %task.name, "task interrupted, process group killed");
            TaskOutcome::Interrupted
        }
        WaitResult::Failed(e) => {
            group.kill();
            let _ = child.wait();
            TaskOutcome::LaunchFailed {
                reason: format!("lost track of process: {}", e),
            }
        }
    }
}

/// Executes tasks as real child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    shutdown: ShutdownFlag,
}

impl ProcessExecutor {
    pub fn new(shutdown: ShutdownFlag) -> Self {
        Self { shutdown }
    }
}

impl TaskExecutor for ProcessExecutor {
    fn execute(&mut self, task: &TestTask) -> TaskOutcome {
        run_task(task, &self.shutdown)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_success() {
        let status = ExitStatus::from_raw(0);
        assert_eq!(classify_exit(status, "noise"), TaskOutcome::Passed);
    }

    #[test]
    fn test_classify_nonzero_keeps_tail() {
        // Raw wait status: exit code 3 lives in the high byte
        let status = ExitStatus::from_raw(3 << 8);
        let output = "x".repeat(600) + "END";
        match classify_exit(status, &output) {
            TaskOutcome::NonZeroExit {
                code,
                signal,
                output_tail,
            } => {
                assert_eq!(code, Some(3));
                assert_eq!(signal, None);
                assert_eq!(output_tail.chars().count(), FAILURE_EXCERPT_CHARS);
                assert!(output_tail.ends_with("END"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_classify_signal_death() {
        let status = ExitStatus::from_raw(9);
        match classify_exit(status, "") {
            TaskOutcome::NonZeroExit { code, signal, .. } => {
                assert_eq!(code, None);
                assert_eq!(signal, Some(9));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_empty_command_is_launch_failure() {
        let task = TestTask {
            name: "empty".to_string(),
            command: vec![],
            timeout: 1,
            critical: false,
        };
        let outcome = run_task(&task, &ShutdownFlag::new());
        assert!(matches!(outcome, TaskOutcome::LaunchFailed { .. }));
    }

    #[test]
    fn test_true_passes() {
        let task = TestTask::new("true", &["true"], 5, true);
        assert_eq!(run_task(&task, &ShutdownFlag::new()), TaskOutcome::Passed);
    }

    #[test]
    fn test_shutdown_interrupts_running_task() {
        let flag = ShutdownFlag::new();
        flag.request();
        let task = TestTask::new("sleeper", &["sleep", "30"], 60, false);

        let start = Instant::now();
        let outcome = run_task(&task, &flag);

        assert_eq!(outcome, TaskOutcome::Interrupted);
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
