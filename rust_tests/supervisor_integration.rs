//! Integration tests for the process supervisor
//!
//! These spawn real processes (`sh`, `sleep`, `true`) and check:
//! - exit-code classification and the bounded failure excerpt
//! - timeouts return promptly and kill the whole process group
//! - launch failures are reported, never propagated

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use suitecheck::signals::ShutdownFlag;
use suitecheck::suite::{TaskOutcome, TestTask, FAILURE_EXCERPT_CHARS};
use suitecheck::supervisor::run_task;
use tempfile::TempDir;

/// Alive means present in /proc and not a zombie.
fn is_alive(pid: i32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => {
            // State follows the parenthesised command name
            let state = stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next())
                .unwrap_or("");
            state != "Z"
        }
        Err(_) => false,
    }
}

fn wait_until_dead(pid: i32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    !is_alive(pid)
}

fn read_pid(path: &Path) -> i32 {
    fs::read_to_string(path)
        .expect("pid file should exist")
        .trim()
        .parse()
        .expect("pid file should hold a pid")
}

fn sh(name: &str, script: &str, timeout: u64) -> TestTask {
    TestTask::new(name, &["sh", "-c", script], timeout, false)
}

#[test]
fn test_zero_exit_passes() {
    let outcome = run_task(&sh("ok", "echo hello; exit 0", 5), &ShutdownFlag::new());
    assert_eq!(outcome, TaskOutcome::Passed);
    assert!(outcome.is_success());
}

#[test]
fn test_nonzero_exit_captures_combined_output() {
    let outcome = run_task(
        &sh("fails", "echo to-stdout; echo to-stderr >&2; exit 3", 5),
        &ShutdownFlag::new(),
    );

    match outcome {
        TaskOutcome::NonZeroExit {
            code, output_tail, ..
        } => {
            assert_eq!(code, Some(3));
            assert!(output_tail.contains("to-stdout"), "got: {:?}", output_tail);
            assert!(output_tail.contains("to-stderr"), "got: {:?}", output_tail);
        }
        other => panic!("expected NonZeroExit, got {:?}", other),
    }
}

#[test]
fn test_failure_excerpt_is_bounded() {
    let script = "i=0; while [ $i -lt 300 ]; do echo line-$i; i=$((i+1)); done; echo LAST; exit 1";
    let outcome = run_task(&sh("noisy", script, 10), &ShutdownFlag::new());

    match outcome {
        TaskOutcome::NonZeroExit { output_tail, .. } => {
            assert_eq!(output_tail.chars().count(), FAILURE_EXCERPT_CHARS);
            assert!(output_tail.ends_with("LAST"));
        }
        other => panic!("expected NonZeroExit, got {:?}", other),
    }
}

#[test]
fn test_large_output_does_not_block_child() {
    // Far more than a pipe buffer; the child must still finish
    let script = "i=0; while [ $i -lt 20000 ]; do echo 0123456789abcdef; i=$((i+1)); done";
    let outcome = run_task(&sh("flood", script, 30), &ShutdownFlag::new());
    assert_eq!(outcome, TaskOutcome::Passed);
}

#[test]
fn test_missing_executable_is_launch_failure() {
    let task = TestTask::new(
        "missing",
        &["/nonexistent/suitecheck-binary-that-does-not-exist"],
        5,
        true,
    );
    match run_task(&task, &ShutdownFlag::new()) {
        TaskOutcome::LaunchFailed { reason } => assert!(!reason.is_empty()),
        other => panic!("expected LaunchFailed, got {:?}", other),
    }
}

#[test]
fn test_timeout_returns_promptly() {
    let task = TestTask::new("sleeper", &["sleep", "30"], 1, false);

    let start = Instant::now();
    let outcome = run_task(&task, &ShutdownFlag::new());
    let elapsed = start.elapsed();

    assert_eq!(
        outcome,
        TaskOutcome::TimedOut {
            after: Duration::from_secs(1)
        }
    );
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(6), "took {:?}", elapsed);
}

#[test]
fn test_timeout_kills_descendants() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("grandchild.pid");
    let script = format!("sleep 60 & echo $! > {}; wait", pid_file.display());

    let outcome = run_task(&sh("spawner", &script, 1), &ShutdownFlag::new());
    assert!(matches!(outcome, TaskOutcome::TimedOut { .. }));

    let grandchild = read_pid(&pid_file);
    assert!(
        wait_until_dead(grandchild, Duration::from_secs(5)),
        "grandchild {} survived the timeout",
        grandchild
    );
}

#[test]
fn test_descendants_swept_after_normal_exit() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("straggler.pid");
    let script = format!("sleep 60 & echo $! > {}; exit 0", pid_file.display());

    let start = Instant::now();
    let outcome = run_task(&sh("leaky", &script, 10), &ShutdownFlag::new());
    assert_eq!(outcome, TaskOutcome::Passed);
    assert!(start.elapsed() < Duration::from_secs(10));

    let straggler = read_pid(&pid_file);
    assert!(wait_until_dead(straggler, Duration::from_secs(5)));
}

#[test]
fn test_signal_death_is_failure() {
    let outcome = run_task(&sh("suicide", "kill -9 $$", 5), &ShutdownFlag::new());
    match outcome {
        TaskOutcome::NonZeroExit { code, signal, .. } => {
            assert_eq!(code, None);
            assert_eq!(signal, Some(9));
        }
        other => panic!("expected NonZeroExit, got {:?}", other),
    }
}

#[test]
fn test_timed_out_task_gets_to_clean_up() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("cleaned");
    let script = format!(
        "trap 'echo done > {}; exit 1' TERM; sleep 30 & wait",
        marker.display()
    );

    let outcome = run_task(&sh("tidy", &script, 1), &ShutdownFlag::new());

    assert!(matches!(outcome, TaskOutcome::TimedOut { .. }));
    assert!(marker.exists(), "SIGTERM handler never ran");
}

#[test]
fn test_task_ignoring_sigterm_is_killed() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("stubborn.pid");
    let script = format!(
        "trap '' TERM; echo $$ > {}; while :; do sleep 1; done",
        pid_file.display()
    );

    let start = Instant::now();
    let outcome = run_task(&sh("stubborn", &script, 1), &ShutdownFlag::new());

    assert!(matches!(outcome, TaskOutcome::TimedOut { .. }));
    // timeout + SIGTERM grace + overhead
    assert!(start.elapsed() < Duration::from_secs(8), "took {:?}", start.elapsed());
    assert!(wait_until_dead(read_pid(&pid_file), Duration::from_secs(5)));
}
