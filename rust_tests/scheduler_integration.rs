//! Integration tests for the sequential run loop against real processes
//!
//! Marker files record which tasks actually executed, so the abort-on-
//! critical-failure prefix property is observed from outside.

use std::fs;
use std::path::Path;
use suitecheck::reporter::NullReporter;
use suitecheck::scheduler::Scheduler;
use suitecheck::suite::{TaskOutcome, TaskStatus, TestTask};
use suitecheck::supervisor::ProcessExecutor;
use tempfile::TempDir;

fn append(name: &str, log: &Path, line: &str, critical: bool) -> TestTask {
    let script = format!("echo {} >> {}", line, log.display());
    TestTask::new(name, &["sh", "-c", &script], 5, critical)
}

fn failing(name: &str, critical: bool) -> TestTask {
    TestTask::new(name, &["false"], 5, critical)
}

fn log_lines(log: &Path) -> Vec<String> {
    fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn run(tasks: &[TestTask]) -> suitecheck::suite::SuiteSummary {
    Scheduler::new(ProcessExecutor::default()).run(tasks, &mut NullReporter)
}

#[test]
fn test_all_pass_exit_zero() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("log");
    let tasks = vec![
        append("first", &log, "one", true),
        append("second", &log, "two", false),
        TestTask::new("third", &["true"], 5, true),
    ];

    let summary = run(&tasks);

    assert_eq!(summary.results.len(), 3);
    assert!(summary.results.iter().all(|r| r.status() == TaskStatus::Pass));
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(log_lines(&log), vec!["one", "two"]);
}

#[test]
fn test_critical_failure_prevents_later_tasks() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("log");
    let tasks = vec![
        append("before", &log, "before", false),
        failing("gate", true),
        append("after", &log, "after", false),
        append("after-critical", &log, "after-critical", true),
    ];

    let summary = run(&tasks);

    assert_eq!(log_lines(&log), vec!["before"]);
    assert_eq!(summary.results.len(), 2);
    assert_eq!(summary.results[1].status(), TaskStatus::FailAborted);
    assert_eq!(summary.aborted_by.as_deref(), Some("gate"));
    assert_eq!(summary.not_run, vec!["after", "after-critical"]);
    assert_eq!(summary.exit_code(), 1);
}

#[test]
fn test_non_critical_failure_continues() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("log");
    let tasks = vec![
        failing("flaky", false),
        TestTask::new("missing", &["/nonexistent/suitecheck-tool"], 5, false),
        append("last", &log, "last", true),
    ];

    let summary = run(&tasks);

    assert_eq!(log_lines(&log), vec!["last"]);
    assert_eq!(summary.results[0].status(), TaskStatus::FailSkipped);
    assert!(matches!(
        summary.results[1].outcome,
        TaskOutcome::LaunchFailed { .. }
    ));
    assert!(summary.all_critical_passed());
    assert_eq!(summary.exit_code(), 0);
}

#[test]
fn test_critical_timeout_aborts() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("log");
    let tasks = vec![
        TestTask::new("hangs", &["sleep", "30"], 1, true),
        append("never", &log, "never", false),
    ];

    let summary = run(&tasks);

    assert!(matches!(
        summary.results[0].outcome,
        TaskOutcome::TimedOut { .. }
    ));
    assert!(log_lines(&log).is_empty());
    assert_eq!(summary.exit_code(), 1);
}

#[test]
fn test_tasks_never_overlap() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("log");
    let slow = format!(
        "echo slow-start >> {0}; sleep 1; echo slow-end >> {0}",
        log.display()
    );
    let tasks = vec![
        TestTask::new("slow", &["sh", "-c", &slow], 5, false),
        append("fast", &log, "fast", false),
    ];

    run(&tasks);

    assert_eq!(log_lines(&log), vec!["slow-start", "slow-end", "fast"]);
}

#[test]
fn test_durations_recorded() {
    let tasks = vec![TestTask::new("nap", &["sleep", "1"], 5, false)];
    let summary = run(&tasks);
    assert!(summary.results[0].duration_ms() >= 900);
}
