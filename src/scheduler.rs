//! Sequential Suite Scheduler
//!
//! Tasks run strictly in declaration order, one at a time. After each task,
//! a failed critical task stops the run: nothing after it executes. Failed
//! non-critical tasks are recorded and the run continues.

use crate::reporter::Reporter;
use crate::signals::ShutdownFlag;
use crate::suite::{SuiteSummary, TaskOutcome, TaskResult, TestTask};
use std::time::Instant;
use tracing::{info, warn};

/// Executes one task and reports how it ended.
///
/// The production implementation is `supervisor::ProcessExecutor`; tests
/// drive the loop with scripted executors.
pub trait TaskExecutor {
    fn execute(&mut self, task: &TestTask) -> TaskOutcome;
}

/// Runs an explicit task list through an executor.
pub struct Scheduler<E: TaskExecutor> {
    executor: E,
    shutdown: ShutdownFlag,
}

impl<E: TaskExecutor> Scheduler<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            shutdown: ShutdownFlag::new(),
        }
    }

    /// Stop launching tasks once `shutdown` is requested.
    pub fn with_shutdown(mut self, shutdown: ShutdownFlag) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn into_executor(self) -> E {
        self.executor
    }

    pub fn run(&mut self, tasks: &[TestTask], reporter: &mut dyn Reporter) -> SuiteSummary {
        let start = Instant::now();
        let mut summary = SuiteSummary::default();

        reporter.on_run_start(tasks.len());

        for (index, task) in tasks.iter().enumerate() {
            if self.shutdown.is_requested() {
                summary.interrupted = true;
                summary.not_run = remaining_names(&tasks[index..]);
                reporter.on_error("Shutdown requested");
                break;
            }

            reporter.on_task_start(task);

            let task_start = Instant::now();
            let outcome = self.executor.execute(task);
            let result = TaskResult::new(task, outcome, task_start.elapsed());

            reporter.on_task_finished(&result);

            let interrupted = result.outcome == TaskOutcome::Interrupted;
            let abort = !result.success && task.critical;
            summary.results.push(result);

            if interrupted {
                summary.interrupted = true;
                summary.not_run = remaining_names(&tasks[index + 1..]);
                reporter.on_error("Shutdown requested");
                break;
            }

            if abort {
                warn!(task = %task.name, "critical task failed, aborting remaining tasks");
                summary.aborted_by = Some(task.name.clone());
                summary.not_run = remaining_names(&tasks[index + 1..]);
                reporter.on_run_aborted(&task.name, &summary.not_run);
                break;
            }
        }

        summary.duration = start.elapsed();

        info!(
            passed = summary.passed(),
            failed = summary.failed(),
            not_run = summary.not_run.len(),
            duration_ms = summary.duration_ms(),
            "suite finished"
        );

        reporter.on_run_finished(&summary);
        summary
    }
}

fn remaining_names(tasks: &[TestTask]) -> Vec<String> {
    tasks.iter().map(|t| t.name.clone()).collect()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::NullReporter;
    use std::collections::HashMap;

    /// Executor that answers from a script and records call order.
    struct Scripted {
        failures: HashMap<String, TaskOutcome>,
        calls: Vec<String>,
    }

    impl Scripted {
        fn new(failing: &[&str]) -> Self {
            let failures = failing
                .iter()
                .map(|name| {
                    (
                        (*name).to_string(),
                        TaskOutcome::NonZeroExit {
                            code: Some(1),
                            signal: None,
                            output_tail: "boom".to_string(),
                        },
                    )
                })
                .collect();
            Self {
                failures,
                calls: Vec::new(),
            }
        }
    }

    impl TaskExecutor for Scripted {
        fn execute(&mut self, task: &TestTask) -> TaskOutcome {
            self.calls.push(task.name.clone());
            self.failures
                .get(&task.name)
                .cloned()
                .unwrap_or(TaskOutcome::Passed)
        }
    }

    fn task(name: &str, critical: bool) -> TestTask {
        TestTask::new(name, &["unused"], 1, critical)
    }

    #[test]
    fn test_all_pass() {
        let tasks = vec![task("a", true), task("b", false), task("c", true)];
        let mut scheduler = Scheduler::new(Scripted::new(&[]));
        let summary = scheduler.run(&tasks, &mut NullReporter);

        assert_eq!(summary.results.len(), 3);
        assert!(summary.all_critical_passed());
        assert_eq!(summary.exit_code(), 0);
        assert!(summary.not_run.is_empty());
    }

    #[test]
    fn test_critical_failure_stops_run() {
        let tasks = vec![task("a", false), task("b", true), task("c", true)];
        let mut scheduler = Scheduler::new(Scripted::new(&["b"]));
        let summary = scheduler.run(&tasks, &mut NullReporter);

        let executor = scheduler.into_executor();
        assert_eq!(executor.calls, vec!["a", "b"]);
        assert_eq!(summary.aborted_by.as_deref(), Some("b"));
        assert_eq!(summary.not_run, vec!["c"]);
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_non_critical_failure_continues() {
        let tasks = vec![task("a", false), task("b", true)];
        let mut scheduler = Scheduler::new(Scripted::new(&["a"]));
        let summary = scheduler.run(&tasks, &mut NullReporter);

        assert_eq!(scheduler.into_executor().calls, vec!["a", "b"]);
        assert!(summary.aborted_by.is_none());
        assert!(summary.all_critical_passed());
        assert_eq!(summary.failed(), 1);
    }

    #[test]
    fn test_shutdown_before_start_runs_nothing() {
        let flag = ShutdownFlag::new();
        flag.request();
        let tasks = vec![task("a", true), task("b", true)];
        let mut scheduler = Scheduler::new(Scripted::new(&[])).with_shutdown(flag);
        let summary = scheduler.run(&tasks, &mut NullReporter);

        assert!(scheduler.into_executor().calls.is_empty());
        assert!(summary.interrupted);
        assert_eq!(summary.not_run, vec!["a", "b"]);
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_empty_task_list() {
        let mut scheduler = Scheduler::new(Scripted::new(&[]));
        let summary = scheduler.run(&[], &mut NullReporter);
        assert!(summary.results.is_empty());
        assert_eq!(summary.exit_code(), 0);
    }
}
