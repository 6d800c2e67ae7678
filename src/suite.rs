//! Suite Data Model
//!
//! - `TestTask`: one declared command with a timeout and a criticality flag
//! - `TaskOutcome`: how a single execution ended
//! - `TaskResult`: outcome paired with the task's metadata
//! - `SuiteSummary`: the ordered results of a run plus the overall verdict

use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Number of trailing characters of captured output shown on failure.
pub const FAILURE_EXCERPT_CHARS: usize = 500;

/// A declared unit of work. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TestTask {
    pub name: String,
    /// Argument vector; never passed through a shell.
    pub command: Vec<String>,
    /// Wall-clock limit in seconds.
    pub timeout: u64,
    #[serde(default)]
    pub critical: bool,
}

impl TestTask {
    pub fn new(name: impl Into<String>, command: &[&str], timeout: u64, critical: bool) -> Self {
        Self {
            name: name.into(),
            command: command.iter().map(|s| (*s).to_string()).collect(),
            timeout,
            critical,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Command line for display only.
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// How one task execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Passed,
    /// Ran to completion with a non-zero code, or was killed by a signal
    /// it did not receive from us.
    NonZeroExit {
        code: Option<i32>,
        signal: Option<i32>,
        output_tail: String,
    },
    /// Exceeded its timeout; the whole process group was killed.
    TimedOut { after: Duration },
    /// The process could not be started at all.
    LaunchFailed { reason: String },
    /// A shutdown signal arrived while the task was running.
    Interrupted,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Passed)
    }

    /// Short keyword for reports.
    pub fn keyword(&self) -> &'static str {
        match self {
            TaskOutcome::Passed => "passed",
            TaskOutcome::NonZeroExit { .. } => "failed",
            TaskOutcome::TimedOut { .. } => "timeout",
            TaskOutcome::LaunchFailed { .. } => "launch-error",
            TaskOutcome::Interrupted => "interrupted",
        }
    }

    /// One-line human explanation.
    pub fn describe(&self) -> String {
        match self {
            TaskOutcome::Passed => "passed".to_string(),
            TaskOutcome::NonZeroExit {
                code: Some(code), ..
            } => format!("failed with exit code {}", code),
            TaskOutcome::NonZeroExit {
                signal: Some(sig), ..
            } => format!("terminated by signal {}", sig),
            TaskOutcome::NonZeroExit { .. } => "failed with unknown exit status".to_string(),
            TaskOutcome::TimedOut { after } => format!("timed out after {}s", after.as_secs()),
            TaskOutcome::LaunchFailed { reason } => format!("could not be started: {}", reason),
            TaskOutcome::Interrupted => "interrupted by shutdown request".to_string(),
        }
    }

    /// Captured output excerpt, only present for non-zero exits.
    pub fn output_tail(&self) -> Option<&str> {
        match self {
            TaskOutcome::NonZeroExit { output_tail, .. } if !output_tail.is_empty() => {
                Some(output_tail)
            }
            _ => None,
        }
    }
}

/// Display status derived from success and criticality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pass,
    /// Failed, but not critical: the run continued.
    FailSkipped,
    /// Failed and critical: the run stopped here.
    FailAborted,
}

impl TaskStatus {
    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Pass => "PASS",
            TaskStatus::FailSkipped => "FAIL (SKIPPED)",
            TaskStatus::FailAborted => "FAIL (ABORTED)",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome of one executed task. Produced exactly once per executed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub name: String,
    pub success: bool,
    pub critical: bool,
    pub outcome: TaskOutcome,
    pub duration: Duration,
}

impl TaskResult {
    pub fn new(task: &TestTask, outcome: TaskOutcome, duration: Duration) -> Self {
        Self {
            name: task.name.clone(),
            success: outcome.is_success(),
            critical: task.critical,
            outcome,
            duration,
        }
    }

    pub fn status(&self) -> TaskStatus {
        match (self.success, self.critical) {
            (true, _) => TaskStatus::Pass,
            (false, false) => TaskStatus::FailSkipped,
            (false, true) => TaskStatus::FailAborted,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}

/// The read-only result of a suite run.
#[derive(Debug, Clone, Default)]
pub struct SuiteSummary {
    /// Executed tasks, in declaration order.
    pub results: Vec<TaskResult>,
    /// Declared tasks that never ran (critical abort or interrupt).
    pub not_run: Vec<String>,
    /// Name of the critical task that stopped the run, if any.
    pub aborted_by: Option<String>,
    pub interrupted: bool,
    pub duration: Duration,
}

impl SuiteSummary {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.passed()
    }

    /// True iff every executed critical task succeeded and the run was not
    /// cut short by a shutdown request.
    pub fn all_critical_passed(&self) -> bool {
        !self.interrupted && self.results.iter().all(|r| r.success || !r.critical)
    }

    pub fn exit_code(&self) -> i32 {
        if self.all_critical_passed() {
            0
        } else {
            1
        }
    }

    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Last `max_chars` characters of `output`, after trimming surrounding
/// whitespace. Counts characters, not bytes.
pub fn tail_chars(output: &str, max_chars: usize) -> String {
    let trimmed = output.trim();
    let total = trimmed.chars().count();
    if total <= max_chars {
        return trimmed.to_string();
    }
    trimmed.chars().skip(total - max_chars).collect()
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, success: bool, critical: bool) -> TaskResult {
        let task = TestTask::new(name, &["true"], 1, critical);
        let outcome = if success {
            TaskOutcome::Passed
        } else {
            TaskOutcome::NonZeroExit {
                code: Some(1),
                signal: None,
                output_tail: String::new(),
            }
        };
        TaskResult::new(&task, outcome, Duration::from_millis(5))
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(result("a", true, true).status().label(), "PASS");
        assert_eq!(result("b", true, false).status().label(), "PASS");
        assert_eq!(result("c", false, false).status().label(), "FAIL (SKIPPED)");
        assert_eq!(result("d", false, true).status().label(), "FAIL (ABORTED)");
    }

    #[test]
    fn test_non_critical_failure_keeps_success() {
        let summary = SuiteSummary {
            results: vec![result("a", true, true), result("b", false, false)],
            ..Default::default()
        };
        assert!(summary.all_critical_passed());
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(summary.passed(), 1);
        assert_eq!(summary.failed(), 1);
    }

    #[test]
    fn test_critical_failure_fails_run() {
        let summary = SuiteSummary {
            results: vec![result("a", false, true)],
            ..Default::default()
        };
        assert!(!summary.all_critical_passed());
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_interrupted_run_is_not_success() {
        let summary = SuiteSummary {
            results: vec![result("a", true, true)],
            interrupted: true,
            ..Default::default()
        };
        assert_eq!(summary.exit_code(), 1);
    }

    #[test]
    fn test_empty_run_is_success() {
        assert_eq!(SuiteSummary::default().exit_code(), 0);
    }

    #[test]
    fn test_tail_chars_counts_characters() {
        assert_eq!(tail_chars("  short \n", 500), "short");
        assert_eq!(tail_chars("abcdef", 3), "def");
        // Multi-byte characters must not be split
        assert_eq!(tail_chars("ééééé", 2), "éé");
    }

    #[test]
    fn test_outcome_descriptions() {
        let timeout = TaskOutcome::TimedOut {
            after: Duration::from_secs(30),
        };
        assert_eq!(timeout.describe(), "timed out after 30s");
        assert!(!timeout.is_success());

        let launch = TaskOutcome::LaunchFailed {
            reason: "No such file or directory".to_string(),
        };
        assert!(launch.describe().starts_with("could not be started"));
        assert_eq!(launch.keyword(), "launch-error");

        let signalled = TaskOutcome::NonZeroExit {
            code: None,
            signal: Some(9),
            output_tail: String::new(),
        };
        assert_eq!(signalled.describe(), "terminated by signal 9");
        assert!(signalled.output_tail().is_none());
    }

    #[test]
    fn test_deserialize_task_defaults_non_critical() {
        let task: TestTask = toml::from_str(
            r#"
name = "lint"
command = ["cargo", "clippy"]
timeout = 120
"#,
        )
        .unwrap();
        assert!(!task.critical);
        assert_eq!(task.timeout(), Duration::from_secs(120));
        assert_eq!(task.command_line(), "cargo clippy");
    }
}
