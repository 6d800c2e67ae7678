//! Reporter Module: Trait-based output for Human (CLI) and Machine (JSON) formats
//!
//! - `Reporter` trait defines the event callbacks
//! - `JsonReporter` outputs NDJSON to stdout (for --format=json)
//! - `HumanReporter` outputs human-readable text to stderr
//! - `MultiReporter` broadcasts to several reporters
//!
//! When JsonReporter is active, ONLY valid JSON goes to stdout. Logs and
//! human output go to stderr.

use crate::error::ProbeError;
use crate::probe::ProbeReport;
use crate::suite::{SuiteSummary, TaskOutcome, TaskResult, TestTask};
use serde::Serialize;
use tracing::warn;

/// Machine-readable events for JSON output
#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MachineEvent<'a> {
    /// Emitted at start of a suite run
    RunStart { count: usize },
    /// Emitted when a task's process is about to be launched
    TaskStart { name: &'a str, command: &'a [String] },
    /// Emitted when a task completes
    TaskFinished {
        name: &'a str,
        status: &'a str, // "PASS", "FAIL (SKIPPED)", "FAIL (ABORTED)"
        outcome: &'a str,
        critical: bool,
        duration_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Emitted when a critical failure stops the run
    RunAborted {
        by: &'a str,
        not_run: &'a [String],
    },
    /// Emitted at end of a suite run
    RunFinished {
        passed: usize,
        failed: usize,
        not_run: usize,
        success: bool,
        duration_ms: u64,
    },
    /// Emitted when a protocol probe completes
    ProbeFinished {
        success: bool,
        tools: &'a [String],
        #[serde(skip_serializing_if = "Option::is_none")]
        step: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Emitted on fatal error
    Error { message: &'a str },
}

/// Reporter trait for output abstraction
pub trait Reporter {
    /// Called at start of a suite run
    fn on_run_start(&mut self, count: usize);

    /// Called before a task is launched
    fn on_task_start(&mut self, task: &TestTask);

    /// Called when a task completes, whatever the outcome
    fn on_task_finished(&mut self, result: &TaskResult);

    /// Called when a failed critical task stops the run
    fn on_run_aborted(&mut self, by: &str, not_run: &[String]);

    /// Called at end of a suite run
    fn on_run_finished(&mut self, summary: &SuiteSummary);

    /// Called when a protocol probe completes
    fn on_probe_finished(&mut self, outcome: &Result<ProbeReport, ProbeError>);

    /// Called on fatal error
    fn on_error(&mut self, message: &str);
}

/// Failure text attached to a task result, if any.
fn failure_message(result: &TaskResult) -> Option<String> {
    if result.success {
        return None;
    }
    let mut message = result.outcome.describe();
    if let Some(tail) = result.outcome.output_tail() {
        message.push('\n');
        message.push_str(tail);
    }
    Some(message)
}

// =============================================================================
// JsonReporter
// =============================================================================

/// JSON Reporter - outputs NDJSON to stdout
pub struct JsonReporter;

impl JsonReporter {
    fn emit(event: &MachineEvent<'_>) {
        // ONLY JsonReporter touches stdout
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "failed to serialize machine event"),
        }
    }
}

impl Reporter for JsonReporter {
    fn on_run_start(&mut self, count: usize) {
        Self::emit(&MachineEvent::RunStart { count });
    }

    fn on_task_start(&mut self, task: &TestTask) {
        Self::emit(&MachineEvent::TaskStart {
            name: &task.name,
            command: &task.command,
        });
    }

    fn on_task_finished(&mut self, result: &TaskResult) {
        Self::emit(&MachineEvent::TaskFinished {
            name: &result.name,
            status: result.status().label(),
            outcome: result.outcome.keyword(),
            critical: result.critical,
            duration_ms: result.duration_ms(),
            message: failure_message(result),
        });
    }

    fn on_run_aborted(&mut self, by: &str, not_run: &[String]) {
        Self::emit(&MachineEvent::RunAborted { by, not_run });
    }

    fn on_run_finished(&mut self, summary: &SuiteSummary) {
        Self::emit(&MachineEvent::RunFinished {
            passed: summary.passed(),
            failed: summary.failed(),
            not_run: summary.not_run.len(),
            success: summary.all_critical_passed(),
            duration_ms: summary.duration_ms(),
        });
    }

    fn on_probe_finished(&mut self, outcome: &Result<ProbeReport, ProbeError>) {
        let event = match outcome {
            Ok(report) => MachineEvent::ProbeFinished {
                success: true,
                tools: &report.tools,
                step: None,
                message: None,
            },
            Err(e) => MachineEvent::ProbeFinished {
                success: false,
                tools: &[],
                step: Some(e.step().method()),
                message: Some(e.to_string()),
            },
        };
        Self::emit(&event);
    }

    fn on_error(&mut self, message: &str) {
        Self::emit(&MachineEvent::Error { message });
    }
}

// =============================================================================
// HumanReporter
// =============================================================================

/// Human Reporter - outputs readable text to stderr
pub struct HumanReporter;

impl Reporter for HumanReporter {
    fn on_run_start(&mut self, count: usize) {
        eprintln!("{}", "=".repeat(40));
        eprintln!("[suitecheck] Running {} tasks", count);
        eprintln!("{}", "=".repeat(40));
    }

    fn on_task_start(&mut self, task: &TestTask) {
        eprintln!("\n>>> Running: {}...", task.name);
    }

    fn on_task_finished(&mut self, result: &TaskResult) {
        match &result.outcome {
            TaskOutcome::Passed => eprintln!(
                "✅ {} passed ({:.2}s)",
                result.name,
                result.duration.as_secs_f64()
            ),
            TaskOutcome::NonZeroExit { output_tail, .. } => {
                eprintln!("❌ {} {}", result.name, result.outcome.describe());
                if !output_tail.is_empty() {
                    eprintln!("{}", "-".repeat(20));
                    eprintln!("{}", output_tail);
                    eprintln!("{}", "-".repeat(20));
                }
            }
            TaskOutcome::TimedOut { .. } => {
                eprintln!("⏰ {} {}", result.name, result.outcome.describe())
            }
            TaskOutcome::LaunchFailed { reason } => {
                eprintln!("⚠️  Error running {}: {}", result.name, reason)
            }
            TaskOutcome::Interrupted => eprintln!("⊘ {} interrupted", result.name),
        }
    }

    fn on_run_aborted(&mut self, by: &str, not_run: &[String]) {
        eprintln!(
            "\n🛑 Critical task '{}' failed. Aborting {} remaining task(s).",
            by,
            not_run.len()
        );
    }

    fn on_run_finished(&mut self, summary: &SuiteSummary) {
        eprintln!("\n{}", "=".repeat(40));
        eprintln!("TEST SUMMARY");
        eprintln!("{}", "=".repeat(40));

        for result in &summary.results {
            let icon = if result.success { "✅" } else { "❌" };
            eprintln!("{} {}: {}", icon, result.name, result.status());
        }
        for name in &summary.not_run {
            eprintln!("⊘ {}: NOT RUN", name);
        }

        if summary.all_critical_passed() {
            eprintln!(
                "\n✨ All critical tasks passed! ({} passed, {} failed in {}ms)",
                summary.passed(),
                summary.failed(),
                summary.duration_ms()
            );
        } else {
            eprintln!("\n🚫 Some critical tasks failed.");
        }
    }

    fn on_probe_finished(&mut self, outcome: &Result<ProbeReport, ProbeError>) {
        match outcome {
            Ok(report) => {
                eprintln!("✓ Found tools: {:?}", report.tools);
                eprintln!("\nProtocol probe passed!");
            }
            Err(e) => {
                eprintln!("✗ {}", e);
                if let Some(response) = e.response() {
                    eprintln!("  response: {}", response);
                }
                eprintln!("\nProtocol probe failed.");
            }
        }
    }

    fn on_error(&mut self, message: &str) {
        eprintln!("[suitecheck] FATAL ERROR: {}", message);
    }
}

// =============================================================================
// NullReporter
// =============================================================================

/// Reporter that discards every event
pub struct NullReporter;

impl Reporter for NullReporter {
    fn on_run_start(&mut self, _count: usize) {}
    fn on_task_start(&mut self, _task: &TestTask) {}
    fn on_task_finished(&mut self, _result: &TaskResult) {}
    fn on_run_aborted(&mut self, _by: &str, _not_run: &[String]) {}
    fn on_run_finished(&mut self, _summary: &SuiteSummary) {}
    fn on_probe_finished(&mut self, _outcome: &Result<ProbeReport, ProbeError>) {}
    fn on_error(&mut self, _message: &str) {}
}

// =============================================================================
// MultiReporter
// =============================================================================

/// MultiReporter - broadcasts events to multiple reporters
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new(reporters: Vec<Box<dyn Reporter>>) -> Self {
        Self { reporters }
    }
}

impl Reporter for MultiReporter {
    fn on_run_start(&mut self, count: usize) {
        for r in &mut self.reporters {
            r.on_run_start(count);
        }
    }

    fn on_task_start(&mut self, task: &TestTask) {
        for r in &mut self.reporters {
            r.on_task_start(task);
        }
    }

    fn on_task_finished(&mut self, result: &TaskResult) {
        for r in &mut self.reporters {
            r.on_task_finished(result);
        }
    }

    fn on_run_aborted(&mut self, by: &str, not_run: &[String]) {
        for r in &mut self.reporters {
            r.on_run_aborted(by, not_run);
        }
    }

    fn on_run_finished(&mut self, summary: &SuiteSummary) {
        for r in &mut self.reporters {
            r.on_run_finished(summary);
        }
    }

    fn on_probe_finished(&mut self, outcome: &Result<ProbeReport, ProbeError>) {
        for r in &mut self.reporters {
            r.on_probe_finished(outcome);
        }
    }

    fn on_error(&mut self, message: &str) {
        for r in &mut self.reporters {
            r.on_error(message);
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_json_event_serialization() {
        let event = MachineEvent::TaskFinished {
            name: "unit",
            status: "PASS",
            outcome: "passed",
            critical: true,
            duration_ms: 42,
            message: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"task_finished\""));
        assert!(json.contains("\"name\":\"unit\""));
        assert!(json.contains("\"status\":\"PASS\""));
        assert!(!json.contains("message")); // skip_serializing_if = None
    }

    #[test]
    fn test_failure_message_includes_output_tail() {
        let task = TestTask::new("lint", &["false"], 5, false);
        let result = TaskResult::new(
            &task,
            TaskOutcome::NonZeroExit {
                code: Some(2),
                signal: None,
                output_tail: "error: unused import".to_string(),
            },
            Duration::from_millis(10),
        );
        let message = failure_message(&result).unwrap();
        assert!(message.starts_with("failed with exit code 2"));
        assert!(message.ends_with("error: unused import"));
    }

    #[test]
    fn test_no_failure_message_on_pass() {
        let task = TestTask::new("ok", &["true"], 5, false);
        let result = TaskResult::new(&task, TaskOutcome::Passed, Duration::ZERO);
        assert!(failure_message(&result).is_none());
    }

    #[test]
    fn test_run_aborted_event() {
        let not_run = vec!["later".to_string()];
        let event = MachineEvent::RunAborted {
            by: "build",
            not_run: &not_run,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"run_aborted\""));
        assert!(json.contains("\"not_run\":[\"later\"]"));
    }

    #[test]
    fn test_error_event() {
        let event = MachineEvent::Error {
            message: "Shutdown requested",
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"error\""));
    }
}
