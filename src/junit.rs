//! JUnit XML Reporter for CI Integration
//!
//! Generates JUnit-compatible XML reports for Jenkins, GitLab CI, and GitHub Actions.
//! Tasks that never ran (critical abort, interrupt) are reported as skipped.

use crate::error::ProbeError;
use crate::probe::ProbeReport;
use crate::reporter::Reporter;
use crate::suite::{SuiteSummary, TaskResult, TestTask};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::{error, info};

/// Strip ANSI color codes from strings
fn strip_ansi_codes(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // Skip escape sequence
            if chars.peek() == Some(&'[') {
                chars.next();
                while let Some(&next) = chars.peek() {
                    chars.next();
                    if next.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
        } else if c != '\0' {
            result.push(c);
        }
    }
    result
}

// =============================================================================
// XML Schema Structs (JUnit Format)
// =============================================================================

#[derive(Serialize)]
#[serde(rename = "testsuites")]
struct TestSuites {
    #[serde(rename = "testsuite")]
    suites: Vec<TestSuite>,
}

#[derive(Serialize)]
struct TestSuite {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@tests")]
    tests: usize,
    #[serde(rename = "@failures")]
    failures: usize,
    #[serde(rename = "@errors")]
    errors: usize,
    #[serde(rename = "@skipped")]
    skipped: usize,
    #[serde(rename = "@time")]
    time: f64,
    #[serde(rename = "testcase")]
    cases: Vec<TestCase>,
}

#[derive(Serialize)]
struct TestCase {
    #[serde(rename = "@name")]
    name: String,
    #[serde(rename = "@classname")]
    classname: String,
    #[serde(rename = "@time")]
    time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<Failure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    skipped: Option<Skipped>,
}

#[derive(Serialize)]
struct Failure {
    #[serde(rename = "@message")]
    message: String,
    #[serde(rename = "$text")]
    body: String,
}

#[derive(Serialize)]
struct Skipped {
    #[serde(rename = "@message")]
    message: String,
}

// =============================================================================
// JunitReporter
// =============================================================================

/// Reporter that buffers results and writes JUnit XML on completion
pub struct JunitReporter {
    output_path: PathBuf,
    cases: Vec<TestCase>,
    error_message: Option<String>,
}

impl JunitReporter {
    pub fn new(path: PathBuf) -> Self {
        Self {
            output_path: path,
            cases: Vec::new(),
            error_message: None,
        }
    }

    fn write_suite(&mut self, name: &str, time: f64) {
        let failures = self.cases.iter().filter(|c| c.failure.is_some()).count();
        let skipped = self.cases.iter().filter(|c| c.skipped.is_some()).count();
        let suite = TestSuite {
            name: name.to_string(),
            tests: self.cases.len(),
            failures,
            errors: usize::from(self.error_message.is_some()),
            skipped,
            time,
            cases: std::mem::take(&mut self.cases),
        };
        let root = TestSuites {
            suites: vec![suite],
        };

        let xml = match quick_xml::se::to_string(&root) {
            Ok(xml) => xml,
            Err(e) => {
                error!(error = %e, "failed to serialize JUnit report");
                return;
            }
        };

        let written = File::create(&self.output_path).and_then(|file| {
            let mut writer = BufWriter::new(file);
            writer.write_all(b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n")?;
            writer.write_all(xml.as_bytes())?;
            writer.flush()
        });
        match written {
            Ok(()) => info!(path = %self.output_path.display(), "JUnit report written"),
            Err(e) => error!(path = %self.output_path.display(), error = %e, "failed to write JUnit report"),
        }
    }
}

impl Reporter for JunitReporter {
    fn on_run_start(&mut self, _count: usize) {
        self.cases.clear();
        self.error_message = None;
    }

    fn on_task_start(&mut self, _task: &TestTask) {
        // JUnit has no start event - results are buffered
    }

    fn on_task_finished(&mut self, result: &TaskResult) {
        let failure = if result.success {
            None
        } else {
            let mut body = result.outcome.describe();
            if let Some(tail) = result.outcome.output_tail() {
                body.push('\n');
                body.push_str(tail);
            }
            Some(Failure {
                message: result.status().label().to_string(),
                body: strip_ansi_codes(&body),
            })
        };

        self.cases.push(TestCase {
            name: result.name.clone(),
            classname: "suite".to_string(),
            time: result.duration.as_secs_f64(),
            failure,
            skipped: None,
        });
    }

    fn on_run_aborted(&mut self, _by: &str, _not_run: &[String]) {
        // Not-run tasks are added from the summary
    }

    fn on_run_finished(&mut self, summary: &SuiteSummary) {
        let reason = match &summary.aborted_by {
            Some(by) => format!("not run: critical task '{}' failed", by),
            None => "not run: shutdown requested".to_string(),
        };
        for name in &summary.not_run {
            self.cases.push(TestCase {
                name: name.clone(),
                classname: "suite".to_string(),
                time: 0.0,
                failure: None,
                skipped: Some(Skipped {
                    message: reason.clone(),
                }),
            });
        }
        self.write_suite("suitecheck", summary.duration.as_secs_f64());
    }

    fn on_probe_finished(&mut self, outcome: &Result<ProbeReport, ProbeError>) {
        self.cases.clear();
        let failure = outcome.as_ref().err().map(|e| Failure {
            message: format!("{} failed", e.step()),
            body: strip_ansi_codes(&e.to_string()),
        });
        self.cases.push(TestCase {
            name: "initialize/tools".to_string(),
            classname: "probe".to_string(),
            time: 0.0,
            failure,
            skipped: None,
        });
        self.write_suite("suitecheck-probe", 0.0);
    }

    fn on_error(&mut self, message: &str) {
        self.error_message = Some(message.to_string());
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::TaskOutcome;
    use std::time::Duration;
    use tempfile::TempDir;

    fn result(name: &str, outcome: TaskOutcome, critical: bool) -> TaskResult {
        let task = TestTask::new(name, &["x"], 5, critical);
        TaskResult::new(&task, outcome, Duration::from_millis(1500))
    }

    #[test]
    fn test_strip_ansi_codes() {
        assert_eq!(strip_ansi_codes("\x1b[31mRed text\x1b[0m"), "Red text");
        assert_eq!(strip_ansi_codes("plain text"), "plain text");
        assert_eq!(strip_ansi_codes("\x1b[1;31;40mColored\x1b[0m normal"), "Colored normal");
        assert_eq!(strip_ansi_codes("text\0with\0nulls"), "textwithnulls");
    }

    #[test]
    fn test_junit_reporter_buffers_tasks() {
        let mut reporter = JunitReporter::new(PathBuf::from("/tmp/unused.xml"));
        reporter.on_run_start(2);
        reporter.on_task_finished(&result("a", TaskOutcome::Passed, true));
        reporter.on_task_finished(&result(
            "b",
            TaskOutcome::TimedOut {
                after: Duration::from_secs(5),
            },
            false,
        ));

        assert_eq!(reporter.cases.len(), 2);
        assert!(reporter.cases[0].failure.is_none());
        let failure = reporter.cases[1].failure.as_ref().unwrap();
        assert_eq!(failure.message, "FAIL (SKIPPED)");
        assert_eq!(failure.body, "timed out after 5s");
        assert!((reporter.cases[0].time - 1.5).abs() < 0.001);
    }

    #[test]
    fn test_failure_body_strips_ansi() {
        let mut reporter = JunitReporter::new(PathBuf::from("/tmp/unused.xml"));
        reporter.on_task_finished(&result(
            "c",
            TaskOutcome::NonZeroExit {
                code: Some(1),
                signal: None,
                output_tail: "\x1b[31merror\x1b[0m: boom".to_string(),
            },
            true,
        ));
        let failure = reporter.cases[0].failure.as_ref().unwrap();
        assert!(failure.body.ends_with("error: boom"));
        assert!(!failure.body.contains('\x1b'));
    }

    #[test]
    fn test_report_written_with_skipped_tasks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.xml");
        let mut reporter = JunitReporter::new(path.clone());

        let failed = result(
            "build",
            TaskOutcome::NonZeroExit {
                code: Some(101),
                signal: None,
                output_tail: String::new(),
            },
            true,
        );
        reporter.on_run_start(2);
        reporter.on_task_finished(&failed);
        reporter.on_run_finished(&SuiteSummary {
            results: vec![failed.clone()],
            not_run: vec!["later".to_string()],
            aborted_by: Some("build".to_string()),
            ..Default::default()
        });

        let xml = std::fs::read_to_string(&path).unwrap();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("tests=\"2\""));
        assert!(xml.contains("failures=\"1\""));
        assert!(xml.contains("skipped=\"1\""));
        assert!(xml.contains("not run: critical task"));
    }

    #[test]
    fn test_run_start_clears_state() {
        let mut reporter = JunitReporter::new(PathBuf::from("/tmp/unused.xml"));
        reporter.on_task_finished(&result("a", TaskOutcome::Passed, false));
        reporter.on_error("some error");

        reporter.on_run_start(0);
        assert!(reporter.cases.is_empty());
        assert!(reporter.error_message.is_none());
    }
}
