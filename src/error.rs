//! Error Types
//!
//! Per-task failures are never errors: they are `TaskOutcome` values.
//! What remains here is what can abort a whole run (`HarnessError`) or a
//! whole protocol probe (`ProbeError`).

use crate::probe::ProbeStep;
use serde_json::Value;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that stop a suite run before (or instead of) executing tasks.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The suite file could not be read or parsed.
    #[error("failed to load suite file {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// The suite file parsed but declares something unrunnable.
    #[error("invalid suite declaration: {0}")]
    InvalidSuite(String),

    /// The precondition build step could not be started.
    #[error("failed to launch build step `{command}`: {source}")]
    BuildLaunch {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The precondition build step ran and failed.
    #[error("build step `{command}` failed ({status})")]
    BuildFailed { command: String, status: String },

    /// The build step succeeded but the artifact is still absent.
    #[error("build step finished but {0} does not exist")]
    ArtifactMissing(PathBuf),
}

/// Errors that abort a protocol probe. Teardown runs regardless.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to start server `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// No answer to `initialize` within the readiness window.
    #[error("server did not become ready within {:.1}s", .waited.as_secs_f64())]
    NotReady { waited: Duration },

    /// Response absent, unparsable, mismatched, or lacking `result`.
    #[error("{step} failed: {reason}")]
    Protocol {
        step: ProbeStep,
        reason: String,
        response: Option<Value>,
    },

    #[error("{step} got no response within {:.1}s", .waited.as_secs_f64())]
    ResponseTimeout { step: ProbeStep, waited: Duration },

    /// A shutdown signal arrived while the probe was waiting.
    #[error("interrupted during {step}")]
    Interrupted { step: ProbeStep },

    #[error("i/o error during {step}: {source}")]
    Io {
        step: ProbeStep,
        #[source]
        source: io::Error,
    },
}

impl ProbeError {
    /// The probe step that was in flight when the error occurred.
    pub fn step(&self) -> ProbeStep {
        match self {
            ProbeError::Spawn { .. } => ProbeStep::Spawn,
            ProbeError::NotReady { .. } => ProbeStep::Initialize,
            ProbeError::Protocol { step, .. }
            | ProbeError::ResponseTimeout { step, .. }
            | ProbeError::Interrupted { step }
            | ProbeError::Io { step, .. } => *step,
        }
    }

    /// The offending response, when one was received.
    pub fn response(&self) -> Option<&Value> {
        match self {
            ProbeError::Protocol { response, .. } => response.as_ref(),
            _ => None,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_not_ready_message() {
        let err = ProbeError::NotReady {
            waited: Duration::from_millis(2500),
        };
        assert_eq!(err.to_string(), "server did not become ready within 2.5s");
        assert_eq!(err.step(), ProbeStep::Initialize);
    }

    #[test]
    fn test_protocol_error_carries_response() {
        let err = ProbeError::Protocol {
            step: ProbeStep::ListTools,
            reason: "response has no `result`".to_string(),
            response: Some(json!({"jsonrpc": "2.0", "id": 2, "error": {"code": -32601}})),
        };
        assert_eq!(err.step(), ProbeStep::ListTools);
        assert!(err.to_string().starts_with("tools/list failed"));
        assert_eq!(err.response().unwrap()["id"], 2);
    }

    #[test]
    fn test_build_failed_message() {
        let err = HarnessError::BuildFailed {
            command: "cargo build".to_string(),
            status: "exit status: 101".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "build step `cargo build` failed (exit status: 101)"
        );
    }
}
