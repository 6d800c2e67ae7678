//! Build precondition
//!
//! Before any task runs, the artifact under test must exist. If it does
//! not, the build step runs once, synchronously. Its output goes to our
//! stderr. A failed build is fatal for the whole run.

use crate::error::HarnessError;
use serde::Deserialize;
use std::path::PathBuf;
use std::io;
use std::process::{Command, Stdio};
use tracing::info;

/// `[build]` table of the suite file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BuildStep {
    /// Path whose existence satisfies the precondition.
    pub artifact: PathBuf,
    /// Argument vector producing the artifact.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildAction {
    AlreadyPresent,
    Built,
}

/// Build the artifact if it is missing.
pub fn ensure_artifact(step: &BuildStep) -> Result<BuildAction, HarnessError> {
    if step.artifact.exists() {
        info!(artifact = %step.artifact.display(), "build artifact present");
        return Ok(BuildAction::AlreadyPresent);
    }

    let command_line = step.command.join(" ");
    let Some((program, args)) = step.command.split_first() else {
        return Err(HarnessError::InvalidSuite(
            "build step has an empty command".to_string(),
        ));
    };

    info!(artifact = %step.artifact.display(), command = %command_line, "building missing artifact");

    // Build chatter goes to stderr; stdout is reserved for machine events
    let status = Command::new(program)
        .args(args)
        .stdout(Stdio::from(io::stderr()))
        .status()
        .map_err(|source| HarnessError::BuildLaunch {
            command: command_line.clone(),
            source,
        })?;

    if !status.success() {
        return Err(HarnessError::BuildFailed {
            command: command_line,
            status: status.to_string(),
        });
    }

    if !step.artifact.exists() {
        return Err(HarnessError::ArtifactMissing(step.artifact.clone()));
    }

    Ok(BuildAction::Built)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn step(artifact: PathBuf, command: &[&str]) -> BuildStep {
        BuildStep {
            artifact,
            command: command.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn test_present_artifact_skips_build() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("server");
        std::fs::write(&artifact, b"").unwrap();

        // `false` would fail if it ran
        let action = ensure_artifact(&step(artifact, &["false"])).unwrap();
        assert_eq!(action, BuildAction::AlreadyPresent);
    }

    #[test]
    fn test_missing_artifact_is_built() {
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("server");
        let path = artifact.to_str().unwrap().to_string();

        let action = ensure_artifact(&step(artifact.clone(), &["touch", &path])).unwrap();
        assert_eq!(action, BuildAction::Built);
        assert!(artifact.exists());
    }

    #[test]
    fn test_failed_build_is_fatal() {
        let dir = TempDir::new().unwrap();
        let err = ensure_artifact(&step(dir.path().join("server"), &["false"])).unwrap_err();
        assert!(matches!(err, HarnessError::BuildFailed { .. }));
    }

    #[test]
    fn test_build_without_artifact() {
        let dir = TempDir::new().unwrap();
        let err = ensure_artifact(&step(dir.path().join("server"), &["true"])).unwrap_err();
        assert!(matches!(err, HarnessError::ArtifactMissing(_)));
    }

    #[test]
    fn test_unlaunchable_build() {
        let dir = TempDir::new().unwrap();
        let err = ensure_artifact(&step(
            dir.path().join("server"),
            &["suitecheck_no_such_build_tool"],
        ))
        .unwrap_err();
        assert!(matches!(err, HarnessError::BuildLaunch { .. }));
    }
}
