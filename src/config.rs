//! Configuration Loader
//! - CLI argument parsing with clap
//! - Suite declaration loaded from a TOML file (`suitecheck.toml`)

use crate::error::HarnessError;
use crate::precondition::BuildStep;
use crate::probe::ProbeConfig;
use crate::suite::TestTask;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const DEFAULT_SUITE_FILE: &str = "suitecheck.toml";

// =============================================================================
// CLI Configuration
// =============================================================================

/// Output format for results
#[derive(ValueEnum, Clone, Debug, Default, PartialEq)]
pub enum OutputFormat {
    /// Human-readable CLI output (to stderr)
    #[default]
    Human,
    /// Machine-readable NDJSON (to stdout)
    Json,
}

/// suitecheck - sequential test-suite runner and JSON-RPC server probe
#[derive(Parser)]
#[command(name = "suitecheck", version, about = "Sequential test-suite runner and JSON-RPC server probe")]
pub struct Cli {
    /// Output format (also: SUITECHECK_FORMAT env var)
    #[arg(long, value_enum, default_value_t = OutputFormat::Human, env = "SUITECHECK_FORMAT", global = true)]
    pub format: OutputFormat,

    /// Path to generate JUnit XML report (also: SUITECHECK_JUNIT_XML env var)
    #[arg(long, env = "SUITECHECK_JUNIT_XML", global = true)]
    pub junit_xml: Option<PathBuf>,

    /// Suite declaration file (also: SUITECHECK_SUITE env var)
    #[arg(long, short = 's', default_value = DEFAULT_SUITE_FILE, env = "SUITECHECK_SUITE", global = true)]
    pub suite: PathBuf,

    /// Debug-level logging (RUST_LOG overrides)
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Subcommands
#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Run the declared tasks (default if no subcommand)
    Run(RunArgs),
    /// Verify a server's JSON-RPC handshake over stdio
    Probe(ProbeArgs),
    /// List declared tasks without running
    List,
}

#[derive(Args, Clone, Debug, Default, PartialEq)]
pub struct RunArgs {
    /// Do not check or build the `[build]` artifact
    #[arg(long)]
    pub skip_build: bool,
}

#[derive(Args, Clone, Debug, Default, PartialEq)]
pub struct ProbeArgs {
    /// Server executable; replaces the first element of `[probe].command`
    #[arg(long)]
    pub server: Option<PathBuf>,

    /// Seconds to wait for the `initialize` response
    #[arg(long)]
    pub ready_timeout: Option<u64>,

    /// Seconds to wait for later responses (0 = forever)
    #[arg(long)]
    pub response_timeout: Option<u64>,

    /// Fixed delay before the first request, in milliseconds
    #[arg(long)]
    pub warmup_ms: Option<u64>,
}

impl ProbeArgs {
    /// Merge CLI overrides into the file's probe configuration.
    pub fn resolve(&self, from_file: Option<ProbeConfig>) -> Result<ProbeConfig, HarnessError> {
        let mut config = match (from_file, &self.server) {
            (Some(config), _) => config,
            (None, Some(_)) => ProbeConfig::new(Vec::new()),
            (None, None) => {
                return Err(HarnessError::InvalidSuite(
                    "no [probe] table in the suite file and no --server given".to_string(),
                ))
            }
        };

        if let Some(server) = &self.server {
            let server = server.to_string_lossy().into_owned();
            match config.command.first_mut() {
                Some(program) => *program = server,
                None => config.command.push(server),
            }
        }
        if let Some(secs) = self.ready_timeout {
            config.ready_timeout_secs = secs;
        }
        if let Some(secs) = self.response_timeout {
            config.response_timeout_secs = secs;
        }
        if let Some(ms) = self.warmup_ms {
            config.warmup_ms = ms;
        }
        Ok(config)
    }
}

// =============================================================================
// Suite File
// =============================================================================

/// Parsed suite declaration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SuiteFile {
    #[serde(default)]
    pub build: Option<BuildStep>,
    #[serde(default, rename = "task")]
    pub tasks: Vec<TestTask>,
    #[serde(default)]
    pub probe: Option<ProbeConfig>,
}

impl SuiteFile {
    pub fn parse(contents: &str, origin: &Path) -> Result<Self, HarnessError> {
        let suite: SuiteFile = toml::from_str(contents).map_err(|e| HarnessError::Config {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })?;
        suite.validate()?;
        Ok(suite)
    }

    pub fn load(path: &Path) -> Result<Self, HarnessError> {
        let contents = fs::read_to_string(path).map_err(|e| HarnessError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&contents, path)
    }

    /// Reject declarations that cannot run. Duplicate names are allowed.
    pub fn validate(&self) -> Result<(), HarnessError> {
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.command.is_empty() {
                return Err(HarnessError::InvalidSuite(format!(
                    "task '{}' has an empty command",
                    task.name
                )));
            }
            if task.timeout == 0 {
                return Err(HarnessError::InvalidSuite(format!(
                    "task '{}' has a zero timeout",
                    task.name
                )));
            }
            if !seen.insert(task.name.as_str()) {
                warn!(task = %task.name, "duplicate task name");
            }
        }
        if let Some(build) = &self.build {
            if build.command.is_empty() {
                return Err(HarnessError::InvalidSuite(
                    "build step has an empty command".to_string(),
                ));
            }
        }
        if let Some(probe) = &self.probe {
            if probe.command.is_empty() {
                return Err(HarnessError::InvalidSuite(
                    "probe has an empty command".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[build]
artifact = "target/debug/codemate-server"
command = ["cargo", "build", "-p", "codemate-server"]

[[task]]
name = "Rust Unit & E2E Tests"
command = ["cargo", "test", "--all"]
timeout = 60
critical = true

[[task]]
name = "MCP Server Tests"
command = ["./target/debug/suitecheck", "probe"]
timeout = 30

[probe]
command = ["./target/debug/codemate-server", "--mcp"]
database_flag = "--database"
"#;

    #[test]
    fn test_parse_full_suite() {
        let suite = SuiteFile::parse(SAMPLE, Path::new("suitecheck.toml")).unwrap();
        assert_eq!(suite.tasks.len(), 2);
        assert!(suite.tasks[0].critical);
        assert!(!suite.tasks[1].critical);
        assert_eq!(suite.tasks[1].timeout, 30);
        assert_eq!(
            suite.build.unwrap().artifact,
            PathBuf::from("target/debug/codemate-server")
        );
        assert_eq!(suite.probe.unwrap().database_flag.as_deref(), Some("--database"));
    }

    #[test]
    fn test_tasks_keep_declaration_order() {
        let suite = SuiteFile::parse(SAMPLE, Path::new("s.toml")).unwrap();
        let names: Vec<&str> = suite.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Rust Unit & E2E Tests", "MCP Server Tests"]);
    }

    #[test]
    fn test_parse_empty_suite() {
        let suite = SuiteFile::parse("", Path::new("s.toml")).unwrap();
        assert!(suite.tasks.is_empty());
        assert!(suite.build.is_none());
        assert!(suite.probe.is_none());
    }

    #[test]
    fn test_reject_zero_timeout() {
        let err = SuiteFile::parse(
            r#"
[[task]]
name = "t"
command = ["true"]
timeout = 0
"#,
            Path::new("s.toml"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("zero timeout"));
    }

    #[test]
    fn test_reject_empty_command() {
        let err = SuiteFile::parse(
            r#"
[[task]]
name = "t"
command = []
timeout = 5
"#,
            Path::new("s.toml"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("empty command"));
    }

    #[test]
    fn test_reject_shell_string_command() {
        let err = SuiteFile::parse(
            r#"
[[task]]
name = "t"
command = "cargo test"
timeout = 5
"#,
            Path::new("s.toml"),
        )
        .unwrap_err();
        assert!(matches!(err, HarnessError::Config { .. }));
    }

    #[test]
    fn test_duplicate_names_allowed() {
        let suite = SuiteFile::parse(
            r#"
[[task]]
name = "same"
command = ["true"]
timeout = 5

[[task]]
name = "same"
command = ["false"]
timeout = 5
"#,
            Path::new("s.toml"),
        )
        .unwrap();
        assert_eq!(suite.tasks.len(), 2);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let suite = SuiteFile::load(file.path()).unwrap();
        assert_eq!(suite.tasks.len(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        let err = SuiteFile::load(Path::new("/nonexistent/suitecheck.toml")).unwrap_err();
        assert!(matches!(err, HarnessError::Config { .. }));
    }

    #[test]
    fn test_probe_args_override_server() {
        let suite = SuiteFile::parse(SAMPLE, Path::new("s.toml")).unwrap();
        let args = ProbeArgs {
            server: Some(PathBuf::from("/opt/server")),
            ready_timeout: Some(5),
            ..Default::default()
        };
        let config = args.resolve(suite.probe).unwrap();
        assert_eq!(config.command, vec!["/opt/server", "--mcp"]);
        assert_eq!(config.ready_timeout_secs, 5);
    }

    #[test]
    fn test_bundled_suite_outlasts_probe_readiness() {
        let suite = SuiteFile::parse(
            include_str!("../suitecheck.toml"),
            Path::new("suitecheck.toml"),
        )
        .unwrap();
        let probe = suite.probe.unwrap();
        let task = suite
            .tasks
            .iter()
            .find(|t| t.command.last().map(String::as_str) == Some("probe"))
            .unwrap();
        // Otherwise a slow server shows up as a task timeout, never NotReady
        assert!(task.timeout() > probe.warmup() + probe.ready_timeout());
    }

    #[test]
    fn test_probe_args_without_config() {
        assert!(ProbeArgs::default().resolve(None).is_err());

        let args = ProbeArgs {
            server: Some(PathBuf::from("/opt/server")),
            ..Default::default()
        };
        let config = args.resolve(None).unwrap();
        assert_eq!(config.command, vec!["/opt/server"]);
    }
}
