//! CLI Integration Tests
//!
//! Tests for:
//! - argument parsing (subcommands, global flags, defaults)
//! - the `suitecheck` binary end to end: exit codes and NDJSON output

use clap::Parser;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, Instant};
use suitecheck::config::{Cli, Commands, OutputFormat, DEFAULT_SUITE_FILE};
use suitecheck::reporter::{HumanReporter, JsonReporter, MultiReporter, Reporter};
use tempfile::TempDir;

// =============================================================================
// Parsing
// =============================================================================

#[test]
fn test_no_subcommand_defaults_to_run() {
    let cli = Cli::try_parse_from(["suitecheck"]).unwrap();
    assert!(cli.command.is_none());
    assert_eq!(cli.suite, PathBuf::from(DEFAULT_SUITE_FILE));
    assert!(!cli.verbose);
}

#[test]
fn test_global_flags_after_subcommand() {
    let cli = Cli::try_parse_from([
        "suitecheck",
        "run",
        "--skip-build",
        "--format",
        "json",
        "--junit-xml",
        "report.xml",
        "-s",
        "ci.toml",
    ])
    .unwrap();

    assert_eq!(cli.format, OutputFormat::Json);
    assert_eq!(cli.junit_xml, Some(PathBuf::from("report.xml")));
    assert_eq!(cli.suite, PathBuf::from("ci.toml"));
    match cli.command {
        Some(Commands::Run(args)) => assert!(args.skip_build),
        _ => panic!("expected run"),
    }
}

#[test]
fn test_probe_overrides() {
    let cli = Cli::try_parse_from([
        "suitecheck",
        "probe",
        "--server",
        "./target/debug/codemate-server",
        "--ready-timeout",
        "5",
        "--warmup-ms",
        "250",
    ])
    .unwrap();

    match cli.command {
        Some(Commands::Probe(args)) => {
            assert_eq!(
                args.server,
                Some(PathBuf::from("./target/debug/codemate-server"))
            );
            assert_eq!(args.ready_timeout, Some(5));
            assert_eq!(args.response_timeout, None);
            assert_eq!(args.warmup_ms, Some(250));
        }
        _ => panic!("expected probe"),
    }
}

#[test]
fn test_rejects_unknown_format() {
    assert!(Cli::try_parse_from(["suitecheck", "--format", "xml"]).is_err());
}

#[test]
fn test_reporters_compose() {
    fn accepts_reporter<T: Reporter>(_r: T) {}
    accepts_reporter(HumanReporter);
    accepts_reporter(JsonReporter);
    accepts_reporter(MultiReporter::new(vec![Box::new(HumanReporter)]));
}

// =============================================================================
// Binary
// =============================================================================

fn suitecheck(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_suitecheck"))
        .args(args)
        .current_dir(dir)
        .env_remove("SUITECHECK_FORMAT")
        .env_remove("SUITECHECK_JUNIT_XML")
        .env_remove("SUITECHECK_SUITE")
        .env_remove("RUST_LOG")
        .output()
        .expect("suitecheck binary should run")
}

/// Alive means present in /proc and not a zombie.
fn is_alive(pid: i32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .map_or(false, |state| state != "Z"),
        Err(_) => false,
    }
}

fn wait_until_dead(pid: i32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while is_alive(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    true
}

fn events(output: &Output) -> Vec<Value> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|l| serde_json::from_str(l).expect("stdout must be pure NDJSON"))
        .collect()
}

fn write_suite(dir: &Path, contents: &str) {
    fs::write(dir.join(DEFAULT_SUITE_FILE), contents).unwrap();
}

#[test]
fn test_binary_passing_suite() {
    let dir = TempDir::new().unwrap();
    write_suite(
        dir.path(),
        r#"
[[task]]
name = "ok"
command = ["true"]
timeout = 5
critical = true

[[task]]
name = "flaky"
command = ["false"]
timeout = 5
"#,
    );

    let output = suitecheck(dir.path(), &["--format", "json"]);
    assert_eq!(output.status.code(), Some(0));

    let events = events(&output);
    let kinds: Vec<&str> = events.iter().map(|e| e["event"].as_str().unwrap()).collect();
    assert_eq!(
        kinds,
        vec!["run_start", "task_start", "task_finished", "task_start", "task_finished", "run_finished"]
    );
    assert_eq!(events[4]["status"], "FAIL (SKIPPED)");
    assert_eq!(events[5]["success"], true);
}

#[test]
fn test_binary_critical_failure_exit_code_and_junit() {
    let dir = TempDir::new().unwrap();
    write_suite(
        dir.path(),
        r#"
[[task]]
name = "gate"
command = ["sh", "-c", "echo broken >&2; exit 2"]
timeout = 5
critical = true

[[task]]
name = "later"
command = ["touch", "later.marker"]
timeout = 5
"#,
    );

    let output = suitecheck(
        dir.path(),
        &["run", "--format", "json", "--junit-xml", "report.xml"],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(!dir.path().join("later.marker").exists());

    let events = events(&output);
    let aborted = events
        .iter()
        .find(|e| e["event"] == "run_aborted")
        .expect("run_aborted event");
    assert_eq!(aborted["by"], "gate");
    assert_eq!(aborted["not_run"][0], "later");

    let xml = fs::read_to_string(dir.path().join("report.xml")).unwrap();
    assert!(xml.contains("broken"));
    assert!(xml.contains("skipped=\"1\""));
}

#[test]
fn test_binary_missing_suite_file() {
    let dir = TempDir::new().unwrap();
    let output = suitecheck(dir.path(), &["run"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains(DEFAULT_SUITE_FILE));
}

#[test]
fn test_binary_list() {
    let dir = TempDir::new().unwrap();
    write_suite(
        dir.path(),
        r#"
[[task]]
name = "unit"
command = ["cargo", "test"]
timeout = 60
critical = true
"#,
    );

    let output = suitecheck(dir.path(), &["list"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("unit [critical] (60s): cargo test"), "{}", stdout);
}

#[test]
fn test_binary_probe() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("server.sh"),
        r#"while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*) echo '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05"}}' ;;
    *'"method":"tools/list"'*) echo '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"code_search"}]}}' ;;
  esac
done
"#,
    )
    .unwrap();
    write_suite(
        dir.path(),
        r#"
[probe]
command = ["sh", "server.sh"]
ready_timeout_secs = 10
expected_tools = ["code_search"]
"#,
    );

    let output = suitecheck(dir.path(), &["probe", "--format", "json"]);
    assert_eq!(output.status.code(), Some(0), "{}", String::from_utf8_lossy(&output.stderr));

    let events = events(&output);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event"], "probe_finished");
    assert_eq!(events[0]["success"], true);
    assert_eq!(events[0]["tools"][0], "code_search");
}

#[test]
fn test_binary_probe_failure_exit_code() {
    let dir = TempDir::new().unwrap();
    let output = suitecheck(
        dir.path(),
        &["probe", "--server", "/nonexistent/server", "--format", "json"],
    );
    assert_eq!(output.status.code(), Some(1));

    let events = events(&output);
    assert_eq!(events[0]["success"], false);
    assert_eq!(events[0]["step"], "server start");
}

// =============================================================================
// Build precondition
// =============================================================================

#[test]
fn test_build_output_keeps_stdout_ndjson() {
    let dir = TempDir::new().unwrap();
    write_suite(
        dir.path(),
        r#"
[build]
artifact = "server"
command = ["sh", "-c", "echo Compiling server; touch server"]

[[task]]
name = "ok"
command = ["true"]
timeout = 5
"#,
    );

    let output = suitecheck(dir.path(), &["run", "--format", "json"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(dir.path().join("server").exists());

    // `events` rejects any non-JSON stdout line
    let events = events(&output);
    assert_eq!(events[0]["event"], "run_start");
    assert!(String::from_utf8_lossy(&output.stderr).contains("Compiling server"));
}

#[test]
fn test_failed_build_runs_no_tasks() {
    let dir = TempDir::new().unwrap();
    write_suite(
        dir.path(),
        r#"
[build]
artifact = "server"
command = ["false"]

[[task]]
name = "never"
command = ["touch", "task.marker"]
timeout = 5
"#,
    );

    let output = suitecheck(dir.path(), &["run", "--format", "json"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(!dir.path().join("task.marker").exists());

    let events = events(&output);
    assert_eq!(events.len(), 1, "{:?}", events);
    assert_eq!(events[0]["event"], "error");
    assert!(events[0]["message"].as_str().unwrap().contains("build step"));
}

// =============================================================================
// Probe as a suite task
// =============================================================================

#[test]
fn test_timed_out_probe_task_leaves_no_server_or_scratch() {
    let dir = TempDir::new().unwrap();
    let scratch_root = dir.path().join("tmp");
    fs::create_dir(&scratch_root).unwrap();
    write_suite(
        dir.path(),
        &format!(
            r#"
[[task]]
name = "nested"
command = ["{bin}", "probe"]
timeout = 2

[probe]
command = ["sh", "-c", "echo $$ > server.pid; exec sleep 60"]
database_flag = "--database"
ready_timeout_secs = 30
"#,
            bin = env!("CARGO_BIN_EXE_suitecheck")
        ),
    );

    let output = Command::new(env!("CARGO_BIN_EXE_suitecheck"))
        .args(["run", "--format", "json"])
        .current_dir(dir.path())
        .env("TMPDIR", &scratch_root)
        .env_remove("SUITECHECK_FORMAT")
        .env_remove("SUITECHECK_JUNIT_XML")
        .env_remove("SUITECHECK_SUITE")
        .env_remove("RUST_LOG")
        .output()
        .expect("suitecheck binary should run");

    let events = events(&output);
    let finished = events
        .iter()
        .find(|e| e["event"] == "task_finished")
        .expect("task_finished event");
    assert_eq!(finished["outcome"], "timeout");

    let server: i32 = fs::read_to_string(dir.path().join("server.pid"))
        .expect("server should have started")
        .trim()
        .parse()
        .unwrap();
    assert!(
        wait_until_dead(server, Duration::from_secs(5)),
        "server {} outlived the timed-out task",
        server
    );

    let leaked: Vec<_> = fs::read_dir(&scratch_root)
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert!(leaked.is_empty(), "leaked scratch dirs: {:?}", leaked);
}
