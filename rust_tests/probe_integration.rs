//! Integration tests for the protocol probe
//!
//! Fake servers are small `sh` scripts that answer on stdout and record
//! every line they receive, so the tests can check both what the probe
//! concluded and what it actually sent.

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use suitecheck::error::ProbeError;
use suitecheck::probe::{Probe, ProbeConfig, ProbeState, ProbeStep, ToolCall};
use suitecheck::protocol::params;
use tempfile::TempDir;

const INIT_OK: &str =
    r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"fake","version":"0.1"},"capabilities":{}}}"#;
const INIT_ERR: &str = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32603,"message":"index not built"}}"#;
const LIST_OK: &str =
    r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"code_search"},{"name":"get_module_graph"}]}}"#;
const LIST_ERR: &str = r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"no tools"}}"#;

struct FakeServer {
    dir: TempDir,
    script: PathBuf,
}

impl FakeServer {
    /// `on_init`, `on_list` and `on_call` are the lines printed in answer to
    /// each method. `prelude` runs before the read loop.
    fn new(prelude: &str, on_init: &str, on_list: &str, on_call: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("server.sh");
        let body = format!(
            r#"log="$1"
shift
if [ "$1" = "--database" ]; then touch "$2"; echo "$2" > "$log.db"; fi
echo "fake server starting" >&2
{prelude}
while IFS= read -r line; do
  printf '%s\n' "$line" >> "$log"
  case "$line" in
    *'"method":"initialize"'*) printf '%s\n' '{on_init}' ;;
    *'"method":"tools/list"'*) printf '%s\n' '{on_list}' ;;
    *'"method":"tools/call"'*) printf '%s\n' '{on_call}' ;;
  esac
done
"#
        );
        fs::write(&script, body).unwrap();
        Self { dir, script }
    }

    fn conforming() -> Self {
        Self::new(
            "",
            INIT_OK,
            LIST_OK,
            r#"{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"3 matches"}]}}"#,
        )
    }

    fn log_path(&self) -> PathBuf {
        self.dir.path().join("received.log")
    }

    fn config(&self) -> ProbeConfig {
        let mut config = ProbeConfig::new(vec![
            "sh".to_string(),
            self.script.display().to_string(),
            self.log_path().display().to_string(),
        ]);
        config.ready_timeout_secs = 10;
        config.response_timeout_secs = 10;
        config
    }

    /// Lines the server received, parsed.
    fn received(&self) -> Vec<Value> {
        fs::read_to_string(self.log_path())
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).expect("probe sent a non-JSON line"))
            .collect()
    }
}

fn is_alive(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .map_or(false, |state| state != "Z"),
        Err(_) => false,
    }
}

// =============================================================================
// Happy path
// =============================================================================

#[test]
fn test_conforming_server_passes() {
    let server = FakeServer::conforming();
    let mut probe = Probe::new(server.config());

    let report = probe.run().expect("probe should pass");

    assert_eq!(report.tools, vec!["code_search", "get_module_graph"]);
    assert_eq!(report.protocol_version.as_deref(), Some("2024-11-05"));
    assert_eq!(report.server_info.unwrap()["name"], "fake");
    assert!(report.call_result.is_none());
    assert_eq!(
        probe.history(),
        &[
            ProbeState::Starting,
            ProbeState::Initializing,
            ProbeState::Initialized,
            ProbeState::Listing,
            ProbeState::Done,
        ]
    );
    assert_eq!(probe.teardowns(), 1);
}

#[test]
fn test_wire_sequence_seen_by_server() {
    let server = FakeServer::conforming();
    let mut probe = Probe::new(server.config());
    probe.run().unwrap();

    let received = server.received();
    assert_eq!(received.len(), 3, "got {:?}", received);

    let init = &received[0];
    assert_eq!(init["jsonrpc"], "2.0");
    assert_eq!(init["id"], 1);
    assert_eq!(init["method"], "initialize");
    assert_eq!(init["params"]["protocolVersion"], "2024-11-05");
    assert_eq!(init["params"]["clientInfo"]["name"], "suitecheck");

    let note = &received[1];
    assert_eq!(note["method"], "initialized");
    assert!(note.get("id").is_none());

    let list = &received[2];
    assert_eq!(list["method"], "tools/list");
    assert_eq!(list["id"], 2);
}

#[test]
fn test_tool_call_step() {
    let server = FakeServer::conforming();
    let mut config = server.config();
    config.expected_tools = vec!["code_search".to_string()];
    config.call = Some(ToolCall {
        tool: "code_search".to_string(),
        arguments: params(json!({"query": "main"})),
    });
    let mut probe = Probe::new(config);

    let report = probe.run().unwrap();

    assert_eq!(
        report.call_result.unwrap()["content"][0]["text"],
        "3 matches"
    );
    assert!(probe.history().contains(&ProbeState::Invoking));

    let call = &server.received()[3];
    assert_eq!(call["id"], 3);
    assert_eq!(call["params"]["name"], "code_search");
    assert_eq!(call["params"]["arguments"]["query"], "main");
}

#[test]
fn test_scratch_database_created_and_removed() {
    let server = FakeServer::conforming();
    let mut config = server.config();
    config.database_flag = Some("--database".to_string());
    let mut probe = Probe::new(config);

    probe.run().unwrap();

    let scratch = probe.scratch_path().expect("scratch dir recorded").to_path_buf();
    let db_seen = fs::read_to_string(format!("{}.db", server.log_path().display())).unwrap();
    assert!(Path::new(db_seen.trim()).starts_with(&scratch));
    assert!(db_seen.trim().ends_with("probe.db"));
    assert!(!scratch.exists(), "scratch dir should be removed");
}

#[test]
fn test_server_terminated_after_run() {
    let server = FakeServer::conforming();
    let mut probe = Probe::new(server.config());
    probe.run().unwrap();

    let pid = probe.server_pid().unwrap();
    assert!(!is_alive(pid));
}

#[test]
fn test_notifications_before_response_are_skipped() {
    let server = FakeServer::new(
        r#"echo '{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info"}}'; echo"#,
        INIT_OK,
        LIST_OK,
        "",
    );
    let mut probe = Probe::new(server.config());
    assert!(probe.run().is_ok());
}

// =============================================================================
// Failure paths
// =============================================================================

#[test]
fn test_initialize_error_halts_before_notification() {
    let server = FakeServer::new("", INIT_ERR, LIST_OK, "");
    let mut probe = Probe::new(server.config());

    let err = probe.run().unwrap_err();

    assert_eq!(err.step(), ProbeStep::Initialize);
    assert!(err.to_string().contains("index not built"), "{}", err);
    assert_eq!(err.response().unwrap()["error"]["code"], -32603);
    assert_eq!(
        probe.state(),
        Some(ProbeState::Failed(ProbeStep::Initialize))
    );
    assert!(!probe.history().contains(&ProbeState::Initialized));
    assert_eq!(probe.teardowns(), 1);

    let received = server.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["method"], "initialize");
}

#[test]
fn test_list_error_fails_at_listing() {
    let server = FakeServer::new("", INIT_OK, LIST_ERR, "");
    let mut probe = Probe::new(server.config());

    let err = probe.run().unwrap_err();

    assert_eq!(err.step(), ProbeStep::ListTools);
    assert_eq!(probe.state(), Some(ProbeState::Failed(ProbeStep::ListTools)));
    assert_eq!(probe.teardowns(), 1);
}

#[test]
fn test_missing_expected_tool_fails() {
    let server = FakeServer::conforming();
    let mut config = server.config();
    config.expected_tools = vec!["code_search".to_string(), "rename_symbol".to_string()];
    let mut probe = Probe::new(config);

    let err = probe.run().unwrap_err();

    assert_eq!(err.step(), ProbeStep::ListTools);
    assert!(err.to_string().contains("rename_symbol"));
    assert!(!err.to_string().contains("\"code_search\""));
}

#[test]
fn test_tool_reporting_error_fails_call() {
    let server = FakeServer::new(
        "",
        INIT_OK,
        LIST_OK,
        r#"{"jsonrpc":"2.0","id":3,"result":{"isError":true,"content":[]}}"#,
    );
    let mut config = server.config();
    config.call = Some(ToolCall {
        tool: "code_search".to_string(),
        arguments: Default::default(),
    });
    let mut probe = Probe::new(config);

    let err = probe.run().unwrap_err();
    assert_eq!(err.step(), ProbeStep::CallTool);
    assert_eq!(probe.teardowns(), 1);
}

#[test]
fn test_server_exiting_immediately() {
    let mut probe = Probe::new(ProbeConfig::new(vec![
        "sh".to_string(),
        "-c".to_string(),
        "exit 0".to_string(),
    ]));

    let err = probe.run().unwrap_err();

    // Either the write or the read notices first
    assert_eq!(err.step(), ProbeStep::Initialize);
    assert!(matches!(
        err,
        ProbeError::Protocol { .. } | ProbeError::Io { .. }
    ));
    assert_eq!(probe.teardowns(), 1);
}

#[test]
fn test_silent_server_is_not_ready() {
    let mut config = ProbeConfig::new(vec!["sh".to_string(), "-c".to_string(), "cat > /dev/null".to_string()]);
    config.ready_timeout_secs = 1;
    let mut probe = Probe::new(config);

    let start = Instant::now();
    let err = probe.run().unwrap_err();

    assert!(matches!(err, ProbeError::NotReady { .. }), "got {:?}", err);
    assert!(start.elapsed() < Duration::from_secs(8));
    assert_eq!(probe.teardowns(), 1);
    assert!(!is_alive(probe.server_pid().unwrap()));
}

#[test]
fn test_server_ignoring_sigterm_is_killed() {
    let server = FakeServer::new("trap '' TERM", INIT_OK, LIST_OK, "");
    let mut probe = Probe::new(server.config());

    probe.run().unwrap();

    assert!(!is_alive(probe.server_pid().unwrap()));
}

#[test]
fn test_garbage_output_is_protocol_failure() {
    let server = FakeServer::new("", "Loading model...", LIST_OK, "");
    let mut probe = Probe::new(server.config());

    let err = probe.run().unwrap_err();

    assert_eq!(err.step(), ProbeStep::Initialize);
    assert!(matches!(err, ProbeError::Protocol { .. }));
    assert_eq!(
        err.response(),
        Some(&Value::String("Loading model...".to_string()))
    );
}

#[test]
fn test_missing_server_binary() {
    let mut probe = Probe::new(ProbeConfig::new(vec![
        "/nonexistent/suitecheck-server".to_string(),
    ]));

    let err = probe.run().unwrap_err();

    assert!(matches!(err, ProbeError::Spawn { .. }));
    assert_eq!(probe.state(), Some(ProbeState::Failed(ProbeStep::Spawn)));
    assert_eq!(probe.teardowns(), 0);
}
