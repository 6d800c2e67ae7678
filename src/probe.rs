//! Protocol Probe
//!
//! Starts a server process and verifies its JSON-RPC lifecycle over stdio:
//!
//! ```text
//! Starting -> Initializing -> Initialized -> Listing [-> Invoking] -> Done
//!      \            \               \            \          \
//!       +------------+---------------+------------+----------+--> Failed(step)
//! ```
//!
//! The server is owned by a `ServerGuard`; teardown runs exactly once per
//! probe run whichever step fails, including when a shutdown signal cuts a
//! wait short.

use crate::client::{spawn_line_reader, spawn_stderr_drain, CallError, RecvError, RpcClient};
use crate::error::ProbeError;
use crate::lifecycle::ServerGuard;
use crate::protocol::{params, Params, RpcResponse};
use crate::signals::ShutdownFlag;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Notification sent once `initialize` succeeded.
pub const INITIALIZED_NOTIFICATION: &str = "initialized";

/// File name of the scratch database inside the probe's temporary directory.
const SCRATCH_DB_NAME: &str = "probe.db";

const WARMUP_SLICE: Duration = Duration::from_millis(100);

fn default_ready_timeout_secs() -> u64 {
    30
}

fn default_protocol_version() -> String {
    "2024-11-05".to_string()
}

fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Optional `tools/call` step.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub arguments: Params,
}

/// How to start and exercise the server. Loaded from the `[probe]` table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProbeConfig {
    /// Server argument vector.
    pub command: Vec<String>,
    /// If set, a scratch directory is created and `<flag> <dir>/probe.db`
    /// is appended to the server's arguments.
    #[serde(default)]
    pub database_flag: Option<String>,
    /// Fixed delay before the first request.
    #[serde(default)]
    pub warmup_ms: u64,
    /// Upper bound on the wait for the `initialize` response.
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
    /// Upper bound on later responses; 0 waits indefinitely.
    #[serde(default)]
    pub response_timeout_secs: u64,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default = "default_client_version")]
    pub client_version: String,
    /// Tool names that must appear in `tools/list`.
    #[serde(default)]
    pub expected_tools: Vec<String>,
    #[serde(default)]
    pub call: Option<ToolCall>,
}

impl ProbeConfig {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            database_flag: None,
            warmup_ms: 0,
            ready_timeout_secs: default_ready_timeout_secs(),
            response_timeout_secs: 0,
            protocol_version: default_protocol_version(),
            client_name: default_client_name(),
            client_version: default_client_version(),
            expected_tools: Vec::new(),
            call: None,
        }
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        (self.response_timeout_secs > 0).then(|| Duration::from_secs(self.response_timeout_secs))
    }

    fn initialize_params(&self) -> Params {
        let client = json!({
            "name": self.client_name,
            "version": self.client_version,
        });
        params(json!({
            "protocolVersion": self.protocol_version,
            "capabilities": {},
            "clientInfo": client,
            "implementation": client,
        }))
    }
}

/// Step of the probe sequence, named by the method it exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStep {
    Spawn,
    Initialize,
    Initialized,
    ListTools,
    CallTool,
}

impl ProbeStep {
    pub fn method(self) -> &'static str {
        match self {
            ProbeStep::Spawn => "server start",
            ProbeStep::Initialize => "initialize",
            ProbeStep::Initialized => INITIALIZED_NOTIFICATION,
            ProbeStep::ListTools => "tools/list",
            ProbeStep::CallTool => "tools/call",
        }
    }
}

impl fmt::Display for ProbeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Starting,
    Initializing,
    Initialized,
    Listing,
    Invoking,
    Done,
    Failed(ProbeStep),
}

/// What a successful probe observed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub protocol_version: Option<String>,
    pub server_info: Option<Value>,
    pub tools: Vec<String>,
    pub call_result: Option<Value>,
}

pub struct Probe {
    config: ProbeConfig,
    state: Option<ProbeState>,
    history: Vec<ProbeState>,
    teardowns: usize,
    server_pid: Option<u32>,
    scratch_path: Option<PathBuf>,
    shutdown: ShutdownFlag,
}

impl Probe {
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            config,
            state: None,
            history: Vec::new(),
            teardowns: 0,
            server_pid: None,
            scratch_path: None,
            shutdown: ShutdownFlag::new(),
        }
    }

    /// Stop waiting and tear down once `shutdown` is requested.
    pub fn with_shutdown(mut self, shutdown: ShutdownFlag) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Current state; `None` before `run`.
    pub fn state(&self) -> Option<ProbeState> {
        self.state
    }

    /// Every state entered, in order.
    pub fn history(&self) -> &[ProbeState] {
        &self.history
    }

    /// How many times the server was torn down.
    pub fn teardowns(&self) -> usize {
        self.teardowns
    }

    pub fn server_pid(&self) -> Option<u32> {
        self.server_pid
    }

    pub fn scratch_path(&self) -> Option<&Path> {
        self.scratch_path.as_deref()
    }

    fn transition(&mut self, next: ProbeState) {
        debug!(from = ?self.state, to = ?next, "probe state");
        self.state = Some(next);
        self.history.push(next);
    }

    /// Run the whole sequence. The server is always torn down before this
    /// returns.
    pub fn run(&mut self) -> Result<ProbeReport, ProbeError> {
        self.transition(ProbeState::Starting);

        let mut guard = match self.start_server() {
            Ok(guard) => guard,
            Err(e) => {
                self.transition(ProbeState::Failed(e.step()));
                return Err(e);
            }
        };

        let outcome = self.drive(&mut guard);

        if guard.teardown() {
            self.teardowns += 1;
        }

        if let Err(e) = &outcome {
            warn!(step = %e.step(), error = %e, "probe failed");
            self.transition(ProbeState::Failed(e.step()));
        }
        outcome
    }

    fn start_server(&mut self) -> Result<ServerGuard, ProbeError> {
        let command_line = self.config.command.join(" ");
        let spawn_error = |source: io::Error| ProbeError::Spawn {
            command: command_line.clone(),
            source,
        };

        let Some((program, args)) = self.config.command.split_first() else {
            return Err(spawn_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty server command",
            )));
        };

        let scratch = match self.config.database_flag {
            Some(_) => Some(
                tempfile::Builder::new()
                    .prefix("suitecheck-probe-")
                    .tempdir()
                    .map_err(&spawn_error)?,
            ),
            None => None,
        };

        let mut command = Command::new(program);
        command.args(args);
        if let (Some(flag), Some(dir)) = (&self.config.database_flag, &scratch) {
            command.arg(flag).arg(dir.path().join(SCRATCH_DB_NAME));
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // On failure `scratch` drops here and removes the directory
        let child = command.spawn().map_err(&spawn_error)?;
        let guard = ServerGuard::new(child, scratch);

        self.server_pid = Some(guard.pid());
        self.scratch_path = guard.scratch_path().map(Path::to_path_buf);
        info!(pid = guard.pid(), command = %command_line, "server started");

        Ok(guard)
    }

    fn drive(&mut self, guard: &mut ServerGuard) -> Result<ProbeReport, ProbeError> {
        let child = guard.child_mut();
        let missing = |what: &str| ProbeError::Io {
            step: ProbeStep::Spawn,
            source: io::Error::new(io::ErrorKind::BrokenPipe, format!("server {} not captured", what)),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_drain(stderr);
        }

        let mut client =
            RpcClient::new(stdin, spawn_line_reader(stdout)).with_shutdown(self.shutdown.clone());
        self.handshake(&mut client)
    }

    fn handshake<W: Write>(&mut self, client: &mut RpcClient<W>) -> Result<ProbeReport, ProbeError> {
        let warmup = self.config.warmup();
        if !warmup.is_zero() {
            debug!(warmup_ms = self.config.warmup_ms, "waiting for server warm-up");
            let until = Instant::now() + warmup;
            while Instant::now() < until {
                if self.shutdown.is_requested() {
                    return Err(ProbeError::Interrupted {
                        step: ProbeStep::Initialize,
                    });
                }
                std::thread::sleep(until.saturating_duration_since(Instant::now()).min(WARMUP_SLICE));
            }
        }

        // Initialize: the first response doubles as the readiness signal
        self.transition(ProbeState::Initializing);
        let id = client
            .send_request("initialize", self.config.initialize_params())
            .map_err(|source| ProbeError::Io {
                step: ProbeStep::Initialize,
                source,
            })?;
        let response = client
            .next_response(Some(self.config.ready_timeout()))
            .map_err(|e| match e {
                RecvError::Timeout(waited) => ProbeError::NotReady { waited },
                other => recv_failure(ProbeStep::Initialize, other),
            })?;
        let init = expect_result(ProbeStep::Initialize, id, response)?;
        self.transition(ProbeState::Initialized);
        info!("initialize successful");

        client
            .notify(INITIALIZED_NOTIFICATION, Params::new())
            .map_err(|source| ProbeError::Io {
                step: ProbeStep::Initialized,
                source,
            })?;

        // Listing
        self.transition(ProbeState::Listing);
        let listing = self.call(client, ProbeStep::ListTools, Params::new())?;
        let tools = tool_names(&listing)?;
        if tools.is_empty() {
            warn!("server advertises no tools");
        }
        let missing: Vec<&str> = self
            .config
            .expected_tools
            .iter()
            .filter(|name| !tools.contains(*name))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(ProbeError::Protocol {
                step: ProbeStep::ListTools,
                reason: format!("missing expected tools: {:?}", missing),
                response: Some(listing),
            });
        }
        info!(?tools, "found tools");

        // Invoking
        let mut call_result = None;
        if let Some(call) = self.config.call.clone() {
            self.transition(ProbeState::Invoking);
            let result = self.call(
                client,
                ProbeStep::CallTool,
                params(json!({"name": call.tool, "arguments": call.arguments})),
            )?;
            if result.get("isError").and_then(Value::as_bool) == Some(true) {
                return Err(ProbeError::Protocol {
                    step: ProbeStep::CallTool,
                    reason: format!("tool `{}` reported an error", call.tool),
                    response: Some(result),
                });
            }
            info!(tool = %call.tool, "tool call successful");
            call_result = Some(result);
        }

        self.transition(ProbeState::Done);

        Ok(ProbeReport {
            protocol_version: init
                .get("protocolVersion")
                .and_then(Value::as_str)
                .map(str::to_string),
            server_info: init.get("serverInfo").cloned(),
            tools,
            call_result,
        })
    }

    /// Request/response for a step after the handshake; returns `result`.
    fn call<W: Write>(
        &self,
        client: &mut RpcClient<W>,
        step: ProbeStep,
        params: Params,
    ) -> Result<Value, ProbeError> {
        let timeout = self.config.response_timeout();
        match client.call(step.method(), params, timeout) {
            Ok((id, response)) => expect_result(step, id, response),
            Err(CallError::Send(source)) => Err(ProbeError::Io { step, source }),
            Err(CallError::Recv(e)) => Err(recv_failure(step, e)),
        }
    }
}

fn recv_failure(step: ProbeStep, error: RecvError) -> ProbeError {
    match error {
        RecvError::Closed => ProbeError::Protocol {
            step,
            reason: "no response (server closed its output)".to_string(),
            response: None,
        },
        RecvError::Timeout(waited) => ProbeError::ResponseTimeout { step, waited },
        RecvError::Interrupted => ProbeError::Interrupted { step },
        RecvError::Io(source) => ProbeError::Io { step, source },
        RecvError::Malformed { error, line } => ProbeError::Protocol {
            step,
            reason: error.to_string(),
            response: Some(Value::String(line)),
        },
    }
}

/// The response must answer `id` and carry a `result` key.
fn expect_result(step: ProbeStep, id: u64, response: RpcResponse) -> Result<Value, ProbeError> {
    if !response.answers(id) {
        let got = response.id().map(Value::to_string).unwrap_or_else(|| "none".to_string());
        return Err(ProbeError::Protocol {
            step,
            reason: format!("response id {} does not match request id {}", got, id),
            response: Some(response.into_value()),
        });
    }
    if !response.has_result() {
        let reason = match response.error() {
            Some(error) => format!("server returned error {}", error),
            None => "response has no `result`".to_string(),
        };
        return Err(ProbeError::Protocol {
            step,
            reason,
            response: Some(response.into_value()),
        });
    }
    Ok(response.result().cloned().unwrap_or(Value::Null))
}

/// Extract tool names from a `tools/list` result.
fn tool_names(result: &Value) -> Result<Vec<String>, ProbeError> {
    let invalid = |reason: String| ProbeError::Protocol {
        step: ProbeStep::ListTools,
        reason,
        response: Some(result.clone()),
    };

    let tools = result
        .get("tools")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("result has no `tools` array".to_string()))?;

    tools
        .iter()
        .enumerate()
        .map(|(i, tool)| {
            tool.get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| invalid(format!("tool descriptor #{} has no `name`", i)))
        })
        .collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
