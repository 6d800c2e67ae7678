//! Integration tests for the line-delimited JSON-RPC framing
//!
//! Envelopes are written through a real pipe (`cat` echoes them back) and
//! parsed by an independent reader, so framing and flushing are observed
//! the way a server would see them.

use serde_json::{json, Value};
use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::time::Duration;
use suitecheck::client::{spawn_line_reader, RecvError, RpcClient};
use suitecheck::protocol::{params, write_envelope, Params, RpcEnvelope};

#[test]
fn test_envelopes_survive_a_pipe() {
    let mut echo = Command::new("cat")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("cat should start");
    let mut stdin = echo.stdin.take().unwrap();
    let mut lines = BufReader::new(echo.stdout.take().unwrap()).lines();

    let sent = vec![
        RpcEnvelope::request(
            1,
            "initialize",
            params(json!({"protocolVersion": "2024-11-05", "capabilities": {}})),
        ),
        RpcEnvelope::notification("initialized", Params::new()),
        RpcEnvelope::request(
            2,
            "tools/call",
            params(json!({"name": "code_search", "arguments": {"query": "a\nb", "limit": 3}})),
        ),
    ];

    for envelope in &sent {
        write_envelope(&mut stdin, envelope).unwrap();
        // Flushed per message: the echo arrives before the next write
        let line = lines.next().unwrap().unwrap();
        let parsed: RpcEnvelope = serde_json::from_str(&line).unwrap();
        assert_eq!(&parsed, envelope);
    }

    drop(stdin);
    assert!(lines.next().is_none());
    echo.wait().unwrap();
}

#[test]
fn test_notification_line_has_no_id_key() {
    let mut buf = Vec::new();
    write_envelope(&mut buf, &RpcEnvelope::notification("initialized", Params::new())).unwrap();
    let value: Value = serde_json::from_slice(&buf).unwrap();
    assert_eq!(
        value,
        json!({"jsonrpc": "2.0", "method": "initialized", "params": {}})
    );
}

#[test]
fn test_client_ids_increase_per_request() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut client = RpcClient::new(Vec::new(), rx);

    tx.send(Ok(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#.to_string()))
        .unwrap();
    tx.send(Ok(r#"{"jsonrpc":"2.0","id":2,"result":{"tools":[]}}"#.to_string()))
        .unwrap();

    let (first, response) = client.call("initialize", Params::new(), None).unwrap();
    assert_eq!(first, 1);
    assert!(response.answers(1));

    let (second, response) = client.call("tools/list", Params::new(), None).unwrap();
    assert_eq!(second, 2);
    assert!(response.has_result());
}

#[test]
fn test_client_skips_noise_before_response() {
    let (tx, rx) = crossbeam_channel::unbounded();
    let mut client = RpcClient::new(Vec::new(), rx);

    tx.send(Ok(String::new())).unwrap();
    tx.send(Ok(
        r#"{"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info"}}"#.to_string(),
    ))
    .unwrap();
    tx.send(Ok(r#"{"jsonrpc":"2.0","id":99,"method":"roots/list"}"#.to_string()))
        .unwrap();
    tx.send(Ok(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#.to_string()))
        .unwrap();

    let response = client.next_response(Some(Duration::from_secs(1))).unwrap();
    assert!(response.answers(1));
}

#[test]
fn test_client_reports_closed_and_timeout() {
    let (tx, rx) = crossbeam_channel::unbounded::<std::io::Result<String>>();
    let mut client = RpcClient::new(Vec::new(), rx);
    assert!(matches!(
        client.next_response(Some(Duration::from_millis(50))),
        Err(RecvError::Timeout(_))
    ));

    drop(tx);
    assert!(matches!(client.next_response(None), Err(RecvError::Closed)));
}

#[test]
fn test_line_reader_splits_child_output() {
    let mut child = Command::new("sh")
        .args(["-c", "printf 'one\\n\\ntwo\\n'"])
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    let rx = spawn_line_reader(child.stdout.take().unwrap());

    let received: Vec<String> = rx.iter().map(Result::unwrap).collect();
    assert_eq!(received, vec!["one", "", "two"]);
    child.wait().unwrap();
}
