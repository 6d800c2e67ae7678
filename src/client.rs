//! Minimal JSON-RPC client over a child's standard streams.
//!
//! Outstanding requests never exceed one: a request is written only after
//! the previous response was read. Inbound lines are read by a dedicated
//! thread and handed over through a channel so waits can be bounded.

use crate::protocol::{decode_line, write_envelope, DecodeError, Params, RpcEnvelope, RpcResponse};
use crate::signals::ShutdownFlag;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Granularity at which the shutdown flag is polled while waiting.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Why no response could be obtained.
#[derive(Debug)]
pub enum RecvError {
    /// The server's output stream closed.
    Closed,
    /// Nothing arrived within the allowed wait.
    Timeout(Duration),
    /// Shutdown was requested while waiting.
    Interrupted,
    Io(io::Error),
    /// A line arrived that is not a JSON object.
    Malformed { error: DecodeError, line: String },
}

/// Spawn a thread forwarding each line of `reader` into a channel. The
/// channel disconnects on EOF.
pub fn spawn_line_reader<R: Read + Send + 'static>(reader: R) -> Receiver<io::Result<String>> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        for line in BufReader::new(reader).lines() {
            let stop = line.is_err();
            if tx.send(line).is_err() || stop {
                break;
            }
        }
    });
    rx
}

/// Spawn a thread that logs every line of a server's stderr, so the
/// server never stalls on a full stderr pipe.
pub fn spawn_stderr_drain<R: Read + Send + 'static>(reader: R) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(reader).lines() {
            match line {
                Ok(line) => debug!(server_stderr = %line.trim_end(), "server"),
                Err(_) => break,
            }
        }
    })
}

pub struct RpcClient<W: Write> {
    writer: W,
    lines: Receiver<io::Result<String>>,
    next_id: u64,
    shutdown: ShutdownFlag,
}

impl<W: Write> RpcClient<W> {
    pub fn new(writer: W, lines: Receiver<io::Result<String>>) -> Self {
        Self {
            writer,
            lines,
            next_id: 1,
            shutdown: ShutdownFlag::new(),
        }
    }

    /// Abandon waits once `shutdown` is requested.
    pub fn with_shutdown(mut self, shutdown: ShutdownFlag) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Write a request with a fresh correlation id; returns that id.
    pub fn send_request(&mut self, method: &str, params: Params) -> io::Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        let envelope = RpcEnvelope::request(id, method, params);
        debug!(id, method, "-> request");
        write_envelope(&mut self.writer, &envelope)?;
        Ok(id)
    }

    pub fn notify(&mut self, method: &str, params: Params) -> io::Result<()> {
        debug!(method, "-> notification");
        write_envelope(&mut self.writer, &RpcEnvelope::notification(method, params))
    }

    /// Read the next response line, skipping blank lines and messages the
    /// server originates (notifications and requests). `None` waits forever.
    pub fn next_response(&mut self, timeout: Option<Duration>) -> Result<RpcResponse, RecvError> {
        let deadline = timeout.map(|t| (Instant::now() + t, t));
        loop {
            let line = self.recv_line(deadline)?;

            let message = match decode_line(&line) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(error) => return Err(RecvError::Malformed { error, line }),
            };

            if message.is_notification() {
                debug!(method = message.method().unwrap_or_default(), "<- server notification (ignored)");
                continue;
            }
            if message.is_server_request() {
                warn!(method = message.method().unwrap_or_default(), "<- server request (unsupported, ignored)");
                continue;
            }
            return Ok(message);
        }
    }

    /// Next raw line, waiting in slices so a shutdown request is noticed.
    fn recv_line(&self, deadline: Option<(Instant, Duration)>) -> Result<String, RecvError> {
        loop {
            if self.shutdown.is_requested() {
                return Err(RecvError::Interrupted);
            }
            let slice = match deadline {
                None => POLL_SLICE,
                Some((at, _)) => at.saturating_duration_since(Instant::now()).min(POLL_SLICE),
            };
            match self.lines.recv_timeout(slice) {
                Ok(line) => return line.map_err(RecvError::Io),
                Err(RecvTimeoutError::Disconnected) => return Err(RecvError::Closed),
                Err(RecvTimeoutError::Timeout) => {
                    if let Some((at, total)) = deadline {
                        if Instant::now() >= at {
                            return Err(RecvError::Timeout(total));
                        }
                    }
                }
            }
        }
    }

    /// Request/response round trip. Returns the id used and the response.
    pub fn call(
        &mut self,
        method: &str,
        params: Params,
        timeout: Option<Duration>,
    ) -> Result<(u64, RpcResponse), CallError> {
        let id = self.send_request(method, params).map_err(CallError::Send)?;
        let response = self.next_response(timeout).map_err(CallError::Recv)?;
        Ok((id, response))
    }
}

/// Failure of a request/response round trip.
#[derive(Debug)]
pub enum CallError {
    Send(io::Error),
    Recv(RecvError),
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Sender;
    use serde_json::Value;

    fn client() -> (RpcClient<Vec<u8>>, Sender<io::Result<String>>) {
        let (tx, rx) = unbounded();
        (RpcClient::new(Vec::new(), rx), tx)
    }

    #[test]
    fn test_ids_increase() {
        let (mut client, _tx) = client();
        assert_eq!(client.send_request("a", Params::new()).unwrap(), 1);
        assert_eq!(client.send_request("b", Params::new()).unwrap(), 2);

        let written = String::from_utf8(client.writer.clone()).unwrap();
        let ids: Vec<u64> = written
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_skips_notifications_and_blank_lines() {
        let (mut client, tx) = client();
        tx.send(Ok(String::new())).unwrap();
        tx.send(Ok(r#"{"jsonrpc":"2.0","method":"notifications/message","params":{}}"#.to_string()))
            .unwrap();
        tx.send(Ok(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#.to_string()))
            .unwrap();

        let response = client.next_response(None).unwrap();
        assert!(response.answers(1));
    }

    #[test]
    fn test_closed_stream() {
        let (mut client, tx) = client();
        drop(tx);
        assert!(matches!(client.next_response(None), Err(RecvError::Closed)));
    }

    #[test]
    fn test_timeout() {
        let (mut client, _tx) = client();
        let err = client
            .next_response(Some(Duration::from_millis(50)))
            .unwrap_err();
        assert!(matches!(err, RecvError::Timeout(_)));
    }

    #[test]
    fn test_malformed_line() {
        let (mut client, tx) = client();
        tx.send(Ok("Loading model...".to_string())).unwrap();
        match client.next_response(None) {
            Err(RecvError::Malformed { line, .. }) => assert_eq!(line, "Loading model..."),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_shutdown_interrupts_wait() {
        let (client, _tx) = client();
        let shutdown = ShutdownFlag::new();
        let mut client = client.with_shutdown(shutdown.clone());

        let trigger = shutdown.clone();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            trigger.request();
        });

        let start = Instant::now();
        assert!(matches!(client.next_response(None), Err(RecvError::Interrupted)));
        assert!(start.elapsed() < Duration::from_secs(2));
        waker.join().unwrap();
    }

    #[test]
    fn test_line_reader_disconnects_on_eof() {
        let rx = spawn_line_reader(io::Cursor::new(b"one\ntwo\n".to_vec()));
        assert_eq!(rx.recv().unwrap().unwrap(), "one");
        assert_eq!(rx.recv().unwrap().unwrap(), "two");
        assert!(rx.recv().is_err());
    }
}
