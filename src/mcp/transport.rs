//! Stdio transports for MCP server communication.
//!
//! Two flavours:
//! - `ProcessTransport` spawns a fresh server for every request, writes one JSON
//!   document to its stdin and parses one JSON document from its stdout.
//! - `SessionTransport` keeps one server alive and exchanges newline-delimited
//!   JSON-RPC messages, correlating responses by id.

use crate::config::{ForwardedEnv, ServerCommand};
use crate::error::{BridgeError, Result};
use crate::mcp::{check_rpc_error, JsonRpcRequest};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// MCP protocol revision announced during the session handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Stderr lines kept for error reports in session mode
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for a closed server to finish exiting
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// A request/response channel to an MCP server.
pub trait McpTransport {
    /// Send a request and return the server's parsed JSON response.
    fn send(&mut self, request: &JsonRpcRequest) -> Result<Value>;
}

impl<T: McpTransport + ?Sized> McpTransport for Box<T> {
    fn send(&mut self, request: &JsonRpcRequest) -> Result<Value> {
        (**self).send(request)
    }
}

fn build_command(server: &ServerCommand, env: &ForwardedEnv) -> Command {
    let mut cmd = Command::new(&server.program);
    cmd.args(&server.args)
        .current_dir(&server.cwd)
        .envs(env.iter())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

/// Process-per-call transport: no session, no connection reuse.
pub struct ProcessTransport {
    server: ServerCommand,
    env: ForwardedEnv,
}

impl ProcessTransport {
    pub fn new(server: ServerCommand, env: ForwardedEnv) -> Self {
        Self { server, env }
    }
}

impl McpTransport for ProcessTransport {
    fn send(&mut self, request: &JsonRpcRequest) -> Result<Value> {
        let payload = serde_json::to_string(request)
            .map_err(|e| BridgeError::transport(format!("failed to encode request: {}", e)))?;

        debug!(method = %request.method, program = %self.server.program, "spawning MCP server");

        let mut child = build_command(&self.server, &self.env)
            .spawn()
            .map_err(|e| {
                BridgeError::transport(format!(
                    "failed to spawn '{}': {}",
                    self.server.program, e
                ))
            })?;

        // Feed stdin concurrently with draining stdout and stderr
        let stdin = child.stdin.take();
        let (output, written) = thread::scope(|scope| {
            let writer = stdin.map(|mut stdin| {
                let bytes = payload.as_bytes();
                // Dropping stdin after the write signals end of input
                scope.spawn(move || stdin.write_all(bytes))
            });
            let output = child.wait_with_output();
            let written = match writer {
                Some(handle) => handle.join().unwrap_or_else(|_| {
                    Err(io::Error::new(ErrorKind::Other, "stdin writer panicked"))
                }),
                None => Ok(()),
            };
            (output, written)
        });

        match written {
            Ok(()) => {}
            // The exit status below tells the real story
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
            Err(e) => {
                return Err(BridgeError::transport(format!(
                    "failed to write to server stdin: {}",
                    e
                )))
            }
        }

        let output = output
            .map_err(|e| BridgeError::transport(format!("failed to wait for server: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BridgeError::transport(format!(
                "'{}' exited with {}: {}",
                self.server.program,
                output.status,
                stderr.trim()
            )));
        }

        let response: Value = serde_json::from_slice(&output.stdout).map_err(|e| {
            BridgeError::transport(format!("server output is not valid JSON: {}", e))
        })?;
        check_rpc_error(&response)?;
        Ok(response)
    }
}

/// Last lines the server wrote to stderr
#[derive(Debug, Clone, Default)]
struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            if lines.len() == STDERR_TAIL_LINES {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    fn text(&self) -> String {
        self.lines
            .lock()
            .map(|lines| lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }
}

/// Persistent transport over one long-lived server subprocess
pub struct SessionTransport {
    child: Child,
    stdin: ChildStdin,
    response_rx: Receiver<Value>,
    reader_handle: Option<JoinHandle<()>>,
    stderr_handle: Option<JoinHandle<()>>,
    stderr_tail: StderrTail,
    next_id: u64,
    timeout: Duration,
}

impl SessionTransport {
    /// Spawn the server and perform the MCP initialize handshake.
    pub fn spawn(server: &ServerCommand, env: &ForwardedEnv, timeout: Duration) -> Result<Self> {
        let mut child = build_command(server, env).spawn().map_err(|e| {
            BridgeError::transport(format!("failed to spawn '{}': {}", server.program, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::transport("server stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::transport("server stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BridgeError::transport("server stderr unavailable"))?;

        let (tx, rx) = mpsc::channel();
        let reader_handle = thread::spawn(move || {
            Self::reader_loop(stdout, tx);
        });

        let stderr_tail = StderrTail::default();
        let tail = stderr_tail.clone();
        let stderr_handle = thread::spawn(move || {
            Self::stderr_loop(stderr, tail);
        });

        let mut transport = Self {
            child,
            stdin,
            response_rx: rx,
            reader_handle: Some(reader_handle),
            stderr_handle: Some(stderr_handle),
            stderr_tail,
            next_id: 1,
            timeout,
        };
        transport.initialize()?;
        Ok(transport)
    }

    /// Reader loop that forwards newline-delimited JSON from stdout
    fn reader_loop(stdout: ChildStdout, tx: Sender<Value>) {
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            match line {
                Ok(line) if !line.trim().is_empty() => match serde_json::from_str(&line) {
                    Ok(msg) => {
                        if tx.send(msg).is_err() {
                            // Receiver dropped
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, line = %line, "unparsable line from MCP server"),
                },
                Err(_) => break, // Pipe closed
                _ => {}
            }
        }
    }

    fn stderr_loop(stderr: impl Read, tail: StderrTail) {
        let reader = BufReader::new(stderr);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            debug!(line = %line, "MCP server stderr");
            tail.push(line);
        }
    }

    fn initialize(&mut self) -> Result<()> {
        let request = JsonRpcRequest::new(
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                }
            })),
        );
        let response = self.send(&request)?;
        let server_name = response
            .pointer("/result/serverInfo/name")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        debug!(server = %server_name, "MCP session initialized");
        self.write(&JsonRpcRequest::notification("notifications/initialized"))
    }

    fn write(&mut self, message: &impl serde::Serialize) -> Result<()> {
        let json = serde_json::to_string(message)
            .map_err(|e| BridgeError::transport(format!("failed to encode request: {}", e)))?;
        let written = writeln!(self.stdin, "{}", json).and_then(|_| self.stdin.flush());
        written.map_err(|e| self.failure(format!("failed to write to server stdin: {}", e), true))
    }

    /// Answer a request the server sent us. Only `ping` is supported.
    fn answer_server_request(&mut self, msg: &Value) -> Result<()> {
        let (Some(id), Some(method)) = (msg.get("id"), msg.get("method").and_then(Value::as_str))
        else {
            return Ok(());
        };
        let reply = if method == "ping" {
            json!({ "jsonrpc": "2.0", "id": id, "result": {} })
        } else {
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("method not found: {}", method) }
            })
        };
        debug!(method = %method, "answering server request");
        self.write(&reply)
    }

    /// Exit status, waiting briefly for a process that is shutting down
    fn exit_status(&mut self) -> Option<i32> {
        let deadline = Instant::now() + EXIT_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => return status.code(),
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                _ => return None,
            }
        }
    }

    /// Transport error carrying the tail of the server's stderr
    fn failure(&self, detail: String, exited: bool) -> BridgeError {
        if exited {
            // Let the stderr reader reach end of file
            if let Some(handle) = &self.stderr_handle {
                wait_finished(handle, EXIT_GRACE);
            }
        }
        let stderr = self.stderr_tail.text();
        if stderr.trim().is_empty() {
            BridgeError::transport(detail)
        } else {
            BridgeError::transport(format!("{}: {}", detail, stderr.trim()))
        }
    }
}

/// Poll until the thread has finished or `grace` elapses
fn wait_finished<T>(handle: &JoinHandle<T>, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    true
}

/// A reply to request `id`: carries `result` or `error` and no `method`
fn is_response_to(msg: &Value, id: u64) -> bool {
    msg.get("method").is_none()
        && (msg.get("result").is_some() || msg.get("error").is_some())
        && msg.get("id").and_then(Value::as_u64) == Some(id)
}

impl McpTransport for SessionTransport {
    fn send(&mut self, request: &JsonRpcRequest) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;
        self.write(&request.clone().with_id(id))?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.response_rx.recv_timeout(remaining) {
                Ok(msg) if is_response_to(&msg, id) => {
                    check_rpc_error(&msg)?;
                    return Ok(msg);
                }
                Ok(msg) if msg.get("method").is_some() && msg.get("id").is_some() => {
                    self.answer_server_request(&msg)?;
                }
                Ok(msg) => {
                    debug!(expected = id, message = %msg, "skipping uncorrelated message");
                }
                Err(RecvTimeoutError::Timeout) => {
                    let detail = format!(
                        "timed out after {}ms waiting for '{}' response",
                        self.timeout.as_millis(),
                        request.method
                    );
                    return Err(self.failure(detail, false));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let status = self
                        .exit_status()
                        .map(|c| format!("exit code {}", c))
                        .unwrap_or_else(|| "unknown status".to_string());
                    let detail = format!("server closed its output ({})", status);
                    return Err(self.failure(detail, true));
                }
            }
        }
    }
}

impl Drop for SessionTransport {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();

        // A grandchild may still hold the pipes open; such readers are left detached
        for handle in [self.reader_handle.take(), self.stderr_handle.take()]
            .into_iter()
            .flatten()
        {
            if wait_finished(&handle, EXIT_GRACE) {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::mcp::{METHOD_TOOLS_CALL, METHOD_TOOLS_LIST};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn sh(script: &str) -> ServerCommand {
        ServerCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: PathBuf::from("."),
        }
    }

    fn list_request() -> JsonRpcRequest {
        JsonRpcRequest::new(METHOD_TOOLS_LIST, None)
    }

    #[test]
    fn test_process_transport_parses_stdout() {
        let mut transport = ProcessTransport::new(
            sh(r#"cat > /dev/null; printf '{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}'"#),
            ForwardedEnv::default(),
        );
        let response = transport.send(&list_request()).unwrap();
        assert!(response["result"]["tools"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_process_transport_writes_request_to_stdin() {
        // Echo the request back as the response
        let mut transport = ProcessTransport::new(sh("cat"), ForwardedEnv::default());
        let response = transport.send(&list_request()).unwrap();
        assert_eq!(response["method"], "tools/list");
        assert_eq!(response["jsonrpc"], "2.0");
    }

    #[test]
    fn test_process_transport_nonzero_exit_embeds_stderr() {
        let mut transport = ProcessTransport::new(
            sh("cat > /dev/null; echo 'invalid credentials' >&2; exit 3"),
            ForwardedEnv::default(),
        );
        match transport.send(&list_request()) {
            Err(BridgeError::Transport { detail }) => {
                assert!(detail.contains("invalid credentials"), "{}", detail);
            }
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[test]
    fn test_process_transport_invalid_json() {
        let mut transport = ProcessTransport::new(
            sh("cat > /dev/null; echo 'not json'"),
            ForwardedEnv::default(),
        );
        let err = transport.send(&list_request()).unwrap_err();
        assert!(matches!(err, BridgeError::Transport { .. }));
        assert!(err.to_string().contains("not valid JSON"));
    }

    #[test]
    fn test_process_transport_spawn_failure() {
        let server = ServerCommand {
            program: "/nonexistent/mcp-server".to_string(),
            args: vec![],
            cwd: PathBuf::from("."),
        };
        let mut transport = ProcessTransport::new(server, ForwardedEnv::default());
        assert!(matches!(
            transport.send(&list_request()),
            Err(BridgeError::Transport { .. })
        ));
    }

    #[test]
    fn test_process_transport_forwards_env() {
        let mut vars = BTreeMap::new();
        vars.insert(
            "MCPBRIDGE_TEST_INSTANCE".to_string(),
            "https://dev.example.com".to_string(),
        );
        let mut transport = ProcessTransport::new(
            sh(r#"cat > /dev/null; printf '{"url":"%s"}' "$MCPBRIDGE_TEST_INSTANCE""#),
            ForwardedEnv::from_vars(vars),
        );
        let response = transport.send(&list_request()).unwrap();
        assert_eq!(response["url"], "https://dev.example.com");
    }

    #[test]
    fn test_process_transport_rpc_error() {
        let mut transport = ProcessTransport::new(
            sh(r#"cat > /dev/null; printf '{"id":1,"error":{"code":-32602,"message":"Unknown tool"}}'"#),
            ForwardedEnv::default(),
        );
        let err = transport.send(&list_request()).unwrap_err();
        assert!(err.to_string().contains("Unknown tool"));
    }

    /// Replies to every request carrying an id, ignores notifications.
    const SESSION_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","method":"notifications/message"}\n'
    printf '{"jsonrpc":"2.0","id":%s,"result":{"echo":%s}}\n' "$id" "$id"
  fi
done
"#;

    #[test]
    fn test_session_transport_correlates_by_id() {
        let mut transport = SessionTransport::spawn(
            &sh(SESSION_SERVER),
            &ForwardedEnv::default(),
            Duration::from_secs(5),
        )
        .unwrap();

        // id 1 was consumed by the initialize handshake
        let first = transport.send(&list_request()).unwrap();
        assert_eq!(first["id"], 2);
        assert_eq!(first["result"]["echo"], 2);

        let second = transport.send(&list_request()).unwrap();
        assert_eq!(second["id"], 3);
    }

    #[test]
    fn test_session_transport_times_out() {
        // Answers the handshake, then goes silent
        let script = r#"
IFS= read -r line
printf '{"jsonrpc":"2.0","id":1,"result":{}}\n'
while IFS= read -r line; do :; done
"#;
        let mut transport = SessionTransport::spawn(
            &sh(script),
            &ForwardedEnv::default(),
            Duration::from_millis(200),
        )
        .unwrap();
        let err = transport.send(&list_request()).unwrap_err();
        assert!(err.to_string().contains("timed out"), "{}", err);
    }

    #[test]
    fn test_session_transport_server_exit() {
        let script = r#"
IFS= read -r line
printf '{"jsonrpc":"2.0","id":1,"result":{}}\n'
IFS= read -r line
exit 0
"#;
        let mut transport = SessionTransport::spawn(
            &sh(script),
            &ForwardedEnv::default(),
            Duration::from_secs(5),
        )
        .unwrap();
        let err = transport.send(&list_request()).unwrap_err();
        assert!(matches!(err, BridgeError::Transport { .. }));
    }

    #[test]
    fn test_process_transport_large_request_while_server_writes() {
        // Fills its stdout pipe before reading any of stdin
        let script = r#"printf '{"pad":"'; head -c 200000 /dev/zero | tr '\000' x; printf '","echo":'; cat; printf '}'"#;
        let mut transport = ProcessTransport::new(sh(script), ForwardedEnv::default());

        let blob = "y".repeat(100_000);
        let request = JsonRpcRequest::new(
            METHOD_TOOLS_CALL,
            Some(json!({"name": "store", "arguments": {"blob": blob}})),
        );
        let response = transport.send(&request).unwrap();
        assert_eq!(response["pad"].as_str().unwrap().len(), 200_000);
        assert_eq!(
            response["echo"]["params"]["arguments"]["blob"]
                .as_str()
                .unwrap()
                .len(),
            100_000
        );
    }

    #[test]
    fn test_session_transport_answers_server_request_sharing_id() {
        // Before each reply, sends a ping reusing the request's id and waits for our answer
        let script = r#"
while IFS= read -r line; do
  case "$line" in *'"method"'*) ;; *) continue ;; esac
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  [ -n "$id" ] || continue
  printf '{"jsonrpc":"2.0","id":%s,"method":"ping"}\n' "$id"
  IFS= read -r reply
  case "$reply" in *'"result"'*) answered=true ;; *) answered=false ;; esac
  printf '{"jsonrpc":"2.0","id":%s,"result":{"echo":%s,"pinged":%s}}\n' "$id" "$id" "$answered"
done
"#;
        let mut transport = SessionTransport::spawn(
            &sh(script),
            &ForwardedEnv::default(),
            Duration::from_secs(5),
        )
        .unwrap();

        let response = transport.send(&list_request()).unwrap();
        assert!(response.get("method").is_none());
        assert_eq!(response["result"]["echo"], 2);
        assert_eq!(response["result"]["pinged"], true);
    }

    #[test]
    fn test_session_transport_exit_embeds_stderr() {
        let script = r#"
IFS= read -r line
printf '{"jsonrpc":"2.0","id":1,"result":{}}\n'
IFS= read -r line
IFS= read -r line
echo 'bad credentials' >&2
exit 2
"#;
        let mut transport = SessionTransport::spawn(
            &sh(script),
            &ForwardedEnv::default(),
            Duration::from_secs(5),
        )
        .unwrap();
        let err = transport.send(&list_request()).unwrap_err().to_string();
        assert!(err.contains("exit code 2"), "{}", err);
        assert!(err.contains("bad credentials"), "{}", err);
    }

    #[test]
    fn test_is_response_to() {
        assert!(is_response_to(&json!({"id": 4, "result": {}}), 4));
        assert!(is_response_to(&json!({"id": 4, "error": {"code": 1}}), 4));
        assert!(!is_response_to(&json!({"id": 4, "method": "ping"}), 4));
        assert!(!is_response_to(&json!({"id": 4}), 4));
        assert!(!is_response_to(&json!({"id": 5, "result": {}}), 4));
    }
}
