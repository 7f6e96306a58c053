//! Stdio transport: communicates with a child process over stdin/stdout.
//!
//! Each JSON-RPC message is a single newline-delimited line. A reader task
//! owns stdout and pushes every frame into the event channel; a second task
//! drains stderr into the log and keeps the last few lines so a crash can be
//! explained.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use mf_domain::config::ServerConfig;

use super::{EventSender, Transport, TransportError, TransportEvent};
use crate::paths::{expand_env_vars, resolve_path};
use crate::protocol::JsonRpcMessage;

/// Maximum number of consecutive non-JSON lines to skip before declaring
/// the server broken.
const MAX_SKIP_LINES: usize = 1000;

/// How long `disconnect` waits for the process after closing stdin.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period after spawn used to catch commands that exit immediately.
const STARTUP_GRACE: Duration = Duration::from_millis(100);

/// Number of stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 20;

/// Cap on one stderr line.
const STDERR_LINE_BYTES: usize = 8 * 1024;

/// Longest frame excerpt included in a malformed-frame error.
const FRAME_EXCERPT_CHARS: usize = 200;

/// Default cap on one stdout line. Longer lines are discarded.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// What to spawn.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
    /// Expand environment variables in every field and resolve `cwd` against
    /// the configuration file's directory.
    pub fn from_config(config: &ServerConfig) -> Self {
        let base = config
            .configuration_file_path
            .as_deref()
            .and_then(|p| p.parent())
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_default();

        Self {
            command: expand_env_vars(config.command.as_deref().unwrap_or_default()),
            args: config.args.iter().map(|a| expand_env_vars(a)).collect(),
            env: config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), expand_env_vars(v)))
                .collect(),
            cwd: config
                .cwd
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .map(|c| resolve_path(c, &base)),
        }
    }
}

pub struct StdioTransport {
    spec: LaunchSpec,
    stdin: Mutex<Option<ChildStdin>>,
    child: Arc<Mutex<Option<Child>>>,
    connected: Arc<AtomicBool>,
    /// Stops the reader tasks. A transport connects at most once.
    shutdown: CancellationToken,
    stderr_tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    max_frame_bytes: usize,
}

impl StdioTransport {
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            spec,
            stdin: Mutex::new(None),
            child: Arc::new(Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            stderr_tail: Arc::new(parking_lot::Mutex::new(VecDeque::new())),
            tasks: parking_lot::Mutex::new(Vec::new()),
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }

    pub fn with_max_frame_bytes(mut self, max_frame_bytes: usize) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(LaunchSpec::from_config(config))
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    fn spawn_child(&self) -> Result<(Child, ChildStdin, ChildStdout, ChildStderr), TransportError> {
        let mut cmd = tokio::process::Command::new(&self.spec.command);
        cmd.args(&self.spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.spec.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &self.spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            command: self.spec.command.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| broken_pipe("failed to capture child stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| broken_pipe("failed to capture child stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| broken_pipe("failed to capture child stderr"))?;
        Ok((child, stdin, stdout, stderr))
    }

    fn stderr_snapshot(&self) -> String {
        stderr_snapshot(&self.stderr_tail)
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self, events: EventSender, cancel: &CancellationToken) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::AlreadyConnected);
        }
        if self.shutdown.is_cancelled() {
            return Err(TransportError::ConnectFailed("transport was already closed".into()));
        }

        tracing::debug!(
            command = %self.spec.command,
            args = ?self.spec.args,
            cwd = ?self.spec.cwd,
            "spawning MCP server process"
        );
        let (child, stdin, stdout, stderr) = self.spawn_child()?;
        let pid = child.id();
        *self.child.lock().await = Some(child);
        *self.stdin.lock().await = Some(stdin);

        let stderr_task = tokio::spawn(drain_stderr(
            stderr,
            self.stderr_tail.clone(),
            self.shutdown.clone(),
        ));
        let reader_task = tokio::spawn(read_stdout(
            stdout,
            self.max_frame_bytes,
            events,
            self.child.clone(),
            self.connected.clone(),
            self.stderr_tail.clone(),
            self.shutdown.clone(),
        ));
        self.tasks.lock().extend([stderr_task, reader_task]);
        self.connected.store(true, Ordering::SeqCst);

        // Catch commands that start and immediately die (bad args, missing runtime).
        tokio::select! {
            _ = tokio::time::sleep(STARTUP_GRACE) => {}
            _ = cancel.cancelled() => {
                let _ = self.disconnect().await;
                return Err(TransportError::Cancelled);
            }
        }
        let exited = {
            let mut guard = self.child.lock().await;
            match guard.as_mut() {
                Some(child) => child.try_wait()?,
                None => None,
            }
        };
        if let Some(status) = exited {
            self.connected.store(false, Ordering::SeqCst);
            return Err(TransportError::ProcessExited {
                code: status.code(),
                stderr: self.stderr_snapshot(),
            });
        }

        tracing::debug!(pid = ?pid, command = %self.spec.command, "MCP server process started");
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage, cancel: &CancellationToken) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let json = message.to_json()?;

        // Cancellation is only honoured before the write starts so a frame
        // is never cut in half.
        let mut guard = tokio::select! {
            guard = self.stdin.lock() => guard,
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        };
        let stdin = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let written = async {
            stdin.write_all(json.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            self.connected.store(false, Ordering::SeqCst);
            return Err(TransportError::Io(e));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> &'static str {
        "stdio"
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.shutdown.cancel();

        // Close stdin to signal the process to exit.
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(error = %e, "error closing MCP server stdin");
            }
        }

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            // Give the process a moment to exit gracefully.
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(?status, command = %self.spec.command, "MCP server process exited");
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "error waiting for MCP server process");
                }
                Err(_) => {
                    tracing::warn!(
                        command = %self.spec.command,
                        "MCP server process did not exit within timeout, killing"
                    );
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "failed to kill MCP server process");
                    }
                }
            }
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // The child is killed on drop; make sure the reader tasks let go of it.
        self.shutdown.cancel();
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Background tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn read_stdout(
    stdout: ChildStdout,
    max_frame_bytes: usize,
    events: EventSender,
    child: Arc<Mutex<Option<Child>>>,
    connected: Arc<AtomicBool>,
    stderr_tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
    shutdown: CancellationToken,
) {
    let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(max_frame_bytes));
    let mut skipped = 0usize;
    // FramedRead yields one `None` after a decoder error before reading on.
    let mut resuming = false;

    let reason = loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return,
            line = lines.next() => line,
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                tracing::warn!(limit = max_frame_bytes, "discarding oversized line from MCP server stdout");
                let event = TransportEvent::Error(TransportError::Malformed {
                    frame: String::new(),
                    reason: format!("line exceeds {max_frame_bytes} bytes"),
                });
                if events.send(event).await.is_err() {
                    return;
                }
                resuming = true;
                continue;
            }
            Some(Err(LinesCodecError::Io(e))) => break Some(format!("stdout read failed: {e}")),
            None if resuming => {
                resuming = false;
                continue;
            }
            None => break None,
        };
        resuming = false;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        // Skip lines that don't look like JSON (e.g. logging on stdout).
        if !trimmed.starts_with('{') {
            skipped += 1;
            if skipped >= MAX_SKIP_LINES {
                break Some("MCP server produced too many non-JSON lines on stdout".to_string());
            }
            tracing::debug!(line = %trimmed, "skipping non-JSON line from MCP server stdout");
            continue;
        }
        skipped = 0;

        let event = match JsonRpcMessage::parse(trimmed) {
            Ok(message) => TransportEvent::Message(message),
            Err(e) => TransportEvent::Error(TransportError::Malformed {
                frame: trimmed.chars().take(FRAME_EXCERPT_CHARS).collect(),
                reason: e.to_string(),
            }),
        };
        if events.send(event).await.is_err() {
            // Nobody is listening any more.
            return;
        }
    };

    if shutdown.is_cancelled() {
        return;
    }
    connected.store(false, Ordering::SeqCst);

    let error = match reason {
        Some(reason) => TransportError::ConnectionClosed(reason),
        None => {
            let code = {
                let mut guard = child.lock().await;
                match guard.as_mut() {
                    Some(child) => match tokio::time::timeout(Duration::from_millis(500), child.wait()).await {
                        Ok(Ok(status)) => status.code(),
                        _ => None,
                    },
                    None => None,
                }
            };
            TransportError::ProcessExited {
                code,
                stderr: stderr_snapshot(&stderr_tail),
            }
        }
    };
    tracing::warn!(error = %error, "MCP server stdout closed");
    let _ = events.send(TransportEvent::Error(error)).await;
}

async fn drain_stderr(
    stderr: ChildStderr,
    tail: Arc<parking_lot::Mutex<VecDeque<String>>>,
    shutdown: CancellationToken,
) {
    let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(STDERR_LINE_BYTES));
    let mut resuming = false;
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => return,
            line = lines.next() => line,
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                resuming = true;
                "[oversized stderr line dropped]".to_string()
            }
            Some(Err(LinesCodecError::Io(_))) => return,
            None if resuming => {
                resuming = false;
                continue;
            }
            None => return,
        };
        tracing::debug!(line = %line, "MCP server stderr");
        let mut tail = tail.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

fn stderr_snapshot(tail: &parking_lot::Mutex<VecDeque<String>>) -> String {
    tail.lock().iter().cloned().collect::<Vec<_>>().join("\n")
}

fn broken_pipe(msg: &str) -> TransportError {
    TransportError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, msg.to_string()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcNotification;
    use tokio::sync::mpsc;

    fn sh(script: &str) -> StdioTransport {
        StdioTransport::new(LaunchSpec {
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            env: Vec::new(),
            cwd: None,
        })
    }

    #[tokio::test]
    async fn spawn_failure_names_the_command() {
        let transport = StdioTransport::new(LaunchSpec {
            command: "definitely-not-a-real-binary-4242".into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        });
        let (tx, _rx) = mpsc::channel(8);
        let err = transport.connect(tx, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Spawn { ref command, .. } if command.contains("4242")));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn immediate_exit_is_reported_with_stderr() {
        let transport = sh("echo 'cannot start' >&2; exit 3");
        let (tx, mut rx) = mpsc::channel(8);
        // A slow machine may let the grace period pass first; then the exit
        // arrives as an event instead.
        let err = match transport.connect(tx, &CancellationToken::new()).await {
            Err(e) => e,
            Ok(()) => match rx.recv().await.unwrap() {
                TransportEvent::Error(e) => e,
                other => panic!("unexpected event: {other:?}"),
            },
        };
        match err {
            TransportError::ProcessExited { code, .. } => assert_eq!(code, Some(3)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn frames_flow_through_cat() {
        // `cat` echoes each frame back, which is enough to exercise framing.
        let transport = sh("cat");
        let (tx, mut rx) = mpsc::channel(8);
        transport.connect(tx, &CancellationToken::new()).await.unwrap();

        let msg = JsonRpcMessage::from(JsonRpcNotification::new("notifications/hello"));
        transport.send(&msg, &CancellationToken::new()).await.unwrap();

        match rx.recv().await.unwrap() {
            TransportEvent::Message(echoed) => assert_eq!(echoed, msg),
            TransportEvent::Error(e) => panic!("unexpected error: {e}"),
        }
        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn non_json_lines_are_skipped_and_bad_json_reported() {
        let transport = sh(
            r#"echo 'starting up...'; echo '{not json'; echo '{"jsonrpc":"2.0","method":"ready"}'; sleep 1"#,
        );
        let (tx, mut rx) = mpsc::channel(8);
        transport.connect(tx, &CancellationToken::new()).await.unwrap();

        match rx.recv().await.unwrap() {
            TransportEvent::Error(TransportError::Malformed { frame, .. }) => assert_eq!(frame, "{not json"),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            TransportEvent::Message(m) => assert_eq!(m.method(), Some("ready")),
            other => panic!("unexpected event: {other:?}"),
        }
        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn oversized_line_is_dropped_and_reading_continues() {
        let transport = sh(r#"printf '{"pad":"%04096d"}\n' 0; echo '{"jsonrpc":"2.0","method":"ready"}'; sleep 1"#)
            .with_max_frame_bytes(1024);
        let (tx, mut rx) = mpsc::channel(8);
        transport.connect(tx, &CancellationToken::new()).await.unwrap();

        match rx.recv().await.unwrap() {
            TransportEvent::Error(e @ TransportError::Malformed { .. }) => assert!(!e.is_fatal()),
            other => panic!("unexpected event: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            TransportEvent::Message(m) => assert_eq!(m.method(), Some("ready")),
            other => panic!("unexpected event: {other:?}"),
        }
        transport.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn unexpected_exit_is_pushed_as_fatal_error() {
        let transport = sh("sleep 0.3; echo 'bye' >&2; exit 7");
        let (tx, mut rx) = mpsc::channel(8);
        transport.connect(tx, &CancellationToken::new()).await.unwrap();

        match rx.recv().await.unwrap() {
            TransportEvent::Error(e) => {
                assert!(e.is_fatal());
                assert!(matches!(e, TransportError::ProcessExited { code: Some(7), .. }));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let transport = sh("cat");
        let msg = JsonRpcMessage::from(JsonRpcNotification::new("x"));
        let err = transport.send(&msg, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[test]
    fn launch_spec_resolves_cwd_against_config_file() {
        let mut config = ServerConfig::new("x").with_command("node", ["server.js"]);
        config.cwd = Some("tools".into());
        config.configuration_file_path = Some(PathBuf::from("/work/project/mcp.json"));
        let spec = LaunchSpec::from_config(&config);
        assert_eq!(spec.cwd, Some(PathBuf::from("/work/project/tools")));
        assert_eq!(spec.command, "node");
    }
}
