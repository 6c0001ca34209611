use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::TransportKind;
use crate::error::{Error, ErrorCode, Result};
use crate::protocol::{Message, Method, Notification, Request, Response};
use crate::transport::{PendingRequests, Transport};

/// Consecutive non-JSON lines tolerated before the stream is declared broken.
const MAX_SKIP_LINES: usize = 1000;

/// How long `close` waits for the child at each step (after stdin is closed,
/// then after the kill signal).
const EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Lines of captured stderr attached to failure messages.
const STDERR_TAIL_LINES: usize = 20;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<Mutex<Option<BoxedWriter>>>;

/// What to launch for a subprocess-backed transport.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

enum Source {
    Command(CommandSpec),
    Streams(parking_lot::Mutex<Option<(BoxedReader, BoxedWriter)>>),
}

/// Newline-delimited JSON over a child's stdin/stdout (or any pair of
/// streams).
///
/// Every response is routed to its waiting `send` by id, so any number of
/// requests can be in flight at once regardless of the order the server
/// answers in.
pub struct StdioTransport {
    source: Source,
    writer: SharedWriter,
    child: Mutex<Option<Child>>,
    stderr_file: parking_lot::Mutex<Option<NamedTempFile>>,
    reader_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    pending: PendingRequests,
    alive: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl StdioTransport {
    /// A transport that spawns `spec` on [`Transport::initialize`].
    pub fn new(spec: CommandSpec) -> Self {
        Self::from_source(Source::Command(spec))
    }

    /// A transport over already-connected streams, e.g. an in-process server
    /// or a process managed elsewhere.
    pub fn with_streams<R, W>(read: R, write: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_source(Source::Streams(parking_lot::Mutex::new(Some((
            Box::new(read),
            Box::new(write),
        )))))
    }

    fn from_source(source: Source) -> Self {
        Self {
            source,
            writer: Arc::new(Mutex::new(None)),
            child: Mutex::new(None),
            stderr_file: parking_lot::Mutex::new(None),
            reader_task: parking_lot::Mutex::new(None),
            pending: PendingRequests::new(),
            alive: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        }
    }

    /// Requests currently awaiting a response.
    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// The last `lines` lines the child wrote to stderr.
    pub async fn stderr_tail(&self, lines: usize) -> Option<String> {
        let path = self.stderr_path()?;
        read_tail(&path, lines).await
    }

    fn stderr_path(&self) -> Option<PathBuf> {
        self.stderr_file
            .lock()
            .as_ref()
            .map(|file| file.path().to_path_buf())
    }

    fn spawn(&self, spec: &CommandSpec) -> Result<(BoxedReader, BoxedWriter, Child)> {
        tracing::info!(command = %spec.command, args = ?spec.args, "spawning MCP server process");

        let stderr_file = NamedTempFile::new()?;
        let stderr = stderr_file.reopen()?;

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Spawn(format!("'{}': {e}", spec.command)))?;

        // Dropping `child` on the error paths kills it.
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("no stdin available from spawned process".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("no stdout available from spawned process".into()))?;

        tracing::debug!(pid = ?child.id(), "MCP server process started");
        *self.stderr_file.lock() = Some(stderr_file);

        Ok((Box::new(stdout), Box::new(stdin), child))
    }

    fn closed_error(&self) -> Error {
        if self.closed.load(Ordering::SeqCst) {
            Error::ConnectionClosed("transport closed".into())
        } else {
            Error::ConnectionClosed("server process is not running".into())
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn initialize(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed("transport closed".into()));
        }
        if self.alive.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (reader, writer) = match &self.source {
            Source::Command(spec) => {
                let (reader, writer, child) = self.spawn(spec)?;
                *self.child.lock().await = Some(child);
                (reader, writer)
            }
            Source::Streams(streams) => take_streams(streams)
                .ok_or_else(|| Error::transport("streams were already consumed"))?,
        };

        *self.writer.lock().await = Some(writer);
        self.pending.reopen();
        self.alive.store(true, Ordering::SeqCst);

        let task = tokio::spawn(read_loop(
            reader,
            self.pending.clone(),
            self.writer.clone(),
            self.alive.clone(),
            self.stderr_path(),
        ));
        *self.reader_task.lock() = Some(task);
        Ok(())
    }

    async fn send(&self, request: Request, timeout: Duration) -> Response {
        let id = request.id.clone();
        if !self.alive.load(Ordering::SeqCst) {
            return Response::from_error(Some(id), &self.closed_error());
        }

        // Refused if the reader ended after the check above.
        let slot = match self.pending.register(id.clone()) {
            Ok(slot) => slot,
            Err(e) => return Response::from_error(Some(id), &e),
        };

        tracing::debug!(%id, method = %request.method, "sending MCP request");
        if let Err(e) = write_message(&self.writer, &request).await {
            tracing::warn!(%id, error = %e, "failed to write request");
            return Response::from_error(Some(id), &e);
        }

        slot.wait(timeout).await
    }

    async fn send_notification(&self, notification: Notification) -> Result<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(self.closed_error());
        }
        tracing::debug!(method = %notification.method, "sending MCP notification");
        write_message(&self.writer, &notification).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.alive.store(false, Ordering::SeqCst);

        // Closing stdin is the polite way to ask a stdio server to exit.
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(error = %e, "error closing server stdin");
            }
        }

        let mut result = Ok(());
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if tokio::time::timeout(EXIT_TIMEOUT, child.wait()).await.is_err() {
                tracing::info!("MCP server did not exit after stdin closed, killing");
                if let Err(e) = child.start_kill() {
                    result = Err(Error::Io(e));
                }
                let _ = tokio::time::timeout(EXIT_TIMEOUT, child.wait()).await;
            }
            tracing::info!(status = ?child.try_wait(), "MCP server process stopped");
        }

        let task = self.reader_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        self.pending
            .close(&Error::ConnectionClosed("transport closed".into()));
        result
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

fn take_streams(
    streams: &parking_lot::Mutex<Option<(BoxedReader, BoxedWriter)>>,
) -> Option<(BoxedReader, BoxedWriter)> {
    streams.lock().take()
}

async fn write_message<T: Serialize>(writer: &SharedWriter, message: &T) -> Result<()> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');

    let mut guard = writer.lock().await;
    let writer = guard
        .as_mut()
        .ok_or_else(|| Error::ConnectionClosed("server stdin is closed".into()))?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the server's output until it ends, demultiplexing responses to
/// their waiters and answering the few requests a server may send us.
async fn read_loop(
    reader: BoxedReader,
    pending: PendingRequests,
    writer: SharedWriter,
    alive: Arc<AtomicBool>,
    stderr_path: Option<PathBuf>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut skipped = 0usize;

    let reason = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break "server closed its output stream".to_string(),
            Ok(_) => {}
            Err(e) => break format!("error reading server output: {e}"),
        }

        // Bytes that are not UTF-8 are noise like any other non-JSON line.
        let line = std::str::from_utf8(&buf).map(str::trim);
        if matches!(line, Ok("")) {
            continue;
        }
        let trimmed = match line {
            Ok(line) if line.starts_with('{') => line,
            _ => {
                skipped += 1;
                if skipped >= MAX_SKIP_LINES {
                    break "server produced too many non-JSON lines on stdout".to_string();
                }
                tracing::debug!(
                    line = %String::from_utf8_lossy(&buf).trim(),
                    "skipping non-JSON line from server stdout"
                );
                continue;
            }
        };
        skipped = 0;

        match Message::parse(trimmed) {
            Ok(Message::Response(response)) => {
                let id = response.id.clone();
                if !pending.complete(response) {
                    tracing::debug!(id = ?id, "dropping response nobody is waiting for");
                }
            }
            Ok(Message::Notification(notification)) => {
                tracing::debug!(method = %notification.method, "server notification");
            }
            Ok(Message::Request(request)) => {
                let reply = if request.method == Method::Ping.as_str() {
                    Response::success(request.id, Value::Object(Default::default()))
                } else {
                    tracing::debug!(method = %request.method, "unsupported server request");
                    Response::failure(
                        Some(request.id),
                        ErrorCode::MethodNotFound.code(),
                        "Method not found",
                    )
                };
                if let Err(e) = write_message(&writer, &reply).await {
                    tracing::debug!(error = %e, "failed to answer server request");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "malformed message from server");
                // If it still names a request we are waiting for, fail that
                // request now instead of letting it run into its timeout.
                if let Some(id) = serde_json::from_str::<Value>(trimmed)
                    .ok()
                    .and_then(|v| v.get("id").cloned())
                    .and_then(|id| serde_json::from_value(id).ok())
                {
                    pending.complete(Response::failure(
                        Some(id),
                        ErrorCode::ParseError.code(),
                        format!("malformed response: {e}"),
                    ));
                }
            }
        }
    };

    alive.store(false, Ordering::SeqCst);

    let mut message = reason;
    if let Some(path) = stderr_path {
        if let Some(tail) = read_tail(&path, STDERR_TAIL_LINES).await {
            message = format!("{message}; stderr: {tail}");
        }
    }
    tracing::info!(reason = %message, "MCP server stream ended");

    let failed = pending.close(&Error::ConnectionClosed(message));
    if failed > 0 {
        tracing::debug!(failed, "failed pending requests after stream end");
    }
}

async fn read_tail(path: &Path, lines: usize) -> Option<String> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    let all: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
    if all.is_empty() {
        return None;
    }
    let start = all.len().saturating_sub(lines);
    Some(all[start..].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;
    use serde_json::json;
    use tokio::io::{duplex, DuplexStream};

    fn request(id: i64, method: Method) -> Request {
        Request::new(RequestId::Number(id), method, None)
    }

    /// Starts a transport wired to an in-memory peer and returns the peer's
    /// ends of the streams.
    async fn connected() -> (StdioTransport, BufReader<DuplexStream>, DuplexStream) {
        let (client_read, server_write) = duplex(64 * 1024);
        let (server_read, client_write) = duplex(64 * 1024);
        let transport = StdioTransport::with_streams(client_read, client_write);
        transport.initialize().await.unwrap();
        (transport, BufReader::new(server_read), server_write)
    }

    async fn read_json(reader: &mut BufReader<DuplexStream>) -> Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn write_json(writer: &mut DuplexStream, value: Value) {
        let mut line = value.to_string();
        line.push('\n');
        writer.write_all(line.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_requests_are_matched_by_id() {
        let (transport, mut server_in, mut server_out) = connected().await;
        let transport = Arc::new(transport);

        let t1 = transport.clone();
        let first = tokio::spawn(async move {
            t1.send(request(1, Method::ToolsList), Duration::from_secs(5)).await
        });
        let first_seen = read_json(&mut server_in).await;
        assert_eq!(first_seen["id"], 1);

        let t2 = transport.clone();
        let second = tokio::spawn(async move {
            t2.send(request(2, Method::ToolsList), Duration::from_secs(5)).await
        });
        let second_seen = read_json(&mut server_in).await;
        assert_eq!(second_seen["id"], 2);

        // Answer in reverse order, with noise in between.
        write_json(&mut server_out, json!({"jsonrpc": "2.0", "id": 2, "result": {"n": 2}})).await;
        server_out.write_all(b"server log line\n").await.unwrap();
        write_json(&mut server_out, json!({"jsonrpc": "2.0", "method": "notifications/message"})).await;
        write_json(&mut server_out, json!({"jsonrpc": "2.0", "id": 1, "result": {"n": 1}})).await;

        let r1 = first.await.unwrap();
        let r2 = second.await.unwrap();
        assert_eq!(r1.result, Some(json!({"n": 1})));
        assert_eq!(r2.result, Some(json!({"n": 2})));
        assert!(transport.pending().is_empty());
    }

    #[tokio::test]
    async fn notification_is_written_without_id() {
        let (transport, mut server_in, _server_out) = connected().await;
        transport
            .send_notification(Notification::new(Method::Initialized, None))
            .await
            .unwrap();

        let seen = read_json(&mut server_in).await;
        assert_eq!(seen["method"], "notifications/initialized");
        assert!(seen.get("id").is_none());
        assert!(transport.pending().is_empty());
    }

    #[tokio::test]
    async fn timeout_leaves_no_pending_entry() {
        let (transport, mut server_in, _server_out) = connected().await;
        let response = transport
            .send(request(9, Method::ToolsCall), Duration::from_millis(50))
            .await;
        let _ = read_json(&mut server_in).await;

        assert!(matches!(response.into_result(), Err(Error::Timeout(_))));
        assert!(!transport.pending().contains(&RequestId::Number(9)));
    }

    #[tokio::test]
    async fn stream_end_fails_pending_requests() {
        let (transport, mut server_in, server_out) = connected().await;
        let transport = Arc::new(transport);

        let t = transport.clone();
        let waiting = tokio::spawn(async move {
            t.send(request(4, Method::ToolsList), Duration::from_secs(30)).await
        });
        let _ = read_json(&mut server_in).await;
        drop(server_out);

        let response = waiting.await.unwrap();
        assert!(matches!(response.into_result(), Err(Error::ConnectionClosed(_))));
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn non_utf8_output_is_skipped() {
        let (transport, mut server_in, mut server_out) = connected().await;
        let transport = Arc::new(transport);

        let t = transport.clone();
        let waiting = tokio::spawn(async move {
            t.send(request(1, Method::ToolsList), Duration::from_secs(5)).await
        });
        let _ = read_json(&mut server_in).await;
        server_out.write_all(b"caf\xe9 starting\n").await.unwrap();
        write_json(&mut server_out, json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}})).await;

        let response = waiting.await.unwrap();
        assert_eq!(response.result, Some(json!({"tools": []})));
        assert!(transport.is_alive());
    }

    #[tokio::test]
    async fn stream_end_refuses_new_requests() {
        let (transport, _server_in, server_out) = connected().await;
        drop(server_out);
        while transport.is_alive() {
            tokio::task::yield_now().await;
        }
        // The reader marks the transport dead before it closes the table.
        while !transport.pending().is_closed() {
            tokio::task::yield_now().await;
        }

        let err = transport.pending().register(RequestId::Number(2)).err();
        assert!(matches!(err, Some(Error::ConnectionClosed(_))));
        let response = transport
            .send(request(3, Method::ToolsList), Duration::from_secs(30))
            .await;
        assert!(matches!(response.into_result(), Err(Error::ConnectionClosed(_))));
        assert!(transport.pending().is_empty());
    }

    #[tokio::test]
    async fn malformed_response_fails_its_request() {
        let (transport, mut server_in, mut server_out) = connected().await;
        let transport = Arc::new(transport);

        let t = transport.clone();
        let waiting = tokio::spawn(async move {
            t.send(request(6, Method::ToolsCall), Duration::from_secs(30)).await
        });
        let _ = read_json(&mut server_in).await;
        // `error` must be an object; this one is a string.
        write_json(&mut server_out, json!({"jsonrpc": "2.0", "id": 6, "error": "bad"})).await;

        let response = waiting.await.unwrap();
        let error = response.error.expect("synthetic error");
        assert_eq!(error.code, ErrorCode::ParseError.code());
    }

    #[tokio::test]
    async fn server_ping_is_answered() {
        let (_transport, mut server_in, mut server_out) = connected().await;
        write_json(&mut server_out, json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"})).await;

        let reply = read_json(&mut server_in).await;
        assert_eq!(reply["id"], "srv-1");
        assert_eq!(reply["result"], json!({}));
    }

    #[tokio::test]
    async fn send_after_close_is_an_error_response() {
        let (transport, _server_in, _server_out) = connected().await;
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let response = transport
            .send(request(1, Method::ToolsList), Duration::from_secs(1))
            .await;
        assert!(matches!(response.into_result(), Err(Error::ConnectionClosed(_))));
        assert!(transport.initialize().await.is_err());
    }

    #[tokio::test]
    async fn spawn_of_missing_command_fails() {
        let transport = StdioTransport::new(CommandSpec {
            command: "nonexistent-mcp-server-12345".into(),
            ..Default::default()
        });
        let err = transport.initialize().await.unwrap_err();
        assert!(matches!(err, Error::Spawn(_)));
        assert!(!transport.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_process_is_reported_with_stderr() {
        let transport = StdioTransport::new(CommandSpec {
            command: "sh".into(),
            args: vec!["-c".into(), "echo 'bad config' >&2; exit 3".into()],
            ..Default::default()
        });
        transport.initialize().await.unwrap();

        let response = transport
            .send(request(1, Method::Initialize), Duration::from_secs(5))
            .await;
        assert!(response.is_error());
        assert!(!transport.is_alive());

        let tail = transport.stderr_tail(10).await.unwrap_or_default();
        assert!(tail.contains("bad config"));
        transport.close().await.unwrap();
    }
}
