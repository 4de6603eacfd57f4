//! Client for one language server process.
//!
//! Owns the child process, the stdio link and request correlation. Shared
//! behind an `Arc`: any number of tasks may issue requests concurrently;
//! writes are serialized on one async mutex and responses are routed back by
//! id through one-shot channels.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::{FrameReader, FrameWriter};
use crate::config::ServerConfig;
use crate::error::{LspError, LspResult};
use crate::protocol::{self, IncomingFrame, Notification, Request};
use crate::types::{Diagnostic, SemanticTokensLegend, ServerState};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives every `publishDiagnostics` as `(uri, diagnostics)`.
pub type DiagnosticsHandler = Arc<dyn Fn(&str, &[Diagnostic]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientPhase {
    Created,
    Starting,
    Running,
    Stopped,
}

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Value>>>;

/// State reachable from the reader task.
struct Shared {
    language: String,
    pending: PendingMap,
    writer: tokio::sync::Mutex<Option<FrameWriter<ChildStdin>>>,
    phase: watch::Sender<ClientPhase>,
    diagnostics: DiagnosticsHandler,
}

impl Shared {
    fn new(language: &str, diagnostics: DiagnosticsHandler) -> Self {
        Self {
            language: language.to_string(),
            pending: Mutex::new(HashMap::new()),
            writer: tokio::sync::Mutex::new(None),
            phase: watch::Sender::new(ClientPhase::Created),
            diagnostics,
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Value>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the client stopped and close every pending channel.
    fn mark_stopped(&self) {
        self.phase.send_if_modified(|phase| {
            let changed = *phase != ClientPhase::Stopped;
            *phase = ClientPhase::Stopped;
            changed
        });
        // Dropping the senders wakes every waiter with a closed channel.
        self.pending().clear();
    }

    async fn write(&self, frame: &Value) -> LspResult<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(LspError::ConnectionClosed);
        };
        tracing::trace!(language = %self.language, frame = %frame, "-> server");
        if let Err(e) = writer.write_frame(frame).await {
            tracing::warn!(language = %self.language, "LSP write failed: {e:#}");
            guard.take();
            drop(guard);
            self.mark_stopped();
            return Err(LspError::ConnectionClosed);
        }
        Ok(())
    }

    /// Route one inbound frame. Returns the reply owed to a server request.
    fn dispatch_frame(&self, frame: &Value) -> Option<Value> {
        let Some(incoming) = protocol::parse_incoming(frame) else {
            tracing::trace!(language = %self.language, "ignoring malformed JSON-RPC frame");
            return None;
        };

        match incoming {
            IncomingFrame::Response { id, body } => {
                let sender = self.pending().remove(&id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(body);
                    }
                    None => {
                        tracing::debug!(language = %self.language, id, "response for unknown id dropped");
                    }
                }
                None
            }
            IncomingFrame::ServerRequest { id, method, params } => {
                tracing::debug!(language = %self.language, method = %method, "server request");
                Some(protocol::server_request_reply(&id, &method, params.as_ref()))
            }
            IncomingFrame::Notification { method, params } => {
                self.handle_notification(&method, params);
                None
            }
        }
    }

    fn handle_notification(&self, method: &str, params: Option<Value>) {
        match method {
            "textDocument/publishDiagnostics" => {
                let Some(params) = params else { return };
                match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(publish) => (self.diagnostics)(&publish.uri, &publish.diagnostics),
                    Err(e) => {
                        tracing::debug!(
                            language = %self.language,
                            "failed to parse publishDiagnostics: {e}"
                        );
                    }
                }
            }
            "window/logMessage" | "window/showMessage" => {
                let Some(params) = params else { return };
                let level = params.get("type").and_then(Value::as_u64).unwrap_or(4);
                let message = params
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                match level {
                    1 => tracing::warn!(language = %self.language, "server: {message}"),
                    2 => tracing::info!(language = %self.language, "server: {message}"),
                    _ => tracing::debug!(language = %self.language, "server: {message}"),
                }
            }
            _ => {
                tracing::trace!(language = %self.language, method, "ignoring notification");
            }
        }
    }
}

#[derive(Deserialize)]
struct PublishDiagnosticsParams {
    uri: String,
    #[serde(default)]
    diagnostics: Vec<Diagnostic>,
}

struct Tasks {
    reader: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

pub struct LspClient {
    config: ServerConfig,
    generation: u64,
    request_timeout: Duration,
    next_id: AtomicU64,
    shared: Arc<Shared>,
    pid: Mutex<Option<u32>>,
    legend: Mutex<Option<SemanticTokensLegend>>,
    kill: CancellationToken,
    tasks: Mutex<Option<Tasks>>,
}

impl LspClient {
    /// A client in phase `Created`; nothing is spawned until [`start`].
    ///
    /// The process is killed when `cancel` (or this client's own stop
    /// escalation) fires.
    ///
    /// [`start`]: LspClient::start
    pub fn new(
        config: ServerConfig,
        generation: u64,
        request_timeout: Duration,
        diagnostics: DiagnosticsHandler,
        cancel: &CancellationToken,
    ) -> Self {
        let shared = Arc::new(Shared::new(config.language(), diagnostics));
        Self {
            config,
            generation,
            request_timeout,
            next_id: AtomicU64::new(1),
            shared,
            pid: Mutex::new(None),
            legend: Mutex::new(None),
            kill: cancel.child_token(),
            tasks: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn language(&self) -> &str {
        self.config.language()
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn phase(&self) -> ClientPhase {
        *self.shared.phase.borrow()
    }

    #[must_use]
    pub fn state(&self) -> ServerState {
        match self.phase() {
            ClientPhase::Created | ClientPhase::Starting => ServerState::Starting,
            ClientPhase::Running => ServerState::Running,
            ClientPhase::Stopped => ServerState::Stopped,
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase() == ClientPhase::Running
    }

    /// PID of the server process while it runs.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        if !self.is_running() {
            return None;
        }
        *self.pid.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The semantic tokens legend from the server's `initialize` result.
    #[must_use]
    pub fn semantic_legend(&self) -> Option<SemanticTokensLegend> {
        self.legend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait for a concurrent [`start`](LspClient::start) to finish.
    pub async fn wait_ready(&self) -> LspResult<()> {
        let mut rx = self.shared.phase.subscribe();
        let phase = rx
            .wait_for(|p| matches!(p, ClientPhase::Running | ClientPhase::Stopped))
            .await
            .map(|p| *p)
            .unwrap_or(ClientPhase::Stopped);
        if phase == ClientPhase::Running {
            Ok(())
        } else {
            Err(LspError::Handshake {
                language: self.language().to_string(),
                message: "server did not start".to_string(),
            })
        }
    }

    /// Spawn the server and run the `initialize` handshake.
    pub async fn start(&self, root_uri: &str, workspace_name: &str) -> LspResult<()> {
        let claimed = self.shared.phase.send_if_modified(|phase| {
            if *phase == ClientPhase::Created {
                *phase = ClientPhase::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return self.wait_ready().await;
        }

        match self.spawn_and_initialize(root_uri, workspace_name).await {
            Ok(()) => {
                self.shared.phase.send_replace(ClientPhase::Running);
                tracing::info!(
                    language = self.language(),
                    pid = ?self.pid(),
                    generation = self.generation,
                    "language server started"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(language = self.language(), error = %e, "language server failed to start");
                self.shared.mark_stopped();
                self.terminate().await;
                Err(e)
            }
        }
    }

    async fn spawn_and_initialize(&self, root_uri: &str, workspace_name: &str) -> LspResult<()> {
        let command = self.config.command().to_string();
        let resolved = which::which(&command).map_err(|source| LspError::BinaryNotFound {
            command: command.clone(),
            source,
        })?;

        let mut child = Command::new(&resolved)
            .args(self.config.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LspError::Spawn {
                command: command.clone(),
                source,
            })?;

        *self.pid.lock().unwrap_or_else(PoisonError::into_inner) = child.id();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LspError::Protocol(format!("no stdout from {command}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LspError::Protocol(format!("no stdin from {command}")))?;
        *self.shared.writer.lock().await = Some(FrameWriter::new(stdin));

        let reader_shared = Arc::clone(&self.shared);
        let reader = tokio::spawn(async move {
            let mut reader = FrameReader::new(stdout);
            loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => {
                        tracing::trace!(language = %reader_shared.language, frame = %frame, "<- server");
                        if let Some(reply) = reader_shared.dispatch_frame(&frame) {
                            // Off the read path: a blocked stdin must not stall stdout.
                            let writer_shared = Arc::clone(&reader_shared);
                            tokio::spawn(async move {
                                if let Err(e) = writer_shared.write(&reply).await {
                                    tracing::debug!("replying to server request failed: {e}");
                                }
                            });
                        }
                    }
                    Ok(None) => {
                        tracing::info!(language = %reader_shared.language, "language server closed stdout");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(language = %reader_shared.language, "LSP reader error: {e:#}");
                        break;
                    }
                }
            }
            reader_shared.mark_stopped();
        });

        let kill = self.kill.clone();
        let language = self.language().to_string();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    tracing::debug!(language = %language, status = ?status.ok(), "language server exited");
                }
                () = kill.cancelled() => {
                    let _ = child.kill().await;
                    tracing::debug!(language = %language, "language server killed");
                }
            }
        });

        *self.tasks.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Tasks { reader, watcher });

        let params = protocol::initialize_params(root_uri, workspace_name);
        let result = self
            .call("initialize", Some(params), self.request_timeout)
            .await
            .map_err(|e| LspError::Handshake {
                language: self.language().to_string(),
                message: e.to_string(),
            })?;

        if let Some(legend) = result
            .pointer("/capabilities/semanticTokensProvider/legend")
            .cloned()
            .and_then(|l| serde_json::from_value::<SemanticTokensLegend>(l).ok())
        {
            *self.legend.lock().unwrap_or_else(PoisonError::into_inner) = Some(legend);
        }

        self.send_notification("initialized", Some(json!({})))
            .await
            .map_err(|e| LspError::Handshake {
                language: self.language().to_string(),
                message: e.to_string(),
            })
    }

    async fn call(&self, method: &str, params: Option<Value>, after: Duration) -> LspResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);
        // The reader may have drained `pending` before the insert.
        if self.phase() == ClientPhase::Stopped {
            self.shared.pending().remove(&id);
            return Err(LspError::ConnectionClosed);
        }

        let frame = serde_json::to_value(Request::new(id, method, params))?;
        if let Err(e) = self.shared.write(&frame).await {
            self.shared.pending().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(after, rx).await {
            Ok(Ok(body)) => protocol::into_result(body).map_err(|err| LspError::Rpc {
                method: method.to_string(),
                code: err.code,
                message: err.message,
            }),
            Ok(Err(_)) => Err(LspError::ConnectionClosed),
            Err(_) => {
                self.shared.pending().remove(&id);
                Err(LspError::Timeout {
                    method: method.to_string(),
                    after,
                })
            }
        }
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> LspResult<()> {
        let frame = serde_json::to_value(Notification::new(method, params))?;
        self.shared.write(&frame).await
    }

    /// Issue a request and wait for its result (timeout-bounded).
    pub async fn request(&self, method: &str, params: Option<Value>) -> LspResult<Value> {
        if !self.is_running() {
            return Err(LspError::ConnectionClosed);
        }
        self.call(method, params, self.request_timeout).await
    }

    /// Send a notification. Write failures surface and stop the client.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> LspResult<()> {
        if !self.is_running() {
            return Err(LspError::ConnectionClosed);
        }
        self.send_notification(method, params).await
    }

    pub async fn did_open(&self, uri: &str, language_id: &str, version: i32, text: &str) -> LspResult<()> {
        self.notify(
            "textDocument/didOpen",
            Some(protocol::did_open_params(uri, language_id, version, text)),
        )
        .await
    }

    pub async fn did_change(&self, uri: &str, version: i32, text: &str) -> LspResult<()> {
        self.notify(
            "textDocument/didChange",
            Some(protocol::did_change_params(uri, version, text)),
        )
        .await
    }

    pub async fn did_close(&self, uri: &str) -> LspResult<()> {
        self.notify(
            "textDocument/didClose",
            Some(protocol::did_close_params(uri)),
        )
        .await
    }

    /// Shut the server down. Idempotent.
    ///
    /// A running server gets a bounded `shutdown` request and `exit`; the
    /// process is then given [`SHUTDOWN_TIMEOUT`] to exit before it is killed.
    pub async fn stop(&self) {
        if self.is_running() {
            if let Err(e) = self.call("shutdown", None, SHUTDOWN_TIMEOUT).await {
                tracing::debug!(language = self.language(), "shutdown request failed: {e}");
            }
            let _ = self.send_notification("exit", None).await;
            tracing::info!(language = self.language(), "language server stopped");
        }
        self.shared.mark_stopped();
        self.terminate().await;
    }

    /// Close stdin, wait briefly for exit, then kill.
    async fn terminate(&self) {
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.close().await;
        }

        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Tasks { reader, mut watcher }) = tasks else {
            return;
        };

        if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut watcher)
            .await
            .is_err()
        {
            tracing::debug!(language = self.language(), "server didn't exit in time, killing");
            self.kill.cancel();
            let _ = watcher.await;
        }
        reader.abort();
        self.shared.pending().clear();
    }
}
