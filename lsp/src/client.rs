//! Protocol client: owns one server process and speaks LSP to it.
//!
//! Three background tasks serve each client: a writer draining an mpsc queue
//! onto the server's stdin, a reader feeding stdout through the
//! [`FrameDecoder`] and dispatching messages, and (for real child processes)
//! a supervisor that waits for exit or a kill signal. Process lifecycle is a
//! `watch` channel over [`ProcessState`]; the first terminal transition fails
//! every outstanding request and emits exactly one [`ClientEvent::Closed`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{OnceCell, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::codec::{FrameDecoder, FrameWriter};
use crate::diagnostics::DiagnosticsStore;
use crate::error::LspError;
use crate::process::ServerProcess;
use crate::protocol::{
    self, Incoming, Notification, PublishDiagnosticsParams, Request, Response, ResponseError,
};
use crate::types::{ClientKey, CompletionItem, Diagnostic, Hover, Location, Position, ProcessState};

const WRITER_CHANNEL_CAPACITY: usize = 64;

const DIAGNOSTICS_BROADCAST_CAPACITY: usize = 64;

const READ_CHUNK_BYTES: usize = 8 * 1024;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Event sent from a client to whoever owns it.
#[derive(Debug)]
pub enum ClientEvent {
    /// The server replaced its diagnostics for `path`.
    Diagnostics {
        key: ClientKey,
        path: PathBuf,
        diagnostics: Vec<Diagnostic>,
    },
    /// The process reached a terminal state. Sent once per client.
    Closed {
        key: ClientKey,
        instance: u64,
        state: ProcessState,
    },
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
        }
    }
}

enum WriterCommand {
    Send(Value),
    Shutdown,
}

type ResponseResult = Result<Value, ResponseError>;

/// State shared between the client handle and its background tasks.
struct Shared {
    key: ClientKey,
    instance: u64,
    initialization_options: Value,
    pending: tokio::sync::Mutex<HashMap<u64, oneshot::Sender<ResponseResult>>>,
    diagnostics: Mutex<DiagnosticsStore>,
    diagnostics_tx: broadcast::Sender<PathBuf>,
    state_tx: watch::Sender<ProcessState>,
    events: mpsc::Sender<ClientEvent>,
    writer_tx: mpsc::Sender<WriterCommand>,
}

impl Shared {
    fn new(
        key: ClientKey,
        initialization_options: Value,
        events: mpsc::Sender<ClientEvent>,
        writer_tx: mpsc::Sender<WriterCommand>,
    ) -> Self {
        let (diagnostics_tx, _) = broadcast::channel(DIAGNOSTICS_BROADCAST_CAPACITY);
        let (state_tx, _) = watch::channel(ProcessState::Spawning);
        Self {
            key,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            initialization_options,
            pending: tokio::sync::Mutex::new(HashMap::new()),
            diagnostics: Mutex::new(DiagnosticsStore::new()),
            diagnostics_tx,
            state_tx,
            events,
            writer_tx,
        }
    }

    fn store(&self) -> MutexGuard<'_, DiagnosticsStore> {
        self.diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn send(&self, frame: Value) -> Result<(), LspError> {
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| LspError::ConnectionClosed)
    }

    /// Move to a terminal state. Only the first call has any effect.
    async fn finish(&self, state: ProcessState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = state.clone();
            true
        });
        if !changed {
            return;
        }

        // Dropping the responders fails every outstanding request.
        self.pending.lock().await.clear();
        tracing::info!(server = %self.key, ?state, "LSP server stopped");
        let _ = self
            .events
            .send(ClientEvent::Closed {
                key: self.key.clone(),
                instance: self.instance,
                state,
            })
            .await;
    }
}

/// A live connection to one language server scoped to one project root.
pub struct ProtocolClient {
    shared: Arc<Shared>,
    options: ClientOptions,
    next_id: AtomicU64,
    /// Open documents and their current version.
    documents: tokio::sync::Mutex<HashMap<PathBuf, i32>>,
    capabilities: OnceCell<Value>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProtocolClient {
    /// Attach to a spawned server and start the background tasks.
    ///
    /// The client is in [`ProcessState::Spawning`] until
    /// [`ProtocolClient::initialize`] succeeds.
    pub fn start(
        key: ClientKey,
        process: ServerProcess,
        options: ClientOptions,
        events: mpsc::Sender<ClientEvent>,
    ) -> Self {
        let ServerProcess {
            reader,
            writer,
            child,
            initialization_options,
        } = process;

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared::new(key, initialization_options, events, writer_tx));

        let writer_key = shared.key.clone();
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!(server = %writer_key, "LSP write error: {e}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => {
                        let _ = writer.shutdown().await;
                        break;
                    }
                }
            }
        });

        let has_child = child.is_some();
        let reader_handle = tokio::spawn(read_loop(reader, shared.clone(), has_child));

        let mut tasks = vec![writer_handle, reader_handle];
        let mut kill_tx = None;
        if let Some(child) = child {
            let (tx, rx) = oneshot::channel();
            kill_tx = Some(tx);
            tasks.push(tokio::spawn(supervise(child, rx, shared.clone())));
        }

        Self {
            shared,
            options,
            next_id: AtomicU64::new(1),
            documents: tokio::sync::Mutex::new(HashMap::new()),
            capabilities: OnceCell::new(),
            kill_tx: Mutex::new(kill_tx),
            tasks,
        }
    }

    #[must_use]
    pub fn key(&self) -> &ClientKey {
        &self.shared.key
    }

    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.shared.key.server_id
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.shared.key.root
    }

    /// Identifies this client among clients that have held the same key.
    #[must_use]
    pub fn instance(&self) -> u64 {
        self.shared.instance
    }

    #[must_use]
    pub fn state(&self) -> ProcessState {
        self.shared.state_tx.borrow().clone()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.capabilities.initialized()
    }

    /// Server capabilities negotiated during `initialize`.
    #[must_use]
    pub fn capabilities(&self) -> Option<&Value> {
        self.capabilities.get()
    }

    /// Perform the `initialize` / `initialized` handshake.
    ///
    /// Idempotent: later calls return immediately once the handshake
    /// succeeded. A failed handshake leaves the client uninitialized.
    pub async fn initialize(&self) -> Result<(), LspError> {
        self.capabilities
            .get_or_try_init(|| async {
                let root = self.root();
                let root_uri = protocol::path_to_file_uri(root)?;
                let root_name = root
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("workspace");
                let params = protocol::initialize_params(
                    root_uri.as_str(),
                    root_name,
                    &self.shared.initialization_options,
                );
                let result = self.request("initialize", Some(params)).await?;
                self.notify("initialized", Some(json!({}))).await?;
                Ok::<_, LspError>(result.get("capabilities").cloned().unwrap_or(Value::Null))
            })
            .await?;

        self.shared.state_tx.send_if_modified(|state| {
            if *state == ProcessState::Spawning {
                *state = ProcessState::Running;
                return true;
            }
            false
        });
        Ok(())
    }

    async fn request(&self, method: &'static str, params: Option<Value>) -> Result<Value, LspError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        // `finish` sets the state before draining, so checking after the
        // insert cannot miss a close.
        if self.shared.state_tx.borrow().is_terminal() {
            self.shared.pending.lock().await.remove(&id);
            return Err(LspError::ConnectionClosed);
        }

        let frame = serde_json::to_value(Request::new(id, method, params))?;
        if let Err(e) = self.shared.send(frame).await {
            self.shared.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.options.request_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(LspError::Rpc {
                method: method.to_string(),
                code: error.code,
                message: error.message,
            }),
            Ok(Err(_)) => {
                self.shared.pending.lock().await.remove(&id);
                Err(LspError::ConnectionClosed)
            }
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                Err(LspError::Timeout {
                    method: method.to_string(),
                    timeout: self.options.request_timeout,
                })
            }
        }
    }

    async fn notify(&self, method: &'static str, params: Option<Value>) -> Result<(), LspError> {
        let frame = serde_json::to_value(Notification::new(method, params))?;
        self.shared.send(frame).await
    }

    fn uri(path: &Path) -> Result<String, LspError> {
        Ok(protocol::path_to_file_uri(path)?.to_string())
    }

    /// Send `didOpen` for `path` with its current contents on disk.
    ///
    /// Opening an already-open document does nothing.
    pub async fn open_document(&self, path: &Path) -> Result<(), LspError> {
        let mut documents = self.documents.lock().await;
        if documents.contains_key(path) {
            return Ok(());
        }
        let text = read_text(path).await?;
        self.send_did_open(path, &text).await?;
        documents.insert(path.to_path_buf(), 1);
        Ok(())
    }

    async fn send_did_open(&self, path: &Path, text: &str) -> Result<(), LspError> {
        let uri = Self::uri(path)?;
        let language_id = protocol::language_id_for_path(path);
        let params = protocol::did_open_params(&uri, language_id, 1, text);
        self.notify("textDocument/didOpen", Some(params)).await
    }

    /// Replace the document's contents with `content`.
    ///
    /// An unopened document is opened at version 1 with `content`; an open
    /// one moves to the next version. Returns the version sent.
    pub async fn change_document(&self, path: &Path, content: &str) -> Result<i32, LspError> {
        let mut documents = self.documents.lock().await;
        if let Some(version) = documents.get_mut(path) {
            *version += 1;
            let version = *version;
            let uri = Self::uri(path)?;
            let params = protocol::did_change_params(&uri, version, content);
            self.notify("textDocument/didChange", Some(params)).await?;
            return Ok(version);
        }
        self.send_did_open(path, content).await?;
        documents.insert(path.to_path_buf(), 1);
        Ok(1)
    }

    /// Send `didSave`, opening the document first if needed.
    pub async fn save_document(&self, path: &Path) -> Result<(), LspError> {
        let text = read_text(path).await?;
        let mut documents = self.documents.lock().await;
        if !documents.contains_key(path) {
            self.send_did_open(path, &text).await?;
            documents.insert(path.to_path_buf(), 1);
        }
        let uri = Self::uri(path)?;
        let params = protocol::did_save_params(&uri, Some(&text));
        self.notify("textDocument/didSave", Some(params)).await
    }

    /// Send `didClose` and forget the document's version and diagnostics.
    pub async fn close_document(&self, path: &Path) -> Result<(), LspError> {
        let was_open = self.documents.lock().await.remove(path).is_some();
        self.shared.store().remove(path);
        if was_open {
            let uri = Self::uri(path)?;
            let params = protocol::did_close_params(&uri);
            self.notify("textDocument/didClose", Some(params)).await?;
        }
        Ok(())
    }

    pub async fn document_version(&self, path: &Path) -> Option<i32> {
        self.documents.lock().await.get(path).copied()
    }

    pub async fn open_documents(&self) -> Vec<PathBuf> {
        self.documents.lock().await.keys().cloned().collect()
    }

    async fn position_request(
        &self,
        method: &'static str,
        path: &Path,
        position: Position,
    ) -> Result<Value, LspError> {
        self.open_document(path).await?;
        let uri = Self::uri(path)?;
        let params = if method == "textDocument/references" {
            protocol::reference_params(&uri, position)
        } else {
            protocol::text_document_position_params(&uri, position)
        };
        self.request(method, Some(params)).await
    }

    pub async fn hover(&self, path: &Path, position: Position) -> Result<Option<Hover>, LspError> {
        let result = self
            .position_request("textDocument/hover", path, position)
            .await?;
        Ok(protocol::parse_hover(&result))
    }

    pub async fn completion(
        &self,
        path: &Path,
        position: Position,
    ) -> Result<Vec<CompletionItem>, LspError> {
        let result = self
            .position_request("textDocument/completion", path, position)
            .await?;
        Ok(protocol::parse_completion(&result))
    }

    /// Definition locations, or `None` when the server found nothing.
    pub async fn definition(
        &self,
        path: &Path,
        position: Position,
    ) -> Result<Option<Vec<Location>>, LspError> {
        let result = self
            .position_request("textDocument/definition", path, position)
            .await?;
        let locations = protocol::parse_locations(&result);
        Ok((!locations.is_empty()).then_some(locations))
    }

    /// Reference locations, including the declaration. Never `None`.
    pub async fn references(
        &self,
        path: &Path,
        position: Position,
    ) -> Result<Vec<Location>, LspError> {
        let result = self
            .position_request("textDocument/references", path, position)
            .await?;
        Ok(protocol::parse_locations(&result))
    }

    /// Every file's current diagnostics from this server.
    #[must_use]
    pub fn diagnostics(&self) -> HashMap<PathBuf, Vec<Diagnostic>> {
        self.shared
            .store()
            .iter()
            .map(|(path, items)| (path.clone(), items.clone()))
            .collect()
    }

    #[must_use]
    pub fn diagnostics_for(&self, path: &Path) -> Vec<Diagnostic> {
        self.published(path).unwrap_or_default()
    }

    fn published(&self, path: &Path) -> Option<Vec<Diagnostic>> {
        self.shared.store().get(path).map(<[Diagnostic]>::to_vec)
    }

    /// Diagnostics for `path`, waiting up to `timeout` for a first publish.
    ///
    /// Returns what is known when the wait ends; an empty list on timeout.
    pub async fn wait_for_diagnostics(&self, path: &Path, timeout: Duration) -> Vec<Diagnostic> {
        let mut rx = self.shared.diagnostics_tx.subscribe();
        if let Some(items) = self.published(path) {
            return items;
        }

        let waited = tokio::time::timeout(timeout, async {
            loop {
                match rx.recv().await {
                    Ok(published) if published == path => return,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.published(path).is_some() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
        .await;

        if waited.is_err() {
            tracing::debug!(server = %self.key(), path = %path.display(), "Timed out waiting for diagnostics");
        }
        self.diagnostics_for(path)
    }

    /// Shut the server down. Never fails.
    ///
    /// Sends `shutdown` and `exit`, then force-terminates the process if it
    /// has not gone away within a short grace period.
    pub async fn shutdown(&self) {
        let mut state_rx = self.shared.state_tx.subscribe();
        if !state_rx.borrow().is_terminal() {
            if let Ok(Ok(_)) = tokio::time::timeout(SHUTDOWN_GRACE, self.request("shutdown", None)).await {
                let _ = self.notify("exit", None).await;
            }
            let _ = self.shared.writer_tx.send(WriterCommand::Shutdown).await;
        }

        let exited = tokio::time::timeout(SHUTDOWN_GRACE, state_rx.wait_for(ProcessState::is_terminal))
            .await
            .is_ok();
        if exited {
            return;
        }

        tracing::debug!(server = %self.key(), "LSP server didn't exit in time, killing");
        let kill_tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match kill_tx {
            Some(tx) => {
                let _ = tx.send(());
                let _ = tokio::time::timeout(
                    SHUTDOWN_GRACE,
                    state_rx.wait_for(ProcessState::is_terminal),
                )
                .await;
            }
            None => self.shared.finish(ProcessState::Exited(None)).await,
        }
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        // The supervisor kills the child when its kill channel closes.
        for task in &self.tasks {
            if !task.is_finished() {
                task.abort();
            }
        }
    }
}

async fn read_text(path: &Path) -> Result<String, LspError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| LspError::ReadFile {
            path: path.to_path_buf(),
            source,
        })
}

async fn read_loop(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    shared: Arc<Shared>,
    has_child: bool,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let outcome = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break ProcessState::Exited(None),
            Ok(n) => {
                for frame in decoder.feed(&buf[..n]) {
                    dispatch_frame(&frame, &shared).await;
                }
            }
            Err(e) => break ProcessState::Errored(format!("reading server output: {e}")),
        }
    };

    tracing::debug!(server = %shared.key, "LSP server closed stdout");
    shared.pending.lock().await.clear();
    if !has_child {
        shared.finish(outcome).await;
    }
}

async fn supervise(mut child: Child, mut kill_rx: oneshot::Receiver<()>, shared: Arc<Shared>) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let state = match status {
        Ok(status) => ProcessState::Exited(status.code()),
        Err(e) => ProcessState::Errored(format!("waiting for server process: {e}")),
    };
    shared.finish(state).await;
}

async fn dispatch_frame(frame: &Value, shared: &Shared) {
    let Some(incoming) = protocol::parse_incoming(frame) else {
        tracing::trace!(server = %shared.key, "Ignoring malformed JSON-RPC frame");
        return;
    };

    match incoming {
        Incoming::Response { id, result } => {
            let sender = shared.pending.lock().await.remove(&id);
            if let Some(tx) = sender {
                let _ = tx.send(result);
            }
        }
        Incoming::ServerRequest { id, method, params } => {
            let result = server_request_result(shared, &method, params.as_ref());
            match serde_json::to_value(Response::new(id, result)) {
                Ok(frame) => {
                    let _ = shared.send(frame).await;
                }
                Err(e) => tracing::warn!(server = %shared.key, "Failed to encode reply: {e}"),
            }
        }
        Incoming::Notification { method, params } => {
            handle_notification(shared, &method, params).await;
        }
    }
}

/// Answer a request the server sent us. Every request gets a reply.
fn server_request_result(shared: &Shared, method: &str, params: Option<&Value>) -> Value {
    match method {
        "workspace/workspaceFolders" => {
            let Ok(uri) = protocol::path_to_file_uri(&shared.key.root) else {
                return Value::Null;
            };
            let name = shared
                .key
                .root
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("workspace");
            json!([{ "uri": uri.as_str(), "name": name }])
        }
        "workspace/configuration" => {
            let count = params
                .and_then(|p| p.get("items"))
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            Value::Array(vec![shared.initialization_options.clone(); count])
        }
        "client/registerCapability" | "client/unregisterCapability" => Value::Null,
        other => {
            tracing::debug!(server = %shared.key, "LSP server sent request {other}; replying null");
            Value::Null
        }
    }
}

async fn handle_notification(shared: &Shared, method: &str, params: Option<Value>) {
    match method {
        "textDocument/publishDiagnostics" => {
            let Some(params) = params else { return };
            let params = match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                Ok(params) => params,
                Err(e) => {
                    tracing::debug!(server = %shared.key, "Failed to parse publishDiagnostics: {e}");
                    return;
                }
            };
            let Some(path) = protocol::file_uri_to_path(&params.uri) else {
                tracing::trace!(server = %shared.key, uri = %params.uri, "Ignoring diagnostics for non-file URI");
                return;
            };
            let diagnostics: Vec<Diagnostic> = params
                .diagnostics
                .into_iter()
                .map(protocol::LspDiagnostic::into_diagnostic)
                .collect();

            shared.store().update(path.clone(), diagnostics.clone());
            let _ = shared.diagnostics_tx.send(path.clone());
            let _ = shared
                .events
                .send(ClientEvent::Diagnostics {
                    key: shared.key.clone(),
                    path,
                    diagnostics,
                })
                .await;
        }
        "window/logMessage" | "window/showMessage" => {
            let Some(params) = params else { return };
            let message = params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let server = &shared.key;
            match params.get("type").and_then(Value::as_u64) {
                Some(1) => tracing::error!(%server, "{message}"),
                Some(2) => tracing::warn!(%server, "{message}"),
                Some(3) => tracing::info!(%server, "{message}"),
                _ => tracing::debug!(%server, "{message}"),
            }
        }
        _ => {
            tracing::trace!(server = %shared.key, "Ignoring notification: {method}");
        }
    }
}
