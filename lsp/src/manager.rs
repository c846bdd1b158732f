//! `LspManager` facade: the public API hosts drive.
//!
//! Clients are created on demand, one per (server, project root) pair, the
//! first time a file needs them. The manager routes each file to every
//! matching server definition, deduplicates concurrent spawns, remembers
//! keys that failed so they are not retried, and aggregates results and
//! diagnostics across clients.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::future::{BoxFuture, FutureExt, Shared, join_all};
use tokio::sync::{OnceCell, broadcast, mpsc};

use crate::client::{ClientEvent, ClientOptions, ProtocolClient};
use crate::diagnostics;
use crate::protocol::normalize_path;
use crate::error::{InstallError, LspError};
use crate::install::Installer;
use crate::registry::{Registry, ServerDefinition, ServerSpec, SpawnContext, find_project_root};
use crate::types::{
    CacheInfo, ClientKey, CompletionItem, Diagnostic, DiagnosticsSnapshot, Hover, Location,
    LspConfig, LspEvent, Position, ServerStatus,
};

/// Capacity of the channel carrying client events to the manager.
const CLIENT_EVENT_CAPACITY: usize = 256;

/// Capacity of the host-facing event broadcast.
const HOST_EVENT_CAPACITY: usize = 256;

type SpawnShared = Shared<BoxFuture<'static, Option<Arc<ProtocolClient>>>>;

#[derive(Default)]
struct State {
    project_path: PathBuf,
    clients: HashMap<ClientKey, Arc<ProtocolClient>>,
    spawning: HashMap<ClientKey, SpawnShared>,
    /// Keys whose spawn failed this session.
    broken: HashSet<ClientKey>,
    disabled: HashSet<String>,
    /// Bumped by `shutdown`; spawns started in an older epoch are discarded.
    epoch: u64,
}

struct Inner {
    registry: Registry,
    installer: Installer,
    config: LspConfig,
    client_options: ClientOptions,
    cache_ready: OnceCell<()>,
    state: Mutex<State>,
    events: broadcast::Sender<LspEvent>,
    client_events: mpsc::Sender<ClientEvent>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: LspEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn prepare_cache(&self) {
        self.cache_ready
            .get_or_init(|| async {
                if let Err(e) = self.installer.prepare().await {
                    tracing::warn!("Failed to prepare LSP install cache: {e}");
                }
            })
            .await;
    }
}

/// Public facade for the LSP subsystem.
///
/// Cheap to clone; clones share all state. Must be created inside a tokio
/// runtime.
#[derive(Clone)]
pub struct LspManager {
    inner: Arc<Inner>,
}

impl LspManager {
    /// Manager over the built-in catalog plus configured custom servers,
    /// caching installs under `config.cache_dir` or the platform default.
    pub fn new(config: LspConfig, project_path: impl Into<PathBuf>) -> Result<Self, InstallError> {
        let root = config
            .cache_dir
            .clone()
            .or_else(Installer::default_root)
            .unwrap_or_else(|| std::env::temp_dir().join("polyglot-lsp"));
        let installer = Installer::new(root)?;
        let registry = Registry::with_config(&config);
        Ok(Self::with_registry(registry, installer, config, project_path))
    }

    /// Manager over an explicit registry and installer.
    pub fn with_registry(
        registry: Registry,
        installer: Installer,
        config: LspConfig,
        project_path: impl Into<PathBuf>,
    ) -> Self {
        let (events, _) = broadcast::channel(HOST_EVENT_CAPACITY);
        let (client_events, client_rx) = mpsc::channel(CLIENT_EVENT_CAPACITY);
        let state = State {
            project_path: normalize_path(&project_path.into()),
            disabled: config.disabled.iter().cloned().collect(),
            ..State::default()
        };
        let inner = Arc::new(Inner {
            registry,
            installer,
            client_options: ClientOptions {
                request_timeout: config.request_timeout(),
            },
            config,
            cache_ready: OnceCell::new(),
            state: Mutex::new(state),
            events,
            client_events,
        });
        tokio::spawn(pump_client_events(client_rx, Arc::downgrade(&inner)));
        Self { inner }
    }

    /// Receive host events. Events sent before subscribing are not replayed.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LspEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    #[must_use]
    pub fn installer(&self) -> &Installer {
        &self.inner.installer
    }

    /// Directory relative paths resolve against, and the root for servers
    /// without root markers.
    pub fn set_project_path(&self, path: impl Into<PathBuf>) {
        self.inner.state().project_path = normalize_path(&path.into());
    }

    #[must_use]
    pub fn project_path(&self) -> PathBuf {
        self.inner.state().project_path.clone()
    }

    #[must_use]
    pub fn is_server_enabled(&self, id: &str) -> bool {
        self.inner.config.enabled && !self.inner.state().disabled.contains(id)
    }

    /// Enable or disable a server for the rest of the session.
    ///
    /// Disabling shuts down every live client of the server. Enabling starts
    /// nothing; the next file that needs the server does. Either way the
    /// server's failed keys are forgotten so it may be retried.
    pub async fn set_server_enabled(&self, id: &str, enabled: bool) {
        let stopped: Vec<Arc<ProtocolClient>> = {
            let mut state = self.inner.state();
            state.broken.retain(|key| key.server_id != id);
            if enabled {
                state.disabled.remove(id);
                Vec::new()
            } else {
                state.disabled.insert(id.to_string());
                let keys: Vec<ClientKey> = state
                    .clients
                    .keys()
                    .filter(|key| key.server_id == id)
                    .cloned()
                    .collect();
                keys.iter()
                    .filter_map(|key| state.clients.remove(key))
                    .collect()
            }
        };

        tracing::info!(server = %id, enabled, stopped = stopped.len(), "LSP server toggled");
        join_all(stopped.iter().map(|client| client.shutdown())).await;
        self.inner.emit(LspEvent::ServerStatusChanged {
            server: id.to_string(),
            enabled,
        });
    }

    /// Key under which `path` is tracked: absolute, with `.` and `..`
    /// resolved the same way server URIs are.
    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            normalize_path(path)
        } else {
            normalize_path(&self.inner.state().project_path.join(path))
        }
    }

    /// Root for `path` under `spec`. Marker lookups touch the filesystem, so
    /// they run on the blocking pool.
    async fn resolve_root(&self, spec: &ServerSpec, path: &Path) -> Option<PathBuf> {
        if spec.root_patterns.is_empty() {
            let project = self.project_path();
            if path.starts_with(&project) {
                return Some(project);
            }
            return path.parent().map(Path::to_path_buf);
        }

        let start = path.to_path_buf();
        let roots = spec.root_patterns.clone();
        let excludes = spec.exclude_patterns.clone();
        let lookup = move || find_project_root(&start, &roots, &excludes);
        match tokio::task::spawn_blocking(lookup).await {
            Ok(root) => root,
            Err(e) => {
                tracing::warn!(server = %spec.id, "Root resolution failed: {e}");
                None
            }
        }
    }

    /// Every client that should see `path`, spawning as needed.
    ///
    /// Results keep registration order.
    async fn clients_for_file(&self, path: &Path) -> Vec<Arc<ProtocolClient>> {
        if !self.inner.config.enabled {
            return Vec::new();
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return Vec::new();
        };

        let candidates: Vec<Arc<dyn ServerDefinition>> = self
            .inner
            .registry
            .servers_for_extension(ext)
            .into_iter()
            .filter(|definition| {
                let enabled = self.is_server_enabled(&definition.spec().id);
                if !enabled {
                    tracing::debug!(server = %definition.spec().id, "Skipping disabled server");
                }
                enabled
            })
            .collect();

        let roots = join_all(
            candidates
                .iter()
                .map(|definition| self.resolve_root(definition.spec(), path)),
        )
        .await;

        let mut wanted = Vec::new();
        for (definition, root) in candidates.into_iter().zip(roots) {
            let Some(root) = root else {
                tracing::debug!(server = %definition.spec().id, path = %path.display(), "No project root for server");
                continue;
            };
            let key = ClientKey::new(definition.spec().id.clone(), root);
            wanted.push((definition, key));
        }

        join_all(
            wanted
                .into_iter()
                .map(|(definition, key)| self.client_for(definition, key)),
        )
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    /// The live client for `key`, joining or starting its spawn.
    async fn client_for(
        &self,
        definition: Arc<dyn ServerDefinition>,
        key: ClientKey,
    ) -> Option<Arc<ProtocolClient>> {
        let pending = {
            let mut state = self.inner.state();
            if let Some(client) = state.clients.get(&key) {
                return Some(client.clone());
            }
            if let Some(pending) = state.spawning.get(&key) {
                pending.clone()
            } else if state.broken.contains(&key) {
                return None;
            } else {
                // Registered before the lock is released, so concurrent
                // callers always find it.
                let epoch = state.epoch;
                let task = tokio::spawn(spawn_client(
                    self.inner.clone(),
                    definition,
                    key.clone(),
                    epoch,
                ));
                let pending = async move { task.await.ok().flatten() }.boxed().shared();
                state.spawning.insert(key.clone(), pending.clone());
                pending
            }
        };
        pending.await
    }

    /// Open `path` in every applicable server, spawning servers as needed.
    ///
    /// With `wait_for_diagnostics`, returns once each server has published
    /// diagnostics for the file or the diagnostics timeout passed.
    pub async fn touch_file(&self, path: &Path, wait_for_diagnostics: bool) {
        let path = self.absolute(path);
        let clients = self.clients_for_file(&path).await;
        if clients.is_empty() {
            tracing::debug!(path = %path.display(), "No language server for file");
            return;
        }

        join_all(clients.iter().map(|client| async {
            let synced = if client.document_version(&path).await.is_some() {
                match tokio::fs::read_to_string(&path).await {
                    Ok(text) => client.change_document(&path, &text).await.map(|_| ()),
                    Err(source) => Err(LspError::ReadFile {
                        path: path.clone(),
                        source,
                    }),
                }
            } else {
                client.open_document(&path).await
            };
            if let Err(e) = synced {
                tracing::warn!(server = %client.key(), path = %path.display(), "Failed to open document: {e}");
            }
        }))
        .await;

        if wait_for_diagnostics {
            let timeout = self.inner.config.diagnostics_timeout();
            join_all(
                clients
                    .iter()
                    .map(|client| client.wait_for_diagnostics(&path, timeout)),
            )
            .await;
        }
    }

    /// Send new contents of `path` to every applicable server. Without
    /// `content` the file is read from disk.
    pub async fn file_changed(&self, path: &Path, content: Option<String>) {
        let path = self.absolute(path);
        let content = match content {
            Some(content) => content,
            None => match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Cannot read changed file: {e}");
                    return;
                }
            },
        };

        let clients = self.clients_for_file(&path).await;
        join_all(clients.iter().map(|client| async {
            if let Err(e) = client.change_document(&path, &content).await {
                tracing::warn!(server = %client.key(), path = %path.display(), "Failed to send change: {e}");
            }
        }))
        .await;
    }

    pub async fn file_saved(&self, path: &Path) {
        let path = self.absolute(path);
        let clients = self.clients_for_file(&path).await;
        join_all(clients.iter().map(|client| async {
            if let Err(e) = client.save_document(&path).await {
                tracing::warn!(server = %client.key(), path = %path.display(), "Failed to send save: {e}");
            }
        }))
        .await;
    }

    /// Close `path` in every live client. Never spawns.
    pub async fn file_closed(&self, path: &Path) {
        let path = self.absolute(path);
        let clients = self.live_clients();
        join_all(clients.iter().map(|client| async {
            if let Err(e) = client.close_document(&path).await {
                tracing::debug!(server = %client.key(), path = %path.display(), "Failed to send close: {e}");
            }
        }))
        .await;
    }

    /// First hover result in registration order.
    pub async fn hover(&self, path: &Path, line: u32, character: u32) -> Option<Hover> {
        let path = self.absolute(path);
        let position = Position::new(line, character);
        let clients = self.clients_for_file(&path).await;
        let results = join_all(clients.iter().map(|client| client.hover(&path, position))).await;
        first_match(&clients, results, "hover")
    }

    /// First non-empty definition result in registration order.
    pub async fn definition(&self, path: &Path, line: u32, character: u32) -> Option<Vec<Location>> {
        let path = self.absolute(path);
        let position = Position::new(line, character);
        let clients = self.clients_for_file(&path).await;
        let results = join_all(
            clients
                .iter()
                .map(|client| client.definition(&path, position)),
        )
        .await;
        first_match(&clients, results, "definition")
    }

    /// Completion items from every applicable server.
    pub async fn completion(&self, path: &Path, line: u32, character: u32) -> Vec<CompletionItem> {
        let path = self.absolute(path);
        let position = Position::new(line, character);
        let clients = self.clients_for_file(&path).await;
        let results = join_all(
            clients
                .iter()
                .map(|client| client.completion(&path, position)),
        )
        .await;
        concat(&clients, results, "completion")
    }

    /// References from every applicable server.
    pub async fn references(&self, path: &Path, line: u32, character: u32) -> Vec<Location> {
        let path = self.absolute(path);
        let position = Position::new(line, character);
        let clients = self.clients_for_file(&path).await;
        let results = join_all(
            clients
                .iter()
                .map(|client| client.references(&path, position)),
        )
        .await;
        concat(&clients, results, "references")
    }

    fn live_clients(&self) -> Vec<Arc<ProtocolClient>> {
        let state = self.inner.state();
        let mut clients: Vec<_> = state.clients.values().cloned().collect();
        clients.sort_by(|a, b| a.key().cmp(b.key()));
        clients
    }

    /// Diagnostics from every live client, merged per file.
    #[must_use]
    pub fn all_diagnostics(&self) -> DiagnosticsSnapshot {
        let mut merged: HashMap<PathBuf, Vec<Diagnostic>> = HashMap::new();
        for client in self.live_clients() {
            let server = client.server_id();
            for (path, items) in client.diagnostics() {
                merged
                    .entry(path)
                    .or_default()
                    .extend(items.into_iter().map(|d| d.tagged_with(server)));
            }
        }
        diagnostics::snapshot(merged)
    }

    #[must_use]
    pub fn diagnostics_for_file(&self, path: &Path) -> Vec<Diagnostic> {
        let path = self.absolute(path);
        self.live_clients()
            .iter()
            .flat_map(|client| {
                let server = client.server_id();
                client
                    .diagnostics_for(&path)
                    .into_iter()
                    .map(move |d| d.tagged_with(server))
            })
            .collect()
    }

    /// One entry per registered server, in registration order.
    #[must_use]
    pub fn status(&self) -> Vec<ServerStatus> {
        let mut running: HashMap<String, Vec<PathBuf>> = HashMap::new();
        for key in self.inner.state().clients.keys() {
            running
                .entry(key.server_id.clone())
                .or_default()
                .push(key.root.clone());
        }

        self.inner
            .registry
            .definitions()
            .iter()
            .map(|definition| {
                let spec = definition.spec();
                let mut roots = running.remove(&spec.id).unwrap_or_default();
                roots.sort();
                ServerStatus {
                    id: spec.id.clone(),
                    name: spec.name.clone(),
                    extensions: spec.extensions.clone(),
                    enabled: self.is_server_enabled(&spec.id),
                    installed: definition.check_installed(&self.inner.installer),
                    installable: definition.installable(),
                    running: roots,
                }
            })
            .collect()
    }

    #[must_use]
    pub fn cache_info(&self) -> CacheInfo {
        self.inner.installer.cache_info()
    }

    /// Delete every installed server. Running clients keep running.
    pub async fn clear_cache(&self) -> Result<(), InstallError> {
        self.inner.installer.clear().await
    }

    /// Install a server now instead of on first use.
    pub async fn install_server(&self, id: &str) -> Result<PathBuf, InstallError> {
        let definition = self
            .inner
            .registry
            .get(id)
            .cloned()
            .ok_or_else(|| InstallError::UnknownServer(id.to_string()))?;
        self.inner.prepare_cache().await;
        let path = definition.install(&self.inner.installer).await?;
        // A previous failure may have been a missing binary.
        self.inner.state().broken.retain(|key| key.server_id != id);
        Ok(path)
    }

    /// Shut down every client and forget all session state.
    pub async fn shutdown(&self) {
        let clients: Vec<Arc<ProtocolClient>> = {
            let mut state = self.inner.state();
            state.epoch += 1;
            state.spawning.clear();
            state.broken.clear();
            state.clients.drain().map(|(_, client)| client).collect()
        };
        if !clients.is_empty() {
            tracing::info!(count = clients.len(), "Shutting down LSP servers");
        }
        join_all(clients.iter().map(|client| client.shutdown())).await;
    }
}

/// Spawn and initialize a client, then record the outcome.
async fn spawn_client(
    inner: Arc<Inner>,
    definition: Arc<dyn ServerDefinition>,
    key: ClientKey,
    epoch: u64,
) -> Option<Arc<ProtocolClient>> {
    let client = start_client(&inner, definition.as_ref(), &key).await;

    // Decide under the lock; shut down outside it.
    let (kept, discarded) = {
        let mut state = inner.state();
        if state.epoch == epoch {
            state.spawning.remove(&key);
            match client {
                None => {
                    state.broken.insert(key.clone());
                    (None, None)
                }
                Some(client) if state.disabled.contains(&key.server_id) => (None, Some(client)),
                Some(client) if client.state().is_terminal() => {
                    state.broken.insert(key.clone());
                    (None, None)
                }
                Some(client) => {
                    state.clients.insert(key.clone(), client.clone());
                    (Some(client), None)
                }
            }
        } else {
            (None, client)
        }
    };

    if let Some(client) = discarded {
        client.shutdown().await;
    }
    if kept.is_some() {
        tracing::info!(server = %key, "LSP server started");
        inner.emit(LspEvent::ServerStarted { key });
    }
    kept
}

async fn start_client(
    inner: &Inner,
    definition: &dyn ServerDefinition,
    key: &ClientKey,
) -> Option<Arc<ProtocolClient>> {
    inner.prepare_cache().await;
    let ctx = SpawnContext {
        root: &key.root,
        installer: &inner.installer,
        auto_install: inner.config.auto_install,
    };
    let process = match definition.spawn(ctx).await {
        Ok(Some(process)) => process,
        Ok(None) => {
            tracing::debug!(server = %key, "Language server unavailable");
            return None;
        }
        Err(e) => {
            tracing::warn!(server = %key, "Failed to start language server: {e:#}");
            return None;
        }
    };

    let client = Arc::new(ProtocolClient::start(
        key.clone(),
        process,
        inner.client_options.clone(),
        inner.client_events.clone(),
    ));
    if let Err(e) = client.initialize().await {
        tracing::warn!(server = %key, "Language server failed to initialize: {e}");
        client.shutdown().await;
        return None;
    }
    Some(client)
}

/// Forward client events to the host, dropping closed clients on the way.
async fn pump_client_events(mut rx: mpsc::Receiver<ClientEvent>, inner: Weak<Inner>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            ClientEvent::Diagnostics {
                key,
                path,
                diagnostics,
            } => {
                tracing::debug!(server = %key, path = %path.display(), count = diagnostics.len(), "Diagnostics updated");
                let diagnostics = diagnostics
                    .into_iter()
                    .map(|d| d.tagged_with(&key.server_id))
                    .collect();
                inner.emit(LspEvent::Diagnostics {
                    server: key.server_id,
                    path,
                    diagnostics,
                });
            }
            ClientEvent::Closed {
                key,
                instance,
                state,
            } => {
                {
                    let mut guard = inner.state();
                    if guard
                        .clients
                        .get(&key)
                        .is_some_and(|client| client.instance() == instance)
                    {
                        guard.clients.remove(&key);
                    }
                }
                inner.emit(LspEvent::ServerClosed { key, state });
            }
        }
    }
}

fn first_match<T>(
    clients: &[Arc<ProtocolClient>],
    results: Vec<Result<Option<T>, LspError>>,
    method: &str,
) -> Option<T> {
    clients
        .iter()
        .zip(results)
        .find_map(|(client, result)| match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(server = %client.key(), "{method} failed: {e}");
                None
            }
        })
}

fn concat<T>(
    clients: &[Arc<ProtocolClient>],
    results: Vec<Result<Vec<T>, LspError>>,
    method: &str,
) -> Vec<T> {
    clients
        .iter()
        .zip(results)
        .flat_map(|(client, result)| match result {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(server = %client.key(), "{method} failed: {e}");
                Vec::new()
            }
        })
        .collect()
}
