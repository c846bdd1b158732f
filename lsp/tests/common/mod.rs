//! In-process fake language server for integration tests.
//!
//! The fake speaks real Content-Length framing over a `tokio::io::duplex`
//! pipe, answers the requests the client sends, publishes one diagnostic per
//! open/change, and records every message it receives.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use polyglot_lsp::codec::{FrameDecoder, encode_frame};
use polyglot_lsp::registry::{InstallFut, SpawnFut};
use polyglot_lsp::{Installer, InstallError, ServerDefinition, ServerProcess, ServerSpec, SpawnContext};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// How a fake server behaves.
#[derive(Debug, Clone)]
pub struct FakeBehavior {
    /// Prefix for hover text, completion labels and diagnostic messages.
    pub name: &'static str,
    pub hover: bool,
    pub definition: bool,
    pub publish_diagnostics: bool,
    /// Requests that are never answered.
    pub silent: Vec<&'static str>,
    /// Requests that make the server hang up instead of answering.
    pub hang_up_on: Vec<&'static str>,
}

impl FakeBehavior {
    pub fn named(name: &'static str) -> Self {
        Self {
            name,
            hover: true,
            definition: true,
            publish_diagnostics: true,
            silent: Vec::new(),
            hang_up_on: Vec::new(),
        }
    }
}

/// Messages the fake received, in order.
#[derive(Clone, Default)]
pub struct Transcript(Arc<Mutex<Vec<Value>>>);

impl Transcript {
    fn push(&self, message: Value) {
        self.0.lock().unwrap().push(message);
    }

    pub fn messages(&self) -> Vec<Value> {
        self.0.lock().unwrap().clone()
    }

    /// Params of every message with `method`.
    pub fn params_of(&self, method: &str) -> Vec<Value> {
        self.messages()
            .into_iter()
            .filter(|m| m["method"] == method)
            .map(|m| m["params"].clone())
            .collect()
    }
}

/// Start a fake server and return the client side of the connection.
pub fn fake_process(behavior: FakeBehavior) -> (ServerProcess, Transcript) {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_end);
    let transcript = Transcript::default();
    tokio::spawn(serve(server_end, behavior, transcript.clone()));
    (
        ServerProcess::from_streams(client_read, client_write),
        transcript,
    )
}

async fn serve(stream: tokio::io::DuplexStream, behavior: FakeBehavior, transcript: Transcript) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        for message in decoder.feed(&buf[..n]) {
            transcript.push(message.clone());
            let method = message["method"].as_str().unwrap_or_default().to_string();
            if method == "exit" || behavior.hang_up_on.contains(&method.as_str()) {
                return;
            }
            for reply in replies(&behavior, &method, &message) {
                let frame = encode_frame(&reply).unwrap();
                if writer.write_all(&frame).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn replies(behavior: &FakeBehavior, method: &str, message: &Value) -> Vec<Value> {
    let params = &message["params"];
    let Some(id) = message.get("id").cloned() else {
        return notification_replies(behavior, method, params);
    };
    if behavior.silent.contains(&method) {
        return Vec::new();
    }

    let uri = params["textDocument"]["uri"].clone();
    let range = json!({
        "start": { "line": 0, "character": 0 },
        "end": { "line": 0, "character": 3 }
    });
    let result = match method {
        "initialize" => json!({
            "capabilities": {
                "textDocumentSync": 1,
                "hoverProvider": true,
                "completionProvider": {},
                "definitionProvider": true,
                "referencesProvider": true
            },
            "serverInfo": { "name": behavior.name }
        }),
        "textDocument/hover" if behavior.hover => json!({
            "contents": { "kind": "markdown", "value": format!("{} hover", behavior.name) }
        }),
        "textDocument/completion" => json!({
            "isIncomplete": false,
            "items": [{ "label": format!("{}_item", behavior.name) }]
        }),
        "textDocument/definition" if behavior.definition => {
            json!([{ "uri": uri, "range": range }])
        }
        "textDocument/references" => json!([{ "uri": uri, "range": range }]),
        _ => Value::Null,
    };
    vec![json!({ "jsonrpc": "2.0", "id": id, "result": result })]
}

fn notification_replies(behavior: &FakeBehavior, method: &str, params: &Value) -> Vec<Value> {
    if !behavior.publish_diagnostics {
        return Vec::new();
    }
    let version = match method {
        "textDocument/didOpen" => params["textDocument"]["version"].clone(),
        "textDocument/didChange" => params["textDocument"]["version"].clone(),
        _ => return Vec::new(),
    };
    vec![json!({
        "jsonrpc": "2.0",
        "method": "textDocument/publishDiagnostics",
        "params": {
            "uri": params["textDocument"]["uri"],
            "diagnostics": [{
                "range": {
                    "start": { "line": 0, "character": 0 },
                    "end": { "line": 0, "character": 1 }
                },
                "severity": 1,
                "message": format!("{} v{}", behavior.name, version)
            }]
        }
    })]
}

/// A server definition backed by the fake, counting spawn attempts.
pub struct FakeDefinition {
    spec: ServerSpec,
    behavior: FakeBehavior,
    available: bool,
    spawns: AtomicUsize,
    transcripts: Mutex<Vec<(PathBuf, Transcript)>>,
}

impl FakeDefinition {
    pub fn new(spec: ServerSpec, behavior: FakeBehavior) -> Self {
        Self {
            spec,
            behavior,
            available: true,
            spawns: AtomicUsize::new(0),
            transcripts: Mutex::new(Vec::new()),
        }
    }

    /// A definition whose binary can never be found.
    pub fn unavailable(spec: ServerSpec) -> Self {
        Self {
            available: false,
            ..Self::new(spec, FakeBehavior::named("missing"))
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Roots this definition was spawned for.
    pub fn spawned_roots(&self) -> Vec<PathBuf> {
        self.transcripts
            .lock()
            .unwrap()
            .iter()
            .map(|(root, _)| root.clone())
            .collect()
    }

    pub fn transcript(&self, index: usize) -> Transcript {
        self.transcripts.lock().unwrap()[index].1.clone()
    }
}

impl ServerDefinition for FakeDefinition {
    fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    fn installable(&self) -> bool {
        false
    }

    fn check_installed(&self, _installer: &Installer) -> bool {
        self.available
    }

    fn install<'a>(&'a self, _installer: &'a Installer) -> InstallFut<'a> {
        Box::pin(async { Err(InstallError::ToolMissing("fake".to_string())) })
    }

    fn spawn<'a>(&'a self, ctx: SpawnContext<'a>) -> SpawnFut<'a> {
        Box::pin(async move {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            // Widen the window in which concurrent callers overlap.
            tokio::time::sleep(Duration::from_millis(20)).await;
            if !self.available {
                return Ok(None);
            }
            let (process, transcript) = fake_process(self.behavior.clone());
            self.transcripts
                .lock()
                .unwrap()
                .push((ctx.root.to_path_buf(), transcript));
            Ok(Some(process))
        })
    }
}
