//! LSP message types and parameter builders for JSON-RPC communication.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::LspError;
use crate::types::{
    CompletionItem, Diagnostic, DiagnosticSeverity, Hover, Location, Position, Range,
    RelatedInformation,
};

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: u64, method: &'static str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: &'static str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Reply to a request the server sent us.
#[derive(Debug, Serialize)]
pub(crate) struct Response {
    pub jsonrpc: &'static str,
    pub id: Value,
    pub result: Value,
}

impl Response {
    pub fn new(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result,
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ResponseError {
    pub code: i64,
    pub message: String,
}

/// Classified incoming message.
#[derive(Debug)]
pub(crate) enum Incoming {
    Response {
        id: u64,
        result: Result<Value, ResponseError>,
    },
    ServerRequest {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

pub(crate) fn parse_incoming(frame: &Value) -> Option<Incoming> {
    let id = frame.get("id");
    let method = frame
        .get("method")
        .and_then(Value::as_str)
        .map(String::from);

    match (id, method) {
        (Some(id), None) => {
            let id = id.as_u64()?;
            let result = match frame.get("error") {
                Some(error) => Err(serde_json::from_value(error.clone()).unwrap_or_else(|_| {
                    ResponseError {
                        code: 0,
                        message: error.to_string(),
                    }
                })),
                None => Ok(frame.get("result")?.clone()),
            };
            Some(Incoming::Response { id, result })
        }
        (Some(id), Some(method)) => Some(Incoming::ServerRequest {
            id: id.clone(),
            method,
            params: frame.get("params").cloned(),
        }),
        (None, Some(method)) => Some(Incoming::Notification {
            method,
            params: frame.get("params").cloned(),
        }),
        (None, None) => None,
    }
}

pub(crate) fn initialize_params(root_uri: &str, root_name: &str, options: &Value) -> Value {
    json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "workspaceFolders": [{ "uri": root_uri, "name": root_name }],
        "initializationOptions": options,
        "capabilities": {
            "window": { "workDoneProgress": true },
            "workspace": {
                "configuration": true,
                "workspaceFolders": true,
                "didChangeConfiguration": { "dynamicRegistration": false }
            },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": true
                },
                "publishDiagnostics": {
                    "relatedInformation": true,
                    "versionSupport": false,
                    "tagSupport": { "valueSet": [1, 2] }
                },
                "hover": {
                    "dynamicRegistration": false,
                    "contentFormat": ["markdown", "plaintext"]
                },
                "completion": {
                    "dynamicRegistration": false,
                    "completionItem": {
                        "snippetSupport": false,
                        "documentationFormat": ["markdown", "plaintext"]
                    },
                    "contextSupport": false
                },
                "definition": { "dynamicRegistration": false, "linkSupport": true },
                "references": { "dynamicRegistration": false }
            }
        }
    })
}

pub(crate) fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

pub(crate) fn did_save_params(uri: &str, text: Option<&str>) -> Value {
    let mut params = json!({ "textDocument": { "uri": uri } });
    if let Some(text) = text {
        params["text"] = Value::String(text.to_string());
    }
    params
}

pub(crate) fn did_close_params(uri: &str) -> Value {
    json!({ "textDocument": { "uri": uri } })
}

pub(crate) fn text_document_position_params(uri: &str, position: Position) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "position": { "line": position.line, "character": position.character }
    })
}

pub(crate) fn reference_params(uri: &str, position: Position) -> Value {
    let mut params = text_document_position_params(uri, position);
    params["context"] = json!({ "includeDeclaration": true });
    params
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<LspDiagnostic>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LspDiagnostic {
    pub range: Range,
    pub severity: Option<u64>,
    pub code: Option<Value>,
    pub source: Option<String>,
    pub message: String,
    #[serde(default)]
    pub related_information: Vec<LspRelatedInformation>,
    #[serde(default)]
    pub tags: Vec<u8>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspRelatedInformation {
    pub location: Location,
    pub message: String,
}

impl LspDiagnostic {
    pub fn into_diagnostic(self) -> Diagnostic {
        let severity = self
            .severity
            .and_then(DiagnosticSeverity::from_lsp)
            .unwrap_or(DiagnosticSeverity::Error);
        let mut diagnostic = Diagnostic::new(severity, self.message, self.range)
            .with_related(
                self.related_information
                    .into_iter()
                    .map(|r| RelatedInformation {
                        location: r.location,
                        message: r.message,
                    })
                    .collect(),
            )
            .with_tags(self.tags);
        match self.code {
            Some(Value::String(code)) => diagnostic = diagnostic.with_code(code),
            Some(Value::Number(code)) => diagnostic = diagnostic.with_code(code.to_string()),
            _ => {}
        }
        if let Some(source) = self.source {
            diagnostic = diagnostic.with_source(source);
        }
        diagnostic
    }
}

/// Flatten a `textDocument/hover` result into text.
///
/// Accepts `MarkupContent`, a `MarkedString`, or an array of `MarkedString`.
pub(crate) fn parse_hover(result: &Value) -> Option<Hover> {
    let contents = result.get("contents")?;
    let text = match contents {
        Value::Array(parts) => parts
            .iter()
            .filter_map(marked_string_text)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n"),
        other => marked_string_text(other)?,
    };
    if text.trim().is_empty() {
        return None;
    }
    let range = result
        .get("range")
        .and_then(|r| serde_json::from_value(r.clone()).ok());
    Some(Hover {
        contents: text,
        range,
    })
}

fn marked_string_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => {
            let text = obj.get("value")?.as_str()?;
            match obj.get("language").and_then(Value::as_str) {
                Some(language) => Some(format!("```{language}\n{text}\n```")),
                None => Some(text.to_string()),
            }
        }
        _ => None,
    }
}

/// Normalize a `textDocument/completion` result (`CompletionItem[]` or
/// `CompletionList`) into a list.
pub(crate) fn parse_completion(result: &Value) -> Vec<CompletionItem> {
    let items = match result {
        Value::Array(items) => items.as_slice(),
        Value::Object(list) => match list.get("items").and_then(Value::as_array) {
            Some(items) => items.as_slice(),
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    items
        .iter()
        .filter_map(|item| {
            let label = item.get("label")?.as_str()?.to_string();
            let text = |key: &str| item.get(key).and_then(Value::as_str).map(String::from);
            Some(CompletionItem {
                label,
                kind: item.get("kind").and_then(Value::as_u64).map(|k| k as u32),
                detail: text("detail"),
                documentation: item.get("documentation").and_then(marked_string_text),
                insert_text: text("insertText"),
            })
        })
        .collect()
}

/// Normalize a definition or references result (`Location`, `Location[]`,
/// `LocationLink[]`, or null) into a list.
pub(crate) fn parse_locations(result: &Value) -> Vec<Location> {
    match result {
        Value::Array(items) => items.iter().filter_map(parse_location).collect(),
        Value::Object(_) => parse_location(result).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn parse_location(value: &Value) -> Option<Location> {
    if let Some(target) = value.get("targetUri") {
        let range = value
            .get("targetSelectionRange")
            .or_else(|| value.get("targetRange"))?;
        return Some(Location {
            uri: target.as_str()?.to_string(),
            range: serde_json::from_value(range.clone()).ok()?,
        });
    }
    serde_json::from_value(value.clone()).ok()
}

/// LSP language identifier for a file, by extension.
#[must_use]
pub fn language_id_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "ts" | "mts" | "cts" => "typescript",
        "tsx" => "typescriptreact",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "javascriptreact",
        "vue" => "vue",
        "svelte" => "svelte",
        "astro" => "astro",
        "css" => "css",
        "scss" => "scss",
        "less" => "less",
        "html" | "htm" => "html",
        "json" => "json",
        "jsonc" => "jsonc",
        "py" | "pyi" => "python",
        "go" => "go",
        "rs" => "rust",
        "c" | "h" => "c",
        "cpp" | "cc" | "cxx" | "hpp" | "hh" | "hxx" => "cpp",
        "lua" => "lua",
        "zig" | "zon" => "zig",
        "sh" | "bash" | "zsh" => "shellscript",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "md" | "markdown" => "markdown",
        "java" => "java",
        "rb" => "ruby",
        "ex" | "exs" => "elixir",
        _ => "plaintext",
    }
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, LspError> {
    url::Url::from_file_path(path).map_err(|()| LspError::InvalidPath(path.to_path_buf()))
}

pub(crate) fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
        .map(|path| normalize_path(&path))
}

/// Resolve `.` and `..` lexically, without touching the filesystem.
///
/// Document and diagnostics maps are keyed by the result, so every path
/// entering them goes through here.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let last = out.components().next_back();
                let at_name = matches!(last, Some(Component::Normal(_)));
                // `..` above the root is the root.
                let at_root = matches!(last, Some(Component::RootDir | Component::Prefix(_)));
                if at_name {
                    out.pop();
                } else if !at_root {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_normalize_path_is_lexical() {
        assert_eq!(
            normalize_path(Path::new("/p/src/../src/./app.ts")),
            PathBuf::from("/p/src/app.ts")
        );
        assert_eq!(normalize_path(Path::new("/../a")), PathBuf::from("/a"));
        assert_eq!(normalize_path(Path::new("../a/../b")), PathBuf::from("../b"));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_uri_to_path_normalizes() {
        assert_eq!(
            file_uri_to_path("file:///p/src/../lib/x.rs"),
            Some(PathBuf::from("/p/lib/x.rs"))
        );
    }

    #[test]
    fn test_initialize_params_has_required_fields() {
        let params = initialize_params("file:///workspace", "workspace", &json!({"a": 1}));
        assert!(params["processId"].is_number());
        assert_eq!(params["rootUri"], "file:///workspace");
        assert_eq!(params["workspaceFolders"][0]["name"], "workspace");
        assert_eq!(params["initializationOptions"]["a"], 1);
        let text_document = &params["capabilities"]["textDocument"];
        assert_eq!(text_document["synchronization"]["didSave"], true);
        assert_eq!(text_document["publishDiagnostics"]["relatedInformation"], true);
        assert_eq!(
            text_document["completion"]["completionItem"]["snippetSupport"],
            false
        );
        assert_eq!(params["capabilities"]["workspace"]["configuration"], true);
    }

    #[test]
    fn test_document_params() {
        let open = did_open_params("file:///test.ts", "typescript", 1, "let x = 1;");
        assert_eq!(open["textDocument"]["languageId"], "typescript");
        assert_eq!(open["textDocument"]["version"], 1);

        let change = did_change_params("file:///test.ts", 2, "let x = 2;");
        assert_eq!(change["textDocument"]["version"], 2);
        assert_eq!(change["contentChanges"][0]["text"], "let x = 2;");

        let save = did_save_params("file:///test.ts", Some("let x = 2;"));
        assert_eq!(save["text"], "let x = 2;");
        assert!(did_save_params("file:///test.ts", None).get("text").is_none());

        let refs = reference_params("file:///test.ts", Position::new(3, 4));
        assert_eq!(refs["position"]["line"], 3);
        assert_eq!(refs["context"]["includeDeclaration"], true);
    }

    #[test]
    fn test_parse_incoming_classification() {
        let response = json!({"jsonrpc": "2.0", "id": 4, "result": null});
        assert!(matches!(
            parse_incoming(&response),
            Some(Incoming::Response { id: 4, result: Ok(Value::Null) })
        ));

        let error = json!({"jsonrpc": "2.0", "id": 5, "error": {"code": -32601, "message": "nope"}});
        match parse_incoming(&error) {
            Some(Incoming::Response { id: 5, result: Err(e) }) => {
                assert_eq!(e.code, -32601);
                assert_eq!(e.message, "nope");
            }
            other => panic!("expected error response, got {other:?}"),
        }

        let request = json!({"jsonrpc": "2.0", "id": "abc", "method": "workspace/configuration"});
        assert!(matches!(
            parse_incoming(&request),
            Some(Incoming::ServerRequest { method, .. }) if method == "workspace/configuration"
        ));

        let notification = json!({"jsonrpc": "2.0", "method": "window/logMessage"});
        assert!(matches!(
            parse_incoming(&notification),
            Some(Incoming::Notification { .. })
        ));

        assert!(parse_incoming(&json!({"jsonrpc": "2.0"})).is_none());
    }

    #[test]
    fn test_lsp_diagnostic_conversion() {
        let json = json!({
            "range": { "start": { "line": 10, "character": 5 }, "end": { "line": 10, "character": 9 } },
            "severity": 2,
            "code": 2304,
            "source": "ts",
            "message": "Cannot find name 'foo'.",
            "tags": [1],
            "relatedInformation": [{
                "location": {
                    "uri": "file:///a.ts",
                    "range": { "start": { "line": 1, "character": 0 }, "end": { "line": 1, "character": 3 } }
                },
                "message": "declared here"
            }]
        });
        let diag = serde_json::from_value::<LspDiagnostic>(json)
            .unwrap()
            .into_diagnostic();
        assert_eq!(diag.severity(), DiagnosticSeverity::Warning);
        assert_eq!(diag.range().start, Position::new(10, 5));
        assert_eq!(diag.code(), Some("2304"));
        assert_eq!(diag.source(), Some("ts"));
        assert_eq!(diag.tags(), &[1]);
        assert_eq!(diag.related()[0].message, "declared here");
    }

    #[test]
    fn test_publish_diagnostics_minimal() {
        // Severity, code and source are optional per LSP spec
        let json = json!({
            "uri": "file:///test.py",
            "diagnostics": [{
                "range": { "start": { "line": 5, "character": 3 }, "end": { "line": 5, "character": 10 } },
                "message": "some problem"
            }]
        });
        let params: PublishDiagnosticsParams = serde_json::from_value(json).unwrap();
        let diag = params.diagnostics.into_iter().next().unwrap().into_diagnostic();
        assert_eq!(diag.severity(), DiagnosticSeverity::Error);
        assert_eq!(diag.source(), None);
        assert!(diag.related().is_empty());
    }

    #[test]
    fn test_parse_hover_variants() {
        let markup = json!({"contents": {"kind": "markdown", "value": "**fn** main"}});
        assert_eq!(parse_hover(&markup).unwrap().contents, "**fn** main");

        let marked = json!({
            "contents": [{"language": "python", "value": "def f()"}, "docs"],
            "range": { "start": { "line": 1, "character": 0 }, "end": { "line": 1, "character": 1 } }
        });
        let hover = parse_hover(&marked).unwrap();
        assert_eq!(hover.contents, "```python\ndef f()\n```\n\ndocs");
        assert_eq!(hover.range.unwrap().start.line, 1);

        assert!(parse_hover(&json!({"contents": ""})).is_none());
        assert!(parse_hover(&json!({"contents": []})).is_none());
        assert!(parse_hover(&Value::Null).is_none());
    }

    #[test]
    fn test_parse_completion_list_and_array() {
        let list = json!({
            "isIncomplete": false,
            "items": [
                { "label": "push", "kind": 2, "detail": "fn push(&mut self)" },
                { "label": "pop", "documentation": { "kind": "markdown", "value": "Removes" } },
                { "kind": 2 }
            ]
        });
        let items = parse_completion(&list);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].kind, Some(2));
        assert_eq!(items[1].documentation.as_deref(), Some("Removes"));

        let array = json!([{ "label": "len", "insertText": "len()" }]);
        assert_eq!(parse_completion(&array)[0].insert_text.as_deref(), Some("len()"));
        assert!(parse_completion(&Value::Null).is_empty());
    }

    #[test]
    fn test_parse_locations_variants() {
        let range = json!({ "start": { "line": 2, "character": 4 }, "end": { "line": 2, "character": 8 } });
        let single = json!({ "uri": "file:///a.go", "range": range });
        assert_eq!(parse_locations(&single).len(), 1);

        let links = json!([{
            "targetUri": "file:///b.go",
            "targetRange": { "start": { "line": 0, "character": 0 }, "end": { "line": 9, "character": 0 } },
            "targetSelectionRange": range
        }]);
        let parsed = parse_locations(&links);
        assert_eq!(parsed[0].uri, "file:///b.go");
        assert_eq!(parsed[0].range.start, Position::new(2, 4));

        assert!(parse_locations(&Value::Null).is_empty());
        assert!(parse_locations(&json!([])).is_empty());
    }

    #[test]
    fn test_language_id_for_path() {
        assert_eq!(language_id_for_path(Path::new("a/b.tsx")), "typescriptreact");
        assert_eq!(language_id_for_path(Path::new("main.RS")), "rust");
        assert_eq!(language_id_for_path(Path::new("Makefile")), "plaintext");
    }

    #[test]
    fn test_path_to_file_uri_and_back() {
        #[cfg(windows)]
        let path = PathBuf::from(r"C:\Users\test\src\main.rs");
        #[cfg(not(windows))]
        let path = PathBuf::from("/home/test/src/main.rs");

        let uri = path_to_file_uri(&path).expect("should create URI");
        let roundtrip = file_uri_to_path(uri.as_str()).expect("should parse back to path");
        assert_eq!(roundtrip, path);
    }

    #[test]
    fn test_file_uri_to_path_rejects_non_file() {
        assert!(file_uri_to_path("not-a-uri").is_none());
        assert!(file_uri_to_path("https://example.com/test.rs").is_none());
    }

    #[test]
    fn test_request_serialization_without_params() {
        let req = Request::new(1, "shutdown", None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 1);
        assert!(
            json.get("params").is_none(),
            "params must be omitted, not null"
        );
    }

    #[test]
    fn test_response_serialization_keeps_null_result() {
        let resp = Response::new(json!(7), Value::Null);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["id"], 7);
        assert!(json.get("result").is_some());
    }
}
