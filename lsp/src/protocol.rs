//! Internal LSP message serde types for JSON-RPC communication.

use std::path::{Path, PathBuf};
use std::process;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::types::{Diagnostic, DiagnosticSeverity, ServerInfo};

/// JSON-RPC "method not found".
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

const CLIENT_NAME: &str = "onr-shim";

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

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

/// Successful reply to a server-initiated request.
pub(crate) fn result_response(id: &Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

/// Error reply for server-initiated requests we don't handle.
pub(crate) fn method_not_found(id: &Value, method: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": METHOD_NOT_FOUND,
            "message": format!("Method not found: {method}")
        }
    })
}

pub(crate) fn initialize_params(root_uri: &str, initialization_options: &Value) -> Value {
    json!({
        "processId": process::id(),
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION")
        },
        "rootUri": root_uri,
        "initializationOptions": initialization_options,
        "capabilities": {
            "workspace": {
                "configuration": true,
                "didChangeConfiguration": {
                    "dynamicRegistration": false
                }
            },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "publishDiagnostics": {
                    "relatedInformation": false
                }
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    })
}

/// `serverInfo` from an `initialize` response body, if the server sent one.
pub(crate) fn server_info(response: &Value) -> Option<ServerInfo> {
    let info = response.get("result")?.get("serverInfo")?.clone();
    serde_json::from_value(info).ok()
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

pub(crate) fn did_close_params(uri: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri
        }
    })
}

/// `workspace/didChangeConfiguration` carrying `{ section: settings }`.
pub(crate) fn did_change_configuration_params(section: &str, settings: &Value) -> Value {
    let mut wrapped = serde_json::Map::new();
    wrapped.insert(section.to_string(), settings.clone());
    json!({ "settings": wrapped })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigurationParams {
    #[serde(default)]
    items: Vec<ConfigurationItem>,
}

#[derive(Debug, Deserialize)]
struct ConfigurationItem {
    #[serde(default)]
    section: Option<String>,
}

/// Answer a `workspace/configuration` request.
///
/// One result per requested item: the whole settings object for `section`
/// (or no section), the nested value for `section.key.path`, otherwise
/// `null`.
pub(crate) fn configuration_result(params: Option<&Value>, section: &str, settings: &Value) -> Value {
    let params: ConfigurationParams = params
        .and_then(|p| serde_json::from_value(p.clone()).ok())
        .unwrap_or_default();

    let items = params
        .items
        .iter()
        .map(|item| match item.section.as_deref() {
            None => settings.clone(),
            Some(requested) if requested == section => settings.clone(),
            Some(requested) => requested
                .strip_prefix(section)
                .and_then(|rest| rest.strip_prefix('.'))
                .and_then(|path| lookup_dotted(settings, path))
                .cloned()
                .unwrap_or(Value::Null),
        })
        .collect();
    Value::Array(items)
}

fn lookup_dotted<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, key| v.get(key))
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<LspDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspDiagnostic {
    pub range: LspRange,
    pub severity: Option<u64>,
    pub source: Option<String>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspRange {
    pub start: LspPosition,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspPosition {
    pub line: u32,
    pub character: u32,
}

impl LspDiagnostic {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::new(
            self.severity
                .and_then(DiagnosticSeverity::from_lsp)
                .unwrap_or(DiagnosticSeverity::Warning),
            self.message.clone(),
            self.range.start.line,
            self.range.start.character,
            self.source.clone().unwrap_or_else(|| String::from("onr-lsp")),
        )
    }
}

pub fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

pub(crate) fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .filter(|u| u.scheme() == "file")
        .and_then(|u| u.to_file_path().ok())
}
