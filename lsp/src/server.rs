//! Server handle: owns the `onr-lsp` child process and its JSON-RPC channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::locator::ResolvedCommand;
use crate::protocol::{self, Notification, PublishDiagnosticsParams, Request};
use crate::types::{CONFIG_SECTION, LspEvent, ServerInfo, ServerStopReason};

const WRITER_CHANNEL_CAPACITY: usize = 64;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

enum WriterCommand {
    Send(Value),
    Shutdown,
}

enum IncomingFrame {
    Response {
        id: u64,
        body: Value,
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

fn parse_incoming(frame: &Value) -> Option<IncomingFrame> {
    let id = frame.get("id");
    let method = frame
        .get("method")
        .and_then(Value::as_str)
        .map(String::from);
    let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, has_result_or_error) {
        (Some(id_val), None, true) => Some(IncomingFrame::Response {
            id: id_val.as_u64()?,
            body: frame.clone(),
        }),
        (Some(id_val), Some(method), _) => Some(IncomingFrame::ServerRequest {
            id: id_val.clone(),
            method,
            params: frame.get("params").cloned(),
        }),
        (None, Some(method), _) => Some(IncomingFrame::Notification {
            method,
            params: frame.get("params").cloned(),
        }),
        _ => None,
    }
}

/// Inputs for starting a server besides the command itself.
#[derive(Debug, Clone)]
pub(crate) struct ServerOptions {
    pub workspace_root: PathBuf,
    /// Contents of the `onrLsp` section sent on start and on request.
    pub settings: Value,
    pub inherit_stderr: bool,
}

pub(crate) struct RunningServer {
    /// `None` when connected to an in-process transport.
    child: Option<Child>,
    writer_tx: mpsc::Sender<WriterCommand>,
    next_id: u64,
    pending: PendingMap,
    settings: watch::Sender<Value>,
    /// Flips to `true` once the reader task has stopped.
    reader_closed: watch::Receiver<bool>,
    /// Open document URI → last sent version.
    open_docs: HashMap<String, i32>,
    server_info: Option<ServerInfo>,
    #[allow(dead_code)]
    reader_handle: JoinHandle<()>,
    #[allow(dead_code)]
    writer_handle: JoinHandle<()>,
}

impl RunningServer {
    /// Spawn `command` and complete the `initialize` handshake.
    ///
    /// No timeout: a server that never answers keeps the caller waiting.
    /// The child is killed if the returned handle (or the in-flight future)
    /// is dropped.
    pub async fn start(
        command: &ResolvedCommand,
        options: &ServerOptions,
        event_tx: mpsc::Sender<LspEvent>,
    ) -> Result<Self> {
        let program = if command.source().needs_search() {
            which::which(command.program())
                .with_context(|| format!("{command} not found in PATH"))?
        } else {
            command.program().to_path_buf()
        };

        let mut cmd = Command::new(&program);
        cmd.args(command.args())
            .current_dir(&options.workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if options.inherit_stderr {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", program.display()))?;
        tracing::info!(
            program = %program.display(),
            pid = child.id(),
            "Spawned language server"
        );

        let stdout = child.stdout.take().context("no stdout from child")?;
        let stdin = child.stdin.take().context("no stdin from child")?;

        Self::connect(stdout, stdin, Some(child), options, event_tx).await
    }

    /// Wire reader/writer tasks onto an existing transport and initialize.
    pub(crate) async fn connect<R, W>(
        reader: R,
        writer: W,
        child: Option<Child>,
        options: &ServerOptions,
        event_tx: mpsc::Sender<LspEvent>,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (settings, settings_rx) = watch::channel(options.settings.clone());

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!("LSP write error: {e}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
        });

        let (closed_tx, reader_closed) = watch::channel(false);
        let reader_pending = pending.clone();
        let reader_writer_tx = writer_tx.clone();
        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(reader);
            let reason = loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => {
                        Self::dispatch_frame(
                            &frame,
                            &reader_pending,
                            &event_tx,
                            &reader_writer_tx,
                            &settings_rx,
                        )
                        .await;
                    }
                    Ok(None) => break ServerStopReason::Exited,
                    Err(e) => break ServerStopReason::Failed(e.to_string()),
                }
            };

            // Requests registered after this point see the flag instead.
            closed_tx.send_replace(true);
            // Dropping the senders fails every request still awaiting a reply.
            reader_pending.lock().await.clear();

            match &reason {
                ServerStopReason::Exited => tracing::info!("Language server closed stdout"),
                ServerStopReason::Failed(e) => tracing::warn!("Language server reader error: {e}"),
            }
            let _ = event_tx.send(LspEvent::ServerStopped { reason }).await;
        });

        let mut handle = Self {
            child,
            writer_tx,
            next_id: 1,
            pending,
            settings,
            reader_closed,
            open_docs: HashMap::new(),
            server_info: None,
            reader_handle,
            writer_handle,
        };

        handle
            .initialize(&options.workspace_root, &options.settings)
            .await?;

        Ok(handle)
    }

    async fn dispatch_frame(
        frame: &Value,
        pending: &Mutex<HashMap<u64, oneshot::Sender<Value>>>,
        event_tx: &mpsc::Sender<LspEvent>,
        writer_tx: &mpsc::Sender<WriterCommand>,
        settings: &watch::Receiver<Value>,
    ) {
        let Some(incoming) = parse_incoming(frame) else {
            tracing::trace!("Ignoring malformed JSON-RPC frame");
            return;
        };

        match incoming {
            IncomingFrame::Response { id, body } => {
                let sender = pending.lock().await.remove(&id);
                if let Some(tx) = sender {
                    let _ = tx.send(body);
                }
            }
            IncomingFrame::ServerRequest { id, method, params } => {
                let reply = if method == "workspace/configuration" {
                    let result = protocol::configuration_result(
                        params.as_ref(),
                        CONFIG_SECTION,
                        &settings.borrow(),
                    );
                    protocol::result_response(&id, result)
                } else {
                    tracing::debug!("Server sent request {method}, replying method not found");
                    protocol::method_not_found(&id, &method)
                };
                let _ = writer_tx.send(WriterCommand::Send(reply)).await;
            }
            IncomingFrame::Notification { method, params } => {
                Self::handle_notification(&method, params, event_tx).await;
            }
        }
    }

    async fn handle_notification(
        method: &str,
        params: Option<Value>,
        event_tx: &mpsc::Sender<LspEvent>,
    ) {
        match method {
            "textDocument/publishDiagnostics" => {
                let Some(params) = params else { return };
                match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(diag_params) => {
                        let Some(path) = protocol::file_uri_to_path(&diag_params.uri) else {
                            tracing::debug!("Diagnostics for non-file URI {}", diag_params.uri);
                            return;
                        };
                        let items = diag_params
                            .diagnostics
                            .iter()
                            .map(protocol::LspDiagnostic::to_diagnostic)
                            .collect();
                        // Never block the reader: it must stay free to route
                        // the shutdown reply.
                        if let Err(mpsc::error::TrySendError::Full(_)) =
                            event_tx.try_send(LspEvent::Diagnostics { path, items })
                        {
                            tracing::warn!("Event queue full; dropping diagnostics update");
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Failed to parse publishDiagnostics: {e}");
                    }
                }
            }
            _ => {
                tracing::trace!("Ignoring notification: {method}");
            }
        }
    }

    async fn initialize(&mut self, workspace_root: &Path, settings: &Value) -> Result<()> {
        let root_uri = protocol::path_to_file_uri(workspace_root)
            .context("converting workspace root to URI")?;

        let params = protocol::initialize_params(root_uri.as_str(), settings);
        let response = self.send_request("initialize", Some(params)).await?;

        if let Some(error) = response.get("error") {
            bail!(
                "LSP initialize failed: {}",
                error["message"].as_str().unwrap_or("unknown error")
            );
        }
        self.server_info = protocol::server_info(&response);

        self.send_notification("initialized", Some(serde_json::json!({})))
            .await?;
        self.push_configuration(settings).await
    }

    async fn send_request(&mut self, method: &'static str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = Request::new(id, method, params);
        let frame = serde_json::to_value(&request).context("serializing request")?;
        if self
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            self.pending.lock().await.remove(&id);
            bail!("writer channel closed");
        }

        let mut reader_closed = self.reader_closed.clone();
        let closed = async move {
            let _ = reader_closed.wait_for(|closed| *closed).await;
        };
        tokio::select! {
            biased;
            reply = rx => {
                return reply.map_err(|_| anyhow!("server exited before answering {method}"));
            }
            () = closed => {}
        }

        self.pending.lock().await.remove(&id);
        bail!("server exited before answering {method}")
    }

    async fn send_notification(&self, method: &'static str, params: Option<Value>) -> Result<()> {
        let notification = Notification::new(method, params);
        let frame = serde_json::to_value(&notification).context("serializing notification")?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| anyhow!("writer channel closed"))?;
        Ok(())
    }

    async fn push_configuration(&self, settings: &Value) -> Result<()> {
        let params = protocol::did_change_configuration_params(CONFIG_SECTION, settings);
        self.send_notification("workspace/didChangeConfiguration", Some(params))
            .await
    }

    #[must_use]
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    #[must_use]
    pub fn is_open(&self, uri: &str) -> bool {
        self.open_docs.contains_key(uri)
    }

    /// Replace the settings and forward them to the server.
    pub async fn sync_configuration(&mut self, settings: Value) -> Result<()> {
        self.settings.send_replace(settings.clone());
        self.push_configuration(&settings).await
    }

    /// `didOpen` for a new document, `didChange` (full text, next version)
    /// for one already open.
    pub async fn sync_document(&mut self, uri: &str, language_id: &str, text: &str) -> Result<()> {
        if let Some(version) = self.open_docs.get_mut(uri) {
            *version += 1;
            let params = protocol::did_change_params(uri, *version, text);
            self.send_notification("textDocument/didChange", Some(params))
                .await
        } else {
            let version = 1;
            self.open_docs.insert(uri.to_string(), version);
            let params = protocol::did_open_params(uri, language_id, version, text);
            self.send_notification("textDocument/didOpen", Some(params))
                .await
        }
    }

    /// `didClose` for an open document; unknown URIs are ignored.
    pub async fn close_document(&mut self, uri: &str) -> Result<()> {
        if self.open_docs.remove(uri).is_none() {
            return Ok(());
        }
        self.send_notification("textDocument/didClose", Some(protocol::did_close_params(uri)))
            .await
    }

    /// `shutdown` → `exit` → wait for the process. Consumes self.
    ///
    /// A single attempt: any failure is returned and the handle is dropped,
    /// which kills a still-running child.
    pub async fn shutdown(mut self) -> Result<()> {
        let response = self.send_request("shutdown", None).await?;
        if let Some(error) = response.get("error") {
            bail!(
                "LSP shutdown failed: {}",
                error["message"].as_str().unwrap_or("unknown error")
            );
        }
        self.send_notification("exit", None).await?;
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;

        if let Some(child) = self.child.as_mut() {
            let status = child.wait().await.context("waiting for server exit")?;
            tracing::info!(%status, "Language server exited");
        }
        Ok(())
    }
}
