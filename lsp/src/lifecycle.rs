//! Client lifecycle controller: the host's `activate` / `deactivate` hooks.
//!
//! `LanguageClient` owns at most one running server. The exclusive `&mut`
//! borrow on both hooks is what serializes them; there is no internal lock.
//! Dropping the controller drops the handle, and the child process is
//! killed with it.

use std::future::Future;
use std::mem;
use std::path::PathBuf;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::diagnostics::DiagnosticsStore;
use crate::locator::{self, ResolvedCommand};
use crate::platform::PlatformIdentity;
use crate::selector::{Document, DocumentSelector, SelectorError};
use crate::server::{RunningServer, ServerOptions};
use crate::types::{
    ClientConfig, ClientState, DiagnosticsSnapshot, LspEvent, ServerInfo, ServerStopReason,
};

/// Channel capacity between the server reader task and the controller.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("cannot activate while the client is {0}")]
    NotIdle(ClientState),
    #[error(transparent)]
    Selector(#[from] SelectorError),
}

/// What the host supplies at activation time.
#[derive(Debug, Clone)]
pub struct ActivationContext {
    /// Where the shim is installed; bundled binaries live under `bin/`.
    pub installation_root: PathBuf,
    /// Root the server is initialized with.
    pub workspace_root: PathBuf,
    pub platform: PlatformIdentity,
}

impl ActivationContext {
    #[must_use]
    pub fn new(installation_root: PathBuf, workspace_root: PathBuf) -> Self {
        Self {
            installation_root,
            workspace_root,
            platform: PlatformIdentity::current(),
        }
    }

    #[must_use]
    pub fn with_platform(mut self, platform: PlatformIdentity) -> Self {
        self.platform = platform;
        self
    }
}

/// Everything that lives exactly as long as one running server.
struct ClientHandle {
    server: RunningServer,
    command: ResolvedCommand,
    selector: DocumentSelector,
    events: mpsc::Receiver<LspEvent>,
}

enum Phase {
    Idle,
    Starting,
    Running(ClientHandle),
    Stopping,
}

/// Lifecycle controller for the `onr-lsp` client.
pub struct LanguageClient {
    phase: Phase,
    diagnostics: DiagnosticsStore,
}

impl Default for LanguageClient {
    fn default() -> Self {
        Self::new()
    }
}

impl LanguageClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            diagnostics: DiagnosticsStore::default(),
        }
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        match self.phase {
            Phase::Idle => ClientState::Idle,
            Phase::Starting => ClientState::Starting,
            Phase::Running(_) => ClientState::Running,
            Phase::Stopping => ClientState::Stopping,
        }
    }

    fn handle(&self) -> Option<&ClientHandle> {
        match &self.phase {
            Phase::Running(handle) => Some(handle),
            _ => None,
        }
    }

    fn handle_mut(&mut self) -> Option<&mut ClientHandle> {
        match &mut self.phase {
            Phase::Running(handle) => Some(handle),
            _ => None,
        }
    }

    /// Command the running server was spawned from.
    #[must_use]
    pub fn command(&self) -> Option<&ResolvedCommand> {
        self.handle().map(|h| &h.command)
    }

    #[must_use]
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.handle().and_then(|h| h.server.server_info())
    }

    #[must_use]
    pub fn selector(&self) -> Option<&DocumentSelector> {
        self.handle().map(|h| &h.selector)
    }

    /// Resolve the server, spawn it, and complete the handshake.
    ///
    /// Spawn and handshake failures are returned as-is and leave the
    /// controller `Idle`. Nothing is retried.
    pub async fn activate(&mut self, config: &ClientConfig, context: &ActivationContext) -> Result<()> {
        self.activate_with(config, context, |command, options, event_tx| async move {
            RunningServer::start(&command, &options, event_tx).await
        })
        .await
    }

    async fn activate_with<F, Fut>(
        &mut self,
        config: &ClientConfig,
        context: &ActivationContext,
        launch: F,
    ) -> Result<()>
    where
        F: FnOnce(ResolvedCommand, ServerOptions, mpsc::Sender<LspEvent>) -> Fut,
        Fut: Future<Output = Result<RunningServer>>,
    {
        if !matches!(self.phase, Phase::Idle) {
            return Err(LifecycleError::NotIdle(self.state()).into());
        }

        let selector = DocumentSelector::for_scope(config.documents).map_err(LifecycleError::from)?;
        let command = locator::resolve(
            &config.server_path,
            &context.installation_root,
            &context.platform,
        );
        let options = ServerOptions {
            workspace_root: context.workspace_root.clone(),
            settings: config.settings.clone(),
            inherit_stderr: config.log_server_stderr,
        };
        let (event_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tracing::info!(
            command = %command,
            documents = config.documents.as_str(),
            "Starting language client"
        );
        self.phase = Phase::Starting;

        match launch(command.clone(), options, event_tx).await {
            Ok(server) => {
                if let Some(info) = server.server_info() {
                    tracing::info!(
                        server = %info.name,
                        version = info.version.as_deref().unwrap_or("unknown"),
                        "Language client running"
                    );
                }
                self.phase = Phase::Running(ClientHandle {
                    server,
                    command,
                    selector,
                    events,
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Language client failed to start: {e:#}");
                self.phase = Phase::Idle;
                Err(e)
            }
        }
    }

    /// Stop the server and release the handle.
    ///
    /// A no-op when nothing is running. A stop failure is returned, but the
    /// controller still ends `Idle` and the dropped handle kills the child.
    pub async fn deactivate(&mut self) -> Result<()> {
        let handle = match mem::replace(&mut self.phase, Phase::Stopping) {
            Phase::Running(handle) => handle,
            Phase::Idle => {
                self.phase = Phase::Idle;
                return Ok(());
            }
            // An activate or deactivate future was dropped mid-flight; its
            // half-built handle went with it.
            Phase::Starting | Phase::Stopping => {
                tracing::debug!("Deactivating after an abandoned lifecycle call");
                self.phase = Phase::Idle;
                return Ok(());
            }
        };

        tracing::info!(command = %handle.command, "Stopping language client");
        let result = handle.server.shutdown().await;
        self.phase = Phase::Idle;
        self.diagnostics.clear();

        match &result {
            Ok(()) => tracing::info!("Language client stopped"),
            Err(e) => tracing::warn!("Language client stop failed: {e:#}"),
        }
        result
    }

    /// Send the document's full text if the selector accepts it.
    ///
    /// Returns whether the document was forwarded.
    pub async fn sync_document(&mut self, doc: Document<'_>, text: &str) -> Result<bool> {
        let Some(handle) = self.handle_mut() else {
            return Ok(false);
        };
        if !handle.selector.matches(&doc) {
            return Ok(false);
        }
        handle
            .server
            .sync_document(doc.uri, doc.language_id, text)
            .await?;
        Ok(true)
    }

    #[must_use]
    pub fn is_document_open(&self, uri: &str) -> bool {
        self.handle().is_some_and(|h| h.server.is_open(uri))
    }

    pub async fn close_document(&mut self, uri: &str) -> Result<()> {
        match self.handle_mut() {
            Some(handle) => handle.server.close_document(uri).await,
            None => Ok(()),
        }
    }

    /// Forward changed `onrLsp` settings to the running server.
    pub async fn sync_configuration(&mut self, settings: Value) -> Result<()> {
        match self.handle_mut() {
            Some(handle) => handle.server.sync_configuration(settings).await,
            None => Ok(()),
        }
    }

    /// Drain up to `budget` pending events. Non-blocking.
    ///
    /// A server that stops on its own takes the controller back to `Idle`.
    pub fn poll_events(&mut self, budget: usize) -> usize {
        let mut count = 0;
        while count < budget {
            let Some(handle) = self.handle_mut() else { break };
            let Ok(event) = handle.events.try_recv() else { break };
            count += 1;

            match event {
                LspEvent::Diagnostics { path, items } => {
                    tracing::debug!(
                        path = %path.display(),
                        count = items.len(),
                        "Diagnostics updated"
                    );
                    self.diagnostics.update(path, items);
                }
                LspEvent::ServerStopped { reason } => {
                    match &reason {
                        ServerStopReason::Exited => tracing::warn!("Language server exited unexpectedly"),
                        ServerStopReason::Failed(msg) => {
                            tracing::warn!(error = %msg, "Language server failed");
                        }
                    }
                    self.phase = Phase::Idle;
                }
            }
        }
        count
    }

    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future;
    use std::time::Duration;

    use crate::locator::CommandSource;
    use crate::platform::{ArchTag, OsTag};
    use crate::selector::LANGUAGE_ID;
    use crate::server::tests::{FakeMode, FakeServer};

    fn context() -> ActivationContext {
        ActivationContext::new(PathBuf::from("/ext"), std::env::temp_dir())
            .with_platform(PlatformIdentity::new(OsTag::Linux, ArchTag::from_rust("riscv64")))
    }

    async fn activate_fake(
        client: &mut LanguageClient,
        config: &ClientConfig,
        mode: FakeMode,
    ) -> (Result<()>, FakeServer) {
        let (fake, read, write) = FakeServer::spawn(mode);
        let result = client
            .activate_with(config, &context(), |_command, options, event_tx| async move {
                RunningServer::connect(read, write, None, &options, event_tx).await
            })
            .await;
        (result, fake)
    }

    #[tokio::test]
    async fn deactivate_without_activate_is_a_noop() {
        let mut client = LanguageClient::new();
        client.deactivate().await.unwrap();
        assert_eq!(client.state(), ClientState::Idle);
    }

    #[tokio::test]
    async fn activate_then_deactivate_cycles_back_to_idle() {
        let mut client = LanguageClient::new();
        let (result, mut fake) =
            activate_fake(&mut client, &ClientConfig::default(), FakeMode::Normal).await;
        result.unwrap();

        assert_eq!(client.state(), ClientState::Running);
        assert_eq!(client.server_info().unwrap().name, "onr-lsp");
        // unsupported platform + empty hint
        let command = client.command().unwrap();
        assert_eq!(command.source(), CommandSource::Fallback);

        client.deactivate().await.unwrap();
        assert_eq!(client.state(), ClientState::Idle);
        assert!(client.command().is_none());
        fake.expect_method("exit").await;

        // A second deactivate is a no-op.
        client.deactivate().await.unwrap();
    }

    #[tokio::test]
    async fn client_can_be_reactivated_after_stop() {
        let mut client = LanguageClient::new();
        let (first, _fake) =
            activate_fake(&mut client, &ClientConfig::default(), FakeMode::Normal).await;
        first.unwrap();
        client.deactivate().await.unwrap();

        let (second, _fake) =
            activate_fake(&mut client, &ClientConfig::default(), FakeMode::Normal).await;
        second.unwrap();
        assert_eq!(client.state(), ClientState::Running);
    }

    #[tokio::test]
    async fn second_activate_is_rejected() {
        let mut client = LanguageClient::new();
        let (result, _fake) =
            activate_fake(&mut client, &ClientConfig::default(), FakeMode::Normal).await;
        result.unwrap();

        let (again, _fake2) =
            activate_fake(&mut client, &ClientConfig::default(), FakeMode::Normal).await;
        let err = again.unwrap_err();
        assert!(err.to_string().contains("running"));
        assert_eq!(client.state(), ClientState::Running);
    }

    #[tokio::test]
    async fn handshake_failure_propagates_and_leaves_idle() {
        let mut client = LanguageClient::new();
        let (result, _fake) =
            activate_fake(&mut client, &ClientConfig::default(), FakeMode::RejectInitialize).await;
        assert!(result.unwrap_err().to_string().contains("bad workspace"));
        assert_eq!(client.state(), ClientState::Idle);
    }

    #[tokio::test]
    async fn stop_failure_propagates_and_leaves_idle() {
        let mut client = LanguageClient::new();
        let (result, _fake) =
            activate_fake(&mut client, &ClientConfig::default(), FakeMode::RejectShutdown).await;
        result.unwrap();

        let err = client.deactivate().await.unwrap_err();
        assert!(err.to_string().contains("busy"));
        assert_eq!(client.state(), ClientState::Idle);
    }

    #[tokio::test]
    async fn spawn_failure_propagates() {
        let mut client = LanguageClient::new();
        let config = ClientConfig {
            server_path: "definitely-not-an-onr-lsp-binary".to_string(),
            ..ClientConfig::default()
        };
        let err = client.activate(&config, &context()).await.unwrap_err();
        assert!(err.to_string().contains("not found in PATH"));
        assert_eq!(client.state(), ClientState::Idle);
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn only_selected_documents_are_forwarded() {
        let mut client = LanguageClient::new();
        let (result, mut fake) =
            activate_fake(&mut client, &ClientConfig::default(), FakeMode::Normal).await;
        result.unwrap();

        let selected = Document {
            uri: "file:///work/providers/openai.conf",
            language_id: LANGUAGE_ID,
        };
        let elsewhere = Document {
            uri: "file:///work/models/openai.conf",
            language_id: LANGUAGE_ID,
        };
        assert!(client.sync_document(selected, "provider {}").await.unwrap());
        assert!(!client.sync_document(elsewhere, "provider {}").await.unwrap());

        assert!(client.is_document_open(selected.uri));
        assert!(!client.is_document_open(elsewhere.uri));

        let open = fake.expect_method("textDocument/didOpen").await;
        assert_eq!(open["params"]["textDocument"]["uri"], selected.uri);
    }

    #[tokio::test]
    async fn document_sync_while_idle_is_skipped() {
        let mut client = LanguageClient::new();
        let doc = Document {
            uri: "file:///work/providers/openai.conf",
            language_id: LANGUAGE_ID,
        };
        assert!(!client.sync_document(doc, "x").await.unwrap());
        client.close_document(doc.uri).await.unwrap();
        client.sync_configuration(serde_json::json!({})).await.unwrap();
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn diagnostics_are_collected_and_cleared_on_stop() {
        let mut client = LanguageClient::new();
        let (result, fake) =
            activate_fake(&mut client, &ClientConfig::default(), FakeMode::Normal).await;
        result.unwrap();

        fake.push
            .send(serde_json::json!({
                "jsonrpc": "2.0",
                "method": "textDocument/publishDiagnostics",
                "params": {
                    "uri": "file:///work/providers/openai.conf",
                    "diagnostics": [{
                        "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 3 } },
                        "severity": 1,
                        "message": "missing upstream"
                    }]
                }
            }))
            .unwrap();

        for _ in 0..100 {
            if client.poll_events(8) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(client.snapshot().error_count(), 1);

        client.deactivate().await.unwrap();
        assert!(client.snapshot().is_empty());
    }

    #[tokio::test]
    async fn unexpected_server_exit_returns_to_idle() {
        let mut client = LanguageClient::new();
        let (result, fake) =
            activate_fake(&mut client, &ClientConfig::default(), FakeMode::Normal).await;
        result.unwrap();

        fake.hang_up();

        for _ in 0..100 {
            client.poll_events(8);
            if client.state() == ClientState::Idle {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(client.state(), ClientState::Idle);
        client.deactivate().await.unwrap();
    }

    #[tokio::test]
    async fn deactivate_after_server_died_returns_error_without_polling() {
        let mut client = LanguageClient::new();
        let (result, fake) =
            activate_fake(&mut client, &ClientConfig::default(), FakeMode::Normal).await;
        result.unwrap();

        fake.hang_up();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = tokio::time::timeout(Duration::from_secs(3), client.deactivate())
            .await
            .expect("deactivate must complete once the server is gone");
        assert!(outcome.is_err());
        assert_eq!(client.state(), ClientState::Idle);
    }

    #[tokio::test]
    async fn abandoned_activation_is_reset_by_deactivate() {
        let mut client = LanguageClient::new();
        let config = ClientConfig::default();
        let context = context();

        let stalled = client.activate_with(&config, &context, |_command, _options, _events| {
            future::pending::<Result<RunningServer>>()
        });
        assert!(
            tokio::time::timeout(Duration::from_millis(50), stalled)
                .await
                .is_err()
        );
        assert_eq!(client.state(), ClientState::Starting);

        let err = client
            .activate(&config, &context)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("starting"));

        client.deactivate().await.unwrap();
        assert_eq!(client.state(), ClientState::Idle);
    }
}
