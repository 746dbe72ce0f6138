//! `onr-shim`: command-line host for the ONR language client.
//!
//! Plays the editor's part in the client lifecycle:
//!
//! ```text
//! load config -> activate -> didOpen FILES -> collect diagnostics -> deactivate
//! ```
//!
//! With `--resolve-only` it prints the command that activation would spawn
//! and exits without starting anything.

use std::env;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use tokio::signal;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use onr_config::{SERVER_PATH_ENV, ShimConfig};
use onr_lsp_client::{
    ActivationContext, ClientConfig, ClientState, Document, DocumentScope, LANGUAGE_ID,
    LanguageClient, PlatformIdentity, protocol, resolve,
};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const EVENT_BUDGET: usize = 64;

/// Run the onr-lsp language server over ONR DSL files and report diagnostics
#[derive(Parser, Debug)]
#[command(name = "onr-shim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (default: ~/.onr/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Installation root holding bin/<os>-<arch>/ (default: parent of the executable's directory)
    #[arg(long)]
    install_root: Option<PathBuf>,

    /// Workspace folder the server runs in (default: current directory)
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Server path hint; overrides the config file and ONR_LSP_SERVER_PATH
    #[arg(long)]
    server_path: Option<String>,

    /// Which documents the client attaches to
    #[arg(long, value_enum)]
    documents: Option<ScopeArg>,

    /// How long diagnostics must stay quiet before reporting
    #[arg(long, default_value = "1000", value_name = "MS")]
    settle_ms: u64,

    /// Print the resolved server command and exit
    #[arg(long)]
    resolve_only: bool,

    /// ONR DSL files to open
    files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ScopeArg {
    Providers,
    All,
}

impl From<ScopeArg> for DocumentScope {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::Providers => DocumentScope::Providers,
            ScopeArg::All => DocumentScope::All,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    Settled,
    Interrupted,
    ServerStopped,
}

fn init_tracing(config_filter: Option<&str>) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config_filter.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries the diagnostics report.
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_ansi(io::stderr().is_terminal())
                .with_writer(io::stderr),
        )
        .with(env_filter)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<Option<ShimConfig>> {
    match path {
        Some(path) => {
            if !path.exists() {
                bail!("config file {} does not exist", path.display());
            }
            Ok(ShimConfig::load_from(path)?)
        }
        None => Ok(ShimConfig::load()?),
    }
}

/// Precedence: flag, then `ONR_LSP_SERVER_PATH`, then the file, then defaults.
fn client_config(
    config: Option<&ShimConfig>,
    server_path_env: Option<String>,
    args: &Args,
) -> ClientConfig {
    let defaults = ShimConfig::default();
    let mut client = config
        .unwrap_or(&defaults)
        .client_config_with(server_path_env);
    if let Some(server_path) = &args.server_path {
        client.server_path.clone_from(server_path);
    }
    if let Some(scope) = args.documents {
        client.documents = scope.into();
    }
    client
}

/// `<root>/bin/onr-shim` installs under `<root>`.
fn default_install_root(exe: &Path) -> Option<PathBuf> {
    exe.parent()?.parent().map(Path::to_path_buf)
}

fn install_root(args: &Args) -> Result<PathBuf> {
    if let Some(root) = &args.install_root {
        return Ok(root.clone());
    }
    let exe = env::current_exe().context("locating the onr-shim executable")?;
    match default_install_root(&exe) {
        Some(root) => Ok(root),
        None => env::current_dir().context("reading the current directory"),
    }
}

fn workspace_root(args: &Args) -> Result<PathBuf> {
    let root = match &args.workspace {
        Some(root) => root.clone(),
        None => env::current_dir().context("reading the current directory")?,
    };
    fs::canonicalize(&root).with_context(|| format!("workspace {}", root.display()))
}

/// Open every file the selector accepts. Returns how many were forwarded.
async fn open_documents(client: &mut LanguageClient, files: &[PathBuf]) -> Result<usize> {
    let mut opened = 0;
    for file in files {
        let path =
            fs::canonicalize(file).with_context(|| format!("resolving {}", file.display()))?;
        let text =
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let uri = protocol::path_to_file_uri(&path)?;

        let doc = Document {
            uri: uri.as_str(),
            language_id: LANGUAGE_ID,
        };
        if client.sync_document(doc, &text).await? {
            opened += 1;
        } else {
            tracing::info!(path = %path.display(), "Not matched by the document selector; skipped");
        }
    }
    Ok(opened)
}

/// Drain events until nothing has arrived for `settle`, the server goes
/// away, or the user interrupts.
async fn wait_for_diagnostics(client: &mut LanguageClient, settle: Duration) -> WaitOutcome {
    let mut ticks = time::interval(POLL_INTERVAL);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_event = Instant::now();

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => return WaitOutcome::Interrupted,
            _ = ticks.tick() => {
                if client.poll_events(EVENT_BUDGET) > 0 {
                    last_event = Instant::now();
                }
                if client.state() != ClientState::Running {
                    return WaitOutcome::ServerStopped;
                }
                if last_event.elapsed() >= settle {
                    return WaitOutcome::Settled;
                }
            }
        }
    }
}

fn print_report(client: &LanguageClient) -> usize {
    let snapshot = client.snapshot();
    for (path, items) in snapshot.files() {
        for diag in items {
            println!("{}", diag.display_with_path(path));
        }
    }
    if !snapshot.is_empty() {
        eprintln!("{}", snapshot.status_string());
    }
    snapshot.error_count()
}

async fn run(args: Args, config: Option<ShimConfig>) -> Result<ExitCode> {
    let client_config = client_config(config.as_ref(), env::var(SERVER_PATH_ENV).ok(), &args);
    let install_root = install_root(&args)?;

    if args.resolve_only {
        let command = resolve(
            &client_config.server_path,
            &install_root,
            &PlatformIdentity::current(),
        );
        println!("{command}\t{}", command.source().as_str());
        return Ok(ExitCode::SUCCESS);
    }

    let context = ActivationContext::new(install_root, workspace_root(&args)?);
    let mut client = LanguageClient::new();
    client
        .activate(&client_config, &context)
        .await
        .context("activating the language client")?;

    if let Some(info) = client.server_info() {
        tracing::info!(
            name = %info.name,
            version = info.version.as_deref().unwrap_or("unknown"),
            "Connected"
        );
    }

    let opened = match open_documents(&mut client, &args.files).await {
        Ok(opened) => opened,
        Err(e) => {
            if let Err(stop) = client.deactivate().await {
                tracing::warn!("Deactivate after failed open: {stop:#}");
            }
            return Err(e);
        }
    };

    let outcome = if opened > 0 {
        wait_for_diagnostics(&mut client, Duration::from_millis(args.settle_ms)).await
    } else {
        WaitOutcome::Settled
    };
    match outcome {
        WaitOutcome::Settled => {}
        WaitOutcome::Interrupted => tracing::info!("Interrupted"),
        WaitOutcome::ServerStopped => tracing::warn!("Language server stopped before diagnostics settled"),
    }

    let errors = print_report(&client);
    client.deactivate().await.context("deactivating the language client")?;

    if outcome == WaitOutcome::ServerStopped || errors > 0 {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let loaded = load_config(args.config.as_deref());
    let filter = loaded
        .as_ref()
        .ok()
        .and_then(Option::as_ref)
        .and_then(ShimConfig::log_filter);
    init_tracing(filter);

    let config = loaded?;
    run(args, config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_flags_and_files() {
        let args = parse(&[
            "onr-shim",
            "--server-path",
            "./tools/onr-lsp",
            "--documents",
            "all",
            "--resolve-only",
            "a.conf",
            "providers/b.conf",
        ]);
        assert_eq!(args.server_path.as_deref(), Some("./tools/onr-lsp"));
        assert_eq!(args.documents, Some(ScopeArg::All));
        assert!(args.resolve_only);
        assert_eq!(args.files.len(), 2);
        assert_eq!(args.settle_ms, 1000);
    }

    #[test]
    fn unknown_scope_is_rejected() {
        assert!(Args::try_parse_from(["onr-shim", "--documents", "some"]).is_err());
    }

    #[test]
    fn flags_override_config_file() {
        let file = ShimConfig::parse(
            "[onrLsp]\nserverPath = \"onr-lsp-from-file\"\ndocuments = \"all\"\n",
        )
        .unwrap();
        let args = parse(&["onr-shim", "--server-path", "/opt/onr-lsp", "--documents", "providers"]);

        let client = client_config(Some(&file), Some("/opt/env/onr-lsp".to_string()), &args);
        assert_eq!(client.server_path, "/opt/onr-lsp");
        assert_eq!(client.documents, DocumentScope::Providers);
    }

    #[test]
    fn defaults_without_config_file() {
        let client = client_config(None, None, &parse(&["onr-shim"]));
        assert_eq!(client.documents, DocumentScope::Providers);
        assert!(!client.log_server_stderr);
    }

    #[test]
    fn env_server_path_applies_without_config_file() {
        let args = parse(&["onr-shim"]);
        let client = client_config(None, Some("/opt/from-env/onr-lsp".to_string()), &args);
        assert_eq!(client.server_path, "/opt/from-env/onr-lsp");
    }

    #[test]
    fn env_server_path_beats_file_but_not_flag() {
        let file = ShimConfig::parse("[onrLsp]\nserverPath = \"onr-lsp-from-file\"\n").unwrap();

        let from_env = client_config(
            Some(&file),
            Some("/opt/from-env/onr-lsp".to_string()),
            &parse(&["onr-shim"]),
        );
        assert_eq!(from_env.server_path, "/opt/from-env/onr-lsp");

        let from_flag = client_config(
            Some(&file),
            Some("/opt/from-env/onr-lsp".to_string()),
            &parse(&["onr-shim", "--server-path", "/opt/flag/onr-lsp"]),
        );
        assert_eq!(from_flag.server_path, "/opt/flag/onr-lsp");
    }

    #[cfg(not(windows))]
    #[test]
    fn install_root_is_two_levels_above_executable() {
        assert_eq!(
            default_install_root(Path::new("/opt/onr/bin/onr-shim")),
            Some(PathBuf::from("/opt/onr"))
        );
        assert_eq!(default_install_root(Path::new("onr-shim")), None);
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn explicit_config_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[log]\nfilter = \"debug\"\n").unwrap();

        let config = load_config(Some(&path)).unwrap().unwrap();
        assert_eq!(config.log_filter(), Some("debug"));
    }
}
