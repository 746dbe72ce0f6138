//! Server locator: turns the `serverPath` hint into a spawnable command.
//!
//! Resolution never fails. Every dead end (empty hint, unsupported platform,
//! missing bundled binary) degrades to the bare [`SERVER_NAME`] and leaves
//! reporting to the spawn step.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Component, Path, PathBuf, is_separator};

use crate::platform::PlatformIdentity;

/// Conventional command name of the language server.
pub const SERVER_NAME: &str = "onr-lsp";

/// Directory under the installation root holding per-platform binaries.
const BUNDLE_DIR: &str = "bin";

/// How a [`ResolvedCommand`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    /// Configured absolute path, used as-is.
    Absolute,
    /// Configured relative path, joined onto the installation root.
    RelativeToRoot,
    /// Configured bare command name, looked up on `PATH` at spawn time.
    SearchPath,
    /// Binary shipped under `<root>/bin/<os>-<arch>/`.
    Bundled,
    /// Nothing configured or bundled; bare [`SERVER_NAME`].
    Fallback,
}

impl CommandSource {
    /// Whether the program must be looked up on `PATH` before spawning.
    #[must_use]
    pub fn needs_search(self) -> bool {
        matches!(self, Self::SearchPath | Self::Fallback)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absolute => "absolute",
            Self::RelativeToRoot => "relative",
            Self::SearchPath => "path",
            Self::Bundled => "bundled",
            Self::Fallback => "fallback",
        }
    }
}

/// The program used to spawn the server, plus where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    program: PathBuf,
    source: CommandSource,
}

impl ResolvedCommand {
    fn new(program: impl Into<PathBuf>, source: CommandSource) -> Self {
        Self {
            program: program.into(),
            source,
        }
    }

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    #[must_use]
    pub fn source(&self) -> CommandSource {
        self.source
    }

    /// Arguments passed to the server. The server speaks LSP on stdio by
    /// default, so there are none.
    #[must_use]
    pub fn args(&self) -> &[&'static OsStr] {
        &[]
    }
}

impl fmt::Display for ResolvedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())
    }
}

/// Resolve the server command.
///
/// Priority: configured hint (absolute, then root-relative, then bare name),
/// then the bundled binary for `platform`, then [`SERVER_NAME`].
#[must_use]
pub fn resolve(
    path_hint: &str,
    installation_root: &Path,
    platform: &PlatformIdentity,
) -> ResolvedCommand {
    let hint = path_hint.trim();

    let resolved = if !hint.is_empty() {
        resolve_hint(hint, installation_root)
    } else if let Some(bundled) = bundled_binary_path(installation_root, platform) {
        ResolvedCommand::new(bundled, CommandSource::Bundled)
    } else {
        ResolvedCommand::new(SERVER_NAME, CommandSource::Fallback)
    };

    tracing::debug!(
        hint,
        program = %resolved,
        source = ?resolved.source(),
        "Resolved language server command"
    );
    resolved
}

fn resolve_hint(hint: &str, installation_root: &Path) -> ResolvedCommand {
    let as_path = Path::new(hint);
    if as_path.is_absolute() {
        return ResolvedCommand::new(as_path, CommandSource::Absolute);
    }
    // Either `/` or `\` counts on Windows; only `/` elsewhere.
    if hint.chars().any(is_separator) {
        let joined = normalize_path(&installation_root.join(as_path));
        return ResolvedCommand::new(joined, CommandSource::RelativeToRoot);
    }
    ResolvedCommand::new(hint, CommandSource::SearchPath)
}

/// `<root>/bin/<os>-<arch>/<exe>` if the platform is supported and the file
/// exists. Marks the file executable on non-Windows targets (best effort).
fn bundled_binary_path(installation_root: &Path, platform: &PlatformIdentity) -> Option<PathBuf> {
    let target = platform.target_dir()?;
    let candidate = installation_root
        .join(BUNDLE_DIR)
        .join(target)
        .join(platform.executable_name(SERVER_NAME));

    if !candidate.exists() {
        tracing::debug!(path = %candidate.display(), "No bundled server binary");
        return None;
    }

    if !platform.os().is_windows() {
        make_executable(&candidate);
    }
    Some(candidate)
}

#[cfg(unix)]
fn make_executable(path: &Path) {
    use std::fs::{Permissions, set_permissions};
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = set_permissions(path, Permissions::from_mode(0o755)) {
        tracing::debug!("Could not mark {} executable: {e}", path.display());
    }
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) {}

/// Lexically collapse `.` and `..` components. Never climbs above the root.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(c),
            },
            other => out.push(other),
        }
    }
    out.iter().collect()
}
