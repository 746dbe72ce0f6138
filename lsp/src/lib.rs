//! Client side of the ONR language server integration.
//!
//! [`locator::resolve`] decides which `onr-lsp` executable to run and
//! [`LanguageClient`] owns the running process between `activate` and
//! `deactivate`.

pub mod codec;
pub mod locator;
pub mod platform;
pub mod protocol;
pub mod selector;
pub mod types;

pub(crate) mod diagnostics;
pub(crate) mod server;

mod lifecycle;

pub use lifecycle::{ActivationContext, LanguageClient, LifecycleError};
pub use locator::{CommandSource, ResolvedCommand, SERVER_NAME, resolve};
pub use platform::{ArchTag, OsTag, PlatformIdentity};
pub use selector::{Document, DocumentFilter, DocumentScope, DocumentSelector, LANGUAGE_ID};
pub use types::{
    CONFIG_SECTION, ClientConfig, ClientState, Diagnostic, DiagnosticSeverity,
    DiagnosticsSnapshot, ServerInfo,
};
