//! Document selection: which documents the client attaches to.

use std::path::Path;

use globset::{Glob, GlobBuilder, GlobMatcher};
use serde::Deserialize;

use crate::protocol;

/// Language identifier of ONR DSL documents.
pub const LANGUAGE_ID: &str = "onr-dsl";

/// Glob used by the provider-scoped deployment.
pub const PROVIDERS_PATTERN: &str = "**/providers/*.conf";

#[derive(Debug, thiserror::Error)]
#[error("invalid document pattern `{pattern}`: {source}")]
pub struct SelectorError {
    pattern: String,
    #[source]
    source: globset::Error,
}

/// Which documents activate the client.
///
/// Both deployments attach to `file` documents of [`LANGUAGE_ID`]; they
/// differ only in the path restriction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentScope {
    /// Only `**/providers/*.conf`.
    #[default]
    Providers,
    /// Every document of the language, regardless of path.
    All,
}

impl DocumentScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Providers => "providers",
            Self::All => "all",
        }
    }
}

/// A document as seen by the host.
#[derive(Debug, Clone, Copy)]
pub struct Document<'a> {
    pub uri: &'a str,
    pub language_id: &'a str,
}

/// One (scheme, language, pattern) filter.
#[derive(Debug, Clone)]
pub struct DocumentFilter {
    scheme: Option<String>,
    language: Option<String>,
    pattern: Option<(String, GlobMatcher)>,
}

impl DocumentFilter {
    pub fn new(
        scheme: Option<&str>,
        language: Option<&str>,
        pattern: Option<&str>,
    ) -> Result<Self, SelectorError> {
        let pattern = pattern
            .map(|raw| compile_glob(raw).map(|m| (raw.to_string(), m)))
            .transpose()?;
        Ok(Self {
            scheme: scheme.map(String::from),
            language: language.map(String::from),
            pattern,
        })
    }

    #[must_use]
    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_ref().map(|(raw, _)| raw.as_str())
    }

    /// All present constraints must hold.
    #[must_use]
    pub fn matches(&self, doc: &Document<'_>) -> bool {
        if let Some(language) = &self.language
            && language != doc.language_id
        {
            return false;
        }
        if let Some(scheme) = &self.scheme
            && uri_scheme(doc.uri) != Some(scheme.as_str())
        {
            return false;
        }
        match &self.pattern {
            None => true,
            Some((_, glob)) => protocol::file_uri_to_path(doc.uri)
                .is_some_and(|path| glob_matches(glob, &path)),
        }
    }
}

/// Any-of set of [`DocumentFilter`]s.
#[derive(Debug, Clone)]
pub struct DocumentSelector {
    filters: Vec<DocumentFilter>,
}

impl DocumentSelector {
    #[must_use]
    pub fn new(filters: Vec<DocumentFilter>) -> Self {
        Self { filters }
    }

    /// The selector deployed for `scope`.
    pub fn for_scope(scope: DocumentScope) -> Result<Self, SelectorError> {
        let pattern = match scope {
            DocumentScope::Providers => Some(PROVIDERS_PATTERN),
            DocumentScope::All => None,
        };
        let filter = DocumentFilter::new(Some("file"), Some(LANGUAGE_ID), pattern)?;
        Ok(Self::new(vec![filter]))
    }

    #[must_use]
    pub fn filters(&self) -> &[DocumentFilter] {
        &self.filters
    }

    #[must_use]
    pub fn matches(&self, doc: &Document<'_>) -> bool {
        self.filters.iter().any(|f| f.matches(doc))
    }
}

fn compile_glob(pattern: &str) -> Result<GlobMatcher, SelectorError> {
    let glob: Result<Glob, _> = GlobBuilder::new(pattern).literal_separator(true).build();
    glob.map(|g| g.compile_matcher())
        .map_err(|source| SelectorError {
            pattern: pattern.to_string(),
            source,
        })
}

/// Globs are written with `/`; match against the forward-slash form of the
/// path so Windows paths behave the same.
fn glob_matches(glob: &GlobMatcher, path: &Path) -> bool {
    let text = path.to_string_lossy().replace('\\', "/");
    glob.is_match(text.as_str())
}

fn uri_scheme(uri: &str) -> Option<&str> {
    let (scheme, _) = uri.split_once(':')?;
    (!scheme.is_empty()).then_some(scheme)
}
