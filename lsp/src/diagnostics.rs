//! Per-file diagnostics published by the server.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::types::{Diagnostic, DiagnosticsSnapshot};

#[derive(Debug, Default)]
pub(crate) struct DiagnosticsStore {
    data: HashMap<PathBuf, Vec<Diagnostic>>,
}

impl DiagnosticsStore {
    /// Replace the diagnostics for `path`. An empty publish clears the file.
    pub fn update(&mut self, path: PathBuf, items: Vec<Diagnostic>) {
        if items.is_empty() {
            self.data.remove(&path);
        } else {
            self.data.insert(path, items);
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Files with errors first, then by path.
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut files: Vec<(PathBuf, Vec<Diagnostic>)> = self
            .data
            .iter()
            .map(|(path, items)| (path.clone(), items.clone()))
            .collect();

        files.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(|d| d.severity().is_error());
            let b_has_errors = b.1.iter().any(|d| d.severity().is_error());
            b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
        });

        DiagnosticsSnapshot::new(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DiagnosticSeverity;

    fn make_diag(severity: DiagnosticSeverity, msg: &str) -> Diagnostic {
        Diagnostic::new(severity, msg.to_string(), 0, 0, "onr-lsp".to_string())
    }

    #[test]
    fn empty_publish_clears_file() {
        let mut store = DiagnosticsStore::default();
        let path = PathBuf::from("providers/a.conf");
        store.update(path.clone(), vec![make_diag(DiagnosticSeverity::Error, "e")]);
        assert_eq!(store.snapshot().total_count(), 1);

        store.update(path, Vec::new());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn later_publish_replaces_earlier() {
        let mut store = DiagnosticsStore::default();
        let path = PathBuf::from("providers/a.conf");
        store.update(
            path.clone(),
            vec![
                make_diag(DiagnosticSeverity::Error, "e1"),
                make_diag(DiagnosticSeverity::Error, "e2"),
            ],
        );
        store.update(path, vec![make_diag(DiagnosticSeverity::Warning, "w")]);

        let snap = store.snapshot();
        assert_eq!(snap.error_count(), 0);
        assert_eq!(snap.warning_count(), 1);
    }

    #[test]
    fn files_with_errors_sort_first() {
        let mut store = DiagnosticsStore::default();
        store.update(
            PathBuf::from("a.conf"),
            vec![make_diag(DiagnosticSeverity::Warning, "w")],
        );
        store.update(
            PathBuf::from("z.conf"),
            vec![make_diag(DiagnosticSeverity::Error, "e")],
        );
        store.update(
            PathBuf::from("m.conf"),
            vec![make_diag(DiagnosticSeverity::Hint, "h")],
        );

        let snap = store.snapshot();
        let order: Vec<_> = snap.files().iter().map(|(p, _)| p.clone()).collect();
        assert_eq!(
            order,
            vec![
                PathBuf::from("z.conf"),
                PathBuf::from("a.conf"),
                PathBuf::from("m.conf"),
            ]
        );
    }

    #[test]
    fn clear_drops_everything() {
        let mut store = DiagnosticsStore::default();
        store.update(
            PathBuf::from("a.conf"),
            vec![make_diag(DiagnosticSeverity::Error, "e")],
        );
        store.clear();
        assert!(store.snapshot().is_empty());
    }
}
