//! Diagnostics store: the latest `publishDiagnostics` per document URI.

use std::collections::HashMap;

use serde::Serialize;

use crate::types::{Diagnostic, DiagnosticSeverity, Range};

pub(crate) struct DiagnosticsStore {
    data: HashMap<String, Vec<Diagnostic>>,
}

impl DiagnosticsStore {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }

    /// Replace the diagnostics of `uri`. An empty publish clears the file.
    pub fn update(&mut self, uri: &str, items: Vec<Diagnostic>) {
        if items.is_empty() {
            self.data.remove(uri);
        } else {
            self.data.insert(uri.to_string(), items);
        }
    }

    pub fn get(&self, uri: &str) -> Vec<Diagnostic> {
        self.data.get(uri).cloned().unwrap_or_default()
    }

    /// Diagnostics of `uri` whose range touches `range`.
    pub fn overlapping(&self, uri: &str, range: &Range) -> Vec<Diagnostic> {
        self.data
            .get(uri)
            .map(|items| {
                items
                    .iter()
                    .filter(|d| d.range.overlaps(range))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut files: Vec<(String, Vec<Diagnostic>)> = self
            .data
            .iter()
            .map(|(uri, items)| (uri.clone(), items.clone()))
            .collect();

        // Sort: files with errors first, then alphabetically
        files.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(|d| d.severity_level().is_error());
            let b_has_errors = b.1.iter().any(|d| d.severity_level().is_error());
            b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
        });

        DiagnosticsSnapshot { files }
    }
}

/// Point-in-time view of every file's diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiagnosticsSnapshot {
    /// Per-URI diagnostics, sorted with error-containing files first.
    files: Vec<(String, Vec<Diagnostic>)>,
}

impl DiagnosticsSnapshot {
    #[must_use]
    pub fn files(&self) -> &[(String, Vec<Diagnostic>)] {
        &self.files
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn count_by_severity(&self, severity: DiagnosticSeverity) -> usize {
        self.files
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.severity_level() == severity)
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Warning)
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.files.iter().map(|(_, items)| items.len()).sum()
    }

    /// Compact status like "E:3 W:5"; empty when there is nothing to report.
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}
