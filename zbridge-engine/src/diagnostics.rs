use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCategory {
    MissingReference,
    UnsupportedPrimitive,
    CorruptData,
    NumericDegeneracy,
    EmptyGeometry,
    ElementFailure,
    Cancelled,
    Skipped,
}

impl fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            IssueCategory::MissingReference => "missing-reference",
            IssueCategory::UnsupportedPrimitive => "unsupported-primitive",
            IssueCategory::CorruptData => "corrupt-data",
            IssueCategory::NumericDegeneracy => "numeric-degeneracy",
            IssueCategory::EmptyGeometry => "empty-geometry",
            IssueCategory::ElementFailure => "element-failure",
            IssueCategory::Cancelled => "cancelled",
            IssueCategory::Skipped => "skipped",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Diagnostic {
    pub severity: Severity,
    pub category: IssueCategory,
    pub message: String,
}

impl Diagnostic {
    pub fn new(severity: Severity, category: IssueCategory, message: impl Into<String>) -> Self {
        Self {
            severity,
            category,
            message: message.into(),
        }
    }

    pub fn info(category: IssueCategory, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, category, message)
    }

    pub fn warning(category: IssueCategory, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, category, message)
    }

    pub fn error(category: IssueCategory, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, category, message)
    }
}

/// 诊断接收端：不阻塞、不失败。
pub trait DiagnosticsSink {
    fn report(&mut self, diagnostic: Diagnostic);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticRecord {
    pub severity: Severity,
    pub category: IssueCategory,
    pub message: String,
    pub occurrences: usize,
}

/// 去重的诊断集合：相同 (级别, 类别, 消息) 只记录一次并累加次数，保持首次出现顺序。
#[derive(Debug, Default)]
pub struct Diagnostics {
    records: Vec<DiagnosticRecord>,
    index: HashMap<Diagnostic, usize>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[DiagnosticRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.records
            .iter()
            .filter(|record| record.severity == severity)
            .count()
    }

    pub fn count_category(&self, category: IssueCategory) -> usize {
        self.records
            .iter()
            .filter(|record| record.category == category)
            .count()
    }

    pub fn total_occurrences(&self) -> usize {
        self.records.iter().map(|record| record.occurrences).sum()
    }

    pub fn into_records(self) -> Vec<DiagnosticRecord> {
        self.records
    }
}

impl DiagnosticsSink for Diagnostics {
    fn report(&mut self, diagnostic: Diagnostic) {
        if let Some(&slot) = self.index.get(&diagnostic) {
            self.records[slot].occurrences += 1;
            return;
        }
        debug!(
            severity = ?diagnostic.severity,
            category = %diagnostic.category,
            message = %diagnostic.message,
            "记录诊断"
        );
        self.records.push(DiagnosticRecord {
            severity: diagnostic.severity,
            category: diagnostic.category,
            message: diagnostic.message.clone(),
            occurrences: 1,
        });
        self.index.insert(diagnostic, self.records.len() - 1);
    }
}
