use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Result of a diagnostic check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticResult {
    pub status: DiagnosticStatus,
    pub message: String,
    pub details: Option<String>,
    pub suggestion: Option<String>,
}

impl DiagnosticResult {
    pub fn pass(message: impl Into<String>) -> Self {
        Self::new(DiagnosticStatus::Pass, message)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::new(DiagnosticStatus::Fail, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(DiagnosticStatus::Warning, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(DiagnosticStatus::Info, message)
    }

    fn new(status: DiagnosticStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
            suggestion: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Status of a diagnostic check
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DiagnosticStatus {
    Pass,
    Fail,
    Warning,
    Info,
}

/// Something the repair tool changed on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairAction {
    pub name: String,
    pub description: String,
}

/// Diagnostic report containing all check results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub base_path: String,
    pub summary: DiagnosticSummary,
    pub checks: BTreeMap<String, DiagnosticResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<RepairAction>,
}

impl DiagnosticReport {
    pub fn new(base_path: impl Into<String>, checks: BTreeMap<String, DiagnosticResult>) -> Self {
        Self {
            base_path: base_path.into(),
            summary: DiagnosticSummary::from_checks(&checks),
            checks,
            actions: Vec::new(),
        }
    }

    pub fn with_actions(mut self, actions: Vec<RepairAction>) -> Self {
        self.actions = actions;
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.summary.failed == 0
    }
}

/// Summary of diagnostic results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticSummary {
    pub total_checks: usize,
    pub passed: usize,
    pub failed: usize,
    pub warnings: usize,
    pub info: usize,
}

impl DiagnosticSummary {
    pub fn from_checks(checks: &BTreeMap<String, DiagnosticResult>) -> Self {
        let mut summary = Self {
            total_checks: checks.len(),
            passed: 0,
            failed: 0,
            warnings: 0,
            info: 0,
        };
        for result in checks.values() {
            match result.status {
                DiagnosticStatus::Pass => summary.passed += 1,
                DiagnosticStatus::Fail => summary.failed += 1,
                DiagnosticStatus::Warning => summary.warnings += 1,
                DiagnosticStatus::Info => summary.info += 1,
            }
        }
        summary
    }
}

/// Report output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
