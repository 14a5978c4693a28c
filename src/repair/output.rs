use super::types::{DiagnosticReport, DiagnosticStatus, OutputFormat, RepairAction};
use anyhow::Result;

/// Renders repair reports to stdout
pub struct DiagnosticOutput {
    format: OutputFormat,
    verbose: bool,
}

impl DiagnosticOutput {
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        Self { format, verbose }
    }

    fn is_verbose(&self) -> bool {
        self.verbose && !matches!(self.format, OutputFormat::Json)
    }

    pub fn output_report(&self, title: &str, report: &DiagnosticReport) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(report)?);
            }
            OutputFormat::Text => {
                print!("{}", self.render_text(title, report));
            }
        }
        Ok(())
    }

    /// Text rendering, kept separate from printing so it can be tested
    pub fn render_text(&self, title: &str, report: &DiagnosticReport) -> String {
        let mut out = String::new();
        let header = format!("🐝 TASKHIVE REPAIR - {title}");
        out.push_str(&format!("{header}\n{}\n\n", "=".repeat(header.chars().count())));
        out.push_str(&format!("Coordination root: {}\n\n", report.base_path));

        if !report.actions.is_empty() {
            out.push_str(&render_actions(&report.actions));
        }

        out.push_str("📊 DIAGNOSTIC SUMMARY:\n");
        out.push_str("─────────────────────\n");
        out.push_str(&format!("Total checks: {}\n", report.summary.total_checks));
        if report.summary.passed > 0 {
            out.push_str(&format!("✅ Passed: {}\n", report.summary.passed));
        }
        if report.summary.failed > 0 {
            out.push_str(&format!("❌ Failed: {}\n", report.summary.failed));
        }
        if report.summary.warnings > 0 {
            out.push_str(&format!("⚠️  Warnings: {}\n", report.summary.warnings));
        }
        if report.summary.info > 0 {
            out.push_str(&format!("ℹ️  Info: {}\n", report.summary.info));
        }
        out.push('\n');

        out.push_str("🔍 DETAILED RESULTS:\n");
        out.push_str("──────────────────\n");
        for (name, result) in &report.checks {
            let status_icon = match result.status {
                DiagnosticStatus::Pass => "✅",
                DiagnosticStatus::Fail => "❌",
                DiagnosticStatus::Warning => "⚠️",
                DiagnosticStatus::Info => "ℹ️",
            };
            out.push_str(&format!("{} {}: {}\n", status_icon, name, result.message));

            if self.is_verbose()
                || matches!(
                    result.status,
                    DiagnosticStatus::Fail | DiagnosticStatus::Warning | DiagnosticStatus::Info
                )
            {
                if let Some(details) = &result.details {
                    out.push_str(&format!("   Details: {}\n", details));
                }
                if let Some(suggestion) = &result.suggestion {
                    out.push_str(&format!("   Suggestion: {}\n", suggestion));
                }
            }
        }
        out.push('\n');

        if report.summary.failed == 0 {
            if report.summary.warnings > 0 {
                out.push_str(&format!(
                    "⚠️  Coordination state is usable but has {} warning(s).\n",
                    report.summary.warnings
                ));
            } else {
                out.push_str("✅ Coordination state is healthy.\n");
            }
        } else {
            out.push_str(&format!(
                "❌ Coordination state has {} problem(s) that must be resolved.\n",
                report.summary.failed
            ));
        }
        out
    }
}

fn render_actions(actions: &[RepairAction]) -> String {
    let mut out = String::from("🔧 REPAIR ACTIONS:\n──────────────────\n");
    for action in actions {
        out.push_str(&format!("• {}: {}\n", action.name, action.description));
    }
    out.push('\n');
    out
}
