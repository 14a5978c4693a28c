use anyhow::{bail, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::cli::commands::Command;
use crate::cli::RepairArgs;
use crate::coordination::CoordinationProtocol;
use crate::orchestrator::InstanceLock;
use crate::repair::{DiagnosticOutput, OutputFormat, RepairTool};

const CONFIRM_WORD: &str = "RESET";

pub struct RepairCommand {
    protocol: CoordinationProtocol,
    args: RepairArgs,
    verbose: bool,
}

impl RepairCommand {
    pub fn new(protocol: CoordinationProtocol, args: RepairArgs, verbose: bool) -> Self {
        Self {
            protocol,
            args,
            verbose,
        }
    }

    async fn emergency(&self, tool: &RepairTool) -> Result<()> {
        if let Some(pid) = InstanceLock::running_pid(self.protocol.base_path())? {
            bail!("Orchestrator (pid {pid}) is running; stop it before an emergency reset");
        }
        let confirmed = self.args.yes || confirm_reset(self.protocol.base_path()).await?;
        if !confirmed {
            println!("Emergency reset aborted");
            return Ok(());
        }

        let reset = tool.emergency_reset(true).await?;
        if self.args.format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(&reset)?);
        } else {
            println!("🚨 Coordination state wiped and reinitialized");
            println!("   Backup: {}", reset.backup_dir.display());
            for path in &reset.backed_up {
                println!("   • {}", path.display());
            }
        }
        Ok(())
    }
}

impl Command for RepairCommand {
    async fn execute(&self) -> Result<()> {
        let tool = RepairTool::new(self.protocol.clone()).with_verbose(self.verbose);
        let output = DiagnosticOutput::new(self.args.format, self.verbose);

        if self.args.emergency {
            return self.emergency(&tool).await;
        }

        let (title, report) = if self.args.repair_all {
            ("Repair", tool.repair_all().await?)
        } else if self.args.validate {
            ("Validation", tool.validate().await?)
        } else {
            ("Diagnostics", tool.diagnose().await?)
        };
        output.output_report(title, &report)?;

        // Exit with error if any check failed
        if !report.is_healthy() {
            std::process::exit(1);
        }
        Ok(())
    }
}

async fn confirm_reset(base_path: &std::path::Path) -> Result<bool> {
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(
            format!(
                "⚠️  This backs up and then DESTROYS all coordination state in {}.\nType {CONFIRM_WORD} to continue: ",
                base_path.display()
            )
            .as_bytes(),
        )
        .await?;
    stdout.flush().await?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(line.trim() == CONFIRM_WORD)
}
