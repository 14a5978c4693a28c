use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

use crate::cli::commands::Command;
use crate::orchestrator::InstanceLock;

/// How long a graceful stop waits for the orchestrator to release its lock
const STOP_WAIT: Duration = Duration::from_secs(60);

pub struct StopCommand {
    base_path: PathBuf,
    force: bool,
}

impl StopCommand {
    pub fn new(base_path: PathBuf, force: bool) -> Self {
        Self { base_path, force }
    }
}

impl Command for StopCommand {
    async fn execute(&self) -> Result<()> {
        let Some(pid) = InstanceLock::running_pid(&self.base_path)? else {
            println!("ℹ️  No orchestrator running for {}", self.base_path.display());
            return Ok(());
        };

        let signal = if self.force { "-KILL" } else { "-TERM" };
        send_signal(pid, signal).await?;
        if self.force {
            println!("💥 Sent SIGKILL to orchestrator (pid {pid})");
            return Ok(());
        }

        println!("🛑 Sent SIGTERM to orchestrator (pid {pid}); waiting for in-flight tasks...");
        let deadline = Instant::now() + STOP_WAIT;
        while Instant::now() < deadline {
            if InstanceLock::running_pid(&self.base_path)?.is_none() {
                println!("✅ Orchestrator stopped");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        bail!("Orchestrator (pid {pid}) is still running; retry or use: taskhive stop --force")
    }
}

#[cfg(unix)]
async fn send_signal(pid: u32, signal: &str) -> Result<()> {
    let status = tokio::process::Command::new("kill")
        .arg(signal)
        .arg(pid.to_string())
        .status()
        .await
        .context("Failed to run kill")?;
    if !status.success() {
        bail!("kill {signal} {pid} failed");
    }
    Ok(())
}

#[cfg(not(unix))]
async fn send_signal(pid: u32, _signal: &str) -> Result<()> {
    bail!("Stopping pid {pid} is only supported on unix; press Ctrl-C in the orchestrator terminal")
}
