use anyhow::{bail, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::cli::commands::monitor::render_status;
use crate::cli::commands::Command;
use crate::config::{TaskHiveConfig, DEFAULT_CONFIG_FILE};
use crate::coordination::{CoordinationProtocol, NewTask};
use crate::orchestrator::process::CommandLauncher;
use crate::orchestrator::{system_status, InstanceLock, Orchestrator};
use crate::repair::{DiagnosticOutput, OutputFormat, RepairTool};
use crate::shutdown::ShutdownCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    Daemon,
    Interactive,
    Init,
}

pub struct StartCommand {
    protocol: CoordinationProtocol,
    config: TaskHiveConfig,
    config_path: Option<PathBuf>,
    mode: StartMode,
}

impl StartCommand {
    pub fn new(protocol: CoordinationProtocol, config: TaskHiveConfig, mode: StartMode) -> Self {
        Self {
            protocol,
            config,
            config_path: None,
            mode,
        }
    }

    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    async fn initialize(&self) -> Result<()> {
        self.protocol.init().await?;
        println!(
            "✅ Coordination directory ready: {}",
            self.protocol.base_path().display()
        );

        let config_path = self
            .config_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        if config_path.exists() {
            println!("ℹ️  Keeping existing config: {}", config_path.display());
        } else {
            let mut starter = TaskHiveConfig::example();
            starter.coordination.base_path = self.protocol.base_path().to_path_buf();
            starter.save_to_file(&config_path)?;
            println!("✅ Starter config written: {}", config_path.display());
            println!("   Edit [workers.*] to point at your worker programs.");
        }
        Ok(())
    }

    /// Environment init plus structural validation before the supervisor starts
    async fn preflight(&self) -> Result<()> {
        self.protocol.init().await?;
        let report = RepairTool::new(self.protocol.clone()).validate().await?;
        if !report.is_healthy() {
            DiagnosticOutput::new(OutputFormat::Text, false).output_report("Pre-flight", &report)?;
            bail!("Pre-flight checks failed; run: taskhive repair --repair-all");
        }
        if self.config.workers.is_empty() {
            warn!("No worker types configured; tasks will queue but nothing will be dispatched");
        }
        Ok(())
    }

    async fn interactive_loop(&self, shutdown: &ShutdownCoordinator) -> Result<()> {
        println!("🐝 TaskHive interactive mode. Type 'help' for commands.");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = shutdown.wait() => return Ok(()),
            };
            let Some(line) = line else {
                shutdown.trigger("stdin closed");
                return Ok(());
            };

            match parse_interactive(&line) {
                InteractiveCommand::Empty => {}
                InteractiveCommand::Help => print_help(),
                InteractiveCommand::Status => {
                    match system_status(&self.protocol, &self.config, 5).await {
                        Ok(status) => print!("{}", render_status(&status)),
                        Err(e) => println!("❌ {e:#}"),
                    }
                }
                InteractiveCommand::Agents => match self.protocol.agents().await {
                    Ok(agents) if agents.is_empty() => println!("No agents registered"),
                    Ok(agents) => {
                        for agent in agents {
                            println!(
                                "{} [{}] {} task={}",
                                agent.id,
                                agent.agent_type,
                                agent.effective_status(chrono::Utc::now(), self.protocol.heartbeat_timeout()),
                                agent.current_task_id.as_deref().unwrap_or("-")
                            );
                        }
                    }
                    Err(e) => println!("❌ {e}"),
                },
                InteractiveCommand::Task {
                    task_type,
                    description,
                } => {
                    let new_task = NewTask::new(task_type, description)
                        .max_retries(self.config.orchestrator.default_max_retries);
                    match self.protocol.create_task(new_task).await {
                        Ok(id) => println!("✅ Task created: {id}"),
                        Err(e) => println!("❌ {e}"),
                    }
                }
                InteractiveCommand::Shutdown => {
                    shutdown.trigger("interactive shutdown");
                    return Ok(());
                }
                InteractiveCommand::Invalid(message) => println!("❌ {message}"),
            }
        }
    }
}

impl Command for StartCommand {
    async fn execute(&self) -> Result<()> {
        if self.mode == StartMode::Init {
            return self.initialize().await;
        }

        self.preflight().await?;
        let instance = InstanceLock::acquire(self.protocol.base_path())?;
        info!(pid_file = %instance.path().display(), "Orchestrator instance lock held");

        let shutdown = ShutdownCoordinator::new();
        shutdown.install_signal_handlers()?;

        let mut orchestrator = Orchestrator::new(
            self.protocol.clone(),
            self.config.clone(),
            Arc::new(CommandLauncher),
        );
        let supervisor_shutdown = shutdown.clone();
        let supervisor = tokio::spawn(async move { orchestrator.run(&supervisor_shutdown).await });

        if self.mode == StartMode::Interactive {
            if let Err(e) = self.interactive_loop(&shutdown).await {
                warn!(error = %e, "Interactive input failed; shutting down");
                shutdown.trigger("interactive input error");
            }
        } else {
            println!(
                "🐝 TaskHive orchestrator running for {} (pid {}). Stop with: taskhive stop",
                self.protocol.base_path().display(),
                std::process::id()
            );
        }

        supervisor.await??;
        drop(instance);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractiveCommand {
    Empty,
    Help,
    Status,
    Agents,
    Task { task_type: String, description: String },
    Shutdown,
    Invalid(String),
}

pub fn parse_interactive(line: &str) -> InteractiveCommand {
    let line = line.trim();
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };
    match command {
        "" => InteractiveCommand::Empty,
        "help" | "?" => InteractiveCommand::Help,
        "status" => InteractiveCommand::Status,
        "agents" => InteractiveCommand::Agents,
        "shutdown" | "quit" | "exit" => InteractiveCommand::Shutdown,
        "task" => match rest.split_once(char::is_whitespace) {
            Some((task_type, description)) if !description.trim().is_empty() => {
                InteractiveCommand::Task {
                    task_type: task_type.to_string(),
                    description: description.trim().to_string(),
                }
            }
            _ => InteractiveCommand::Invalid("usage: task <type> <description>".to_string()),
        },
        other => InteractiveCommand::Invalid(format!("unknown command '{other}', try 'help'")),
    }
}

fn print_help() {
    println!("Commands:");
    println!("  status                      system status");
    println!("  task <type> <description>   submit a task");
    println!("  agents                      list registered agents");
    println!("  shutdown                    stop gracefully");
    println!("  help                        this help");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interactive_commands() {
        assert_eq!(parse_interactive("  "), InteractiveCommand::Empty);
        assert_eq!(parse_interactive("status"), InteractiveCommand::Status);
        assert_eq!(parse_interactive("agents\n"), InteractiveCommand::Agents);
        assert_eq!(parse_interactive("quit"), InteractiveCommand::Shutdown);
        assert_eq!(
            parse_interactive("task search find the   docs "),
            InteractiveCommand::Task {
                task_type: "search".to_string(),
                description: "find the   docs".to_string(),
            }
        );
        assert!(matches!(parse_interactive("task search"), InteractiveCommand::Invalid(_)));
        assert!(matches!(parse_interactive("dance"), InteractiveCommand::Invalid(_)));
    }
}
