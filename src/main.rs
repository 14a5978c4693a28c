use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use taskhive::cli::commands::agent::AgentCommand;
use taskhive::cli::commands::monitor::MonitorCommand;
use taskhive::cli::commands::repair::RepairCommand;
use taskhive::cli::commands::start::{StartCommand, StartMode};
use taskhive::cli::commands::stop::StopCommand;
use taskhive::cli::commands::submit::{CancelCommand, SubmitCommand};
use taskhive::cli::commands::Command;
use taskhive::cli::{Cli, Commands};
use taskhive::config::TaskHiveConfig;
use taskhive::coordination::{CoordinationProtocol, NewTask};
use taskhive::orchestrator::process::ENV_BASE_PATH;
use taskhive::telemetry::{init_telemetry, shutdown_telemetry};

fn main() -> Result<()> {
    let Cli {
        base_path,
        config: config_path,
        verbose,
        command,
    } = Cli::parse();

    TaskHiveConfig::load_env_file()?;
    let mut config = TaskHiveConfig::load(config_path.as_deref())?;
    // Spawned workers inherit the orchestrator's root through the environment
    if let Some(base_path) =
        base_path.or_else(|| std::env::var_os(ENV_BASE_PATH).map(PathBuf::from))
    {
        config.coordination.base_path = base_path;
    }

    let level = if verbose {
        "debug".to_string()
    } else {
        config.observability.log_level.clone()
    };
    init_telemetry(&level, config.observability.json_logs)?;

    let protocol = CoordinationProtocol::from_config(&config.coordination);
    let result = tokio::runtime::Runtime::new()?.block_on(async move {
        match command {
            Commands::Start {
                daemon: _,
                interactive,
                init,
            } => {
                let mode = if init {
                    StartMode::Init
                } else if interactive {
                    StartMode::Interactive
                } else {
                    StartMode::Daemon
                };
                StartCommand::new(protocol, config, mode)
                    .with_config_path(config_path)
                    .execute()
                    .await
            }
            Commands::Stop { force } => {
                StopCommand::new(config.coordination.base_path.clone(), force)
                    .execute()
                    .await
            }
            Commands::Monitor {
                live,
                json,
                interval,
                events,
            } => {
                MonitorCommand::new(protocol, config)
                    .with_live(live, Duration::from_secs(interval))
                    .with_json(json)
                    .with_events(events)
                    .execute()
                    .await
            }
            Commands::Repair(args) => RepairCommand::new(protocol, args, verbose).execute().await,
            Commands::Submit {
                task_type,
                description,
                priority,
                depends_on,
                max_retries,
                context,
            } => {
                let mut task = NewTask::new(task_type, description)
                    .priority(priority)
                    .max_retries(max_retries.unwrap_or(config.orchestrator.default_max_retries));
                for dependency in depends_on {
                    task = task.depends_on(dependency);
                }
                if let Some(context) = context {
                    task = task.context(context);
                }
                SubmitCommand::new(protocol, task).execute().await
            }
            Commands::Cancel { task_id, reason } => {
                CancelCommand::new(protocol, task_id, reason).execute().await
            }
            Commands::Agent { command } => AgentCommand::new(protocol, command).execute().await,
        }
    });

    shutdown_telemetry();
    result
}
