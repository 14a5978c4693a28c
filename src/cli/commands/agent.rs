//! `taskhive agent ...`: the worker protocol as a command line, so a worker written in
//! any language can take part. Every command prints JSON on stdout.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

use crate::cli::commands::Command;
use crate::cli::AgentCommands;
use crate::client::AgentClient;
use crate::coordination::CoordinationProtocol;
use crate::orchestrator::process::{ENV_AGENT_ID, ENV_TASK_ID, ENV_TASK_TYPE};
use crate::shutdown::ShutdownCoordinator;

pub struct AgentCommand {
    protocol: CoordinationProtocol,
    command: AgentCommands,
}

impl AgentCommand {
    pub fn new(protocol: CoordinationProtocol, command: AgentCommands) -> Self {
        Self { protocol, command }
    }

    fn client(&self, agent_id: &Option<String>, agent_type: Option<&Option<String>>) -> Result<AgentClient> {
        let agent_id = from_env(agent_id, ENV_AGENT_ID, "--agent-id")?;
        let agent_type = match agent_type {
            Some(agent_type) => from_env(agent_type, ENV_TASK_TYPE, "--agent-type")?,
            // Commands that do not need the type still construct a client
            None => std::env::var(ENV_TASK_TYPE).unwrap_or_default(),
        };
        Ok(AgentClient::new(self.protocol.clone(), agent_id, agent_type))
    }
}

impl Command for AgentCommand {
    async fn execute(&self) -> Result<()> {
        match &self.command {
            AgentCommands::Register {
                agent_id,
                agent_type,
                pid,
            } => {
                let client = self.client(agent_id, Some(agent_type))?;
                let record = client.register(pid.unwrap_or_else(caller_pid)).await?;
                print_json(&record)
            }
            AgentCommands::Heartbeat {
                agent_id,
                task_id,
                every,
            } => {
                let client = self.client(agent_id, None)?;
                if let Some(every) = every {
                    let shutdown = ShutdownCoordinator::new();
                    shutdown.install_signal_handlers()?;
                    client
                        .spawn_heartbeat(Duration::from_millis((*every).max(1)), shutdown.subscribe())
                        .await
                        .context("Heartbeat loop panicked")?;
                    return print_json(&self.protocol.agent(client.agent_id()).await?);
                }
                let task_id = task_id.clone().or_else(|| std::env::var(ENV_TASK_ID).ok());
                let record = client.heartbeat(task_id.as_deref()).await?;
                print_json(&record)
            }
            AgentCommands::Poll { agent_id } => {
                let client = self.client(agent_id, None)?;
                print_json(&client.poll_assigned_tasks().await?)
            }
            AgentCommands::Claim {
                agent_id,
                agent_type,
            } => {
                let client = self.client(agent_id, Some(agent_type))?;
                print_json(&client.claim_next().await?)
            }
            AgentCommands::Start { task_id, agent_id } => {
                let client = self.client(agent_id, None)?;
                let task_id = from_env(task_id, ENV_TASK_ID, "a task id")?;
                print_json(&client.start_task(&task_id).await?)
            }
            AgentCommands::Complete {
                task_id,
                result,
                agent_id,
            } => {
                let client = self.client(agent_id, None)?;
                let task_id = from_env(task_id, ENV_TASK_ID, "a task id")?;
                let result: serde_json::Value =
                    serde_json::from_str(result).context("--result must be valid JSON")?;
                let completion = client.complete_task(&task_id, result).await?;
                print_json(&json!({
                    "task": completion.task,
                    "follow_ups": completion.follow_ups,
                }))
            }
            AgentCommands::Fail {
                task_id,
                error,
                agent_id,
            } => {
                let client = self.client(agent_id, None)?;
                let task_id = from_env(task_id, ENV_TASK_ID, "a task id")?;
                print_json(&client.fail_task(&task_id, error).await?)
            }
            AgentCommands::Dependency { task_id } => {
                let client = AgentClient::new(self.protocol.clone(), "", "");
                match client.fetch_dependency_result(task_id).await? {
                    Some(result) => print_json(&result),
                    None => Err(anyhow!("Task {task_id} has not completed")),
                }
            }
        }
    }
}

fn from_env(explicit: &Option<String>, var: &str, flag: &str) -> Result<String> {
    if let Some(value) = explicit {
        return Ok(value.clone());
    }
    std::env::var(var).map_err(|_| anyhow!("Pass {flag} or set {var}"))
}

/// The worker that invoked this command, not the short-lived CLI process itself
#[cfg(unix)]
fn caller_pid() -> u32 {
    std::os::unix::process::parent_id()
}

#[cfg(not(unix))]
fn caller_pid() -> u32 {
    std::process::id()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
