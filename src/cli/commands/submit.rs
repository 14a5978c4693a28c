use anyhow::Result;

use crate::cli::commands::Command;
use crate::coordination::{CoordinationProtocol, NewTask};

pub struct SubmitCommand {
    protocol: CoordinationProtocol,
    task: NewTask,
}

impl SubmitCommand {
    pub fn new(protocol: CoordinationProtocol, task: NewTask) -> Self {
        Self { protocol, task }
    }
}

impl Command for SubmitCommand {
    async fn execute(&self) -> Result<()> {
        self.protocol.init().await?;
        let task_id = self.protocol.create_task(self.task.clone()).await?;
        // Bare id on stdout so scripts can capture it
        println!("{task_id}");
        Ok(())
    }
}

pub struct CancelCommand {
    protocol: CoordinationProtocol,
    task_id: String,
    reason: Option<String>,
}

impl CancelCommand {
    pub fn new(protocol: CoordinationProtocol, task_id: String, reason: Option<String>) -> Self {
        Self {
            protocol,
            task_id,
            reason,
        }
    }
}

impl Command for CancelCommand {
    async fn execute(&self) -> Result<()> {
        let task = self
            .protocol
            .cancel_task(&self.task_id, self.reason.as_deref())
            .await?;
        println!("🚫 Task {} is now {}", task.id, task.status);
        Ok(())
    }
}
