use anyhow::Result;
use std::fmt::Write as _;
use std::time::Duration;

use crate::cli::commands::Command;
use crate::config::TaskHiveConfig;
use crate::coordination::{AgentStatus, CoordinationProtocol, ProjectionHealth};
use crate::orchestrator::{system_status, SystemStatus};
use crate::shutdown::ShutdownCoordinator;

pub struct MonitorCommand {
    protocol: CoordinationProtocol,
    config: TaskHiveConfig,
    live: bool,
    json: bool,
    interval: Duration,
    events: usize,
}

impl MonitorCommand {
    pub fn new(protocol: CoordinationProtocol, config: TaskHiveConfig) -> Self {
        Self {
            protocol,
            config,
            live: false,
            json: false,
            interval: Duration::from_secs(2),
            events: 10,
        }
    }

    pub fn with_live(mut self, live: bool, interval: Duration) -> Self {
        self.live = live;
        self.interval = interval.max(Duration::from_millis(200));
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub fn with_events(mut self, events: usize) -> Self {
        self.events = events;
        self
    }

    async fn print_once(&self) -> Result<()> {
        let status = system_status(&self.protocol, &self.config, self.events).await?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else {
            print!("{}", render_status(&status));
        }
        Ok(())
    }
}

impl Command for MonitorCommand {
    async fn execute(&self) -> Result<()> {
        if !self.live {
            return self.print_once().await;
        }

        let shutdown = ShutdownCoordinator::new();
        shutdown.install_signal_handlers()?;
        loop {
            if !self.json {
                // Clear screen and home the cursor
                print!("\x1B[2J\x1B[H");
            }
            self.print_once().await?;
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.wait() => break,
            }
        }
        Ok(())
    }
}

/// Human-readable status report
pub fn render_status(status: &SystemStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "🐝 TASKHIVE STATUS");
    let _ = writeln!(out, "==================");
    let _ = writeln!(out, "Root: {}", status.base_path);
    match status.orchestrator_pid {
        Some(pid) => {
            let _ = writeln!(out, "Orchestrator: 🟢 running (pid {pid})");
        }
        None => {
            let _ = writeln!(out, "Orchestrator: 🔴 not running");
        }
    }
    let health = match &status.projection {
        ProjectionHealth::Current { last_sequence } => format!("✅ current at sequence {last_sequence}"),
        ProjectionHealth::Lagging { projection, log } => {
            format!("⚠️  projection at {projection}, log at {log}")
        }
        ProjectionHealth::Unreadable { reason } => format!("❌ unreadable ({reason})"),
    };
    let _ = writeln!(out, "Projections: {health}");
    let _ = writeln!(out);

    let _ = writeln!(out, "📋 TASKS:");
    let _ = writeln!(out, "─────────");
    if status.tasks_by_status.is_empty() {
        let _ = writeln!(out, "   No tasks");
    }
    for (state, count) in &status.tasks_by_status {
        let _ = writeln!(out, "   {state}: {count}");
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "💼 TASK TYPES:");
    let _ = writeln!(out, "──────────────");
    for t in &status.types {
        let icon = if t.active >= t.concurrency_limit { "🔴" } else { "🟢" };
        let cooldown = t
            .cooldown_remaining_ms
            .map(|ms| format!(", cooling down {:.1}s", ms as f64 / 1000.0))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "   {icon} {} - active {}/{}, pending {} ({} ready), live agents {}{cooldown}",
            t.task_type, t.active, t.concurrency_limit, t.pending, t.ready, t.live_agents
        );
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "🤖 AGENTS:");
    let _ = writeln!(out, "──────────");
    if status.agents.is_empty() {
        let _ = writeln!(out, "   No agents registered");
    }
    for agent in &status.agents {
        let icon = match agent.status {
            AgentStatus::Idle => "🟢",
            AgentStatus::Busy => "🟡",
            AgentStatus::Dead => "💀",
        };
        let _ = writeln!(
            out,
            "   {icon} {} [{}] pid {} - {} (heartbeat {}s ago, done {}, failed {}){}",
            agent.id,
            agent.agent_type,
            agent.pid,
            agent.status,
            agent.heartbeat_age_ms / 1000,
            agent.tasks_completed,
            agent.tasks_failed,
            agent
                .current_task_id
                .as_deref()
                .map(|t| format!(" on {t}"))
                .unwrap_or_default()
        );
    }
    let _ = writeln!(out);

    let _ = writeln!(out, "📜 RECENT EVENTS:");
    let _ = writeln!(out, "─────────────────");
    for event in &status.recent_events {
        let _ = writeln!(
            out,
            "   #{} {} {}{}{}",
            event.sequence_id,
            event.timestamp.format("%H:%M:%S"),
            event.kind.type_name(),
            event
                .kind
                .task_id()
                .map(|t| format!(" task={t}"))
                .unwrap_or_default(),
            event
                .kind
                .agent_id()
                .map(|a| format!(" agent={a}"))
                .unwrap_or_default()
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{NewTask, ProtocolOptions};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_render_status_lists_types_and_events() {
        let dir = TempDir::new().unwrap();
        let protocol = CoordinationProtocol::new(dir.path(), ProtocolOptions::default());
        protocol.init().await.unwrap();
        protocol
            .create_task(NewTask::new("search", "find things"))
            .await
            .unwrap();

        let status = system_status(&protocol, &TaskHiveConfig::default(), 5)
            .await
            .unwrap();
        let text = render_status(&status);

        assert!(text.contains("Orchestrator: 🔴 not running"));
        assert!(text.contains("✅ current at sequence 1"));
        assert!(text.contains("pending: 1"));
        assert!(text.contains("search - active 0/1, pending 1 (1 ready)"));
        assert!(text.contains("#1"));
        assert!(text.contains("task_created"));
    }
}
