//! Worker-side interface to the coordination protocol.
//!
//! A worker never touches the log or the locks itself; everything goes through
//! [`CoordinationProtocol`].

use serde::Deserialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordination::errors::Result;
use crate::coordination::{
    AgentRecord, AgentRegistration, AgentStatus, CoordinationError, CoordinationProtocol,
    NewTask, Task, TaskStatus,
};

/// A follow-up task requested in a completion result under `next_tasks`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FollowUpTask {
    #[serde(rename = "type")]
    pub task_type: String,
    pub description: String,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub task: Task,
    /// Ids of follow-up tasks created from `next_tasks`
    pub follow_ups: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AgentClient {
    protocol: CoordinationProtocol,
    agent_id: String,
    agent_type: String,
}

impl AgentClient {
    pub fn new(
        protocol: CoordinationProtocol,
        agent_id: impl Into<String>,
        agent_type: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn protocol(&self) -> &CoordinationProtocol {
        &self.protocol
    }

    /// Register this worker. Safe to call when the orchestrator already registered it.
    pub async fn register(&self, pid: u32) -> Result<AgentRecord> {
        self.protocol
            .register_agent(AgentRegistration::new(
                &self.agent_id,
                &self.agent_type,
                pid,
            ))
            .await
    }

    pub async fn heartbeat(&self, current_task_id: Option<&str>) -> Result<AgentRecord> {
        self.protocol.heartbeat(&self.agent_id, current_task_id).await
    }

    /// Tasks this agent owns that are still Assigned or InProgress
    pub async fn poll_assigned_tasks(&self) -> Result<Vec<Task>> {
        self.protocol.tasks_for_agent(&self.agent_id).await
    }

    /// Claim the best available task of this agent's type, if any
    pub async fn claim_next(&self) -> Result<Option<Task>> {
        for task in self.protocol.available_tasks(&self.agent_type).await? {
            if self.protocol.claim_task(&task.id, &self.agent_id).await? {
                return Ok(Some(self.protocol.task(&task.id).await?));
            }
        }
        Ok(None)
    }

    pub async fn start_task(&self, task_id: &str) -> Result<Task> {
        self.protocol.start_task(task_id, &self.agent_id).await
    }

    /// Result of a completed dependency; None while it is not Completed
    pub async fn fetch_dependency_result(&self, task_id: &str) -> Result<Option<serde_json::Value>> {
        let task = self.protocol.task(task_id).await?;
        Ok(match task.status {
            TaskStatus::Completed => Some(task.result.unwrap_or(serde_json::Value::Null)),
            _ => None,
        })
    }

    /// Complete a task and create any follow-ups listed under `next_tasks` in the result.
    /// Follow-ups depend on the completed task and inherit its priority unless given one.
    pub async fn complete_task(&self, task_id: &str, result: serde_json::Value) -> Result<Completion> {
        let follow_up_specs = parse_follow_ups(task_id, &result);
        let task = self
            .protocol
            .complete_task(task_id, &self.agent_id, result)
            .await?;

        let mut follow_ups = Vec::new();
        for spec in follow_up_specs {
            let mut new_task = NewTask::new(spec.task_type, spec.description)
                .priority(spec.priority.unwrap_or(task.priority))
                .max_retries(task.max_retries)
                .depends_on(task_id);
            if let Some(context) = spec.context {
                new_task = new_task.context(context);
            }
            follow_ups.push(self.protocol.create_task(new_task).await?);
        }
        if !follow_ups.is_empty() {
            info!(task_id = %task_id, follow_ups = ?follow_ups, "Follow-up tasks created");
        }

        Ok(Completion { task, follow_ups })
    }

    /// Report failure; the orchestrator's retry policy decides whether it runs again
    pub async fn fail_task(&self, task_id: &str, error: &str) -> Result<Task> {
        self.protocol.fail_task(task_id, &self.agent_id, error).await
    }

    /// Whether a task this agent is working on has been cancelled (cooperative abort)
    pub async fn is_cancelled(&self, task_id: &str) -> Result<bool> {
        Ok(self.protocol.task(task_id).await?.status == TaskStatus::Cancelled)
    }

    /// Send heartbeats every `interval` until `stop` flips to true or the agent is
    /// declared dead
    pub fn spawn_heartbeat(&self, interval: Duration, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let current = client
                    .poll_assigned_tasks()
                    .await
                    .ok()
                    .and_then(|tasks| tasks.into_iter().next())
                    .map(|t| t.id);
                match client.heartbeat(current.as_deref()).await {
                    Ok(record) if record.status == AgentStatus::Dead => {
                        warn!(agent_id = %client.agent_id, "Agent was declared dead; stopping heartbeats");
                        break;
                    }
                    Ok(_) => debug!(agent_id = %client.agent_id, "Heartbeat sent"),
                    Err(CoordinationError::AgentNotFound(_)) => {
                        debug!(agent_id = %client.agent_id, "Agent not registered yet");
                    }
                    Err(e) => warn!(agent_id = %client.agent_id, error = %e, "Heartbeat failed"),
                }
            }
        })
    }
}

fn parse_follow_ups(task_id: &str, result: &serde_json::Value) -> Vec<FollowUpTask> {
    let Some(entries) = result.get("next_tasks").and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| match serde_json::from_value(entry.clone()) {
            Ok(spec) => Some(spec),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Ignoring malformed next_tasks entry");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::ProtocolOptions;
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, CoordinationProtocol) {
        let dir = TempDir::new().unwrap();
        let protocol = CoordinationProtocol::new(dir.path(), ProtocolOptions::default());
        protocol.init().await.unwrap();
        (dir, protocol)
    }

    #[tokio::test]
    async fn test_claim_work_and_complete_with_follow_ups() {
        let (_dir, protocol) = setup().await;
        let parent = protocol
            .create_task(NewTask::new("search", "find sources").priority(2))
            .await
            .unwrap();

        let client = AgentClient::new(protocol.clone(), "search-agent-00000001", "search");
        client.register(std::process::id()).await.unwrap();

        let claimed = client.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, parent);
        assert_eq!(client.poll_assigned_tasks().await.unwrap().len(), 1);
        client.start_task(&parent).await.unwrap();

        let completion = client
            .complete_task(
                &parent,
                json!({
                    "summary": "found 3",
                    "next_tasks": [
                        {"type": "implement", "description": "use source 1"},
                        {"type": "review", "description": "check", "priority": 0},
                        {"description": "missing type"}
                    ]
                }),
            )
            .await
            .unwrap();

        assert_eq!(completion.task.status, TaskStatus::Completed);
        assert_eq!(completion.follow_ups.len(), 2);
        let first = protocol.task(&completion.follow_ups[0]).await.unwrap();
        assert_eq!(first.task_type, "implement");
        assert_eq!(first.priority, 2);
        assert_eq!(first.dependencies, vec![parent.clone()]);
        let second = protocol.task(&completion.follow_ups[1]).await.unwrap();
        assert_eq!(second.priority, 0);

        let agent = protocol.agent("search-agent-00000001").await.unwrap();
        assert_eq!(agent.tasks_completed, 1);
        assert_eq!(agent.status, AgentStatus::Idle);
    }

    #[tokio::test]
    async fn test_dependency_result_only_when_completed() {
        let (_dir, protocol) = setup().await;
        let dep = protocol.create_task(NewTask::new("search", "dep")).await.unwrap();
        let client = AgentClient::new(protocol.clone(), "search-agent-00000002", "search");

        assert_eq!(client.fetch_dependency_result(&dep).await.unwrap(), None);

        assert!(protocol.claim_task(&dep, client.agent_id()).await.unwrap());
        client.complete_task(&dep, json!({"answer": 42})).await.unwrap();
        assert_eq!(
            client.fetch_dependency_result(&dep).await.unwrap(),
            Some(json!({"answer": 42}))
        );
        assert!(matches!(
            client.fetch_dependency_result("nope").await.unwrap_err(),
            CoordinationError::TaskNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_cancellation_is_observable() {
        let (_dir, protocol) = setup().await;
        let id = protocol.create_task(NewTask::new("search", "slow")).await.unwrap();
        let client = AgentClient::new(protocol.clone(), "search-agent-00000003", "search");
        assert!(protocol.claim_task(&id, client.agent_id()).await.unwrap());
        client.start_task(&id).await.unwrap();

        protocol.cancel_task(&id, Some("superseded")).await.unwrap();
        assert!(client.is_cancelled(&id).await.unwrap());
        assert!(client.poll_assigned_tasks().await.unwrap().is_empty());
    }
}
