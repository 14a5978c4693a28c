use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle status of a task.
///
/// Creation publishes a task straight into `Pending`. From there:
/// `Pending -> Assigned -> InProgress -> {Completed | Failed}`, `Failed -> Pending`
/// while retries remain, and `Cancelled` from any non-terminal state.
/// A crashed worker's task is requeued from `Assigned`/`InProgress` back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Assigned) => true,
            (Assigned, InProgress) => true,
            (Assigned, Failed) | (InProgress, Completed) | (InProgress, Failed) => true,
            (Assigned, Pending) | (InProgress, Pending) => true,
            (Failed, Pending) => true,
            // Failed is only terminal once retries run out; callers check `Task::can_retry`
            (Pending | Assigned | InProgress | Failed, Cancelled) => true,
            _ => false,
        }
    }

    /// Assigned or InProgress: an agent owns the task
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work tracked by the task queue projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Lower is more urgent
    pub priority: i32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Sequence id of the creation event; the FIFO tie-breaker
    pub created_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent_id: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        match self.status {
            TaskStatus::Completed | TaskStatus::Cancelled => true,
            TaskStatus::Failed => !self.can_retry(),
            _ => false,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Busy,
    Dead,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Busy => "busy",
            AgentStatus::Dead => "dead",
        };
        f.write_str(label)
    }
}

/// Why an agent left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeregisterReason {
    /// Clean exit; the record is removed
    Exited,
    /// Heartbeat went stale; the record stays as Dead until replaced or removed
    HeartbeatTimeout,
    /// Dead record dropped without a replacement
    Removed,
    /// Terminated by the orchestrator during shutdown
    Shutdown,
}

/// A registered worker process as seen by the agent registry projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    /// Capability tag; matches the task types the agent serves
    pub agent_type: String,
    pub pid: u32,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub restart_count: u32,
    #[serde(default)]
    pub tasks_completed: u64,
    #[serde(default)]
    pub tasks_failed: u64,
}

impl AgentRecord {
    /// Age of the last heartbeat relative to `now` (zero if the clock went backwards)
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or(Duration::ZERO)
    }

    /// Liveness is derived: a stale heartbeat means Dead regardless of the stored status
    pub fn effective_status(&self, now: DateTime<Utc>, timeout: Duration) -> AgentStatus {
        if self.status == AgentStatus::Dead || self.heartbeat_age(now) > timeout {
            AgentStatus::Dead
        } else {
            self.status
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(last_heartbeat: DateTime<Utc>) -> AgentRecord {
        AgentRecord {
            id: "search-agent-1".to_string(),
            agent_type: "search".to_string(),
            pid: 42,
            status: AgentStatus::Busy,
            current_task_id: Some("t1".to_string()),
            last_heartbeat,
            started_at: last_heartbeat,
            restart_count: 0,
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }

    #[test]
    fn test_task_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(InProgress.can_transition_to(Cancelled));
        assert!(Failed.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(InProgress));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_stale_heartbeat_is_dead() {
        let now = Utc::now();
        let fresh = agent(now - chrono::Duration::seconds(5));
        let stale = agent(now - chrono::Duration::seconds(120));
        let timeout = Duration::from_secs(60);

        assert_eq!(fresh.effective_status(now, timeout), AgentStatus::Busy);
        assert_eq!(stale.effective_status(now, timeout), AgentStatus::Dead);
        // Stored status is untouched; only the view changes
        assert_eq!(stale.status, AgentStatus::Busy);
    }

    #[test]
    fn test_failed_task_terminal_only_when_retries_exhausted() {
        let now = Utc::now();
        let mut task = Task {
            id: "t1".to_string(),
            task_type: "search".to_string(),
            description: "find things".to_string(),
            context: None,
            priority: 1,
            status: TaskStatus::Failed,
            created_at: now,
            updated_at: now,
            created_seq: 1,
            assigned_agent_id: None,
            dependencies: vec![],
            result: None,
            error: Some("boom".to_string()),
            retry_count: 1,
            max_retries: 3,
        };
        assert!(!task.is_terminal());
        task.retry_count = 3;
        assert!(task.is_terminal());
    }
}
