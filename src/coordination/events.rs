//! Coordination events.
//!
//! Every coordination fact is an [`Event`] in the append-only log. Each line of
//! `event-log.jsonl` is one event serialized as
//! `{"sequence_id": N, "timestamp": "...", "type": "task_created", "payload": {...}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{DeregisterReason, TaskStatus};

/// An immutable, sequenced coordination fact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub sequence_id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated(TaskCreated),
    TaskAssigned(TaskAssigned),
    TaskUpdated(TaskUpdated),
    TaskCompleted(TaskCompleted),
    TaskFailed(TaskFailed),
    AgentRegistered(AgentRegistered),
    AgentHeartbeat(AgentHeartbeat),
    AgentDeregistered(AgentDeregistered),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCreated {
    pub task_id: String,
    pub task_type: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub priority: i32,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssigned {
    pub task_id: String,
    pub agent_id: String,
}

/// Status change that is neither completion nor failure: start, cancel, requeue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdated {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Set on requeue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompleted {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailed {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistered {
    pub agent_id: String,
    pub agent_type: String,
    pub pid: u32,
    #[serde(default)]
    pub restart_count: u32,
    /// Dead agent this registration replaces; its record is dropped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDeregistered {
    pub agent_id: String,
    pub reason: DeregisterReason,
}

impl EventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::TaskCreated(_) => "task_created",
            EventKind::TaskAssigned(_) => "task_assigned",
            EventKind::TaskUpdated(_) => "task_updated",
            EventKind::TaskCompleted(_) => "task_completed",
            EventKind::TaskFailed(_) => "task_failed",
            EventKind::AgentRegistered(_) => "agent_registered",
            EventKind::AgentHeartbeat(_) => "agent_heartbeat",
            EventKind::AgentDeregistered(_) => "agent_deregistered",
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            EventKind::TaskCreated(e) => Some(&e.task_id),
            EventKind::TaskAssigned(e) => Some(&e.task_id),
            EventKind::TaskUpdated(e) => Some(&e.task_id),
            EventKind::TaskCompleted(e) => Some(&e.task_id),
            EventKind::TaskFailed(e) => Some(&e.task_id),
            EventKind::AgentHeartbeat(e) => e.current_task_id.as_deref(),
            _ => None,
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        match self {
            EventKind::TaskAssigned(e) => Some(&e.agent_id),
            EventKind::TaskUpdated(e) => e.agent_id.as_deref(),
            EventKind::TaskCompleted(e) => e.agent_id.as_deref(),
            EventKind::TaskFailed(e) => e.agent_id.as_deref(),
            EventKind::AgentRegistered(e) => Some(&e.agent_id),
            EventKind::AgentHeartbeat(e) => Some(&e.agent_id),
            EventKind::AgentDeregistered(e) => Some(&e.agent_id),
            EventKind::TaskCreated(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_line_shape() {
        let event = Event {
            sequence_id: 7,
            timestamp: "2026-01-02T03:04:05Z".parse().unwrap(),
            kind: EventKind::TaskAssigned(TaskAssigned {
                task_id: "t1".to_string(),
                agent_id: "search-agent-1".to_string(),
            }),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["sequence_id"], 7);
        assert_eq!(value["type"], "task_assigned");
        assert_eq!(value["payload"]["task_id"], "t1");
        assert_eq!(value["payload"]["agent_id"], "search-agent-1");

        let line = serde_json::to_string(&event).unwrap();
        assert!(!line.contains('\n'));
        let parsed: Event = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_unknown_event_type_is_rejected() {
        let line = r#"{"sequence_id":1,"timestamp":"2026-01-02T03:04:05Z","type":"task_exploded","payload":{}}"#;
        assert!(serde_json::from_str::<Event>(line).is_err());
    }
}
