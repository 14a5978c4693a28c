//! Materialized views derived from the event log.
//!
//! `task-queue.json` and `agent-registry.json` are caches: both are rebuilt from the
//! log at any time and carry the `last_sequence` they reflect. Serialization uses
//! sorted maps and only event-derived values, so replaying the same events always
//! produces byte-identical files.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use super::errors::{CoordinationError, Result};
use super::events::{Event, EventKind};
use super::types::{AgentRecord, AgentStatus, DeregisterReason, Task, TaskStatus};
use crate::fs::{atomic_write, read_json_with_retry, JsonRead};

pub const PROJECTION_VERSION: u32 = 1;
const READ_ATTEMPTS: u32 = 3;

/// In-memory coordination state: the fold of every event up to `last_sequence`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinationState {
    pub last_sequence: u64,
    pub tasks: BTreeMap<String, Task>,
    pub agents: BTreeMap<String, AgentRecord>,
}

impl CoordinationState {
    /// Fold a sequence of events onto an empty state
    pub fn replay<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut state = Self::default();
        state.apply_all(events);
        state
    }

    pub fn apply_all<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>) {
        for event in events {
            self.apply(event);
        }
    }

    /// Apply one event. Events at or below `last_sequence` are ignored, which makes
    /// replaying a snapshot plus an overlapping log tail safe.
    pub fn apply(&mut self, event: &Event) {
        if event.sequence_id <= self.last_sequence {
            return;
        }
        self.last_sequence = event.sequence_id;
        let at = event.timestamp;

        match &event.kind {
            EventKind::TaskCreated(created) => {
                if self.tasks.contains_key(&created.task_id) {
                    warn!(task_id = %created.task_id, "Duplicate task_created ignored");
                    return;
                }
                self.tasks.insert(
                    created.task_id.clone(),
                    Task {
                        id: created.task_id.clone(),
                        task_type: created.task_type.clone(),
                        description: created.description.clone(),
                        context: created.context.clone(),
                        priority: created.priority,
                        status: TaskStatus::Pending,
                        created_at: at,
                        updated_at: at,
                        created_seq: event.sequence_id,
                        assigned_agent_id: None,
                        dependencies: created.dependencies.clone(),
                        result: None,
                        error: None,
                        retry_count: 0,
                        max_retries: created.max_retries,
                    },
                );
            }
            EventKind::TaskAssigned(assigned) => {
                if !self.transition(&assigned.task_id, TaskStatus::Assigned, event) {
                    return;
                }
                if let Some(task) = self.tasks.get_mut(&assigned.task_id) {
                    task.assigned_agent_id = Some(assigned.agent_id.clone());
                }
                if let Some(agent) = self.agents.get_mut(&assigned.agent_id) {
                    if agent.status != AgentStatus::Dead {
                        agent.status = AgentStatus::Busy;
                        agent.current_task_id = Some(assigned.task_id.clone());
                    }
                }
            }
            EventKind::TaskUpdated(updated) => {
                if !self.transition(&updated.task_id, updated.status, event) {
                    return;
                }
                if let Some(task) = self.tasks.get_mut(&updated.task_id) {
                    if let Some(retry_count) = updated.retry_count {
                        task.retry_count = retry_count;
                    }
                    if updated.status == TaskStatus::Pending {
                        task.assigned_agent_id = None;
                    }
                    if let Some(reason) = &updated.reason {
                        task.error = Some(reason.clone());
                    }
                }
                if !updated.status.is_active() {
                    self.release_agent_of(&updated.task_id);
                }
            }
            EventKind::TaskCompleted(completed) => {
                if !self.transition(&completed.task_id, TaskStatus::Completed, event) {
                    return;
                }
                if let Some(task) = self.tasks.get_mut(&completed.task_id) {
                    task.result = Some(completed.result.clone());
                    task.error = None;
                }
                if let Some(agent) = self.release_agent_of(&completed.task_id) {
                    agent.tasks_completed += 1;
                }
            }
            EventKind::TaskFailed(failed) => {
                if !self.transition(&failed.task_id, TaskStatus::Failed, event) {
                    return;
                }
                if let Some(task) = self.tasks.get_mut(&failed.task_id) {
                    task.error = Some(failed.error.clone());
                }
                if let Some(agent) = self.release_agent_of(&failed.task_id) {
                    agent.tasks_failed += 1;
                }
            }
            EventKind::AgentRegistered(registered) => {
                if let Some(replaced) = &registered.replaces {
                    self.agents.remove(replaced);
                }
                let current_task_id = self
                    .tasks
                    .values()
                    .find(|t| {
                        t.status.is_active()
                            && t.assigned_agent_id.as_deref() == Some(registered.agent_id.as_str())
                    })
                    .map(|t| t.id.clone());
                let status = if current_task_id.is_some() {
                    AgentStatus::Busy
                } else {
                    AgentStatus::Idle
                };
                // Re-registration under the same id keeps the record's history
                let (restart_count, tasks_completed, tasks_failed) = self
                    .agents
                    .get(&registered.agent_id)
                    .map(|previous| {
                        (
                            previous.restart_count.max(registered.restart_count),
                            previous.tasks_completed,
                            previous.tasks_failed,
                        )
                    })
                    .unwrap_or((registered.restart_count, 0, 0));
                self.agents.insert(
                    registered.agent_id.clone(),
                    AgentRecord {
                        id: registered.agent_id.clone(),
                        agent_type: registered.agent_type.clone(),
                        pid: registered.pid,
                        status,
                        current_task_id,
                        last_heartbeat: at,
                        started_at: at,
                        restart_count,
                        tasks_completed,
                        tasks_failed,
                    },
                );
            }
            EventKind::AgentHeartbeat(heartbeat) => {
                if let Some(agent) = self.agents.get_mut(&heartbeat.agent_id) {
                    if agent.status != AgentStatus::Dead {
                        agent.last_heartbeat = at;
                    }
                }
            }
            EventKind::AgentDeregistered(deregistered) => match deregistered.reason {
                DeregisterReason::HeartbeatTimeout => {
                    if let Some(agent) = self.agents.get_mut(&deregistered.agent_id) {
                        agent.status = AgentStatus::Dead;
                        agent.current_task_id = None;
                    }
                }
                DeregisterReason::Exited | DeregisterReason::Removed | DeregisterReason::Shutdown => {
                    self.agents.remove(&deregistered.agent_id);
                }
            },
        }
    }

    fn transition(&mut self, task_id: &str, next: TaskStatus, event: &Event) -> bool {
        let Some(task) = self.tasks.get_mut(task_id) else {
            debug!(task_id = %task_id, sequence_id = event.sequence_id, "Event for unknown task ignored");
            return false;
        };
        if !task.status.can_transition_to(next) {
            debug!(
                task_id = %task_id,
                from = %task.status,
                to = %next,
                sequence_id = event.sequence_id,
                "Invalid transition in log ignored"
            );
            return false;
        }
        task.status = next;
        task.updated_at = event.timestamp;
        true
    }

    fn release_agent_of(&mut self, task_id: &str) -> Option<&mut AgentRecord> {
        let agent = self
            .agents
            .values_mut()
            .find(|a| a.current_task_id.as_deref() == Some(task_id))?;
        agent.current_task_id = None;
        if agent.status == AgentStatus::Busy {
            agent.status = AgentStatus::Idle;
        }
        Some(agent)
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    /// Every dependency exists and is Completed
    pub fn dependencies_satisfied(&self, task: &Task) -> bool {
        task.dependencies.iter().all(|dep| {
            self.tasks
                .get(dep)
                .map(|d| d.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// Pending, dependency-satisfied tasks ordered by priority then creation order
    pub fn ready_tasks(&self) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && self.dependencies_satisfied(t))
            .collect();
        ready.sort_by_key(|t| (t.priority, t.created_seq));
        ready
    }

    pub fn available_tasks(&self, task_type: &str) -> Vec<&Task> {
        self.ready_tasks()
            .into_iter()
            .filter(|t| t.task_type == task_type)
            .collect()
    }

    /// Assigned or InProgress task counts keyed by task type
    pub fn active_counts_by_type(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.values().filter(|t| t.status.is_active()) {
            *counts.entry(task.task_type.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn tasks_for_agent(&self, agent_id: &str) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|t| t.status.is_active() && t.assigned_agent_id.as_deref() == Some(agent_id))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskQueueFile {
    pub version: u32,
    pub last_sequence: u64,
    pub tasks: BTreeMap<String, Task>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistryFile {
    pub version: u32,
    pub last_sequence: u64,
    pub agents: BTreeMap<String, AgentRecord>,
}

/// State at the end of the archived prefix of the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub version: u32,
    pub state: CoordinationState,
}

/// Why the on-disk projections could not be used as-is
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionProblem {
    Missing(PathBuf),
    Corrupt { path: PathBuf, reason: String },
    /// The two files reflect different points in the log
    Diverged { task_queue: u64, agent_registry: u64 },
}

impl ProjectionProblem {
    pub fn into_error(self) -> CoordinationError {
        match self {
            ProjectionProblem::Missing(path) => CoordinationError::CorruptProjection {
                path: path.display().to_string(),
                reason: "missing".to_string(),
            },
            ProjectionProblem::Corrupt { path, reason } => CoordinationError::CorruptProjection {
                path: path.display().to_string(),
                reason,
            },
            ProjectionProblem::Diverged {
                task_queue,
                agent_registry,
            } => CoordinationError::CorruptProjection {
                path: "projections".to_string(),
                reason: format!(
                    "task queue at sequence {task_queue}, agent registry at sequence {agent_registry}"
                ),
            },
        }
    }
}

/// Locations of the projection and snapshot files
#[derive(Debug, Clone)]
pub struct Projections {
    task_queue_path: PathBuf,
    agent_registry_path: PathBuf,
    snapshot_path: PathBuf,
}

impl Projections {
    pub fn new(
        task_queue_path: impl Into<PathBuf>,
        agent_registry_path: impl Into<PathBuf>,
        snapshot_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            task_queue_path: task_queue_path.into(),
            agent_registry_path: agent_registry_path.into(),
            snapshot_path: snapshot_path.into(),
        }
    }

    pub fn task_queue_path(&self) -> &Path {
        &self.task_queue_path
    }

    pub fn agent_registry_path(&self) -> &Path {
        &self.agent_registry_path
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Lock-free read of the task queue
    pub async fn read_task_queue(&self) -> Result<std::result::Result<TaskQueueFile, ProjectionProblem>> {
        Ok(
            match read_json_with_retry::<TaskQueueFile>(&self.task_queue_path, READ_ATTEMPTS).await? {
                JsonRead::Parsed(file) => Ok(file),
                JsonRead::Missing => Err(ProjectionProblem::Missing(self.task_queue_path.clone())),
                JsonRead::Corrupt(reason) => Err(ProjectionProblem::Corrupt {
                    path: self.task_queue_path.clone(),
                    reason,
                }),
            },
        )
    }

    /// Lock-free read of the agent registry
    pub async fn read_agent_registry(
        &self,
    ) -> Result<std::result::Result<AgentRegistryFile, ProjectionProblem>> {
        Ok(
            match read_json_with_retry::<AgentRegistryFile>(&self.agent_registry_path, READ_ATTEMPTS)
                .await?
            {
                JsonRead::Parsed(file) => Ok(file),
                JsonRead::Missing => Err(ProjectionProblem::Missing(self.agent_registry_path.clone())),
                JsonRead::Corrupt(reason) => Err(ProjectionProblem::Corrupt {
                    path: self.agent_registry_path.clone(),
                    reason,
                }),
            },
        )
    }

    /// Both projections combined, provided they are readable and agree on `last_sequence`
    pub async fn load(&self) -> Result<std::result::Result<CoordinationState, ProjectionProblem>> {
        let queue = match self.read_task_queue().await? {
            Ok(queue) => queue,
            Err(problem) => return Ok(Err(problem)),
        };
        let registry = match self.read_agent_registry().await? {
            Ok(registry) => registry,
            Err(problem) => return Ok(Err(problem)),
        };
        if queue.last_sequence != registry.last_sequence {
            return Ok(Err(ProjectionProblem::Diverged {
                task_queue: queue.last_sequence,
                agent_registry: registry.last_sequence,
            }));
        }
        Ok(Ok(CoordinationState {
            last_sequence: queue.last_sequence,
            tasks: queue.tasks,
            agents: registry.agents,
        }))
    }

    /// Publish both projections with write-temp-then-rename
    pub async fn write(&self, state: &CoordinationState) -> Result<()> {
        let queue = TaskQueueFile {
            version: PROJECTION_VERSION,
            last_sequence: state.last_sequence,
            tasks: state.tasks.clone(),
        };
        let registry = AgentRegistryFile {
            version: PROJECTION_VERSION,
            last_sequence: state.last_sequence,
            agents: state.agents.clone(),
        };
        publish_json(&self.task_queue_path, &queue).await?;
        publish_json(&self.agent_registry_path, &registry).await
    }

    /// Remove both projection files
    pub async fn discard(&self) -> Result<()> {
        for path in [&self.task_queue_path, &self.agent_registry_path] {
            match fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub async fn read_snapshot(&self) -> Result<std::result::Result<Option<SnapshotFile>, ProjectionProblem>> {
        Ok(
            match read_json_with_retry::<SnapshotFile>(&self.snapshot_path, READ_ATTEMPTS).await? {
                JsonRead::Parsed(snapshot) => Ok(Some(snapshot)),
                JsonRead::Missing => Ok(None),
                JsonRead::Corrupt(reason) => Err(ProjectionProblem::Corrupt {
                    path: self.snapshot_path.clone(),
                    reason,
                }),
            },
        )
    }

    pub async fn write_snapshot(&self, state: &CoordinationState) -> Result<()> {
        let snapshot = SnapshotFile {
            version: PROJECTION_VERSION,
            state: state.clone(),
        };
        publish_json(&self.snapshot_path, &snapshot).await
    }
}

async fn publish_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut body = serde_json::to_vec_pretty(value)?;
    body.push(b'\n');
    atomic_write(path, &body).await?;
    Ok(())
}
