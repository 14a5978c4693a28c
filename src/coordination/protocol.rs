//! The transactional facade over the event log and its projections.
//!
//! Every mutation follows the same shape: acquire the log lock, load the current
//! state (rebuilding the projections if they lag the log or cannot be read),
//! validate the precondition, append the resulting events, publish the projections
//! via write-temp-then-rename, release the lock. Only one named lock is ever held by
//! an operation, so there is no lock ordering to get wrong.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn, Instrument};

use super::errors::{CoordinationError, Result};
use super::event_log::{ArchiveFile, EventLog};
use super::events::*;
use super::lock::{LockGuard, LockManager};
use super::projections::{CoordinationState, ProjectionProblem, Projections};
use super::types::{AgentRecord, AgentStatus, DeregisterReason, Task, TaskStatus};
use crate::config::CoordinationConfig;
use crate::telemetry::create_coordination_span;

pub const EVENT_LOG_FILE: &str = "event-log.jsonl";
pub const TASK_QUEUE_FILE: &str = "task-queue.json";
pub const AGENT_REGISTRY_FILE: &str = "agent-registry.json";
pub const SNAPSHOT_FILE: &str = "snapshot.json";
pub const LOCKS_DIR: &str = "locks";
pub const ARCHIVE_DIR: &str = "archive";
pub const BACKUPS_DIR: &str = "backups";
pub const WORKSPACES_DIR: &str = "workspaces";

/// On-disk layout of a coordination root
#[derive(Debug, Clone)]
pub struct CoordinationPaths {
    pub base: PathBuf,
}

impl CoordinationPaths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn event_log(&self) -> PathBuf {
        self.base.join(EVENT_LOG_FILE)
    }

    pub fn task_queue(&self) -> PathBuf {
        self.base.join(TASK_QUEUE_FILE)
    }

    pub fn agent_registry(&self) -> PathBuf {
        self.base.join(AGENT_REGISTRY_FILE)
    }

    pub fn snapshot(&self) -> PathBuf {
        self.base.join(SNAPSHOT_FILE)
    }

    pub fn locks(&self) -> PathBuf {
        self.base.join(LOCKS_DIR)
    }

    pub fn archive(&self) -> PathBuf {
        self.base.join(ARCHIVE_DIR)
    }

    pub fn backups(&self) -> PathBuf {
        self.base.join(BACKUPS_DIR)
    }

    pub fn workspaces(&self) -> PathBuf {
        self.base.join(WORKSPACES_DIR)
    }

    pub fn workspace(&self, task_type: &str) -> PathBuf {
        self.workspaces().join(task_type)
    }

    /// Directories that must exist for the protocol to operate
    pub fn required_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.base.clone(),
            self.locks(),
            self.archive(),
            self.backups(),
            self.workspaces(),
        ]
    }
}

/// Timing and compaction knobs
#[derive(Debug, Clone)]
pub struct ProtocolOptions {
    pub heartbeat_timeout: Duration,
    pub lock_timeout: Duration,
    pub lock_stale_after: Duration,
    pub archive_threshold: usize,
    pub archive_retain: usize,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        (&CoordinationConfig::default()).into()
    }
}

impl From<&CoordinationConfig> for ProtocolOptions {
    fn from(config: &CoordinationConfig) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout(),
            lock_timeout: config.lock_timeout(),
            lock_stale_after: config.lock_stale_after(),
            archive_threshold: config.archive_threshold,
            archive_retain: config.archive_retain,
        }
    }
}

/// Input for [`CoordinationProtocol::create_task`]
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub task_type: String,
    pub description: String,
    pub context: Option<String>,
    pub priority: i32,
    pub dependencies: Vec<String>,
    pub max_retries: u32,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            description: description.into(),
            context: None,
            priority: 1,
            dependencies: Vec::new(),
            max_retries: 3,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.push(task_id.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Result or error attached to a status change
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TaskOutcome {
    #[default]
    None,
    Result(serde_json::Value),
    Error(String),
}

/// Input for [`CoordinationProtocol::register_agent`]
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub agent_type: String,
    pub pid: u32,
    pub restart_count: u32,
    pub replaces: Option<String>,
}

impl AgentRegistration {
    pub fn new(agent_id: impl Into<String>, agent_type: impl Into<String>, pid: u32) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: agent_type.into(),
            pid,
            restart_count: 0,
            replaces: None,
        }
    }
}

/// What happened to an agent's tasks when it was released
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReleasedTasks {
    pub requeued: Vec<String>,
    /// Tasks whose retries ran out and are now terminally Failed
    pub exhausted: Vec<String>,
}

/// Outcome of reaping an agent with a stale heartbeat
#[derive(Debug, Clone, PartialEq)]
pub struct ReapOutcome {
    pub agent: AgentRecord,
    pub tasks: ReleasedTasks,
}

/// Summary of a projection rebuild
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuildReport {
    pub last_sequence: u64,
    pub events_replayed: usize,
    pub skipped_lines: usize,
    pub tasks: usize,
    pub agents: usize,
}

/// Health of the on-disk projections relative to the log
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProjectionHealth {
    Current { last_sequence: u64 },
    Lagging { projection: u64, log: u64 },
    Unreadable { reason: String },
}

struct Mutation<T> {
    events: Vec<EventKind>,
    output: T,
}

impl<T> Mutation<T> {
    fn none(output: T) -> Self {
        Self {
            events: Vec::new(),
            output,
        }
    }
}

/// Generate an agent id of the form `<type>-agent-<8 hex>`
pub fn new_agent_id(agent_type: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{agent_type}-agent-{}", &id[..8])
}

#[derive(Debug, Clone)]
pub struct CoordinationProtocol {
    paths: CoordinationPaths,
    log: EventLog,
    locks: LockManager,
    projections: Projections,
    options: ProtocolOptions,
}

impl CoordinationProtocol {
    pub fn new(base_path: impl Into<PathBuf>, options: ProtocolOptions) -> Self {
        let paths = CoordinationPaths::new(base_path);
        let locks = LockManager::new(paths.locks(), options.lock_stale_after);
        let log = EventLog::new(
            paths.event_log(),
            paths.archive(),
            locks.clone(),
            options.lock_timeout,
        );
        let projections = Projections::new(
            paths.task_queue(),
            paths.agent_registry(),
            paths.snapshot(),
        );
        Self {
            paths,
            log,
            locks,
            projections,
            options,
        }
    }

    pub fn from_config(config: &CoordinationConfig) -> Self {
        Self::new(&config.base_path, config.into())
    }

    pub fn paths(&self) -> &CoordinationPaths {
        &self.paths
    }

    pub fn base_path(&self) -> &Path {
        &self.paths.base
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn projections(&self) -> &Projections {
        &self.projections
    }

    pub fn options(&self) -> &ProtocolOptions {
        &self.options
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.options.heartbeat_timeout
    }

    /// Create the directory structure and the log, and publish projections if absent
    pub async fn init(&self) -> Result<()> {
        for dir in self.paths.required_dirs() {
            fs::create_dir_all(&dir).await?;
        }
        self.log.ensure_exists().await?;
        if let Err(problem) = self.projections.load().await? {
            debug!(?problem, "Publishing initial projections");
            self.repair_coordination_state().await?;
        }
        Ok(())
    }

    /// Ensure the per-type workspace directory exists and return it
    pub async fn workspace_for(&self, task_type: &str) -> Result<PathBuf> {
        let dir = self.paths.workspace(task_type);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    pub async fn create_task(&self, new_task: NewTask) -> Result<String> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let span_task = task_id.clone();
        let (id, _) = self
            .transact("create_task", None, Some(&span_task), |state| {
                for dep in &new_task.dependencies {
                    if state.task(dep).is_none() {
                        warn!(task_id = %task_id, dependency = %dep, "Task depends on an unknown task and will stay blocked until it exists");
                    }
                }
                Ok(Mutation {
                    events: vec![EventKind::TaskCreated(TaskCreated {
                        task_id: task_id.clone(),
                        task_type: new_task.task_type.clone(),
                        description: new_task.description.clone(),
                        context: new_task.context.clone(),
                        priority: new_task.priority,
                        dependencies: new_task.dependencies.clone(),
                        max_retries: new_task.max_retries,
                    })],
                    output: task_id.clone(),
                })
            })
            .await?;
        info!(task_id = %id, task_type = %new_task.task_type, priority = new_task.priority, "Task created");
        Ok(id)
    }

    /// Give `agent_id` exclusive ownership of a Pending, dependency-satisfied task.
    ///
    /// Returns false when any precondition fails. The check and the append happen under
    /// the same lock, so at most one claim per task ever succeeds.
    pub async fn claim_task(&self, task_id: &str, agent_id: &str) -> Result<bool> {
        let now = Utc::now();
        let timeout = self.options.heartbeat_timeout;
        let (claimed, _) = self
            .transact("claim_task", Some(agent_id), Some(task_id), |state| {
                let Some(task) = state.task(task_id) else {
                    return Ok(Mutation::none(false));
                };
                if task.status != TaskStatus::Pending
                    || task.assigned_agent_id.is_some()
                    || !state.dependencies_satisfied(task)
                {
                    return Ok(Mutation::none(false));
                }
                if let Some(agent) = state.agents.get(agent_id) {
                    if agent.effective_status(now, timeout) == AgentStatus::Dead
                        || agent.current_task_id.is_some()
                    {
                        return Ok(Mutation::none(false));
                    }
                }
                Ok(Mutation {
                    events: vec![EventKind::TaskAssigned(TaskAssigned {
                        task_id: task_id.to_string(),
                        agent_id: agent_id.to_string(),
                    })],
                    output: true,
                })
            })
            .await?;
        if claimed {
            info!(task_id = %task_id, agent_id = %agent_id, "Task claimed");
        } else {
            debug!(task_id = %task_id, agent_id = %agent_id, "Claim rejected");
        }
        Ok(claimed)
    }

    /// Assigned -> InProgress for the owning agent
    pub async fn start_task(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let (_, state) = self
            .transact("start_task", Some(agent_id), Some(task_id), |state| {
                let task = owned_task(state, task_id, agent_id)?;
                match task.status {
                    TaskStatus::InProgress => Ok(Mutation::none(())),
                    TaskStatus::Assigned => Ok(Mutation {
                        events: vec![started(task_id, agent_id)],
                        output: (),
                    }),
                    from => Err(CoordinationError::InvalidTransition {
                        task_id: task_id.to_string(),
                        from,
                        to: TaskStatus::InProgress,
                    }),
                }
            })
            .await?;
        task_from(&state, task_id)
    }

    /// Generic status change.
    ///
    /// `Assigned` is only reachable through [`claim_task`](Self::claim_task). Moving a
    /// Failed task back to Pending consumes one retry and is refused once retries are
    /// exhausted.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        outcome: TaskOutcome,
    ) -> Result<Task> {
        let (_, state) = self
            .transact("update_task_status", None, Some(task_id), |state| {
                let task = state
                    .task(task_id)
                    .ok_or_else(|| CoordinationError::TaskNotFound(task_id.to_string()))?;
                let invalid = || CoordinationError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: task.status,
                    to: status,
                };
                if status == TaskStatus::Assigned || !task.status.can_transition_to(status) {
                    return Err(invalid());
                }
                if task.status == TaskStatus::Failed && !task.can_retry() {
                    return Err(invalid());
                }

                let agent_id = task.assigned_agent_id.clone();
                let event = match status {
                    TaskStatus::Completed => EventKind::TaskCompleted(TaskCompleted {
                        task_id: task_id.to_string(),
                        agent_id,
                        result: match outcome {
                            TaskOutcome::Result(ref value) => value.clone(),
                            _ => serde_json::Value::Null,
                        },
                    }),
                    TaskStatus::Failed => EventKind::TaskFailed(TaskFailed {
                        task_id: task_id.to_string(),
                        agent_id,
                        error: match outcome {
                            TaskOutcome::Error(ref error) => error.clone(),
                            _ => "failed without an error message".to_string(),
                        },
                    }),
                    _ => {
                        let retry_count = (status == TaskStatus::Pending).then(|| {
                            if task.status == TaskStatus::Failed {
                                task.retry_count + 1
                            } else {
                                task.retry_count
                            }
                        });
                        EventKind::TaskUpdated(TaskUpdated {
                            task_id: task_id.to_string(),
                            status,
                            agent_id,
                            retry_count,
                            reason: match outcome {
                                TaskOutcome::Error(ref error) => Some(error.clone()),
                                _ => None,
                            },
                        })
                    }
                };
                Ok(Mutation {
                    events: vec![event],
                    output: (),
                })
            })
            .await?;
        let task = task_from(&state, task_id)?;
        info!(task_id = %task_id, status = %task.status, "Task status updated");
        Ok(task)
    }

    /// Complete a task owned by `agent_id`. An Assigned task is started first in the
    /// same transaction.
    pub async fn complete_task(
        &self,
        task_id: &str,
        agent_id: &str,
        result: serde_json::Value,
    ) -> Result<Task> {
        let (_, state) = self
            .transact("complete_task", Some(agent_id), Some(task_id), |state| {
                let task = owned_task(state, task_id, agent_id)?;
                let mut events = Vec::new();
                match task.status {
                    TaskStatus::Assigned => events.push(started(task_id, agent_id)),
                    TaskStatus::InProgress => {}
                    from => {
                        return Err(CoordinationError::InvalidTransition {
                            task_id: task_id.to_string(),
                            from,
                            to: TaskStatus::Completed,
                        })
                    }
                }
                events.push(EventKind::TaskCompleted(TaskCompleted {
                    task_id: task_id.to_string(),
                    agent_id: Some(agent_id.to_string()),
                    result: result.clone(),
                }));
                Ok(Mutation { events, output: () })
            })
            .await?;
        info!(task_id = %task_id, agent_id = %agent_id, "Task completed");
        task_from(&state, task_id)
    }

    /// Report failure of a task owned by `agent_id`. Whether it runs again is the
    /// orchestrator's retry policy.
    pub async fn fail_task(&self, task_id: &str, agent_id: &str, error: &str) -> Result<Task> {
        let (_, state) = self
            .transact("fail_task", Some(agent_id), Some(task_id), |state| {
                let task = owned_task(state, task_id, agent_id)?;
                if !task.status.is_active() {
                    return Err(CoordinationError::InvalidTransition {
                        task_id: task_id.to_string(),
                        from: task.status,
                        to: TaskStatus::Failed,
                    });
                }
                Ok(Mutation {
                    events: vec![EventKind::TaskFailed(TaskFailed {
                        task_id: task_id.to_string(),
                        agent_id: Some(agent_id.to_string()),
                        error: error.to_string(),
                    })],
                    output: (),
                })
            })
            .await?;
        let task = task_from(&state, task_id)?;
        if task.can_retry() {
            info!(task_id = %task_id, agent_id = %agent_id, error = %error, "Task failed");
        } else {
            warn!(task_id = %task_id, agent_id = %agent_id, error = %error, retries = task.retry_count, "Task failed with retries exhausted");
        }
        Ok(task)
    }

    pub async fn cancel_task(&self, task_id: &str, reason: Option<&str>) -> Result<Task> {
        let outcome = reason
            .map(|r| TaskOutcome::Error(r.to_string()))
            .unwrap_or_default();
        self.update_task_status(task_id, TaskStatus::Cancelled, outcome)
            .await
    }

    /// Move a retryable Failed task back to Pending. Returns None when the task is not
    /// Failed or has no retries left.
    pub async fn retry_failed_task(&self, task_id: &str) -> Result<Option<Task>> {
        let (retried, state) = self
            .transact("retry_failed_task", None, Some(task_id), |state| {
                let task = state
                    .task(task_id)
                    .ok_or_else(|| CoordinationError::TaskNotFound(task_id.to_string()))?;
                if task.status != TaskStatus::Failed || !task.can_retry() {
                    return Ok(Mutation::none(false));
                }
                Ok(Mutation {
                    events: vec![EventKind::TaskUpdated(TaskUpdated {
                        task_id: task_id.to_string(),
                        status: TaskStatus::Pending,
                        agent_id: None,
                        retry_count: Some(task.retry_count + 1),
                        reason: task.error.clone(),
                    })],
                    output: true,
                })
            })
            .await?;
        if !retried {
            return Ok(None);
        }
        let task = task_from(&state, task_id)?;
        info!(task_id = %task_id, retry = task.retry_count, max_retries = task.max_retries, "Task requeued for retry");
        Ok(Some(task))
    }

    /// Register an agent. Re-registering a live agent with the same pid is a no-op; a
    /// new pid under a known id keeps the restart count and task counters.
    pub async fn register_agent(&self, registration: AgentRegistration) -> Result<AgentRecord> {
        let agent_id = registration.agent_id.clone();
        let (_, state) = self
            .transact("register_agent", Some(&agent_id), None, |state| {
                let mut restart_count = registration.restart_count;
                if let Some(existing) = state.agents.get(&registration.agent_id) {
                    if existing.status != AgentStatus::Dead
                        && existing.pid == registration.pid
                        && existing.agent_type == registration.agent_type
                    {
                        return Ok(Mutation::none(()));
                    }
                    restart_count = restart_count.max(existing.restart_count);
                }
                Ok(Mutation {
                    events: vec![EventKind::AgentRegistered(AgentRegistered {
                        agent_id: registration.agent_id.clone(),
                        agent_type: registration.agent_type.clone(),
                        pid: registration.pid,
                        restart_count,
                        replaces: registration.replaces.clone(),
                    })],
                    output: (),
                })
            })
            .await?;
        let agent = agent_from(&state, &agent_id)?;
        info!(agent_id = %agent_id, agent_type = %agent.agent_type, pid = agent.pid, restart_count = agent.restart_count, "Agent registered");
        Ok(agent)
    }

    /// Refresh an agent's liveness. A reaped (Dead) agent gets its record back unchanged
    /// so the caller can stop working.
    pub async fn heartbeat(&self, agent_id: &str, current_task_id: Option<&str>) -> Result<AgentRecord> {
        let (_, state) = self
            .transact("heartbeat", Some(agent_id), current_task_id, |state| {
                let agent = state
                    .agents
                    .get(agent_id)
                    .ok_or_else(|| CoordinationError::AgentNotFound(agent_id.to_string()))?;
                if agent.status == AgentStatus::Dead {
                    return Ok(Mutation::none(()));
                }
                Ok(Mutation {
                    events: vec![EventKind::AgentHeartbeat(AgentHeartbeat {
                        agent_id: agent_id.to_string(),
                        current_task_id: current_task_id.map(str::to_string),
                    })],
                    output: (),
                })
            })
            .await?;
        agent_from(&state, agent_id)
    }

    /// Remove an agent from the registry, releasing any task it still owns.
    ///
    /// An `Exited` agent that still owns work consumes a retry for it; `Shutdown` and
    /// `Removed` requeue without charging the task.
    pub async fn deregister_agent(
        &self,
        agent_id: &str,
        reason: DeregisterReason,
    ) -> Result<ReleasedTasks> {
        let (released, _) = self
            .transact("deregister_agent", Some(agent_id), None, |state| {
                if !state.agents.contains_key(agent_id) {
                    return Err(CoordinationError::AgentNotFound(agent_id.to_string()));
                }
                let count_retry = matches!(
                    reason,
                    DeregisterReason::Exited | DeregisterReason::HeartbeatTimeout
                );
                let (mut events, released) =
                    release_agent_tasks(state, agent_id, count_retry, &format!("agent {agent_id} {}", reason_text(reason)));
                events.push(EventKind::AgentDeregistered(AgentDeregistered {
                    agent_id: agent_id.to_string(),
                    reason,
                }));
                Ok(Mutation {
                    events,
                    output: released,
                })
            })
            .await?;
        info!(agent_id = %agent_id, ?reason, requeued = released.requeued.len(), "Agent deregistered");
        Ok(released)
    }

    /// Mark an agent with a stale heartbeat as Dead and release its task (charging a
    /// retry). Returns None if the agent is alive, already Dead, or unknown.
    pub async fn reap_agent(&self, agent_id: &str, now: DateTime<Utc>) -> Result<Option<ReapOutcome>> {
        let timeout = self.options.heartbeat_timeout;
        let (released, state) = self
            .transact("reap_agent", Some(agent_id), None, |state| {
                let Some(agent) = state.agents.get(agent_id) else {
                    return Ok(Mutation::none(None));
                };
                if agent.status == AgentStatus::Dead
                    || agent.effective_status(now, timeout) != AgentStatus::Dead
                {
                    return Ok(Mutation::none(None));
                }
                let (mut events, released) = release_agent_tasks(
                    state,
                    agent_id,
                    true,
                    &format!("agent {agent_id} missed heartbeats"),
                );
                events.push(EventKind::AgentDeregistered(AgentDeregistered {
                    agent_id: agent_id.to_string(),
                    reason: DeregisterReason::HeartbeatTimeout,
                }));
                Ok(Mutation {
                    events,
                    output: Some(released),
                })
            })
            .await?;

        let Some(tasks) = released else {
            return Ok(None);
        };
        let agent = agent_from(&state, agent_id)?;
        warn!(
            agent_id = %agent_id,
            heartbeat_age_ms = agent.heartbeat_age(now).as_millis() as u64,
            requeued = ?tasks.requeued,
            exhausted = ?tasks.exhausted,
            "Agent reaped after heartbeat timeout"
        );
        Ok(Some(ReapOutcome { agent, tasks }))
    }

    /// Discard the projections, replay the log from empty, and publish fresh projections.
    ///
    /// Idempotent and deterministic: the same log always yields byte-identical files.
    pub async fn repair_coordination_state(&self) -> Result<RebuildReport> {
        let span = create_coordination_span("repair_coordination_state", None, None);
        async {
            let guard = self.log.lock(&lock_holder()).await?;
            let rebuilt = self.rebuild_locked().await;
            guard.release().await?;
            let (state, report) = rebuilt?;
            info!(
                last_sequence = state.last_sequence,
                events = report.events_replayed,
                skipped = report.skipped_lines,
                "Coordination state rebuilt from the event log"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Current state from the projections, rebuilding them if unreadable. Lock-free on
    /// the happy path.
    pub async fn state(&self) -> Result<CoordinationState> {
        match self.projections.load().await? {
            Ok(state) => Ok(state),
            Err(problem) => {
                warn!(?problem, "Projection unusable on read; rebuilding from the event log");
                self.repair_coordination_state().await?;
                self.projections
                    .load()
                    .await?
                    .map_err(ProjectionProblem::into_error)
            }
        }
    }

    pub async fn tasks(&self) -> Result<Vec<Task>> {
        Ok(self.state().await?.tasks.into_values().collect())
    }

    pub async fn agents(&self) -> Result<Vec<AgentRecord>> {
        Ok(self.state().await?.agents.into_values().collect())
    }

    pub async fn task(&self, task_id: &str) -> Result<Task> {
        task_from(&self.state().await?, task_id)
    }

    pub async fn agent(&self, agent_id: &str) -> Result<AgentRecord> {
        agent_from(&self.state().await?, agent_id)
    }

    /// Pending, dependency-satisfied tasks of one type in dispatch order
    pub async fn available_tasks(&self, task_type: &str) -> Result<Vec<Task>> {
        let state = self.state().await?;
        Ok(state
            .available_tasks(task_type)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Tasks currently assigned to (or being worked on by) an agent
    pub async fn tasks_for_agent(&self, agent_id: &str) -> Result<Vec<Task>> {
        let state = self.state().await?;
        Ok(state
            .tasks_for_agent(agent_id)
            .into_iter()
            .cloned()
            .collect())
    }

    /// The newest `limit` events of the live log
    pub async fn recent_events(&self, limit: usize) -> Result<Vec<Event>> {
        let mut events = self.log.read_all().await?.events;
        let skip = events.len().saturating_sub(limit);
        Ok(events.split_off(skip))
    }

    pub async fn projection_health(&self) -> Result<ProjectionHealth> {
        let log = self.log.last_sequence().await?.unwrap_or(0);
        Ok(match self.projections.load().await? {
            Ok(state) if state.last_sequence == log => ProjectionHealth::Current {
                last_sequence: log,
            },
            Ok(state) => ProjectionHealth::Lagging {
                projection: state.last_sequence,
                log,
            },
            Err(problem) => ProjectionHealth::Unreadable {
                reason: format!("{}", problem.into_error()),
            },
        })
    }

    /// Archive the log prefix now if the live log is over the threshold
    pub async fn compact(&self) -> Result<Option<ArchiveFile>> {
        let guard = self.log.lock(&lock_holder()).await?;
        let compacted = self.compact_locked(&guard).await;
        guard.release().await?;
        compacted
    }

    async fn transact<T>(
        &self,
        operation: &'static str,
        agent_id: Option<&str>,
        task_id: Option<&str>,
        plan: impl FnOnce(&CoordinationState) -> Result<Mutation<T>>,
    ) -> Result<(T, CoordinationState)> {
        let span = create_coordination_span(operation, agent_id, task_id);
        async {
            let guard = self.log.lock(&lock_holder()).await?;
            let applied = self.apply_locked(&guard, plan).await;
            let released = guard.release().await;
            let applied = applied?;
            released?;
            Ok(applied)
        }
        .instrument(span)
        .await
    }

    async fn apply_locked<T>(
        &self,
        guard: &LockGuard,
        plan: impl FnOnce(&CoordinationState) -> Result<Mutation<T>>,
    ) -> Result<(T, CoordinationState)> {
        let mut state = self.load_locked().await?;
        let Mutation { events, output } = plan(&state)?;
        if events.is_empty() {
            return Ok((output, state));
        }

        for kind in events {
            let event = self.log.append_locked(guard, kind).await?;
            state.apply(&event);
        }
        self.projections.write(&state).await?;

        if let Err(e) = self.compact_locked(guard).await {
            warn!(error = %e, "Event log compaction failed; will retry on a later write");
        }
        Ok((output, state))
    }

    /// State as of the log head. Requires the log lock.
    async fn load_locked(&self) -> Result<CoordinationState> {
        let head = self.log.last_sequence().await?.unwrap_or(0);
        match self.projections.load().await? {
            Ok(state) if state.last_sequence == head => return Ok(state),
            Ok(state) => warn!(
                projection = state.last_sequence,
                log = head,
                "Projections out of step with the event log; rebuilding"
            ),
            Err(problem) => warn!(?problem, "Projections unusable; rebuilding"),
        }
        Ok(self.rebuild_locked().await?.0)
    }

    async fn rebuild_locked(&self) -> Result<(CoordinationState, RebuildReport)> {
        self.projections.discard().await?;
        let (state, events_replayed, skipped_lines) = self.replay_through(u64::MAX).await?;
        self.projections.write(&state).await?;
        let report = RebuildReport {
            last_sequence: state.last_sequence,
            events_replayed,
            skipped_lines,
            tasks: state.tasks.len(),
            agents: state.agents.len(),
        };
        Ok((state, report))
    }

    /// Replay snapshot + live log (or the full archive history when the snapshot is
    /// missing or does not reach the live log) up to and including `limit`.
    async fn replay_through(&self, limit: u64) -> Result<(CoordinationState, usize, usize)> {
        let live = self.log.read_all().await?;
        let first_live = live.events.first().map(|e| e.sequence_id);
        let has_archives = !self.log.list_archives().await?.is_empty();

        let base = match self.projections.read_snapshot().await? {
            Ok(Some(snapshot))
                if first_live.map_or(true, |first| first <= snapshot.state.last_sequence + 1) =>
            {
                Some(snapshot.state)
            }
            Ok(Some(snapshot)) => {
                warn!(
                    snapshot = snapshot.state.last_sequence,
                    first_live = ?first_live,
                    "Snapshot does not reach the live log; replaying archives"
                );
                None
            }
            Ok(None) if !has_archives => Some(CoordinationState::default()),
            Ok(None) => None,
            Err(problem) => {
                warn!(?problem, "Snapshot unreadable; replaying archives");
                None
            }
        };

        let (mut state, events, skipped) = match base {
            Some(state) => {
                let skipped = live.skipped();
                (state, live.events, skipped)
            }
            None => {
                let history = self.log.read_history().await?;
                let skipped = history.skipped();
                (CoordinationState::default(), history.events, skipped)
            }
        };

        let mut replayed = 0usize;
        for event in events.iter().take_while(|e| e.sequence_id <= limit) {
            if event.sequence_id > state.last_sequence {
                state.apply(event);
                replayed += 1;
            }
        }
        Ok((state, replayed, skipped))
    }

    /// Archive everything but the newest `archive_retain` events once the live log
    /// exceeds `archive_threshold`. Order: archive, snapshot, truncate; a crash between
    /// steps leaves overlapping but consistent data.
    async fn compact_locked(&self, guard: &LockGuard) -> Result<Option<ArchiveFile>> {
        if self.options.archive_threshold == 0 {
            return Ok(None);
        }
        let live = self.log.read_all().await?;
        if live.events.len() <= self.options.archive_threshold {
            return Ok(None);
        }

        let cut = live.events.len().saturating_sub(self.options.archive_retain);
        let prefix = &live.events[..cut];
        let Some(cut_sequence) = prefix.last().map(|e| e.sequence_id) else {
            return Ok(None);
        };

        let (snapshot, _, _) = self.replay_through(cut_sequence).await?;
        let archive = self.log.write_archive(prefix).await?;
        self.projections.write_snapshot(&snapshot).await?;
        let kept = self.log.retain_after(guard, cut_sequence).await?;
        info!(through = cut_sequence, kept, "Event log compacted");
        Ok(archive)
    }
}

fn lock_holder() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("pid{}-{}", std::process::id(), &id[..8])
}

fn started(task_id: &str, agent_id: &str) -> EventKind {
    EventKind::TaskUpdated(TaskUpdated {
        task_id: task_id.to_string(),
        status: TaskStatus::InProgress,
        agent_id: Some(agent_id.to_string()),
        retry_count: None,
        reason: None,
    })
}

fn owned_task<'a>(state: &'a CoordinationState, task_id: &str, agent_id: &str) -> Result<&'a Task> {
    let task = state
        .task(task_id)
        .ok_or_else(|| CoordinationError::TaskNotFound(task_id.to_string()))?;
    if task.assigned_agent_id.as_deref() != Some(agent_id) {
        return Err(CoordinationError::NotAssigned {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
        });
    }
    Ok(task)
}

fn task_from(state: &CoordinationState, task_id: &str) -> Result<Task> {
    state
        .task(task_id)
        .cloned()
        .ok_or_else(|| CoordinationError::TaskNotFound(task_id.to_string()))
}

fn agent_from(state: &CoordinationState, agent_id: &str) -> Result<AgentRecord> {
    state
        .agents
        .get(agent_id)
        .cloned()
        .ok_or_else(|| CoordinationError::AgentNotFound(agent_id.to_string()))
}

fn reason_text(reason: DeregisterReason) -> &'static str {
    match reason {
        DeregisterReason::Exited => "exited",
        DeregisterReason::HeartbeatTimeout => "missed heartbeats",
        DeregisterReason::Removed => "was removed",
        DeregisterReason::Shutdown => "was shut down",
    }
}

/// Events that hand an agent's active tasks back to the queue, or fail them once
/// retries run out
fn release_agent_tasks(
    state: &CoordinationState,
    agent_id: &str,
    count_retry: bool,
    reason: &str,
) -> (Vec<EventKind>, ReleasedTasks) {
    let mut events = Vec::new();
    let mut released = ReleasedTasks::default();
    for task in state.tasks_for_agent(agent_id) {
        let retry_count = if count_retry {
            task.retry_count + 1
        } else {
            task.retry_count
        };
        if retry_count > task.max_retries {
            warn!(task_id = %task.id, retries = task.retry_count, "Retries exhausted; task failed");
            events.push(EventKind::TaskFailed(TaskFailed {
                task_id: task.id.clone(),
                agent_id: Some(agent_id.to_string()),
                error: format!("{reason}; retries exhausted"),
            }));
            released.exhausted.push(task.id.clone());
        } else {
            events.push(EventKind::TaskUpdated(TaskUpdated {
                task_id: task.id.clone(),
                status: TaskStatus::Pending,
                agent_id: Some(agent_id.to_string()),
                retry_count: Some(retry_count),
                reason: Some(reason.to_string()),
            }));
            released.requeued.push(task.id.clone());
        }
    }
    (events, released)
}
