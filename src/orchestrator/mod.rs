//! Supervisor loop: scheduling policy and worker lifecycle on top of the protocol.
//!
//! Each tick collects exited workers, reaps agents whose heartbeat went stale
//! (spawning replacements within the restart budget), applies the retry policy to
//! failed tasks, and dispatches ready tasks subject to per-type caps and cooldowns.

pub mod process;
pub mod scheduler;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fd_lock::{RwLock, RwLockWriteGuard};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

use crate::config::TaskHiveConfig;
use crate::coordination::{
    new_agent_id, AgentRecord, AgentRegistration, AgentStatus, CoordinationError,
    CoordinationProtocol, CoordinationState, DeregisterReason, Event, ProjectionHealth,
    TaskOutcome, TaskStatus,
};
use crate::shutdown::ShutdownCoordinator;
use crate::telemetry::create_coordination_span;
use process::{ExitInfo, ProcessLauncher, SpawnSpec, WorkerProcess};
use scheduler::{Dispatch, DispatchPlanner};

pub const PID_FILE: &str = "orchestrator.pid";

/// How long a worker gets to exit after SIGTERM before it is killed
const TERMINATE_WAIT: Duration = Duration::from_secs(5);
const EXIT_POLL: Duration = Duration::from_millis(50);

struct RunningWorker {
    task_id: String,
    task_type: String,
    process: Box<dyn WorkerProcess>,
}

/// What one supervisor tick did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    /// Agents whose process exited
    pub exited: Vec<String>,
    /// Agents declared dead after a heartbeat timeout
    pub reaped: Vec<String>,
    /// Replacement agents spawned for reaped ones
    pub restarted: Vec<String>,
    /// Failed tasks put back to Pending
    pub retried: Vec<String>,
    pub dispatched: Vec<Dispatch>,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.exited.is_empty()
            && self.reaped.is_empty()
            && self.restarted.is_empty()
            && self.retried.is_empty()
            && self.dispatched.is_empty()
    }
}

pub struct Orchestrator {
    protocol: CoordinationProtocol,
    config: TaskHiveConfig,
    planner: DispatchPlanner,
    launcher: Arc<dyn ProcessLauncher>,
    workers: BTreeMap<String, RunningWorker>,
    accepting: bool,
}

impl Orchestrator {
    pub fn new(
        protocol: CoordinationProtocol,
        config: TaskHiveConfig,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        let planner = DispatchPlanner::from_config(&config);
        Self {
            protocol,
            config,
            planner,
            launcher,
            workers: BTreeMap::new(),
            accepting: true,
        }
    }

    pub fn protocol(&self) -> &CoordinationProtocol {
        &self.protocol
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Agent ids of workers this orchestrator spawned and still tracks
    pub fn worker_ids(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    /// Stop admitting new claims; in-flight work continues
    pub fn stop_accepting(&mut self) {
        if self.accepting {
            info!("Orchestrator no longer accepting new claims");
        }
        self.accepting = false;
    }

    /// Run ticks until `shutdown` fires, then shut down gracefully
    pub async fn run(&mut self, shutdown: &ShutdownCoordinator) -> Result<()> {
        info!(
            base_path = %self.protocol.base_path().display(),
            worker_types = self.config.workers.len(),
            tick_ms = self.config.orchestrator.tick_interval_ms,
            "Orchestrator started"
        );
        let mut interval = tokio::time::interval(self.config.orchestrator.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Ticks always run to completion; shutdown is only observed between them
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.wait() => break,
            }
            if let Err(e) = self.tick().await {
                warn!(error = %format!("{e:#}"), "Supervisor tick failed; retrying next tick");
            }
        }

        self.shutdown(self.config.orchestrator.shutdown_grace()).await
    }

    /// One supervisor pass
    pub async fn tick(&mut self) -> Result<TickReport> {
        let span = create_coordination_span("supervisor_tick", None, None);
        async {
            let mut report = TickReport::default();
            self.collect_exited(&mut report).await?;
            self.sweep_heartbeats(&mut report).await?;
            self.apply_retry_policy(&mut report).await?;
            if self.accepting {
                self.dispatch(&mut report).await?;
            }
            if !report.is_idle() {
                debug!(?report, "Supervisor tick");
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn collect_exited(&mut self, report: &mut TickReport) -> Result<()> {
        let mut exited: Vec<(String, ExitInfo)> = Vec::new();
        for (agent_id, worker) in self.workers.iter_mut() {
            if let Some(exit) = worker.process.try_wait()? {
                exited.push((agent_id.clone(), exit));
            }
        }

        for (agent_id, exit) in exited {
            let Some(worker) = self.workers.remove(&agent_id) else {
                continue;
            };
            match self
                .protocol
                .deregister_agent(&agent_id, DeregisterReason::Exited)
                .await
            {
                Ok(released) if released.requeued.is_empty() && released.exhausted.is_empty() => {
                    if exit.success() {
                        info!(agent_id = %agent_id, task_id = %worker.task_id, "Worker exited");
                    } else {
                        warn!(agent_id = %agent_id, task_id = %worker.task_id, exit_code = ?exit.code, "Worker exited with a failure status");
                    }
                }
                Ok(released) => {
                    warn!(
                        agent_id = %agent_id,
                        task_id = %worker.task_id,
                        exit_code = ?exit.code,
                        requeued = ?released.requeued,
                        exhausted = ?released.exhausted,
                        "Worker exited without finishing its task"
                    );
                }
                Err(CoordinationError::AgentNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            report.exited.push(agent_id);
        }
        Ok(())
    }

    async fn sweep_heartbeats(&mut self, report: &mut TickReport) -> Result<()> {
        let state = self.protocol.state().await?;
        let now = Utc::now();
        let timeout = self.protocol.heartbeat_timeout();

        for agent in state.agents.values() {
            if agent.status == AgentStatus::Dead {
                // Left behind by an earlier run that never replaced it
                if !self.workers.contains_key(&agent.id) {
                    self.remove_dead(&agent.id).await?;
                }
                continue;
            }
            if agent.effective_status(now, timeout) != AgentStatus::Dead {
                continue;
            }

            let Some(outcome) = self.protocol.reap_agent(&agent.id, now).await? else {
                continue;
            };
            report.reaped.push(agent.id.clone());

            if let Some(mut worker) = self.workers.remove(&agent.id) {
                if let Err(e) = worker.process.kill().await {
                    warn!(agent_id = %agent.id, error = %e, "Failed to kill unresponsive worker");
                }
            }

            let mut replacement = None;
            if self.accepting && outcome.agent.restart_count < self.config.max_restarts(&agent.agent_type) {
                if let Some(task_id) = outcome.tasks.requeued.first() {
                    replacement = self
                        .spawn_for_task(
                            task_id,
                            &agent.agent_type,
                            outcome.agent.restart_count + 1,
                            Some(agent.id.clone()),
                        )
                        .await?;
                }
            } else if !outcome.tasks.requeued.is_empty() {
                warn!(
                    agent_id = %agent.id,
                    restart_count = outcome.agent.restart_count,
                    "Restart budget exhausted; task left for normal dispatch"
                );
            }

            match replacement {
                Some(new_id) => {
                    info!(dead = %agent.id, replacement = %new_id, "Replacement agent spawned");
                    report.restarted.push(new_id);
                }
                None => self.remove_dead(&agent.id).await?,
            }
        }

        self.requeue_orphans(&state, now).await
    }

    /// Active tasks whose owner never registered (a claimer crashed before
    /// registering) go back to Pending once they are older than the heartbeat timeout
    async fn requeue_orphans(&self, state: &CoordinationState, now: DateTime<Utc>) -> Result<()> {
        let timeout = self.protocol.heartbeat_timeout();
        for task in state.tasks.values().filter(|t| t.status.is_active()) {
            let Some(owner) = task.assigned_agent_id.as_deref() else {
                continue;
            };
            if state.agents.contains_key(owner) || self.workers.contains_key(owner) {
                continue;
            }
            let age = (now - task.updated_at).to_std().unwrap_or(Duration::ZERO);
            if age <= timeout {
                continue;
            }
            warn!(task_id = %task.id, agent_id = %owner, "Task owned by an unregistered agent; requeueing");
            match self
                .protocol
                .update_task_status(
                    &task.id,
                    TaskStatus::Pending,
                    TaskOutcome::Error(format!("owner {owner} never registered")),
                )
                .await
            {
                Ok(_) | Err(CoordinationError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn remove_dead(&self, agent_id: &str) -> Result<()> {
        match self
            .protocol
            .deregister_agent(agent_id, DeregisterReason::Removed)
            .await
        {
            Ok(_) | Err(CoordinationError::AgentNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_retry_policy(&mut self, report: &mut TickReport) -> Result<()> {
        let state = self.protocol.state().await?;
        let retryable: Vec<String> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Failed && t.can_retry())
            .map(|t| t.id.clone())
            .collect();
        for task_id in retryable {
            if self.protocol.retry_failed_task(&task_id).await?.is_some() {
                report.retried.push(task_id);
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, report: &mut TickReport) -> Result<()> {
        let state = self.protocol.state().await?;
        let now = Instant::now();

        for dispatch in self.planner.plan(&state, now) {
            if !self.config.workers.contains_key(&dispatch.task_type) {
                debug!(task_id = %dispatch.task_id, task_type = %dispatch.task_type, "No worker descriptor; leaving task for external agents");
                continue;
            }
            if self
                .spawn_for_task(&dispatch.task_id, &dispatch.task_type, 0, None)
                .await?
                .is_some()
            {
                self.planner.record_dispatch(&dispatch.task_type, now);
                report.dispatched.push(dispatch);
            }
        }
        Ok(())
    }

    /// Claim `task_id` for a fresh agent and launch its worker. Returns the new agent
    /// id, or None if the claim lost or the type has no worker descriptor.
    async fn spawn_for_task(
        &mut self,
        task_id: &str,
        task_type: &str,
        restart_count: u32,
        replaces: Option<String>,
    ) -> Result<Option<String>> {
        let Some(descriptor) = self.config.workers.get(task_type).cloned() else {
            return Ok(None);
        };
        let agent_id = new_agent_id(task_type);
        if !self.protocol.claim_task(task_id, &agent_id).await? {
            return Ok(None);
        }

        let spec = SpawnSpec {
            agent_id: agent_id.clone(),
            task_id: task_id.to_string(),
            task_type: task_type.to_string(),
            program: descriptor.command.clone(),
            args: descriptor.args.clone(),
            working_dir: self.protocol.workspace_for(task_type).await?,
            base_path: self.protocol.base_path().to_path_buf(),
            heartbeat_interval: self.config.coordination.heartbeat_interval(),
            capabilities: descriptor.capabilities.clone(),
        };

        let process = match self.launcher.spawn(&spec).await {
            Ok(process) => process,
            Err(e) => {
                error!(task_id = %task_id, agent_id = %agent_id, error = %format!("{e:#}"), "Failed to launch worker");
                self.protocol
                    .fail_task(task_id, &agent_id, &format!("failed to launch worker: {e:#}"))
                    .await?;
                return Ok(None);
            }
        };

        let registration = AgentRegistration {
            agent_id: agent_id.clone(),
            agent_type: task_type.to_string(),
            pid: process.pid().unwrap_or(0),
            restart_count,
            replaces,
        };
        self.workers.insert(
            agent_id.clone(),
            RunningWorker {
                task_id: task_id.to_string(),
                task_type: task_type.to_string(),
                process,
            },
        );
        self.protocol.register_agent(registration).await?;
        Ok(Some(agent_id))
    }

    /// Stop admitting claims, wait up to `grace` for in-flight tasks to finish, then
    /// terminate whatever is still running.
    pub async fn shutdown(&mut self, grace: Duration) -> Result<()> {
        self.stop_accepting();
        info!(
            workers = self.workers.len(),
            grace_ms = grace.as_millis() as u64,
            "Waiting for in-flight tasks"
        );

        let deadline = Instant::now() + grace;
        let mut report = TickReport::default();
        loop {
            if let Err(e) = self.collect_exited(&mut report).await {
                warn!(error = %format!("{e:#}"), "Failed to collect exited workers during shutdown");
            }
            if !self.has_in_flight().await? {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("Grace period elapsed with tasks still in flight");
                break;
            }
            tokio::time::sleep(self.config.orchestrator.tick_interval().min(deadline - now)).await;
        }

        self.terminate_all(false).await;
        info!("Orchestrator stopped");
        Ok(())
    }

    /// Whether any tracked worker still owns an Assigned/InProgress task
    async fn has_in_flight(&self) -> Result<bool> {
        if self.workers.is_empty() {
            return Ok(false);
        }
        let state = self.protocol.state().await?;
        Ok(self
            .workers
            .keys()
            .any(|agent_id| !state.tasks_for_agent(agent_id).is_empty()))
    }

    /// Signal every tracked worker and deregister it. `force` skips SIGTERM.
    pub async fn terminate_all(&mut self, force: bool) {
        for (agent_id, mut worker) in std::mem::take(&mut self.workers) {
            stop_worker(&agent_id, worker.process.as_mut(), force).await;
            match self
                .protocol
                .deregister_agent(&agent_id, DeregisterReason::Shutdown)
                .await
            {
                Ok(released) if !released.requeued.is_empty() => {
                    info!(agent_id = %agent_id, task_type = %worker.task_type, requeued = ?released.requeued, "Unfinished task returned to the queue");
                }
                Ok(_) | Err(CoordinationError::AgentNotFound(_)) => {}
                Err(e) => warn!(agent_id = %agent_id, error = %e, "Failed to deregister worker"),
            }
        }
    }

    /// System snapshot including the planner's cooldown windows
    pub async fn status(&self, recent_events: usize) -> Result<SystemStatus> {
        let mut status = system_status(&self.protocol, &self.config, recent_events).await?;
        let now = Instant::now();
        for type_status in &mut status.types {
            type_status.cooldown_remaining_ms = self
                .planner
                .cooldown_remaining(&type_status.task_type, now)
                .map(|remaining| remaining.as_millis() as u64);
        }
        Ok(status)
    }
}

async fn stop_worker(agent_id: &str, process: &mut dyn WorkerProcess, force: bool) {
    if !force {
        if let Err(e) = process.terminate().await {
            warn!(agent_id = %agent_id, error = %e, "Failed to send SIGTERM");
        }
        let deadline = Instant::now() + TERMINATE_WAIT;
        while Instant::now() < deadline {
            match process.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => tokio::time::sleep(EXIT_POLL).await,
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "Failed to poll worker");
                    break;
                }
            }
        }
        warn!(agent_id = %agent_id, "Worker ignored SIGTERM; killing");
    }
    if let Err(e) = process.kill().await {
        warn!(agent_id = %agent_id, error = %e, "Failed to kill worker");
    }
}

/// Per task type view for status reports
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeStatus {
    pub task_type: String,
    /// Assigned or InProgress
    pub active: usize,
    pub concurrency_limit: usize,
    pub pending: usize,
    /// Pending with dependencies satisfied
    pub ready: usize,
    pub live_agents: usize,
    /// Known only to a running orchestrator
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_ms: Option<u64>,
}

/// Agent record with liveness resolved at report time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentView {
    pub id: String,
    pub agent_type: String,
    pub pid: u32,
    pub status: AgentStatus,
    pub current_task_id: Option<String>,
    pub heartbeat_age_ms: u64,
    pub restart_count: u32,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

impl AgentView {
    fn from_record(record: &AgentRecord, now: DateTime<Utc>, timeout: Duration) -> Self {
        Self {
            id: record.id.clone(),
            agent_type: record.agent_type.clone(),
            pid: record.pid,
            status: record.effective_status(now, timeout),
            current_task_id: record.current_task_id.clone(),
            heartbeat_age_ms: record.heartbeat_age(now).as_millis() as u64,
            restart_count: record.restart_count,
            tasks_completed: record.tasks_completed,
            tasks_failed: record.tasks_failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub base_path: String,
    pub generated_at: DateTime<Utc>,
    pub orchestrator_pid: Option<u32>,
    pub projection: ProjectionHealth,
    pub tasks_by_status: BTreeMap<String, usize>,
    pub types: Vec<TypeStatus>,
    pub agents: Vec<AgentView>,
    pub recent_events: Vec<Event>,
}

/// Snapshot of the whole system for `monitor` and the interactive `status` command
pub async fn system_status(
    protocol: &CoordinationProtocol,
    config: &TaskHiveConfig,
    recent_events: usize,
) -> Result<SystemStatus> {
    let projection = protocol.projection_health().await?;
    let state = protocol.state().await?;
    let now = Utc::now();
    let timeout = protocol.heartbeat_timeout();

    let mut tasks_by_status = BTreeMap::new();
    for task in state.tasks.values() {
        *tasks_by_status
            .entry(task.status.as_str().to_string())
            .or_insert(0) += 1;
    }

    let task_types: BTreeSet<String> = config
        .workers
        .keys()
        .cloned()
        .chain(state.tasks.values().map(|t| t.task_type.clone()))
        .collect();
    let active = state.active_counts_by_type();
    let ready = state.ready_tasks();

    let types = task_types
        .into_iter()
        .map(|task_type| TypeStatus {
            active: active.get(&task_type).copied().unwrap_or(0),
            concurrency_limit: config.concurrency_limit(&task_type),
            pending: state
                .tasks
                .values()
                .filter(|t| t.task_type == task_type && t.status == TaskStatus::Pending)
                .count(),
            ready: ready.iter().filter(|t| t.task_type == task_type).count(),
            live_agents: state
                .agents
                .values()
                .filter(|a| {
                    a.agent_type == task_type
                        && a.effective_status(now, timeout) != AgentStatus::Dead
                })
                .count(),
            cooldown_remaining_ms: None,
            task_type,
        })
        .collect();

    let agents = state
        .agents
        .values()
        .map(|record| AgentView::from_record(record, now, timeout))
        .collect();

    Ok(SystemStatus {
        base_path: protocol.base_path().display().to_string(),
        generated_at: now,
        orchestrator_pid: InstanceLock::running_pid(protocol.base_path()).unwrap_or(None),
        projection,
        tasks_by_status,
        types,
        agents,
        recent_events: protocol.recent_events(recent_events).await?,
    })
}

/// One orchestrator per coordination root, enforced with an advisory lock on
/// `orchestrator.pid`
pub struct InstanceLock {
    path: PathBuf,
    _guard: RwLockWriteGuard<'static, File>,
}

impl InstanceLock {
    pub fn acquire(base_path: &Path) -> Result<Self> {
        let path = base_path.join(PID_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        // The guard must outlive this call and the lock lives for the process
        let lock = Box::leak(Box::new(RwLock::new(file)));
        let mut guard = lock.try_write().map_err(|_| {
            anyhow::anyhow!(
                "Another orchestrator is already running for {}",
                base_path.display()
            )
        })?;

        guard.set_len(0)?;
        write!(*guard, "{}", std::process::id())?;
        guard.sync_all()?;

        Ok(Self {
            path,
            _guard: guard,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pid of the running orchestrator, or None if nobody holds the lock
    pub fn running_pid(base_path: &Path) -> Result<Option<u32>> {
        let path = base_path.join(PID_FILE);
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut probe = RwLock::new(file);
        if probe.try_write().is_ok() {
            return Ok(None);
        }

        let mut contents = String::new();
        File::open(&path)?.read_to_string(&mut contents)?;
        Ok(contents.trim().parse().ok())
    }
}
