use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use taskhive::client::AgentClient;
use taskhive::config::{TaskHiveConfig, WorkerDescriptor};
use taskhive::coordination::{CoordinationProtocol, NewTask, ProtocolOptions, TaskStatus};
use taskhive::orchestrator::process::{
    ExitInfo, ProcessLauncher, SpawnSpec, WorkerProcess, ENV_CAPABILITIES,
    ENV_HEARTBEAT_INTERVAL_MS,
};
use taskhive::orchestrator::Orchestrator;
use tempfile::TempDir;

/// Exit status shared between a fake process and the test driving it
type ExitSlot = Arc<Mutex<Option<ExitInfo>>>;

struct FakeProcess {
    pid: u32,
    exit: ExitSlot,
}

#[async_trait]
impl WorkerProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_wait(&mut self) -> Result<Option<ExitInfo>> {
        Ok(*self.exit.lock().unwrap())
    }

    async fn terminate(&mut self) -> Result<()> {
        *self.exit.lock().unwrap() = Some(ExitInfo { code: None });
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        *self.exit.lock().unwrap() = Some(ExitInfo { code: None });
        Ok(())
    }
}

#[derive(Default)]
struct FakeLauncher {
    spawned: Mutex<Vec<(SpawnSpec, ExitSlot)>>,
}

impl FakeLauncher {
    fn spawned_tasks(&self) -> Vec<String> {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .map(|(spec, _)| spec.task_id.clone())
            .collect()
    }

    fn spec_for(&self, agent_id: &str) -> SpawnSpec {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .find(|(spec, _)| spec.agent_id == agent_id)
            .map(|(spec, _)| spec.clone())
            .unwrap()
    }

    fn exit_slot(&self, agent_id: &str) -> ExitSlot {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .find(|(spec, _)| spec.agent_id == agent_id)
            .map(|(_, slot)| slot.clone())
            .unwrap()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<Box<dyn WorkerProcess>> {
        let exit: ExitSlot = Arc::new(Mutex::new(None));
        let mut spawned = self.spawned.lock().unwrap();
        let pid = 10_000 + spawned.len() as u32;
        spawned.push((spec.clone(), exit.clone()));
        Ok(Box::new(FakeProcess { pid, exit }))
    }
}

fn config_with(task_type: &str, concurrency_limit: usize, max_restarts: u32) -> TaskHiveConfig {
    let mut config = TaskHiveConfig::default();
    config.orchestrator.max_restarts = max_restarts;
    config.workers = BTreeMap::from([(
        task_type.to_string(),
        WorkerDescriptor {
            concurrency_limit,
            cooldown_ms: 0,
            capabilities: Vec::new(),
            command: "fake-worker".to_string(),
            args: Vec::new(),
            max_restarts: None,
        },
    )]);
    config
}

async fn setup(options: ProtocolOptions) -> (TempDir, CoordinationProtocol) {
    let dir = TempDir::new().unwrap();
    let protocol = CoordinationProtocol::new(dir.path(), options);
    protocol.init().await.unwrap();
    (dir, protocol)
}

#[tokio::test]
async fn test_dispatch_follows_priority_then_fifo() {
    let (_dir, protocol) = setup(ProtocolOptions::default()).await;
    let mut ids = Vec::new();
    for priority in [1, 3, 2, 3, 1] {
        ids.push(
            protocol
                .create_task(NewTask::new("search", format!("p{priority}")).priority(priority))
                .await
                .unwrap(),
        );
    }

    let launcher = Arc::new(FakeLauncher::default());
    let mut orchestrator =
        Orchestrator::new(protocol.clone(), config_with("search", 10, 3), launcher.clone());
    let report = orchestrator.tick().await.unwrap();

    let expected = vec![
        ids[0].clone(),
        ids[4].clone(),
        ids[2].clone(),
        ids[1].clone(),
        ids[3].clone(),
    ];
    let dispatched: Vec<String> = report.dispatched.iter().map(|d| d.task_id.clone()).collect();
    assert_eq!(dispatched, expected);
    assert_eq!(launcher.spawned_tasks(), expected);

    // Each dispatched task is assigned to a registered, busy agent
    for task in protocol.tasks().await.unwrap() {
        assert_eq!(task.status, TaskStatus::Assigned);
        let agent = protocol
            .agent(task.assigned_agent_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(agent.current_task_id.as_deref(), Some(task.id.as_str()));
    }
}

#[tokio::test]
async fn test_status_reports_cooldown_and_worker_env() {
    let (_dir, protocol) = setup(ProtocolOptions::default()).await;
    protocol.create_task(NewTask::new("review", "one")).await.unwrap();
    protocol.create_task(NewTask::new("review", "two")).await.unwrap();

    let launcher = Arc::new(FakeLauncher::default());
    let mut config = config_with("review", 5, 3);
    if let Some(worker) = config.workers.get_mut("review") {
        worker.cooldown_ms = 60_000;
        worker.capabilities = vec!["diff".to_string(), "lint".to_string()];
    }
    let mut orchestrator = Orchestrator::new(protocol.clone(), config, launcher.clone());

    let report = orchestrator.tick().await.unwrap();
    assert_eq!(report.dispatched.len(), 1);
    let agent_id = protocol
        .tasks()
        .await
        .unwrap()
        .into_iter()
        .find_map(|t| t.assigned_agent_id)
        .unwrap();
    assert_eq!(
        launcher.spec_for(&agent_id).env()[ENV_CAPABILITIES],
        "diff,lint"
    );

    let status = orchestrator.status(5).await.unwrap();
    let review = status.types.iter().find(|t| t.task_type == "review").unwrap();
    assert_eq!(review.pending, 1);
    assert!(review.cooldown_remaining_ms.unwrap() > 50_000);
}

#[tokio::test]
async fn test_concurrency_cap_is_never_exceeded() {
    let (_dir, protocol) = setup(ProtocolOptions::default()).await;
    for i in 0..10 {
        protocol
            .create_task(NewTask::new("implement", format!("job {i}")))
            .await
            .unwrap();
    }

    let launcher = Arc::new(FakeLauncher::default());
    let mut orchestrator =
        Orchestrator::new(protocol.clone(), config_with("implement", 3, 3), launcher.clone());

    let mut completed = 0;
    for _round in 0..10 {
        orchestrator.tick().await.unwrap();

        let active: Vec<_> = protocol
            .tasks()
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.status.is_active())
            .collect();
        assert!(active.len() <= 3, "{} tasks active", active.len());
        if active.is_empty() {
            break;
        }

        // Workers finish their task and exit
        for task in active {
            let agent_id = task.assigned_agent_id.clone().unwrap();
            protocol.start_task(&task.id, &agent_id).await.unwrap();
            let in_progress = protocol
                .tasks()
                .await
                .unwrap()
                .iter()
                .filter(|t| t.status == TaskStatus::InProgress)
                .count();
            assert!(in_progress <= 3);
            protocol
                .complete_task(&task.id, &agent_id, json!({"done": true}))
                .await
                .unwrap();
            *launcher.exit_slot(&agent_id).lock().unwrap() = Some(ExitInfo { code: Some(0) });
            completed += 1;
        }
    }

    assert_eq!(completed, 10);
    assert_eq!(launcher.spawned_tasks().len(), 10);
}

#[tokio::test]
async fn test_crashed_worker_task_is_requeued_with_retry() {
    let options = ProtocolOptions {
        heartbeat_timeout: Duration::from_millis(200),
        ..ProtocolOptions::default()
    };
    let (_dir, protocol) = setup(options).await;
    let task_id = protocol.create_task(NewTask::new("search", "hangs")).await.unwrap();

    let launcher = Arc::new(FakeLauncher::default());
    let mut orchestrator =
        Orchestrator::new(protocol.clone(), config_with("search", 1, 0), launcher.clone());

    let first = orchestrator.tick().await.unwrap();
    assert_eq!(first.dispatched.len(), 1);
    let agent_id = protocol.task(&task_id).await.unwrap().assigned_agent_id.unwrap();
    protocol.start_task(&task_id, &agent_id).await.unwrap();

    // The worker never heartbeats; keep the queue quiet so the requeue is observable
    orchestrator.stop_accepting();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let report = orchestrator.tick().await.unwrap();

    assert_eq!(report.reaped, vec![agent_id.clone()]);
    assert!(report.restarted.is_empty());
    let task = protocol.task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.assigned_agent_id, None);
    // The unresponsive process was killed and the dead record removed
    assert!(launcher.exit_slot(&agent_id).lock().unwrap().is_some());
    assert!(protocol.agent(&agent_id).await.is_err());
}

#[tokio::test]
async fn test_heartbeating_worker_outlives_timeout_while_silent_one_is_reaped() {
    let options = ProtocolOptions {
        heartbeat_timeout: Duration::from_millis(300),
        ..ProtocolOptions::default()
    };
    let (_dir, protocol) = setup(options).await;
    let alive_task = protocol.create_task(NewTask::new("search", "alive")).await.unwrap();
    let silent_task = protocol.create_task(NewTask::new("search", "silent")).await.unwrap();

    let launcher = Arc::new(FakeLauncher::default());
    let mut config = config_with("search", 2, 0);
    config.coordination.heartbeat_interval_ms = 100;
    config.coordination.heartbeat_timeout_ms = 300;
    let mut orchestrator = Orchestrator::new(protocol.clone(), config, launcher.clone());
    orchestrator.tick().await.unwrap();

    let alive_agent = protocol.task(&alive_task).await.unwrap().assigned_agent_id.unwrap();
    let silent_agent = protocol.task(&silent_task).await.unwrap().assigned_agent_id.unwrap();
    assert_eq!(launcher.spec_for(&alive_agent).env()[ENV_HEARTBEAT_INTERVAL_MS], "100");

    // The worker heartbeats at the interval it was handed
    let (stop, stop_rx) = tokio::sync::watch::channel(false);
    let heartbeats = AgentClient::new(protocol.clone(), alive_agent.clone(), "search")
        .spawn_heartbeat(launcher.spec_for(&alive_agent).heartbeat_interval, stop_rx);

    orchestrator.stop_accepting();
    tokio::time::sleep(Duration::from_millis(700)).await;
    let report = orchestrator.tick().await.unwrap();

    assert_eq!(report.reaped, vec![silent_agent.clone()]);
    let alive = protocol.task(&alive_task).await.unwrap();
    assert_eq!(alive.status, TaskStatus::Assigned);
    assert_eq!(alive.assigned_agent_id.as_deref(), Some(alive_agent.as_str()));
    assert_eq!(protocol.task(&silent_task).await.unwrap().status, TaskStatus::Pending);

    stop.send(true).unwrap();
    heartbeats.await.unwrap();
}

#[tokio::test]
async fn test_dead_agent_is_replaced_within_restart_budget() {
    let options = ProtocolOptions {
        heartbeat_timeout: Duration::from_millis(200),
        ..ProtocolOptions::default()
    };
    let (_dir, protocol) = setup(options).await;
    let task_id = protocol.create_task(NewTask::new("search", "flaky")).await.unwrap();

    let launcher = Arc::new(FakeLauncher::default());
    let mut orchestrator =
        Orchestrator::new(protocol.clone(), config_with("search", 1, 1), launcher.clone());
    orchestrator.tick().await.unwrap();
    let first_agent = protocol.task(&task_id).await.unwrap().assigned_agent_id.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let report = orchestrator.tick().await.unwrap();
    assert_eq!(report.reaped, vec![first_agent.clone()]);
    assert_eq!(report.restarted.len(), 1);

    let replacement = &report.restarted[0];
    let task = protocol.task(&task_id).await.unwrap();
    assert_eq!(task.assigned_agent_id.as_deref(), Some(replacement.as_str()));
    assert_eq!(task.retry_count, 1);
    let record = protocol.agent(replacement).await.unwrap();
    assert_eq!(record.restart_count, 1);
    // The replacement took over the dead agent's record
    assert!(protocol.agent(&first_agent).await.is_err());
}

#[tokio::test]
async fn test_failed_task_is_retried_then_left_failed() {
    let (_dir, protocol) = setup(ProtocolOptions::default()).await;
    let task_id = protocol
        .create_task(NewTask::new("search", "always fails").max_retries(1))
        .await
        .unwrap();

    let launcher = Arc::new(FakeLauncher::default());
    let mut orchestrator =
        Orchestrator::new(protocol.clone(), config_with("search", 1, 3), launcher.clone());

    for attempt in 0..2 {
        orchestrator.tick().await.unwrap();
        let agent_id = protocol.task(&task_id).await.unwrap().assigned_agent_id.unwrap();
        protocol.fail_task(&task_id, &agent_id, "boom").await.unwrap();
        *launcher.exit_slot(&agent_id).lock().unwrap() = Some(ExitInfo { code: Some(1) });
        let report = orchestrator.tick().await.unwrap();
        if attempt == 0 {
            assert_eq!(report.retried, vec![task_id.clone()]);
        } else {
            assert!(report.retried.is_empty());
        }
    }

    let task = protocol.task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.is_terminal());
    assert_eq!(launcher.spawned_tasks().len(), 2);
}

#[tokio::test]
async fn test_shutdown_terminates_workers_and_requeues() {
    let (_dir, protocol) = setup(ProtocolOptions::default()).await;
    let task_id = protocol.create_task(NewTask::new("search", "long")).await.unwrap();

    let launcher = Arc::new(FakeLauncher::default());
    let mut orchestrator =
        Orchestrator::new(protocol.clone(), config_with("search", 1, 3), launcher.clone());
    orchestrator.tick().await.unwrap();
    let agent_id = protocol.task(&task_id).await.unwrap().assigned_agent_id.unwrap();

    orchestrator.shutdown(Duration::from_millis(100)).await.unwrap();

    assert!(!orchestrator.is_accepting());
    assert!(orchestrator.worker_ids().is_empty());
    assert!(launcher.exit_slot(&agent_id).lock().unwrap().is_some());
    let task = protocol.task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
}
