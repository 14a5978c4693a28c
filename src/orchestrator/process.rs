//! Worker process lifecycle.
//!
//! The orchestrator only knows how to spawn a worker, check whether it has exited,
//! and stop it. What the worker does is opaque; it talks back through the
//! coordination protocol (usually via `taskhive agent ...`).

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

pub const ENV_AGENT_ID: &str = "TASKHIVE_AGENT_ID";
pub const ENV_TASK_ID: &str = "TASKHIVE_TASK_ID";
pub const ENV_TASK_TYPE: &str = "TASKHIVE_TASK_TYPE";
pub const ENV_BASE_PATH: &str = "TASKHIVE_BASE_PATH";
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "TASKHIVE_HEARTBEAT_INTERVAL_MS";
pub const ENV_CAPABILITIES: &str = "TASKHIVE_CAPABILITIES";

/// Everything needed to launch one worker
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnSpec {
    pub agent_id: String,
    pub task_id: String,
    pub task_type: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub base_path: PathBuf,
    /// How often the worker must heartbeat to stay ahead of the liveness timeout
    pub heartbeat_interval: Duration,
    /// Capability tags of the worker type, passed comma-separated
    pub capabilities: Vec<String>,
}

impl SpawnSpec {
    /// Environment handed to the worker
    pub fn env(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            (ENV_AGENT_ID, self.agent_id.clone()),
            (ENV_TASK_ID, self.task_id.clone()),
            (ENV_TASK_TYPE, self.task_type.clone()),
            (ENV_BASE_PATH, self.base_path.display().to_string()),
            (
                ENV_HEARTBEAT_INTERVAL_MS,
                self.heartbeat_interval.as_millis().to_string(),
            ),
            (ENV_CAPABILITIES, self.capabilities.join(",")),
        ])
    }
}

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A running worker process
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait WorkerProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check
    fn try_wait(&mut self) -> Result<Option<ExitInfo>>;

    /// Ask the process to stop (SIGTERM on unix)
    async fn terminate(&mut self) -> Result<()>;

    /// Stop the process immediately
    async fn kill(&mut self) -> Result<()>;
}

/// Starts worker processes
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<Box<dyn WorkerProcess>>;
}

/// Launches real OS processes with `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct CommandLauncher;

#[async_trait]
impl ProcessLauncher for CommandLauncher {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<Box<dyn WorkerProcess>> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env())
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .with_context(|| format!("Failed to spawn worker '{}'", spec.program))?;

        info!(
            agent_id = %spec.agent_id,
            task_id = %spec.task_id,
            task_type = %spec.task_type,
            pid = ?child.id(),
            program = %spec.program,
            "Worker process spawned"
        );
        Ok(Box::new(ChildProcess { child }))
    }
}

/// A worker backed by a [`tokio::process::Child`]
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> Result<Option<ExitInfo>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| ExitInfo { code: status.code() }))
    }

    async fn terminate(&mut self) -> Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        #[cfg(unix)]
        {
            let status = Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .status()
                .await
                .context("Failed to run kill")?;
            if !status.success() {
                warn!(pid, "kill -TERM reported failure; process may already be gone");
            }
        }
        #[cfg(not(unix))]
        {
            debug!(pid, "No SIGTERM on this platform; killing");
            self.child.start_kill()?;
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        if self.child.id().is_some() {
            self.child.start_kill()?;
            debug!(pid = ?self.child.id(), "Worker process killed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(program: &str, args: &[&str], dir: &std::path::Path) -> SpawnSpec {
        SpawnSpec {
            agent_id: "search-agent-0000abcd".to_string(),
            task_id: "t1".to_string(),
            task_type: "search".to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: dir.to_path_buf(),
            base_path: dir.join("hive"),
            heartbeat_interval: Duration::from_millis(2_500),
            capabilities: vec!["web".to_string(), "summarize".to_string()],
        }
    }

    #[test]
    fn test_spawn_env_names() {
        let dir = std::path::Path::new("/tmp");
        let env = spec("true", &[], dir).env();
        assert_eq!(env[ENV_AGENT_ID], "search-agent-0000abcd");
        assert_eq!(env[ENV_TASK_ID], "t1");
        assert_eq!(env[ENV_TASK_TYPE], "search");
        assert_eq!(env[ENV_BASE_PATH], "/tmp/hive");
        assert_eq!(env[ENV_HEARTBEAT_INTERVAL_MS], "2500");
        assert_eq!(env[ENV_CAPABILITIES], "web,summarize");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_launcher_runs_and_reports_exit() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut worker = CommandLauncher
            .spawn(&spec(
                "sh",
                &["-c", "test \"$TASKHIVE_TASK_ID\" = t1 && test \"$TASKHIVE_HEARTBEAT_INTERVAL_MS\" = 2500"],
                dir.path(),
            ))
            .await
            .unwrap();

        let mut exit = None;
        for _ in 0..100 {
            exit = worker.try_wait().unwrap();
            if exit.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(exit, Some(ExitInfo { code: Some(0) }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_stops_long_running_worker() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut worker = CommandLauncher
            .spawn(&spec("sleep", &["30"], dir.path()))
            .await
            .unwrap();
        assert!(worker.pid().is_some());

        worker.terminate().await.unwrap();
        let mut exit = None;
        for _ in 0..100 {
            exit = worker.try_wait().unwrap();
            if exit.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let exit = exit.expect("worker should exit after SIGTERM");
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn test_mock_worker_process() {
        let mut worker = MockWorkerProcess::new();
        worker.expect_pid().return_const(Some(7u32));
        worker.expect_try_wait().returning(|| Ok(Some(ExitInfo { code: Some(1) })));

        assert_eq!(worker.pid(), Some(7));
        assert!(!worker.try_wait().unwrap().unwrap().success());
    }
}
