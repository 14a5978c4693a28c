use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "taskhive.toml";

/// Main configuration structure for TaskHive
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TaskHiveConfig {
    /// Shared coordination directory and protocol timing
    pub coordination: CoordinationConfig,
    /// Supervisor loop settings
    pub orchestrator: OrchestratorConfig,
    /// Worker descriptors keyed by task type
    pub workers: BTreeMap<String, WorkerDescriptor>,
    /// Observability settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub base_path: PathBuf,
    pub heartbeat_interval_ms: u64,
    /// Heartbeat age after which an agent is treated as dead
    pub heartbeat_timeout_ms: u64,
    /// Bounded wait for the coordination lock
    pub lock_timeout_ms: u64,
    /// Lock age after which the holder is presumed crashed
    pub lock_stale_after_ms: u64,
    /// Live log size (events) that triggers compaction; 0 disables it
    pub archive_threshold: usize,
    /// Events kept in the live log after compaction
    pub archive_retain: usize,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub tick_interval_ms: u64,
    /// How long shutdown waits for in-flight tasks before terminating workers
    pub shutdown_grace_ms: u64,
    pub default_max_retries: u32,
    /// Replacement spawns allowed per agent lineage
    pub max_restarts: u32,
    /// Cap for task types without a worker descriptor
    pub default_concurrency_limit: usize,
}

/// Data-driven description of a worker type
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkerDescriptor {
    pub concurrency_limit: usize,
    #[serde(default)]
    pub cooldown_ms: u64,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Program spawned for each claimed task of this type
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overrides `orchestrator.max_restarts` for this type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_restarts: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    pub json_logs: bool,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from(".taskhive"),
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 60_000,
            lock_timeout_ms: 30_000,
            lock_stale_after_ms: 120_000,
            archive_threshold: 10_000,
            archive_retain: 1_000,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            shutdown_grace_ms: 30_000,
            default_max_retries: 3,
            max_restarts: 3,
            default_concurrency_limit: 1,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl Default for TaskHiveConfig {
    fn default() -> Self {
        Self {
            coordination: CoordinationConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            workers: BTreeMap::new(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl CoordinationConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_millis(self.lock_stale_after_ms)
    }
}

impl OrchestratorConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl WorkerDescriptor {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl TaskHiveConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (`explicit` or `taskhive.toml` in the working directory)
    /// 3. Environment variables (prefixed with `TASKHIVE__`, e.g. `TASKHIVE__COORDINATION__LOCK_TIMEOUT_MS`)
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&TaskHiveConfig::default())?);

        match explicit {
            Some(path) => {
                builder = builder.add_source(File::from(path).required(true));
            }
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE));
            }
            None => {}
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKHIVE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to assemble configuration")?;
        let taskhive_config: TaskHiveConfig = config
            .try_deserialize()
            .context("Configuration has invalid values")?;
        taskhive_config.validate()?;
        Ok(taskhive_config)
    }

    /// Reject settings the protocol cannot work with
    pub fn validate(&self) -> Result<()> {
        let c = &self.coordination;
        if c.heartbeat_interval_ms == 0 {
            anyhow::bail!("coordination.heartbeat_interval_ms must be positive");
        }
        if c.heartbeat_timeout_ms <= c.heartbeat_interval_ms {
            anyhow::bail!(
                "coordination.heartbeat_timeout_ms ({}) must exceed heartbeat_interval_ms ({})",
                c.heartbeat_timeout_ms,
                c.heartbeat_interval_ms
            );
        }
        if c.archive_threshold > 0 && c.archive_retain >= c.archive_threshold {
            anyhow::bail!("coordination.archive_retain must be smaller than archive_threshold");
        }
        for (task_type, worker) in &self.workers {
            if worker.concurrency_limit == 0 {
                anyhow::bail!("workers.{task_type}.concurrency_limit must be at least 1");
            }
            if worker.command.trim().is_empty() {
                anyhow::bail!("workers.{task_type}.command must not be empty");
            }
        }
        Ok(())
    }

    /// Concurrency cap for a task type
    pub fn concurrency_limit(&self, task_type: &str) -> usize {
        self.workers
            .get(task_type)
            .map(|w| w.concurrency_limit)
            .unwrap_or(self.orchestrator.default_concurrency_limit)
    }

    pub fn max_restarts(&self, task_type: &str) -> u32 {
        self.workers
            .get(task_type)
            .and_then(|w| w.max_restarts)
            .unwrap_or(self.orchestrator.max_restarts)
    }

    /// A starter configuration with one example worker type
    pub fn example() -> Self {
        let mut config = Self::default();
        config.workers.insert(
            "search".to_string(),
            WorkerDescriptor {
                concurrency_limit: 3,
                cooldown_ms: 0,
                capabilities: vec!["search".to_string()],
                command: "taskhive-search-worker".to_string(),
                args: Vec::new(),
                max_restarts: None,
            },
        );
        config
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::debug!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = TaskHiveConfig::default();
        config.validate().unwrap();
        assert_eq!(config.concurrency_limit("anything"), 1);
        assert!(config.coordination.heartbeat_timeout() > config.coordination.heartbeat_interval());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taskhive.toml");
        std::fs::write(
            &path,
            r#"
[coordination]
base_path = "/tmp/hive"
lock_timeout_ms = 500

[workers.implement]
concurrency_limit = 1
cooldown_ms = 60000
command = "implement-worker"
max_restarts = 5
"#,
        )
        .unwrap();

        let config = TaskHiveConfig::load(Some(&path)).unwrap();
        assert_eq!(config.coordination.base_path, PathBuf::from("/tmp/hive"));
        assert_eq!(config.coordination.lock_timeout(), Duration::from_millis(500));
        // Untouched keys keep their defaults
        assert_eq!(config.coordination.heartbeat_interval_ms, 10_000);
        assert_eq!(config.concurrency_limit("implement"), 1);
        assert_eq!(config.max_restarts("implement"), 5);
        assert_eq!(config.workers["implement"].cooldown(), Duration::from_secs(60));
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seed.toml");
        let config = TaskHiveConfig::example();
        config.save_to_file(&path).unwrap();
        assert_eq!(TaskHiveConfig::load(Some(&path)).unwrap(), config);
    }

    #[test]
    fn test_rejects_timeout_not_exceeding_interval() {
        let mut config = TaskHiveConfig::default();
        config.coordination.heartbeat_timeout_ms = config.coordination.heartbeat_interval_ms;
        assert!(config.validate().is_err());
    }
}
