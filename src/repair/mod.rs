//! Offline diagnostics and repair for a coordination root.
//!
//! Everything here is safe to run while workers are alive except
//! [`RepairTool::emergency_reset`], which needs explicit confirmation.

pub mod checks;
pub mod output;
pub mod types;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use crate::coordination::protocol::{
    AGENT_REGISTRY_FILE, ARCHIVE_DIR, EVENT_LOG_FILE, SNAPSHOT_FILE, TASK_QUEUE_FILE,
};
use crate::coordination::CoordinationProtocol;

pub use checks::CoordinationChecks;
pub use output::DiagnosticOutput;
pub use types::{
    DiagnosticReport, DiagnosticResult, DiagnosticStatus, DiagnosticSummary, OutputFormat,
    RepairAction,
};

/// What an emergency reset kept aside before wiping
#[derive(Debug, Clone, Serialize)]
pub struct EmergencyReset {
    pub backup_dir: PathBuf,
    pub backed_up: Vec<PathBuf>,
}

pub struct RepairTool {
    protocol: CoordinationProtocol,
    verbose: bool,
}

impl RepairTool {
    pub fn new(protocol: CoordinationProtocol) -> Self {
        Self {
            protocol,
            verbose: false,
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn protocol(&self) -> &CoordinationProtocol {
        &self.protocol
    }

    /// Run every check without changing anything
    pub async fn diagnose(&self) -> Result<DiagnosticReport> {
        let checks = CoordinationChecks::new(&self.protocol, self.verbose)
            .run_all()
            .await?;
        Ok(self.report(checks))
    }

    /// Structural validation only: layout, permissions and well-formed files
    pub async fn validate(&self) -> Result<DiagnosticReport> {
        let checker = CoordinationChecks::new(&self.protocol, self.verbose);
        let mut checks = BTreeMap::new();
        checker.check_structure(&mut checks).await?;
        checker.check_permissions(&mut checks).await?;
        checker.check_event_log(&mut checks).await?;
        checker.check_projections(&mut checks).await?;
        checker.check_snapshot(&mut checks).await?;
        Ok(self.report(checks))
    }

    /// Fix everything that can be fixed without losing events, then re-diagnose
    pub async fn repair_all(&self) -> Result<DiagnosticReport> {
        let mut actions = Vec::new();

        self.restore_structure(&mut actions).await?;
        self.clear_stale_locks(&mut actions).await?;
        self.clear_temp_files(&mut actions).await?;
        self.fix_permissions(&mut actions).await?;

        let rebuilt = self
            .protocol
            .repair_coordination_state()
            .await
            .context("Failed to rebuild projections from the event log")?;
        actions.push(RepairAction {
            name: "projections".to_string(),
            description: format!(
                "rebuilt from {} event(s) up to sequence {} ({} tasks, {} agents, {} skipped line(s))",
                rebuilt.events_replayed,
                rebuilt.last_sequence,
                rebuilt.tasks,
                rebuilt.agents,
                rebuilt.skipped_lines
            ),
        });

        info!(actions = actions.len(), "Repair complete");
        Ok(self.diagnose().await?.with_actions(actions))
    }

    /// Back up the log, projections, snapshot and archives, then start from an empty log.
    ///
    /// Refuses to run unless `confirmed` is true.
    pub async fn emergency_reset(&self, confirmed: bool) -> Result<EmergencyReset> {
        if !confirmed {
            bail!("Emergency reset destroys coordination state and requires explicit confirmation");
        }

        let paths = self.protocol.paths();
        let backup_dir = paths
            .backups()
            .join(Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string());
        fs::create_dir_all(&backup_dir)
            .await
            .with_context(|| format!("Failed to create backup directory {}", backup_dir.display()))?;

        let log = self.protocol.event_log();
        let holder = format!("repair-pid{}", std::process::id());
        let guard = log.lock(&holder).await?;

        let reset = async {
            let mut backed_up = Vec::new();
            if log.backup_to(&backup_dir.join(EVENT_LOG_FILE)).await? {
                backed_up.push(backup_dir.join(EVENT_LOG_FILE));
            }
            for name in [TASK_QUEUE_FILE, AGENT_REGISTRY_FILE, SNAPSHOT_FILE] {
                if copy_if_present(&paths.base.join(name), &backup_dir.join(name)).await? {
                    backed_up.push(backup_dir.join(name));
                }
            }
            let archive_backup = backup_dir.join(ARCHIVE_DIR);
            for archive in log.list_archives().await? {
                fs::create_dir_all(&archive_backup).await?;
                let Some(name) = archive.path.file_name() else {
                    continue;
                };
                let dest = archive_backup.join(name);
                fs::copy(&archive.path, &dest).await?;
                backed_up.push(dest);
            }

            log.wipe().await?;
            self.protocol.projections().discard().await?;
            remove_if_present(&paths.snapshot()).await?;
            for archive in log.list_archives().await? {
                remove_if_present(&archive.path).await?;
            }
            Ok::<_, anyhow::Error>(backed_up)
        }
        .await;

        guard.release().await?;
        let backed_up = reset?;

        for lock in self.protocol.locks().list().await? {
            self.protocol.locks().force_release(&lock.name).await?;
        }
        self.protocol.init().await?;

        warn!(
            backup_dir = %backup_dir.display(),
            files = backed_up.len(),
            "Emergency reset: coordination state wiped and reinitialized"
        );
        Ok(EmergencyReset {
            backup_dir,
            backed_up,
        })
    }

    fn report(&self, checks: BTreeMap<String, DiagnosticResult>) -> DiagnosticReport {
        DiagnosticReport::new(self.protocol.base_path().display().to_string(), checks)
    }

    async fn restore_structure(&self, actions: &mut Vec<RepairAction>) -> Result<()> {
        let paths = self.protocol.paths();
        for dir in paths.required_dirs() {
            if fs::metadata(&dir).await.is_err() {
                fs::create_dir_all(&dir).await?;
                actions.push(RepairAction {
                    name: "structure".to_string(),
                    description: format!("created {}", dir.display()),
                });
            }
        }
        if fs::metadata(paths.event_log()).await.is_err() {
            self.protocol.event_log().ensure_exists().await?;
            actions.push(RepairAction {
                name: "structure".to_string(),
                description: format!("created empty {}", paths.event_log().display()),
            });
        }
        Ok(())
    }

    async fn clear_stale_locks(&self, actions: &mut Vec<RepairAction>) -> Result<()> {
        let locks = self.protocol.locks().list().await?;
        for lock in checks::stale_locks(&self.protocol, &locks) {
            if self.protocol.locks().force_release(&lock.name).await? {
                actions.push(RepairAction {
                    name: "locks".to_string(),
                    description: format!(
                        "removed orphaned lock {} (held {}s)",
                        lock.name,
                        lock.age.as_secs()
                    ),
                });
            }
        }
        Ok(())
    }

    /// Temp files younger than the stale threshold may belong to a publish in flight
    async fn clear_temp_files(&self, actions: &mut Vec<RepairAction>) -> Result<()> {
        let threshold = self.protocol.locks().stale_after();
        for path in checks::find_temp_files(&self.protocol).await? {
            let old_enough = checks::file_age(&path)
                .await
                .map_or(true, |age| age > threshold);
            if old_enough && remove_if_present(&path).await? {
                actions.push(RepairAction {
                    name: "temp_files".to_string(),
                    description: format!("removed {}", path.display()),
                });
            }
        }
        Ok(())
    }

    async fn fix_permissions(&self, actions: &mut Vec<RepairAction>) -> Result<()> {
        for path in checks::loose_permission_paths(&self.protocol).await? {
            tighten(&path).await?;
            actions.push(RepairAction {
                name: "permissions".to_string(),
                description: format!("removed group/other write access on {}", path.display()),
            });
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn tighten(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path).await?;
    let mode = if metadata.is_dir() {
        metadata.permissions().mode() & !0o022
    } else {
        0o600
    };
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn tighten(_path: &Path) -> Result<()> {
    Ok(())
}

async fn copy_if_present(from: &Path, to: &Path) -> Result<bool> {
    match fs::copy(from, to).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to back up {}", from.display())),
    }
}

async fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{NewTask, ProtocolOptions, TaskStatus};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn setup(options: ProtocolOptions) -> (TempDir, CoordinationProtocol) {
        let dir = TempDir::new().unwrap();
        let protocol = CoordinationProtocol::new(dir.path().join("hive"), options);
        protocol.init().await.unwrap();
        (dir, protocol)
    }

    #[tokio::test]
    async fn test_fresh_root_is_healthy() {
        let (_dir, protocol) = setup(ProtocolOptions::default()).await;
        let report = RepairTool::new(protocol).diagnose().await.unwrap();
        assert!(report.is_healthy(), "{report:#?}");
        assert_eq!(report.checks["structure"].status, DiagnosticStatus::Pass);
        assert_eq!(report.checks["projections"].status, DiagnosticStatus::Pass);
    }

    #[tokio::test]
    async fn test_missing_structure_fails_validation_and_repair_restores_it() {
        let (_dir, protocol) = setup(ProtocolOptions::default()).await;
        protocol.create_task(NewTask::new("search", "a")).await.unwrap();
        fs::remove_dir_all(protocol.paths().locks()).await.unwrap();
        fs::remove_file(protocol.paths().task_queue()).await.unwrap();

        let tool = RepairTool::new(protocol.clone());
        let report = tool.validate().await.unwrap();
        assert!(!report.is_healthy());
        assert_eq!(report.checks["structure"].status, DiagnosticStatus::Fail);
        assert_eq!(report.checks["projections"].status, DiagnosticStatus::Fail);

        let repaired = tool.repair_all().await.unwrap();
        assert!(repaired.is_healthy(), "{repaired:#?}");
        assert!(repaired.actions.iter().any(|a| a.name == "structure"));
        assert_eq!(protocol.tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_repair_clears_orphaned_locks_and_old_temp_files() {
        let options = ProtocolOptions {
            lock_stale_after: Duration::from_millis(50),
            ..ProtocolOptions::default()
        };
        let (_dir, protocol) = setup(options).await;

        let orphan = protocol.locks().lock_path("event_log");
        fs::write(&orphan, b"not json").await.unwrap();
        let temp = protocol.paths().base.join("task-queue.json.tmp.deadbeef");
        fs::write(&temp, b"{").await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let tool = RepairTool::new(protocol.clone());
        let before = tool.diagnose().await.unwrap();
        assert_eq!(before.checks["locks"].status, DiagnosticStatus::Warning);
        assert_eq!(before.checks["temp_files"].status, DiagnosticStatus::Warning);

        let after = tool.repair_all().await.unwrap();
        assert_eq!(after.checks["locks"].status, DiagnosticStatus::Pass);
        assert_eq!(after.checks["temp_files"].status, DiagnosticStatus::Pass);
        assert!(fs::metadata(&orphan).await.is_err());
        assert!(fs::metadata(&temp).await.is_err());
    }

    #[tokio::test]
    async fn test_emergency_reset_requires_confirmation_and_backs_up() {
        let (_dir, protocol) = setup(ProtocolOptions::default()).await;
        let id = protocol.create_task(NewTask::new("search", "a")).await.unwrap();
        assert_eq!(protocol.task(&id).await.unwrap().status, TaskStatus::Pending);
        let original_log = fs::read(protocol.paths().event_log()).await.unwrap();

        let tool = RepairTool::new(protocol.clone());
        assert!(tool.emergency_reset(false).await.is_err());
        assert_eq!(protocol.tasks().await.unwrap().len(), 1);

        let reset = tool.emergency_reset(true).await.unwrap();
        let backed_up_log = fs::read(reset.backup_dir.join(EVENT_LOG_FILE)).await.unwrap();
        assert_eq!(backed_up_log, original_log);
        assert!(reset.backed_up.contains(&reset.backup_dir.join(TASK_QUEUE_FILE)));

        assert!(protocol.tasks().await.unwrap().is_empty());
        assert!(tool.diagnose().await.unwrap().is_healthy());
    }
}
