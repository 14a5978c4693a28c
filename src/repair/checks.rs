use super::types::DiagnosticResult;
use anyhow::Result;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;

use crate::coordination::lock::LockSnapshot;
use crate::coordination::{CoordinationProtocol, ProjectionHealth};
use crate::fs::is_temp_file;

const REPAIR_HINT: &str = "Run: taskhive repair --repair-all";

/// Read-only checks over a coordination directory
pub struct CoordinationChecks<'a> {
    protocol: &'a CoordinationProtocol,
    verbose: bool,
}

impl<'a> CoordinationChecks<'a> {
    pub fn new(protocol: &'a CoordinationProtocol, verbose: bool) -> Self {
        Self { protocol, verbose }
    }

    pub async fn run_all(&self) -> Result<BTreeMap<String, DiagnosticResult>> {
        let mut checks = BTreeMap::new();

        self.check_structure(&mut checks).await?;
        self.check_permissions(&mut checks).await?;
        self.check_event_log(&mut checks).await?;
        self.check_archives(&mut checks).await?;
        self.check_projections(&mut checks).await?;
        self.check_snapshot(&mut checks).await?;
        self.check_locks(&mut checks).await?;
        self.check_temp_files(&mut checks).await?;

        Ok(checks)
    }

    /// Required directories and the event log exist
    pub async fn check_structure(&self, checks: &mut BTreeMap<String, DiagnosticResult>) -> Result<()> {
        let paths = self.protocol.paths();
        let mut missing: Vec<PathBuf> = Vec::new();
        for dir in paths.required_dirs() {
            if !is_dir(&dir).await {
                missing.push(dir);
            }
        }
        if fs::metadata(paths.event_log()).await.is_err() {
            missing.push(paths.event_log());
        }

        let result = if missing.is_empty() {
            DiagnosticResult::pass("Coordination directory layout is complete")
        } else {
            DiagnosticResult::fail(format!("{} required path(s) missing", missing.len()))
                .with_details(join_paths(&missing))
                .with_suggestion("Run: taskhive start --init, or taskhive repair --repair-all")
        };
        checks.insert("structure".to_string(), result);
        Ok(())
    }

    /// Shared files must not be writable by group or others
    pub async fn check_permissions(&self, checks: &mut BTreeMap<String, DiagnosticResult>) -> Result<()> {
        let loose = loose_permission_paths(self.protocol).await?;
        let result = if loose.is_empty() {
            DiagnosticResult::pass("Coordination files have owner-only write access")
        } else {
            DiagnosticResult::warning(format!(
                "{} path(s) writable by group or others",
                loose.len()
            ))
            .with_details(join_paths(&loose))
            .with_suggestion(REPAIR_HINT)
        };
        checks.insert("permissions".to_string(), result);
        Ok(())
    }

    pub async fn check_event_log(&self, checks: &mut BTreeMap<String, DiagnosticResult>) -> Result<()> {
        let log = self.protocol.event_log();
        if fs::metadata(log.path()).await.is_err() {
            checks.insert(
                "event_log".to_string(),
                DiagnosticResult::fail("Event log not found")
                    .with_details(log.path().display().to_string())
                    .with_suggestion("Run: taskhive start --init"),
            );
            return Ok(());
        }

        let scan = log.read_all().await?;
        let last = scan.last_sequence().unwrap_or(0);
        let result = if scan.skipped() == 0 {
            let result = DiagnosticResult::pass(format!(
                "{} event(s) readable, last sequence {}",
                scan.events.len(),
                last
            ));
            if self.verbose {
                result.with_details(log.path().display().to_string())
            } else {
                result
            }
        } else {
            DiagnosticResult::warning(format!(
                "{} unreadable line(s) skipped, {} event(s) readable",
                scan.skipped(),
                scan.events.len()
            ))
            .with_details(format!("Lines: {:?}", scan.skipped_lines))
            .with_suggestion("Skipped lines are ignored on replay; rebuild projections with: taskhive repair --repair-all")
        };
        checks.insert("event_log".to_string(), result);
        Ok(())
    }

    /// Every archive decodes and the ranges chain without gaps
    pub async fn check_archives(&self, checks: &mut BTreeMap<String, DiagnosticResult>) -> Result<()> {
        let log = self.protocol.event_log();
        let archives = log.list_archives().await?;
        if archives.is_empty() {
            checks.insert(
                "archives".to_string(),
                DiagnosticResult::info("No archived events"),
            );
            return Ok(());
        }

        let mut problems = Vec::new();
        let mut expected_first = archives[0].first_sequence;
        for archive in &archives {
            if archive.first_sequence != expected_first {
                problems.push(format!(
                    "gap before {} (expected sequence {})",
                    archive.path.display(),
                    expected_first
                ));
            }
            let scan = log.read_archive(archive).await?;
            if scan.last_sequence() != Some(archive.last_sequence) || scan.skipped() > 0 {
                problems.push(format!(
                    "{} decodes to sequence {:?} with {} skipped line(s)",
                    archive.path.display(),
                    scan.last_sequence(),
                    scan.skipped()
                ));
            }
            expected_first = archive.last_sequence + 1;
        }

        let result = if problems.is_empty() {
            DiagnosticResult::pass(format!(
                "{} archive(s) cover sequences {}..={}",
                archives.len(),
                archives[0].first_sequence,
                expected_first - 1
            ))
        } else {
            DiagnosticResult::warning(format!("{} archive problem(s)", problems.len()))
                .with_details(problems.join("; "))
                .with_suggestion("Replay uses the snapshot while it is readable; keep a backup of the archive directory")
        };
        checks.insert("archives".to_string(), result);
        Ok(())
    }

    pub async fn check_projections(&self, checks: &mut BTreeMap<String, DiagnosticResult>) -> Result<()> {
        let result = match self.protocol.projection_health().await? {
            ProjectionHealth::Current { last_sequence } => DiagnosticResult::pass(format!(
                "Projections are well-formed and current at sequence {last_sequence}"
            )),
            ProjectionHealth::Lagging { projection, log } => DiagnosticResult::warning(format!(
                "Projections at sequence {projection} lag the log at {log}"
            ))
            .with_details("The next write or rebuild catches them up")
            .with_suggestion(REPAIR_HINT),
            ProjectionHealth::Unreadable { reason } => {
                DiagnosticResult::fail("Projections are missing or malformed")
                    .with_details(reason)
                    .with_suggestion(REPAIR_HINT)
            }
        };
        checks.insert("projections".to_string(), result);
        Ok(())
    }

    pub async fn check_snapshot(&self, checks: &mut BTreeMap<String, DiagnosticResult>) -> Result<()> {
        let has_archives = !self.protocol.event_log().list_archives().await?.is_empty();
        let result = match self.protocol.projections().read_snapshot().await? {
            Ok(Some(snapshot)) => DiagnosticResult::pass(format!(
                "Snapshot readable at sequence {}",
                snapshot.state.last_sequence
            )),
            Ok(None) if has_archives => DiagnosticResult::warning("Archives exist but no snapshot")
                .with_details("Replay falls back to decoding every archive")
                .with_suggestion("A snapshot is written on the next compaction"),
            Ok(None) => DiagnosticResult::info("No snapshot (log has not been compacted)"),
            Err(problem) => DiagnosticResult::warning("Snapshot is malformed")
                .with_details(problem.into_error().to_string())
                .with_suggestion("Replay falls back to the archives; the next compaction rewrites it"),
        };
        checks.insert("snapshot".to_string(), result);
        Ok(())
    }

    /// Locks older than the stale threshold are presumed orphaned by a crashed holder
    pub async fn check_locks(&self, checks: &mut BTreeMap<String, DiagnosticResult>) -> Result<()> {
        let locks = self.protocol.locks().list().await?;
        let stale = stale_locks(self.protocol, &locks);

        let result = if !stale.is_empty() {
            DiagnosticResult::warning(format!("{} orphaned lock(s)", stale.len()))
                .with_details(
                    stale
                        .iter()
                        .map(|l| describe_lock(l))
                        .collect::<Vec<_>>()
                        .join("; "),
                )
                .with_suggestion(REPAIR_HINT)
        } else if locks.is_empty() {
            DiagnosticResult::pass("No locks held")
        } else {
            DiagnosticResult::info(format!("{} lock(s) currently held", locks.len())).with_details(
                locks
                    .iter()
                    .map(describe_lock)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        };
        checks.insert("locks".to_string(), result);
        Ok(())
    }

    /// Leftovers of interrupted write-temp-then-rename publishes
    pub async fn check_temp_files(&self, checks: &mut BTreeMap<String, DiagnosticResult>) -> Result<()> {
        let temps = find_temp_files(self.protocol).await?;
        let result = if temps.is_empty() {
            DiagnosticResult::pass("No leftover temp files")
        } else {
            DiagnosticResult::warning(format!("{} leftover temp file(s)", temps.len()))
                .with_details(join_paths(&temps))
                .with_suggestion(REPAIR_HINT)
        };
        checks.insert("temp_files".to_string(), result);
        Ok(())
    }
}

pub(crate) fn stale_locks<'l>(
    protocol: &CoordinationProtocol,
    locks: &'l [LockSnapshot],
) -> Vec<&'l LockSnapshot> {
    let threshold = protocol.locks().stale_after();
    locks.iter().filter(|l| l.is_stale(threshold)).collect()
}

/// Temp files in the coordination root, the locks directory and the archive directory
pub(crate) async fn find_temp_files(protocol: &CoordinationProtocol) -> Result<Vec<PathBuf>> {
    let paths = protocol.paths();
    let mut found = Vec::new();
    for dir in [paths.base.clone(), paths.locks(), paths.archive()] {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_temp_file(&path) && entry.file_type().await?.is_file() {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// How long ago a file was last modified
pub(crate) async fn file_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).await.ok()?.modified().ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    )
}

#[cfg(unix)]
pub(crate) async fn loose_permission_paths(protocol: &CoordinationProtocol) -> Result<Vec<PathBuf>> {
    use std::os::unix::fs::PermissionsExt;

    let paths = protocol.paths();
    let mut candidates = paths.required_dirs();
    candidates.extend([
        paths.event_log(),
        paths.task_queue(),
        paths.agent_registry(),
        paths.snapshot(),
    ]);

    let mut loose = Vec::new();
    for path in candidates {
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        if metadata.permissions().mode() & 0o022 != 0 {
            loose.push(path);
        }
    }
    Ok(loose)
}

#[cfg(not(unix))]
pub(crate) async fn loose_permission_paths(_protocol: &CoordinationProtocol) -> Result<Vec<PathBuf>> {
    Ok(Vec::new())
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

fn describe_lock(lock: &LockSnapshot) -> String {
    match &lock.info {
        Some(info) => format!(
            "{} held by {} (pid {} on {}) for {}s",
            lock.name,
            info.holder_id,
            info.pid,
            info.hostname,
            lock.age.as_secs()
        ),
        None => format!("{} (unreadable holder) for {}s", lock.name, lock.age.as_secs()),
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
