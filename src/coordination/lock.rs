//! File-based mutual exclusion.
//!
//! A lock is a file `locks/<name>.lock` created with `O_EXCL` semantics and holding a
//! JSON [`LockInfo`]. Contenders poll with exponential backoff until their timeout runs
//! out. A lock older than the staleness threshold is presumed orphaned by a crashed
//! holder and is force-released with a warning.
//!
//! Every removal of a lock file (release, stale break, forced release) runs under an OS
//! advisory lock on the sidecar `locks/<name>.break`, and removes only the exact bytes it
//! inspected. Creation needs no sidecar: `O_EXCL` fails while the file exists, and the file
//! can only disappear through a serialized remover.
//!
//! Callers hold at most one named lock at a time, so there is no lock ordering to get wrong.

use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::errors::LockError;

pub const LOCK_SUFFIX: &str = ".lock";
const BREAK_SUFFIX: &str = ".break";

/// Contents of a held lock file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub pid: u32,
    pub hostname: String,
}

/// Exponential backoff with jitter between acquisition attempts
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(250),
        }
    }
}

impl Backoff {
    /// Base delay for the given attempt (0-based), before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Base delay plus up to 50% random jitter, never above `max`
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_ms = base.as_millis() as u64 / 2;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        (base + jitter).min(self.max)
    }
}

/// A lock observed on disk, reported by [`LockManager::list`]
#[derive(Debug, Clone)]
pub struct LockSnapshot {
    pub name: String,
    pub path: PathBuf,
    pub info: Option<LockInfo>,
    pub age: Duration,
}

impl LockSnapshot {
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.age > threshold
    }
}

#[derive(Debug, Clone)]
pub struct LockManager {
    locks_dir: PathBuf,
    stale_after: Duration,
    backoff: Backoff,
}

impl LockManager {
    pub fn new(locks_dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            locks_dir: locks_dir.into(),
            stale_after,
            backoff: Backoff::default(),
        }
    }

    pub fn locks_dir(&self) -> &Path {
        &self.locks_dir
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn lock_path(&self, name: &str) -> PathBuf {
        self.locks_dir.join(format!("{name}{LOCK_SUFFIX}"))
    }

    /// Acquire `name` for `holder_id`, polling until `timeout` elapses.
    ///
    /// Returns [`LockError::Busy`] on exhaustion; never blocks indefinitely.
    pub async fn acquire(
        &self,
        name: &str,
        holder_id: &str,
        timeout: Duration,
    ) -> Result<LockGuard, LockError> {
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            if let Some(guard) = self.try_acquire(name, holder_id).await? {
                if attempt > 0 {
                    debug!(lock = %name, holder = %holder_id, attempts = attempt + 1, "Lock acquired after contention");
                }
                return Ok(guard);
            }

            let waited = started.elapsed();
            if waited >= timeout {
                let holder = self.inspect(name).await.map(|info| info.holder_id);
                return Err(LockError::Busy {
                    lock: name.to_string(),
                    holder,
                    waited,
                });
            }

            let delay = self.backoff.delay(attempt).min(timeout - waited);
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Single acquisition attempt. Breaks a stale lock before trying if one is found.
    pub async fn try_acquire(
        &self,
        name: &str,
        holder_id: &str,
    ) -> Result<Option<LockGuard>, LockError> {
        let path = self.lock_path(name);
        let io_err = |source| LockError::Io {
            lock: name.to_string(),
            source,
        };

        fs::create_dir_all(&self.locks_dir).await.map_err(io_err)?;

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                let info = LockInfo {
                    holder_id: holder_id.to_string(),
                    acquired_at: Utc::now(),
                    pid: std::process::id(),
                    hostname: hostname::get()
                        .map(|h| h.to_string_lossy().to_string())
                        .unwrap_or_else(|_| "unknown".to_string()),
                };
                let body = serde_json::to_vec(&info).map_err(|e| io_err(e.into()))?;
                if let Err(e) = async {
                    file.write_all(&body).await?;
                    file.sync_all().await
                }
                .await
                {
                    let _ = fs::remove_file(&path).await;
                    return Err(io_err(e));
                }

                Ok(Some(LockGuard {
                    locks_dir: self.locks_dir.clone(),
                    name: name.to_string(),
                    holder_id: holder_id.to_string(),
                    body,
                    released: false,
                }))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                self.break_if_stale(name).await?;
                Ok(None)
            }
            Err(e) => Err(io_err(e)),
        }
    }

    /// Current holder of `name`, if the lock file exists and is readable
    pub async fn inspect(&self, name: &str) -> Option<LockInfo> {
        let bytes = fs::read(self.lock_path(name)).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Remove a lock regardless of holder. Returns whether a lock file existed.
    pub async fn force_release(&self, name: &str) -> Result<bool, LockError> {
        let removed = self.remove_serialized(name, |_, _| true).await?;
        if removed.is_some() {
            warn!(lock = %name, "Lock force-released");
        }
        Ok(removed.is_some())
    }

    /// Every lock file currently present
    pub async fn list(&self) -> Result<Vec<LockSnapshot>, std::io::Error> {
        let mut snapshots = Vec::new();
        let mut entries = match fs::read_dir(&self.locks_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(snapshots),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(name) = file_name.strip_suffix(LOCK_SUFFIX) else {
                continue;
            };
            let path = entry.path();
            let bytes = fs::read(&path).await.unwrap_or_default();
            let info: Option<LockInfo> = serde_json::from_slice(&bytes).ok();
            let age = lock_age(info.as_ref(), &path).unwrap_or(Duration::ZERO);
            snapshots.push(LockSnapshot {
                name: name.to_string(),
                path,
                info,
                age,
            });
        }

        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(snapshots)
    }

    async fn break_if_stale(&self, name: &str) -> Result<(), LockError> {
        let stale_after = self.stale_after;
        let broken = self
            .remove_serialized(name, move |path, bytes| {
                let info: Option<LockInfo> = serde_json::from_slice(bytes).ok();
                lock_age(info.as_ref(), path).is_some_and(|age| age > stale_after)
            })
            .await?;

        if let Some(bytes) = broken {
            let info: Option<LockInfo> = serde_json::from_slice(&bytes).ok();
            warn!(
                lock = %name,
                holder = ?info.as_ref().map(|i| i.holder_id.as_str()),
                "Force-releasing stale lock; holder presumed crashed"
            );
        }
        Ok(())
    }

    /// Run [`remove_serialized`] off the async runtime
    async fn remove_serialized<F>(
        &self,
        name: &str,
        should_remove: F,
    ) -> Result<Option<Vec<u8>>, LockError>
    where
        F: FnOnce(&Path, &[u8]) -> bool + Send + 'static,
    {
        let locks_dir = self.locks_dir.clone();
        let owned_name = name.to_string();
        tokio::task::spawn_blocking(move || remove_serialized(&locks_dir, &owned_name, should_remove))
            .await
            .map_err(std::io::Error::other)
            .and_then(|removed| removed)
            .map_err(|source| LockError::Io {
                lock: name.to_string(),
                source,
            })
    }
}

/// Remove `locks/<name>.lock` if `should_remove` accepts its current contents, holding the
/// sidecar advisory lock across the read and the removal. Returns the removed bytes.
fn remove_serialized<F>(
    locks_dir: &Path,
    name: &str,
    should_remove: F,
) -> std::io::Result<Option<Vec<u8>>>
where
    F: FnOnce(&Path, &[u8]) -> bool,
{
    std::fs::create_dir_all(locks_dir)?;
    let sidecar = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(locks_dir.join(format!("{name}{BREAK_SUFFIX}")))?;
    let mut sidecar = RwLock::new(sidecar);
    let _serialized = sidecar.write()?;

    let path = locks_dir.join(format!("{name}{LOCK_SUFFIX}"));
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if !should_remove(&path, &bytes) {
        return Ok(None);
    }
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Age from the recorded acquisition time, falling back to the file mtime for
/// a lock file whose body has not been written yet
fn lock_age(info: Option<&LockInfo>, path: &Path) -> Option<Duration> {
    if let Some(info) = info {
        return Some((Utc::now() - info.acquired_at).to_std().unwrap_or(Duration::ZERO));
    }
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or(Duration::ZERO))
}

/// A held lock. Released explicitly with [`LockGuard::release`] or on drop.
///
/// Release removes the lock file only while it still holds the bytes this guard wrote,
/// so a guard whose lock was broken never removes its successor's lock.
#[derive(Debug)]
pub struct LockGuard {
    locks_dir: PathBuf,
    name: String,
    holder_id: String,
    body: Vec<u8>,
    released: bool,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        let locks_dir = self.locks_dir.clone();
        let name = self.name.clone();
        let body = std::mem::take(&mut self.body);
        let removed = tokio::task::spawn_blocking(move || {
            remove_serialized(&locks_dir, &name, move |_, current| current == body.as_slice())
        })
        .await
        .map_err(std::io::Error::other)
        .and_then(|removed| removed)
        .map_err(|source| LockError::Io {
            lock: self.name.clone(),
            source,
        })?;

        if removed.is_none() {
            warn!(lock = %self.name, holder = %self.holder_id, "Lock was taken over before release");
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let body = self.body.as_slice();
        let _ = remove_serialized(&self.locks_dir, &self.name, |_, current| current == body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir, stale_after: Duration) -> LockManager {
        LockManager::new(dir.path().join("locks"), stale_after)
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir, Duration::from_secs(60));

        let guard = locks
            .acquire("event_log", "holder-a", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(locks.lock_path("event_log").exists());
        assert_eq!(locks.inspect("event_log").await.unwrap().holder_id, "holder-a");

        guard.release().await.unwrap();
        assert!(!locks.lock_path("event_log").exists());
    }

    #[tokio::test]
    async fn test_contention_times_out_as_busy() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir, Duration::from_secs(60));

        let _held = locks
            .acquire("event_log", "holder-a", Duration::from_secs(1))
            .await
            .unwrap();
        let err = locks
            .acquire("event_log", "holder-b", Duration::from_millis(100))
            .await
            .unwrap_err();

        match err {
            LockError::Busy { lock, holder, .. } => {
                assert_eq!(lock, "event_log");
                assert_eq!(holder.as_deref(), Some("holder-a"));
            }
            other => panic!("expected Busy, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_drop_releases_lock() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir, Duration::from_secs(60));
        {
            let _guard = locks.try_acquire("a", "holder-a").await.unwrap().unwrap();
            assert!(locks.try_acquire("a", "holder-b").await.unwrap().is_none());
        }
        assert!(locks.try_acquire("a", "holder-b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir, Duration::from_millis(50));
        std::fs::create_dir_all(locks.locks_dir()).unwrap();

        let crashed = LockInfo {
            holder_id: "crashed-holder".to_string(),
            acquired_at: Utc::now() - chrono::Duration::seconds(30),
            pid: 1,
            hostname: "host".to_string(),
        };
        std::fs::write(
            locks.lock_path("event_log"),
            serde_json::to_vec(&crashed).unwrap(),
        )
        .unwrap();

        let guard = locks
            .acquire("event_log", "holder-b", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(guard.holder_id(), "holder-b");
        assert_eq!(locks.inspect("event_log").await.unwrap().holder_id, "holder-b");
    }

    #[tokio::test]
    async fn test_release_does_not_remove_someone_elses_lock() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir, Duration::from_secs(60));

        let guard = locks.try_acquire("a", "holder-a").await.unwrap().unwrap();
        locks.force_release("a").await.unwrap();
        let _other = locks.try_acquire("a", "holder-b").await.unwrap().unwrap();

        guard.release().await.unwrap();
        assert_eq!(locks.inspect("a").await.unwrap().holder_id, "holder-b");
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
        };
        assert_eq!(backoff.base_delay(0), Duration::from_millis(10));
        assert_eq!(backoff.base_delay(1), Duration::from_millis(20));
        assert_eq!(backoff.base_delay(3), Duration::from_millis(80));
        assert_eq!(backoff.base_delay(4), Duration::from_millis(100));
        assert_eq!(backoff.base_delay(40), Duration::from_millis(100));
        for attempt in 0..10 {
            assert!(backoff.delay(attempt) <= backoff.max);
        }
    }
}
