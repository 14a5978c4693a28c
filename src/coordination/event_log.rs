//! Append-only event log: the single durable authority for coordination state.

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::errors::{CoordinationError, Result};
use super::events::{Event, EventKind};
use super::lock::{LockGuard, LockManager};
use crate::fs::{atomic_write, restrict_permissions};

/// Name of the lock that serializes every write to the log and the projections
pub const LOG_LOCK: &str = "event_log";

const ARCHIVE_PREFIX: &str = "events-";
const ARCHIVE_SUFFIX: &str = ".jsonl.gz";

/// Result of scanning the log: parsed events plus what had to be skipped
#[derive(Debug, Default, Clone)]
pub struct LogScan {
    pub events: Vec<Event>,
    /// 1-based line numbers that failed to parse or were out of sequence
    pub skipped_lines: Vec<usize>,
}

impl LogScan {
    pub fn skipped(&self) -> usize {
        self.skipped_lines.len()
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.events.last().map(|e| e.sequence_id)
    }
}

/// An archive file of compacted events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFile {
    pub path: PathBuf,
    pub first_sequence: u64,
    pub last_sequence: u64,
}

#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
    archive_dir: PathBuf,
    locks: LockManager,
    lock_timeout: Duration,
}

impl EventLog {
    pub fn new(
        path: impl Into<PathBuf>,
        archive_dir: impl Into<PathBuf>,
        locks: LockManager,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            archive_dir: archive_dir.into(),
            locks,
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Acquire the log lock
    pub async fn lock(&self, holder_id: &str) -> Result<LockGuard> {
        Ok(self
            .locks
            .acquire(LOG_LOCK, holder_id, self.lock_timeout)
            .await?)
    }

    /// Append one event under the log lock and return it with its sequence id
    pub async fn append(&self, holder_id: &str, kind: EventKind) -> Result<Event> {
        let guard = self.lock(holder_id).await?;
        let appended = self.append_locked(&guard, kind).await;
        guard.release().await?;
        appended
    }

    /// Append while the caller already holds the log lock
    pub async fn append_locked(&self, _guard: &LockGuard, kind: EventKind) -> Result<Event> {
        let next = self.last_sequence().await?.unwrap_or(0) + 1;
        let event = Event {
            sequence_id: next,
            timestamp: Utc::now(),
            kind,
        };

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        // A crash mid-write can leave a torn final line; terminate it so the new event
        // starts on its own line and only the torn fragment is lost.
        if needs_line_break(&self.path).await? {
            file.write_all(b"\n").await?;
        }
        file.write_all(&line).await?;
        file.sync_all().await?;

        debug!(
            sequence_id = event.sequence_id,
            event_type = event.kind.type_name(),
            "Event appended"
        );
        Ok(event)
    }

    /// Scan the live log top to bottom, skipping (and counting) lines that fail to parse
    pub async fn read_all(&self) -> Result<LogScan> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(LogScan::default()),
            Err(e) => return Err(e.into()),
        };
        let scan = parse_lines(&bytes);
        if scan.skipped() > 0 {
            warn!(
                path = %self.path.display(),
                skipped = scan.skipped(),
                lines = ?scan.skipped_lines,
                "Skipped unreadable event log lines"
            );
        }
        Ok(scan)
    }

    /// Highest sequence id ever issued: the live log's last parseable line, or the
    /// newest archive when the live log is empty
    pub async fn last_sequence(&self) -> Result<Option<u64>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let from_log = bytes
            .split(|b| *b == b'\n')
            .rev()
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .find_map(|line| serde_json::from_slice::<Event>(line).ok())
            .map(|event| event.sequence_id);

        let from_archive = self
            .list_archives()
            .await?
            .last()
            .map(|archive| archive.last_sequence);

        Ok(match (from_log, from_archive) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        })
    }

    /// Compress `events` into `archive/events-<first>-<last>.jsonl.gz`
    pub async fn write_archive(&self, events: &[Event]) -> Result<Option<ArchiveFile>> {
        let (Some(first), Some(last)) = (events.first(), events.last()) else {
            return Ok(None);
        };
        fs::create_dir_all(&self.archive_dir).await?;

        let path = self.archive_dir.join(format!(
            "{ARCHIVE_PREFIX}{:012}-{:012}{ARCHIVE_SUFFIX}",
            first.sequence_id, last.sequence_id
        ));

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        for event in events {
            serde_json::to_writer(&mut encoder, event)?;
            encoder.write_all(b"\n")?;
        }
        let compressed = encoder.finish()?;
        atomic_write(&path, &compressed).await?;

        info!(
            archive = %path.display(),
            first_sequence = first.sequence_id,
            last_sequence = last.sequence_id,
            events = events.len(),
            "Archived event log prefix"
        );

        Ok(Some(ArchiveFile {
            path,
            first_sequence: first.sequence_id,
            last_sequence: last.sequence_id,
        }))
    }

    /// Rewrite the live log keeping only events after `sequence`. Requires the log lock.
    pub async fn retain_after(&self, _guard: &LockGuard, sequence: u64) -> Result<usize> {
        let scan = self.read_all().await?;
        let mut body = Vec::new();
        let mut kept = 0usize;
        for event in scan.events.iter().filter(|e| e.sequence_id > sequence) {
            serde_json::to_writer(&mut body, event)?;
            body.push(b'\n');
            kept += 1;
        }
        atomic_write(&self.path, &body).await?;
        Ok(kept)
    }

    /// Archive files sorted by sequence range
    pub async fn list_archives(&self) -> Result<Vec<ArchiveFile>> {
        let mut archives = Vec::new();
        let mut entries = match fs::read_dir(&self.archive_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(archives),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some((first_sequence, last_sequence)) = parse_archive_name(&name) {
                archives.push(ArchiveFile {
                    path: entry.path(),
                    first_sequence,
                    last_sequence,
                });
            }
        }
        archives.sort_by_key(|a| a.first_sequence);
        Ok(archives)
    }

    /// Decompress one archive file
    pub async fn read_archive(&self, archive: &ArchiveFile) -> Result<LogScan> {
        let path = archive.path.clone();
        let bytes = tokio::task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let file = std::fs::File::open(&path)?;
            let mut out = Vec::new();
            for line in BufReader::new(GzDecoder::new(file)).lines() {
                match line {
                    Ok(line) => {
                        out.extend_from_slice(line.as_bytes());
                        out.push(b'\n');
                    }
                    // A truncated archive keeps whatever decoded before the damage
                    Err(_) => break,
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| CoordinationError::Io(std::io::Error::other(e)))??;

        Ok(parse_lines(&bytes))
    }

    /// Full history: every archive followed by the live log
    pub async fn read_history(&self) -> Result<LogScan> {
        let mut history = LogScan::default();
        for archive in self.list_archives().await? {
            let scan = self.read_archive(&archive).await?;
            history.skipped_lines.extend(scan.skipped_lines);
            history.events.extend(scan.events);
        }
        let live = self.read_all().await?;
        history.skipped_lines.extend(live.skipped_lines);
        let floor = history.last_sequence().unwrap_or(0);
        history
            .events
            .extend(live.events.into_iter().filter(|e| e.sequence_id > floor));
        Ok(history)
    }

    /// Create the log file if absent
    pub async fn ensure_exists(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if fs::metadata(&self.path).await.is_err() {
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            restrict_permissions(&self.path).await?;
        }
        Ok(())
    }

    /// Copy the log aside (used by emergency reset)
    pub async fn backup_to(&self, dest: &Path) -> Result<bool> {
        match fs::copy(&self.path, dest).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the log with an empty one
    pub async fn wipe(&self) -> Result<()> {
        atomic_write(&self.path, b"").await?;
        Ok(())
    }
}

async fn needs_line_break(path: &Path) -> std::io::Result<bool> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

    let mut file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    Ok(last[0] != b'\n')
}

/// Parse JSONL, keeping only strictly increasing sequence ids
fn parse_lines(bytes: &[u8]) -> LogScan {
    let mut scan = LogScan::default();
    let mut last = 0u64;
    for (index, line) in bytes.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<Event>(line) {
            Ok(event) if event.sequence_id > last => {
                last = event.sequence_id;
                scan.events.push(event);
            }
            _ => scan.skipped_lines.push(index + 1),
        }
    }
    scan
}

fn parse_archive_name(name: &str) -> Option<(u64, u64)> {
    let range = name.strip_prefix(ARCHIVE_PREFIX)?.strip_suffix(ARCHIVE_SUFFIX)?;
    let (first, last) = range.split_once('-')?;
    Some((first.parse().ok()?, last.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::events::{AgentHeartbeat, TaskAssigned};
    use tempfile::TempDir;

    fn log(dir: &TempDir) -> EventLog {
        let locks = LockManager::new(dir.path().join("locks"), Duration::from_secs(30));
        EventLog::new(
            dir.path().join("event-log.jsonl"),
            dir.path().join("archive"),
            locks,
            Duration::from_secs(5),
        )
    }

    fn heartbeat(agent: &str) -> EventKind {
        EventKind::AgentHeartbeat(AgentHeartbeat {
            agent_id: agent.to_string(),
            current_task_id: None,
        })
    }

    #[tokio::test]
    async fn test_sequence_ids_are_monotonic() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir);

        for expected in 1..=5u64 {
            let event = log.append("test", heartbeat("a")).await.unwrap();
            assert_eq!(event.sequence_id, expected);
        }

        let scan = log.read_all().await.unwrap();
        let ids: Vec<u64> = scan.events.iter().map(|e| e.sequence_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(scan.skipped(), 0);
    }

    #[tokio::test]
    async fn test_torn_final_line_is_skipped_and_next_append_recovers() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir);
        log.append("test", heartbeat("a")).await.unwrap();
        log.append("test", heartbeat("b")).await.unwrap();

        // Simulate a crash mid-write
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .unwrap();
        file.write_all(br#"{"sequence_id":3,"timestamp":"2026-"#).unwrap();

        let scan = log.read_all().await.unwrap();
        assert_eq!(scan.events.len(), 2);
        assert_eq!(scan.skipped(), 1);

        let next = log
            .append(
                "test",
                EventKind::TaskAssigned(TaskAssigned {
                    task_id: "t".to_string(),
                    agent_id: "a".to_string(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(next.sequence_id, 3);

        let scan = log.read_all().await.unwrap();
        assert_eq!(scan.events.len(), 3);
        assert_eq!(scan.skipped(), 1);
    }

    #[tokio::test]
    async fn test_archive_and_retain_tail() {
        let dir = TempDir::new().unwrap();
        let log = log(&dir);
        for _ in 0..10 {
            log.append("test", heartbeat("a")).await.unwrap();
        }

        let scan = log.read_all().await.unwrap();
        let archive = log.write_archive(&scan.events[..7]).await.unwrap().unwrap();
        assert_eq!((archive.first_sequence, archive.last_sequence), (1, 7));

        let guard = log.lock("test").await.unwrap();
        let kept = log.retain_after(&guard, 7).await.unwrap();
        guard.release().await.unwrap();
        assert_eq!(kept, 3);

        let history = log.read_history().await.unwrap();
        let ids: Vec<u64> = history.events.iter().map(|e| e.sequence_id).collect();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());

        // Sequence continues past the archived range
        assert_eq!(log.append("test", heartbeat("a")).await.unwrap().sequence_id, 11);
    }

    #[test]
    fn test_archive_name_parsing() {
        assert_eq!(
            parse_archive_name("events-000000000001-000000000007.jsonl.gz"),
            Some((1, 7))
        );
        assert_eq!(parse_archive_name("snapshot.json"), None);
    }
}
