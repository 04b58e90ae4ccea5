//! Conversation store: the public read/write entry point for a task's logs.
//!
//! Reads run under a best-effort advisory lock and fall back, in order,
//! through the canonical file, the legacy file name, and leftover temp
//! artifacts before concluding the task has no history. Writes go straight
//! through the atomic writer; readers can never observe a torn file, so
//! writes do not take the lock.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;

use crate::config::StoreConfig;
use crate::error::{FileRole, StoreError};
use crate::lock::{LockManager, LockState};
use crate::paths::{TaskDirectoryResolver, TasksDirResolver};
use crate::record::{LogKind, Record};
use crate::recovery;
use crate::safe_io::atomic_write_json;

/// Where the records returned by [`ConversationStore::read`] came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistorySource {
    Canonical,
    /// Migrated from the legacy file name during this read.
    Legacy,
    /// Salvaged from a temp artifact at this path.
    Recovered(PathBuf),
    /// Nothing on disk: a new task.
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome {
    pub records: Vec<Record>,
    pub source: HistorySource,
    pub lock: LockState,
}

/// Reads and writes one log kind for any number of tasks under a storage root.
pub struct ConversationStore<R = TasksDirResolver> {
    storage_root: PathBuf,
    kind: LogKind,
    config: StoreConfig,
    locks: Arc<LockManager>,
    resolver: R,
}

impl ConversationStore<TasksDirResolver> {
    pub fn new(
        storage_root: impl Into<PathBuf>,
        kind: LogKind,
        config: StoreConfig,
        locks: Arc<LockManager>,
    ) -> Self {
        Self::with_resolver(storage_root, kind, config, locks, TasksDirResolver)
    }

    /// Store for the API-format log (`api_conversation_history.json`).
    pub fn api(storage_root: impl Into<PathBuf>, config: StoreConfig, locks: Arc<LockManager>) -> Self {
        Self::new(storage_root, LogKind::Api, config, locks)
    }

    /// Store for the UI log (`ui_messages.json`).
    pub fn ui(storage_root: impl Into<PathBuf>, config: StoreConfig, locks: Arc<LockManager>) -> Self {
        Self::new(storage_root, LogKind::Ui, config, locks)
    }
}

impl<R: TaskDirectoryResolver> ConversationStore<R> {
    pub fn with_resolver(
        storage_root: impl Into<PathBuf>,
        kind: LogKind,
        config: StoreConfig,
        locks: Arc<LockManager>,
        resolver: R,
    ) -> Self {
        Self {
            storage_root: storage_root.into(),
            kind,
            config,
            locks,
            resolver,
        }
    }

    pub fn kind(&self) -> LogKind {
        self.kind
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Path of the canonical log file for `task_id`.
    pub async fn canonical_path(&self, task_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self
            .task_dir(task_id)
            .await?
            .join(self.kind.canonical_file_name()))
    }

    /// Load a task's history.
    ///
    /// A task with nothing on disk yields an empty sequence. A file that
    /// exists but does not parse is an error and is left untouched.
    pub async fn read(&self, task_id: &str) -> Result<ReadOutcome, StoreError> {
        let dir = self.task_dir(task_id).await?;
        let canonical = dir.join(self.kind.canonical_file_name());

        let (guard, lock) = match self.locks.acquire(&canonical, &self.config.lock).await {
            Ok(guard) => (Some(guard), LockState::Held),
            Err(e) => {
                log::warn!(
                    target: "tasklog::store",
                    "reading {} log for task '{}' without lock: {}",
                    self.kind.label(),
                    task_id,
                    e
                );
                (None, LockState::Unavailable(e.to_string()))
            }
        };

        let result = self.read_from_disk(task_id, &dir, &canonical).await;
        if let Err(e) = &result
            && e.is_parse_failure()
        {
            log::error!(target: "tasklog::store", "{}", e);
        }

        if let Some(guard) = guard {
            if let Err(e) = guard.release().await {
                log::warn!(
                    target: "tasklog::store",
                    "failed to release lock for {}: {}",
                    canonical.display(),
                    e
                );
            }
        }

        let (records, source) = result?;
        Ok(ReadOutcome {
            records,
            source,
            lock,
        })
    }

    /// [`read`](Self::read) without the provenance.
    pub async fn read_records(&self, task_id: &str) -> Result<Vec<Record>, StoreError> {
        Ok(self.read(task_id).await?.records)
    }

    /// Replace a task's history with `records`.
    pub async fn write(&self, task_id: &str, records: &[Record]) -> Result<(), StoreError> {
        let canonical = self.canonical_path(task_id).await?;
        atomic_write_json(&canonical, records).await
    }

    /// Delete leftover temp artifacts for a task, but only once the canonical
    /// file is confirmed to parse. Without a canonical file the artifacts are
    /// the only copy of the history and nothing is removed.
    ///
    /// Artifacts touched within the last `lock.stale_ms` are kept: they may
    /// belong to a write that is still in progress.
    pub async fn prune_artifacts(&self, task_id: &str) -> Result<usize, StoreError> {
        let dir = self.task_dir(task_id).await?;
        let base = self.kind.canonical_file_name();
        if read_log(&dir.join(base), FileRole::Canonical).await?.is_none() {
            return Ok(0);
        }
        recovery::prune_artifacts(&dir, base, self.config.lock.stale()).await
    }

    async fn task_dir(&self, task_id: &str) -> Result<PathBuf, StoreError> {
        self.resolver
            .resolve(&self.storage_root, task_id)
            .await
            .map_err(|source| StoreError::DirectoryResolution {
                task_id: task_id.to_string(),
                source,
            })
    }

    async fn read_from_disk(
        &self,
        task_id: &str,
        dir: &Path,
        canonical: &Path,
    ) -> Result<(Vec<Record>, HistorySource), StoreError> {
        let base = self.kind.canonical_file_name();
        let in_flight_window = self.config.lock.stale();

        if let Some(records) = read_log(canonical, FileRole::Canonical).await? {
            if self.config.recovery.prune_after_read
                && let Err(e) = recovery::prune_artifacts(dir, base, in_flight_window).await
            {
                log::warn!(target: "tasklog::store", "artifact cleanup failed: {}", e);
            }
            return Ok((records, HistorySource::Canonical));
        }

        if let Some(legacy_name) = self.kind.legacy_file_name() {
            let legacy = dir.join(legacy_name);
            if let Some(records) = read_log(&legacy, FileRole::Legacy).await? {
                self.migrate_legacy(task_id, canonical, &legacy, &records)
                    .await?;
                return Ok((records, HistorySource::Legacy));
            }
        }

        // Newest first. A young artifact that will not parse is most likely a
        // write still in progress, so fall through to the next candidate; only
        // an artifact older than the stale window is reported as corrupt.
        for artifact in recovery::list_artifacts(dir, base).await? {
            match read_log(&artifact.path, FileRole::Recovered).await {
                Ok(Some(records)) => {
                    log::info!(
                        target: "tasklog::store",
                        "recovered {} {} record(s) for task '{}' from {}",
                        records.len(),
                        self.kind.label(),
                        task_id,
                        artifact.path.display()
                    );
                    return Ok((records, HistorySource::Recovered(artifact.path)));
                }
                // Gone since the listing: usually renamed onto the canonical name.
                Ok(None) => {}
                Err(e) if e.is_parse_failure() && artifact.is_in_flight(in_flight_window) => {
                    log::debug!(
                        target: "tasklog::store",
                        "skipping in-flight artifact {}",
                        artifact.path.display()
                    );
                }
                Err(e) => {
                    // A writer may have committed while we were looking.
                    if let Some(records) = read_log(canonical, FileRole::Canonical).await? {
                        return Ok((records, HistorySource::Canonical));
                    }
                    return Err(e);
                }
            }
            if let Some(records) = read_log(canonical, FileRole::Canonical).await? {
                return Ok((records, HistorySource::Canonical));
            }
        }

        log::debug!(
            target: "tasklog::store",
            "no {} history for task '{}'",
            self.kind.label(),
            task_id
        );
        Ok((Vec::new(), HistorySource::Empty))
    }

    /// Commit legacy content under the canonical name, then drop the legacy file.
    async fn migrate_legacy(
        &self,
        task_id: &str,
        canonical: &Path,
        legacy: &Path,
        records: &[Record],
    ) -> Result<(), StoreError> {
        atomic_write_json(canonical, records).await?;
        fs::remove_file(legacy)
            .await
            .map_err(|e| StoreError::io("removing legacy log", legacy, e))?;
        log::info!(
            target: "tasklog::store",
            "migrated {} record(s) for task '{}' from {}",
            records.len(),
            task_id,
            legacy.display()
        );
        Ok(())
    }
}

/// Parse a log file. `Ok(None)` when it does not exist.
async fn read_log(path: &Path, role: FileRole) -> Result<Option<Vec<Record>>, StoreError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io("reading log", path, e)),
    };

    let records: Vec<Record> =
        serde_json::from_slice(&bytes).map_err(|source| StoreError::parse(role, path, source))?;

    if records.is_empty() {
        log::debug!(
            target: "tasklog::store",
            "{} log {} exists but is empty",
            role,
            path.display()
        );
    }
    Ok(Some(records))
}
