//! Advisory, heartbeat-based locks shared between processes.
//!
//! A lock is a sidecar file next to the resource (`<path>.lock`) created with
//! `O_CREAT | O_EXCL`. Its body names the owner and carries a heartbeat
//! timestamp that a background task refreshes while the lock is held. A lock
//! whose heartbeat is older than `stale_ms` is considered abandoned and may be
//! broken by the next acquirer.
//!
//! These locks narrow race windows; they do not guarantee exclusion. Callers
//! are expected to carry on without the lock when acquisition fails.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::LockError;
use crate::paths::lock_path_for;
use crate::safe_io::{now_millis, unix_millis};

/// What is on disk at a lock path right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    Active,
    Stale,
}

/// Whether a store operation ran under the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Held,
    /// Ran without the lock; the reason is for diagnostics only.
    Unavailable(String),
}

impl LockState {
    pub fn is_held(&self) -> bool {
        matches!(self, LockState::Held)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockBody {
    owner: String,
    pid: u32,
    heartbeat_ms: u64,
}

type HeldSet = Arc<Mutex<HashSet<PathBuf>>>;

/// Per-process lock bookkeeping.
///
/// Construct one at startup and share it. It remembers which lock paths this
/// process holds, so a second acquisition of the same path from inside the
/// process is treated as contention instead of silently succeeding.
#[derive(Debug, Default)]
pub struct LockManager {
    held: HeldSet,
    always_contended: bool,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager whose every acquisition attempt sees contention.
    pub fn always_contended() -> Self {
        Self {
            held: HeldSet::default(),
            always_contended: true,
        }
    }

    /// Acquire the lock guarding `path`, retrying with backoff.
    pub async fn acquire(&self, path: &Path, config: &LockConfig) -> Result<LockGuard, LockError> {
        let lock_path = lock_path_for(path);
        let mut attempt = 0;
        loop {
            if let Some(guard) = self.try_acquire(&lock_path, config).await? {
                return Ok(guard);
            }
            if attempt >= config.retry.count {
                return Err(LockError::Contended {
                    path: lock_path,
                    attempts: attempt + 1,
                });
            }
            tokio::time::sleep(config.delay_for(attempt)).await;
            attempt += 1;
        }
    }

    /// Current on-disk status of the lock guarding `path`.
    pub async fn inspect(path: &Path, config: &LockConfig) -> Result<LockStatus, LockError> {
        let lock_path = lock_path_for(path);
        let status = match read_heartbeat(&lock_path).await? {
            None => LockStatus::Free,
            Some(heartbeat_ms) if is_stale(heartbeat_ms, config) => LockStatus::Stale,
            Some(_) => LockStatus::Active,
        };
        Ok(status)
    }

    /// One attempt. `Ok(None)` means someone else holds a live lock.
    ///
    /// Breaking a stale lock is check-then-remove, not atomic. Two processes
    /// that both see the same stale lock can both remove it, and the slower
    /// one may delete the lock the faster one just created. Both then believe
    /// they hold it. The lock is advisory and only narrows the window in which
    /// a read races a write, so this is tolerated.
    async fn try_acquire(
        &self,
        lock_path: &Path,
        config: &LockConfig,
    ) -> Result<Option<LockGuard>, LockError> {
        if self.always_contended {
            return Ok(None);
        }
        if !lock_set(&self.held).insert(lock_path.to_path_buf()) {
            return Ok(None);
        }

        // Second pass only happens after breaking a stale lock.
        for _ in 0..2 {
            match create_lock_file(lock_path).await {
                Ok(owner) => {
                    return Ok(Some(LockGuard::start(
                        lock_path.to_path_buf(),
                        owner,
                        Arc::clone(&self.held),
                        config.update_interval(),
                    )));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    lock_set(&self.held).remove(lock_path);
                    return Err(LockError::io("creating", lock_path, e));
                }
            }

            match read_heartbeat(lock_path).await {
                // Vanished between create and read: just try again.
                Ok(None) => continue,
                Ok(Some(heartbeat_ms)) if is_stale(heartbeat_ms, config) => {
                    log::debug!(
                        target: "tasklog::lock",
                        "breaking stale lock {} (heartbeat {} ms ago)",
                        lock_path.display(),
                        now_millis().saturating_sub(heartbeat_ms)
                    );
                    match fs::remove_file(lock_path).await {
                        Ok(()) => continue,
                        Err(e) if e.kind() == ErrorKind::NotFound => continue,
                        Err(e) => {
                            lock_set(&self.held).remove(lock_path);
                            return Err(LockError::io("breaking stale", lock_path, e));
                        }
                    }
                }
                Ok(Some(_)) => break,
                Err(e) => {
                    lock_set(&self.held).remove(lock_path);
                    return Err(e);
                }
            }
        }

        lock_set(&self.held).remove(lock_path);
        Ok(None)
    }
}

/// Release capability for a held lock.
///
/// Prefer [`LockGuard::release`], which reports failures. Dropping an
/// unreleased guard cleans up too, but silently.
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
    owner: String,
    held: HeldSet,
    stop: Option<oneshot::Sender<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl LockGuard {
    fn start(lock_path: PathBuf, owner: String, held: HeldSet, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let heartbeat = tokio::spawn(heartbeat_loop(
            lock_path.clone(),
            owner.clone(),
            interval,
            stop_rx,
        ));
        Self {
            lock_path,
            owner,
            held,
            stop: Some(stop_tx),
            heartbeat: Some(heartbeat),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Stop heartbeating and remove the sidecar file if we still own it.
    pub async fn release(mut self) -> Result<(), LockError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.heartbeat.take() {
            let _ = handle.await;
        }
        lock_set(&self.held).remove(&self.lock_path);

        match read_body(&self.lock_path).await? {
            Some(body) if body.owner == self.owner => fs::remove_file(&self.lock_path)
                .await
                .map_err(|e| LockError::io("removing", &self.lock_path, e)),
            _ => Err(LockError::Compromised {
                path: self.lock_path.clone(),
            }),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Already released.
        let Some(stop) = self.stop.take() else {
            return;
        };
        let _ = stop.send(());
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        lock_set(&self.held).remove(&self.lock_path);

        let owned = std::fs::read(&self.lock_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LockBody>(&bytes).ok())
            .is_some_and(|body| body.owner == self.owner);
        if owned {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

/// Refresh the heartbeat until stopped or until the lock is no longer ours.
///
/// The owner check and the rewrite are separate steps. A takeover landing
/// between them gets overwritten, and the other holder then finds the lock
/// lost on its own next tick or on release.
async fn heartbeat_loop(
    lock_path: PathBuf,
    owner: String,
    interval: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let still_ours = matches!(
            read_body(&lock_path).await,
            Ok(Some(ref body)) if body.owner == owner
        );
        if !still_ours {
            log::warn!(
                target: "tasklog::lock",
                "lock {} was taken over; stopping heartbeat",
                lock_path.display()
            );
            break;
        }
        if let Err(e) = fs::write(&lock_path, lock_body(&owner)).await {
            log::warn!(
                target: "tasklog::lock",
                "failed to refresh lock {}: {}",
                lock_path.display(),
                e
            );
            break;
        }
    }
}

/// Create the sidecar exclusively and stamp it. Returns the new owner id.
async fn create_lock_file(lock_path: &Path) -> std::io::Result<String> {
    let owner = Uuid::new_v4().to_string();
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
        .await?;
    file.write_all(&lock_body(&owner)).await?;
    file.flush().await?;
    Ok(owner)
}

fn lock_body(owner: &str) -> Vec<u8> {
    let body = LockBody {
        owner: owner.to_string(),
        pid: std::process::id(),
        heartbeat_ms: now_millis(),
    };
    serde_json::to_vec(&body).unwrap_or_default()
}

async fn read_body(lock_path: &Path) -> Result<Option<LockBody>, LockError> {
    match fs::read(lock_path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LockError::io("reading", lock_path, e)),
    }
}

/// Heartbeat of the lock at `lock_path`, `None` if there is no lock.
///
/// A body that does not parse (for example, caught mid-write) is judged by
/// the file's mtime instead, so a lock being created is never mistaken for
/// an abandoned one.
async fn read_heartbeat(lock_path: &Path) -> Result<Option<u64>, LockError> {
    let metadata = match fs::metadata(lock_path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LockError::io("inspecting", lock_path, e)),
    };
    let mtime_ms = metadata.modified().map(unix_millis).unwrap_or(0);

    match fs::read(lock_path).await {
        Ok(bytes) => Ok(Some(
            serde_json::from_slice::<LockBody>(&bytes)
                .map(|body| body.heartbeat_ms)
                .unwrap_or(mtime_ms),
        )),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LockError::io("reading", lock_path, e)),
    }
}

fn is_stale(heartbeat_ms: u64, config: &LockConfig) -> bool {
    now_millis().saturating_sub(heartbeat_ms) > config.stale_ms
}

fn lock_set(held: &HeldSet) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
    held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use tempfile::TempDir;

    fn fast_config() -> LockConfig {
        LockConfig {
            stale_ms: 10_000,
            update_interval_ms: 5_000,
            retry: RetryConfig {
                count: 2,
                backoff_factor: 2.0,
                min_delay_ms: 5,
                max_delay_ms: 20,
            },
        }
    }

    fn read_lock_body(path: &Path) -> LockBody {
        let bytes = std::fs::read(lock_path_for(path)).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn write_foreign_lock(path: &Path, heartbeat_ms: u64) {
        let body = serde_json::json!({
            "owner": "someone-else",
            "pid": 1,
            "heartbeat_ms": heartbeat_ms,
        });
        std::fs::write(lock_path_for(path), body.to_string()).unwrap();
    }

    #[tokio::test]
    async fn test_acquire_creates_stamped_sidecar() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ui_messages.json");
        let manager = LockManager::new();

        let guard = manager.acquire(&path, &fast_config()).await.unwrap();

        assert_eq!(guard.lock_path(), lock_path_for(&path));
        let body = read_lock_body(&path);
        assert_eq!(body.pid, std::process::id());
        assert!(now_millis() - body.heartbeat_ms < 5_000);

        guard.release().await.unwrap();
        assert!(!lock_path_for(&path).exists());
    }

    #[tokio::test]
    async fn test_second_acquire_in_process_is_contended() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ui_messages.json");
        let manager = LockManager::new();

        let guard = manager.acquire(&path, &fast_config()).await.unwrap();
        let err = manager.acquire(&path, &fast_config()).await.unwrap_err();
        assert!(matches!(err, LockError::Contended { attempts: 3, .. }));

        guard.release().await.unwrap();
        let again = manager.acquire(&path, &fast_config()).await.unwrap();
        again.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_live_lock_is_contended() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ui_messages.json");
        write_foreign_lock(&path, now_millis());

        let err = LockManager::new()
            .acquire(&path, &fast_config())
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Contended { .. }));
        assert_eq!(read_lock_body(&path).owner, "someone-else");
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ui_messages.json");
        write_foreign_lock(&path, now_millis() - 60_000);

        let guard = LockManager::new()
            .acquire(&path, &fast_config())
            .await
            .unwrap();
        assert_ne!(read_lock_body(&path).owner, "someone-else");
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_unparsable_body_uses_mtime() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ui_messages.json");
        let lock_path = lock_path_for(&path);

        // Fresh but half-written: treated as live.
        std::fs::write(&lock_path, "{\"own").unwrap();
        assert_eq!(
            LockManager::inspect(&path, &fast_config()).await.unwrap(),
            LockStatus::Active
        );
        assert!(
            LockManager::new()
                .acquire(&path, &fast_config())
                .await
                .is_err()
        );

        // Same body, old mtime: abandoned.
        let old = filetime::FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(&lock_path, old).unwrap();
        assert_eq!(
            LockManager::inspect(&path, &fast_config()).await.unwrap(),
            LockStatus::Stale
        );
        let guard = LockManager::new()
            .acquire(&path, &fast_config())
            .await
            .unwrap();
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_inspect_free() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ui_messages.json");
        assert_eq!(
            LockManager::inspect(&path, &fast_config()).await.unwrap(),
            LockStatus::Free
        );
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_timestamp() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ui_messages.json");
        let mut config = fast_config();
        config.update_interval_ms = 20;

        let guard = LockManager::new().acquire(&path, &config).await.unwrap();
        let first = read_lock_body(&path).heartbeat_ms;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let later = read_heartbeat(&lock_path_for(&path)).await.unwrap().unwrap();
        assert!(later > first, "heartbeat should move forward");
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_reports_takeover() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ui_messages.json");

        let guard = LockManager::new()
            .acquire(&path, &fast_config())
            .await
            .unwrap();
        write_foreign_lock(&path, now_millis());

        let err = guard.release().await.unwrap_err();
        assert!(matches!(err, LockError::Compromised { .. }));
        // Someone else's lock is left alone.
        assert_eq!(read_lock_body(&path).owner, "someone-else");
    }

    #[tokio::test]
    async fn test_drop_removes_sidecar() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ui_messages.json");
        let manager = LockManager::new();

        {
            let _guard = manager.acquire(&path, &fast_config()).await.unwrap();
            assert!(lock_path_for(&path).exists());
        }

        assert!(!lock_path_for(&path).exists());
        let guard = manager.acquire(&path, &fast_config()).await.unwrap();
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ui_messages.json");
        let manager = Arc::new(LockManager::new());
        let mut config = fast_config();
        config.retry.count = 10;
        config.retry.max_delay_ms = 50;

        let guard = manager.acquire(&path, &config).await.unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            guard.release().await.unwrap();
        });

        let waited = manager.acquire(&path, &config).await.unwrap();
        waited.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_always_contended() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("ui_messages.json");

        let err = LockManager::always_contended()
            .acquire(&path, &fast_config())
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Contended { attempts: 3, .. }));
        assert!(!lock_path_for(&path).exists());
    }
}
