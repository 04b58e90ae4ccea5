//! Atomic writes: temp file in the same directory, fsync, rename.
//!
//! The canonical file is never opened for writing. A reader racing a writer
//! sees either the old complete file or the new complete file. If the process
//! dies mid-write, the `.new_*.tmp` artifact stays behind and can be picked up
//! by [`crate::recovery::find_latest_artifact`].

use std::ffi::OsStr;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::StoreError;
use crate::paths::{ArtifactRole, temp_artifact_name};

/// Serialize `value` as compact JSON and write it atomically to `path`.
///
/// Serialization happens before anything touches the filesystem, so a value
/// that fails to serialize leaves no trace.
pub async fn atomic_write_json<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), StoreError> {
    let json = serde_json::to_vec(value).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    atomic_write(path, &json).await
}

/// Atomically replace the contents of `path` with `contents`.
///
/// On a write, flush or rename failure the temp artifact is left where it is
/// and the previous file at `path` is untouched.
pub async fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let parent = parent_dir(path);
    let base = path.file_name().and_then(OsStr::to_str).ok_or_else(|| {
        StoreError::io(
            "naming temp file for",
            path,
            io::Error::new(ErrorKind::InvalidInput, "path has no UTF-8 file name"),
        )
    })?;

    fs::create_dir_all(&parent)
        .await
        .map_err(|e| StoreError::io("creating directory", &parent, e))?;

    let tmp_path = parent.join(temp_artifact_name(
        base,
        ArtifactRole::New,
        now_millis(),
        &random_suffix(),
    ));

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&tmp_path)
        .await
        .map_err(|e| StoreError::io("creating temp file", &tmp_path, e))?;
    file.write_all(contents)
        .await
        .map_err(|e| StoreError::io("writing temp file", &tmp_path, e))?;
    file.flush()
        .await
        .map_err(|e| StoreError::io("flushing temp file", &tmp_path, e))?;
    file.sync_all()
        .await
        .map_err(|e| StoreError::io("syncing temp file", &tmp_path, e))?;
    drop(file);

    fs::rename(&tmp_path, path)
        .await
        .map_err(|e| StoreError::io("renaming temp file onto", path, e))?;

    sync_dir(&parent).await;
    Ok(())
}

/// Milliseconds since the Unix epoch for `time`, zero if before it.
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

pub fn now_millis() -> u64 {
    unix_millis(SystemTime::now())
}

fn random_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub(crate) fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Persist the rename itself. Best-effort: not every platform can fsync a directory.
async fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        let result = match fs::File::open(dir).await {
            Ok(handle) => handle.sync_all().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            log::debug!(target: "tasklog::safe_io", "directory fsync failed for {}: {}", dir.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}
