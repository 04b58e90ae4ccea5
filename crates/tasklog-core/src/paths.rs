//! Task directory resolution and the on-disk naming conventions.

use std::future::Future;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

/// Role tag of a temp artifact left beside a canonical file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactRole {
    /// Fresh content on its way to the canonical name.
    New,
    /// Copy of previous content set aside during a write.
    Bak,
}

impl ArtifactRole {
    pub fn tag(self) -> &'static str {
        match self {
            ArtifactRole::New => "new",
            ArtifactRole::Bak => "bak",
        }
    }
}

/// Maps a storage root and task id to the task's directory.
///
/// Implementations may create the directory. Repeat calls with the same
/// arguments must return the same path.
pub trait TaskDirectoryResolver: Send + Sync {
    fn resolve(
        &self,
        storage_root: &Path,
        task_id: &str,
    ) -> impl Future<Output = io::Result<PathBuf>> + Send;
}

/// `<root>/tasks/<task_id>`, created on demand.
#[derive(Debug, Clone, Copy, Default)]
pub struct TasksDirResolver;

impl TaskDirectoryResolver for TasksDirResolver {
    async fn resolve(&self, storage_root: &Path, task_id: &str) -> io::Result<PathBuf> {
        validate_task_id(task_id)?;
        let dir = storage_root.join("tasks").join(task_id);
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}

/// Reject ids that would escape the tasks directory.
pub fn validate_task_id(task_id: &str) -> io::Result<()> {
    let bad = task_id.is_empty()
        || task_id == "."
        || task_id == ".."
        || task_id.contains(['/', '\\', '\0']);
    if bad {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("invalid task id '{}'", task_id),
        ));
    }
    Ok(())
}

/// `.{base}.{role}_{ts_ms}_{random}.tmp`
pub fn temp_artifact_name(base: &str, role: ArtifactRole, ts_ms: u64, random: &str) -> String {
    format!(".{}.{}_{}_{}.tmp", base, role.tag(), ts_ms, random)
}

/// Inverse of [`temp_artifact_name`]: the role if `name` is an artifact of `base`.
///
/// Only the prefix and suffix are checked, so artifacts written by other
/// tools with a differently shaped timestamp or disambiguator still count.
pub fn parse_temp_artifact_name(base: &str, name: &str) -> Option<ArtifactRole> {
    let rest = name.strip_prefix('.')?.strip_prefix(base)?.strip_prefix('.')?;
    if !rest.ends_with(".tmp") {
        return None;
    }
    [ArtifactRole::New, ArtifactRole::Bak]
        .into_iter()
        .find(|role| {
            rest.strip_prefix(role.tag())
                .is_some_and(|after| after.starts_with('_'))
        })
}

/// Sidecar lock file for a canonical path.
pub fn lock_path_for(canonical: &Path) -> PathBuf {
    let mut name = canonical.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}
