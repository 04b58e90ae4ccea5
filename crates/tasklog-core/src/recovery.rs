//! Finding (and, on request, clearing) temp artifacts left by interrupted writes.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::fs;

use crate::error::StoreError;
use crate::paths::{ArtifactRole, parse_temp_artifact_name};

/// A `.{base}.{new|bak}_*.tmp` file found beside a canonical file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempArtifact {
    pub path: PathBuf,
    pub role: ArtifactRole,
    pub modified: SystemTime,
}

impl TempArtifact {
    /// Modified within `window` of now, so a writer may still be filling it
    /// in or about to rename it. An mtime in the future counts as fresh.
    pub fn is_in_flight(&self, window: Duration) -> bool {
        self.modified.elapsed().map_or(true, |age| age < window)
    }
}

/// All temp artifacts for `base` in `dir`, newest first.
///
/// Ties on mtime are broken by file name (descending) so the order is
/// reproducible. A missing directory has no artifacts.
pub async fn list_artifacts(dir: &Path, base: &str) -> Result<Vec<TempArtifact>, StoreError> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io("listing directory", dir, e)),
    };

    let mut artifacts = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::io("listing directory", dir, e))?
    {
        let name = entry.file_name();
        let Some(role) = name
            .to_str()
            .and_then(|name| parse_temp_artifact_name(base, name))
        else {
            continue;
        };

        let path = entry.path();
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            // Renamed or removed by a concurrent writer since the listing.
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(StoreError::io("inspecting", &path, e)),
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata
            .modified()
            .map_err(|e| StoreError::io("reading mtime of", &path, e))?;

        artifacts.push(TempArtifact {
            path,
            role,
            modified,
        });
    }

    artifacts.sort_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then_with(|| b.path.file_name().cmp(&a.path.file_name()))
    });
    Ok(artifacts)
}

/// The most recently modified temp artifact for `base` in `dir`.
pub async fn find_latest_artifact(dir: &Path, base: &str) -> Result<Option<PathBuf>, StoreError> {
    Ok(list_artifacts(dir, base)
        .await?
        .into_iter()
        .next()
        .map(|artifact| artifact.path))
}

/// Delete temp artifacts for `base` in `dir` that have been idle for at
/// least `min_age`. Returns how many went away.
///
/// Younger artifacts may belong to a write that has not renamed yet and are
/// left alone. This throws away recovery material: only call it once the
/// canonical file is known to be good.
pub async fn prune_artifacts(
    dir: &Path,
    base: &str,
    min_age: Duration,
) -> Result<usize, StoreError> {
    let mut removed = 0;
    let mut skipped = 0;
    for artifact in list_artifacts(dir, base).await? {
        if artifact.is_in_flight(min_age) {
            skipped += 1;
            continue;
        }
        match fs::remove_file(&artifact.path).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io("removing artifact", &artifact.path, e)),
        }
    }
    if removed > 0 || skipped > 0 {
        log::debug!(
            target: "tasklog::recovery",
            "pruned {} temp artifact(s) for {} in {}, kept {} still in flight",
            removed,
            base,
            dir.display(),
            skipped
        );
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use tempfile::TempDir;

    const BASE: &str = "api_conversation_history.json";
    const STALE: Duration = Duration::from_secs(31);

    fn artifact(dir: &Path, name: &str, mtime_secs: i64) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "[]").unwrap();
        filetime::set_file_mtime(&path, FileTime::from_unix_time(mtime_secs, 0)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_no_candidates() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(BASE), "[]").unwrap();
        std::fs::write(temp_dir.path().join("notes.tmp"), "").unwrap();

        assert_eq!(find_latest_artifact(temp_dir.path(), BASE).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_directory_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("gone");
        assert_eq!(find_latest_artifact(&missing, BASE).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_picks_greatest_mtime_across_roles() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        artifact(dir, ".api_conversation_history.json.new_100_a.tmp", 1_700_000_100);
        let newest = artifact(dir, ".api_conversation_history.json.bak_50_b.tmp", 1_700_000_300);
        artifact(dir, ".api_conversation_history.json.new_300_c.tmp", 1_700_000_200);
        // Other log's artifact is newer still but must be ignored.
        artifact(dir, ".ui_messages.json.new_999_d.tmp", 1_700_000_900);

        assert_eq!(find_latest_artifact(dir, BASE).await.unwrap(), Some(newest));
    }

    #[tokio::test]
    async fn test_ties_are_reproducible() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        artifact(dir, ".api_conversation_history.json.new_1_a.tmp", 1_700_000_000);
        let z = artifact(dir, ".api_conversation_history.json.new_1_z.tmp", 1_700_000_000);

        for _ in 0..3 {
            assert_eq!(find_latest_artifact(dir, BASE).await.unwrap(), Some(z.clone()));
        }
    }

    #[tokio::test]
    async fn test_list_reports_roles_newest_first() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        artifact(dir, ".api_conversation_history.json.bak_1_a.tmp", 1_700_000_000);
        artifact(dir, ".api_conversation_history.json.new_2_b.tmp", 1_700_000_500);

        let listed = list_artifacts(dir, BASE).await.unwrap();
        let roles: Vec<_> = listed.iter().map(|a| a.role).collect();
        assert_eq!(roles, vec![ArtifactRole::New, ArtifactRole::Bak]);
    }

    #[tokio::test]
    async fn test_directories_are_not_candidates() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        std::fs::create_dir(dir.join(".api_conversation_history.json.new_1_a.tmp")).unwrap();

        assert_eq!(find_latest_artifact(dir, BASE).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_prune_only_touches_matching_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        artifact(dir, ".api_conversation_history.json.new_1_a.tmp", 1_700_000_000);
        artifact(dir, ".api_conversation_history.json.bak_2_b.tmp", 1_700_000_000);
        let other = artifact(dir, ".ui_messages.json.new_3_c.tmp", 1_700_000_000);
        std::fs::write(dir.join(BASE), "[]").unwrap();

        assert_eq!(prune_artifacts(dir, BASE, STALE).await.unwrap(), 2);
        assert!(list_artifacts(dir, BASE).await.unwrap().is_empty());
        assert!(other.exists());
        assert!(dir.join(BASE).exists());
        assert_eq!(prune_artifacts(dir, BASE, STALE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_prune_keeps_fresh_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        let old = artifact(dir, ".api_conversation_history.json.new_1_a.tmp", 1_700_000_000);
        let fresh = dir.join(".api_conversation_history.json.new_2_b.tmp");
        std::fs::write(&fresh, "[{\"role\":").unwrap();

        assert_eq!(prune_artifacts(dir, BASE, STALE).await.unwrap(), 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn test_in_flight_window() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        artifact(dir, ".api_conversation_history.json.new_1_a.tmp", 1_700_000_000);
        std::fs::write(dir.join(".api_conversation_history.json.new_2_b.tmp"), "[]").unwrap();

        let listed = list_artifacts(dir, BASE).await.unwrap();
        assert!(listed[0].is_in_flight(STALE));
        assert!(!listed[1].is_in_flight(STALE));
    }
}
