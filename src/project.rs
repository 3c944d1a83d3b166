//! Per-codebase persistent layout under `~/.coderag/projects/<h>/`, where
//! `h` is the first 16 hex chars of SHA-256 over the absolute codebase path.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Directory name of the legacy in-repo layout, removed on first run.
const LEGACY_DIR: &str = ".codebase-search";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub path: String,
    pub name: String,
    pub created_at: i64,
    pub last_accessed_at: i64,
}

/// Resolved on-disk locations for one project's index data.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub vectors_path: PathBuf,
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn project_hash(abs_root: &Path) -> String {
    let digest = Sha256::digest(abs_root.to_string_lossy().as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

/// Resolve (and create) the data directory for a codebase, refresh its
/// metadata file, and clean up the legacy in-repo layout.
pub fn resolve_layout(codebase_root: &Path, data_dir: Option<&Path>) -> Result<ProjectLayout> {
    let abs_root = codebase_root
        .canonicalize()
        .map_err(|e| Error::io(codebase_root.to_path_buf(), e))?;

    let data_dir = match data_dir {
        Some(dir) => dir.to_path_buf(),
        None => {
            let home = dirs::home_dir()
                .ok_or_else(|| Error::Config("cannot resolve home directory".into()))?;
            home.join(".coderag").join("projects").join(project_hash(&abs_root))
        }
    };
    std::fs::create_dir_all(&data_dir).map_err(|e| Error::io(data_dir.clone(), e))?;

    refresh_metadata(&data_dir, &abs_root)?;
    remove_legacy_layout(&abs_root);

    Ok(ProjectLayout {
        db_path: data_dir.join("index.db"),
        vectors_path: data_dir.join("vectors.json"),
        data_dir,
    })
}

fn refresh_metadata(data_dir: &Path, abs_root: &Path) -> Result<()> {
    let meta_path = data_dir.join("metadata.json");
    let now = now_ms();
    let created_at = std::fs::read_to_string(&meta_path)
        .ok()
        .and_then(|text| serde_json::from_str::<ProjectMetadata>(&text).ok())
        .map(|m| m.created_at)
        .unwrap_or(now);

    let name = abs_root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    let meta = ProjectMetadata {
        path: abs_root.to_string_lossy().into_owned(),
        name,
        created_at,
        last_accessed_at: now,
    };
    let text = serde_json::to_string_pretty(&meta)
        .map_err(|e| Error::Config(format!("metadata serialization: {e}")))?;
    std::fs::write(&meta_path, text).map_err(|e| Error::io(meta_path, e))?;
    Ok(())
}

/// Best-effort removal of the pre-release `.codebase-search/` directory
/// inside the codebase.
fn remove_legacy_layout(abs_root: &Path) {
    let legacy = abs_root.join(LEGACY_DIR);
    if legacy.is_dir() {
        match std::fs::remove_dir_all(&legacy) {
            Ok(()) => debug!(path = %legacy.display(), "removed legacy index directory"),
            Err(e) => warn!(path = %legacy.display(), error = %e, "failed to remove legacy index directory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_and_short() {
        let h1 = project_hash(Path::new("/home/user/project"));
        let h2 = project_hash(Path::new("/home/user/project"));
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 16);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(h1, project_hash(Path::new("/home/user/other")));
    }

    #[test]
    fn test_layout_creates_dir_and_metadata() {
        let repo = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let layout = resolve_layout(repo.path(), Some(data.path())).unwrap();
        assert!(layout.data_dir.is_dir());
        assert_eq!(layout.db_path.file_name().unwrap(), "index.db");

        let meta: ProjectMetadata = serde_json::from_str(
            &std::fs::read_to_string(layout.data_dir.join("metadata.json")).unwrap(),
        )
        .unwrap();
        assert!(meta.created_at > 0);
        assert_eq!(meta.created_at, meta.last_accessed_at);
    }

    #[test]
    fn test_metadata_preserves_created_at() {
        let repo = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        resolve_layout(repo.path(), Some(data.path())).unwrap();
        let first: ProjectMetadata = serde_json::from_str(
            &std::fs::read_to_string(data.path().join("metadata.json")).unwrap(),
        )
        .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        resolve_layout(repo.path(), Some(data.path())).unwrap();
        let second: ProjectMetadata = serde_json::from_str(
            &std::fs::read_to_string(data.path().join("metadata.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert!(second.last_accessed_at >= first.last_accessed_at);
    }

    #[test]
    fn test_legacy_dir_removed() {
        let repo = tempfile::tempdir().unwrap();
        let legacy = repo.path().join(LEGACY_DIR);
        std::fs::create_dir_all(legacy.join("sub")).unwrap();
        std::fs::write(legacy.join("old.db"), "x").unwrap();
        let data = tempfile::tempdir().unwrap();
        resolve_layout(repo.path(), Some(data.path())).unwrap();
        assert!(!legacy.exists());
    }
}
