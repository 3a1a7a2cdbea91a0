//! Optional external persistence for rollback points.
//!
//! The in-memory store is the source of truth while the process runs. An
//! adapter only mirrors stores and removals so outstanding points can be
//! reloaded after a restart; its failures are logged by the store and never
//! fail the in-memory operation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::types::RollbackPoint;

/// Trait for mirroring rollback points to external storage.
#[async_trait]
pub trait RollbackPersistence: Send + Sync {
    /// Insert or replace a rollback point.
    async fn save(&self, point: &RollbackPoint) -> Result<()>;

    /// Delete a rollback point. Deleting an unknown id is not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Load every stored rollback point.
    async fn load_all(&self) -> Result<Vec<RollbackPoint>>;
}

/// Persistence that stores nothing; the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersistence;

#[async_trait]
impl RollbackPersistence for NoopPersistence {
    async fn save(&self, _point: &RollbackPoint) -> Result<()> {
        Ok(())
    }

    async fn delete(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<RollbackPoint>> {
        Ok(Vec::new())
    }
}

/// Stores each rollback point as `<dir>/<id>.json`.
///
/// Writes go to a temp file in the same directory and are renamed into
/// place, so a crash never leaves a half-written point behind.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    dir: PathBuf,
}

impl JsonFilePersistence {
    /// Create the adapter, creating `dir` if needed.
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create persistence directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn point_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(|c: char| c == '/' || c == '\\') || id.starts_with('.') {
            anyhow::bail!("Rollback point id '{}' is not a valid file name", id);
        }
        Ok(self.dir.join(format!("{id}.json")))
    }
}

#[async_trait]
impl RollbackPersistence for JsonFilePersistence {
    async fn save(&self, point: &RollbackPoint) -> Result<()> {
        let path = self.point_path(&point.id)?;
        let temp_path = self.dir.join(format!(".{}.json.tmp", point.id));
        let contents = serde_json::to_vec_pretty(point)?;

        if let Err(e) = tokio::fs::write(&temp_path, &contents).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e).with_context(|| format!("Failed to write {}", temp_path.display()));
        }
        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e).with_context(|| {
                format!("Failed to rename {} to {}", temp_path.display(), path.display())
            });
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = self.point_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }

    async fn load_all(&self) -> Result<Vec<RollbackPoint>> {
        let mut points = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read {}", self.dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_point = path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_point {
                continue;
            }
            let contents = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<RollbackPoint>(&contents) {
                Ok(point) => points.push(point),
                Err(e) => {
                    tracing::warn!("Skipping unreadable rollback point {}: {}", path.display(), e);
                }
            }
        }

        points.sort_by_key(|p| p.timestamp);
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_save_load_delete() {
        let dir = tempdir().expect("tempdir");
        let persistence = JsonFilePersistence::new(dir.path().join("points"))
            .await
            .unwrap();

        let first = RollbackPoint::new("before-rename").with_session("session-a");
        let second = RollbackPoint::new("before-reindex");
        persistence.save(&first).await.unwrap();
        persistence.save(&second).await.unwrap();

        let loaded = persistence.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(&first));

        persistence.delete(&first.id).await.unwrap();
        // Deleting twice is fine
        persistence.delete(&first.id).await.unwrap();

        let loaded = persistence.load_all().await.unwrap();
        assert_eq!(loaded, vec![second]);
    }

    #[tokio::test]
    async fn test_skips_corrupt_files() {
        let dir = tempdir().expect("tempdir");
        let persistence = JsonFilePersistence::new(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("broken.json"), b"{not json")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), b"ignored")
            .await
            .unwrap();

        let point = RollbackPoint::new("ok");
        persistence.save(&point).await.unwrap();

        assert_eq!(persistence.load_all().await.unwrap(), vec![point]);
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = tempdir().expect("tempdir");
        let persistence = JsonFilePersistence::new(dir.path()).await.unwrap();
        let mut point = RollbackPoint::new("escape");
        point.id = "../outside".to_string();

        assert!(persistence.save(&point).await.is_err());
        assert!(persistence.delete("a/b").await.is_err());
    }
}
