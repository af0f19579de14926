use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use uuid::Uuid;

/// Every temp artifact this worker creates starts with this
pub const TEMP_PREFIX: &str = "sticker-";

/// Temp files owned by one job; removed on `cleanup` or drop
#[derive(Debug)]
pub struct TempArtifacts {
    dir: PathBuf,
    paths: Vec<PathBuf>,
}

impl TempArtifacts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            paths: Vec::new(),
        }
    }

    /// Reserve and track a unique path; the file itself is not created
    pub fn allocate(&mut self, extension: &str) -> PathBuf {
        let path = self
            .dir
            .join(format!("{}{}.{}", TEMP_PREFIX, Uuid::new_v4(), extension));
        self.paths.push(path.clone());
        path
    }

    pub fn tracked(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Ensure the temp directory exists
    pub async fn prepare(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    /// Delete everything tracked; errors are swallowed
    pub async fn cleanup(&mut self) {
        for path in self.paths.drain(..) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("🗑️  Deleted temp file: {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => debug!("Failed to delete temp file {}: {}", path.display(), e),
            }
        }
    }
}

impl Drop for TempArtifacts {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            let _ = std::fs::remove_file(&path);
        }
    }
}

/// Remove temp artifacts older than `older_than` left behind by a previous process
pub async fn cleanup_orphaned_temp_files(dir: &Path, older_than: Duration) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    debug!("🔍 Checking for orphaned temp files in {}...", dir.display());

    let orphans = tokio::task::spawn_blocking({
        let dir = dir.to_path_buf();
        move || {
            let now = SystemTime::now();
            let mut orphans = Vec::new();
            for entry in walkdir::WalkDir::new(&dir)
                .max_depth(1)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let is_ours = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(TEMP_PREFIX))
                    .unwrap_or(false);
                if !is_ours {
                    continue;
                }
                let age = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|mtime| now.duration_since(mtime).ok());
                if matches!(age, Some(age) if age >= older_than) {
                    orphans.push(path.to_path_buf());
                }
            }
            orphans
        }
    })
    .await
    .context("Failed to scan for orphaned temp files")?;

    let mut cleaned_count = 0;
    for orphan in orphans {
        match tokio::fs::remove_file(&orphan).await {
            Ok(()) => {
                info!("🗑️  Deleted orphaned temp file: {}", orphan.display());
                cleaned_count += 1;
            }
            Err(e) => warn!("Failed to delete orphaned temp file {}: {}", orphan.display(), e),
        }
    }

    if cleaned_count > 0 {
        info!("✅ Cleaned up {} orphaned temp file(s)", cleaned_count);
    } else {
        debug!("No orphaned temp files found");
    }

    Ok(cleaned_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_allocated_paths_are_unique_and_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let mut temps = TempArtifacts::new(dir.path());
        let a = temps.allocate("webm");
        let b = temps.allocate("webm");
        assert_ne!(a, b);
        assert!(a.file_name().unwrap().to_str().unwrap().starts_with(TEMP_PREFIX));

        tokio::fs::write(&a, b"x").await.unwrap();
        // b is never created; cleanup must not trip over it
        temps.cleanup().await;
        assert!(!a.exists());
        assert!(temps.tracked().is_empty());
    }

    #[test]
    fn test_drop_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut temps = TempArtifacts::new(dir.path());
            let path = temps.allocate("bin");
            std::fs::write(&path, b"payload").unwrap();
            path
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_orphan_sweep_only_touches_our_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let ours = dir.path().join(format!("{}old.webm", TEMP_PREFIX));
        let foreign = dir.path().join("keep.webm");
        std::fs::write(&ours, b"x").unwrap();
        std::fs::write(&foreign, b"x").unwrap();

        let removed = cleanup_orphaned_temp_files(dir.path(), Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!ours.exists());
        assert!(foreign.exists());

        let fresh = dir.path().join(format!("{}fresh.webm", TEMP_PREFIX));
        std::fs::write(&fresh, b"x").unwrap();
        let removed = cleanup_orphaned_temp_files(dir.path(), Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 0);
        assert!(fresh.exists());
    }
}
