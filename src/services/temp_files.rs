use crate::error::{ResolveError, Result};
use crate::models::{AllocationMode, TempFileHandle};
use crate::utils::validation::sanitize_file_name;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Length of the hex directory name derived from a reference id
const ID_DIR_LEN: usize = 16;

/// Allocates and tracks temp files for one hosting component.
///
/// Anonymous files live in the temp root under generated names; deterministic
/// files live under the persist root at a path derived from the owning
/// reference id. Files are only ever deleted through [`TempFileManager::release`].
#[derive(Debug)]
pub struct TempFileManager {
    temp_root: Option<PathBuf>,
    persist_root: Option<PathBuf>,
    handles: Vec<TempFileHandle>,
    epoch: u64,
}

impl TempFileManager {
    pub fn new(temp_root: Option<PathBuf>, persist_root: Option<PathBuf>) -> Self {
        Self {
            temp_root,
            persist_root,
            handles: Vec::new(),
            epoch: 0,
        }
    }

    pub fn persist_root(&self) -> Option<&Path> {
        self.persist_root.as_deref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Starts a new execution epoch and returns it.
    pub fn advance_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    pub fn handles(&self) -> &[TempFileHandle] {
        &self.handles
    }

    pub fn owned_by<'a>(
        &'a self,
        reference_id: &'a str,
    ) -> impl Iterator<Item = &'a TempFileHandle> + 'a {
        self.handles
            .iter()
            .filter(move |h| h.owning_reference_id == reference_id)
    }

    pub async fn allocate(
        &mut self,
        basis_name: &str,
        preferred_extension: &str,
        deterministic: bool,
        reference_id: &str,
    ) -> Result<TempFileHandle> {
        let stem = sanitize_file_name(basis_name);
        let extension = normalize_extension(preferred_extension);

        let handle = if deterministic {
            self.allocate_deterministic(&stem, &extension, reference_id)
                .await?
        } else {
            self.allocate_anonymous(&stem, &extension, reference_id)?
        };

        tracing::debug!(
            "Allocated {:?} temp file {} for reference {}",
            handle.mode,
            handle.path.display(),
            reference_id
        );

        self.handles.retain(|h| h.path != handle.path);
        self.handles.push(handle.clone());
        Ok(handle)
    }

    fn allocate_anonymous(
        &self,
        stem: &str,
        extension: &str,
        reference_id: &str,
    ) -> Result<TempFileHandle> {
        let root = self.temp_root.clone().unwrap_or_else(std::env::temp_dir);
        let temp_file = tempfile::Builder::new()
            .prefix(&format!("{}-", stem))
            .suffix(extension)
            .tempfile_in(&root)
            .map_err(|e| {
                ResolveError::MaterializationFailed(format!(
                    "cannot create temp file in {}: {}",
                    root.display(),
                    e
                ))
            })?;
        let (_file, path) = temp_file
            .keep()
            .map_err(|e| ResolveError::MaterializationFailed(e.to_string()))?;

        Ok(self.handle(path, reference_id, AllocationMode::Anonymous))
    }

    async fn allocate_deterministic(
        &self,
        stem: &str,
        extension: &str,
        reference_id: &str,
    ) -> Result<TempFileHandle> {
        let root = self.persist_root.as_ref().ok_or_else(|| {
            ResolveError::EnvironmentUnavailable(
                "no persist directory configured for locally stored files".to_string(),
            )
        })?;
        let dir = root.join(id_dir_name(reference_id));
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            ResolveError::MaterializationFailed(format!(
                "cannot create {}: {}",
                dir.display(),
                e
            ))
        })?;

        let path = dir.join(format!("{}{}", stem, extension));
        Ok(self.handle(path, reference_id, AllocationMode::Deterministic))
    }

    fn handle(&self, path: PathBuf, reference_id: &str, mode: AllocationMode) -> TempFileHandle {
        TempFileHandle {
            path,
            owning_reference_id: reference_id.to_string(),
            mode,
            epoch: self.epoch,
            allocated_at: Utc::now(),
        }
    }

    /// Takes ownership of a handle created by an earlier instance, e.g. a
    /// persisted file reloaded from saved internals.
    pub fn adopt(&mut self, handle: TempFileHandle) {
        self.handles.retain(|h| h.path != handle.path);
        self.handles.push(handle);
    }

    /// Gives up ownership of every tracked file; they are no longer deleted by
    /// this manager.
    pub fn detach_all(&mut self) -> Vec<TempFileHandle> {
        std::mem::take(&mut self.handles)
    }

    /// Deletes the file behind `handle`. Releasing a handle this manager does
    /// not track, or whose file is already gone, is a no-op.
    pub async fn release(&mut self, handle: &TempFileHandle) -> Result<()> {
        let Some(idx) = self.handles.iter().position(|h| h.path == handle.path) else {
            tracing::debug!(
                "Ignoring release of untracked temp file {}",
                handle.path.display()
            );
            return Ok(());
        };

        match tokio::fs::remove_file(&handle.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    "Failed to delete temp file {}: {}",
                    handle.path.display(),
                    e
                );
                return Err(ResolveError::MaterializationFailed(format!(
                    "cannot delete {}: {}",
                    handle.path.display(),
                    e
                )));
            }
        }

        if handle.is_deterministic() {
            if let Some(parent) = handle.path.parent() {
                remove_dir_if_empty(parent).await;
            }
        }

        self.handles.remove(idx);
        tracing::debug!("Released temp file {}", handle.path.display());
        Ok(())
    }

    /// Releases every tracked handle matching `filter` and returns how many
    /// were released.
    pub async fn release_where<F>(&mut self, filter: F) -> usize
    where
        F: Fn(&TempFileHandle) -> bool,
    {
        let targets: Vec<TempFileHandle> =
            self.handles.iter().filter(|h| filter(h)).cloned().collect();

        let mut released = 0;
        for handle in &targets {
            match self.release(handle).await {
                Ok(()) => released += 1,
                Err(e) => tracing::warn!("{}", e),
            }
        }
        released
    }
}

impl Drop for TempFileManager {
    fn drop(&mut self) {
        for handle in self
            .handles
            .iter()
            .filter(|h| h.mode == AllocationMode::Anonymous)
        {
            let _ = std::fs::remove_file(&handle.path);
        }
    }
}

/// Stable directory name for a reference id.
pub fn id_dir_name(reference_id: &str) -> String {
    let digest = hex::encode(Sha256::digest(reference_id.as_bytes()));
    digest[..ID_DIR_LEN].to_string()
}

fn normalize_extension(extension: &str) -> String {
    let trimmed = extension.trim().trim_start_matches('.');
    if trimmed.is_empty()
        || !trimmed
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return String::new();
    }
    format!(".{}", trimmed)
}

async fn remove_dir_if_empty(dir: &Path) {
    let is_empty = match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    };
    if is_empty {
        if let Err(e) = tokio::fs::remove_dir(dir).await {
            tracing::debug!("Could not remove {}: {}", dir.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_dir_name_is_stable() {
        assert_eq!(id_dir_name("slot-1"), id_dir_name("slot-1"));
        assert_ne!(id_dir_name("slot-1"), id_dir_name("slot-2"));
        assert_eq!(id_dir_name("slot-1").len(), ID_DIR_LEN);
    }

    #[test]
    fn test_normalize_extension() {
        assert_eq!(normalize_extension(".csv"), ".csv");
        assert_eq!(normalize_extension("csv"), ".csv");
        assert_eq!(normalize_extension(""), "");
        assert_eq!(normalize_extension(".c/sv"), "");
    }

    #[tokio::test]
    async fn test_anonymous_allocation_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = TempFileManager::new(Some(dir.path().to_path_buf()), None);

        let a = manager.allocate("report", ".csv", false, "slot-1").await.unwrap();
        let b = manager.allocate("report", ".csv", false, "slot-1").await.unwrap();
        assert_ne!(a.path, b.path);
        assert!(a.path.exists());
        assert!(a.path.file_name().unwrap().to_str().unwrap().ends_with(".csv"));
        assert_eq!(manager.handles().len(), 2);

        manager.release(&a).await.unwrap();
        assert!(!a.path.exists());
        // Second release is a no-op.
        manager.release(&a).await.unwrap();
        assert_eq!(manager.handles().len(), 1);
    }

    #[tokio::test]
    async fn test_deterministic_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = TempFileManager::new(None, Some(dir.path().to_path_buf()));

        let a = manager.allocate("report", ".csv", true, "slot-1").await.unwrap();
        let b = manager.allocate("report", ".csv", true, "slot-1").await.unwrap();
        assert_eq!(a.path, b.path);
        assert_eq!(manager.handles().len(), 1);
        assert!(a.path.starts_with(dir.path()));

        tokio::fs::write(&a.path, b"x").await.unwrap();
        let parent = a.path.parent().unwrap().to_path_buf();
        manager.release(&a).await.unwrap();
        assert!(!a.path.exists());
        assert!(!parent.exists());
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_deterministic_requires_root() {
        let mut manager = TempFileManager::new(None, None);
        let err = manager.allocate("report", ".csv", true, "slot-1").await.unwrap_err();
        assert!(matches!(err, ResolveError::EnvironmentUnavailable(_)));
    }

    #[tokio::test]
    async fn test_release_where_filters_by_mode() {
        let temp = tempfile::tempdir().unwrap();
        let persist = tempfile::tempdir().unwrap();
        let mut manager = TempFileManager::new(
            Some(temp.path().to_path_buf()),
            Some(persist.path().to_path_buf()),
        );
        let anon = manager.allocate("a", ".txt", false, "slot-1").await.unwrap();
        let kept = manager.allocate("b", ".txt", true, "slot-2").await.unwrap();
        tokio::fs::write(&kept.path, b"keep").await.unwrap();

        let released = manager
            .release_where(|h| h.mode == AllocationMode::Anonymous)
            .await;
        assert_eq!(released, 1);
        assert!(!anon.path.exists());
        assert!(kept.path.exists());
        assert_eq!(manager.owned_by("slot-2").count(), 1);
    }
}
