use crate::core::io::Storage;
use crate::core::state::{BatchProgress, Project};
use anyhow::{Context, Result};
use log::{debug, info};
use std::sync::{Arc, Mutex, RwLock};

/// Shared handle to the project.
///
/// Clones share the same project. Every write goes through [`ProjectStore::update`]
/// or [`ProjectStore::try_update`], which commit in memory and then save the
/// project when a storage backend is attached.
#[derive(Clone)]
pub struct ProjectStore {
    project: Arc<RwLock<Project>>,
    batch: Arc<Mutex<Option<BatchProgress>>>,
    persistence: Option<Persistence>,
}

#[derive(Clone)]
struct Persistence {
    storage: Arc<dyn Storage>,
    path: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl ProjectStore {
    /// In-memory only store.
    pub fn new(project: Project) -> Self {
        Self {
            project: Arc::new(RwLock::new(project)),
            batch: Arc::new(Mutex::new(None)),
            persistence: None,
        }
    }

    /// Loads the project at `path`, or starts an empty one if nothing is saved yet.
    pub async fn open(storage: Arc<dyn Storage>, path: &str) -> Result<Self> {
        let project = if storage.exists(path).await? {
            let bytes = storage.read(path).await?;
            let content = String::from_utf8(bytes)?;
            let project: Project = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse project file {}", path))?;
            info!(
                "Loaded project from {} ({} planned, {} written)",
                path,
                project.episode_plan().len(),
                project.episodes().len()
            );
            project
        } else {
            info!("No project at {}, starting a new one", path);
            Project::default()
        };

        Ok(Self {
            project: Arc::new(RwLock::new(project)),
            batch: Arc::new(Mutex::new(None)),
            persistence: Some(Persistence {
                storage,
                path: path.to_string(),
                lock: Arc::new(tokio::sync::Mutex::new(())),
            }),
        })
    }

    pub fn snapshot(&self) -> Project {
        self.read(Project::clone)
    }

    pub fn read<R>(&self, f: impl FnOnce(&Project) -> R) -> R {
        let guard = self.project.read().unwrap_or_else(|e| e.into_inner());
        f(&*guard)
    }

    /// Applies `f` in memory only. For state that is never persisted.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Project) -> R) -> R {
        let mut guard = self.project.write().unwrap_or_else(|e| e.into_inner());
        f(&mut *guard)
    }

    /// Applies `f` and saves the result.
    pub async fn update<R>(&self, f: impl FnOnce(&mut Project) -> R) -> Result<R> {
        let result = self.mutate(f);
        self.save().await?;
        Ok(result)
    }

    /// Applies `f`; saves only when it succeeds. The outer error is a storage
    /// failure, the inner one is whatever `f` rejected.
    pub async fn try_update<T, E>(
        &self,
        f: impl FnOnce(&mut Project) -> std::result::Result<T, E>,
    ) -> Result<std::result::Result<T, E>> {
        let result = self.mutate(f);
        if result.is_ok() {
            self.save().await?;
        }
        Ok(result)
    }

    /// Writes the current project to storage, if any.
    ///
    /// Saves are serialized and each one snapshots the project after taking the
    /// save lock, so the last save to finish always holds the newest state.
    pub async fn save(&self) -> Result<()> {
        let Some(p) = &self.persistence else {
            return Ok(());
        };
        let _saving = p.lock.lock().await;
        let content = self.read(serde_json::to_string_pretty)?;
        p.storage
            .write(&p.path, content.as_bytes())
            .await
            .with_context(|| format!("Failed to save project to {}", p.path))?;
        debug!("Saved project to {}", p.path);
        Ok(())
    }

    // --- Batch progress (never persisted) ---

    pub fn batch_progress(&self) -> Option<BatchProgress> {
        *self.batch.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks a batch as running. Returns false when one already is.
    pub fn begin_batch(&self, total: usize) -> bool {
        let mut guard = self.batch.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return false;
        }
        *guard = Some(BatchProgress { current: 0, total });
        true
    }

    pub fn set_batch_progress(&self, progress: BatchProgress) {
        *self.batch.lock().unwrap_or_else(|e| e.into_inner()) = Some(progress);
    }

    pub fn end_batch(&self) {
        *self.batch.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::InMemoryStorage;
    use crate::core::plan::EpisodePlanEntry;

    #[tokio::test]
    async fn test_update_persists_and_reopens() -> Result<()> {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let store = ProjectStore::open(storage.clone(), "project.json").await?;
        store.update(|p| p.set_idea("a sword that remembers")).await?;
        store.update(|p| p.put_episode(1, "EP1")).await?;

        let reopened = ProjectStore::open(storage, "project.json").await?;
        let project = reopened.snapshot();
        assert_eq!(project.idea(), "a sword that remembers");
        assert_eq!(project.episode(1), Some("EP1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_try_update_rejection_does_not_save() -> Result<()> {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let store = ProjectStore::open(storage.clone(), "project.json").await?;

        let rejected = store
            .try_update(|p| p.append_plan(vec![EpisodePlanEntry::new(0, "x", "y")]))
            .await?;
        assert!(rejected.is_err());
        assert!(!storage.exists("project.json").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_mutate_does_not_save() -> Result<()> {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let store = ProjectStore::open(storage.clone(), "project.json").await?;
        store.mutate(|p| p.set_idea("unsaved"));
        assert_eq!(store.read(|p| p.idea().to_string()), "unsaved");
        assert!(!storage.exists("project.json").await?);
        Ok(())
    }

    #[test]
    fn test_batch_guard() {
        let store = ProjectStore::new(Project::default());
        assert!(store.begin_batch(3));
        assert!(!store.begin_batch(3));
        assert_eq!(store.batch_progress(), Some(BatchProgress { current: 0, total: 3 }));
        store.end_batch();
        assert!(store.batch_progress().is_none());
        assert!(store.begin_batch(1));
    }

    #[tokio::test]
    async fn test_clones_share_state() -> Result<()> {
        let store = ProjectStore::new(Project::default());
        let observer = store.clone();
        store.update(|p| p.put_episode(3, "three")).await?;
        assert_eq!(observer.read(|p| p.episode(3).map(str::to_string)), Some("three".to_string()));
        Ok(())
    }
}
