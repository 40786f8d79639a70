//! Component factory: builds storage backends from configuration.

use crate::error::{Error, Result};
use crate::{StorageBackend, StorageConfig};

use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Builds per-source object stores and WAL directories from the storage
/// configuration.
pub struct ComponentFactory {
    config: StorageConfig,
}

impl ComponentFactory {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    /// Read the storage configuration from the environment.
    ///
    /// `STRATALAKE_STORAGE_BACKEND` selects `memory` or `local`;
    /// `STRATALAKE_DATA_PATH` points the local backend at its root directory.
    pub fn from_env() -> Result<Self> {
        let backend = std::env::var("STRATALAKE_STORAGE_BACKEND")
            .unwrap_or_else(|_| "local".to_string())
            .parse::<StorageBackend>()
            .map_err(Error::Config)?;
        let base_path = PathBuf::from(
            std::env::var("STRATALAKE_DATA_PATH").unwrap_or_else(|_| "./data".to_string()),
        );
        info!(backend = backend.as_str(), base_path = %base_path.display(), "Storage configured from environment");
        Ok(Self::new(StorageConfig { backend, base_path }))
    }

    pub fn storage_config(&self) -> &StorageConfig {
        &self.config
    }

    /// Object store holding one source's namespace (data files, catalog and
    /// index documents, checkpoints, backups).
    pub fn create_source_store(&self, source_id: &str) -> Result<Arc<dyn ObjectStore>> {
        match self.config.backend {
            StorageBackend::Memory => {
                info!(source_id, "Using in-memory object store");
                Ok(Arc::new(InMemory::new()))
            }
            StorageBackend::Local => {
                let root = self.source_dir(source_id).join("objects");
                std::fs::create_dir_all(&root)?;
                info!(source_id, root = %root.display(), "Using local filesystem object store");
                Ok(Arc::new(LocalFileSystem::new_with_prefix(&root)?))
            }
        }
    }

    /// Directory for one source's WAL segments.
    pub fn wal_dir(&self, source_id: &str) -> PathBuf {
        self.source_dir(source_id).join("wal")
    }

    fn source_dir(&self, source_id: &str) -> PathBuf {
        self.config.base_path.join("sources").join(source_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn memory_backend_builds_stores() {
        let factory = ComponentFactory::new(StorageConfig {
            backend: StorageBackend::Memory,
            base_path: PathBuf::from("/unused"),
        });
        assert!(factory.create_source_store("s1").is_ok());
    }

    #[test]
    fn local_backend_creates_directories() {
        let dir = TempDir::new().unwrap();
        let factory = ComponentFactory::new(StorageConfig {
            backend: StorageBackend::Local,
            base_path: dir.path().to_path_buf(),
        });
        factory.create_source_store("s1").unwrap();
        assert!(dir.path().join("sources/s1/objects").is_dir());
        assert!(factory.wal_dir("s1").ends_with("sources/s1/wal"));
    }
}
