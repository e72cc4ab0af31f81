//! State Store Module
//!
//! Materializes replicated operations into local state. The replication
//! engine calls [`StateStore::apply`] for every entry it receives.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, TableCounts};

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{StoreBackend, StoreConfig};
use crate::oplog::Operation;

/// Why an operation could not be applied
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Operation rejected: {0}")]
    Rejected(String),
}

/// Sink for replicated operations
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Apply one operation. Applying an operation that is already reflected
    /// in the store must leave the store unchanged.
    async fn apply(&self, operation: &Operation) -> std::result::Result<(), ApplyError>;
}

/// Open the store selected by configuration
pub fn open_store(config: &StoreConfig, path: &Path) -> crate::Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.backend {
        StoreBackend::Sqlite => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    crate::Error::Store(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
            Arc::new(SqliteStore::open(path)?)
        }
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
    };
    tracing::info!("State store backend: {:?}", config.backend);
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_open_store_backends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.db");

        let sqlite = open_store(&StoreConfig { backend: StoreBackend::Sqlite }, &path).unwrap();
        sqlite.apply(&Operation::PostDeleted { post_id: 1 }).await.unwrap();
        assert!(path.exists());

        let memory = open_store(&StoreConfig { backend: StoreBackend::Memory }, &path).unwrap();
        memory.apply(&Operation::VoteDeleted { vote_id: 1 }).await.unwrap();
    }
}
