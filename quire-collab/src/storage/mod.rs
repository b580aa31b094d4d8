//! Project storage boundary.
//!
//! The collaboration server only needs get/save semantics on whole
//! projects; everything else about the document store is opaque. Writers
//! that load, change and save a project hold its [`ProjectLocks`] guard.
//!
//! ```text
//! ┌──────────────┐  debounced saves  ┌───────────────────┐
//! │ EditPersister│ ────────────────► │ dyn ProjectStore  │
//! └──────────────┘                   └─────────┬─────────┘
//!                                    ┌─────────┴─────────┐
//!                                    ▼                   ▼
//!                          MemoryProjectStore   RocksProjectStore
//!                          (tests, ephemeral)   (CF "projects" + "metadata")
//! ```

pub mod locks;
pub mod memory;
pub mod rocks;

use async_trait::async_trait;
use quire_core::Project;
use uuid::Uuid;

pub use locks::ProjectLocks;
pub use memory::MemoryProjectStore;
pub use rocks::{ProjectMetadata, RocksProjectStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Whole-project document store.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Load a project; `Ok(None)` when it does not exist.
    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, StoreError>;

    /// Insert or replace a project.
    async fn save_project(&self, project: &Project) -> Result<(), StoreError>;

    /// Delete a project; returns whether it existed.
    async fn delete_project(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn list_projects(&self) -> Result<Vec<Uuid>, StoreError>;
}
