pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use tracing::info;

use flowline_core::config::{AppConfig, StorageBackend};
use flowline_core::error::Result;
use flowline_core::traits::Repositories;
use flowline_core::types::WorkflowDefinition;

/// The storage backend selected by `[storage]`.
#[derive(Clone)]
pub enum Store {
    Memory(Arc<MemoryStore>),
    Sqlite(Arc<SqliteStore>),
}

impl Store {
    pub fn open(config: &AppConfig) -> Result<Self> {
        match config.storage.backend {
            StorageBackend::Memory => {
                info!("Using in-memory storage");
                Ok(Self::Memory(Arc::new(MemoryStore::new())))
            }
            StorageBackend::Sqlite => {
                let path = config.database_path();
                info!(path = %path.display(), "Opening SQLite storage");
                Ok(Self::Sqlite(Arc::new(SqliteStore::open(&path)?)))
            }
        }
    }

    pub fn repositories(&self) -> Repositories {
        match self {
            Self::Memory(store) => Repositories::from_store(store.clone()),
            Self::Sqlite(store) => Repositories::from_store(store.clone()),
        }
    }

    pub fn seed_workflow(&self, definition: &WorkflowDefinition) -> Result<()> {
        match self {
            Self::Memory(store) => store.seed_workflow(definition),
            Self::Sqlite(store) => store.seed_workflow(definition),
        }
    }
}
