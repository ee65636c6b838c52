//! Storage layer: the branch/tag catalog contract and its two
//! interchangeable backends.

pub mod error;
pub mod memjson;
pub mod propagate;
pub mod sql;
mod state;
pub mod traits;

pub use error::{StorageError, StorageResult};
pub use memjson::MemJsonDatabase;
pub use sql::SqlDatabase;
pub use traits::{Branch, DepiDatabase};

use std::sync::Arc;

use crate::config::{DbKind, DepiConfig};

/// Open the storage backend selected by configuration.
pub async fn open_database(config: Arc<DepiConfig>) -> StorageResult<Arc<dyn DepiDatabase>> {
    match config.db.kind {
        DbKind::Memjson => Ok(Arc::new(MemJsonDatabase::new(config)?)),
        DbKind::Sql => Ok(Arc::new(SqlDatabase::new(config).await?)),
    }
}
