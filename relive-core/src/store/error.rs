use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("record {id} not found")]
    NotFound { id: i64 },
    #[error("store path not configured")]
    MissingStore,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
