use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum UploadClientError {
    #[error("failed to run {command}: {source}")]
    Spawn { command: String, source: io::Error },
    #[error("{command} exited with status {status:?}: {detail}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        detail: String,
    },
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("upload client error: {0}")]
    Client(#[from] UploadClientError),
    #[error("login check failed, credentials rejected")]
    LoginRejected,
    #[error("failed to read submission metadata {path}: {source}")]
    MetaIo { path: PathBuf, source: io::Error },
    #[error("failed to parse submission metadata {path}: {source}")]
    MetaParse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("io error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

pub type UploadResult<T> = std::result::Result<T, UploadError>;
