pub mod codec;
pub mod collector;
pub mod writer;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use codec::{encode, escape, iter_payloads, pack, parse, unescape, PayloadIter};
pub use collector::{CollectorConfig, CollectorOutcome, CollectorState, DanmakuCollector};
pub use writer::{ChatLogWriter, DanmakuStyle};

#[derive(Debug, Error)]
pub enum DanmakuError {
    #[error("io error on chat log {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

pub type DanmakuResult<T> = std::result::Result<T, DanmakuError>;
