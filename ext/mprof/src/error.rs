use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid sampling configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("sampler is already running")]
    AlreadyRunning,
    #[error("unsupported on this platform: {0}")]
    Unsupported(&'static str),
    #[error("no free thread pause slot")]
    NoPauseSlot,
    #[error("failed to install fault handlers: {0}")]
    FaultHandlers(#[source] io::Error),
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
    #[error("failed to spawn sampling thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to encode profile metadata: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
