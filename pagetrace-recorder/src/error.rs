use pagetrace::{DomError, LocatorError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Replay engine error: {0}")]
    Engine(String),

    #[error("Messaging channel error: {0}")]
    Channel(String),

    #[error("Recorder state error: {0}")]
    State(String),

    #[error("Recording must be started from within a tokio runtime")]
    NoRuntime,

    #[error("Locator error: {0}")]
    Locator(#[from] LocatorError),

    #[error("DOM error: {0}")]
    Dom(#[from] DomError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RecorderError>;
