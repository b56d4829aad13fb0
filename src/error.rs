use thiserror::Error;

#[derive(Error, Debug)]
pub enum StokerError {
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("job not found: {0}")]
    NotFound(crate::JobId),

    #[error("corrupt job record: {0}")]
    Corrupt(crate::JobId),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("job has not been saved yet")]
    Unsaved,

    #[error("handler error: {0}")]
    Handler(#[from] anyhow::Error),

    #[error("worker error: {0}")]
    Worker(String),
}

pub type Result<T> = std::result::Result<T, StokerError>;
