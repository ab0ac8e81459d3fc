use thiserror::Error;

use crate::sources::SourceError;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to persist change: {0}")]
    Persistence(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = FeedError> = std::result::Result<T, E>;
