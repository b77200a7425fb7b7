//! Error types for key pool operations

/// Errors from key pool and key store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key store I/O error: {0}")]
    Io(String),

    #[error("key store serialization error: {0}")]
    Serialize(String),

    #[error("invalid key list: {0}")]
    InvalidKeys(String),
}

/// Result alias for key pool operations.
pub type Result<T> = std::result::Result<T, Error>;
