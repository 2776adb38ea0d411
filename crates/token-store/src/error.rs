//! Error types for token storage operations

/// Errors from token storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("token file parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
