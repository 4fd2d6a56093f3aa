//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] store::Error),

    #[error("account not found: {0}")]
    NotFound(String),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
