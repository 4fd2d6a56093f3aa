//! Error types for usage metering

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] store::Error),

    #[error("invalid pricing for {model}: {reason}")]
    InvalidPricing { model: String, reason: String },
}

/// Result alias for usage operations.
pub type Result<T> = std::result::Result<T, Error>;
