//! Error types for credential lifecycle operations

/// Errors from token refresh and credential health checks.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Token endpoint answered non-2xx. `body` is already redacted.
    #[error("token refresh rejected ({status}): {body}")]
    RefreshRejected { status: u16, body: String },

    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    #[error("account {0} does not hold an oauth credential")]
    NotOAuth(String),

    #[error("account not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] store::Error),

    #[error("provider error: {0}")]
    Provider(#[from] provider::ProviderError),
}

impl Error {
    /// The refresh token itself was refused, as opposed to a transient failure.
    pub fn is_credential_rejection(&self) -> bool {
        matches!(self, Error::RefreshRejected { status: 400 | 401 | 403, .. })
    }
}

/// Result alias for lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;
