//! Upstream provider abstraction
//!
//! Describes *how* to talk to an upstream: the credential variants an account
//! can hold, the provider profile (endpoints and client identification), and
//! the header set each credential variant needs. The proxy matches on
//! `Credential` exhaustively instead of branching on string tags.

pub mod credential;
pub mod headers;
pub mod profile;

pub use credential::{ApiKeyCredential, AuthKind, Credential, OAuthCredential};
pub use headers::{
    HeaderInjection, apply_injections, build_upstream_headers, inject_system_prompt,
    merge_beta_flags, upstream_url,
};
pub use profile::{DEFAULT_PROVIDER, ProviderProfile, ProviderProfiles};

/// Classification of an upstream HTTP failure.
///
/// Only `CredentialRejected` drives failover; every other class propagates to
/// the client as an upstream error without retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// 401: the credential was rejected, try one alternative account
    CredentialRejected,
    /// 403: credential valid but not allowed to do this
    Forbidden,
    /// 429
    RateLimited,
    /// 529 / 503 from the provider
    Overloaded,
    /// Any other non-2xx status
    Upstream,
}

impl ErrorClassification {
    /// Label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::CredentialRejected => "credential_rejected",
            ErrorClassification::Forbidden => "forbidden",
            ErrorClassification::RateLimited => "rate_limited",
            ErrorClassification::Overloaded => "overloaded",
            ErrorClassification::Upstream => "upstream",
        }
    }

    pub fn triggers_failover(&self) -> bool {
        matches!(self, ErrorClassification::CredentialRejected)
    }
}

/// Classify an upstream error by HTTP status.
pub fn classify_status(status: u16) -> ErrorClassification {
    match status {
        401 => ErrorClassification::CredentialRejected,
        403 => ErrorClassification::Forbidden,
        429 => ErrorClassification::RateLimited,
        503 | 529 => ErrorClassification::Overloaded,
        _ => ErrorClassification::Upstream,
    }
}

/// Errors from building upstream requests.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid header value for {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("unknown provider profile: {0}")]
    UnknownProfile(String),
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;
