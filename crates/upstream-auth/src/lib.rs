//! OAuth credential lifecycle for upstream accounts
//!
//! Detects expiring OAuth tokens, refreshes them against the provider's token
//! endpoint, persists the new token set through the store, and runs live
//! health pings. API-key accounts pass through untouched except for health
//! checks.
//!
//! Refresh flow:
//! 1. `LifecycleManager::ensure_valid_token` sees the token expires within an hour
//! 2. Concurrent callers for the same account queue on a per-account lock
//! 3. The first caller POSTs `grant_type=refresh_token` via `token::refresh_token`
//! 4. New tokens are written with `AccountPatch::ReplaceOAuth`
//! 5. Callers that waited re-read the store and reuse the fresh token

pub mod error;
pub mod lifecycle;
pub mod token;

pub use error::{Error, Result};
pub use lifecycle::{EXPIRY_MARGIN, HealthReport, LifecycleManager, is_expiring_soon};
pub use token::{TokenResponse, refresh_token};
