//! Persistence boundary for the gateway core
//!
//! The core never talks to a database directly. Everything it reads or writes
//! goes through the [`Store`] trait: upstream accounts, inbound API keys and
//! usage records. [`JsonStore`] is the bundled implementation, an in-memory
//! state optionally backed by a JSON document written atomically plus an
//! append-only usage log.

mod error;
mod json;
mod models;

pub use error::{Error, Result};
pub use json::{JsonStore, spawn_flush_task};
pub use models::{
    AccountPatch, ApiKeyPrincipal, HealthStatus, RateLimit, UpstreamAccount, UsageAggregate,
    UsageRecord, hash_api_key, now_ms,
};

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`Store`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Storage capability injected into the pool, lifecycle manager and meter.
///
/// Methods return boxed futures so the trait stays dyn-compatible and can be
/// shared as `Arc<dyn Store>`.
pub trait Store: Send + Sync {
    fn find_account<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<UpstreamAccount>>>;

    fn list_accounts(&self) -> BoxFuture<'_, Result<Vec<UpstreamAccount>>>;

    /// Apply `patch` atomically and return the updated account.
    fn update_account<'a>(
        &'a self,
        id: &'a str,
        patch: AccountPatch,
    ) -> BoxFuture<'a, Result<UpstreamAccount>>;

    fn find_api_key_by_hash<'a>(
        &'a self,
        key_hash: &'a str,
    ) -> BoxFuture<'a, Result<Option<ApiKeyPrincipal>>>;

    /// Insert records, skipping any whose `request_id` already exists.
    /// Returns the number actually inserted.
    fn insert_usage(&self, records: Vec<UsageRecord>) -> BoxFuture<'_, Result<usize>>;

    /// Totals for `owner_id` over `[from, to)` (epoch ms).
    fn aggregate_usage<'a>(
        &'a self,
        owner_id: &'a str,
        from: u64,
        to: u64,
    ) -> BoxFuture<'a, Result<UsageAggregate>>;

    fn usage_count(&self) -> BoxFuture<'_, Result<usize>>;
}
