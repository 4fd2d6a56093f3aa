//! Upstream credential pool
//!
//! Picks the upstream account for each request and keeps per-account
//! statistics current. Accounts live in the store; reads go through the
//! `account` cache namespace and every write invalidates it.
//!
//! Account lifecycle as seen by the pool:
//! 1. `select_account` ranks eligible accounts by success count, then load,
//!    then recency
//! 2. The proxy reports each finished request through `record_outcome`
//! 3. An upstream 401 goes through `mark_failed_and_select_alternative`,
//!    which marks the account unhealthy and picks exactly one replacement
//! 4. The background task refreshes expiring OAuth tokens and optionally
//!    re-probes unhealthy accounts so they can recover

pub mod error;
pub mod pool;
pub mod refresh;

pub use error::{Error, Result};
pub use pool::{ACCOUNT_LIST_KEY, AccountCache, AccountCacheEntry, CredentialPool, SelectionFilter};
pub use refresh::spawn_refresh_task;
