//! Account selection, failover and outcome recording

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use cache::TtlCache;
use provider::Credential;
use store::{AccountPatch, HealthStatus, Store, UpstreamAccount, now_ms};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Cache key holding the full account list.
pub const ACCOUNT_LIST_KEY: &str = "*";

/// Value type of the `account` cache namespace: one account by id, or the
/// full list under [`ACCOUNT_LIST_KEY`].
#[derive(Debug, Clone)]
pub enum AccountCacheEntry {
    One(UpstreamAccount),
    All(Arc<Vec<UpstreamAccount>>),
}

pub type AccountCache = TtlCache<AccountCacheEntry>;

/// Capability filter applied during selection.
#[derive(Debug, Clone, Default)]
pub struct SelectionFilter {
    /// Only accounts of this provider profile
    pub provider: Option<String>,
}

impl SelectionFilter {
    pub fn provider(name: impl Into<String>) -> Self {
        Self {
            provider: Some(name.into()),
        }
    }
}

pub struct CredentialPool {
    store: Arc<dyn Store>,
    cache: Arc<AccountCache>,
}

impl CredentialPool {
    pub fn new(store: Arc<dyn Store>, cache: Arc<AccountCache>) -> Self {
        Self { store, cache }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Cache-first single account read.
    pub async fn get_account(&self, id: &str) -> Result<Option<UpstreamAccount>> {
        if let Some(AccountCacheEntry::One(account)) = self.cache.get(id).await {
            return Ok(Some(account));
        }
        let account = self.store.find_account(id).await?;
        if let Some(account) = &account {
            self.cache
                .set(id, AccountCacheEntry::One(account.clone()))
                .await;
        }
        Ok(account)
    }

    /// Cache-first read of every account.
    pub async fn list_accounts(&self) -> Result<Arc<Vec<UpstreamAccount>>> {
        if let Some(AccountCacheEntry::All(accounts)) = self.cache.get(ACCOUNT_LIST_KEY).await {
            return Ok(accounts);
        }
        let accounts = Arc::new(self.store.list_accounts().await?);
        self.cache
            .set(ACCOUNT_LIST_KEY, AccountCacheEntry::All(accounts.clone()))
            .await;
        Ok(accounts)
    }

    /// Drop cached copies of `account_id` and the account list.
    pub async fn invalidate(&self, account_id: &str) {
        self.cache.invalidate(account_id).await;
        self.cache.invalidate(ACCOUNT_LIST_KEY).await;
    }

    /// Best eligible account for `owner_id`, or `None` when nothing qualifies.
    ///
    /// Eligible: active, not unhealthy, matching the filter, visible to the
    /// owner, not excluded, and (for OAuth) not past its expiry. Ranked by
    /// success count desc, request count asc, last use desc.
    pub async fn select_account(
        &self,
        owner_id: &str,
        filter: &SelectionFilter,
        exclude: &HashSet<String>,
    ) -> Result<Option<UpstreamAccount>> {
        let accounts = self.list_accounts().await?;
        let now = now_ms();

        let mut candidates: Vec<&UpstreamAccount> = accounts
            .iter()
            .filter(|a| is_eligible(a, owner_id, filter, exclude, now))
            .collect();
        candidates.sort_by(|a, b| rank(a, b));

        let selected = candidates.first().map(|a| (*a).clone());
        match &selected {
            Some(account) => debug!(
                account_id = %account.id,
                candidates = candidates.len(),
                "selected upstream account"
            ),
            None => warn!(owner_id, provider = ?filter.provider, "no eligible upstream account"),
        }
        Ok(selected)
    }

    /// Mark `bad_id` failed (error count, unhealthy) and select exactly one
    /// alternative with `bad_id` excluded. Never retries further.
    pub async fn mark_failed_and_select_alternative(
        &self,
        bad_id: &str,
        owner_id: &str,
        filter: &SelectionFilter,
        exclude: &HashSet<String>,
    ) -> Result<Option<UpstreamAccount>> {
        match self.store.update_account(bad_id, AccountPatch::MarkFailed).await {
            Ok(updated) => info!(
                account_id = bad_id,
                error_count = updated.error_count,
                "marked upstream account unhealthy"
            ),
            Err(e) => warn!(account_id = bad_id, error = %e, "failed to mark account unhealthy"),
        }
        self.invalidate(bad_id).await;
        metrics::counter!("gateway_failovers_total").increment(1);

        let mut exclude = exclude.clone();
        exclude.insert(bad_id.to_string());
        self.select_account(owner_id, filter, &exclude).await
    }

    /// Count one finished request against `account_id`.
    pub async fn record_outcome(
        &self,
        account_id: &str,
        success: bool,
        response_time_ms: u64,
    ) -> Result<()> {
        let updated = self
            .store
            .update_account(
                account_id,
                AccountPatch::RecordRequest {
                    success,
                    at_ms: now_ms(),
                },
            )
            .await?;
        self.invalidate(account_id).await;
        debug!(
            account_id,
            success,
            response_time_ms,
            request_count = updated.request_count,
            "recorded upstream outcome"
        );
        Ok(())
    }

    pub async fn set_health(&self, account_id: &str, status: HealthStatus) -> Result<()> {
        self.store
            .update_account(account_id, AccountPatch::SetHealth(status))
            .await?;
        self.invalidate(account_id).await;
        Ok(())
    }

    /// Pool summary for `/health`. Never includes credential material.
    pub async fn health(&self) -> serde_json::Value {
        let accounts = match self.list_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                return serde_json::json!({
                    "status": "unhealthy",
                    "error": e.to_string(),
                });
            }
        };

        let now = now_ms();
        let mut healthy = 0;
        let mut unhealthy = 0;
        let mut unknown = 0;
        let mut inactive = 0;
        let mut entries = Vec::with_capacity(accounts.len());

        for account in accounts.iter() {
            if !account.is_active {
                inactive += 1;
            } else {
                match account.health_status {
                    HealthStatus::Healthy => healthy += 1,
                    HealthStatus::Unhealthy => unhealthy += 1,
                    HealthStatus::Unknown => unknown += 1,
                }
            }
            let mut entry = serde_json::json!({
                "id": account.id,
                "name": account.name,
                "provider": account.provider,
                "auth_kind": account.kind().label(),
                "active": account.is_active,
                "health": account.health_status.as_str(),
                "request_count": account.request_count,
                "success_count": account.success_count,
                "error_count": account.error_count,
            });
            if let Some(expires_at) = account.oauth_expires_at() {
                entry["expires_in_secs"] = (expires_at.saturating_sub(now) / 1000).into();
            }
            entries.push(entry);
        }

        let usable = healthy + unknown;
        let status = if usable == 0 {
            "unhealthy"
        } else if unhealthy > 0 || inactive > 0 {
            "degraded"
        } else {
            "healthy"
        };

        serde_json::json!({
            "status": status,
            "accounts_total": accounts.len(),
            "accounts_healthy": healthy,
            "accounts_unhealthy": unhealthy,
            "accounts_unknown": unknown,
            "accounts_inactive": inactive,
            "accounts": entries,
        })
    }
}

fn is_eligible(
    account: &UpstreamAccount,
    owner_id: &str,
    filter: &SelectionFilter,
    exclude: &HashSet<String>,
    now: u64,
) -> bool {
    if !account.is_active || account.health_status == HealthStatus::Unhealthy {
        return false;
    }
    if filter.provider.as_deref().is_some_and(|p| p != account.provider) {
        return false;
    }
    if !account.visible_to(owner_id) || exclude.contains(&account.id) {
        return false;
    }
    match &account.credential {
        Credential::OAuth(oauth) => !oauth.is_expired(now),
        Credential::ApiKey(_) => true,
    }
}

/// Best first: most successes, fewest requests, most recent use, then the
/// higher `priority` on a full tie.
fn rank(a: &UpstreamAccount, b: &UpstreamAccount) -> Ordering {
    b.success_count
        .cmp(&a.success_count)
        .then(a.request_count.cmp(&b.request_count))
        .then(b.last_used_at.unwrap_or(0).cmp(&a.last_used_at.unwrap_or(0)))
        .then(b.priority.cmp(&a.priority))
}

#[cfg(test)]
mod tests {
    use super::*;
    use provider::{ApiKeyCredential, OAuthCredential};
    use std::time::Duration;
    use store::JsonStore;

    fn api_account(id: &str, success: u64, requests: u64) -> UpstreamAccount {
        UpstreamAccount {
            id: id.into(),
            name: id.into(),
            provider: "anthropic".into(),
            owner_id: None,
            credential: Credential::ApiKey(ApiKeyCredential {
                base_url: "https://api.anthropic.com".into(),
                api_key: format!("sk-ant-{id}").into(),
            }),
            is_active: true,
            priority: 0,
            weight: 1,
            request_count: requests,
            success_count: success,
            error_count: 0,
            last_used_at: None,
            health_status: HealthStatus::Unknown,
        }
    }

    fn oauth_account(id: &str, expires_at: u64) -> UpstreamAccount {
        let mut account = api_account(id, 100, 100);
        account.credential = Credential::OAuth(OAuthCredential {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at,
        });
        account
    }

    async fn pool_with(accounts: Vec<UpstreamAccount>) -> (CredentialPool, Arc<JsonStore>) {
        let store = Arc::new(JsonStore::in_memory());
        for account in accounts {
            store.insert_account(account).await.unwrap();
        }
        let cache = Arc::new(AccountCache::new("account", 100, Duration::from_secs(60)));
        (CredentialPool::new(store.clone(), cache), store)
    }

    fn no_exclude() -> HashSet<String> {
        HashSet::new()
    }

    #[tokio::test]
    async fn higher_success_count_wins() {
        let (pool, _) = pool_with(vec![api_account("b", 2, 10), api_account("a", 10, 10)]).await;
        let selected = pool
            .select_account("owner", &SelectionFilter::default(), &no_exclude())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selected.id, "a");
    }

    #[tokio::test]
    async fn ties_break_on_fewer_requests_then_recent_use() {
        let mut busy = api_account("busy", 5, 20);
        busy.last_used_at = Some(900);
        let mut old = api_account("old", 5, 10);
        old.last_used_at = Some(100);
        let mut recent = api_account("recent", 5, 10);
        recent.last_used_at = Some(500);

        let (pool, _) = pool_with(vec![busy, old, recent]).await;
        let selected = pool
            .select_account("owner", &SelectionFilter::default(), &no_exclude())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selected.id, "recent");
    }

    #[tokio::test]
    async fn full_tie_goes_to_higher_priority() {
        let low = api_account("low", 5, 10);
        let mut high = api_account("high", 5, 10);
        high.priority = 10;

        let (pool, _) = pool_with(vec![low, high]).await;
        let selected = pool
            .select_account("owner", &SelectionFilter::default(), &no_exclude())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selected.id, "high");
    }

    #[tokio::test]
    async fn priority_does_not_override_success_count() {
        let mut favoured = api_account("favoured", 1, 10);
        favoured.priority = 100;
        let (pool, _) = pool_with(vec![favoured, api_account("proven", 9, 10)]).await;
        let selected = pool
            .select_account("owner", &SelectionFilter::default(), &no_exclude())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selected.id, "proven");
    }

    #[tokio::test]
    async fn never_selects_inactive_unhealthy_or_expired() {
        let mut inactive = api_account("inactive", 1000, 0);
        inactive.is_active = false;
        let mut unhealthy = api_account("unhealthy", 1000, 0);
        unhealthy.health_status = HealthStatus::Unhealthy;
        let expired = oauth_account("expired", now_ms() - 1);

        let (pool, _) = pool_with(vec![inactive, unhealthy, expired]).await;
        let selected = pool
            .select_account("owner", &SelectionFilter::default(), &no_exclude())
            .await
            .unwrap();
        assert!(selected.is_none());

        let (pool, _) = pool_with(vec![
            oauth_account("valid", now_ms() + 60_000),
            oauth_account("expired", now_ms() - 1),
        ])
        .await;
        let selected = pool
            .select_account("owner", &SelectionFilter::default(), &no_exclude())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selected.id, "valid");
    }

    #[tokio::test]
    async fn respects_owner_provider_and_exclusions() {
        let mut private = api_account("private", 50, 0);
        private.owner_id = Some("team-b".into());
        let mut other = api_account("other-provider", 40, 0);
        other.provider = "staging".into();
        let shared = api_account("shared", 1, 0);

        let (pool, _) = pool_with(vec![private, other, shared]).await;
        let filter = SelectionFilter::provider("anthropic");

        let for_a = pool.select_account("team-a", &filter, &no_exclude()).await.unwrap();
        assert_eq!(for_a.unwrap().id, "shared");

        let for_b = pool.select_account("team-b", &filter, &no_exclude()).await.unwrap();
        assert_eq!(for_b.unwrap().id, "private");

        let exclude: HashSet<String> = ["private".to_string(), "shared".to_string()].into();
        assert!(pool.select_account("team-b", &filter, &exclude).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failover_marks_bad_account_and_picks_another() {
        let (pool, store) = pool_with(vec![api_account("a", 10, 10), api_account("b", 2, 10)]).await;
        let filter = SelectionFilter::default();

        let first = pool.select_account("o", &filter, &no_exclude()).await.unwrap().unwrap();
        assert_eq!(first.id, "a");

        let alt = pool
            .mark_failed_and_select_alternative("a", "o", &filter, &no_exclude())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alt.id, "b");

        let bad = store.find_account("a").await.unwrap().unwrap();
        assert_eq!(bad.error_count, 1);
        assert_eq!(bad.health_status, HealthStatus::Unhealthy);

        // Cache was invalidated: fresh selection also skips "a"
        let again = pool.select_account("o", &filter, &no_exclude()).await.unwrap().unwrap();
        assert_eq!(again.id, "b");
    }

    #[tokio::test]
    async fn failover_with_no_alternative_returns_none() {
        let (pool, _) = pool_with(vec![api_account("only", 1, 1)]).await;
        let alt = pool
            .mark_failed_and_select_alternative("only", "o", &SelectionFilter::default(), &no_exclude())
            .await
            .unwrap();
        assert!(alt.is_none());
    }

    #[tokio::test]
    async fn record_outcome_updates_counters_and_invalidates_cache() {
        let (pool, _) = pool_with(vec![api_account("a", 0, 0)]).await;

        // Warm both cache keys
        assert!(pool.get_account("a").await.unwrap().is_some());
        pool.list_accounts().await.unwrap();

        pool.record_outcome("a", true, 120).await.unwrap();
        pool.record_outcome("a", false, 80).await.unwrap();

        let cached = pool.get_account("a").await.unwrap().unwrap();
        assert_eq!(cached.request_count, 2);
        assert_eq!(cached.success_count, 1);
        assert!(cached.last_used_at.is_some());

        let listed = pool.list_accounts().await.unwrap();
        assert_eq!(listed[0].request_count, 2);
    }

    #[tokio::test]
    async fn record_outcome_for_missing_account_errors() {
        let (pool, _) = pool_with(vec![]).await;
        assert!(pool.record_outcome("ghost", true, 1).await.is_err());
    }

    #[tokio::test]
    async fn health_summary_counts_and_hides_secrets() {
        let mut unhealthy = api_account("u", 0, 0);
        unhealthy.health_status = HealthStatus::Unhealthy;
        let mut healthy = api_account("h", 0, 0);
        healthy.health_status = HealthStatus::Healthy;
        let (pool, _) = pool_with(vec![unhealthy, healthy, oauth_account("o", now_ms() + 10_000)]).await;

        let health = pool.health().await;
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["accounts_total"], 3);
        assert_eq!(health["accounts_healthy"], 1);
        assert_eq!(health["accounts_unhealthy"], 1);
        assert_eq!(health["accounts_unknown"], 1);
        let text = health.to_string();
        assert!(!text.contains("sk-ant-"), "got: {text}");
        assert!(text.contains("expires_in_secs"));
    }

    #[tokio::test]
    async fn empty_pool_is_unhealthy() {
        let (pool, _) = pool_with(vec![]).await;
        assert_eq!(pool.health().await["status"], "unhealthy");
    }
}
