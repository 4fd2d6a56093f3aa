//! Expiry detection, serialized refresh and live health checks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use provider::{Credential, ProviderProfiles, build_upstream_headers, upstream_url};
use reqwest::header::HeaderMap;
use serde::Serialize;
use store::{AccountPatch, HealthStatus, Store, UpstreamAccount, now_ms};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::token;

/// Tokens expiring within this margin are refreshed before use.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(3600);

/// `now + 1h >= expires_at`. Already-expired tokens are expiring soon too.
pub fn is_expiring_soon(expires_at: u64, now_ms: u64) -> bool {
    now_ms.saturating_add(EXPIRY_MARGIN.as_millis() as u64) >= expires_at
}

/// Outcome of one live health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub account_id: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl HealthReport {
    fn healthy(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            healthy: true,
            reason: None,
        }
    }

    fn unhealthy(account_id: &str, reason: impl Into<String>) -> Self {
        Self {
            account_id: account_id.to_string(),
            healthy: false,
            reason: Some(reason.into()),
        }
    }
}

pub struct LifecycleManager {
    store: Arc<dyn Store>,
    profiles: ProviderProfiles,
    client: reqwest::Client,
    health_timeout: Duration,
    /// Per-account refresh serialization
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<dyn Store>,
        profiles: ProviderProfiles,
        client: reqwest::Client,
        health_timeout: Duration,
    ) -> Self {
        Self {
            store,
            profiles,
            client,
            health_timeout,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, account_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Refresh one OAuth account and persist the new token set.
    ///
    /// The stored expiry always advances: a response that would not move it
    /// forward is bumped to `previous + 1`. On failure nothing is written.
    pub async fn refresh(&self, account: &UpstreamAccount) -> Result<UpstreamAccount> {
        let Credential::OAuth(oauth) = &account.credential else {
            return Err(Error::NotOAuth(account.id.clone()));
        };
        let profile = self.profiles.get(&account.provider)?;

        let response = match token::refresh_token(
            &self.client,
            &profile.token_endpoint,
            &profile.client_id,
            oauth.refresh_token.expose(),
        )
        .await
        {
            Ok(response) => response,
            Err(e) => {
                metrics::counter!("gateway_token_refresh_total", "outcome" => "failure")
                    .increment(1);
                warn!(account_id = %account.id, error = %e, "token refresh failed");
                return Err(e);
            }
        };

        let computed = now_ms().saturating_add(response.expires_in.saturating_mul(1000));
        let expires_at = computed.max(oauth.expires_at.saturating_add(1));
        let refresh_token = match response.refresh_token {
            Some(rotated) => rotated.into(),
            None => oauth.refresh_token.clone(),
        };

        let updated = self
            .store
            .update_account(
                &account.id,
                AccountPatch::ReplaceOAuth {
                    access_token: response.access_token.into(),
                    refresh_token,
                    expires_at,
                },
            )
            .await?;

        metrics::counter!("gateway_token_refresh_total", "outcome" => "success").increment(1);
        info!(account_id = %account.id, expires_at, "refreshed oauth token");
        Ok(updated)
    }

    /// Return an account whose OAuth token is usable for at least the expiry
    /// margin, refreshing at most once.
    ///
    /// API-key accounts are returned unchanged. Concurrent callers for the
    /// same account queue behind one refresh; a caller that waited reuses the
    /// token the first one stored.
    pub async fn ensure_valid_token(
        &self,
        account: &UpstreamAccount,
        force: bool,
    ) -> Result<UpstreamAccount> {
        let Credential::OAuth(seen) = &account.credential else {
            return Ok(account.clone());
        };
        if !force && !is_expiring_soon(seen.expires_at, now_ms()) {
            return Ok(account.clone());
        }

        let lock = self.lock_for(&account.id).await;
        let _guard = lock.lock().await;

        let current = self
            .store
            .find_account(&account.id)
            .await?
            .ok_or_else(|| Error::NotFound(account.id.clone()))?;

        if let Credential::OAuth(stored) = &current.credential
            && stored.expires_at > seen.expires_at
            && !is_expiring_soon(stored.expires_at, now_ms())
        {
            debug!(account_id = %account.id, "token refreshed by concurrent caller");
            return Ok(current);
        }

        self.refresh(&current).await
    }

    /// Validate the credential and ping the provider, then write the
    /// resulting health status back to the store.
    pub async fn health_check(&self, account: &UpstreamAccount) -> HealthReport {
        let report = self.probe(account).await;
        let status = if report.healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        if let Err(e) = self
            .store
            .update_account(&account.id, AccountPatch::SetHealth(status))
            .await
        {
            warn!(account_id = %account.id, error = %e, "failed to persist health status");
        }
        debug!(
            account_id = %account.id,
            healthy = report.healthy,
            reason = report.reason.as_deref().unwrap_or(""),
            "health check complete"
        );
        report
    }

    async fn probe(&self, account: &UpstreamAccount) -> HealthReport {
        let account = match self.ensure_valid_token(account, false).await {
            Ok(a) => a,
            Err(e) => return HealthReport::unhealthy(&account.id, format!("credential: {e}")),
        };
        let profile = match self.profiles.get(&account.provider) {
            Ok(p) => p,
            Err(e) => return HealthReport::unhealthy(&account.id, e.to_string()),
        };
        let headers =
            match build_upstream_headers(&profile, &account.credential, &HeaderMap::new(), &[]) {
                Ok(h) => h,
                Err(e) => return HealthReport::unhealthy(&account.id, e.to_string()),
            };

        let url = upstream_url(&profile, &account.credential, "/v1/models");
        let result = self
            .client
            .get(url)
            .headers(headers)
            .timeout(self.health_timeout)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => HealthReport::healthy(&account.id),
            Ok(response) => HealthReport::unhealthy(
                &account.id,
                format!("provider returned {}", response.status().as_u16()),
            ),
            Err(e) => HealthReport::unhealthy(&account.id, format!("request failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use provider::{ApiKeyCredential, OAuthCredential, ProviderProfile};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use store::JsonStore;
    use tokio::net::TcpListener;

    const HOUR_MS: u64 = 3_600_000;

    struct MockProvider {
        base: String,
        token_calls: Arc<AtomicUsize>,
    }

    /// Token endpoint + models endpoint. Token responses carry `expires_in`
    /// of 8h and a rotated refresh token; `/v1/models` answers `models_status`.
    async fn start_mock(models_status: StatusCode, token_status: StatusCode) -> MockProvider {
        let token_calls = Arc::new(AtomicUsize::new(0));
        let calls = token_calls.clone();
        let app = axum::Router::new()
            .route(
                "/v1/oauth/token",
                post(move || {
                    let calls = calls.clone();
                    async move {
                        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                        // Slow enough that concurrent callers overlap
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        (
                            token_status,
                            axum::Json(serde_json::json!({
                                "access_token": format!("at_new_{n}"),
                                "refresh_token": format!("rt_new_{n}"),
                                "expires_in": 28800
                            })),
                        )
                    }
                }),
            )
            .route("/v1/models", get(move || async move { models_status }));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        MockProvider {
            base: format!("http://{addr}"),
            token_calls,
        }
    }

    fn profiles_for(base: &str) -> ProviderProfiles {
        let mut profile = ProviderProfile::anthropic();
        profile.api_base = base.to_string();
        profile.token_endpoint = format!("{base}/v1/oauth/token");
        ProviderProfiles::new([profile])
    }

    fn oauth_account(id: &str, expires_at: u64) -> UpstreamAccount {
        UpstreamAccount {
            id: id.into(),
            name: id.into(),
            provider: "anthropic".into(),
            owner_id: None,
            credential: Credential::OAuth(OAuthCredential {
                access_token: "at_old".into(),
                refresh_token: "rt_old".into(),
                expires_at,
            }),
            is_active: true,
            priority: 0,
            weight: 1,
            request_count: 0,
            success_count: 0,
            error_count: 0,
            last_used_at: None,
            health_status: HealthStatus::Unknown,
        }
    }

    async fn manager(mock: &MockProvider, accounts: Vec<UpstreamAccount>) -> (LifecycleManager, Arc<JsonStore>) {
        let store = Arc::new(JsonStore::in_memory());
        for account in accounts {
            store.insert_account(account).await.unwrap();
        }
        let manager = LifecycleManager::new(
            store.clone(),
            profiles_for(&mock.base),
            reqwest::Client::new(),
            Duration::from_secs(5),
        );
        (manager, store)
    }

    fn oauth_of(account: &UpstreamAccount) -> &OAuthCredential {
        match &account.credential {
            Credential::OAuth(o) => o,
            Credential::ApiKey(_) => panic!("expected oauth"),
        }
    }

    #[test]
    fn expiring_soon_boundary() {
        let now = 10 * HOUR_MS;
        assert!(is_expiring_soon(now - 1, now), "already expired");
        assert!(is_expiring_soon(now + HOUR_MS, now), "exactly one hour left");
        assert!(!is_expiring_soon(now + HOUR_MS + 1, now));
    }

    #[tokio::test]
    async fn valid_token_is_returned_without_io() {
        let mock = start_mock(StatusCode::OK, StatusCode::OK).await;
        let account = oauth_account("a", now_ms() + 5 * HOUR_MS);
        let (manager, _store) = manager(&mock, vec![account.clone()]).await;

        let result = manager.ensure_valid_token(&account, false).await.unwrap();
        assert_eq!(result, account);
        assert_eq!(mock.token_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_token_refreshes_once_with_future_expiry() {
        let mock = start_mock(StatusCode::OK, StatusCode::OK).await;
        let account = oauth_account("a", now_ms() - 1_000);
        let (manager, store) = manager(&mock, vec![account.clone()]).await;

        let before = now_ms();
        let result = manager.ensure_valid_token(&account, false).await.unwrap();
        let oauth = oauth_of(&result);

        assert_eq!(mock.token_calls.load(Ordering::SeqCst), 1);
        assert!(oauth.expires_at > before);
        assert_eq!(oauth.access_token.expose(), "at_new_1");
        assert_eq!(oauth.refresh_token.expose(), "rt_new_1");

        let stored = store.find_account("a").await.unwrap().unwrap();
        assert_eq!(stored, result, "refreshed token persisted");
    }

    #[tokio::test]
    async fn forced_refresh_runs_even_when_valid() {
        let mock = start_mock(StatusCode::OK, StatusCode::OK).await;
        let account = oauth_account("a", now_ms() + 5 * HOUR_MS);
        let (manager, _store) = manager(&mock, vec![account.clone()]).await;

        manager.ensure_valid_token(&account, true).await.unwrap();
        assert_eq!(mock.token_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expiry_strictly_increases_even_if_provider_shortens_it() {
        let mock = start_mock(StatusCode::OK, StatusCode::OK).await;
        // Stored expiry beyond now + 8h: computed expiry would move backwards
        let far = now_ms() + 100 * HOUR_MS;
        let account = oauth_account("a", far);
        let (manager, _store) = manager(&mock, vec![account.clone()]).await;

        let refreshed = manager.refresh(&account).await.unwrap();
        assert_eq!(oauth_of(&refreshed).expires_at, far + 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let mock = start_mock(StatusCode::OK, StatusCode::OK).await;
        let account = oauth_account("a", now_ms() - 1);
        let (manager, _store) = manager(&mock, vec![account.clone()]).await;
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let manager = manager.clone();
            let account = account.clone();
            handles.push(tokio::spawn(async move {
                manager.ensure_valid_token(&account, false).await.unwrap()
            }));
        }
        for handle in handles {
            let result = handle.await.unwrap();
            assert_eq!(oauth_of(&result).access_token.expose(), "at_new_1");
        }
        assert_eq!(mock.token_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_refresh_leaves_state_untouched() {
        let mock = start_mock(StatusCode::OK, StatusCode::UNAUTHORIZED).await;
        let account = oauth_account("a", now_ms() - 1);
        let (manager, store) = manager(&mock, vec![account.clone()]).await;

        let err = manager.ensure_valid_token(&account, false).await.unwrap_err();
        assert!(matches!(err, Error::RefreshRejected { status: 401, .. }));
        assert!(err.is_credential_rejection());
        assert_eq!(store.find_account("a").await.unwrap().unwrap(), account);
    }

    #[tokio::test]
    async fn refresh_on_api_key_account_is_an_error() {
        let mock = start_mock(StatusCode::OK, StatusCode::OK).await;
        let mut account = oauth_account("k", 0);
        account.credential = Credential::ApiKey(ApiKeyCredential {
            base_url: mock.base.clone(),
            api_key: "sk-ant-test".into(),
        });
        let (manager, _store) = manager(&mock, vec![account.clone()]).await;

        assert!(matches!(
            manager.refresh(&account).await,
            Err(Error::NotOAuth(id)) if id == "k"
        ));
        // ensure_valid_token is a no-op for api keys
        assert_eq!(manager.ensure_valid_token(&account, true).await.unwrap(), account);
    }

    #[tokio::test]
    async fn health_check_marks_healthy_on_2xx() {
        let mock = start_mock(StatusCode::OK, StatusCode::OK).await;
        let mut account = oauth_account("k", 0);
        account.credential = Credential::ApiKey(ApiKeyCredential {
            base_url: mock.base.clone(),
            api_key: "sk-ant-test".into(),
        });
        let (manager, store) = manager(&mock, vec![account.clone()]).await;

        let report = manager.health_check(&account).await;
        assert!(report.healthy);
        assert_eq!(report.reason, None);
        assert_eq!(
            store.find_account("k").await.unwrap().unwrap().health_status,
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn health_check_marks_unhealthy_on_provider_error() {
        let mock = start_mock(StatusCode::UNAUTHORIZED, StatusCode::OK).await;
        let account = oauth_account("a", now_ms() + 5 * HOUR_MS);
        let (manager, store) = manager(&mock, vec![account.clone()]).await;

        let report = manager.health_check(&account).await;
        assert!(!report.healthy);
        assert_eq!(report.reason.as_deref(), Some("provider returned 401"));
        assert_eq!(
            store.find_account("a").await.unwrap().unwrap().health_status,
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn health_check_reports_refresh_failure() {
        let mock = start_mock(StatusCode::OK, StatusCode::FORBIDDEN).await;
        let account = oauth_account("a", now_ms() - 1);
        let (manager, _store) = manager(&mock, vec![account.clone()]).await;

        let report = manager.health_check(&account).await;
        assert!(!report.healthy);
        assert!(report.reason.unwrap().starts_with("credential:"));
    }
}
