//! Proactive background token refresh and health recovery
//!
//! Runs independently of the request path so most requests never pay
//! refresh latency. Accounts are read straight from the store, bypassing
//! the cache, so each cycle sees current expiries.

use std::sync::Arc;
use std::time::Duration;

use provider::Credential;
use store::{HealthStatus, Store, now_ms};
use tracing::{debug, info, warn};
use upstream_auth::LifecycleManager;

use crate::pool::CredentialPool;

/// Spawn a task that every `interval` refreshes OAuth tokens expiring within
/// `threshold` and, when `recheck_unhealthy` is set, re-probes unhealthy
/// accounts so they can return to rotation.
///
/// A refresh token the provider rejects marks the account unhealthy;
/// transient failures are retried next cycle.
pub fn spawn_refresh_task(
    pool: Arc<CredentialPool>,
    lifecycle: Arc<LifecycleManager>,
    interval: Duration,
    threshold: Duration,
    recheck_unhealthy: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; tokens were just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&pool, &lifecycle, threshold, recheck_unhealthy).await;
        }
    })
}

async fn refresh_cycle(
    pool: &CredentialPool,
    lifecycle: &LifecycleManager,
    threshold: Duration,
    recheck_unhealthy: bool,
) {
    let accounts = match pool.store().list_accounts().await {
        Ok(accounts) => accounts,
        Err(e) => {
            warn!(error = %e, "refresh cycle could not list accounts");
            return;
        }
    };
    let horizon = now_ms().saturating_add(threshold.as_millis() as u64);

    for account in accounts.iter().filter(|a| a.is_active) {
        if account.health_status == HealthStatus::Unhealthy {
            if recheck_unhealthy {
                let report = lifecycle.health_check(account).await;
                pool.invalidate(&account.id).await;
                if report.healthy {
                    info!(account_id = %account.id, "unhealthy account recovered");
                }
            }
            continue;
        }

        let Credential::OAuth(oauth) = &account.credential else {
            continue;
        };
        if oauth.expires_at > horizon {
            continue;
        }

        debug!(account_id = %account.id, "token expiring within threshold, refreshing");
        match lifecycle.ensure_valid_token(account, true).await {
            Ok(_) => {
                pool.invalidate(&account.id).await;
                info!(account_id = %account.id, "background token refresh succeeded");
            }
            Err(e) if e.is_credential_rejection() => {
                warn!(account_id = %account.id, error = %e, "refresh token rejected, marking unhealthy");
                if let Err(e) = pool.set_health(&account.id, HealthStatus::Unhealthy).await {
                    warn!(account_id = %account.id, error = %e, "failed to mark account unhealthy");
                }
            }
            Err(e) => {
                warn!(account_id = %account.id, error = %e, "background refresh failed (transient), will retry next cycle");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::AccountCache;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use provider::{OAuthCredential, ProviderProfile, ProviderProfiles};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use store::{JsonStore, UpstreamAccount};
    use tokio::net::TcpListener;

    async fn start_mock(token_status: StatusCode) -> (String, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = axum::Router::new()
            .route(
                "/v1/oauth/token",
                post(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        (
                            token_status,
                            axum::Json(serde_json::json!({
                                "access_token": "at_bg",
                                "expires_in": 28800
                            })),
                        )
                    }
                }),
            )
            .route("/v1/models", get(|| async { StatusCode::OK }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), calls)
    }

    fn oauth_account(id: &str, expires_at: u64, health: HealthStatus) -> UpstreamAccount {
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
            health_status: health,
        }
    }

    async fn setup(
        base: &str,
        accounts: Vec<UpstreamAccount>,
    ) -> (Arc<CredentialPool>, Arc<LifecycleManager>, Arc<JsonStore>) {
        let store = Arc::new(JsonStore::in_memory());
        for account in accounts {
            store.insert_account(account).await.unwrap();
        }
        let mut profile = ProviderProfile::anthropic();
        profile.api_base = base.to_string();
        profile.token_endpoint = format!("{base}/v1/oauth/token");
        let lifecycle = Arc::new(LifecycleManager::new(
            store.clone(),
            ProviderProfiles::new([profile]),
            reqwest::Client::new(),
            Duration::from_secs(5),
        ));
        let cache = Arc::new(AccountCache::new("account", 100, Duration::from_secs(60)));
        let pool = Arc::new(CredentialPool::new(store.clone(), cache));
        (pool, lifecycle, store)
    }

    const HOUR_MS: u64 = 3_600_000;

    #[tokio::test]
    async fn cycle_refreshes_only_tokens_inside_threshold() {
        let (base, calls) = start_mock(StatusCode::OK).await;
        let (pool, lifecycle, store) = setup(
            &base,
            vec![
                oauth_account("soon", now_ms() + 60_000, HealthStatus::Healthy),
                oauth_account("later", now_ms() + 10 * HOUR_MS, HealthStatus::Healthy),
            ],
        )
        .await;

        refresh_cycle(&pool, &lifecycle, Duration::from_secs(900), false).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let soon = store.find_account("soon").await.unwrap().unwrap();
        assert!(soon.oauth_expires_at().unwrap() > now_ms() + 7 * HOUR_MS);
        let later = store.find_account("later").await.unwrap().unwrap();
        match &later.credential {
            Credential::OAuth(o) => assert_eq!(o.access_token.expose(), "at_old"),
            Credential::ApiKey(_) => unreachable!(),
        }
    }

    #[tokio::test]
    async fn rejected_refresh_marks_account_unhealthy() {
        let (base, _calls) = start_mock(StatusCode::UNAUTHORIZED).await;
        let (pool, lifecycle, store) = setup(
            &base,
            vec![oauth_account("a", now_ms() + 60_000, HealthStatus::Healthy)],
        )
        .await;

        refresh_cycle(&pool, &lifecycle, Duration::from_secs(900), false).await;

        let account = store.find_account("a").await.unwrap().unwrap();
        assert_eq!(account.health_status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn transient_failure_leaves_health_alone() {
        let (base, _calls) = start_mock(StatusCode::BAD_GATEWAY).await;
        let (pool, lifecycle, store) = setup(
            &base,
            vec![oauth_account("a", now_ms() + 60_000, HealthStatus::Healthy)],
        )
        .await;

        refresh_cycle(&pool, &lifecycle, Duration::from_secs(900), false).await;

        let account = store.find_account("a").await.unwrap().unwrap();
        assert_eq!(account.health_status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn unhealthy_accounts_recover_when_rechecked() {
        let (base, calls) = start_mock(StatusCode::OK).await;
        let (pool, lifecycle, store) = setup(
            &base,
            vec![oauth_account("a", now_ms() + 10 * HOUR_MS, HealthStatus::Unhealthy)],
        )
        .await;

        refresh_cycle(&pool, &lifecycle, Duration::from_secs(900), false).await;
        assert_eq!(
            store.find_account("a").await.unwrap().unwrap().health_status,
            HealthStatus::Unhealthy,
            "no recheck when disabled"
        );

        refresh_cycle(&pool, &lifecycle, Duration::from_secs(900), true).await;
        assert_eq!(
            store.find_account("a").await.unwrap().unwrap().health_status,
            HealthStatus::Healthy
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0, "valid token needs no refresh");
    }

    #[tokio::test]
    async fn spawned_task_can_be_aborted() {
        let (base, _calls) = start_mock(StatusCode::OK).await;
        let (pool, lifecycle, _store) = setup(&base, vec![]).await;

        let handle = spawn_refresh_task(
            pool,
            lifecycle,
            Duration::from_millis(10),
            Duration::from_secs(900),
            true,
        );
        tokio::time::sleep(Duration::from_millis(35)).await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
