//! Inbound API key authentication
//!
//! Callers present a gateway key as `Authorization: Bearer <key>` or
//! `x-api-key: <key>`. The key is hashed and looked up in the `api_key`
//! cache namespace, falling back to the store. Only found keys are cached.

use std::sync::Arc;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use cache::TtlCache;
use store::{ApiKeyPrincipal, Store, hash_api_key, now_ms};
use tracing::{debug, warn};

use crate::error::GatewayError;

pub type ApiKeyCache = TtlCache<ApiKeyPrincipal>;

pub struct Authenticator {
    store: Arc<dyn Store>,
    cache: Arc<ApiKeyCache>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn Store>, cache: Arc<ApiKeyCache>) -> Self {
        Self { store, cache }
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<ApiKeyPrincipal, GatewayError> {
        let key = presented_key(headers)
            .ok_or_else(|| GatewayError::Unauthenticated("missing API key".into()))?;
        let key_hash = hash_api_key(key);

        let principal = match self.cache.get(&key_hash).await {
            Some(principal) => principal,
            None => {
                let found = self
                    .store
                    .find_api_key_by_hash(&key_hash)
                    .await
                    .map_err(|e| {
                        warn!(error = %e, "api key lookup failed");
                        GatewayError::Internal("api key lookup failed".into())
                    })?
                    .ok_or_else(|| GatewayError::Unauthenticated("invalid API key".into()))?;
                self.cache.set(key_hash, found.clone()).await;
                found
            }
        };

        // Checked on every request so a cached key still expires on time
        if !principal.is_usable(now_ms()) {
            debug!(api_key_id = %principal.id, "rejected inactive or expired api key");
            return Err(GatewayError::Unauthenticated(
                "API key is inactive or expired".into(),
            ));
        }
        Ok(principal)
    }
}

/// Require `permission` (or the `*` wildcard) on `principal`.
pub fn require_permission(
    principal: &ApiKeyPrincipal,
    permission: &str,
) -> Result<(), GatewayError> {
    if principal.has_permission(permission) {
        Ok(())
    } else {
        Err(GatewayError::Permission(format!(
            "API key lacks permission {permission:?}"
        )))
    }
}

/// Key from `Authorization: Bearer` or, failing that, `x-api-key`.
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        });
    bearer
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|k| !k.is_empty())
}
