//! Persistent entities shared by the pool, lifecycle manager and meter.

use std::time::{SystemTime, UNIX_EPOCH};

use common::Secret;
use provider::{AuthKind, Credential, DEFAULT_PROVIDER};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Current unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Hex SHA-256 of an inbound API key, the form stored in `key_hash`.
pub fn hash_api_key(key: &str) -> String {
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

/// One upstream credential set and its running statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamAccount {
    pub id: String,
    pub name: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    /// `None` means the account is shared by every owner
    #[serde(default)]
    pub owner_id: Option<String>,
    pub credential: Credential,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub last_used_at: Option<u64>,
    #[serde(default)]
    pub health_status: HealthStatus,
}

impl UpstreamAccount {
    pub fn kind(&self) -> AuthKind {
        self.credential.kind()
    }

    pub fn oauth_expires_at(&self) -> Option<u64> {
        self.credential.oauth_expires_at()
    }

    /// Whether `owner_id` may use this account.
    pub fn visible_to(&self, owner_id: &str) -> bool {
        self.owner_id.as_deref().is_none_or(|owner| owner == owner_id)
    }
}

/// Atomic modification applied to one account inside the store.
///
/// Counter updates are expressed as patches rather than read-modify-write so
/// concurrent requests never lose increments.
#[derive(Debug, Clone)]
pub enum AccountPatch {
    /// One finished upstream request.
    RecordRequest { success: bool, at_ms: u64 },
    /// Credential rejected: bump `error_count` and mark unhealthy.
    MarkFailed,
    SetHealth(HealthStatus),
    /// Replace the OAuth token set after a refresh.
    ReplaceOAuth {
        access_token: Secret<String>,
        refresh_token: Secret<String>,
        expires_at: u64,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default)]
    pub tokens_per_minute: Option<u64>,
}

/// Inbound API key, resolved by the hash of the presented bearer value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyPrincipal {
    pub id: String,
    pub owner_id: String,
    pub key_hash: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
}

impl ApiKeyPrincipal {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission || p == "*")
    }

    pub fn is_usable(&self, now_ms: u64) -> bool {
        self.is_active && self.expires_at.is_none_or(|exp| now_ms < exp)
    }
}

/// Append-only accounting entry, unique per `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub api_key_id: String,
    pub owner_id: String,
    /// `None` when no upstream was reached
    pub upstream_account_id: Option<String>,
    pub model: String,
    pub status_code: u16,
    pub response_time_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub cost_usd: f64,
    pub error_message: Option<String>,
    pub created_at: u64,
}

impl UsageRecord {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Totals over an owner's records in `[from, to)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageAggregate {
    pub owner_id: String,
    pub from: u64,
    pub to: u64,
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub total_cost_usd: f64,
    pub avg_response_time_ms: f64,
}

impl UsageAggregate {
    pub fn from_records<'a>(
        owner_id: &str,
        from: u64,
        to: u64,
        records: impl IntoIterator<Item = &'a UsageRecord>,
    ) -> Self {
        let mut agg = UsageAggregate {
            owner_id: owner_id.to_string(),
            from,
            to,
            ..Default::default()
        };
        let mut total_latency: u64 = 0;

        for record in records {
            if record.owner_id != owner_id || record.created_at < from || record.created_at >= to {
                continue;
            }
            agg.total_requests += 1;
            if record.is_success() {
                agg.success_count += 1;
            } else {
                agg.error_count += 1;
            }
            agg.input_tokens += record.input_tokens;
            agg.output_tokens += record.output_tokens;
            agg.cache_creation_tokens += record.cache_creation_tokens;
            agg.cache_read_tokens += record.cache_read_tokens;
            agg.total_cost_usd += record.cost_usd;
            total_latency += record.response_time_ms;
        }

        if agg.total_requests > 0 {
            agg.avg_response_time_ms = total_latency as f64 / agg.total_requests as f64;
        }
        agg
    }
}
