//! Upstream request construction: auth headers, beta flags, system prompt.

use std::str::FromStr;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{Credential, ProviderError, ProviderProfile, Result};

const ANTHROPIC_BETA: &str = "anthropic-beta";
const ANTHROPIC_VERSION: &str = "anthropic-version";
const X_API_KEY: &str = "x-api-key";
const BROWSER_ACCESS: &str = "anthropic-dangerous-direct-browser-access";

/// Static header from `[[headers]]` config, applied to every upstream request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

/// Upstream URL for `path` (e.g. `/v1/messages`) under this credential.
///
/// API-key accounts use their own `base_url`; OAuth accounts always go to the
/// profile's fixed API base.
pub fn upstream_url(profile: &ProviderProfile, credential: &Credential, path: &str) -> String {
    let base = match credential {
        Credential::ApiKey(key) => key.base_url.as_str(),
        Credential::OAuth(_) => profile.api_base.as_str(),
    };
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// Build the full upstream header set for one attempt.
///
/// Client auth is never forwarded. Only the client's `anthropic-beta` flags are
/// carried over; for OAuth they are merged behind the profile's required flags.
pub fn build_upstream_headers(
    profile: &ProviderProfile,
    credential: &Credential,
    client_headers: &HeaderMap,
    injections: &[HeaderInjection],
) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(
        HeaderName::from_static(ANTHROPIC_VERSION),
        header_value(ANTHROPIC_VERSION, &profile.api_version)?,
    );

    let client_beta = client_headers
        .get(ANTHROPIC_BETA)
        .and_then(|v| v.to_str().ok());

    match credential {
        Credential::ApiKey(key) => {
            headers.insert(
                HeaderName::from_static(X_API_KEY),
                header_value(X_API_KEY, key.api_key.expose())?,
            );
            if let Some(beta) = client_beta {
                headers.insert(
                    HeaderName::from_static(ANTHROPIC_BETA),
                    header_value(ANTHROPIC_BETA, beta)?,
                );
            }
        }
        Credential::OAuth(oauth) => {
            headers.insert(
                AUTHORIZATION,
                header_value(
                    "authorization",
                    &format!("Bearer {}", oauth.access_token.expose()),
                )?,
            );
            let merged = merge_beta_flags(&profile.required_beta_flags, client_beta);
            headers.insert(
                HeaderName::from_static(ANTHROPIC_BETA),
                header_value(ANTHROPIC_BETA, &merged)?,
            );
            headers.insert(USER_AGENT, header_value("user-agent", &profile.user_agent)?);
            headers.insert(
                HeaderName::from_static(BROWSER_ACCESS),
                HeaderValue::from_static("true"),
            );
        }
    }

    apply_injections(&mut headers, injections);
    Ok(headers)
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| ProviderError::InvalidHeader {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// Required flags first, then client extras in order, deduplicated.
pub fn merge_beta_flags(required: &[String], client: Option<&str>) -> String {
    let mut flags: Vec<String> = required.to_vec();
    for flag in client.unwrap_or_default().split(',') {
        let trimmed = flag.trim();
        if !trimmed.is_empty() && !flags.iter().any(|f| f == trimmed) {
            flags.push(trimmed.to_string());
        }
    }
    flags.join(",")
}

/// Apply `[[headers]]` injections. Invalid entries are skipped with a warning,
/// and credential headers are never overwritten.
pub fn apply_injections(headers: &mut HeaderMap, injections: &[HeaderInjection]) {
    for injection in injections {
        let name = match HeaderName::from_str(&injection.name) {
            Ok(n) => n,
            Err(e) => {
                warn!(header = %injection.name, error = %e, "skipping invalid header name");
                continue;
            }
        };
        if name == AUTHORIZATION || name == X_API_KEY {
            warn!(header = %injection.name, "refusing to overwrite credential header");
            continue;
        }
        match HeaderValue::from_str(&injection.value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(e) => {
                warn!(header = %injection.name, error = %e, "skipping invalid header value");
            }
        }
    }
}

/// Prepend the profile's system prompt prefix for OAuth requests.
///
/// - Haiku models and profiles without a prefix: untouched
/// - No `system` field: set to the prefix
/// - String `system` lacking the prefix: `"{prefix} {existing}"`
/// - Already prefixed, or block-array `system`: untouched
pub fn inject_system_prompt(profile: &ProviderProfile, body: &mut serde_json::Value) {
    let Some(prefix) = profile.system_prompt_prefix.as_deref() else {
        return;
    };
    let Some(model) = body.get("model").and_then(|m| m.as_str()) else {
        return;
    };
    if model.to_lowercase().contains("haiku") {
        debug!(model, "skipping system prompt injection for haiku model");
        return;
    }

    let replacement = match body.get("system") {
        None => Some(prefix.to_string()),
        Some(serde_json::Value::String(existing)) if !existing.starts_with(prefix) => {
            Some(format!("{prefix} {existing}"))
        }
        Some(_) => None,
    };
    if let Some(system) = replacement {
        body["system"] = serde_json::Value::String(system);
    }
}
