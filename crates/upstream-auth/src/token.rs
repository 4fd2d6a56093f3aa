//! OAuth token refresh
//!
//! POSTs `grant_type=refresh_token` to the provider profile's token endpoint.
//! The token endpoint is not the inference API host for Anthropic
//! (`console.anthropic.com` vs `api.anthropic.com`), so it comes from the
//! profile rather than the account.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Token endpoint response.
///
/// `expires_in` is a delta in seconds. `refresh_token` is only present when
/// the provider rotates it.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
}

/// Exchange a refresh token for a new access token.
pub async fn refresh_token(
    client: &reqwest::Client,
    endpoint: &str,
    client_id: &str,
    refresh: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(endpoint)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
            ("client_id", client_id),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::RefreshRejected {
            status: status.as_u16(),
            body: common::redact(&body).into_owned(),
        });
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::InvalidResponse(e.to_string()))
}
