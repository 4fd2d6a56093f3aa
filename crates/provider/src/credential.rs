//! Upstream credential variants
//!
//! Persisted with an internal `type` tag:
//!
//! ```json
//! {"type":"api_key","base_url":"https://api.anthropic.com","api_key":"sk-ant-..."}
//! {"type":"oauth","access_token":"...","refresh_token":"...","expires_at":1735500000000}
//! ```

use common::Secret;
use serde::{Deserialize, Serialize};

/// Static API key bound to a base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyCredential {
    pub base_url: String,
    pub api_key: Secret<String>,
}

/// OAuth token set. `expires_at` is an absolute unix timestamp in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthCredential {
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
    pub expires_at: u64,
}

impl OAuthCredential {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    ApiKey(ApiKeyCredential),
    #[serde(rename = "oauth")]
    OAuth(OAuthCredential),
}

impl Credential {
    pub fn kind(&self) -> AuthKind {
        match self {
            Credential::ApiKey(_) => AuthKind::ApiKey,
            Credential::OAuth(_) => AuthKind::OAuth,
        }
    }

    /// OAuth expiry, `None` for API-key credentials.
    pub fn oauth_expires_at(&self) -> Option<u64> {
        match self {
            Credential::ApiKey(_) => None,
            Credential::OAuth(oauth) => Some(oauth.expires_at),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    ApiKey,
    #[serde(rename = "oauth")]
    OAuth,
}

impl AuthKind {
    pub fn label(&self) -> &'static str {
        match self {
            AuthKind::ApiKey => "api_key",
            AuthKind::OAuth => "oauth",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_credential_deserializes_with_tag() {
        let json = r#"{"type":"oauth","access_token":"at_1","refresh_token":"rt_1","expires_at":1735500000000}"#;
        let cred: Credential = serde_json::from_str(json).unwrap();
        assert_eq!(cred.kind(), AuthKind::OAuth);
        assert_eq!(cred.oauth_expires_at(), Some(1735500000000));
        match cred {
            Credential::OAuth(oauth) => assert_eq!(oauth.access_token.expose(), "at_1"),
            Credential::ApiKey(_) => panic!("expected oauth credential"),
        }
    }

    #[test]
    fn api_key_credential_roundtrips_through_json() {
        let cred = Credential::ApiKey(ApiKeyCredential {
            base_url: "https://api.anthropic.com".into(),
            api_key: "sk-ant-api03-test".into(),
        });
        let json = serde_json::to_string(&cred).unwrap();
        assert!(json.contains("\"type\":\"api_key\""), "got: {json}");
        let back: Credential = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cred);
        assert_eq!(back.oauth_expires_at(), None);
    }

    #[test]
    fn debug_output_never_contains_tokens() {
        let cred = Credential::OAuth(OAuthCredential {
            access_token: "at_secret".into(),
            refresh_token: "rt_secret".into(),
            expires_at: 1,
        });
        let debug = format!("{cred:?}");
        assert!(!debug.contains("at_secret"));
        assert!(!debug.contains("rt_secret"));
    }

    #[test]
    fn expiry_is_inclusive_of_now() {
        let oauth = OAuthCredential {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: 1_000,
        };
        assert!(!oauth.is_expired(999));
        assert!(oauth.is_expired(1_000));
    }

    #[test]
    fn unknown_credential_type_is_rejected() {
        let json = r#"{"type":"session_cookie","value":"x"}"#;
        assert!(serde_json::from_str::<Credential>(json).is_err());
    }
}
