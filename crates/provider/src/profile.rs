//! Provider profiles
//!
//! A profile names the fixed endpoints and client identification a provider
//! expects from OAuth callers. API-key accounts carry their own `base_url` and
//! only use the profile for the API version header.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::{ProviderError, Result};

pub const DEFAULT_PROVIDER: &str = "anthropic";

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_TOKEN_ENDPOINT: &str = "https://console.anthropic.com/v1/oauth/token";
const ANTHROPIC_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const CLI_USER_AGENT: &str = "claude-cli/2.0.76 (external, sdk-cli)";
const SYSTEM_PROMPT_PREFIX: &str = "You are Claude Code, Anthropic's official CLI for Claude.";
const MESSAGES_PERMISSION: &str = "anthropic.messages";

const REQUIRED_BETA_FLAGS: &[&str] = &[
    "oauth-2025-04-20",
    "interleaved-thinking-2025-05-14",
    "context-management-2025-06-27",
];

/// Endpoints and client identity for one upstream provider.
///
/// Every field except `name` defaults to the Anthropic value, so a
/// `[[providers]]` entry only has to name what differs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderProfile {
    pub name: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_beta_flags")]
    pub required_beta_flags: Vec<String>,
    /// Prepended to the `system` field of OAuth requests (non-Haiku models)
    #[serde(default = "default_system_prompt_prefix")]
    pub system_prompt_prefix: Option<String>,
    /// Permission tag an inbound key needs to be routed to this provider
    #[serde(default = "default_permission")]
    pub permission: String,
}

fn default_api_base() -> String {
    ANTHROPIC_API_BASE.to_string()
}

fn default_token_endpoint() -> String {
    ANTHROPIC_TOKEN_ENDPOINT.to_string()
}

fn default_client_id() -> String {
    ANTHROPIC_CLIENT_ID.to_string()
}

fn default_api_version() -> String {
    ANTHROPIC_VERSION.to_string()
}

fn default_user_agent() -> String {
    CLI_USER_AGENT.to_string()
}

fn default_beta_flags() -> Vec<String> {
    REQUIRED_BETA_FLAGS.iter().map(|s| s.to_string()).collect()
}

fn default_system_prompt_prefix() -> Option<String> {
    Some(SYSTEM_PROMPT_PREFIX.to_string())
}

fn default_permission() -> String {
    MESSAGES_PERMISSION.to_string()
}

impl ProviderProfile {
    pub fn anthropic() -> Self {
        Self {
            name: DEFAULT_PROVIDER.to_string(),
            api_base: default_api_base(),
            token_endpoint: default_token_endpoint(),
            client_id: default_client_id(),
            api_version: default_api_version(),
            user_agent: default_user_agent(),
            required_beta_flags: default_beta_flags(),
            system_prompt_prefix: default_system_prompt_prefix(),
            permission: default_permission(),
        }
    }
}

/// Registry of known profiles keyed by name. Always contains `anthropic`
/// unless a configured profile replaces it.
#[derive(Debug, Clone)]
pub struct ProviderProfiles {
    profiles: HashMap<String, Arc<ProviderProfile>>,
}

impl ProviderProfiles {
    pub fn new(configured: impl IntoIterator<Item = ProviderProfile>) -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(
            DEFAULT_PROVIDER.to_string(),
            Arc::new(ProviderProfile::anthropic()),
        );
        for profile in configured {
            profiles.insert(profile.name.clone(), Arc::new(profile));
        }
        Self { profiles }
    }

    pub fn get(&self, name: &str) -> Result<Arc<ProviderProfile>> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProfile(name.to_string()))
    }
}

impl Default for ProviderProfiles {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}
