use crate::cache::NEVER_STALE;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "http://localhost:8000/api";

/// When the server-side session is created for a "new session".
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionCreation {
    /// Keep a placeholder until the first message is sent.
    #[default]
    Lazy,
    /// Create immediately and reconcile the placeholder on response.
    Eager,
}

/// Seconds after which each entity family is refreshed in the background.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct StaleTimes {
    pub agents: u64,
    pub sessions: u64,
    pub messages: u64,
    pub saved_words: u64,
}

impl Default for StaleTimes {
    fn default() -> Self {
        Self {
            agents: 300,
            sessions: 60,
            messages: 30,
            saved_words: 120,
        }
    }
}

impl StaleTimes {
    pub fn agents(&self) -> Duration {
        Duration::from_secs(self.agents)
    }

    pub fn sessions(&self) -> Duration {
        Duration::from_secs(self.sessions)
    }

    pub fn messages(&self) -> Duration {
        Duration::from_secs(self.messages)
    }

    pub fn saved_words(&self) -> Duration {
        Duration::from_secs(self.saved_words)
    }

    /// Translations are fetched once and kept until explicitly invalidated.
    pub fn translations(&self) -> Duration {
        NEVER_STALE
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    // 'env:NAME' or the literal token; resolved by the host at startup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token_ref: Option<String>,
    pub stale_times: StaleTimes,
    pub page_size: u32,
    pub session_creation: SessionCreation,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth_token_ref: None,
            stale_times: StaleTimes::default(),
            page_size: 20,
            session_creation: SessionCreation::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse client config JSON")
    }

    /// Reads the config JSON from an environment variable, falling back to
    /// defaults when it is unset.
    pub fn from_env_json(var: &str) -> Result<Self> {
        match std::env::var(var) {
            Ok(json) => {
                log::debug!("Loading client config from environment variable: {}", var);
                Self::from_json_str(&json)
                    .with_context(|| format!("Invalid client config in '{}'", var))
            }
            Err(std::env::VarError::NotPresent) => {
                log::debug!("{} not set, using default client config", var);
                Ok(Self::default())
            }
            Err(e) => Err(e).context(format!("Failed to read environment variable '{}'", var)),
        }
    }
}

/// Resolves the auth token reference of a config, if any.
///
/// `env:NAME` reads the environment variable `NAME`; any other value is used
/// as the token itself.
pub fn resolve_auth_token(config: &ClientConfig) -> Result<Option<String>> {
    match config.auth_token_ref.as_deref() {
        Some(ref_str) if ref_str.starts_with("env:") => {
            let env_var_name = ref_str.trim_start_matches("env:");
            log::debug!("Retrieving auth token from environment variable: {}", env_var_name);
            std::env::var(env_var_name)
                .map(Some)
                .context(format!(
                    "Failed to get auth token from environment variable '{}'",
                    env_var_name
                ))
        }
        Some(token) if !token.trim().is_empty() => Ok(Some(token.to_string())),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = ClientConfig::from_json_str(
            r#"{ "base_url": "https://chat.example.com/api", "stale_times": { "messages": 5 }, "session_creation": "eager" }"#,
        )
        .unwrap();
        assert_eq!(config.base_url, "https://chat.example.com/api");
        assert_eq!(config.stale_times.messages(), Duration::from_secs(5));
        assert_eq!(config.stale_times.sessions(), Duration::from_secs(60));
        assert_eq!(config.page_size, 20);
        assert_eq!(config.session_creation, SessionCreation::Eager);
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(ClientConfig::from_json_str("{ nope").is_err());
    }

    #[test]
    fn resolves_literal_and_env_tokens() {
        let mut config = ClientConfig::default();
        assert_eq!(resolve_auth_token(&config).unwrap(), None);

        config.auth_token_ref = Some("abc123".into());
        assert_eq!(resolve_auth_token(&config).unwrap().as_deref(), Some("abc123"));

        std::env::set_var("CHATCACHE_TEST_TOKEN", "from-env");
        config.auth_token_ref = Some("env:CHATCACHE_TEST_TOKEN".into());
        assert_eq!(resolve_auth_token(&config).unwrap().as_deref(), Some("from-env"));

        config.auth_token_ref = Some("env:CHATCACHE_TEST_TOKEN_MISSING".into());
        assert!(resolve_auth_token(&config).is_err());
    }

    #[test]
    fn translations_never_go_stale() {
        assert_eq!(StaleTimes::default().translations(), NEVER_STALE);
    }
}
