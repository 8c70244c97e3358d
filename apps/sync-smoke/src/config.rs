//! Environment-backed runtime configuration for `sync-smoke`.

use std::env;

use thiserror::Error;

use sync_core::EngineConfig;

const DEFAULT_CONVERSATION_ID: &str = "smoke-conversation";

/// Configuration parsing errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable held a value that failed to parse.
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
}

/// Runtime configuration used by the smoke binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeConfig {
    /// Conversation the engine synchronizes.
    pub conversation_id: String,
    /// Optional auth credential applied to the channel before subscribing.
    pub auth_token: Option<String>,
    /// Engine tuning forwarded to `SyncEngine::new`.
    pub engine: EngineConfig,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let conversation_id = optional_trimmed("CHATSYNC_CONVERSATION", &mut lookup)
            .unwrap_or_else(|| DEFAULT_CONVERSATION_ID.to_owned());
        let auth_token = optional_trimmed("CHATSYNC_AUTH_TOKEN", &mut lookup);

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            max_messages: parse_optional(
                "CHATSYNC_MAX_MESSAGES",
                defaults.max_messages,
                &mut lookup,
            )?,
            max_reconnect_attempts: parse_optional(
                "CHATSYNC_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
                &mut lookup,
            )?,
            base_reconnect_delay_ms: parse_optional(
                "CHATSYNC_BASE_RECONNECT_DELAY_MS",
                defaults.base_reconnect_delay_ms,
                &mut lookup,
            )?,
            max_reconnect_delay_ms: parse_optional(
                "CHATSYNC_MAX_RECONNECT_DELAY_MS",
                defaults.max_reconnect_delay_ms,
                &mut lookup,
            )?,
            send_timeout_ms: parse_optional(
                "CHATSYNC_SEND_TIMEOUT_MS",
                defaults.send_timeout_ms,
                &mut lookup,
            )?,
        };

        Ok(Self {
            conversation_id,
            auth_token,
            engine,
        })
    }
}

fn optional_trimmed<F>(key: &str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional<T, F>(key: &str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: FnMut(&str) -> Option<String>,
{
    match optional_trimmed(key, lookup) {
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_owned(),
            value,
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_defaults_without_env() {
        let config = SmokeConfig::from_lookup(|_| None).expect("defaults should parse");
        assert_eq!(config.conversation_id, DEFAULT_CONVERSATION_ID);
        assert_eq!(config.auth_token, None);
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn reads_overrides_from_lookup() {
        let config = SmokeConfig::from_lookup(|key| match key {
            "CHATSYNC_CONVERSATION" => Some("conv-42".to_owned()),
            "CHATSYNC_AUTH_TOKEN" => Some(" tok ".to_owned()),
            "CHATSYNC_MAX_MESSAGES" => Some("10".to_owned()),
            "CHATSYNC_MAX_RECONNECT_ATTEMPTS" => Some("3".to_owned()),
            _ => None,
        })
        .expect("overrides should parse");

        assert_eq!(config.conversation_id, "conv-42");
        assert_eq!(config.auth_token.as_deref(), Some("tok"));
        assert_eq!(config.engine.max_messages, 10);
        assert_eq!(config.engine.max_reconnect_attempts, 3);
        assert_eq!(
            config.engine.send_timeout_ms,
            EngineConfig::default().send_timeout_ms
        );
    }

    #[test]
    fn rejects_unparseable_numbers() {
        let err = SmokeConfig::from_lookup(|key| match key {
            "CHATSYNC_MAX_MESSAGES" => Some("lots".to_owned()),
            _ => None,
        })
        .expect_err("bad number must be rejected");

        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "CHATSYNC_MAX_MESSAGES".to_owned(),
                value: "lots".to_owned(),
            }
        );
    }
}
