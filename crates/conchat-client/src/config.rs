//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so a local development client starts with
//! zero configuration.

use std::path::PathBuf;
use std::time::Duration;

use conchat_shared::constants::{
    DEFAULT_API_URL, DEFAULT_BROKER_URL, DEFAULT_KEEPALIVE_SECS, DEFAULT_RECONNECT_MS,
};
use conchat_shared::types::UserId;
use conchat_net::{ConnectionConfig, SessionOptions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Broker endpoint.
    /// Env: `CONCHAT_BROKER_URL`
    /// Default: `ws://localhost:8083/mqtt`
    pub broker_url: String,

    /// Base URL of the REST backend.  Not used by the engine itself; it is
    /// the input for a [`SocialDirectory`](crate::SocialDirectory) client.
    /// Env: `CONCHAT_API_URL`
    /// Default: `http://localhost:8000/api/v1`
    pub api_base_url: String,

    /// Fixed delay before reconnecting after a connection loss.
    /// Env: `CONCHAT_RECONNECT_MS`
    /// Default: 1000 ms
    pub reconnect_backoff: Duration,

    /// Broker keep-alive interval.
    /// Env: `CONCHAT_KEEPALIVE_SECS`
    /// Default: 60 s
    pub keep_alive: Duration,

    /// Explicit database file.  `None` uses the platform data directory.
    /// Env: `CONCHAT_DB_PATH`
    pub database_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            api_base_url: DEFAULT_API_URL.to_string(),
            reconnect_backoff: Duration::from_millis(DEFAULT_RECONNECT_MS),
            keep_alive: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            database_path: None,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("CONCHAT_BROKER_URL") {
            config.broker_url = url;
        }

        if let Some(url) = lookup("CONCHAT_API_URL") {
            config.api_base_url = url.trim_end_matches('/').to_string();
        }

        if let Some(val) = lookup("CONCHAT_RECONNECT_MS") {
            match val.parse::<u64>() {
                Ok(ms) if ms > 0 => config.reconnect_backoff = Duration::from_millis(ms),
                _ => tracing::warn!(value = %val, "Invalid CONCHAT_RECONNECT_MS, using default"),
            }
        }

        if let Some(val) = lookup("CONCHAT_KEEPALIVE_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => config.keep_alive = Duration::from_secs(secs),
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid CONCHAT_KEEPALIVE_SECS, using default")
                }
            }
        }

        if let Some(path) = lookup("CONCHAT_DB_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }

    /// Connection settings for `user`'s persistent broker session.
    pub fn connection_config(&self, user: &UserId) -> ConnectionConfig {
        let options = SessionOptions::for_identity(user, self.broker_url.clone(), self.keep_alive);
        ConnectionConfig::new(options).with_backoff(self.reconnect_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> ClientConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ClientConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.broker_url, "ws://localhost:8083/mqtt");
        assert_eq!(config.reconnect_backoff, Duration::from_secs(1));
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("CONCHAT_BROKER_URL", "wss://broker.example/mqtt"),
            ("CONCHAT_API_URL", "https://api.example/v1/"),
            ("CONCHAT_RECONNECT_MS", "250"),
            ("CONCHAT_DB_PATH", "/tmp/conchat.db"),
        ]);
        assert_eq!(config.broker_url, "wss://broker.example/mqtt");
        assert_eq!(config.api_base_url, "https://api.example/v1");
        assert_eq!(config.reconnect_backoff, Duration::from_millis(250));
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/conchat.db")));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = from_pairs(&[
            ("CONCHAT_RECONNECT_MS", "soon"),
            ("CONCHAT_KEEPALIVE_SECS", "-1"),
        ]);
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn test_connection_config_uses_identity() {
        let user = UserId::new();
        let config = ClientConfig::default().connection_config(&user);
        assert_eq!(config.options.client_id, format!("web_{user}"));
        assert_eq!(config.reconnect_backoff, Duration::from_secs(1));
    }
}
