//! Configuration and credential storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{StoredToken, TokenStore};

const DEFAULT_API_BASE: &str = "https://socket.eldor.kz";
const DEFAULT_WS_URL: &str = "wss://socket.eldor.kz/api/ws";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Gateway REST base URL
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Realtime WebSocket endpoint (token is appended as `?token=`)
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Stored bearer JWT
    pub access_token: Option<StoredToken>,
    /// Sync tuning
    #[serde(default)]
    pub sync: SyncSettings,
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_ws_url() -> String {
    DEFAULT_WS_URL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            ws_url: default_ws_url(),
            access_token: None,
            sync: SyncSettings::default(),
        }
    }
}

/// Realtime and polling behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Use the WebSocket feed. When off, the chat list is polled only.
    pub realtime: bool,
    pub poll_interval_ms: u64,
    /// Fixed delay between reconnect attempts (no backoff, no cap).
    pub reconnect_delay_ms: u64,
    /// Delay before reloading messages after a successful send.
    pub reload_delay_ms: u64,
    pub reply_cache_ttl_secs: u64,
    pub reply_cache_max_entries: usize,
    pub unread_ledger_max_entries: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            realtime: true,
            poll_interval_ms: 5000,
            reconnect_delay_ms: 5000,
            reload_delay_ms: 1000,
            reply_cache_ttl_secs: 24 * 60 * 60,
            reply_cache_max_entries: 500,
            unread_ledger_max_entries: 1000,
        }
    }
}

impl SyncSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn reload_delay(&self) -> Duration {
        Duration::from_millis(self.reload_delay_ms)
    }
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("kz", "eldor", "eldor-cli")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        Self::parse(&content)
    }

    fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (contains tokens)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }
}

impl TokenStore for Config {
    fn get_access_token(&self) -> Option<StoredToken> {
        self.access_token.clone()
    }

    fn set_access_token(&mut self, token: &str) {
        self.access_token = Some(StoredToken::from_jwt(token));
    }

    fn clear_tokens(&mut self) {
        self.access_token = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.ws_url, DEFAULT_WS_URL);
        assert_eq!(config.sync, SyncSettings::default());
        assert_eq!(config.sync.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.sync.reconnect_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_sync_section() {
        let config = Config::parse(
            r#"
            api_base = "http://localhost:8080"

            [sync]
            realtime = false
            poll_interval_ms = 2000
            "#,
        )
        .unwrap();
        assert_eq!(config.api_base, "http://localhost:8080");
        assert!(!config.sync.realtime);
        assert_eq!(config.sync.poll_interval_ms, 2000);
        assert_eq!(config.sync.reply_cache_ttl_secs, 86400);
    }

    #[test]
    fn test_token_store() {
        let mut config = Config::default();
        config.set_access_token("abc");
        assert_eq!(config.get_access_token().unwrap().token, "abc");
        config.clear_tokens();
        assert!(config.get_access_token().is_none());

        // Round-trips through TOML.
        config.set_access_token("xyz");
        let text = toml::to_string_pretty(&config).unwrap();
        let back = Config::parse(&text).unwrap();
        assert_eq!(back.access_token, config.access_token);
    }
}
