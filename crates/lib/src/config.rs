//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.funil/config.json`) and
//! environment. Environment variables override file values where noted.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Consultant settings (model, credentials, retry policy).
    #[serde(default)]
    pub consultant: ConsultantConfig,

    /// Admin panel credentials.
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 16161).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Auth settings. When absent, defaults to no auth for loopback bind.
    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require connect.auth.token.
    #[serde(default)]
    pub mode: GatewayAuthMode,

    /// Shared secret for WebSocket connect. Overridden by FUNIL_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    /// No auth; allow only when bind is loopback.
    #[default]
    None,

    /// Require connect.auth.token to match configured token.
    Token,
}

fn default_gateway_port() -> u16 {
    16161
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

/// Consultant defaults: model, credential fallback, history window, and the
/// retry/cooldown policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsultantConfig {
    /// Gemini model id (default "gemini-3-flash-preview").
    pub model: Option<String>,

    /// API key used when no admin override and no GEMINI_API_KEY env is set.
    pub api_key: Option<String>,

    /// Trailing messages of history sent with each turn.
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Model calls per turn before giving up (quota failures only).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base retry delay in milliseconds; attempt n waits (n+1) * base.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Seconds new submissions are rejected after a terminal failure.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Workspace root (default ~/.funil/workspace). Holds PERSONA.md.
    pub workspace: Option<PathBuf>,
}

fn default_history_window() -> usize {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2000
}

fn default_cooldown_secs() -> u64 {
    30
}

impl Default for ConsultantConfig {
    fn default() -> Self {
        Self {
            model: None,
            api_key: None,
            history_window: default_history_window(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            cooldown_secs: default_cooldown_secs(),
            workspace: None,
        }
    }
}

/// Admin panel credentials. Login is a fixed-credential compare.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminConfig {
    #[serde(default = "default_admin_username")]
    pub username: String,

    /// Overridden by FUNIL_ADMIN_PASSWORD env. Login is disabled when neither is set.
    pub password: Option<String>,
}

fn default_admin_username() -> String {
    "admin".to_string()
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            username: default_admin_username(),
            password: None,
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// Resolve the gateway token: env FUNIL_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    std::env::var("FUNIL_GATEWAY_TOKEN")
        .ok()
        .and_then(non_empty)
        .or_else(|| {
            config
                .gateway
                .auth
                .token
                .clone()
                .and_then(non_empty)
        })
}

/// Resolve the admin password: env FUNIL_ADMIN_PASSWORD overrides config.
pub fn resolve_admin_password(config: &Config) -> Option<String> {
    std::env::var("FUNIL_ADMIN_PASSWORD")
        .ok()
        .and_then(non_empty)
        .or_else(|| config.admin.password.clone().and_then(non_empty))
}

/// Resolve the model credential: admin override first, then GEMINI_API_KEY
/// env, then config. Returns None when no credential is available anywhere.
pub fn resolve_api_key(override_key: Option<&str>, config: &Config) -> Option<String> {
    resolve_api_key_with_env(
        override_key,
        std::env::var("GEMINI_API_KEY").ok(),
        config,
    )
}

fn resolve_api_key_with_env(
    override_key: Option<&str>,
    env_key: Option<String>,
    config: &Config,
) -> Option<String> {
    override_key
        .map(str::to_string)
        .and_then(non_empty)
        .or_else(|| env_key.and_then(non_empty))
        .or_else(|| config.consultant.api_key.clone().and_then(non_empty))
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("FUNIL_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".funil").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Resolve workspace directory (PERSONA.md home).
pub fn resolve_workspace_dir(config: &Config) -> Option<PathBuf> {
    config
        .consultant
        .workspace
        .clone()
        .or_else(|| dirs::home_dir().map(|h| h.join(".funil").join("workspace")))
}

fn config_parent(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Lead records live next to the config file.
pub fn leads_path(config_path: &Path) -> PathBuf {
    config_parent(config_path).join("leads.json")
}

/// Runtime settings (admin key override) live next to the config file.
pub fn settings_path(config_path: &Path) -> PathBuf {
    config_parent(config_path).join("settings.json")
}

/// Load config from the default path (or FUNIL_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used (for resolving sibling files).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_port_and_bind() {
        let g = GatewayConfig::default();
        assert_eq!(g.port, 16161);
        assert_eq!(g.bind, "127.0.0.1");
    }

    #[test]
    fn default_retry_policy_values() {
        let c = ConsultantConfig::default();
        assert_eq!(c.history_window, 5);
        assert_eq!(c.max_attempts, 3);
        assert_eq!(c.base_delay_ms, 2000);
        assert_eq!(c.cooldown_secs, 30);
    }

    #[test]
    fn api_key_override_wins_over_env_and_config() {
        let mut config = Config::default();
        config.consultant.api_key = Some("from-config".to_string());
        let key = resolve_api_key_with_env(
            Some("from-admin"),
            Some("from-env".to_string()),
            &config,
        );
        assert_eq!(key.as_deref(), Some("from-admin"));
    }

    #[test]
    fn api_key_falls_back_env_then_config() {
        let mut config = Config::default();
        config.consultant.api_key = Some("from-config".to_string());
        let key = resolve_api_key_with_env(None, Some("from-env".to_string()), &config);
        assert_eq!(key.as_deref(), Some("from-env"));
        let key = resolve_api_key_with_env(None, None, &config);
        assert_eq!(key.as_deref(), Some("from-config"));
    }

    #[test]
    fn blank_keys_do_not_count() {
        let config = Config::default();
        let key = resolve_api_key_with_env(Some("  "), Some("".to_string()), &config);
        assert!(key.is_none());
    }

    #[test]
    fn leads_and_settings_live_next_to_the_config() {
        let path = Path::new("/home/user/.funil/config.json");
        assert_eq!(
            leads_path(path),
            PathBuf::from("/home/user/.funil/leads.json")
        );
        assert_eq!(
            settings_path(path),
            PathBuf::from("/home/user/.funil/settings.json")
        );
    }
}
