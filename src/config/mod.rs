pub mod schema;

pub use schema::{
    AgentSection, AutonomousSection, GatewaySection, HeartbeatSection, MonitoredGateway,
    RateLimit, RetentionSection, SessionsSection, WatchdogSection, ZeptoClawConfig,
};

use crate::error::{GatewayError, GatewayResult};
use crate::types::ActionClass;
use anyhow::{bail, Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Tokens shorter than this are rejected at load time.
pub const MIN_TOKEN_LEN: usize = 16;

/// Default zeptoclaw home directory (~/.zeptoclaw).
pub fn default_home_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".zeptoclaw"))
        .unwrap_or_else(|| PathBuf::from(".zeptoclaw"))
}

/// Load config from the given path and apply env overrides. Callers
/// validate for the process they run ([`validate`] or [`validate_watchdog`]).
pub fn load_config(path: &Path) -> Result<ZeptoClawConfig> {
    let mut config = if path.exists() {
        let contents =
            std::fs::read_to_string(path).context("Failed to read zeptoclaw config file")?;
        toml::from_str(&contents).context("Failed to parse zeptoclaw config (TOML)")?
    } else {
        ZeptoClawConfig::default()
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Save config to the given path (TOML format).
pub fn save_config(config: &ZeptoClawConfig, path: &Path) -> Result<()> {
    let contents = toml::to_string_pretty(config).context("Failed to serialize config")?;
    crate::state::write_atomic(path, contents.as_bytes()).context("Failed to write config file")?;
    Ok(())
}

fn apply_env_overrides(config: &mut ZeptoClawConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(token) = var("ZEPTOCLAW_ADMIN_TOKEN") {
        config.gateway.admin_token = token;
    }
    if let Some(token) = var("ZEPTOCLAW_WORKSPACE_TOKEN") {
        config.gateway.workspace_token = token;
    }
    if let Some(key) = var("ZEPTOCLAW_SOCIAL_API_KEY") {
        config.autonomous.api_key = key;
    }
}

/// Gateway validation, run once after load by `serve`.
pub fn validate(config: &ZeptoClawConfig) -> Result<()> {
    let gw = &config.gateway;
    if gw.admin_token.len() < MIN_TOKEN_LEN {
        bail!("gateway.admin_token must be at least {MIN_TOKEN_LEN} characters");
    }
    if gw.workspace_token.len() < MIN_TOKEN_LEN {
        bail!("gateway.workspace_token must be at least {MIN_TOKEN_LEN} characters");
    }
    if gw.admin_token == gw.workspace_token {
        bail!("gateway.admin_token and gateway.workspace_token must differ");
    }

    for class in ActionClass::ALL {
        let limit = config.autonomous.limit_for(class);
        if limit.max_actions == 0 || limit.window_secs == 0 {
            bail!("autonomous.{class} rate limit needs max_actions >= 1 and window_secs >= 1");
        }
    }

    if config.sessions.max_messages == 0 {
        bail!("sessions.max_messages must be at least 1");
    }

    validate_watchdog(config)
}

/// Watchdog validation. Gateway tokens are not required here.
pub fn validate_watchdog(config: &ZeptoClawConfig) -> Result<()> {
    if config.watchdog.probe_interval_secs == 0 {
        bail!("watchdog.probe_interval_secs must be at least 1");
    }

    let mut seen = HashSet::new();
    for gateway in &config.watchdog.gateways {
        if !seen.insert(gateway.id.as_str()) {
            bail!("watchdog.gateways: duplicate id '{}'", gateway.id);
        }
        if !gateway.url.starts_with("http://") && !gateway.url.starts_with("https://") {
            bail!("watchdog.gateways: '{}' needs an http(s) url", gateway.id);
        }
    }

    Ok(())
}

/// Generate a random 256-bit hex token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Runtime-adjustable subset accepted by `POST /config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigPatch {
    #[serde(default)]
    pub autonomous_enabled: Option<bool>,
    #[serde(default)]
    pub session_idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub session_max_messages: Option<u32>,
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.autonomous_enabled.is_none()
            && self.session_idle_timeout_secs.is_none()
            && self.session_max_messages.is_none()
    }

    /// Validate and apply the patch to `config`.
    pub fn apply(&self, config: &mut ZeptoClawConfig) -> GatewayResult<()> {
        if self.is_empty() {
            return Err(GatewayError::InvalidInput("empty config patch".into()));
        }
        if self.session_idle_timeout_secs == Some(0) {
            return Err(GatewayError::InvalidInput(
                "session_idle_timeout_secs must be positive".into(),
            ));
        }
        if self.session_max_messages == Some(0) {
            return Err(GatewayError::InvalidInput(
                "session_max_messages must be positive".into(),
            ));
        }

        if let Some(enabled) = self.autonomous_enabled {
            config.autonomous.enabled = enabled;
        }
        if let Some(secs) = self.session_idle_timeout_secs {
            config.sessions.idle_timeout_secs = secs;
        }
        if let Some(max) = self.session_max_messages {
            config.sessions.max_messages = max;
        }
        Ok(())
    }
}
