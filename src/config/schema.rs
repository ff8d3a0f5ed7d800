//! Configuration schema for zeptoclaw.toml.

use crate::types::ActionClass;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ZeptoClawConfig {
    pub gateway: GatewaySection,
    pub sessions: SessionsSection,
    pub autonomous: AutonomousSection,
    pub agent: AgentSection,
    pub heartbeat: HeartbeatSection,
    pub retention: RetentionSection,
    pub watchdog: WatchdogSection,
}

/// HTTP gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// Listen address for the HTTP/WebSocket API.
    pub bind: String,

    /// Token granting the full management surface.
    pub admin_token: String,

    /// Token restricted to agent interaction and autonomous actions.
    pub workspace_token: String,

    /// Agent workspace directory (handed to the agent command as cwd).
    pub workspace_dir: String,

    /// Directory holding state.json, sessions.json and the writer lock.
    pub state_dir: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:18789".into(),
            admin_token: String::new(),
            workspace_token: String::new(),
            workspace_dir: "~/.zeptoclaw/workspace".into(),
            state_dir: "~/.zeptoclaw/state".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsSection {
    /// Sessions idle longer than this are evicted by the heartbeat daemon.
    pub idle_timeout_secs: u64,

    /// Turns allowed per session.
    pub max_messages: u32,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 3600,
            max_messages: 200,
        }
    }
}

/// One fixed rate-limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_actions: u32,
    pub window_secs: u64,
}

/// Social-platform autonomy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutonomousSection {
    pub enabled: bool,

    /// Social platform API base URL.
    pub api_url: String,

    /// Social platform API key.
    pub api_key: String,

    /// Community that posts are published to.
    pub submolt: String,

    /// Queries cycled through when a search has no explicit query.
    pub search_topics: Vec<String>,

    /// Items requested per browse.
    pub browse_limit: u32,

    pub browse: RateLimit,
    pub search: RateLimit,
    pub post: RateLimit,
}

impl Default for AutonomousSection {
    fn default() -> Self {
        Self {
            enabled: false,
            api_url: "https://www.moltbook.com".into(),
            api_key: String::new(),
            submolt: "general".into(),
            search_topics: vec![
                "ai agents".into(),
                "rust".into(),
                "self-hosting".into(),
            ],
            browse_limit: 10,
            browse: RateLimit {
                max_actions: 6,
                window_secs: 3600,
            },
            search: RateLimit {
                max_actions: 6,
                window_secs: 3600,
            },
            post: RateLimit {
                max_actions: 1,
                window_secs: 1800,
            },
        }
    }
}

impl AutonomousSection {
    pub fn limit_for(&self, class: ActionClass) -> RateLimit {
        match class {
            ActionClass::Browse => self.browse,
            ActionClass::Search => self.search,
            ActionClass::Post => self.post,
        }
    }
}

/// External agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// argv of a command that reads a prompt on stdin and replies on stdout.
    /// Empty disables agent invocation.
    pub command: Vec<String>,

    pub timeout_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSection {
    /// Path to the heartbeat task schedule (YAML).
    pub schedule_path: String,

    /// Base URL of the edge watchdog. Empty disables heartbeat pushes.
    pub watchdog_url: String,

    /// Identity this gateway reports under.
    pub gateway_id: String,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            schedule_path: "~/.zeptoclaw/heartbeat.yml".into(),
            watchdog_url: String::new(),
            gateway_id: "default".into(),
        }
    }
}

/// Bounds for the append-only histories.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    pub heartbeats: usize,
    pub incidents: usize,
    pub discoveries: usize,
    pub alerts: usize,
    pub ideas: usize,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            heartbeats: 1000,
            incidents: 1000,
            discoveries: 500,
            alerts: 200,
            ideas: 100,
        }
    }
}

/// A gateway monitored by the watchdog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredGateway {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSection {
    pub bind: String,
    pub state_dir: String,

    /// Downtime alerts are POSTed here; empty means log-only.
    pub alert_webhook_url: String,

    pub probe_interval_secs: u64,
    pub gateways: Vec<MonitoredGateway>,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:18790".into(),
            state_dir: "~/.zeptoclaw/watchdog".into(),
            alert_webhook_url: String::new(),
            probe_interval_secs: 60,
            gateways: Vec::new(),
        }
    }
}

impl ZeptoClawConfig {
    /// Resolve a path that may contain `~` to an absolute path.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).into_owned())
    }

    pub fn resolved_state_dir(&self) -> PathBuf {
        self.resolve_path(&self.gateway.state_dir)
    }

    pub fn resolved_workspace_dir(&self) -> PathBuf {
        self.resolve_path(&self.gateway.workspace_dir)
    }

    pub fn resolved_heartbeat_path(&self) -> PathBuf {
        self.resolve_path(&self.heartbeat.schedule_path)
    }

    pub fn resolved_watchdog_state_dir(&self) -> PathBuf {
        self.resolve_path(&self.watchdog.state_dir)
    }

    /// Copy with every secret replaced, for `GET /config`.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        for secret in [
            &mut copy.gateway.admin_token,
            &mut copy.gateway.workspace_token,
            &mut copy.autonomous.api_key,
        ] {
            if !secret.is_empty() {
                *secret = "********".into();
            }
        }
        copy
    }
}
