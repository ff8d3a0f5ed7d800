//! Shared types used across the zeptoclaw control plane.
//!
//! Everything that crosses a process boundary (HTTP bodies, the heartbeat
//! wire protocol, persisted JSON documents) is camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Trust scope attached to a validated token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Full management surface.
    Admin,
    /// Restricted to agent interaction and autonomous actions.
    Workspace,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admin => write!(f, "admin"),
            Self::Workspace => write!(f, "workspace"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// An active agent session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub message_count: u32,
    pub max_messages: u32,
}

impl Session {
    /// Whether the session has used up its message allowance.
    pub fn is_exhausted(&self) -> bool {
        self.message_count >= self.max_messages
    }

    /// Time since the last turn.
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_active_at
    }
}

// ---------------------------------------------------------------------------
// Heartbeat / incident wire protocol
// ---------------------------------------------------------------------------

/// A liveness report from the local agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatData {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<f64>,
}

/// Kind of abnormal event reported by a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IncidentType {
    StuckSession,
    Crash,
    Timeout,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for IncidentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StuckSession => write!(f, "stuck-session"),
            Self::Crash => write!(f, "crash"),
            Self::Timeout => write!(f, "timeout"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A recorded abnormal event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayIncident {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: IncidentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stuck_duration_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Stamped by the receiver; any client-supplied value is overwritten.
    #[serde(default = "Utc::now")]
    pub reported_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Autonomous progress
// ---------------------------------------------------------------------------

/// Rate-limited action classes against the social platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    Browse,
    Search,
    Post,
}

impl ActionClass {
    pub const ALL: [ActionClass; 3] = [Self::Browse, Self::Search, Self::Post];
}

impl fmt::Display for ActionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Browse => write!(f, "browse"),
            Self::Search => write!(f, "search"),
            Self::Post => write!(f, "post"),
        }
    }
}

/// Priority of a queued post idea. Ordering is low < normal < high.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdeaPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// An idea waiting to be turned into a post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostIdea {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub priority: IdeaPriority,
    pub queued_at: DateTime<Utc>,
}

/// Content surfaced by a browse or search action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discovery {
    pub id: String,
    pub action: ActionClass,
    pub source_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub discovered_at: DateTime<Utc>,
}

/// Accounting for one fixed rate-limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowState {
    pub started_at: DateTime<Utc>,
    pub count: u32,
}

/// Persisted rate-limiter windows, keyed by action class.
pub type RateLimiterSnapshot = BTreeMap<ActionClass, WindowState>;

/// Progress of the autonomous scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutonomousProgress {
    pub post_idea_queue: Vec<PostIdea>,
    pub last_action_at: Option<DateTime<Utc>>,
    pub last_action: Option<ActionClass>,
    /// Last of browse/search, drives the round-robin.
    pub last_discovery_action: Option<ActionClass>,
    pub next_topic_index: usize,
    pub discoveries: Vec<Discovery>,
    pub posts_published: u64,
    pub rate_limiter_window_state: RateLimiterSnapshot,
}

// ---------------------------------------------------------------------------
// Gateway root state
// ---------------------------------------------------------------------------

/// Root document persisted by the gateway's StateStore.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ZeptoClawState {
    pub local_last_seen: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<HeartbeatData>,
    pub heartbeat_history: Vec<HeartbeatData>,
    pub gateway_incidents: Vec<GatewayIncident>,
    pub downtime_alerts_sent: Vec<DateTime<Utc>>,
    pub total_requests: u64,
    pub total_errors: u64,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub autonomous: AutonomousProgress,
}

// ---------------------------------------------------------------------------
// Push events
// ---------------------------------------------------------------------------

/// An event pushed to WebSocket subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl GatewayEvent {
    pub fn new(kind: &str, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }
}
