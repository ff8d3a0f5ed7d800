//! Rate-limited autonomous actions against the social platform.

pub mod agent;

pub use agent::{AutonomousAgent, AutonomousSettings};

use crate::types::ActionClass;
use serde::Serialize;

/// Outcome of one autonomous action, as returned by the `/autonomous/*`
/// routes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionReport {
    /// `browse`, `search`, `post`, or `none` when nothing could run.
    pub action: String,
    pub deferred: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ActionReport {
    pub fn completed(action: ActionClass, result: serde_json::Value) -> Self {
        Self {
            action: action.to_string(),
            deferred: false,
            result: Some(result),
            reason: None,
            retry_after_secs: None,
        }
    }

    /// Rate limited; try again after `retry_after_secs`.
    pub fn deferred(action: Option<ActionClass>, retry_after_secs: u64, reason: &str) -> Self {
        Self {
            action: action.map(|a| a.to_string()).unwrap_or_else(|| "none".into()),
            deferred: true,
            result: None,
            reason: Some(reason.to_string()),
            retry_after_secs: Some(retry_after_secs),
        }
    }

    /// Nothing to do, not rate limited.
    pub fn skipped(action: ActionClass, reason: &str) -> Self {
        Self {
            action: action.to_string(),
            deferred: false,
            result: None,
            reason: Some(reason.to_string()),
            retry_after_secs: None,
        }
    }
}
