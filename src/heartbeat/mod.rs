//! Gateway heartbeat: cron-scheduled background tasks.

pub mod daemon;
pub mod tasks;

pub use daemon::HeartbeatDaemon;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// One scheduled task from heartbeat.yml.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatEntry {
    pub name: String,
    /// Six-field cron expression (seconds first).
    pub schedule: String,
    pub task: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl HeartbeatEntry {
    fn new(name: &str, schedule: &str) -> Self {
        Self {
            name: name.into(),
            schedule: schedule.into(),
            task: name.into(),
            enabled: true,
        }
    }
}

/// Load entries from `path`, or the defaults when the file does not exist.
pub fn load_entries(path: &Path) -> Result<Vec<HeartbeatEntry>> {
    if !path.exists() {
        debug!("No heartbeat config at {:?}, using defaults", path);
        return Ok(default_entries());
    }

    let contents = std::fs::read_to_string(path).context("Failed to read heartbeat.yml")?;
    let entries: Vec<HeartbeatEntry> =
        serde_yaml::from_str(&contents).context("Failed to parse heartbeat.yml")?;
    Ok(entries)
}

pub fn default_entries() -> Vec<HeartbeatEntry> {
    vec![
        HeartbeatEntry::new("push_heartbeat", "0 * * * * *"),
        HeartbeatEntry::new("evict_idle_sessions", "0 */5 * * * *"),
        HeartbeatEntry::new("check_local_agent", "30 */5 * * * *"),
        HeartbeatEntry::new("autonomous_run", "0 */30 * * * *"),
    ]
}

/// heartbeat.yml written by `zeptoclaw init`.
pub fn default_heartbeat_yaml() -> Result<String> {
    serde_yaml::to_string(&default_entries()).context("Failed to serialize heartbeat entries")
}
