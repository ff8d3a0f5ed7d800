//! Cron-based heartbeat daemon that runs gateway background tasks on
//! schedule.
//!
//! A failing task is logged and retried on its next slot; it never stops
//! the daemon or the other tasks.

use crate::heartbeat::{tasks, HeartbeatEntry};
use crate::server::AppState;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Background heartbeat daemon.
pub struct HeartbeatDaemon {
    app: AppState,
    http: reqwest::Client,
    entries: Vec<(HeartbeatEntry, Schedule)>,
    last_run: HashMap<String, DateTime<Utc>>,
    started_at: DateTime<Utc>,
}

impl HeartbeatDaemon {
    /// Entries with an unparsable schedule are dropped with a warning.
    pub fn new(app: AppState, entries: Vec<HeartbeatEntry>) -> Self {
        let entries: Vec<_> = entries
            .into_iter()
            .filter(|entry| entry.enabled)
            .filter_map(|entry| match Schedule::from_str(&entry.schedule) {
                Ok(schedule) => Some((entry, schedule)),
                Err(e) => {
                    warn!(
                        "Invalid cron schedule '{}' for '{}': {}",
                        entry.schedule, entry.name, e
                    );
                    None
                }
            })
            .collect();
        info!("Loaded {} heartbeat entries", entries.len());

        Self {
            app,
            http: reqwest::Client::new(),
            entries,
            last_run: HashMap::new(),
            started_at: Utc::now(),
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!("Heartbeat daemon started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(TICK_INTERVAL) => {
                    self.tick(Utc::now()).await;
                }
                _ = cancel.cancelled() => {
                    info!("Heartbeat daemon shutting down");
                    return;
                }
            }
        }
    }

    /// Run every entry due at `now`. Returns the names that ran.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut ran = Vec::new();

        for (entry, schedule) in &self.entries {
            let last = self.last_run.get(&entry.name).copied().unwrap_or(self.started_at);
            if !is_due(schedule, last, now) {
                continue;
            }

            debug!("Running heartbeat task: {}", entry.name);
            match tasks::execute_task(&entry.task, &self.app, &self.http).await {
                Ok(result) => debug!("Heartbeat task '{}': {}", entry.name, result),
                Err(e) => warn!("Heartbeat task '{}' failed: {:#}", entry.name, e),
            }
            self.last_run.insert(entry.name.clone(), now);
            ran.push(entry.name.clone());
        }

        ran
    }
}

/// Whether `schedule` has a slot in `(last, now]`.
pub fn is_due(schedule: &Schedule, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    schedule
        .after(&last)
        .next()
        .map(|next| next <= now)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn every_five_minutes() {
        let schedule = Schedule::from_str("0 */5 * * * *").unwrap();
        assert!(!is_due(&schedule, at(10, 0, 0), at(10, 4, 59)));
        assert!(is_due(&schedule, at(10, 0, 0), at(10, 5, 0)));
        assert!(is_due(&schedule, at(10, 3, 0), at(10, 5, 30)));
    }

    #[test]
    fn slot_is_not_repeated() {
        let schedule = Schedule::from_str("0 * * * * *").unwrap();
        assert!(is_due(&schedule, at(10, 0, 30), at(10, 1, 0)));
        assert!(!is_due(&schedule, at(10, 1, 0), at(10, 1, 0)));
        assert!(!is_due(&schedule, at(10, 1, 0), at(10, 1, 59)));
    }
}
