//! The gateway's root state: heartbeats, incidents, error counters and
//! autonomous progress, persisted as one `state.json` document.

use crate::config::RetentionSection;
use crate::error::{GatewayError, GatewayResult};
use crate::state::JsonStore;
use crate::types::*;
use crate::watchdog::{alerts, LOCAL_AGENT_TIMEOUT_MS};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};

pub const STATE_FILE: &str = "state.json";

/// Health figures derived from the state at read time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedHealth {
    pub seconds_since_heartbeat: Option<i64>,
    pub local_agent_timeout_seconds: i64,
    pub local_agent_down: bool,
    pub error_rate: f64,
}

/// Single-writer store for [`ZeptoClawState`].
pub struct StateStore {
    doc: JsonStore<ZeptoClawState>,
    retention: RetentionSection,
    requests: AtomicU64,
}

impl StateStore {
    /// Lock and load `state.json` under `state_dir`.
    pub fn open(state_dir: &Path, retention: RetentionSection) -> Result<Self> {
        let doc = JsonStore::<ZeptoClawState>::open(&state_dir.join(STATE_FILE))?;
        let requests = doc
            .try_snapshot()
            .map(|state| state.total_requests)
            .unwrap_or_default();
        Ok(Self {
            doc,
            retention,
            requests: AtomicU64::new(requests),
        })
    }

    pub fn path(&self) -> &Path {
        self.doc.path()
    }

    /// Count one routed request. Written with the next persisted mutation.
    pub fn count_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn snapshot(&self) -> ZeptoClawState {
        let mut state = self.doc.snapshot().await;
        state.total_requests = self.requests.load(Ordering::Relaxed);
        state
    }

    /// Apply `f`, enforce retention and persist atomically.
    ///
    /// A write failure is recorded in the error counters before it is
    /// returned.
    pub async fn update<R>(
        &self,
        f: impl FnOnce(&mut ZeptoClawState) -> GatewayResult<R>,
    ) -> GatewayResult<R> {
        let retention = self.retention;
        let requests = self.requests.load(Ordering::Relaxed);
        let result = self
            .doc
            .update(|state| {
                let result = f(state)?;
                state.total_requests = requests;
                enforce_retention(state, &retention);
                Ok(result)
            })
            .await;

        if let Err(err @ GatewayError::Persistence(_)) = &result {
            self.record_error(&err.to_string()).await;
        }
        result
    }

    /// Bump `totalErrors` and set `lastError`.
    ///
    /// The counter is updated in memory first; persisting it is best effort.
    pub async fn record_error(&self, message: &str) {
        let now = Utc::now();
        let message = message.to_string();
        let requests = self.requests.load(Ordering::Relaxed);
        let outcome = self
            .doc
            .update_in_place(|state| {
                state.total_errors += 1;
                state.last_error = Some(message);
                state.last_error_at = Some(now);
                state.total_requests = requests;
            })
            .await;
        if let Err(err) = outcome {
            error!("Error counter could not be persisted: {}", err);
        }
    }

    // -----------------------------------------------------------------------
    // Heartbeats
    // -----------------------------------------------------------------------

    /// Append a heartbeat and move `localLastSeen` to its timestamp.
    pub async fn record_heartbeat(&self, heartbeat: HeartbeatData) -> GatewayResult<()> {
        self.update(|state| {
            state.local_last_seen = Some(heartbeat.timestamp);
            state.last_heartbeat = Some(heartbeat.clone());
            state.heartbeat_history.push(heartbeat);
            Ok(())
        })
        .await
    }

    /// Record a local-agent-down alert unless one was already sent for the
    /// current silence episode. Returns whether an alert is due.
    pub async fn record_downtime_alert(&self, now: DateTime<Utc>) -> GatewayResult<bool> {
        self.update(|state| {
            let Some(last_seen) = state.local_last_seen else {
                return Ok(false);
            };
            if !local_agent_down(last_seen, now) {
                return Ok(false);
            }
            let episode_start = last_seen + chrono::Duration::milliseconds(LOCAL_AGENT_TIMEOUT_MS);
            if !alerts::alert_due(state.downtime_alerts_sent.iter().copied(), episode_start) {
                return Ok(false);
            }
            state.downtime_alerts_sent.push(now);
            warn!("Local agent silent since {}", last_seen.to_rfc3339());
            Ok(true)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Incidents
    // -----------------------------------------------------------------------

    pub async fn record_incident(&self, mut incident: GatewayIncident) -> GatewayResult<GatewayIncident> {
        incident.reported_at = Utc::now();
        info!(
            "Incident recorded: {} (session: {})",
            incident.kind,
            incident.session_id.as_deref().unwrap_or("-")
        );
        self.update(|state| {
            state.gateway_incidents.push(incident.clone());
            Ok(incident)
        })
        .await
    }

    pub async fn incidents(&self) -> Vec<GatewayIncident> {
        self.doc.snapshot().await.gateway_incidents
    }

    // -----------------------------------------------------------------------
    // Autonomous progress
    // -----------------------------------------------------------------------

    pub async fn progress(&self) -> AutonomousProgress {
        self.doc.snapshot().await.autonomous
    }

    /// Mutate and persist autonomous progress only.
    pub async fn update_progress<R>(
        &self,
        f: impl FnOnce(&mut AutonomousProgress) -> GatewayResult<R>,
    ) -> GatewayResult<R> {
        self.update(|state| f(&mut state.autonomous)).await
    }

    // -----------------------------------------------------------------------
    // Derived health
    // -----------------------------------------------------------------------

    pub async fn derived_health(&self, now: DateTime<Utc>) -> DerivedHealth {
        let state = self.snapshot().await;
        derive_health(&state, now)
    }
}

/// Whether `last_seen` is older than the local-agent timeout at `now`.
pub fn local_agent_down(last_seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    (now - last_seen).num_milliseconds() > LOCAL_AGENT_TIMEOUT_MS
}

pub fn derive_health(state: &ZeptoClawState, now: DateTime<Utc>) -> DerivedHealth {
    let seconds_since_heartbeat = state.local_last_seen.map(|t| (now - t).num_seconds());
    let error_rate = if state.total_requests == 0 {
        0.0
    } else {
        state.total_errors as f64 / state.total_requests as f64
    };
    DerivedHealth {
        seconds_since_heartbeat,
        local_agent_timeout_seconds: LOCAL_AGENT_TIMEOUT_MS / 1000,
        local_agent_down: state
            .local_last_seen
            .map(|t| local_agent_down(t, now))
            .unwrap_or(false),
        error_rate,
    }
}

fn enforce_retention(state: &mut ZeptoClawState, retention: &RetentionSection) {
    truncate_front(&mut state.heartbeat_history, retention.heartbeats);
    truncate_front(&mut state.gateway_incidents, retention.incidents);
    truncate_front(&mut state.downtime_alerts_sent, retention.alerts);
    truncate_front(&mut state.autonomous.discoveries, retention.discoveries);
}

/// Drop the oldest entries so at most `keep` remain.
pub(crate) fn truncate_front<T>(items: &mut Vec<T>, keep: usize) {
    if items.len() > keep {
        items.drain(..items.len() - keep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn heartbeat_at(ts: DateTime<Utc>) -> HeartbeatData {
        HeartbeatData {
            timestamp: ts,
            hostname: Some("pi".into()),
            process_id: Some(7),
            http_status: Some(200),
            uptime_seconds: Some(60),
            version: Some("0.1.0".into()),
            memory_mb: Some(31.5),
        }
    }

    fn open(dir: &Path) -> StateStore {
        StateStore::open(dir, RetentionSection::default()).unwrap()
    }

    #[tokio::test]
    async fn replayed_heartbeat_appends_twice_with_same_last_seen() {
        let temp = TempDir::new().unwrap();
        let store = open(temp.path());
        let hb = heartbeat_at(Utc::now());

        store.record_heartbeat(hb.clone()).await.unwrap();
        let first = store.snapshot().await.local_last_seen;
        store.record_heartbeat(hb.clone()).await.unwrap();
        let state = store.snapshot().await;

        assert_eq!(state.heartbeat_history.len(), 2);
        assert_eq!(state.local_last_seen, first);
        assert_eq!(state.local_last_seen, Some(hb.timestamp));
    }

    #[tokio::test]
    async fn state_survives_reopen_field_for_field() {
        let temp = TempDir::new().unwrap();
        let before = {
            let store = open(temp.path());
            store.count_request();
            store.record_heartbeat(heartbeat_at(Utc::now())).await.unwrap();
            store
                .record_incident(GatewayIncident {
                    timestamp: Utc::now(),
                    kind: IncidentType::StuckSession,
                    session_id: Some("abc".into()),
                    stuck_duration_seconds: Some(900),
                    hostname: None,
                    error: None,
                    reported_at: Utc::now(),
                })
                .await
                .unwrap();
            store
                .update_progress(|p| {
                    p.posts_published = 3;
                    Ok(())
                })
                .await
                .unwrap();
            store.snapshot().await
        };

        let reopened = open(temp.path());
        assert_eq!(reopened.snapshot().await, before);
        assert_eq!(before.total_requests, 1);
    }

    #[tokio::test]
    async fn request_count_resumes_after_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let store = open(temp.path());
            store.count_request();
            store.count_request();
            store.record_error("boom").await;
        }
        let reopened = open(temp.path());
        reopened.count_request();
        assert_eq!(reopened.snapshot().await.total_requests, 3);
    }

    #[tokio::test]
    async fn heartbeat_history_is_bounded() {
        let temp = TempDir::new().unwrap();
        let retention = RetentionSection {
            heartbeats: 3,
            ..Default::default()
        };
        let store = StateStore::open(temp.path(), retention).unwrap();
        let base = Utc::now();
        for i in 0..5 {
            store
                .record_heartbeat(heartbeat_at(base + chrono::Duration::seconds(i)))
                .await
                .unwrap();
        }
        let state = store.snapshot().await;
        assert_eq!(state.heartbeat_history.len(), 3);
        assert_eq!(
            state.heartbeat_history[0].timestamp,
            base + chrono::Duration::seconds(2)
        );
    }

    #[tokio::test]
    async fn record_error_bumps_counters() {
        let temp = TempDir::new().unwrap();
        let store = open(temp.path());
        store.record_error("upstream exploded").await;
        let state = store.snapshot().await;
        assert_eq!(state.total_errors, 1);
        assert_eq!(state.last_error.as_deref(), Some("upstream exploded"));
        assert!(state.last_error_at.is_some());
    }

    #[tokio::test]
    async fn downtime_alert_sent_once_per_silence() {
        let temp = TempDir::new().unwrap();
        let store = open(temp.path());
        let seen = Utc::now() - chrono::Duration::hours(3);
        store.record_heartbeat(heartbeat_at(seen)).await.unwrap();

        let now = Utc::now();
        assert!(store.record_downtime_alert(now).await.unwrap());
        assert!(!store
            .record_downtime_alert(now + chrono::Duration::seconds(5))
            .await
            .unwrap());

        // A fresh heartbeat ends the episode; the next silence alerts again.
        store.record_heartbeat(heartbeat_at(now)).await.unwrap();
        let later = now + chrono::Duration::hours(2);
        assert!(store.record_downtime_alert(later).await.unwrap());
        assert_eq!(store.snapshot().await.downtime_alerts_sent.len(), 2);
    }

    #[test]
    fn derived_health_flags_stale_agent() {
        let now = Utc::now();
        let state = ZeptoClawState {
            local_last_seen: Some(now - chrono::Duration::minutes(61)),
            total_requests: 10,
            total_errors: 1,
            ..Default::default()
        };
        let health = derive_health(&state, now);
        assert!(health.local_agent_down);
        assert_eq!(health.seconds_since_heartbeat, Some(61 * 60));
        assert!((health.error_rate - 0.1).abs() < f64::EPSILON);

        let fresh = derive_health(&ZeptoClawState::default(), now);
        assert!(!fresh.local_agent_down);
        assert_eq!(fresh.seconds_since_heartbeat, None);
    }
}
