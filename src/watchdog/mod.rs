//! Edge watchdog: tracks gateway liveness, applies circuit-breaker backoff
//! and deduplicates downtime alerts.
//!
//! The watchdog never shares memory with a gateway. It learns about one
//! only through heartbeats, incident reports, its own probes and the
//! outcome of relayed requests.

pub mod alerts;
pub mod breaker;
pub mod monitor;
pub mod relay;
pub mod server;

pub use alerts::{Alert, AlertKind, AlertSink, SentAlert};
pub use breaker::{cooldown_ms, CircuitState, GatewayHealth};
pub use relay::{Relay, RelayRequest, RelayResponse};

use crate::config::{MonitoredGateway, WatchdogSection};
use crate::error::{GatewayError, GatewayResult};
use crate::state::store::truncate_front;
use crate::state::JsonStore;
use crate::types::{GatewayIncident, HeartbeatData};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Base of the doubling backoff.
pub const BACKOFF_BASE_MS: i64 = 60_000;
/// Backoff cap.
pub const BACKOFF_MAX_MS: i64 = 600_000;
/// Heartbeat silence after which the local agent counts as down.
pub const LOCAL_AGENT_TIMEOUT_MS: i64 = 3_600_000;
/// Per-attempt bound on a forwarded request.
pub const GATEWAY_TIMEOUT_MS: i64 = 30_000;
/// Attempts per forwarded request.
pub const MAX_RETRIES: u32 = 3;

pub const WATCHDOG_STATE_FILE: &str = "watchdog.json";

/// Everything the watchdog knows about one gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayRecord {
    #[serde(flatten)]
    pub health: GatewayHealth,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<HeartbeatData>,
    pub last_failure_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchdogState {
    pub gateways: BTreeMap<String, GatewayRecord>,
    pub downtime_alerts_sent: Vec<SentAlert>,
}

impl WatchdogState {
    fn alerts_for(&self, gateway: &str, kind: AlertKind) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let gateway = gateway.to_string();
        self.downtime_alerts_sent
            .iter()
            .filter(move |a| a.gateway == gateway && a.kind == kind)
            .map(|a| a.sent_at)
    }
}

/// Per-gateway view returned by `GET /watchdog/status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub id: String,
    pub url: String,
    pub state: CircuitState,
    pub healthy: bool,
    pub retry_after_ms: i64,
    pub local_agent_down: bool,
    #[serde(flatten)]
    pub record: GatewayRecord,
}

pub struct EdgeWatchdog {
    store: JsonStore<WatchdogState>,
    gateways: BTreeMap<String, String>,
    sink: Arc<dyn AlertSink>,
    relay: Relay,
    alert_retention: usize,
}

impl EdgeWatchdog {
    /// Lock and load the watchdog state under `state_dir`.
    pub fn open(
        state_dir: &Path,
        section: &WatchdogSection,
        alert_retention: usize,
        sink: Arc<dyn AlertSink>,
        relay: Relay,
    ) -> Result<Self> {
        let store = JsonStore::open(&state_dir.join(WATCHDOG_STATE_FILE))?;
        Ok(Self::new(store, &section.gateways, alert_retention, sink, relay))
    }

    pub fn new(
        store: JsonStore<WatchdogState>,
        gateways: &[MonitoredGateway],
        alert_retention: usize,
        sink: Arc<dyn AlertSink>,
        relay: Relay,
    ) -> Self {
        Self {
            store,
            gateways: gateways
                .iter()
                .map(|g| (g.id.clone(), g.url.clone()))
                .collect(),
            sink,
            relay,
            alert_retention,
        }
    }

    pub fn gateway_ids(&self) -> impl Iterator<Item = &str> {
        self.gateways.keys().map(String::as_str)
    }

    fn gateway_url(&self, gateway: &str) -> GatewayResult<&str> {
        self.gateways
            .get(gateway)
            .map(String::as_str)
            .ok_or_else(|| GatewayError::NotFound(format!("gateway '{gateway}'")))
    }

    pub async fn snapshot(&self) -> WatchdogState {
        self.store.snapshot().await
    }

    // -----------------------------------------------------------------------
    // Breaker transitions
    // -----------------------------------------------------------------------

    /// Count one failure for `gateway`; alerts on the first failure of an
    /// episode.
    pub async fn record_failure(
        &self,
        gateway: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> GatewayResult<GatewayHealth> {
        self.gateway_url(gateway)?;
        let retention = self.alert_retention;
        let (health, alert) = self
            .store
            .update(|state| {
                let record = state.gateways.entry(gateway.to_string()).or_default();
                let outcome = record.health.record_failure(now.timestamp_millis());
                record.last_failure_reason = Some(reason.to_string());
                let health = record.health.clone();

                warn!(
                    "Gateway {} failure #{} ({}), cooling until {}",
                    gateway, outcome.consecutive_failures, reason, outcome.cooldown_until
                );

                let alert = alerts::alert_due(
                    state
                        .alerts_for(gateway, AlertKind::GatewayDown)
                        .map(|t| t.timestamp_millis()),
                    outcome.episode_started_at,
                )
                .then(|| {
                    push_alert(state, gateway, AlertKind::GatewayDown, now, retention);
                    Alert {
                        gateway: gateway.to_string(),
                        kind: AlertKind::GatewayDown,
                        message: format!("gateway unhealthy: {reason}"),
                        at: now,
                    }
                });
                Ok((health, alert))
            })
            .await?;

        if let Some(alert) = alert {
            self.deliver(&alert).await;
        }
        Ok(health)
    }

    pub async fn record_success(
        &self,
        gateway: &str,
        latency_ms: f64,
        now: DateTime<Utc>,
    ) -> GatewayResult<GatewayHealth> {
        self.gateway_url(gateway)?;
        self.store
            .update(|state| {
                let record = state.gateways.entry(gateway.to_string()).or_default();
                let was_cooling = record.health.state() == CircuitState::Cooling;
                if record.health.record_success(now.timestamp_millis(), latency_ms) && was_cooling {
                    info!("Gateway {} recovered", gateway);
                }
                Ok(record.health.clone())
            })
            .await
    }

    /// Fail fast while `gateway` is cooling.
    pub async fn check_circuit(&self, gateway: &str, now: DateTime<Utc>) -> GatewayResult<()> {
        self.gateway_url(gateway)?;
        let state = self.store.snapshot().await;
        let Some(record) = state.gateways.get(gateway) else {
            return Ok(());
        };
        let now_ms = now.timestamp_millis();
        if record.health.is_healthy(now_ms) {
            Ok(())
        } else {
            Err(GatewayError::CircuitOpen {
                gateway: gateway.to_string(),
                retry_after_ms: record.health.retry_after_ms(now_ms),
            })
        }
    }

    // -----------------------------------------------------------------------
    // Wire protocol
    // -----------------------------------------------------------------------

    /// A heartbeat proves the gateway reachable; it counts as a success.
    pub async fn record_heartbeat(
        &self,
        gateway: &str,
        heartbeat: HeartbeatData,
        now: DateTime<Utc>,
    ) -> GatewayResult<GatewayHealth> {
        self.gateway_url(gateway)?;
        self.store
            .update(|state| {
                let record = state.gateways.entry(gateway.to_string()).or_default();
                record.last_heartbeat_at = Some(now);
                record.last_heartbeat = Some(heartbeat);
                record.health.record_success(now.timestamp_millis(), 0.0);
                Ok(record.health.clone())
            })
            .await
    }

    /// An incident report counts as one failure.
    pub async fn report_incident(
        &self,
        gateway: &str,
        incident: &GatewayIncident,
        now: DateTime<Utc>,
    ) -> GatewayResult<GatewayHealth> {
        let reason = match &incident.error {
            Some(error) => format!("incident {}: {}", incident.kind, error),
            None => format!("incident {}", incident.kind),
        };
        self.record_failure(gateway, &reason, now).await
    }

    // -----------------------------------------------------------------------
    // Relay and probes
    // -----------------------------------------------------------------------

    /// Circuit-gated forward. The retry sequence counts as one event.
    pub async fn relay(&self, gateway: &str, req: &RelayRequest) -> GatewayResult<RelayResponse> {
        let base_url = self.gateway_url(gateway)?.to_string();
        self.check_circuit(gateway, Utc::now()).await?;

        match self.relay.forward(&base_url, req).await {
            Ok(resp) => {
                self.record_success(gateway, resp.latency_ms, Utc::now()).await?;
                Ok(resp)
            }
            Err(failure) => {
                self.record_failure(gateway, &failure.reason, Utc::now()).await?;
                Err(GatewayError::Upstream(format!(
                    "gateway '{}' failed after {} attempts: {}",
                    gateway, failure.attempts, failure.reason
                )))
            }
        }
    }

    /// Probe every gateway that is not cooling.
    pub async fn probe_all(&self, now: DateTime<Utc>) {
        for (id, url) in &self.gateways {
            if self.check_circuit(id, now).await.is_err() {
                continue;
            }
            let outcome = match self.relay.probe(url).await {
                Ok(latency) => self.record_success(id, latency, Utc::now()).await,
                Err(reason) => self.record_failure(id, &reason, Utc::now()).await,
            };
            if let Err(err) = outcome {
                error!("Failed to record probe of {}: {}", id, err);
            }
        }
    }

    /// Raise one `local_agent_down` alert per silence episode. Returns the
    /// alerts raised.
    pub async fn check_local_agents(&self, now: DateTime<Utc>) -> GatewayResult<Vec<Alert>> {
        let retention = self.alert_retention;
        let raised = self
            .store
            .update(|state| {
                let mut raised = Vec::new();
                let silent: Vec<(String, DateTime<Utc>)> = state
                    .gateways
                    .iter()
                    .filter_map(|(id, record)| record.last_heartbeat_at.map(|t| (id.clone(), t)))
                    .filter(|(_, last)| crate::state::store::local_agent_down(*last, now))
                    .collect();

                for (id, last) in silent {
                    let episode_start =
                        last + chrono::Duration::milliseconds(LOCAL_AGENT_TIMEOUT_MS);
                    if alerts::alert_due(state.alerts_for(&id, AlertKind::LocalAgentDown), episode_start) {
                        push_alert(state, &id, AlertKind::LocalAgentDown, now, retention);
                        raised.push(Alert {
                            message: format!("no heartbeat since {}", last.to_rfc3339()),
                            gateway: id,
                            kind: AlertKind::LocalAgentDown,
                            at: now,
                        });
                    }
                }
                Ok(raised)
            })
            .await?;

        for alert in &raised {
            self.deliver(alert).await;
        }
        Ok(raised)
    }

    pub async fn status(&self, now: DateTime<Utc>) -> Vec<GatewayStatus> {
        let state = self.store.snapshot().await;
        let now_ms = now.timestamp_millis();
        self.gateways
            .iter()
            .map(|(id, url)| {
                let record = state.gateways.get(id).cloned().unwrap_or_default();
                GatewayStatus {
                    id: id.clone(),
                    url: url.clone(),
                    state: record.health.state(),
                    healthy: record.health.is_healthy(now_ms),
                    retry_after_ms: record.health.retry_after_ms(now_ms),
                    local_agent_down: record
                        .last_heartbeat_at
                        .map(|t| crate::state::store::local_agent_down(t, now))
                        .unwrap_or(false),
                    record,
                }
            })
            .collect()
    }

    /// Delivery failure is logged only; the alert stays recorded as sent.
    async fn deliver(&self, alert: &Alert) {
        if let Err(err) = self.sink.send(alert).await {
            error!("Alert delivery for {} failed: {:#}", alert.gateway, err);
        }
    }
}

fn push_alert(
    state: &mut WatchdogState,
    gateway: &str,
    kind: AlertKind,
    now: DateTime<Utc>,
    retention: usize,
) {
    state.downtime_alerts_sent.push(SentAlert {
        gateway: gateway.to_string(),
        kind,
        sent_at: now,
    });
    truncate_front(&mut state.downtime_alerts_sent, retention);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IncidentType;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        alerts: Mutex<Vec<Alert>>,
        fail: bool,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
            self.alerts.lock().unwrap().push(alert.clone());
            if self.fail {
                anyhow::bail!("webhook unreachable");
            }
            Ok(())
        }
    }

    fn watchdog(dir: &Path, sink: Arc<RecordingSink>) -> EdgeWatchdog {
        let store = JsonStore::open(&dir.join(WATCHDOG_STATE_FILE)).unwrap();
        let gateways = vec![MonitoredGateway {
            id: "home".into(),
            url: "http://127.0.0.1:9".into(),
        }];
        EdgeWatchdog::new(store, &gateways, 200, sink, Relay::default())
    }

    #[tokio::test]
    async fn failures_five_seconds_apart_alert_once() {
        let temp = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let wd = watchdog(temp.path(), sink.clone());

        let t0 = Utc::now();
        wd.record_failure("home", "timeout", t0).await.unwrap();
        wd.record_failure("home", "timeout", t0 + Duration::seconds(5))
            .await
            .unwrap();

        assert_eq!(sink.alerts.lock().unwrap().len(), 1);
        assert_eq!(wd.snapshot().await.downtime_alerts_sent.len(), 1);
    }

    #[tokio::test]
    async fn breaker_scenario_end_to_end() {
        let temp = TempDir::new().unwrap();
        let wd = watchdog(temp.path(), Arc::new(RecordingSink::default()));

        let t0 = Utc::now();
        let t2 = t0 + Duration::seconds(2);
        wd.record_failure("home", "5xx", t0).await.unwrap();
        wd.record_failure("home", "5xx", t0 + Duration::seconds(1))
            .await
            .unwrap();
        let health = wd.record_failure("home", "5xx", t2).await.unwrap();
        assert_eq!(health.consecutive_failures, 3);
        assert_eq!(health.cooldown_until, t2.timestamp_millis() + 240_000);

        let early = t2 + Duration::milliseconds(100_000);
        match wd.check_circuit("home", early).await {
            Err(GatewayError::CircuitOpen { retry_after_ms, .. }) => {
                assert_eq!(retry_after_ms, 140_000)
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }

        let later = t2 + Duration::milliseconds(300_000);
        assert!(wd.check_circuit("home", later).await.is_ok());
        let health = wd.record_success("home", 5.0, later).await.unwrap();
        assert_eq!(health.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn new_episode_alerts_again() {
        let temp = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let wd = watchdog(temp.path(), sink.clone());

        let t0 = Utc::now();
        wd.record_failure("home", "down", t0).await.unwrap();
        let recovered = t0 + Duration::minutes(2);
        wd.record_success("home", 3.0, recovered).await.unwrap();
        wd.record_failure("home", "down again", recovered + Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(sink.alerts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_delivery_is_still_recorded() {
        let temp = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let wd = watchdog(temp.path(), sink.clone());

        let t0 = Utc::now();
        wd.record_failure("home", "down", t0).await.unwrap();
        wd.record_failure("home", "down", t0 + Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(sink.alerts.lock().unwrap().len(), 1);
        assert_eq!(wd.snapshot().await.downtime_alerts_sent.len(), 1);
    }

    #[tokio::test]
    async fn incident_counts_as_failure() {
        let temp = TempDir::new().unwrap();
        let wd = watchdog(temp.path(), Arc::new(RecordingSink::default()));
        let incident = GatewayIncident {
            timestamp: Utc::now(),
            kind: IncidentType::Crash,
            session_id: None,
            stuck_duration_seconds: None,
            hostname: None,
            error: Some("segfault".into()),
            reported_at: Utc::now(),
        };
        let health = wd.report_incident("home", &incident, Utc::now()).await.unwrap();
        assert_eq!(health.consecutive_failures, 1);
        let state = wd.snapshot().await;
        assert_eq!(
            state.gateways["home"].last_failure_reason.as_deref(),
            Some("incident crash: segfault")
        );
    }

    #[tokio::test]
    async fn unknown_gateway_is_not_found() {
        let temp = TempDir::new().unwrap();
        let wd = watchdog(temp.path(), Arc::new(RecordingSink::default()));
        assert!(matches!(
            wd.record_failure("nope", "x", Utc::now()).await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn silent_local_agent_alerts_once_per_episode() {
        let temp = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let wd = watchdog(temp.path(), sink.clone());

        let seen = Utc::now() - Duration::hours(2);
        wd.record_heartbeat("home", heartbeat(seen), seen).await.unwrap();

        let now = Utc::now();
        assert_eq!(wd.check_local_agents(now).await.unwrap().len(), 1);
        assert!(wd
            .check_local_agents(now + Duration::minutes(1))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(sink.alerts.lock().unwrap()[0].kind, AlertKind::LocalAgentDown);

        let status = wd.status(now).await;
        assert!(status[0].local_agent_down);
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let temp = TempDir::new().unwrap();
        let t0 = Utc::now();
        {
            let wd = watchdog(temp.path(), Arc::new(RecordingSink::default()));
            wd.record_failure("home", "down", t0).await.unwrap();
        }
        let wd = watchdog(temp.path(), Arc::new(RecordingSink::default()));
        assert!(wd.check_circuit("home", t0 + Duration::seconds(10)).await.is_err());
    }

    fn heartbeat(at: DateTime<Utc>) -> HeartbeatData {
        HeartbeatData {
            timestamp: at,
            hostname: None,
            process_id: None,
            http_status: None,
            uptime_seconds: None,
            version: None,
            memory_mb: None,
        }
    }
}
