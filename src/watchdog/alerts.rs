//! Downtime alerts: deduplication and delivery.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Bound on one webhook delivery; alerts are sent inline on the relay path.
pub const ALERT_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether an alert is due for an episode that began at `episode_start`.
///
/// An alert already sent at or after the episode start means this episode
/// has been reported.
pub fn alert_due<T: PartialOrd>(sent: impl IntoIterator<Item = T>, episode_start: T) -> bool {
    !sent.into_iter().any(|at| at >= episode_start)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// The gateway failed a probe, relay or reported an incident.
    GatewayDown,
    /// No heartbeat within the local-agent timeout.
    LocalAgentDown,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GatewayDown => write!(f, "gateway_down"),
            Self::LocalAgentDown => write!(f, "local_agent_down"),
        }
    }
}

/// Persisted record of a delivered (or attempted) alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentAlert {
    pub gateway: String,
    pub kind: AlertKind,
    pub sent_at: DateTime<Utc>,
}

/// Payload handed to an [`AlertSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub gateway: String,
    pub kind: AlertKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Destination for downtime alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// POSTs each alert as JSON to a webhook.
pub struct WebhookAlertSink {
    url: String,
    http: reqwest::Client,
    timeout: Duration,
}

impl WebhookAlertSink {
    pub fn new(url: &str) -> Self {
        Self::with_timeout(url, ALERT_TIMEOUT)
    }

    pub fn with_timeout(url: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            http: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn send(&self, alert: &Alert) -> Result<()> {
        let resp = self
            .http
            .post(&self.url)
            .timeout(self.timeout)
            .json(alert)
            .send()
            .await
            .context("Failed to deliver alert")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Alert webhook failed ({}): {}", status, body);
        }
        Ok(())
    }
}

/// Writes alerts to the log only.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &Alert) -> Result<()> {
        warn!("ALERT [{}] {}: {}", alert.kind, alert.gateway, alert.message);
        Ok(())
    }
}

/// Webhook sink when a URL is configured, log-only otherwise.
pub fn sink_from_config(webhook_url: &str) -> Arc<dyn AlertSink> {
    if webhook_url.is_empty() {
        info!("No alert webhook configured, alerts go to the log");
        Arc::new(LogAlertSink)
    } else {
        Arc::new(WebhookAlertSink::new(webhook_url))
    }
}
