//! Built-in heartbeat task implementations.

use crate::server::AppState;
use crate::types::HeartbeatData;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

/// Bound on one heartbeat push to the watchdog.
const PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Execute a named heartbeat task.
pub async fn execute_task(
    task_name: &str,
    app: &AppState,
    http: &reqwest::Client,
) -> Result<String> {
    match task_name {
        "push_heartbeat" => task_push_heartbeat(app, http).await,
        "evict_idle_sessions" => task_evict_idle_sessions(app).await,
        "check_local_agent" => task_check_local_agent(app).await,
        "autonomous_run" => task_autonomous_run(app).await,
        _ => bail!("Unknown heartbeat task: {}", task_name),
    }
}

/// Report this gateway's liveness to the edge watchdog.
async fn task_push_heartbeat(app: &AppState, http: &reqwest::Client) -> Result<String> {
    let (watchdog_url, gateway_id) = {
        let config = app.config.read().await;
        (
            config.heartbeat.watchdog_url.trim_end_matches('/').to_string(),
            config.heartbeat.gateway_id.clone(),
        )
    };
    if watchdog_url.is_empty() {
        return Ok("Skipped: no watchdog configured".into());
    }

    let heartbeat = local_heartbeat(app);
    let resp = http
        .post(format!("{watchdog_url}/heartbeat/{gateway_id}"))
        .timeout(PUSH_TIMEOUT)
        .json(&heartbeat)
        .send()
        .await
        .context("Heartbeat push failed")?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("Heartbeat push failed ({}): {}", status, body);
    }
    Ok(format!("pushed to {watchdog_url} as {gateway_id}"))
}

async fn task_evict_idle_sessions(app: &AppState) -> Result<String> {
    let timeout_secs = app.config.read().await.sessions.idle_timeout_secs;
    let timeout = chrono::Duration::seconds(i64::try_from(timeout_secs).unwrap_or(i64::MAX));
    let evicted = app.sessions.evict_idle(Utc::now(), timeout).await?;
    if !evicted.is_empty() {
        app.publish("sessions.evicted", json!({ "ids": evicted }));
    }
    Ok(format!("{} evicted", evicted.len()))
}

/// Raise a local-agent-down event once per silence episode.
async fn task_check_local_agent(app: &AppState) -> Result<String> {
    if !app.state.record_downtime_alert(Utc::now()).await? {
        return Ok("ok".into());
    }
    let health = app.state.derived_health(Utc::now()).await;
    warn!("Local agent down: no heartbeat for {:?}s", health.seconds_since_heartbeat);
    app.publish("local_agent.down", json!(health));
    Ok("local agent down".into())
}

async fn task_autonomous_run(app: &AppState) -> Result<String> {
    if !app.config.read().await.autonomous.enabled {
        return Ok("Skipped: autonomous mode disabled".into());
    }
    let report = app.autonomous.run().await?;
    info!(
        "Autonomous run: {}{}",
        report.action,
        if report.deferred { " (deferred)" } else { "" }
    );
    app.publish("autonomous.action", json!(report));
    Ok(report.action)
}

/// Liveness figures for this process.
fn local_heartbeat(app: &AppState) -> HeartbeatData {
    let now = Utc::now();
    HeartbeatData {
        timestamp: now,
        hostname: hostname(),
        process_id: Some(std::process::id()),
        http_status: Some(200),
        uptime_seconds: u64::try_from((now - app.started_at).num_seconds()).ok(),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
        memory_mb: resident_memory_mb(),
    }
}

fn hostname() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

/// Resident set size from /proc; `None` off Linux.
fn resident_memory_mb() -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss_kb(&status).map(|kb| kb as f64 / 1024.0)
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_rss_is_parsed_from_proc_status() {
        let status = "Name:\tzeptoclaw\nVmPeak:\t  90000 kB\nVmRSS:\t   32768 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss_kb(status), Some(32768));
        assert_eq!(parse_vm_rss_kb("Name:\tx\n"), None);
    }
}
