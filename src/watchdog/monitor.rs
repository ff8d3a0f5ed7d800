//! Background prober for the edge watchdog.

use crate::watchdog::EdgeWatchdog;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Probe every monitored gateway each `interval` and check for silent
/// local agents, until `cancel` fires.
pub async fn run_prober(
    watchdog: Arc<EdgeWatchdog>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    info!("Watchdog prober started (every {}s)", interval.as_secs());

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let now = Utc::now();
                watchdog.probe_all(now).await;
                match watchdog.check_local_agents(now).await {
                    Ok(raised) if !raised.is_empty() => {
                        info!("Raised {} local-agent alert(s)", raised.len());
                    }
                    Ok(_) => {}
                    Err(e) => error!("Local agent check failed: {e}"),
                }
            }
            _ = cancel.cancelled() => {
                info!("Watchdog prober shutting down");
                return;
            }
        }
    }
}
