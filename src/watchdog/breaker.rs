//! Per-gateway circuit breaker with doubling backoff.
//!
//! All timestamps are epoch milliseconds; `0` means "never".

use super::{BACKOFF_BASE_MS, BACKOFF_MAX_MS};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Weight of the newest sample in the latency moving average.
const LATENCY_SMOOTHING: f64 = 0.2;

/// Cooldown after `consecutive_failures` failures in a row.
///
/// `min(BASE * 2^(n-1), MAX)`; zero failures means no cooldown.
pub fn cooldown_ms(consecutive_failures: u32) -> i64 {
    if consecutive_failures == 0 {
        return 0;
    }
    // 2^10 * BASE is already past the cap; clamp the shift to avoid overflow.
    let exponent = (consecutive_failures - 1).min(16);
    BACKOFF_BASE_MS
        .saturating_mul(1i64 << exponent)
        .min(BACKOFF_MAX_MS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Nothing observed yet.
    Unknown,
    Healthy,
    /// At least one failure since the last success.
    Cooling,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Healthy => write!(f, "healthy"),
            Self::Cooling => write!(f, "cooling"),
        }
    }
}

/// Health bookkeeping for one monitored gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayHealth {
    pub last_failure_at: i64,
    pub consecutive_failures: u32,
    pub cooldown_until: i64,
    pub last_success_at: i64,
    pub avg_latency_ms: f64,
    pub request_count: u64,
    /// First failure of the current failure streak, for alert dedup.
    pub episode_started_at: Option<i64>,
}

/// What a recorded failure did to the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub consecutive_failures: u32,
    pub cooldown_until: i64,
    pub episode_started_at: i64,
    pub new_episode: bool,
}

impl GatewayHealth {
    pub fn is_healthy(&self, now_ms: i64) -> bool {
        now_ms >= self.cooldown_until
    }

    pub fn state(&self) -> CircuitState {
        if self.consecutive_failures > 0 {
            CircuitState::Cooling
        } else if self.request_count == 0 && self.last_success_at == 0 {
            CircuitState::Unknown
        } else {
            CircuitState::Healthy
        }
    }

    /// Milliseconds left before traffic is allowed through again.
    pub fn retry_after_ms(&self, now_ms: i64) -> i64 {
        (self.cooldown_until - now_ms).max(0)
    }

    /// Count one failure and push `cooldown_until` out accordingly.
    ///
    /// Failures reported while already cooling still count, so a burst of
    /// failures escalates the backoff.
    pub fn record_failure(&mut self, now_ms: i64) -> FailureOutcome {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = now_ms;
        self.cooldown_until = now_ms + cooldown_ms(self.consecutive_failures);
        self.request_count += 1;

        let new_episode = self.episode_started_at.is_none();
        let episode_started_at = *self.episode_started_at.get_or_insert(now_ms);

        FailureOutcome {
            consecutive_failures: self.consecutive_failures,
            cooldown_until: self.cooldown_until,
            episode_started_at,
            new_episode,
        }
    }

    /// Record a success. Ignored while the cooldown is still running;
    /// returns whether it was applied.
    pub fn record_success(&mut self, now_ms: i64, latency_ms: f64) -> bool {
        if !self.is_healthy(now_ms) {
            return false;
        }
        let first_success = self.last_success_at == 0;
        self.consecutive_failures = 0;
        self.last_success_at = now_ms;
        self.episode_started_at = None;
        self.request_count += 1;

        self.avg_latency_ms = if first_success {
            latency_ms
        } else {
            self.avg_latency_ms * (1.0 - LATENCY_SMOOTHING) + latency_ms * LATENCY_SMOOTHING
        };
        true
    }
}
