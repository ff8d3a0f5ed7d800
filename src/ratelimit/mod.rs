//! Fixed-window rate limiting per autonomous action class.
//!
//! Browse, search and post are accounted independently. All windows sit
//! behind one mutex so two concurrent callers can never both take the last
//! slot of a window.

use crate::config::{AutonomousSection, RateLimit};
use crate::types::{ActionClass, RateLimiterSnapshot, WindowState};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::debug;

/// Outcome of an acquisition attempt. Denial is normal control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    Denied { retry_after: Duration },
}

impl Acquire {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }

    /// Whole seconds until the window reopens, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            Self::Granted => 0,
            Self::Denied { retry_after } => {
                let ms = retry_after.num_milliseconds().max(0) as u64;
                ms.div_ceil(1000)
            }
        }
    }
}

pub struct RateLimiter {
    limits: BTreeMap<ActionClass, RateLimit>,
    windows: Mutex<RateLimiterSnapshot>,
}

impl RateLimiter {
    pub fn new(limits: BTreeMap<ActionClass, RateLimit>) -> Self {
        Self {
            limits,
            windows: Mutex::new(RateLimiterSnapshot::new()),
        }
    }

    pub fn from_config(section: &AutonomousSection) -> Self {
        let limits = ActionClass::ALL
            .into_iter()
            .map(|class| (class, section.limit_for(class)))
            .collect();
        Self::new(limits)
    }

    /// Seed windows from persisted progress. Unknown classes are ignored.
    pub fn restore(&self, snapshot: &RateLimiterSnapshot) {
        let mut windows = self.lock();
        for (class, window) in snapshot {
            if self.limits.contains_key(class) {
                windows.insert(*class, *window);
            }
        }
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        self.lock().clone()
    }

    pub fn try_acquire(&self, class: ActionClass) -> Acquire {
        self.try_acquire_at(class, Utc::now())
    }

    /// Take one slot in `class`'s window at `now`, if one is free.
    pub fn try_acquire_at(&self, class: ActionClass, now: DateTime<Utc>) -> Acquire {
        let Some(limit) = self.limits.get(&class).copied() else {
            return Acquire::Granted;
        };
        let mut windows = self.lock();
        let window = current_window(&mut windows, class, limit, now);

        if window.count < limit.max_actions {
            window.count += 1;
            debug!("Rate limit {}: {}/{}", class, window.count, limit.max_actions);
            Acquire::Granted
        } else {
            let reopens = window.started_at + Duration::seconds(limit.window_secs as i64);
            Acquire::Denied {
                retry_after: reopens - now,
            }
        }
    }

    /// Would `try_acquire_at` grant right now? Does not consume a slot.
    pub fn check_at(&self, class: ActionClass, now: DateTime<Utc>) -> Acquire {
        let Some(limit) = self.limits.get(&class).copied() else {
            return Acquire::Granted;
        };
        let windows = self.lock();
        match windows.get(&class) {
            Some(window) => {
                let reopens = window.started_at + Duration::seconds(limit.window_secs as i64);
                if now >= reopens || window.count < limit.max_actions {
                    Acquire::Granted
                } else {
                    Acquire::Denied {
                        retry_after: reopens - now,
                    }
                }
            }
            None => Acquire::Granted,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RateLimiterSnapshot> {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The live window for `class`, starting a fresh one if the last expired.
fn current_window(
    windows: &mut RateLimiterSnapshot,
    class: ActionClass,
    limit: RateLimit,
    now: DateTime<Utc>,
) -> &mut WindowState {
    let window = windows.entry(class).or_insert(WindowState {
        started_at: now,
        count: 0,
    });
    if now >= window.started_at + Duration::seconds(limit.window_secs as i64) {
        *window = WindowState {
            started_at: now,
            count: 0,
        };
    }
    window
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(max_actions: u32, window_secs: u64) -> RateLimiter {
        let limit = RateLimit {
            max_actions,
            window_secs,
        };
        RateLimiter::new(ActionClass::ALL.into_iter().map(|c| (c, limit)).collect())
    }

    #[test]
    fn denies_after_k_actions_and_reopens_after_window() {
        let limiter = limiter(3, 60);
        let t0 = Utc::now();
        for i in 0..3 {
            assert!(
                limiter
                    .try_acquire_at(ActionClass::Browse, t0 + Duration::seconds(i))
                    .is_granted(),
                "attempt {i} should be granted"
            );
        }

        let denied = limiter.try_acquire_at(ActionClass::Browse, t0 + Duration::seconds(10));
        assert_eq!(
            denied,
            Acquire::Denied {
                retry_after: Duration::seconds(50)
            }
        );
        assert_eq!(denied.retry_after_secs(), 50);

        assert!(limiter
            .try_acquire_at(ActionClass::Browse, t0 + Duration::seconds(60))
            .is_granted());
    }

    #[test]
    fn classes_are_independent() {
        let limiter = limiter(1, 60);
        let now = Utc::now();
        assert!(limiter.try_acquire_at(ActionClass::Post, now).is_granted());
        assert!(!limiter.try_acquire_at(ActionClass::Post, now).is_granted());
        assert!(limiter.try_acquire_at(ActionClass::Search, now).is_granted());
        assert!(limiter.try_acquire_at(ActionClass::Browse, now).is_granted());
    }

    #[test]
    fn check_does_not_consume() {
        let limiter = limiter(1, 60);
        let now = Utc::now();
        assert!(limiter.check_at(ActionClass::Post, now).is_granted());
        assert!(limiter.check_at(ActionClass::Post, now).is_granted());
        assert!(limiter.try_acquire_at(ActionClass::Post, now).is_granted());
        assert!(!limiter.check_at(ActionClass::Post, now).is_granted());
    }

    #[test]
    fn restore_carries_window_across_restart() {
        let first = limiter(1, 600);
        let now = Utc::now();
        assert!(first.try_acquire_at(ActionClass::Post, now).is_granted());

        let second = limiter(1, 600);
        second.restore(&first.snapshot());
        assert!(!second
            .try_acquire_at(ActionClass::Post, now + Duration::seconds(5))
            .is_granted());
    }

    #[test]
    fn concurrent_acquires_never_exceed_limit() {
        let limiter = Arc::new(limiter(5, 3600));
        let now = Utc::now();
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || limiter.try_acquire_at(ActionClass::Search, now))
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Acquire::is_granted)
            .count();
        assert_eq!(granted, 5);
    }
}
