//! Retry ceiling and backoff for tasks left unacknowledged.
//!
//! Redelivery itself belongs to the queue; this only decides whether a
//! redelivered task may be attempted yet and when to stop trying. State is
//! per engine and in memory, so a restart starts every count from zero.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::RetrySettings;
use crate::task::TaskId;

/// Floor for how long failure state outlives its last failure.
const MIN_FORGET_AFTER: Duration = Duration::from_secs(600);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure: `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// How long after its last failure a task that never came back is forgotten.
    pub fn forget_after(&self) -> Duration {
        self.max_backoff
            .checked_mul(self.max_attempts)
            .unwrap_or(Duration::MAX)
            .max(MIN_FORGET_AFTER)
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            base_backoff: Duration::from_millis(s.base_backoff_ms),
            max_backoff: Duration::from_millis(s.max_backoff_ms),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Leave pending; not eligible again before `after` has passed.
    Retry { attempt: u32, after: Duration },
    /// Ceiling reached.
    GiveUp { attempts: u32 },
}

struct RetryState {
    attempts: u32,
    not_before: Instant,
    last_failure: Instant,
}

pub struct RetryTracker {
    policy: RetryPolicy,
    state: HashMap<TaskId, RetryState>,
}

impl RetryTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: HashMap::new(),
        }
    }

    /// False while the task is still inside its backoff window.
    pub fn ready(&self, id: &TaskId) -> bool {
        self.state
            .get(id)
            .map_or(true, |s| Instant::now() >= s.not_before)
    }

    pub fn attempts(&self, id: &TaskId) -> u32 {
        self.state.get(id).map_or(0, |s| s.attempts)
    }

    pub fn record_failure(&mut self, id: &TaskId) -> RetryDecision {
        let now = Instant::now();
        let entry = self.state.entry(id.clone()).or_insert(RetryState {
            attempts: 0,
            not_before: now,
            last_failure: now,
        });
        entry.attempts += 1;
        entry.last_failure = now;
        if entry.attempts >= self.policy.max_attempts {
            return RetryDecision::GiveUp {
                attempts: entry.attempts,
            };
        }
        let after = self.policy.backoff(entry.attempts);
        entry.not_before = now + after;
        RetryDecision::Retry {
            attempt: entry.attempts,
            after,
        }
    }

    pub fn clear(&mut self, id: &TaskId) {
        self.state.remove(id);
    }

    pub fn tracked(&self) -> usize {
        self.state.len()
    }

    /// Drop state of tasks the queue stopped redelivering (trimmed, or
    /// claimed by another consumer). Returns how many were dropped.
    pub fn prune(&mut self, now: Instant) -> usize {
        let horizon = self.policy.forget_after();
        let before = self.state.len();
        self.state
            .retain(|_, s| now.saturating_duration_since(s.last_failure) < horizon);
        before - self.state.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(350));
        assert_eq!(p.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_gives_up_at_ceiling() {
        let mut t = RetryTracker::new(policy());
        let id = TaskId::new("1-0");
        assert!(t.ready(&id));
        assert!(matches!(t.record_failure(&id), RetryDecision::Retry { attempt: 1, .. }));
        assert!(!t.ready(&id));
        t.record_failure(&id);
        t.record_failure(&id);
        assert_eq!(t.record_failure(&id), RetryDecision::GiveUp { attempts: 4 });
        t.clear(&id);
        assert_eq!(t.attempts(&id), 0);
        assert_eq!(t.tracked(), 0);
    }

    #[test]
    fn test_ready_after_backoff() {
        let mut t = RetryTracker::new(RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        });
        let id = TaskId::new("2-0");
        t.record_failure(&id);
        assert!(t.ready(&id));
        assert_eq!(t.attempts(&id), 1);
    }

    #[test]
    fn test_forget_after_has_floor() {
        assert_eq!(policy().forget_after(), Duration::from_secs(600));
        let long = RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        };
        assert_eq!(long.forget_after(), Duration::from_secs(1500));
    }

    #[test]
    fn test_prune_drops_abandoned_state_only() {
        let mut t = RetryTracker::new(policy());
        let stale = TaskId::new("1-0");
        t.record_failure(&stale);
        t.record_failure(&TaskId::new("2-0"));
        let now = Instant::now();
        assert_eq!(t.prune(now), 0);
        assert_eq!(t.tracked(), 2);

        let later = now + policy().forget_after() + Duration::from_secs(1);
        assert_eq!(t.prune(later), 2);
        assert_eq!(t.attempts(&stale), 0);
        assert_eq!(t.tracked(), 0);
    }

    #[test]
    fn test_settings_conversion_floors_attempts() {
        let s = RetrySettings {
            max_attempts: 0,
            ..RetrySettings::default()
        };
        assert_eq!(RetryPolicy::from(&s).max_attempts, 1);
    }
}
