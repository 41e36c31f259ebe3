// ── Retry/backoff policy ──
//
// One policy type shared by the poller (hardware errors) and the remote
// cache connection (reconnects). The delay doubles every `escalate_every`
// consecutive failures and is capped at `max`.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub initial: Duration,
    /// Upper bound on the delay.
    pub max: Duration,
    /// Multiplier applied at each escalation step.
    pub factor: f64,
    /// Consecutive failures per escalation step.
    pub escalate_every: u32,
}

impl BackoffPolicy {
    /// Poller policy: 10 s, doubling every 5 failures, at most 10 min.
    pub fn poller() -> Self {
        Self {
            initial: Duration::from_secs(10),
            max: Duration::from_secs(600),
            factor: 2.0,
            escalate_every: 5,
        }
    }

    /// Reconnect policy: 1 s, doubling on every failure, at most 30 s.
    pub fn reconnect() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
            escalate_every: 1,
        }
    }

    /// Delay after `failures` consecutive failures (`0` means no delay).
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let steps = (failures - 1) / self.escalate_every.max(1);
        let exponent = i32::try_from(steps).unwrap_or(i32::MAX);
        let secs = self.initial.as_secs_f64() * self.factor.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::poller()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poller_policy_escalates_every_five_failures() {
        let policy = BackoffPolicy::poller();
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_secs(10));
        assert_eq!(policy.delay(5), Duration::from_secs(10));
        assert_eq!(policy.delay(6), Duration::from_secs(20));
        assert_eq!(policy.delay(11), Duration::from_secs(40));
        assert_eq!(policy.delay(1000), Duration::from_secs(600));
    }

    #[test]
    fn reconnect_policy_caps() {
        let policy = BackoffPolicy::reconnect();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
    }
}
