use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Exponential reconnect delay: `base * 2^min(attempt, cap_exponent)`,
/// clamped to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub cap_exponent: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            cap_exponent: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(self.cap_exponent);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// A reconnect that has been scheduled but not yet fired.
#[derive(Debug, Clone)]
pub struct ScheduledReconnect {
    pub delay: Duration,
    pub attempt: u32,
    pub token: CancellationToken,
}

/// Tracks the consecutive-failure counter and the single outstanding
/// reconnect timer. Scheduling a new timer cancels the previous one.
#[derive(Debug)]
pub struct ReconnectScheduler {
    policy: BackoffPolicy,
    attempt: u32,
    pending: Option<CancellationToken>,
}

impl ReconnectScheduler {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            pending: None,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Count one more failed cycle and arm the timer for it. Attempt `n`
    /// waits `base * 2^n`, so the first retry already waits twice `base`.
    pub fn schedule(&mut self) -> ScheduledReconnect {
        self.cancel();
        self.attempt = self.attempt.saturating_add(1);
        let attempt = self.attempt;
        let delay = self.policy.delay_for(attempt);

        let token = CancellationToken::new();
        self.pending = Some(token.clone());
        debug!("Reconnect attempt {} scheduled in {:?}", attempt, delay);
        ScheduledReconnect { delay, attempt, token }
    }

    /// The armed timer elapsed; it no longer counts as outstanding.
    pub fn fired(&mut self) {
        self.pending = None;
    }

    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// A transport opened: the next failure counts as attempt 1 again.
    pub fn reset(&mut self) {
        self.cancel();
        self.attempt = 0;
    }
}
