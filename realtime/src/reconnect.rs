//! Exponential backoff and the connection status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Connection status of a manager, as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    #[default]
    Disconnected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Reconnecting => write!(f, "reconnecting"),
            ConnectionStatus::Error => write!(f, "error"),
        }
    }
}

/// Exponential backoff policy for channel reconnects.
///
/// Delays grow as `initial_delay * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// Calculate the delay before reconnect number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_f64.powi(attempt.min(63) as i32);
        let delay = self.initial_delay.as_millis() as f64 * factor;
        let capped = delay.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// What to do after a channel failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Reopen the channel after `delay`; `attempt` is 1 for the first retry.
    Retry { attempt: u32, delay: Duration },
    /// Every attempt has been used; the manager is now in `Error`.
    GiveUp { attempts: u32 },
}

/// Tracks reconnect attempts and drives [`ConnectionStatus`] transitions.
///
/// One controller per manager. `attempts` resets only on a successful
/// subscription; `total_reconnects` accumulates for the manager's lifetime.
#[derive(Debug, Clone)]
pub struct ReconnectController {
    policy: BackoffPolicy,
    attempts: u32,
    total_reconnects: u64,
    status: ConnectionStatus,
    connected_at: Option<DateTime<Utc>>,
}

impl ReconnectController {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            total_reconnects: 0,
            status: ConnectionStatus::Disconnected,
            connected_at: None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn total_reconnects(&self) -> u64 {
        self.total_reconnects
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    pub fn on_subscribed(&mut self, now: DateTime<Utc>) {
        self.attempts = 0;
        self.status = ConnectionStatus::Connected;
        self.connected_at = Some(now);
    }

    pub fn on_failure(&mut self) -> ReconnectDecision {
        if self.attempts >= self.policy.max_attempts {
            self.status = ConnectionStatus::Error;
            self.connected_at = None;
            return ReconnectDecision::GiveUp {
                attempts: self.attempts,
            };
        }

        let delay = self.policy.delay(self.attempts);
        self.attempts += 1;
        self.total_reconnects += 1;
        self.status = ConnectionStatus::Reconnecting;
        self.connected_at = None;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay,
        }
    }

    /// The last channel went away. A terminal `Error` is kept.
    pub fn on_all_closed(&mut self) {
        if self.status != ConnectionStatus::Error {
            self.status = ConnectionStatus::Disconnected;
        }
        self.connected_at = None;
    }

    /// Explicit teardown: back to `Disconnected` with a fresh attempt budget.
    pub fn on_disconnect(&mut self) {
        self.attempts = 0;
        self.status = ConnectionStatus::Disconnected;
        self.connected_at = None;
    }

    /// Time since the last successful subscription, zero when not connected.
    pub fn uptime(&self, now: DateTime<Utc>) -> Duration {
        self.connected_at
            .and_then(|since| (now - since).to_std().ok())
            .unwrap_or_default()
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay() {
        let policy = BackoffPolicy::default();

        let delays: Vec<u128> = (0..7).map(|n| policy.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.delay(40), policy.max_delay);
        assert_eq!(policy.delay(u32::MAX), policy.max_delay);
    }

    #[test]
    fn failures_count_up_and_give_up() {
        let mut controller = ReconnectController::new(BackoffPolicy {
            max_attempts: 3,
            ..BackoffPolicy::default()
        });

        for expected in 1..=3 {
            match controller.on_failure() {
                ReconnectDecision::Retry { attempt, .. } => assert_eq!(attempt, expected),
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(controller.status(), ConnectionStatus::Reconnecting);
        }

        assert_eq!(
            controller.on_failure(),
            ReconnectDecision::GiveUp { attempts: 3 }
        );
        assert_eq!(controller.status(), ConnectionStatus::Error);
        assert_eq!(controller.total_reconnects(), 3);
    }

    #[test]
    fn subscribe_resets_attempts_but_not_total() {
        let mut controller = ReconnectController::new(BackoffPolicy::default());
        let now = Utc::now();

        controller.on_failure();
        controller.on_failure();
        controller.on_subscribed(now);

        assert_eq!(controller.attempts(), 0);
        assert_eq!(controller.total_reconnects(), 2);
        assert_eq!(controller.status(), ConnectionStatus::Connected);
        assert_eq!(
            controller.uptime(now + chrono::Duration::seconds(5)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn all_closed_keeps_terminal_error() {
        let mut controller = ReconnectController::new(BackoffPolicy {
            max_attempts: 0,
            ..BackoffPolicy::default()
        });

        controller.on_failure();
        controller.on_all_closed();
        assert_eq!(controller.status(), ConnectionStatus::Error);

        controller.on_disconnect();
        assert_eq!(controller.status(), ConnectionStatus::Disconnected);
    }
}
