//! Message counters, latency samples and the derived connection quality.

use crate::reconnect::ConnectionStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

/// Latency samples kept for the rolling average.
pub const LATENCY_SAMPLES: usize = 100;

/// Trailing window used for `messages_per_minute`, in seconds.
pub const MESSAGE_WINDOW_SECS: i64 = 60;

/// Snapshot returned by `RealtimeManager::get_metrics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeMetrics {
    pub status: ConnectionStatus,
    pub active_subscriptions: usize,
    pub channel_count: usize,
    pub total_messages: u64,
    pub messages_per_minute: usize,
    pub reconnect_count: u64,
    pub average_latency_ms: f64,
    pub uptime_ms: u64,
}

/// Coarse connection quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl ConnectionQuality {
    pub fn from_metrics(metrics: &RealtimeMetrics) -> Self {
        if metrics.status != ConnectionStatus::Connected {
            return ConnectionQuality::Poor;
        }

        let latency = metrics.average_latency_ms;
        let reconnects = metrics.reconnect_count;
        if latency < 100.0 && reconnects == 0 {
            ConnectionQuality::Excellent
        } else if latency < 300.0 && reconnects <= 2 {
            ConnectionQuality::Good
        } else if latency < 1000.0 && reconnects <= 5 {
            ConnectionQuality::Fair
        } else {
            ConnectionQuality::Poor
        }
    }
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionQuality::Excellent => write!(f, "excellent"),
            ConnectionQuality::Good => write!(f, "good"),
            ConnectionQuality::Fair => write!(f, "fair"),
            ConnectionQuality::Poor => write!(f, "poor"),
        }
    }
}

/// Accumulates per-message counters for one manager.
#[derive(Debug, Default)]
pub struct MetricsTracker {
    total_messages: u64,
    receipts: VecDeque<DateTime<Utc>>,
    latencies_ms: VecDeque<i64>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one received change. A commit timestamp adds a latency sample;
    /// clock skew that puts the commit in the future counts as zero.
    pub fn record_message(&mut self, now: DateTime<Utc>, committed_at: Option<DateTime<Utc>>) {
        self.total_messages += 1;
        self.receipts.push_back(now);
        self.prune(now);

        if let Some(committed_at) = committed_at {
            let latency = (now - committed_at).num_milliseconds().max(0);
            self.latencies_ms.push_back(latency);
            while self.latencies_ms.len() > LATENCY_SAMPLES {
                self.latencies_ms.pop_front();
            }
        }
    }

    /// Drop receipts that fell out of the trailing window.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::seconds(MESSAGE_WINDOW_SECS);
        while self.receipts.front().is_some_and(|t| *t <= cutoff) {
            self.receipts.pop_front();
        }
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages
    }

    /// Receipts within the trailing minute of `now`.
    pub fn messages_in_window(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono::Duration::seconds(MESSAGE_WINDOW_SECS);
        self.receipts.iter().filter(|t| **t > cutoff).count()
    }

    pub fn average_latency_ms(&self) -> f64 {
        if self.latencies_ms.is_empty() {
            return 0.0;
        }
        let sum: i64 = self.latencies_ms.iter().sum();
        sum as f64 / self.latencies_ms.len() as f64
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
