use crate::reconnect::BackoffPolicy;
use std::time::Duration;

/// Tuning knobs for a [`crate::RealtimeManager`].
///
/// `Default` gives the production values; `service::config::Config` maps its
/// command line / environment settings onto this struct.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeConfig {
    /// Buffer change events per channel and deliver them after `batch_window`
    /// of quiet. When false, events are delivered as they arrive.
    pub batching: bool,
    pub batch_window: Duration,
    pub backoff: BackoffPolicy,
    /// Interval of the health check started once a channel is subscribed.
    pub health_check_interval: Duration,
    /// Default presence heartbeat when a room does not set its own.
    pub presence_heartbeat: Duration,
    /// Remote presence entries older than this are dropped from the roster.
    pub presence_timeout: Duration,
    /// Default typing auto-stop when an indicator does not set its own.
    pub typing_timeout: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            batching: true,
            batch_window: Duration::from_millis(100),
            backoff: BackoffPolicy::default(),
            health_check_interval: Duration::from_secs(30),
            presence_heartbeat: Duration::from_secs(30),
            presence_timeout: Duration::from_secs(60),
            typing_timeout: Duration::from_secs(3),
        }
    }
}

impl RealtimeConfig {
    pub fn without_batching(mut self) -> Self {
        self.batching = false;
        self
    }
}
