//! Realtime subscription multiplexer.
//!
//! Many logical subscribers to table changes share one transport channel per
//! `schema:table[:filter]` key. The [`RealtimeManager`] owns the channel
//! registry and, on top of the [`transport::Transport`] seam, provides:
//!
//! - **Batching**: change events are buffered per channel and flushed after a
//!   quiet window (100 ms by default), in arrival order.
//! - **Reconnection**: failed channels are reopened with exponential backoff
//!   until the attempt budget is spent, then the status turns `error`.
//! - **Metrics**: message rate, commit latency and a coarse quality grade.
//! - **Presence and typing**: rooms with heartbeat-refreshed rosters and
//!   typing indicators with auto-stop timers.
//!
//! All delays go through a [`clock::Scheduler`] so tests can drive time with
//! [`clock::ManualClock`].
//!
//! # Example
//!
//! ```rust,ignore
//! let transport = Arc::new(LoopbackTransport::new());
//! let manager = RealtimeManager::init(
//!     RealtimeConfig::default(),
//!     transport,
//!     Arc::new(TokioScheduler::current()),
//! );
//!
//! let handle = manager.subscribe(
//!     SubscriptionConfig::new("posts", |change| {
//!         info!("{} on posts", change.event_type);
//!         Ok(())
//!     })
//!     .filter("id=eq.5"),
//! );
//! // ...
//! handle.unsubscribe();
//! ```

pub mod clock;
pub mod config;
pub mod debug;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod presence;
pub mod reconnect;
pub mod subscription;
pub mod transport;
pub mod typing;

mod channel;

pub use clock::{ManualClock, Scheduler, TimerHandle, TokioScheduler};
pub use config::RealtimeConfig;
pub use error::{Error, ErrorKind};
pub use manager::RealtimeManager;
pub use metrics::{ConnectionQuality, RealtimeMetrics};
pub use presence::{PresenceHandle, PresenceOptions, PresenceUpdate, PresenceUser};
pub use reconnect::{BackoffPolicy, ConnectionStatus};
pub use subscription::{SubscriptionConfig, SubscriptionHandle};
pub use transport::LoopbackTransport;
pub use typing::{TypingIndicator, TypingOptions, TypingUser};

pub use events::{ChangeKind, ChangePayload, EventSelector, HandlerError};

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
