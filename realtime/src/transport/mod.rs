//! Abstraction over the hosted realtime messaging service.
//!
//! The manager only ever talks to a [`Transport`]: it opens channels bound to
//! table changes, presence, or broadcast traffic, and receives status changes
//! and messages through a [`ChannelListener`]. The service's own wire protocol
//! stays behind this trait.

pub mod filter;
pub mod loopback;

pub use filter::{FilterOp, RowFilter};
pub use loopback::LoopbackTransport;

use crate::error::Error;
use async_trait::async_trait;
use events::{ChangePayload, EventSelector};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Channel-level status reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChannelStatus::Subscribed => write!(f, "SUBSCRIBED"),
            ChannelStatus::ChannelError => write!(f, "CHANNEL_ERROR"),
            ChannelStatus::TimedOut => write!(f, "TIMED_OUT"),
            ChannelStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

/// What a channel listens to.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// Row changes on one table, optionally narrowed by a row filter.
    PostgresChanges {
        schema: String,
        table: String,
        event: EventSelector,
        filter: Option<String>,
    },
    /// Presence roster; `key` identifies the local participant.
    Presence { key: String },
    /// Ephemeral broadcast messages.
    Broadcast { receive_own: bool },
}

/// Messages delivered to a channel listener.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Change(ChangePayload),
    /// Full presence state: key -> tracked states for that key.
    PresenceSync {
        state: HashMap<String, Vec<Value>>,
    },
    PresenceJoin {
        key: String,
        presences: Vec<Value>,
    },
    PresenceLeave {
        key: String,
        presences: Vec<Value>,
    },
    Broadcast {
        event: String,
        payload: Value,
    },
}

/// Receives everything the transport reports for one channel.
pub trait ChannelListener: Send + Sync {
    fn on_message(&self, message: ChannelMessage);

    fn on_status(&self, status: ChannelStatus, detail: Option<String>);
}

/// An open channel on the transport.
#[async_trait]
pub trait TransportChannel: Send + Sync {
    fn topic(&self) -> &str;

    /// Publish the local presence state (presence channels only).
    async fn track(&self, state: Value) -> Result<(), Error>;

    /// Withdraw the local presence state.
    async fn untrack(&self) -> Result<(), Error>;

    /// Send a broadcast message to the other participants on the topic.
    async fn send(&self, event: &str, payload: Value) -> Result<(), Error>;

    /// Leave the channel. The listener receives `Closed`; repeated calls are no-ops.
    fn close(&self);
}

/// Entry point to the realtime service.
pub trait Transport: Send + Sync {
    /// Open a channel on `topic`.
    ///
    /// Status changes, including the initial `Subscribed`, arrive on
    /// `listener` and may do so before this call returns.
    fn open_channel(
        &self,
        topic: &str,
        binding: Binding,
        listener: Arc<dyn ChannelListener>,
    ) -> Arc<dyn TransportChannel>;
}
