//! Error types for the `realtime` crate.
//!
//! Follows the same pattern as the other layers: a root Error struct holding an
//! error kind tree and an optional source for error chaining. Subscriber
//! callback failures are not modelled here; they surface as
//! `events::HandlerError` on the failing subscriber only.

use std::error::Error as StdError;
use std::fmt;

/// Top-level error type for the realtime crate.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Major categories of errors in the realtime layer.
#[derive(Debug, PartialEq)]
pub enum ErrorKind {
    Transport(TransportErrorKind),
    Presence(PresenceErrorKind),
    Lifecycle(LifecycleErrorKind),
}

/// Errors raised by the underlying realtime transport.
#[derive(Debug, PartialEq)]
pub enum TransportErrorKind {
    ChannelClosed,
    SendFailed,
    InvalidFilter,
    Serialization,
}

/// Errors from presence tracking.
#[derive(Debug, PartialEq)]
pub enum PresenceErrorKind {
    NotTracking,
    InvalidState,
}

/// Errors from using a manager outside its init/shutdown window.
#[derive(Debug, PartialEq)]
pub enum LifecycleErrorKind {
    Destroyed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let detail = self
            .source
            .as_ref()
            .map(|s| format!(": {s}"))
            .unwrap_or_default();
        match &self.error_kind {
            ErrorKind::Transport(kind) => write!(f, "Transport error: {:?}{}", kind, detail),
            ErrorKind::Presence(kind) => write!(f, "Presence error: {:?}{}", kind, detail),
            ErrorKind::Lifecycle(kind) => write!(f, "Lifecycle error: {:?}{}", kind, detail),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Transport(TransportErrorKind::Serialization),
        }
    }
}

/// Helper function to create transport errors.
pub fn transport_error(kind: TransportErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Transport(kind),
    }
}

/// Helper function to create presence errors.
pub fn presence_error(kind: PresenceErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Presence(kind),
    }
}

/// Helper function to create lifecycle errors.
pub fn lifecycle_error(kind: LifecycleErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Lifecycle(kind),
    }
}
