use log::*;
use std::error::Error as StdError;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Error returned by an [`EventHandler`] that failed to process an event.
#[derive(Debug)]
pub struct HandlerError {
    message: String,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Error for a handler that panicked instead of returning.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let reason = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::new(format!("handler panicked: {reason}"))
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Handler Error: {}", self.message)
    }
}

impl StdError for HandlerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::with_source("Failed to decode event record", err)
    }
}

/// Trait for consuming events published on an [`EventBus`].
///
/// `handle` runs synchronously on the publishing task. Returning an error
/// routes it to this handler's `on_error` only; other handlers still receive
/// the event.
pub trait EventHandler<E>: Send + Sync {
    fn handle(&self, event: &E) -> Result<(), HandlerError>;

    fn on_error(&self, _error: &HandlerError) {}
}

/// Unique identifier for a handler registered on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a single [`EventBus::publish`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    /// Handlers that accepted the event
    pub delivered: usize,
    /// Handlers that returned an error
    pub failed: usize,
    /// Handlers removed while the publish was in progress
    pub skipped: usize,
}

struct Registration<E> {
    id: SubscriberId,
    handler: Arc<dyn EventHandler<E>>,
    active: Arc<AtomicBool>,
}

impl<E> Registration<E> {
    fn snapshot(&self) -> Self {
        Self {
            id: self.id,
            handler: Arc::clone(&self.handler),
            active: Arc::clone(&self.active),
        }
    }
}

/// Fans events out to registered handlers in registration order.
///
/// The handler list is copied before delivery, so handlers may subscribe or
/// unsubscribe (themselves included) from inside `handle`. A handler removed
/// mid-publish receives nothing further.
pub struct EventBus<E> {
    registrations: RwLock<Vec<Registration<E>>>,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
        }
    }

    /// Register a handler and return its id.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler<E>>) -> SubscriberId {
        let id = SubscriberId::new();
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registrations.push(Registration {
            id,
            handler,
            active: Arc::new(AtomicBool::new(true)),
        });
        id
    }

    /// Remove a handler. Returns false when `id` was not registered.
    pub fn unsubscribe(&self, id: &SubscriberId) -> bool {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        match registrations.iter().position(|r| r.id == *id) {
            Some(index) => {
                let removed = registrations.remove(index);
                removed.active.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Remove every handler, returning how many were registered.
    pub fn clear(&self) -> usize {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for registration in registrations.iter() {
            registration.active.store(false, Ordering::SeqCst);
        }
        let count = registrations.len();
        registrations.clear();
        count
    }

    pub fn contains(&self, id: &SubscriberId) -> bool {
        self.registrations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .any(|r| r.id == *id)
    }

    pub fn len(&self) -> usize {
        self.registrations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every registered handler.
    pub fn publish(&self, event: &E) -> PublishReport {
        let snapshot: Vec<Registration<E>> = self
            .registrations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(Registration::snapshot)
            .collect();

        let mut report = PublishReport::default();
        for registration in snapshot {
            if !registration.active.load(Ordering::SeqCst) {
                report.skipped += 1;
                continue;
            }

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| registration.handler.handle(event)))
                .unwrap_or_else(|payload| Err(HandlerError::from_panic(payload.as_ref())));
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Event handler {} failed: {}", registration.id, e);
                    registration.handler.on_error(&e);
                    report.failed += 1;
                }
            }
        }

        report
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
