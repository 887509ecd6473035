//! Subscriber-facing configuration and handles.

use crate::manager::RealtimeManager;
use crate::transport::Binding;
use events::{ChangePayload, EventHandler, EventSelector, HandlerError, SubscriberId};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Called with every change delivered to a subscriber.
pub type DataCallback = Arc<dyn Fn(&ChangePayload) -> Result<(), HandlerError> + Send + Sync>;

/// Called when this subscriber's [`DataCallback`] fails.
pub type ErrorCallback = Arc<dyn Fn(&HandlerError) + Send + Sync>;

/// Build the registry key for a table subscription: `schema:table[:filter]`.
pub fn channel_key(schema: &str, table: &str, filter: Option<&str>) -> String {
    match filter {
        Some(filter) => format!("{schema}:{table}:{filter}"),
        None => format!("{schema}:{table}"),
    }
}

/// What to listen to and where to deliver it.
///
/// ```ignore
/// let config = SubscriptionConfig::new("posts", |change| {
///     println!("{} on posts", change.event_type);
///     Ok(())
/// })
/// .event(EventSelector::Insert)
/// .filter("profile_id=eq.42");
/// ```
#[derive(Clone)]
pub struct SubscriptionConfig {
    pub table: String,
    pub schema: String,
    pub event: EventSelector,
    pub filter: Option<String>,
    on_data: DataCallback,
    on_error: Option<ErrorCallback>,
}

impl SubscriptionConfig {
    pub fn new<F>(table: impl Into<String>, on_data: F) -> Self
    where
        F: Fn(&ChangePayload) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self {
            table: table.into(),
            schema: "public".to_string(),
            event: EventSelector::All,
            filter: None,
            on_data: Arc::new(on_data),
            on_error: None,
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn event(mut self, event: EventSelector) -> Self {
        self.event = event;
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&HandlerError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    pub fn channel_key(&self) -> String {
        channel_key(&self.schema, &self.table, self.filter.as_deref())
    }

    pub(crate) fn subscriber(&self) -> Arc<dyn EventHandler<ChangePayload>> {
        Arc::new(Subscriber {
            event: self.event,
            on_data: Arc::clone(&self.on_data),
            on_error: self.on_error.clone(),
        })
    }
}

impl fmt::Debug for SubscriptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SubscriptionConfig")
            .field("table", &self.table)
            .field("schema", &self.schema)
            .field("event", &self.event)
            .field("filter", &self.filter)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// The parameters a channel was opened with. Recorded from the first
/// subscriber and replayed on every reconnect.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChannelSpec {
    pub schema: String,
    pub table: String,
    pub event: EventSelector,
    pub filter: Option<String>,
}

impl ChannelSpec {
    pub fn from_config(config: &SubscriptionConfig) -> Self {
        Self {
            schema: config.schema.clone(),
            table: config.table.clone(),
            event: config.event,
            filter: config.filter.clone(),
        }
    }

    pub fn key(&self) -> String {
        channel_key(&self.schema, &self.table, self.filter.as_deref())
    }

    pub fn topic(&self) -> String {
        format!("realtime:{}", self.key())
    }

    pub fn binding(&self) -> Binding {
        Binding::PostgresChanges {
            schema: self.schema.clone(),
            table: self.table.clone(),
            event: self.event,
            filter: self.filter.clone(),
        }
    }
}

/// One logical subscriber on a channel's event bus.
struct Subscriber {
    event: EventSelector,
    on_data: DataCallback,
    on_error: Option<ErrorCallback>,
}

impl EventHandler<ChangePayload> for Subscriber {
    fn handle(&self, payload: &ChangePayload) -> Result<(), HandlerError> {
        if !self.event.matches(payload.event_type) {
            return Ok(());
        }
        (self.on_data)(payload)
    }

    fn on_error(&self, error: &HandlerError) {
        if let Some(on_error) = &self.on_error {
            on_error(error);
        }
    }
}

/// Returned by `RealtimeManager::subscribe`. Owned by the caller.
///
/// Dropping the handle does not unsubscribe; call [`Self::unsubscribe`].
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: SubscriberId,
    channel_name: String,
    table: String,
    filter: Option<String>,
    released: Arc<AtomicBool>,
    manager: Weak<RealtimeManager>,
}

impl SubscriptionHandle {
    pub(crate) fn new(
        id: SubscriberId,
        config: &SubscriptionConfig,
        manager: Weak<RealtimeManager>,
    ) -> Self {
        Self {
            id,
            channel_name: config.channel_key(),
            table: config.table.clone(),
            filter: config.filter.clone(),
            released: Arc::new(AtomicBool::new(false)),
            manager,
        }
    }

    /// A handle that was never attached, returned by a destroyed manager.
    pub(crate) fn detached(config: &SubscriptionConfig) -> Self {
        let handle = Self::new(SubscriberId::new(), config, Weak::new());
        handle.released.store(true, Ordering::SeqCst);
        handle
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Stop delivery to this subscriber. Closes the channel when it was the
    /// last one. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.release(&self.channel_name, &self.id);
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("channel_name", &self.channel_name)
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::ChangeKind;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn channel_key_includes_filter_when_present() {
        assert_eq!(channel_key("public", "posts", None), "public:posts");
        assert_eq!(
            channel_key("public", "posts", Some("id=eq.5")),
            "public:posts:id=eq.5"
        );
    }

    #[test]
    fn config_defaults_to_public_schema_and_all_events() {
        let config = SubscriptionConfig::new("rooms", |_| Ok(()));
        assert_eq!(config.schema, "public");
        assert_eq!(config.event, EventSelector::All);
        assert_eq!(config.channel_key(), "public:rooms");

        let spec = ChannelSpec::from_config(&config.filter("id=eq.1"));
        assert_eq!(spec.topic(), "realtime:public:rooms:id=eq.1");
    }

    #[test]
    fn subscriber_skips_unselected_events_and_routes_errors() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let error_sink = Arc::clone(&errors);
        let subscriber = SubscriptionConfig::new("posts", move |change| {
            if change.new.as_ref().and_then(|r| r.get("bad")).is_some() {
                return Err(HandlerError::new("bad row"));
            }
            sink.lock().unwrap().push(change.event_type);
            Ok(())
        })
        .event(EventSelector::Insert)
        .on_error(move |e| error_sink.lock().unwrap().push(e.message().to_string()))
        .subscriber();

        let delete = ChangePayload::delete("public", "posts", json!({"id": 1}));
        assert!(subscriber.handle(&delete).is_ok());

        let insert = ChangePayload::insert("public", "posts", json!({"id": 1}));
        assert!(subscriber.handle(&insert).is_ok());

        let bad = ChangePayload::insert("public", "posts", json!({"bad": true}));
        let err = subscriber.handle(&bad).unwrap_err();
        subscriber.on_error(&err);

        assert_eq!(*seen.lock().unwrap(), vec![ChangeKind::Insert]);
        assert_eq!(*errors.lock().unwrap(), vec!["bad row".to_string()]);
    }

    #[test]
    fn detached_handle_is_already_released() {
        let config = SubscriptionConfig::new("posts", |_| Ok(()));
        let handle = SubscriptionHandle::detached(&config);

        assert!(handle.is_released());
        handle.unsubscribe();
        assert_eq!(handle.channel_name(), "public:posts");
    }
}
