use crate::clock::TimerHandle;
use crate::subscription::ChannelSpec;
use crate::transport::TransportChannel;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use events::{ChangePayload, EventBus, EventHandler, SubscriberId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One multiplexed transport channel and the subscribers sharing it.
pub(crate) struct Channel {
    /// Recorded from the first subscriber; replayed on reconnect
    pub spec: ChannelSpec,
    pub bus: Arc<EventBus<ChangePayload>>,
    /// Bumped every time the transport channel is (re)opened
    pub generation: u64,
    pub transport: Option<Arc<dyn TransportChannel>>,
    pub subscribed: bool,
    pub buffer: Vec<ChangePayload>,
    pub flush_timer: Option<TimerHandle>,
    pub reconnect_timer: Option<TimerHandle>,
}

impl Channel {
    fn new(spec: ChannelSpec, generation: u64) -> Self {
        Self {
            spec,
            bus: Arc::new(EventBus::new()),
            generation,
            transport: None,
            subscribed: false,
            buffer: Vec::new(),
            flush_timer: None,
            reconnect_timer: None,
        }
    }

    /// Cancel timers and drop buffered events. Returns the transport channel
    /// for the caller to close outside any registry lock.
    pub fn release(&mut self) -> Option<Arc<dyn TransportChannel>> {
        if let Some(timer) = self.flush_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = self.reconnect_timer.take() {
            timer.cancel();
        }
        self.buffer.clear();
        self.subscribed = false;
        self.transport.take()
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_timer
            .as_ref()
            .is_some_and(|timer| !timer.is_cancelled())
    }
}

/// Result of [`ChannelRegistry::attach`].
pub(crate) struct Attached {
    pub subscriber_id: SubscriberId,
    /// Generation of a channel created by this call; `None` when the
    /// subscriber joined an existing channel.
    pub opened: Option<u64>,
    pub spec: ChannelSpec,
}

/// Result of [`ChannelRegistry::detach`].
pub(crate) enum Detached {
    NotFound,
    Remaining(usize),
    Closed(Channel),
}

/// Registry of live channels keyed by `schema:table[:filter]`.
///
/// Holds at most one channel per key. Callers must not run subscriber
/// callbacks or transport calls while inside [`Self::with_channel`].
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    channels: DashMap<String, Channel>,
    generations: AtomicU64,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Add a subscriber, creating the channel for its key when missing.
    pub fn attach(
        &self,
        spec: ChannelSpec,
        subscriber: Arc<dyn EventHandler<ChangePayload>>,
    ) -> Attached {
        match self.channels.entry(spec.key()) {
            Entry::Occupied(entry) => {
                let channel = entry.get();
                Attached {
                    subscriber_id: channel.bus.subscribe(subscriber),
                    opened: None,
                    spec: channel.spec.clone(),
                }
            }
            Entry::Vacant(entry) => {
                let generation = self.next_generation();
                let channel = Channel::new(spec.clone(), generation);
                let subscriber_id = channel.bus.subscribe(subscriber);
                entry.insert(channel);
                Attached {
                    subscriber_id,
                    opened: Some(generation),
                    spec,
                }
            }
        }
    }

    /// Remove one subscriber. The channel is removed with its last subscriber.
    pub fn detach(&self, key: &str, subscriber_id: &SubscriberId) -> Detached {
        let mut found = false;
        let removed = self.channels.remove_if(key, |_, channel| {
            found = channel.bus.unsubscribe(subscriber_id);
            channel.bus.is_empty()
        });

        match removed {
            Some((_, channel)) => Detached::Closed(channel),
            None if found => Detached::Remaining(self.subscriber_count_of(key)),
            None => Detached::NotFound,
        }
    }

    /// Store the transport channel for `generation`. Hands it back when the
    /// channel was removed or reopened in the meantime.
    pub fn set_transport(
        &self,
        key: &str,
        generation: u64,
        transport: Arc<dyn TransportChannel>,
    ) -> Option<Arc<dyn TransportChannel>> {
        match self.channels.get_mut(key) {
            Some(mut channel) if channel.generation == generation => {
                channel.transport = Some(transport);
                None
            }
            _ => Some(transport),
        }
    }

    pub fn is_current(&self, key: &str, generation: u64) -> bool {
        self.channels
            .get(key)
            .is_some_and(|channel| channel.generation == generation)
    }

    /// Run `f` against the channel for `key` while holding its entry lock.
    pub fn with_channel<R>(&self, key: &str, f: impl FnOnce(&mut Channel) -> R) -> Option<R> {
        self.channels.get_mut(key).map(|mut channel| f(&mut channel))
    }

    /// Run `f` only when `generation` is still the channel's current one.
    pub fn with_current<R>(
        &self,
        key: &str,
        generation: u64,
        f: impl FnOnce(&mut Channel) -> R,
    ) -> Option<R> {
        self.channels
            .get_mut(key)
            .filter(|channel| channel.generation == generation)
            .map(|mut channel| f(&mut channel))
    }

    pub fn bus(&self, key: &str) -> Option<Arc<EventBus<ChangePayload>>> {
        self.channels.get(key).map(|channel| Arc::clone(&channel.bus))
    }

    pub fn any_subscribed(&self) -> bool {
        self.channels.iter().any(|channel| channel.subscribed)
    }

    /// Remove every channel.
    pub fn drain(&self) -> Vec<Channel> {
        let keys: Vec<String> = self.channels.iter().map(|c| c.key().clone()).collect();
        keys.iter()
            .filter_map(|key| self.channels.remove(key).map(|(_, channel)| channel))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn subscriber_count(&self) -> usize {
        self.channels.iter().map(|channel| channel.bus.len()).sum()
    }

    fn subscriber_count_of(&self, key: &str) -> usize {
        self.channels
            .get(key)
            .map(|channel| channel.bus.len())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use events::{EventSelector, HandlerError};

    struct Noop;

    impl EventHandler<ChangePayload> for Noop {
        fn handle(&self, _payload: &ChangePayload) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn spec(table: &str, filter: Option<&str>) -> ChannelSpec {
        ChannelSpec {
            schema: "public".to_string(),
            table: table.to_string(),
            event: EventSelector::All,
            filter: filter.map(str::to_string),
        }
    }

    #[test]
    fn one_channel_per_key() {
        let registry = ChannelRegistry::new();

        let first = registry.attach(spec("posts", None), Arc::new(Noop));
        let second = registry.attach(spec("posts", None), Arc::new(Noop));
        let filtered = registry.attach(spec("posts", Some("id=eq.5")), Arc::new(Noop));

        assert!(first.opened.is_some());
        assert!(second.opened.is_none());
        assert!(filtered.opened.is_some());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.subscriber_count(), 3);
    }

    #[test]
    fn last_detach_removes_channel() {
        let registry = ChannelRegistry::new();
        let a = registry.attach(spec("posts", None), Arc::new(Noop));
        let b = registry.attach(spec("posts", None), Arc::new(Noop));

        assert!(matches!(
            registry.detach("public:posts", &a.subscriber_id),
            Detached::Remaining(1)
        ));
        assert!(matches!(
            registry.detach("public:posts", &a.subscriber_id),
            Detached::NotFound
        ));
        assert!(matches!(
            registry.detach("public:posts", &b.subscriber_id),
            Detached::Closed(_)
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_generation_is_rejected() {
        let registry = ChannelRegistry::new();
        let attached = registry.attach(spec("posts", None), Arc::new(Noop));
        let generation = attached.opened.unwrap();

        assert!(registry.is_current("public:posts", generation));

        let reopened = registry.next_generation();
        registry.with_channel("public:posts", |channel| channel.generation = reopened);

        assert!(!registry.is_current("public:posts", generation));
        assert!(registry
            .with_current("public:posts", generation, |_| ())
            .is_none());
    }

    #[test]
    fn release_clears_buffer_and_timers() {
        let registry = ChannelRegistry::new();
        registry.attach(spec("posts", None), Arc::new(Noop));
        let channel = registry.drain().pop();

        let mut channel = channel.unwrap();
        channel.buffer.push(ChangePayload::insert(
            "public",
            "posts",
            serde_json::json!({"id": 1}),
        ));
        assert!(channel.release().is_none());
        assert!(channel.buffer.is_empty());
        assert_eq!(registry.len(), 0);
    }
}
