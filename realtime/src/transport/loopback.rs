//! In-memory transport for tests and the development harness.
//!
//! Behaves like the hosted service for a single process: row changes are
//! injected with [`LoopbackTransport::publish_change`] and routed through each
//! channel's table, event and row filter; presence state is kept per topic;
//! broadcasts are relayed between channels on the same topic. Failures can be
//! injected per topic to exercise reconnection.

use super::{Binding, ChannelListener, ChannelMessage, ChannelStatus, RowFilter, TransportChannel};
use crate::error::{transport_error, Error, TransportErrorKind};
use async_trait::async_trait;
use dashmap::DashMap;
use events::ChangePayload;
use log::*;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

struct Endpoint {
    id: u64,
    topic: String,
    binding: Binding,
    row_filter: Option<RowFilter>,
    listener: Arc<dyn ChannelListener>,
    closed: AtomicBool,
}

impl Endpoint {
    fn accepts(&self, payload: &ChangePayload) -> bool {
        let Binding::PostgresChanges {
            schema,
            table,
            event,
            ..
        } = &self.binding
        else {
            return false;
        };

        *schema == payload.schema
            && *table == payload.table
            && event.matches(payload.event_type)
            && self
                .row_filter
                .as_ref()
                .map_or(true, |f| payload.record().is_some_and(|r| f.matches(r)))
    }

    fn is_presence(&self) -> bool {
        matches!(self.binding, Binding::Presence { .. })
    }
}

#[derive(Default)]
struct Broker {
    next_id: AtomicU64,
    opened: AtomicUsize,
    manual_ack: AtomicBool,
    endpoints: DashMap<u64, Arc<Endpoint>>,
    /// topic -> presence key -> tracked state
    presence: DashMap<String, HashMap<String, Value>>,
    /// topic -> every broadcast relayed on it, in order
    broadcasts: DashMap<String, Vec<(String, Value)>>,
}

impl Broker {
    fn endpoints_on(&self, topic: &str) -> Vec<Arc<Endpoint>> {
        let mut endpoints: Vec<Arc<Endpoint>> = self
            .endpoints
            .iter()
            .filter(|e| e.topic == topic)
            .map(|e| Arc::clone(e.value()))
            .collect();
        endpoints.sort_by_key(|e| e.id);
        endpoints
    }

    fn presence_snapshot(&self, topic: &str) -> HashMap<String, Vec<Value>> {
        self.presence
            .get(topic)
            .map(|state| {
                state
                    .iter()
                    .map(|(key, value)| (key.clone(), vec![value.clone()]))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn notify_presence(&self, topic: &str, message: ChannelMessage) {
        let sync = ChannelMessage::PresenceSync {
            state: self.presence_snapshot(topic),
        };
        for endpoint in self.endpoints_on(topic) {
            if endpoint.is_presence() {
                endpoint.listener.on_message(message.clone());
                endpoint.listener.on_message(sync.clone());
            }
        }
    }

    fn track(&self, topic: &str, key: &str, state: Value) {
        self.presence
            .entry(topic.to_string())
            .or_default()
            .insert(key.to_string(), state.clone());
        trace!("Loopback presence tracked {key} on {topic}");

        self.notify_presence(
            topic,
            ChannelMessage::PresenceJoin {
                key: key.to_string(),
                presences: vec![state],
            },
        );
    }

    fn untrack(&self, topic: &str, key: &str) -> bool {
        let removed = self
            .presence
            .get_mut(topic)
            .and_then(|mut state| state.remove(key));

        match removed {
            Some(state) => {
                trace!("Loopback presence untracked {key} on {topic}");
                self.notify_presence(
                    topic,
                    ChannelMessage::PresenceLeave {
                        key: key.to_string(),
                        presences: vec![state],
                    },
                );
                true
            }
            None => false,
        }
    }

    fn relay(&self, sender: Option<u64>, topic: &str, event: &str, payload: Value) -> usize {
        self.broadcasts
            .entry(topic.to_string())
            .or_default()
            .push((event.to_string(), payload.clone()));

        let mut delivered = 0;
        for endpoint in self.endpoints_on(topic) {
            let Binding::Broadcast { receive_own } = endpoint.binding else {
                continue;
            };
            if sender == Some(endpoint.id) && !receive_own {
                continue;
            }
            endpoint.listener.on_message(ChannelMessage::Broadcast {
                event: event.to_string(),
                payload: payload.clone(),
            });
            delivered += 1;
        }
        delivered
    }

    fn acknowledge(&self, endpoint: &Endpoint) {
        endpoint.listener.on_status(ChannelStatus::Subscribed, None);
        if endpoint.is_presence() {
            endpoint.listener.on_message(ChannelMessage::PresenceSync {
                state: self.presence_snapshot(&endpoint.topic),
            });
        }
    }
}

/// In-process stand-in for the hosted realtime service.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    broker: Arc<Broker>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// When enabled, channels stay unacknowledged until [`Self::acknowledge`].
    pub fn set_manual_ack(&self, manual: bool) {
        self.broker.manual_ack.store(manual, Ordering::SeqCst);
    }

    /// Report `SUBSCRIBED` to every open channel on `topic`.
    pub fn acknowledge(&self, topic: &str) -> usize {
        let endpoints = self.broker.endpoints_on(topic);
        for endpoint in &endpoints {
            self.broker.acknowledge(endpoint);
        }
        endpoints.len()
    }

    /// Push a row change to every channel whose binding accepts it.
    /// Returns how many channels received it.
    pub fn publish_change(&self, payload: ChangePayload) -> usize {
        let mut endpoints: Vec<Arc<Endpoint>> = self
            .broker
            .endpoints
            .iter()
            .filter(|e| e.accepts(&payload))
            .map(|e| Arc::clone(e.value()))
            .collect();
        endpoints.sort_by_key(|e| e.id);

        for endpoint in &endpoints {
            endpoint
                .listener
                .on_message(ChannelMessage::Change(payload.clone()));
        }
        endpoints.len()
    }

    /// Report `status` to every channel on `topic` as if the server had sent it.
    /// Used to inject failures (`ChannelError`, `TimedOut`) and server-side closes.
    pub fn fail_channel(&self, topic: &str, status: ChannelStatus) -> usize {
        let endpoints = self.broker.endpoints_on(topic);
        for endpoint in &endpoints {
            endpoint
                .listener
                .on_status(status, Some(format!("injected failure on {topic}")));
        }
        endpoints.len()
    }

    /// Track presence for a participant that is not backed by a local channel.
    pub fn join_presence(&self, topic: &str, key: &str, state: Value) {
        self.broker.track(topic, key, state);
    }

    pub fn leave_presence(&self, topic: &str, key: &str) -> bool {
        self.broker.untrack(topic, key)
    }

    /// Broadcast on `topic` as a participant without a local channel.
    pub fn broadcast(&self, topic: &str, event: &str, payload: Value) -> usize {
        self.broker.relay(None, topic, event, payload)
    }

    /// Every broadcast relayed on `topic` so far, oldest first.
    pub fn broadcasts(&self, topic: &str) -> Vec<(String, Value)> {
        self.broker
            .broadcasts
            .get(topic)
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn presence_state(&self, topic: &str) -> HashMap<String, Value> {
        self.broker
            .presence
            .get(topic)
            .map(|state| state.clone())
            .unwrap_or_default()
    }

    /// Open channels on `topic`.
    pub fn open_channels(&self, topic: &str) -> usize {
        self.broker.endpoints_on(topic).len()
    }

    /// Open channels on every topic.
    pub fn channel_count(&self) -> usize {
        self.broker.endpoints.len()
    }

    /// Channels opened over the transport's lifetime, closed ones included.
    pub fn total_opened(&self) -> usize {
        self.broker.opened.load(Ordering::SeqCst)
    }
}

impl super::Transport for LoopbackTransport {
    fn open_channel(
        &self,
        topic: &str,
        binding: Binding,
        listener: Arc<dyn ChannelListener>,
    ) -> Arc<dyn TransportChannel> {
        let id = self.broker.next_id.fetch_add(1, Ordering::SeqCst);

        let parsed = match &binding {
            Binding::PostgresChanges {
                filter: Some(filter),
                ..
            } => Some(RowFilter::parse(filter)),
            _ => None,
        };
        let (row_filter, rejected) = match parsed {
            Some(Ok(filter)) => (Some(filter), None),
            Some(Err(e)) => (None, Some(e)),
            None => (None, None),
        };

        let endpoint = Arc::new(Endpoint {
            id,
            topic: topic.to_string(),
            binding,
            row_filter,
            listener,
            closed: AtomicBool::new(false),
        });
        self.broker.endpoints.insert(id, Arc::clone(&endpoint));
        self.broker.opened.fetch_add(1, Ordering::SeqCst);
        debug!("Loopback channel {id} opened on {topic}");

        if let Some(e) = rejected {
            warn!("Loopback channel {id} rejected: {e}");
            endpoint
                .listener
                .on_status(ChannelStatus::ChannelError, Some(e.to_string()));
        } else if !self.broker.manual_ack.load(Ordering::SeqCst) {
            self.broker.acknowledge(&endpoint);
        }

        Arc::new(LoopbackChannel {
            broker: Arc::clone(&self.broker),
            endpoint,
        })
    }
}

struct LoopbackChannel {
    broker: Arc<Broker>,
    endpoint: Arc<Endpoint>,
}

impl LoopbackChannel {
    fn ensure_open(&self) -> Result<(), Error> {
        if self.endpoint.closed.load(Ordering::SeqCst) {
            return Err(transport_error(
                TransportErrorKind::ChannelClosed,
                &self.endpoint.topic,
            ));
        }
        Ok(())
    }

    fn presence_key(&self) -> Result<&str, Error> {
        match &self.endpoint.binding {
            Binding::Presence { key } => Ok(key),
            _ => Err(transport_error(
                TransportErrorKind::SendFailed,
                "presence operation on a non-presence channel",
            )),
        }
    }
}

#[async_trait]
impl TransportChannel for LoopbackChannel {
    fn topic(&self) -> &str {
        &self.endpoint.topic
    }

    async fn track(&self, state: Value) -> Result<(), Error> {
        self.ensure_open()?;
        let key = self.presence_key()?;
        self.broker.track(&self.endpoint.topic, key, state);
        Ok(())
    }

    async fn untrack(&self) -> Result<(), Error> {
        self.ensure_open()?;
        let key = self.presence_key()?;
        self.broker.untrack(&self.endpoint.topic, key);
        Ok(())
    }

    async fn send(&self, event: &str, payload: Value) -> Result<(), Error> {
        self.ensure_open()?;
        self.broker
            .relay(Some(self.endpoint.id), &self.endpoint.topic, event, payload);
        Ok(())
    }

    fn close(&self) {
        if self.endpoint.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broker.endpoints.remove(&self.endpoint.id);
        if let Binding::Presence { key } = &self.endpoint.binding {
            self.broker.untrack(&self.endpoint.topic, key);
        }
        debug!(
            "Loopback channel {} closed on {}",
            self.endpoint.id, self.endpoint.topic
        );
        self.endpoint
            .listener
            .on_status(ChannelStatus::Closed, None);
    }
}
