use crate::channel::{ChannelRegistry, Detached};
use crate::clock::{Scheduler, TimerHandle};
use crate::config::RealtimeConfig;
use crate::error::{lifecycle_error, Error, LifecycleErrorKind};
use crate::lock;
use crate::metrics::{ConnectionQuality, MetricsTracker, RealtimeMetrics};
use crate::presence::{PresenceHandle, PresenceOptions, PresenceSession};
use crate::reconnect::{ConnectionStatus, ReconnectController, ReconnectDecision};
use crate::subscription::{ChannelSpec, SubscriptionConfig, SubscriptionHandle};
use crate::transport::{ChannelListener, ChannelMessage, ChannelStatus, Transport};
use crate::typing::{TypingIndicator, TypingOptions, TypingSession};
use events::{ChangePayload, SubscriberId};
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;

/// A presence or typing session that must be torn down with its manager.
pub(crate) trait Overlay: Send + Sync {
    fn shutdown(&self);
}

/// Multiplexes table subscriptions, presence and typing over one transport.
///
/// Construct with [`RealtimeManager::init`] and share the returned `Arc`.
/// Subscribers with the same `schema:table[:filter]` key share one transport
/// channel; incoming changes are counted for metrics, optionally batched, and
/// fanned out to every live subscriber of that channel. Channel failures are
/// retried with exponential backoff until the attempt budget runs out.
pub struct RealtimeManager {
    config: RealtimeConfig,
    transport: Arc<dyn Transport>,
    scheduler: Arc<dyn Scheduler>,
    registry: ChannelRegistry,
    reconnect: Mutex<ReconnectController>,
    metrics: Mutex<MetricsTracker>,
    health_timer: Mutex<Option<TimerHandle>>,
    status_tx: watch::Sender<ConnectionStatus>,
    overlays: Mutex<Vec<Weak<dyn Overlay>>>,
    destroyed: AtomicBool,
    self_ref: Weak<RealtimeManager>,
}

impl RealtimeManager {
    pub fn init(
        config: RealtimeConfig,
        transport: Arc<dyn Transport>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        info!(
            "Initializing realtime manager (batching: {}, window: {:?}, max reconnect attempts: {})",
            config.batching, config.batch_window, config.backoff.max_attempts
        );
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let reconnect = ReconnectController::new(config.backoff);

        Arc::new_cyclic(|self_ref| Self {
            config,
            transport,
            scheduler,
            registry: ChannelRegistry::new(),
            reconnect: Mutex::new(reconnect),
            metrics: Mutex::new(MetricsTracker::new()),
            health_timer: Mutex::new(None),
            status_tx,
            overlays: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    /// Attach a subscriber to the channel for its key, opening the channel
    /// when this is the first subscriber.
    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        if self.is_destroyed() {
            warn!(
                "Subscribe to {} on a destroyed realtime manager ignored",
                config.channel_key()
            );
            return SubscriptionHandle::detached(&config);
        }

        let attached = self
            .registry
            .attach(ChannelSpec::from_config(&config), config.subscriber());
        let key = attached.spec.key();

        match attached.opened {
            Some(generation) => {
                info!("Opening realtime channel {key}");
                self.open_channel(&attached.spec, generation);
            }
            None => {
                debug!("Joined existing realtime channel {key}");
                if !attached.spec.event.covers(config.event) {
                    warn!(
                        "Channel {key} was opened for {} events; {} events for a later subscriber will not arrive",
                        attached.spec.event, config.event
                    );
                }
            }
        }

        SubscriptionHandle::new(attached.subscriber_id, &config, self.self_ref.clone())
    }

    pub fn get_status(&self) -> ConnectionStatus {
        lock(&self.reconnect).status()
    }

    /// Receiver that observes every status transition.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn get_metrics(&self) -> RealtimeMetrics {
        let now = self.scheduler.now();
        let (status, reconnect_count, uptime) = {
            let reconnect = lock(&self.reconnect);
            (
                reconnect.status(),
                reconnect.total_reconnects(),
                reconnect.uptime(now),
            )
        };
        let (total_messages, messages_per_minute, average_latency_ms) = {
            let metrics = lock(&self.metrics);
            (
                metrics.total_messages(),
                metrics.messages_in_window(now),
                metrics.average_latency_ms(),
            )
        };

        RealtimeMetrics {
            status,
            active_subscriptions: self.registry.subscriber_count(),
            channel_count: self.registry.len(),
            total_messages,
            messages_per_minute,
            reconnect_count,
            average_latency_ms,
            uptime_ms: uptime.as_millis() as u64,
        }
    }

    pub fn get_connection_quality(&self) -> ConnectionQuality {
        ConnectionQuality::from_metrics(&self.get_metrics())
    }

    /// Close every channel and overlay and return to `Disconnected`.
    /// Outstanding handles become inert.
    pub fn disconnect(&self) {
        let channels = self.registry.drain();
        let count = channels.len();
        for mut channel in channels {
            channel.bus.clear();
            if let Some(transport) = channel.release() {
                transport.close();
            }
        }

        let overlays: Vec<Weak<dyn Overlay>> = std::mem::take(&mut *lock(&self.overlays));
        for overlay in overlays.iter().filter_map(Weak::upgrade) {
            overlay.shutdown();
        }

        self.stop_health_monitor();
        lock(&self.reconnect).on_disconnect();
        self.publish_status();
        info!("Realtime manager disconnected ({count} channels closed)");
    }

    /// Disconnect, reset all counters and refuse further work.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnect();
        lock(&self.metrics).reset();
        lock(&self.reconnect).reset();
        info!("Realtime manager destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn channel_count(&self) -> usize {
        self.registry.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.subscriber_count()
    }

    /// True while the periodic health check is scheduled.
    pub fn is_monitoring(&self) -> bool {
        lock(&self.health_timer).is_some()
    }

    /// Join the presence roster of `options.room`. Resolves once the local
    /// user's initial state has been tracked.
    pub async fn track_presence(&self, options: PresenceOptions) -> Result<PresenceHandle, Error> {
        self.ensure_active()?;

        let session = PresenceSession::open(
            options,
            &self.config,
            self.transport.as_ref(),
            Arc::clone(&self.scheduler),
        );
        self.register_overlay(Arc::clone(&session) as Arc<dyn Overlay>);

        if let Err(e) = session.track_local().await {
            session.shutdown();
            return Err(e);
        }
        session.start_heartbeat();
        Ok(PresenceHandle::new(session))
    }

    pub fn create_typing_indicator(&self, options: TypingOptions) -> Result<TypingIndicator, Error> {
        self.ensure_active()?;

        let session = TypingSession::open(
            options,
            &self.config,
            self.transport.as_ref(),
            Arc::clone(&self.scheduler),
        );
        self.register_overlay(Arc::clone(&session) as Arc<dyn Overlay>);
        Ok(TypingIndicator::new(session))
    }

    fn ensure_active(&self) -> Result<(), Error> {
        if self.is_destroyed() {
            return Err(lifecycle_error(
                LifecycleErrorKind::Destroyed,
                "realtime manager has been destroyed",
            ));
        }
        Ok(())
    }

    fn register_overlay(&self, overlay: Arc<dyn Overlay>) {
        let mut overlays = lock(&self.overlays);
        overlays.retain(|o| o.strong_count() > 0);
        overlays.push(Arc::downgrade(&overlay));
    }

    /// Called by [`SubscriptionHandle::unsubscribe`].
    pub(crate) fn release(&self, key: &str, subscriber_id: &SubscriberId) {
        match self.registry.detach(key, subscriber_id) {
            Detached::NotFound => {
                trace!("Subscriber {subscriber_id} already gone from {key}");
            }
            Detached::Remaining(count) => {
                debug!("Subscriber {subscriber_id} left {key}; {count} remaining");
            }
            Detached::Closed(mut channel) => {
                info!("Last subscriber left {key}; closing channel");
                if let Some(transport) = channel.release() {
                    transport.close();
                }
                if self.registry.is_empty() {
                    self.stop_health_monitor();
                    lock(&self.reconnect).on_all_closed();
                    self.publish_status();
                }
            }
        }
    }

    fn open_channel(&self, spec: &ChannelSpec, generation: u64) {
        let key = spec.key();
        let listener = Arc::new(ChannelEvents {
            manager: self.self_ref.clone(),
            key: key.clone(),
            generation,
        });

        let channel = self
            .transport
            .open_channel(&spec.topic(), spec.binding(), listener);
        if let Some(orphan) = self.registry.set_transport(&key, generation, channel) {
            debug!("Channel {key} was replaced while opening; closing generation {generation}");
            orphan.close();
        }
    }

    fn on_change(&self, key: &str, generation: u64, payload: ChangePayload) {
        if !self.registry.is_current(key, generation) {
            trace!("Dropping change from stale channel generation {generation} of {key}");
            return;
        }

        let now = self.scheduler.now();
        lock(&self.metrics).record_message(now, payload.commit_timestamp);
        trace!("{} on {key}", payload.event_type);

        if !self.config.batching {
            if let Some(bus) = self.registry.bus(key) {
                bus.publish(&payload);
            }
            return;
        }

        let manager = self.self_ref.clone();
        let flush_key = key.to_string();
        self.registry.with_channel(key, |channel| {
            channel.buffer.push(payload);
            if let Some(timer) = channel.flush_timer.take() {
                timer.cancel();
            }
            channel.flush_timer = Some(self.scheduler.schedule(
                self.config.batch_window,
                Box::new(move || {
                    if let Some(manager) = manager.upgrade() {
                        manager.flush(&flush_key);
                    }
                }),
            ));
        });
    }

    fn flush(&self, key: &str) {
        let Some((bus, batch)) = self.registry.with_channel(key, |channel| {
            channel.flush_timer = None;
            (Arc::clone(&channel.bus), std::mem::take(&mut channel.buffer))
        }) else {
            return;
        };

        debug!("Flushing {} buffered events on {key}", batch.len());
        for payload in &batch {
            bus.publish(payload);
        }
    }

    fn on_status(&self, key: &str, generation: u64, status: ChannelStatus, detail: Option<String>) {
        let detail = detail.unwrap_or_default();
        match status {
            ChannelStatus::Subscribed => self.on_subscribed(key, generation),
            ChannelStatus::ChannelError | ChannelStatus::TimedOut => {
                self.on_channel_failure(key, generation, status, &detail)
            }
            ChannelStatus::Closed => {
                self.registry
                    .with_current(key, generation, |channel| channel.subscribed = false);
                if !self.registry.any_subscribed() {
                    self.stop_health_monitor();
                }
                debug!("Channel {key} generation {generation} closed");
            }
        }
    }

    fn on_subscribed(&self, key: &str, generation: u64) {
        let marked = self
            .registry
            .with_current(key, generation, |channel| channel.subscribed = true);
        if marked.is_none() {
            trace!("Ignoring SUBSCRIBED from stale generation {generation} of {key}");
            return;
        }

        lock(&self.reconnect).on_subscribed(self.scheduler.now());
        self.publish_status();
        self.start_health_monitor();
        info!("Realtime channel {key} subscribed");
    }

    fn on_channel_failure(&self, key: &str, generation: u64, status: ChannelStatus, detail: &str) {
        let manager = self.self_ref.clone();
        let reconnect_key = key.to_string();

        // Pending check, attempt count and timer are settled under the channel's entry lock.
        let outcome = self.registry.with_current(key, generation, |channel| {
            channel.subscribed = false;
            if channel.reconnect_pending() {
                return None;
            }

            let decision = lock(&self.reconnect).on_failure();
            let abandoned = match decision {
                ReconnectDecision::GiveUp { .. } => channel.transport.take(),
                ReconnectDecision::Retry { delay, .. } => {
                    channel.reconnect_timer = Some(self.scheduler.schedule(
                        delay,
                        Box::new(move || {
                            if let Some(manager) = manager.upgrade() {
                                manager.reconnect_channel(&reconnect_key, generation);
                            }
                        }),
                    ));
                    None
                }
            };
            Some((decision, abandoned))
        });

        let (decision, abandoned) = match outcome {
            None => {
                trace!("Ignoring {status} from stale generation {generation} of {key}");
                return;
            }
            Some(None) => {
                debug!("{status} on {key} while a reconnect is already scheduled");
                return;
            }
            Some(Some(settled)) => settled,
        };
        self.publish_status();

        match decision {
            ReconnectDecision::GiveUp { attempts } => {
                error!("Realtime channel {key} failed ({status} {detail}); giving up after {attempts} reconnect attempts");
                if let Some(transport) = abandoned {
                    transport.close();
                }
            }
            ReconnectDecision::Retry { attempt, delay } => {
                warn!("Realtime channel {key} failed ({status} {detail}); reconnect attempt {attempt} in {delay:?}");
            }
        }
    }

    /// Reopen a failed channel with the parameters it was first opened with.
    fn reconnect_channel(&self, key: &str, generation: u64) {
        let next = self.registry.next_generation();
        let reopened = self.registry.with_current(key, generation, |channel| {
            channel.reconnect_timer = None;
            channel.generation = next;
            (channel.spec.clone(), channel.transport.take())
        });
        let Some((spec, previous)) = reopened else {
            return;
        };

        if let Some(previous) = previous {
            previous.close();
        }
        info!("Reopening realtime channel {key} (generation {next})");
        self.open_channel(&spec, next);
    }

    fn start_health_monitor(&self) {
        let mut health_timer = lock(&self.health_timer);
        if health_timer.is_some() {
            return;
        }

        let manager = self.self_ref.clone();
        *health_timer = Some(self.scheduler.schedule_repeating(
            self.config.health_check_interval,
            Arc::new(move || {
                if let Some(manager) = manager.upgrade() {
                    manager.health_check();
                }
            }),
        ));
        debug!("Health monitor started");
    }

    fn stop_health_monitor(&self) {
        if let Some(timer) = lock(&self.health_timer).take() {
            timer.cancel();
            debug!("Health monitor stopped");
        }
    }

    fn health_check(&self) {
        lock(&self.metrics).prune(self.scheduler.now());
        let metrics = self.get_metrics();
        debug!(
            "Realtime health: status={} channels={} subscriptions={} messages/min={} latency={:.1}ms reconnects={} quality={}",
            metrics.status,
            metrics.channel_count,
            metrics.active_subscriptions,
            metrics.messages_per_minute,
            metrics.average_latency_ms,
            metrics.reconnect_count,
            ConnectionQuality::from_metrics(&metrics)
        );
    }

    fn publish_status(&self) {
        let status = lock(&self.reconnect).status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            debug!("Realtime status {} -> {}", current, status);
            *current = status;
            true
        });
    }
}

/// Routes transport callbacks for one channel generation back to the manager.
struct ChannelEvents {
    manager: Weak<RealtimeManager>,
    key: String,
    generation: u64,
}

impl ChannelListener for ChannelEvents {
    fn on_message(&self, message: ChannelMessage) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        match message {
            ChannelMessage::Change(payload) => manager.on_change(&self.key, self.generation, payload),
            other => trace!("Ignoring non-change message on {}: {:?}", self.key, other),
        }
    }

    fn on_status(&self, status: ChannelStatus, detail: Option<String>) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_status(&self.key, self.generation, status, detail);
        }
    }
}
