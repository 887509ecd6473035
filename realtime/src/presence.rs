//! Presence rooms: who is online in a room, kept fresh by a heartbeat.
//!
//! Each room is a presence channel on the transport, topic `presence:{room}`,
//! keyed by the local user's id. The local state is re-tracked on every
//! heartbeat with a fresh `lastSeen`; remote users whose `lastSeen` falls
//! behind the presence timeout are dropped from the local roster.

use crate::clock::{Scheduler, TimerHandle};
use crate::config::RealtimeConfig;
use crate::error::{presence_error, Error, PresenceErrorKind};
use crate::lock;
use crate::manager::Overlay;
use crate::transport::{Binding, ChannelListener, ChannelMessage, ChannelStatus, Transport, TransportChannel};
use chrono::{DateTime, Utc};
use log::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// A participant in a presence room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUser {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl PresenceUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            avatar_url: None,
            activity: None,
            last_seen: Utc::now(),
            metadata: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_avatar_url(mut self, avatar_url: impl Into<String>) -> Self {
        self.avatar_url = Some(avatar_url.into());
        self
    }

    pub fn with_activity(mut self, activity: impl Into<String>) -> Self {
        self.activity = Some(activity.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Partial update of the local user. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceUpdate {
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub activity: Option<String>,
    pub metadata: Option<Value>,
}

impl PresenceUpdate {
    pub fn activity(activity: impl Into<String>) -> Self {
        Self {
            activity: Some(activity.into()),
            ..Self::default()
        }
    }

    fn apply(self, user: &mut PresenceUser) {
        if let Some(name) = self.name {
            user.name = Some(name);
        }
        if let Some(avatar_url) = self.avatar_url {
            user.avatar_url = Some(avatar_url);
        }
        if let Some(activity) = self.activity {
            user.activity = Some(activity);
        }
        if let Some(metadata) = self.metadata {
            user.metadata = Some(metadata);
        }
    }
}

pub type RosterCallback = Arc<dyn Fn(&[PresenceUser]) + Send + Sync>;
pub type PresenceCallback = Arc<dyn Fn(&PresenceUser) + Send + Sync>;

/// Parameters for `RealtimeManager::track_presence`.
#[derive(Clone)]
pub struct PresenceOptions {
    pub room: String,
    pub user: PresenceUser,
    /// Falls back to `RealtimeConfig::presence_heartbeat`.
    pub heartbeat_interval: Option<Duration>,
    on_sync: Option<RosterCallback>,
    on_join: Option<PresenceCallback>,
    on_leave: Option<PresenceCallback>,
}

impl PresenceOptions {
    pub fn new(room: impl Into<String>, user: PresenceUser) -> Self {
        Self {
            room: room.into(),
            user,
            heartbeat_interval: None,
            on_sync: None,
            on_join: None,
            on_leave: None,
        }
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn on_sync(mut self, f: impl Fn(&[PresenceUser]) + Send + Sync + 'static) -> Self {
        self.on_sync = Some(Arc::new(f));
        self
    }

    pub fn on_join(mut self, f: impl Fn(&PresenceUser) + Send + Sync + 'static) -> Self {
        self.on_join = Some(Arc::new(f));
        self
    }

    pub fn on_leave(mut self, f: impl Fn(&PresenceUser) + Send + Sync + 'static) -> Self {
        self.on_leave = Some(Arc::new(f));
        self
    }
}

pub fn presence_topic(room: &str) -> String {
    format!("presence:{room}")
}

pub(crate) struct PresenceSession {
    room: String,
    heartbeat_interval: Duration,
    timeout: chrono::Duration,
    scheduler: Arc<dyn Scheduler>,
    local: Mutex<PresenceUser>,
    roster: Mutex<HashMap<String, PresenceUser>>,
    channel: Mutex<Option<Arc<dyn TransportChannel>>>,
    heartbeat: Mutex<Option<TimerHandle>>,
    left: AtomicBool,
    on_sync: Option<RosterCallback>,
    on_join: Option<PresenceCallback>,
    on_leave: Option<PresenceCallback>,
    self_ref: Weak<PresenceSession>,
}

impl PresenceSession {
    pub fn open(
        options: PresenceOptions,
        config: &RealtimeConfig,
        transport: &dyn Transport,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        let key = options.user.id.clone();
        let topic = presence_topic(&options.room);
        let session = Arc::new_cyclic(|self_ref| Self {
            room: options.room,
            heartbeat_interval: options
                .heartbeat_interval
                .unwrap_or(config.presence_heartbeat),
            timeout: crate::clock::to_chrono(config.presence_timeout),
            scheduler,
            local: Mutex::new(options.user),
            roster: Mutex::new(HashMap::new()),
            channel: Mutex::new(None),
            heartbeat: Mutex::new(None),
            left: AtomicBool::new(false),
            on_sync: options.on_sync,
            on_join: options.on_join,
            on_leave: options.on_leave,
            self_ref: self_ref.clone(),
        });

        info!("Joining presence room {}", session.room);
        let listener = Arc::new(PresenceEvents {
            session: Arc::downgrade(&session),
        });
        let channel = transport.open_channel(&topic, Binding::Presence { key }, listener);
        *lock(&session.channel) = Some(channel);
        session
    }

    fn channel(&self) -> Result<Arc<dyn TransportChannel>, Error> {
        if self.left.load(Ordering::SeqCst) {
            return Err(presence_error(
                PresenceErrorKind::NotTracking,
                &format!("already left presence room {}", self.room),
            ));
        }
        lock(&self.channel).clone().ok_or_else(|| {
            presence_error(
                PresenceErrorKind::NotTracking,
                &format!("presence room {} has no channel", self.room),
            )
        })
    }

    /// Stamp the local user with the current time and serialize it.
    fn stamped_state(&self) -> Result<Value, Error> {
        let mut local = lock(&self.local);
        local.last_seen = self.scheduler.now();
        Ok(serde_json::to_value(&*local)?)
    }

    pub async fn track_local(&self) -> Result<(), Error> {
        let channel = self.channel()?;
        let state = self.stamped_state()?;
        channel.track(state).await
    }

    pub async fn update(&self, update: PresenceUpdate) -> Result<(), Error> {
        let channel = self.channel()?;
        update.apply(&mut lock(&self.local));
        let state = self.stamped_state()?;
        channel.track(state).await
    }

    pub async fn leave(&self) -> Result<(), Error> {
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_heartbeat();

        let channel = lock(&self.channel).take();
        let result = match channel {
            Some(channel) => {
                let untracked = channel.untrack().await;
                channel.close();
                untracked
            }
            None => Ok(()),
        };
        lock(&self.roster).clear();
        info!("Left presence room {}", self.room);
        result
    }

    pub fn start_heartbeat(&self) {
        let session = self.self_ref.clone();
        let own_timer: Arc<Mutex<Option<TimerHandle>>> = Arc::new(Mutex::new(None));
        let tick_timer = Arc::clone(&own_timer);
        let timer = self.scheduler.schedule_repeating(
            self.heartbeat_interval,
            Arc::new(move || match session.upgrade() {
                Some(session) => session.heartbeat(),
                None => {
                    if let Some(timer) = lock(&tick_timer).take() {
                        timer.cancel();
                    }
                }
            }),
        );
        *lock(&own_timer) = Some(timer.clone());
        if let Some(previous) = lock(&self.heartbeat).replace(timer) {
            previous.cancel();
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(timer) = lock(&self.heartbeat).take() {
            timer.cancel();
        }
    }

    fn heartbeat(&self) {
        if self.left.load(Ordering::SeqCst) {
            return;
        }

        let evicted = self.evict_stale();
        if !evicted.is_empty() {
            for user in &evicted {
                debug!("Presence timeout for {} in {}", user.id, self.room);
                self.notify_leave(user);
            }
            self.notify_sync();
        }

        let (channel, state) = match (self.channel(), self.stamped_state()) {
            (Ok(channel), Ok(state)) => (channel, state),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Presence heartbeat for {} skipped: {e}", self.room);
                return;
            }
        };
        let room = self.room.clone();
        self.scheduler.spawn(Box::pin(async move {
            if let Err(e) = channel.track(state).await {
                warn!("Presence heartbeat for {room} failed: {e}");
            }
        }));
    }

    fn is_stale(&self, user: &PresenceUser, local_id: &str, now: DateTime<Utc>) -> bool {
        user.id != local_id && now - user.last_seen > self.timeout
    }

    fn evict_stale(&self) -> Vec<PresenceUser> {
        let now = self.scheduler.now();
        let local_id = lock(&self.local).id.clone();
        let mut roster = lock(&self.roster);

        let stale: Vec<String> = roster
            .iter()
            .filter(|(_, user)| self.is_stale(user, &local_id, now))
            .map(|(key, _)| key.clone())
            .collect();
        stale
            .iter()
            .filter_map(|key| roster.remove(key))
            .collect()
    }

    fn apply_sync(&self, state: HashMap<String, Vec<Value>>) {
        let now = self.scheduler.now();
        let local_id = lock(&self.local).id.clone();

        let mut next = HashMap::new();
        for (key, presences) in state {
            let Some(latest) = presences.into_iter().last() else {
                continue;
            };
            match serde_json::from_value::<PresenceUser>(latest) {
                Ok(user) if !self.is_stale(&user, &local_id, now) => {
                    next.insert(key, user);
                }
                Ok(user) => trace!("Skipping stale presence for {}", user.id),
                Err(e) => warn!("Malformed presence state for {key} in {}: {e}", self.room),
            }
        }

        let (joined, left) = {
            let mut roster = lock(&self.roster);
            let before: HashSet<&String> = roster.keys().collect();
            let after: HashSet<&String> = next.keys().collect();
            let joined: Vec<PresenceUser> = after
                .difference(&before)
                .filter_map(|key| next.get(*key).cloned())
                .collect();
            let left: Vec<PresenceUser> = before
                .difference(&after)
                .filter_map(|key| roster.get(*key).cloned())
                .collect();
            *roster = next;
            (joined, left)
        };

        for user in &joined {
            self.notify_join(user);
        }
        for user in &left {
            self.notify_leave(user);
        }
        self.notify_sync();
    }

    fn apply_join(&self, key: String, presences: Vec<Value>) {
        let Some(latest) = presences.into_iter().last() else {
            return;
        };
        let user = match serde_json::from_value::<PresenceUser>(latest) {
            Ok(user) => user,
            Err(e) => {
                warn!("Malformed presence join for {key} in {}: {e}", self.room);
                return;
            }
        };

        let is_new = lock(&self.roster).insert(key, user.clone()).is_none();
        if is_new {
            self.notify_join(&user);
        }
    }

    fn apply_leave(&self, key: &str) {
        let removed = lock(&self.roster).remove(key);
        if let Some(user) = removed {
            self.notify_leave(&user);
        }
    }

    fn notify_join(&self, user: &PresenceUser) {
        if let Some(on_join) = &self.on_join {
            on_join(user);
        }
    }

    fn notify_leave(&self, user: &PresenceUser) {
        if let Some(on_leave) = &self.on_leave {
            on_leave(user);
        }
    }

    fn notify_sync(&self) {
        if let Some(on_sync) = &self.on_sync {
            let users = self.users();
            on_sync(&users);
        }
    }

    /// Roster sorted by user id.
    pub fn users(&self) -> Vec<PresenceUser> {
        let mut users: Vec<PresenceUser> = lock(&self.roster).values().cloned().collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }

    pub fn local_user(&self) -> PresenceUser {
        lock(&self.local).clone()
    }
}

impl Overlay for PresenceSession {
    fn shutdown(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_heartbeat();
        if let Some(channel) = lock(&self.channel).take() {
            channel.close();
        }
        lock(&self.roster).clear();
        debug!("Presence room {} shut down", self.room);
    }
}

impl Drop for PresenceSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct PresenceEvents {
    session: Weak<PresenceSession>,
}

impl ChannelListener for PresenceEvents {
    fn on_message(&self, message: ChannelMessage) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if session.left.load(Ordering::SeqCst) {
            return;
        }
        match message {
            ChannelMessage::PresenceSync { state } => session.apply_sync(state),
            ChannelMessage::PresenceJoin { key, presences } => session.apply_join(key, presences),
            ChannelMessage::PresenceLeave { key, .. } => session.apply_leave(&key),
            other => trace!("Ignoring {:?} on presence room {}", other, session.room),
        }
    }

    fn on_status(&self, status: ChannelStatus, detail: Option<String>) {
        if let Some(session) = self.session.upgrade() {
            match status {
                ChannelStatus::ChannelError | ChannelStatus::TimedOut => warn!(
                    "Presence room {} reported {status}: {}",
                    session.room,
                    detail.unwrap_or_default()
                ),
                _ => debug!("Presence room {} {status}", session.room),
            }
        }
    }
}

/// Caller-side handle for a tracked presence room.
#[derive(Clone)]
pub struct PresenceHandle {
    session: Arc<PresenceSession>,
}

impl PresenceHandle {
    pub(crate) fn new(session: Arc<PresenceSession>) -> Self {
        Self { session }
    }

    pub fn room(&self) -> &str {
        &self.session.room
    }

    /// Everyone currently in the room, the local user included.
    pub fn get_users(&self) -> Vec<PresenceUser> {
        self.session.users()
    }

    pub fn local_user(&self) -> PresenceUser {
        self.session.local_user()
    }

    /// Merge `update` into the local user and re-track immediately.
    pub async fn update(&self, update: PresenceUpdate) -> Result<(), Error> {
        self.session.update(update).await
    }

    /// Untrack and close the room. Later calls are no-ops.
    pub async fn leave(&self) -> Result<(), Error> {
        self.session.leave().await
    }
}
