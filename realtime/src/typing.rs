//! Typing indicators over a broadcast channel, topic `typing:{room}`.

use crate::clock::{Scheduler, TimerHandle};
use crate::config::RealtimeConfig;
use crate::lock;
use crate::manager::Overlay;
use crate::transport::{Binding, ChannelListener, ChannelMessage, ChannelStatus, Transport, TransportChannel};
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// Broadcast event name for typing signals.
pub const TYPING_EVENT: &str = "typing";

/// Someone else typing in the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: String,
    pub user_name: Option<String>,
}

/// Called with the full list of remote typers whenever it changes.
pub type TypingCallback = Arc<dyn Fn(&[TypingUser]) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingSignal {
    user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_name: Option<String>,
    is_typing: bool,
}

/// Parameters for `RealtimeManager::create_typing_indicator`.
#[derive(Clone)]
pub struct TypingOptions {
    pub room: String,
    pub user_id: String,
    pub user_name: Option<String>,
    /// Falls back to `RealtimeConfig::typing_timeout`.
    pub typing_timeout: Option<Duration>,
    on_typing_change: Option<TypingCallback>,
}

impl TypingOptions {
    pub fn new(room: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            user_id: user_id.into(),
            user_name: None,
            typing_timeout: None,
            on_typing_change: None,
        }
    }

    pub fn user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    pub fn typing_timeout(mut self, timeout: Duration) -> Self {
        self.typing_timeout = Some(timeout);
        self
    }

    pub fn on_typing_change(mut self, f: impl Fn(&[TypingUser]) + Send + Sync + 'static) -> Self {
        self.on_typing_change = Some(Arc::new(f));
        self
    }
}

pub fn typing_topic(room: &str) -> String {
    format!("typing:{room}")
}

#[derive(Default)]
struct LocalTyping {
    typing: bool,
    stop_timer: Option<TimerHandle>,
}

struct RemoteTyper {
    user: TypingUser,
    expiry: TimerHandle,
}

pub(crate) struct TypingSession {
    room: String,
    user_id: String,
    user_name: Option<String>,
    timeout: Duration,
    scheduler: Arc<dyn Scheduler>,
    channel: Mutex<Option<Arc<dyn TransportChannel>>>,
    local: Mutex<LocalTyping>,
    remote: Mutex<BTreeMap<String, RemoteTyper>>,
    destroyed: AtomicBool,
    on_typing_change: Option<TypingCallback>,
    self_ref: Weak<TypingSession>,
}

impl TypingSession {
    pub fn open(
        options: TypingOptions,
        config: &RealtimeConfig,
        transport: &dyn Transport,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        let topic = typing_topic(&options.room);
        let session = Arc::new_cyclic(|self_ref| Self {
            room: options.room,
            user_id: options.user_id,
            user_name: options.user_name,
            timeout: options.typing_timeout.unwrap_or(config.typing_timeout),
            scheduler,
            channel: Mutex::new(None),
            local: Mutex::new(LocalTyping::default()),
            remote: Mutex::new(BTreeMap::new()),
            destroyed: AtomicBool::new(false),
            on_typing_change: options.on_typing_change,
            self_ref: self_ref.clone(),
        });

        let listener = Arc::new(TypingEvents {
            session: Arc::downgrade(&session),
        });
        let channel = transport.open_channel(
            &topic,
            Binding::Broadcast { receive_own: false },
            listener,
        );
        *lock(&session.channel) = Some(channel);
        debug!("Typing indicator for {} opened in {}", session.user_id, session.room);
        session
    }

    pub fn start_typing(&self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let session = self.self_ref.clone();
        let stop_timer = self.scheduler.schedule(
            self.timeout,
            Box::new(move || {
                if let Some(session) = session.upgrade() {
                    session.stop_typing();
                }
            }),
        );

        let announce = {
            let mut local = lock(&self.local);
            if let Some(previous) = local.stop_timer.replace(stop_timer) {
                previous.cancel();
            }
            !std::mem::replace(&mut local.typing, true)
        };
        if announce {
            self.send(true);
        }
    }

    pub fn stop_typing(&self) {
        let was_typing = {
            let mut local = lock(&self.local);
            if let Some(timer) = local.stop_timer.take() {
                timer.cancel();
            }
            std::mem::replace(&mut local.typing, false)
        };
        if was_typing && !self.destroyed.load(Ordering::SeqCst) {
            self.send(false);
        }
    }

    pub fn is_typing(&self) -> bool {
        lock(&self.local).typing
    }

    fn signal(&self, is_typing: bool) -> TypingSignal {
        TypingSignal {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            is_typing,
        }
    }

    fn send(&self, is_typing: bool) {
        let Some(channel) = lock(&self.channel).clone() else {
            return;
        };
        let payload = match serde_json::to_value(self.signal(is_typing)) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize typing signal: {e}");
                return;
            }
        };

        let room = self.room.clone();
        self.scheduler.spawn(Box::pin(async move {
            if let Err(e) = channel.send(TYPING_EVENT, payload).await {
                warn!("Typing signal in {room} not sent: {e}");
            }
        }));
    }

    fn on_signal(&self, signal: TypingSignal) {
        if signal.user_id == self.user_id {
            return;
        }

        let changed = if signal.is_typing {
            let session = self.self_ref.clone();
            let user_id = signal.user_id.clone();
            let expiry = self.scheduler.schedule(
                self.timeout,
                Box::new(move || {
                    if let Some(session) = session.upgrade() {
                        session.expire(&user_id);
                    }
                }),
            );
            let typer = RemoteTyper {
                user: TypingUser {
                    user_id: signal.user_id.clone(),
                    user_name: signal.user_name,
                },
                expiry,
            };
            match lock(&self.remote).insert(signal.user_id, typer) {
                Some(previous) => {
                    previous.expiry.cancel();
                    false
                }
                None => true,
            }
        } else {
            self.remove(&signal.user_id)
        };

        if changed {
            self.notify();
        }
    }

    fn expire(&self, user_id: &str) {
        if self.remove(user_id) {
            trace!("Typing entry for {user_id} in {} expired", self.room);
            self.notify();
        }
    }

    fn remove(&self, user_id: &str) -> bool {
        match lock(&self.remote).remove(user_id) {
            Some(typer) => {
                typer.expiry.cancel();
                true
            }
            None => false,
        }
    }

    fn notify(&self) {
        if let Some(on_typing_change) = &self.on_typing_change {
            let users = self.typing_users();
            on_typing_change(&users);
        }
    }

    /// Remote users currently typing, ordered by user id.
    pub fn typing_users(&self) -> Vec<TypingUser> {
        lock(&self.remote)
            .values()
            .map(|typer| typer.user.clone())
            .collect()
    }

    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let was_typing = {
            let mut local = lock(&self.local);
            if let Some(timer) = local.stop_timer.take() {
                timer.cancel();
            }
            std::mem::replace(&mut local.typing, false)
        };
        let remote = std::mem::take(&mut *lock(&self.remote));
        for typer in remote.values() {
            typer.expiry.cancel();
        }

        let Some(channel) = lock(&self.channel).take() else {
            return;
        };
        let farewell = if was_typing {
            serde_json::to_value(self.signal(false)).ok()
        } else {
            None
        };
        let room = self.room.clone();
        self.scheduler.spawn(Box::pin(async move {
            if let Some(payload) = farewell {
                if let Err(e) = channel.send(TYPING_EVENT, payload).await {
                    warn!("Final typing signal in {room} not sent: {e}");
                }
            }
            channel.close();
        }));
        debug!("Typing indicator for {} in {} destroyed", self.user_id, self.room);
    }
}

impl Overlay for TypingSession {
    fn shutdown(&self) {
        self.destroy();
    }
}

impl Drop for TypingSession {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct TypingEvents {
    session: Weak<TypingSession>,
}

impl ChannelListener for TypingEvents {
    fn on_message(&self, message: ChannelMessage) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if session.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let ChannelMessage::Broadcast { event, payload } = message else {
            return;
        };
        if event != TYPING_EVENT {
            return;
        }

        match serde_json::from_value::<TypingSignal>(payload) {
            Ok(signal) => session.on_signal(signal),
            Err(e) => warn!("Malformed typing signal in {}: {e}", session.room),
        }
    }

    fn on_status(&self, status: ChannelStatus, detail: Option<String>) {
        if let Some(session) = self.session.upgrade() {
            match status {
                ChannelStatus::ChannelError | ChannelStatus::TimedOut => warn!(
                    "Typing channel {} reported {status}: {}",
                    session.room,
                    detail.unwrap_or_default()
                ),
                _ => trace!("Typing channel {} {status}", session.room),
            }
        }
    }
}

/// Caller-side handle for a typing indicator.
#[derive(Clone)]
pub struct TypingIndicator {
    session: Arc<TypingSession>,
}

impl TypingIndicator {
    pub(crate) fn new(session: Arc<TypingSession>) -> Self {
        Self { session }
    }

    /// Announce typing on the first call and (re)arm the auto-stop timer.
    pub fn start_typing(&self) {
        self.session.start_typing();
    }

    /// Announce that typing stopped, if it was announced.
    pub fn stop_typing(&self) {
        self.session.stop_typing();
    }

    pub fn is_typing(&self) -> bool {
        self.session.is_typing()
    }

    pub fn get_typing_users(&self) -> Vec<TypingUser> {
        self.session.typing_users()
    }

    pub fn destroy(&self) {
        self.session.destroy();
    }
}
