use realtime::error::{ErrorKind, PresenceErrorKind};
use realtime::{
    LoopbackTransport, ManualClock, PresenceOptions, PresenceUpdate, PresenceUser,
    RealtimeConfig, RealtimeManager, Scheduler, TypingOptions, TypingUser,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn setup() -> (Arc<RealtimeManager>, LoopbackTransport, Arc<ManualClock>) {
    let transport = LoopbackTransport::new();
    let clock = Arc::new(ManualClock::new());
    let manager = RealtimeManager::init(
        RealtimeConfig::default(),
        Arc::new(transport.clone()),
        clock.clone(),
    );
    (manager, transport, clock)
}

fn names() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
}

fn ids(users: &[PresenceUser]) -> Vec<String> {
    users.iter().map(|u| u.id.clone()).collect()
}

#[tokio::test]
async fn roster_follows_joins_and_leaves() {
    let (manager, transport, clock) = setup();
    let joined = names();
    let left = names();
    let (join_sink, leave_sink) = (Arc::clone(&joined), Arc::clone(&left));

    let handle = manager
        .track_presence(
            PresenceOptions::new("listing-42", PresenceUser::new("u1").with_name("Ada"))
                .on_join(move |u| join_sink.lock().unwrap().push(u.id.clone()))
                .on_leave(move |u| leave_sink.lock().unwrap().push(u.id.clone())),
        )
        .await
        .unwrap();
    assert_eq!(ids(&handle.get_users()), vec!["u1"]);

    transport.join_presence(
        "presence:listing-42",
        "u2",
        json!({"id": "u2", "name": "Grace", "lastSeen": clock.now()}),
    );
    assert_eq!(ids(&handle.get_users()), vec!["u1", "u2"]);
    assert_eq!(*joined.lock().unwrap(), vec!["u1", "u2"]);

    transport.leave_presence("presence:listing-42", "u2");
    assert_eq!(ids(&handle.get_users()), vec!["u1"]);
    assert_eq!(*left.lock().unwrap(), vec!["u2"]);
}

#[tokio::test]
async fn two_local_sessions_see_each_other() {
    let (manager, _transport, _clock) = setup();

    let ada = manager
        .track_presence(PresenceOptions::new("lobby", PresenceUser::new("ada")))
        .await
        .unwrap();
    let grace = manager
        .track_presence(PresenceOptions::new("lobby", PresenceUser::new("grace")))
        .await
        .unwrap();

    assert_eq!(ids(&ada.get_users()), vec!["ada", "grace"]);
    assert_eq!(ids(&grace.get_users()), vec!["ada", "grace"]);

    grace.leave().await.unwrap();
    assert_eq!(ids(&ada.get_users()), vec!["ada"]);
    assert!(grace.get_users().is_empty());
}

#[tokio::test]
async fn heartbeat_refreshes_local_and_evicts_stale_remote() {
    let (manager, transport, clock) = setup();
    let start = clock.now();
    let left = names();
    let sink = Arc::clone(&left);

    let handle = manager
        .track_presence(
            PresenceOptions::new("lobby", PresenceUser::new("u1"))
                .on_leave(move |u| sink.lock().unwrap().push(u.id.clone())),
        )
        .await
        .unwrap();
    transport.join_presence("presence:lobby", "ghost", json!({"id": "ghost", "lastSeen": start}));

    clock.advance(Duration::from_secs(60));
    assert_eq!(ids(&handle.get_users()), vec!["ghost", "u1"]);

    clock.advance(Duration::from_secs(30));
    assert_eq!(ids(&handle.get_users()), vec!["u1"]);
    assert_eq!(*left.lock().unwrap(), vec!["ghost"]);

    let local = handle.local_user();
    assert_eq!((local.last_seen - start).num_seconds(), 90);
    let tracked: PresenceUser =
        serde_json::from_value(transport.presence_state("presence:lobby")["u1"].clone()).unwrap();
    assert_eq!(tracked.last_seen, local.last_seen);
}

#[tokio::test]
async fn update_merges_and_retracks() {
    let (manager, transport, _clock) = setup();
    let handle = manager
        .track_presence(PresenceOptions::new(
            "lobby",
            PresenceUser::new("u1").with_name("Ada").with_activity("browsing"),
        ))
        .await
        .unwrap();

    handle
        .update(PresenceUpdate::activity("chatting"))
        .await
        .unwrap();

    let state = transport.presence_state("presence:lobby");
    assert_eq!(state["u1"]["activity"], "chatting");
    assert_eq!(state["u1"]["name"], "Ada");
}

#[tokio::test]
async fn leave_untracks_and_is_idempotent() {
    let (manager, transport, clock) = setup();
    let handle = manager
        .track_presence(PresenceOptions::new("lobby", PresenceUser::new("u1")))
        .await
        .unwrap();

    handle.leave().await.unwrap();
    handle.leave().await.unwrap();
    assert!(transport.presence_state("presence:lobby").is_empty());
    assert_eq!(transport.open_channels("presence:lobby"), 0);

    let err = handle
        .update(PresenceUpdate::activity("idle"))
        .await
        .unwrap_err();
    assert_eq!(
        err.error_kind,
        ErrorKind::Presence(PresenceErrorKind::NotTracking)
    );

    clock.advance(Duration::from_secs(120));
    assert!(transport.presence_state("presence:lobby").is_empty());
}

fn typing_flags(transport: &LoopbackTransport, room: &str) -> Vec<bool> {
    transport
        .broadcasts(&format!("typing:{room}"))
        .into_iter()
        .map(|(_, payload)| payload["isTyping"].as_bool().unwrap_or_default())
        .collect()
}

#[tokio::test]
async fn typing_is_announced_once_and_auto_stops() {
    let (manager, transport, clock) = setup();
    let typing = manager
        .create_typing_indicator(TypingOptions::new("chat-9", "u1").user_name("Ada"))
        .unwrap();

    typing.start_typing();
    typing.start_typing();
    typing.start_typing();
    assert!(typing.is_typing());
    assert_eq!(typing_flags(&transport, "chat-9"), vec![true]);

    clock.advance(Duration::from_millis(2999));
    assert!(typing.is_typing());

    clock.advance(Duration::from_millis(1));
    assert!(!typing.is_typing());
    assert_eq!(typing_flags(&transport, "chat-9"), vec![true, false]);
}

#[tokio::test]
async fn start_typing_renews_the_timeout() {
    let (manager, transport, clock) = setup();
    let typing = manager
        .create_typing_indicator(TypingOptions::new("chat-9", "u1"))
        .unwrap();

    typing.start_typing();
    clock.advance(Duration::from_secs(2));
    typing.start_typing();
    clock.advance(Duration::from_secs(2));
    assert!(typing.is_typing());

    clock.advance(Duration::from_secs(1));
    assert!(!typing.is_typing());
    assert_eq!(typing_flags(&transport, "chat-9"), vec![true, false]);

    typing.stop_typing();
    assert_eq!(typing_flags(&transport, "chat-9"), vec![true, false]);
}

#[tokio::test]
async fn remote_typers_are_listed_and_expire() {
    let (manager, transport, clock) = setup();
    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);

    let ada = manager
        .create_typing_indicator(TypingOptions::new("chat-9", "ada").user_name("Ada"))
        .unwrap();
    let grace = manager
        .create_typing_indicator(
            TypingOptions::new("chat-9", "grace")
                .on_typing_change(move |users| sink.lock().unwrap().push(users.len())),
        )
        .unwrap();

    ada.start_typing();
    assert_eq!(
        grace.get_typing_users(),
        vec![TypingUser {
            user_id: "ada".to_string(),
            user_name: Some("Ada".to_string()),
        }]
    );
    assert!(ada.get_typing_users().is_empty());

    ada.stop_typing();
    assert!(grace.get_typing_users().is_empty());

    transport.broadcast("typing:chat-9", "typing", json!({"userId": "bob", "isTyping": true}));
    assert_eq!(grace.get_typing_users().len(), 1);
    clock.advance(Duration::from_secs(3));
    assert!(grace.get_typing_users().is_empty());

    assert_eq!(*changes.lock().unwrap(), vec![1, 0, 1, 0]);
}

#[tokio::test]
async fn destroy_sends_final_stop_and_closes() {
    let (manager, transport, _clock) = setup();
    let typing = manager
        .create_typing_indicator(TypingOptions::new("chat-9", "u1"))
        .unwrap();
    assert_eq!(transport.open_channels("typing:chat-9"), 1);

    typing.start_typing();
    typing.destroy();
    typing.destroy();
    typing.start_typing();

    assert_eq!(typing_flags(&transport, "chat-9"), vec![true, false]);
    assert_eq!(transport.open_channels("typing:chat-9"), 0);
}

#[tokio::test]
async fn disconnect_shuts_down_overlays() {
    let (manager, transport, _clock) = setup();
    let _presence = manager
        .track_presence(PresenceOptions::new("lobby", PresenceUser::new("u1")))
        .await
        .unwrap();
    let _typing = manager
        .create_typing_indicator(TypingOptions::new("lobby", "u1"))
        .unwrap();
    assert_eq!(transport.channel_count(), 2);

    manager.disconnect();

    assert_eq!(transport.channel_count(), 0);
    assert!(transport.presence_state("presence:lobby").is_empty());
}

#[tokio::test]
async fn dropped_presence_handle_leaves_the_room() {
    let (manager, transport, clock) = setup();
    let handle = manager
        .track_presence(PresenceOptions::new("lobby", PresenceUser::new("u1")))
        .await
        .unwrap();
    assert_eq!(clock.pending_timers(), 1);

    drop(handle);
    clock.advance(Duration::from_secs(3600));

    assert_eq!(clock.pending_timers(), 0);
    assert_eq!(transport.open_channels("presence:lobby"), 0);
    assert!(transport.presence_state("presence:lobby").is_empty());
}

#[tokio::test]
async fn dropped_typing_indicator_stops_and_closes() {
    let (manager, transport, clock) = setup();
    let typing = manager
        .create_typing_indicator(TypingOptions::new("chat-9", "u1"))
        .unwrap();
    typing.start_typing();

    drop(typing);

    assert_eq!(typing_flags(&transport, "chat-9"), vec![true, false]);
    assert_eq!(transport.open_channels("typing:chat-9"), 0);
    assert_eq!(clock.pending_timers(), 0);
}
