use chrono::Utc;
use events::ChangePayload;
use log::*;
use realtime::transport::ChannelStatus;
use realtime::{
    LoopbackTransport, PresenceOptions, PresenceUser, SubscriptionConfig, TokioScheduler,
    TypingOptions,
};
use serde_json::json;
use service::{config::Config, logging::Logger, AppState};
use std::sync::Arc;
use std::time::Duration;

const FEED_TOPIC: &str = "realtime:public:posts";
const ROOM: &str = "community-feed";

// Development harness: runs the realtime manager over the in-memory loopback
// transport and feeds it a scripted stream of post changes, presence and
// typing traffic, with a channel failure every few seconds.
#[tokio::main]
async fn main() {
    let config = Config::new();
    if let Err(e) = Logger::init_logger(&config) {
        eprintln!("Failed to start logger: {e}");
    }

    info!(
        "Starting realtime harness [{}] for {:?}...",
        config.runtime_env(),
        config.harness_duration()
    );

    let transport = LoopbackTransport::new();
    let app_state = AppState::init(
        config.clone(),
        Arc::new(transport.clone()),
        Arc::new(TokioScheduler::current()),
    );
    let manager = Arc::clone(&app_state.realtime);

    let mut status = manager.watch_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            info!("Realtime status: {}", *status.borrow_and_update());
        }
    });

    let feed = manager.subscribe(
        SubscriptionConfig::new("posts", |change| {
            let title = change
                .record()
                .and_then(|record| record["title"].as_str())
                .unwrap_or("untitled");
            info!("{} on posts: {title}", change.event_type);
            Ok(())
        })
        .on_error(|e| warn!("Feed subscriber failed: {e}")),
    );
    let watched = manager.subscribe(
        SubscriptionConfig::new("posts", |change| {
            info!("Watched post changed ({})", change.event_type);
            Ok(())
        })
        .filter("id=eq.5"),
    );

    let presence = match manager
        .track_presence(
            PresenceOptions::new(ROOM, PresenceUser::new("harness").with_name("Harness"))
                .on_join(|user| info!("{} joined {ROOM}", user.id))
                .on_leave(|user| info!("{} left {ROOM}", user.id)),
        )
        .await
    {
        Ok(presence) => presence,
        Err(e) => {
            error!("Failed to join presence room: {e}");
            std::process::exit(1);
        }
    };

    let typing = match manager.create_typing_indicator(
        TypingOptions::new(ROOM, "harness").on_typing_change(|users| {
            let names: Vec<&str> = users.iter().map(|u| u.user_id.as_str()).collect();
            info!("Typing in {ROOM}: {names:?}");
        }),
    ) {
        Ok(typing) => typing,
        Err(e) => {
            error!("Failed to create typing indicator: {e}");
            std::process::exit(1);
        }
    };

    let deadline = tokio::time::Instant::now() + config.harness_duration();
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let mut id: u64 = 0;
    while tokio::time::Instant::now() < deadline {
        ticker.tick().await;
        id += 1;

        let post = json!({"id": id, "title": format!("Fresh loaves #{id}")});
        transport.publish_change(
            ChangePayload::insert("public", "posts", post).committed_at(Utc::now()),
        );

        match id % 12 {
            2 => transport.join_presence(
                &format!("presence:{ROOM}"),
                "neighbour",
                json!({"id": "neighbour", "name": "Neighbour", "lastSeen": Utc::now()}),
            ),
            4 => {
                transport.broadcast(
                    &format!("typing:{ROOM}"),
                    "typing",
                    json!({"userId": "neighbour", "isTyping": true}),
                );
            }
            6 => typing.start_typing(),
            8 => {
                transport.fail_channel(FEED_TOPIC, ChannelStatus::ChannelError);
            }
            10 => {
                transport.leave_presence(&format!("presence:{ROOM}"), "neighbour");
            }
            _ => {}
        }
    }

    match realtime::debug::metrics_json() {
        Some(metrics) => info!("Realtime metrics: {metrics}"),
        None => info!("Realtime metrics: {:?}", manager.get_metrics()),
    }
    info!("Connection quality: {}", manager.get_connection_quality());
    info!("Users in {ROOM}: {}", presence.get_users().len());

    feed.unsubscribe();
    watched.unsubscribe();
    typing.destroy();
    if let Err(e) = presence.leave().await {
        warn!("Failed to leave presence room: {e}");
    }
    app_state.shutdown();
}
