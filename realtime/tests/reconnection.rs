use realtime::transport::ChannelStatus;
use realtime::{
    BackoffPolicy, ConnectionQuality, ConnectionStatus, LoopbackTransport, ManualClock,
    RealtimeConfig, RealtimeManager, SubscriptionConfig,
};
use std::sync::Arc;
use std::time::Duration;

const TOPIC: &str = "realtime:public:posts";

fn setup(config: RealtimeConfig) -> (Arc<RealtimeManager>, LoopbackTransport, Arc<ManualClock>) {
    let transport = LoopbackTransport::new();
    let clock = Arc::new(ManualClock::new());
    let manager = RealtimeManager::init(config, Arc::new(transport.clone()), clock.clone());
    manager.subscribe(SubscriptionConfig::new("posts", |_| Ok(())));
    (manager, transport, clock)
}

#[test]
fn backoff_doubles_until_cap_then_gives_up() {
    let (manager, transport, clock) = setup(RealtimeConfig::default());
    assert_eq!(manager.get_status(), ConnectionStatus::Connected);

    // Reopened channels never acknowledge, so every retry fails again.
    transport.set_manual_ack(true);

    let expected = [
        1000, 2000, 4000, 8000, 16000, 30000, 30000, 30000, 30000, 30000,
    ];
    for (attempt, delay) in expected.iter().enumerate() {
        let opened = transport.total_opened();
        transport.fail_channel(TOPIC, ChannelStatus::ChannelError);
        assert_eq!(manager.get_status(), ConnectionStatus::Reconnecting);

        clock.advance(Duration::from_millis(delay - 1));
        assert_eq!(
            transport.total_opened(),
            opened,
            "attempt {} reopened early",
            attempt + 1
        );

        clock.advance(Duration::from_millis(1));
        assert_eq!(
            transport.total_opened(),
            opened + 1,
            "attempt {} did not reopen after {delay} ms",
            attempt + 1
        );
        assert_eq!(transport.open_channels(TOPIC), 1);
    }

    transport.fail_channel(TOPIC, ChannelStatus::TimedOut);
    assert_eq!(manager.get_status(), ConnectionStatus::Error);
    assert_eq!(transport.open_channels(TOPIC), 0);

    clock.advance(Duration::from_secs(600));
    assert_eq!(transport.total_opened(), 11);
    assert_eq!(manager.get_status(), ConnectionStatus::Error);

    let metrics = manager.get_metrics();
    assert_eq!(metrics.reconnect_count, 10);
    assert_eq!(metrics.uptime_ms, 0);
    assert_eq!(manager.get_connection_quality(), ConnectionQuality::Poor);
}

#[test]
fn successful_resubscribe_resets_attempts() {
    let (manager, transport, clock) = setup(RealtimeConfig::default());

    transport.fail_channel(TOPIC, ChannelStatus::ChannelError);
    clock.advance(Duration::from_millis(1000));
    assert_eq!(manager.get_status(), ConnectionStatus::Connected);

    transport.fail_channel(TOPIC, ChannelStatus::ChannelError);
    clock.advance(Duration::from_millis(1000));
    assert_eq!(manager.get_status(), ConnectionStatus::Connected);
    assert_eq!(transport.total_opened(), 3);

    let metrics = manager.get_metrics();
    assert_eq!(metrics.reconnect_count, 2);
    assert_eq!(manager.get_connection_quality(), ConnectionQuality::Good);
}

#[test]
fn repeated_failure_while_pending_schedules_one_reconnect() {
    let (manager, transport, clock) = setup(RealtimeConfig::default());

    transport.fail_channel(TOPIC, ChannelStatus::ChannelError);
    transport.fail_channel(TOPIC, ChannelStatus::TimedOut);
    clock.advance(Duration::from_secs(5));

    assert_eq!(transport.total_opened(), 2);
    assert_eq!(manager.get_metrics().reconnect_count, 1);
    assert_eq!(manager.get_status(), ConnectionStatus::Connected);
}

#[test]
fn reconnect_replays_recorded_filter() {
    let transport = LoopbackTransport::new();
    let clock = Arc::new(ManualClock::new());
    let manager = RealtimeManager::init(
        RealtimeConfig::default(),
        Arc::new(transport.clone()),
        clock.clone(),
    );
    manager.subscribe(SubscriptionConfig::new("posts", |_| Ok(())).filter("id=eq.5"));

    let topic = "realtime:public:posts:id=eq.5";
    transport.fail_channel(topic, ChannelStatus::ChannelError);
    clock.advance(Duration::from_millis(1000));

    assert_eq!(transport.open_channels(topic), 1);
    assert_eq!(transport.total_opened(), 2);
}

#[test]
fn unsubscribing_during_backoff_cancels_reconnect() {
    let transport = LoopbackTransport::new();
    let clock = Arc::new(ManualClock::new());
    let manager = RealtimeManager::init(
        RealtimeConfig::default(),
        Arc::new(transport.clone()),
        clock.clone(),
    );
    let handle = manager.subscribe(SubscriptionConfig::new("posts", |_| Ok(())));

    transport.fail_channel(TOPIC, ChannelStatus::ChannelError);
    handle.unsubscribe();
    clock.advance(Duration::from_secs(5));

    assert_eq!(transport.total_opened(), 1);
    assert_eq!(transport.channel_count(), 0);
    assert_eq!(manager.get_status(), ConnectionStatus::Disconnected);
}

#[test]
fn terminal_error_survives_last_unsubscribe_until_disconnect() {
    let config = RealtimeConfig {
        backoff: BackoffPolicy {
            max_attempts: 1,
            ..BackoffPolicy::default()
        },
        ..RealtimeConfig::default()
    };
    let transport = LoopbackTransport::new();
    let clock = Arc::new(ManualClock::new());
    let manager = RealtimeManager::init(config, Arc::new(transport.clone()), clock.clone());
    let handle = manager.subscribe(SubscriptionConfig::new("posts", |_| Ok(())));

    transport.set_manual_ack(true);
    transport.fail_channel(TOPIC, ChannelStatus::ChannelError);
    clock.advance(Duration::from_millis(1000));
    transport.fail_channel(TOPIC, ChannelStatus::ChannelError);
    assert_eq!(manager.get_status(), ConnectionStatus::Error);

    handle.unsubscribe();
    assert_eq!(manager.get_status(), ConnectionStatus::Error);

    manager.disconnect();
    assert_eq!(manager.get_status(), ConnectionStatus::Disconnected);
}
