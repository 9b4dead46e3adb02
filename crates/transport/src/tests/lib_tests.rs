use super::*;
use futures::StreamExt;

#[test]
fn settings_build_registry_with_overrides() {
    let mut settings = TransportSettings {
        base_topic: "home/lights".into(),
        ..TransportSettings::default()
    };
    settings.devices.insert(DeviceKey::Kitchen, "dapur".into());

    let registry = settings.registry();
    assert_eq!(registry.command_topic(DeviceKey::Kitchen), "home/lights/dapur/set");
    assert_eq!(registry.status_topic(DeviceKey::Guest), "home/lights/guest/status");
}

#[test]
fn invalid_urls_are_configuration_errors() {
    let settings = TransportSettings {
        bridge_url: "not a url".into(),
        broker_url: "::".into(),
        ..TransportSettings::default()
    };
    assert!(matches!(settings.direct_config(), Err(TransportError::Config(_))));
    assert!(matches!(settings.broadcast_config(), Err(TransportError::Config(_))));
}

#[test]
fn zero_poll_interval_disables_polling() {
    let config = TransportSettings::default().direct_config().expect("config");
    assert_eq!(config.poll_interval, None);

    let config = TransportSettings {
        poll_interval_ms: 500,
        ..TransportSettings::default()
    }
    .direct_config()
    .expect("config");
    assert_eq!(config.poll_interval, Some(Duration::from_millis(500)));
}

#[test]
fn errors_map_to_failure_reasons() {
    assert_eq!(
        TransportError::Timeout(Duration::from_secs(1)).failure_reason(),
        FailureReason::Timeout
    );
    assert_eq!(
        TransportError::Connection("refused".into()).failure_reason(),
        FailureReason::Connection
    );
    assert_eq!(
        TransportError::Rejected("500".into()).failure_reason(),
        FailureReason::Rejected
    );
}

#[tokio::test]
async fn closing_feed_ends_subscriptions() {
    let feed = Feed::new(ConnectionStatus::Connected);
    let mut early = feed.subscribe();
    feed.publish(Observation {
        device: DeviceKey::Dining,
        state: SwitchAction::On,
    });
    feed.close();

    assert_eq!(
        early.next().await,
        Some(Observation {
            device: DeviceKey::Dining,
            state: SwitchAction::On,
        })
    );
    assert_eq!(early.next().await, None);
    assert_eq!(feed.subscribe().next().await, None);
    assert_eq!(feed.status(), ConnectionStatus::Offline);
    assert!(feed.ensure_open().is_err());
}

#[tokio::test]
async fn status_watch_only_fires_on_change() {
    let feed = Feed::new(ConnectionStatus::Connecting);
    let mut watch = feed.watch();
    feed.set_status(ConnectionStatus::Connecting);
    assert!(!watch.has_changed().expect("sender alive"));

    feed.set_status(ConnectionStatus::Connected);
    assert!(watch.has_changed().expect("sender alive"));
    assert_eq!(*watch.borrow_and_update(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn connect_builds_configured_mode() {
    let transport = connect(&TransportSettings::default()).expect("simulated");
    assert_eq!(transport.mode(), TransportMode::Simulated);
    assert!(transport.connection_status().is_connected());

    let direct = connect(&TransportSettings {
        mode: TransportMode::Direct,
        bridge_url: "http://127.0.0.1:9".into(),
        ..TransportSettings::default()
    })
    .expect("direct");
    assert_eq!(direct.mode(), TransportMode::Direct);
    assert_eq!(direct.connection_status(), ConnectionStatus::Connecting);
}
