use shared::domain::{DeviceKey, LampState, SwitchAction};
use transport::TransportSettings;

use super::*;

fn in_memory(mode: TransportMode) -> Settings {
    Settings {
        database_url: "sqlite::memory:".into(),
        transport: TransportSettings {
            mode,
            simulated_delay_ms: 10,
            ..TransportSettings::default()
        },
        ..Settings::default()
    }
}

#[tokio::test]
async fn builds_state_for_simulated_transport() {
    let state = build_state(&in_memory(TransportMode::Simulated))
        .await
        .expect("state");

    let snapshot = state.api.reconciler.snapshot().await;
    assert!(snapshot.connection.is_connected());
    assert!(snapshot
        .devices
        .iter()
        .all(|device| device.state == LampState::Unknown));
    state.api.storage.health_check().await.expect("db");
}

#[tokio::test]
async fn started_reconciler_consumes_delayed_confirmations() {
    let state = build_state(&in_memory(TransportMode::Simulated))
        .await
        .expect("state");

    state
        .api
        .reconciler
        .issue(DeviceKey::Dining, SwitchAction::On)
        .await
        .expect("issue");

    tokio::time::timeout(std::time::Duration::from_secs(2), async {
        while state.api.reconciler.state(DeviceKey::Dining).await.is_pending() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("confirmation consumed");
    assert_eq!(
        state.api.reconciler.state(DeviceKey::Dining).await.state,
        LampState::On
    );
}

#[tokio::test]
async fn unreachable_bridge_does_not_block_startup() {
    let mut settings = in_memory(TransportMode::Direct);
    settings.transport.bridge_url = "http://127.0.0.1:9".into();
    settings.transport.request_timeout_ms = 200;

    let state = build_state(&settings).await.expect("state");
    assert_eq!(
        state.api.reconciler.state(DeviceKey::Kitchen).await.state,
        LampState::Unknown
    );
}
