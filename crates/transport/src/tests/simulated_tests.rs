use futures::StreamExt;

use super::*;

#[tokio::test]
async fn reply_mode_confirms_synchronously() {
    let transport = SimulatedTransport::new(Confirmation::Reply);
    let delivery = transport
        .send(DeviceKey::Kitchen, SwitchAction::On)
        .await
        .expect("send");
    assert_eq!(delivery, Delivery::Confirmed(SwitchAction::On));
    assert_eq!(transport.lamp(DeviceKey::Kitchen), Some(SwitchAction::On));
    assert_eq!(
        transport.sent_commands(),
        vec![(DeviceKey::Kitchen, SwitchAction::On)]
    );
}

#[tokio::test]
async fn delayed_mode_confirms_through_feed() {
    let transport = SimulatedTransport::new(Confirmation::Delayed(Duration::from_millis(20)));
    let mut observations = transport.subscribe();

    let delivery = transport
        .send(DeviceKey::Guest, SwitchAction::Off)
        .await
        .expect("send");
    assert_eq!(delivery, Delivery::Dispatched);

    let observation = tokio::time::timeout(Duration::from_secs(1), observations.next())
        .await
        .expect("confirmation")
        .expect("open stream");
    assert_eq!(
        observation,
        Observation {
            device: DeviceKey::Guest,
            state: SwitchAction::Off,
        }
    );
}

#[tokio::test]
async fn stuck_relay_reports_its_own_state() {
    let transport = SimulatedTransport::new(Confirmation::Reply);
    transport.stick(DeviceKey::Dining, SwitchAction::Off);

    let delivery = transport
        .send(DeviceKey::Dining, SwitchAction::On)
        .await
        .expect("send");
    assert_eq!(delivery, Delivery::Confirmed(SwitchAction::Off));
}

#[tokio::test]
async fn offline_bridge_fails_fast_without_recording() {
    let transport = SimulatedTransport::new(Confirmation::Reply);
    let mut status = transport.watch_connection();
    transport.set_online(false);
    assert!(status.has_changed().expect("alive"));
    assert_eq!(*status.borrow_and_update(), ConnectionStatus::Offline);

    let err = transport
        .send(DeviceKey::Kitchen, SwitchAction::On)
        .await
        .expect_err("offline");
    assert!(matches!(err, TransportError::Connection(_)));
    assert!(transport.sent_commands().is_empty());
    assert!(transport.read(DeviceKey::Kitchen).await.is_err());
}

#[tokio::test]
async fn external_reports_reach_subscribers() {
    let transport = SimulatedTransport::new(Confirmation::Silent);
    let mut observations = transport.subscribe();
    transport.report(DeviceKey::Kitchen, SwitchAction::On);

    assert_eq!(
        observations.next().await,
        Some(Observation {
            device: DeviceKey::Kitchen,
            state: SwitchAction::On,
        })
    );
    assert_eq!(
        transport.read(DeviceKey::Kitchen).await.expect("read"),
        Some(SwitchAction::On)
    );

    transport.close().await;
    assert_eq!(observations.next().await, None);
}
