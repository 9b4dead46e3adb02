use super::*;

#[test]
fn flags_map_onto_transport_settings() {
    let args = Args::parse_from([
        "lampctl",
        "--mode",
        "broadcast",
        "--broker-url",
        "mqtts://broker.example:8883",
        "--base-topic",
        "rumah",
        "set",
        "kitchen",
        "on",
    ]);
    let settings = args.transport_settings();
    assert_eq!(settings.mode, TransportMode::Broadcast);
    assert_eq!(settings.broker_url, "mqtts://broker.example:8883");
    assert_eq!(settings.registry().status_topic(DeviceKey::Kitchen), "rumah/kitchen/status");
    assert!(matches!(
        args.command,
        Command::Set {
            device: DeviceKey::Kitchen,
            state: SwitchAction::On
        }
    ));
}

#[test]
fn unknown_device_is_rejected_by_the_parser() {
    let parsed = Args::try_parse_from(["lampctl", "toggle", "garage"]);
    assert!(parsed.is_err());
}

#[tokio::test]
async fn simulated_set_reports_confirmed_state() {
    let args = Args::parse_from(["lampctl", "--mode", "simulated", "set", "dining", "off"]);
    let settings = args.transport_settings();
    let transport = transport::connect(&settings).expect("transport");
    let reconciler = StateReconciler::new(
        transport.clone(),
        &settings.registry(),
        ReconcilerConfig::default(),
    );
    reconciler.start();

    run(&reconciler, &args).await.expect("run");
    assert_eq!(
        reconciler.state(DeviceKey::Dining).await.state.to_string(),
        "OFF"
    );
    reconciler.shutdown();
    transport.close().await;
}
