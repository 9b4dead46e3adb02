use shared::{
    domain::{LampState, Role, Uid},
    registry::DeviceRegistry,
};
use reconciler::ReconcilerConfig;
use transport::{Confirmation, SimulatedTransport};

use super::*;

pub(crate) struct Fixture {
    pub ctx: PanelContext,
    pub transport: Arc<SimulatedTransport>,
}

pub(crate) async fn fixture_with(confirmation: Confirmation, access: AccessConfig) -> Fixture {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let transport = SimulatedTransport::new(confirmation);
    let reconciler = StateReconciler::new(
        transport.clone(),
        &DeviceRegistry::default(),
        ReconcilerConfig::default(),
    );
    Fixture {
        ctx: PanelContext::new(storage, reconciler, access),
        transport,
    }
}

pub(crate) async fn fixture() -> Fixture {
    fixture_with(Confirmation::Reply, AccessConfig::default()).await
}

pub(crate) fn identity(uid: &str, email: &str) -> Identity {
    Identity {
        uid: Uid::new(uid),
        email: email.to_string(),
        display_name: None,
        photo_url: None,
    }
}

/// Signs in through the normal path after seeding the stored role.
pub(crate) async fn signed_in(ctx: &PanelContext, uid: &str, email: &str, role: Role) -> Session {
    let who = identity(uid, email);
    ctx.storage.ensure_profile(&who).await.expect("profile");
    ctx.storage.set_role(&who.uid, role).await.expect("role");
    let response = sign_in(ctx, &who).await.expect("sign in");
    ctx.access.verify(&response.token).expect("session")
}

#[tokio::test]
async fn first_sign_in_creates_user_session() {
    let Fixture { ctx, .. } = fixture().await;
    let response = sign_in(&ctx, &identity("uid-1", "rina@example.com"))
        .await
        .expect("sign in");
    assert_eq!(response.role, Role::User);

    let session = ctx.access.verify(&response.token).expect("token");
    assert_eq!(session.email, "rina@example.com");
    let view = session.view();
    assert!(view.can_control_lamps);
    assert!(!view.can_view_admin);
}

#[tokio::test]
async fn sign_in_requires_uid_and_email() {
    let Fixture { ctx, .. } = fixture().await;
    let err = sign_in(&ctx, &identity(" ", "nobody@example.com"))
        .await
        .expect_err("blank uid");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn user_command_is_logged_with_requested_action() {
    let Fixture { ctx, .. } = fixture().await;
    let session = signed_in(&ctx, "uid-2", "budi@example.com", Role::User).await;
    let mut events = ctx.reconciler.subscribe();

    let response = command_lamp(&ctx, Some(&session), DeviceKey::Kitchen, Some(SwitchAction::On))
        .await
        .expect("command");
    assert_eq!(response.status, "ON");

    let logs = ctx.audit.list().await.expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].actor_email, "budi@example.com");
    assert_eq!(logs[0].device, DeviceKey::Kitchen);
    assert_eq!(logs[0].action, SwitchAction::On);

    let mut appended = false;
    while let Ok(event) = events.try_recv() {
        appended |= matches!(event, PanelEvent::LogAppended { .. });
    }
    assert!(appended);
}

#[tokio::test]
async fn stuck_relay_logs_requested_action_not_reply() {
    let Fixture { ctx, transport } = fixture().await;
    let session = signed_in(&ctx, "uid-9", "rina@example.com", Role::User).await;
    transport.stick(DeviceKey::Kitchen, SwitchAction::Off);
    transport.stick(DeviceKey::Dining, SwitchAction::Off);

    let response = command_lamp(&ctx, Some(&session), DeviceKey::Kitchen, Some(SwitchAction::On))
        .await
        .expect("command");
    assert_eq!(response.status, "OFF");

    // Unknown lamp: the toggle target is ON even though the relay stays off.
    let response = command_lamp(&ctx, Some(&session), DeviceKey::Dining, None)
        .await
        .expect("toggle");
    assert_eq!(response.status, "OFF");

    let logs = ctx.audit.list().await.expect("logs");
    let actions: Vec<(DeviceKey, SwitchAction)> =
        logs.iter().map(|entry| (entry.device, entry.action)).collect();
    assert_eq!(
        actions,
        vec![
            (DeviceKey::Dining, SwitchAction::On),
            (DeviceKey::Kitchen, SwitchAction::On),
        ]
    );
}

#[tokio::test]
async fn disconnected_command_reverts_and_is_not_logged() {
    let Fixture { ctx, transport } = fixture().await;
    let session = signed_in(&ctx, "uid-3", "sari@example.com", Role::User).await;
    ctx.reconciler.confirm(DeviceKey::Kitchen, SwitchAction::Off).await;
    transport.set_online(false);

    let err = command_lamp(&ctx, Some(&session), DeviceKey::Kitchen, Some(SwitchAction::On))
        .await
        .expect_err("offline");
    assert_eq!(err.code, ErrorCode::Connection);
    assert_eq!(lamp_status(&ctx, DeviceKey::Kitchen).await.status, "OFF");
    assert!(ctx.audit.list().await.expect("logs").is_empty());
}

#[tokio::test]
async fn guests_cannot_switch_lamps() {
    let Fixture { ctx, transport } = fixture().await;
    let guest = signed_in(&ctx, "uid-4", "tamu@example.com", Role::Guest).await;

    let err = command_lamp(&ctx, Some(&guest), DeviceKey::Guest, Some(SwitchAction::On))
        .await
        .expect_err("guest");
    assert_eq!(err.code, ErrorCode::Forbidden);
    assert!(transport.sent_commands().is_empty());
}

#[tokio::test]
async fn anonymous_commands_follow_configuration() {
    let Fixture { ctx, transport } = fixture().await;
    command_lamp(&ctx, None, DeviceKey::Dining, Some(SwitchAction::On))
        .await
        .expect("anonymous allowed");
    assert_eq!(transport.sent_commands().len(), 1);
    assert!(ctx.audit.list().await.expect("logs").is_empty());

    let Fixture { ctx, .. } = fixture_with(
        Confirmation::Reply,
        AccessConfig {
            allow_anonymous_commands: false,
            ..AccessConfig::default()
        },
    )
    .await;
    let err = command_lamp(&ctx, None, DeviceKey::Dining, Some(SwitchAction::On))
        .await
        .expect_err("session required");
    assert_eq!(err.code, ErrorCode::Unauthorized);
}

#[tokio::test]
async fn missing_state_toggles() {
    let Fixture { ctx, .. } = fixture().await;
    let session = signed_in(&ctx, "uid-5", "dewi@example.com", Role::Admin).await;
    ctx.reconciler.confirm(DeviceKey::Guest, SwitchAction::On).await;

    let response = command_lamp(&ctx, Some(&session), DeviceKey::Guest, None)
        .await
        .expect("toggle");
    assert_eq!(response.status, "OFF");
    assert_eq!(
        ctx.reconciler.state(DeviceKey::Guest).await.state,
        LampState::Off
    );
}

#[tokio::test]
async fn repeating_confirmed_state_is_not_logged() {
    let Fixture { ctx, transport } = fixture().await;
    let session = signed_in(&ctx, "uid-6", "adi@example.com", Role::User).await;
    ctx.reconciler.confirm(DeviceKey::Dining, SwitchAction::On).await;

    let response = command_lamp(&ctx, Some(&session), DeviceKey::Dining, Some(SwitchAction::On))
        .await
        .expect("no-op");
    assert_eq!(response.status, "ON");
    assert!(transport.sent_commands().is_empty());
    assert!(ctx.audit.list().await.expect("logs").is_empty());
}

#[tokio::test]
async fn unknown_lamps_report_unknown() {
    let Fixture { ctx, .. } = fixture().await;
    assert_eq!(lamp_status(&ctx, DeviceKey::Kitchen).await.status, "UNKNOWN");
    assert_eq!(panel_snapshot(&ctx).await.devices.len(), 3);
}

#[test]
fn device_keys_are_validated() {
    assert_eq!(parse_device("Kitchen").expect("key"), DeviceKey::Kitchen);
    let err = parse_device("garage").expect_err("unknown");
    assert_eq!(err.code, ErrorCode::Validation);
}
