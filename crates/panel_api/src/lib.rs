use std::sync::Arc;

use reconciler::{ReconcileError, StateReconciler};
use shared::{
    domain::{DeviceKey, Identity, SwitchAction, UnknownDevice},
    error::{ApiError, ErrorCode},
    protocol::{FailureReason, LampStatusResponse, PanelEvent, PanelSnapshot, SessionResponse},
};
use storage::{AuditError, AuditLog, Storage};
use tracing::{info, warn};

mod access;
mod admin;

pub use access::{
    require_admin, require_lamp_control, require_session, AccessConfig, AccessPolicy, AuthError,
    ProfileDirectory, Session,
};
pub use admin::{delete_all_logs, delete_log, delete_user, list_logs, list_users, set_role};

#[derive(Clone)]
pub struct PanelContext {
    pub storage: Storage,
    pub audit: Arc<dyn AuditLog>,
    pub reconciler: Arc<StateReconciler>,
    pub access: AccessPolicy,
}

impl PanelContext {
    /// Wires the sqlite store in as both audit log and profile directory.
    pub fn new(storage: Storage, reconciler: Arc<StateReconciler>, access: AccessConfig) -> Self {
        let store = Arc::new(storage.clone());
        Self {
            storage,
            audit: store.clone(),
            reconciler,
            access: AccessPolicy::new(store, access),
        }
    }
}

/// Records the profile on first sign-in, resolves the role once, and hands
/// back a session token carrying it.
pub async fn sign_in(ctx: &PanelContext, identity: &Identity) -> Result<SessionResponse, ApiError> {
    if identity.uid.as_str().trim().is_empty() || identity.email.trim().is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "identity requires uid and email",
        ));
    }
    if let Err(err) = ctx.storage.ensure_profile(identity).await {
        warn!(uid = %identity.uid, error = %format!("{err:#}"), "failed to record profile");
    }
    let role = ctx.access.role_for(&identity.uid).await;
    let (token, session) = ctx.access.issue(identity, role)?;
    info!(uid = %session.uid, role = %session.role, "signed in");
    Ok(SessionResponse {
        token,
        uid: session.uid,
        email: session.email,
        role: session.role,
        expires_at: session.expires_at,
    })
}

pub fn parse_device(raw: &str) -> Result<DeviceKey, ApiError> {
    raw.parse()
        .map_err(|err: UnknownDevice| ApiError::new(ErrorCode::Validation, err.to_string()))
}

pub async fn panel_snapshot(ctx: &PanelContext) -> PanelSnapshot {
    ctx.reconciler.snapshot().await
}

pub async fn lamp_status(ctx: &PanelContext, device: DeviceKey) -> LampStatusResponse {
    let snapshot = ctx.reconciler.state(device).await;
    LampStatusResponse {
        status: snapshot.state.to_string(),
    }
}

/// Switches a lamp, or toggles it when `desired` is `None`. A dispatched
/// command by a signed-in user is appended to the audit log with the action
/// that was requested; the response carries the state the lamp ended up in.
pub async fn command_lamp(
    ctx: &PanelContext,
    session: Option<&Session>,
    device: DeviceKey,
    desired: Option<SwitchAction>,
) -> Result<LampStatusResponse, ApiError> {
    require_lamp_control(ctx.access.config(), session)?;

    let issued = ctx
        .reconciler
        .request(device, desired)
        .await
        .map_err(reconcile_error)?;

    if let (Some(session), true) = (session, issued.outcome.dispatched()) {
        record(ctx, session, device, issued.requested).await;
    }
    Ok(LampStatusResponse {
        status: issued.outcome.state().to_string(),
    })
}

async fn record(ctx: &PanelContext, session: &Session, device: DeviceKey, action: SwitchAction) {
    match ctx.audit.append(&session.identity(), device, action).await {
        Ok(entry) => ctx.reconciler.publish(PanelEvent::LogAppended { entry }),
        Err(err) => {
            // The lamp already switched; only the record is lost.
            warn!(%device, %action, %err, "failed to append audit log entry");
            ctx.reconciler.publish(PanelEvent::Error(audit_error(err)));
        }
    }
}

fn reconcile_error(err: ReconcileError) -> ApiError {
    let code = match err.failure_reason() {
        FailureReason::Timeout => ErrorCode::Timeout,
        FailureReason::Connection | FailureReason::Rejected => ErrorCode::Connection,
    };
    ApiError::new(code, err.to_string())
}

fn audit_error(err: AuditError) -> ApiError {
    let code = match err {
        AuditError::NotFound(_) => ErrorCode::NotFound,
        AuditError::Write(_) => ErrorCode::Write,
        AuditError::Read(_) => ErrorCode::Internal,
    };
    ApiError::new(code, err.to_string())
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, format!("{err:#}"))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
