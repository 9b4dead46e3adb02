//! Admin-only views: the activity log and user role management.

use shared::{
    domain::{LogEntry, LogEntryId, Role, Uid, UserProfile},
    error::{ApiError, ErrorCode},
    protocol::PanelEvent,
};
use tracing::info;

use crate::{access::require_admin, audit_error, internal, PanelContext, Session};

pub async fn list_logs(ctx: &PanelContext, session: Option<&Session>) -> Result<Vec<LogEntry>, ApiError> {
    require_admin(session)?;
    ctx.audit.list().await.map_err(audit_error)
}

pub async fn delete_log(
    ctx: &PanelContext,
    session: Option<&Session>,
    id: LogEntryId,
) -> Result<(), ApiError> {
    let admin = require_admin(session)?;
    ctx.audit.delete(id).await.map_err(audit_error)?;
    info!(id = id.0, by = %admin.email, "deleted log entry");
    Ok(())
}

/// Clears the whole log in one transaction. Clearing an empty log succeeds.
pub async fn delete_all_logs(ctx: &PanelContext, session: Option<&Session>) -> Result<u64, ApiError> {
    let admin = require_admin(session)?;
    let removed = ctx.audit.delete_all().await.map_err(audit_error)?;
    info!(removed, by = %admin.email, "cleared activity log");
    ctx.reconciler.publish(PanelEvent::LogCleared);
    Ok(removed)
}

pub async fn list_users(
    ctx: &PanelContext,
    session: Option<&Session>,
) -> Result<Vec<UserProfile>, ApiError> {
    require_admin(session)?;
    ctx.storage.list_profiles().await.map_err(internal)
}

pub async fn set_role(
    ctx: &PanelContext,
    session: Option<&Session>,
    uid: &Uid,
    role: Role,
) -> Result<UserProfile, ApiError> {
    let admin = require_admin(session)?;
    if admin.uid == *uid {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "admins cannot change their own role",
        ));
    }
    if !ctx.storage.set_role(uid, role).await.map_err(internal)? {
        return Err(ApiError::new(ErrorCode::NotFound, format!("user {uid} not found")));
    }
    info!(%uid, %role, by = %admin.email, "changed user role");
    ctx.storage
        .profile(uid)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, format!("user {uid} not found")))
}

pub async fn delete_user(
    ctx: &PanelContext,
    session: Option<&Session>,
    uid: &Uid,
) -> Result<(), ApiError> {
    let admin = require_admin(session)?;
    if admin.uid == *uid {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "admins cannot delete their own profile",
        ));
    }
    if !ctx.storage.delete_profile(uid).await.map_err(internal)? {
        return Err(ApiError::new(ErrorCode::NotFound, format!("user {uid} not found")));
    }
    info!(%uid, by = %admin.email, "deleted user profile");
    Ok(())
}

#[cfg(test)]
#[path = "tests/admin_tests.rs"]
mod tests;
