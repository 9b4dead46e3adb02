use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{DeviceKey, Identity, LampState, LogEntry, Role, SwitchAction, Uid},
    error::ApiError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Offline,
}

impl ConnectionStatus {
    pub fn is_connected(self) -> bool {
        self == ConnectionStatus::Connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Connection,
    Timeout,
    Rejected,
}

/// What a renderer needs to draw one lamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device: DeviceKey,
    pub state: LampState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<SwitchAction>,
}

impl DeviceSnapshot {
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PanelEvent {
    StateChanged {
        snapshot: DeviceSnapshot,
    },
    Discrepancy {
        device: DeviceKey,
        expected: SwitchAction,
        observed: SwitchAction,
    },
    CommandFailed {
        device: DeviceKey,
        desired: SwitchAction,
        reason: FailureReason,
        message: String,
    },
    ConnectionChanged {
        status: ConnectionStatus,
    },
    LogAppended {
        entry: LogEntry,
    },
    LogCleared,
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelSnapshot {
    pub connection: ConnectionStatus,
    pub devices: Vec<DeviceSnapshot>,
}

/// Body of the per-device command surface: `{"status": "ON"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LampStatusResponse {
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LampCommandRequest {
    /// Absent means toggle.
    #[serde(default)]
    pub state: Option<SwitchAction>,
}

pub type SignInRequest = Identity;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub token: String,
    pub uid: Uid,
    pub email: String,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub uid: Uid,
    pub email: String,
    pub role: Role,
    pub can_view_admin: bool,
    pub can_control_lamps: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetRoleRequest {
    pub role: Role,
}
