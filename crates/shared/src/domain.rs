use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(LogEntryId);

/// Identifier handed out by the external identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub String);

impl Uid {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKey {
    Kitchen,
    Guest,
    Dining,
}

impl DeviceKey {
    pub const ALL: [DeviceKey; 3] = [DeviceKey::Kitchen, DeviceKey::Guest, DeviceKey::Dining];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKey::Kitchen => "kitchen",
            DeviceKey::Guest => "guest",
            DeviceKey::Dining => "dining",
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown device key '{0}'")]
pub struct UnknownDevice(pub String);

impl FromStr for DeviceKey {
    type Err = UnknownDevice;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let key = raw.trim();
        DeviceKey::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(key))
            .ok_or_else(|| UnknownDevice(raw.to_string()))
    }
}

/// A state a lamp can be switched to. Also what a confirmation reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SwitchAction {
    On,
    Off,
}

impl SwitchAction {
    pub fn toggled(self) -> Self {
        match self {
            SwitchAction::On => SwitchAction::Off,
            SwitchAction::Off => SwitchAction::On,
        }
    }

    /// Lower-case payload used on the wire towards devices.
    pub fn payload(self) -> &'static str {
        match self {
            SwitchAction::On => "on",
            SwitchAction::Off => "off",
        }
    }

    /// Parses a device payload. Accepts `on`/`off` in any case, surrounding
    /// whitespace and quotes, and the bridge's `1`/`0` shorthand.
    pub fn parse_payload(raw: &str) -> Option<Self> {
        let value = raw.trim().trim_matches('"').trim();
        if value.eq_ignore_ascii_case("on") || value == "1" {
            Some(SwitchAction::On)
        } else if value.eq_ignore_ascii_case("off") || value == "0" {
            Some(SwitchAction::Off)
        } else {
            None
        }
    }
}

impl fmt::Display for SwitchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SwitchAction::On => "ON",
            SwitchAction::Off => "OFF",
        })
    }
}

impl FromStr for SwitchAction {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        SwitchAction::parse_payload(raw).ok_or_else(|| format!("invalid lamp state '{raw}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LampState {
    On,
    Off,
    Unknown,
}

impl From<SwitchAction> for LampState {
    fn from(value: SwitchAction) -> Self {
        match value {
            SwitchAction::On => LampState::On,
            SwitchAction::Off => LampState::Off,
        }
    }
}

impl From<Option<SwitchAction>> for LampState {
    fn from(value: Option<SwitchAction>) -> Self {
        value.map(LampState::from).unwrap_or(LampState::Unknown)
    }
}

impl fmt::Display for LampState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LampState::On => "ON",
            LampState::Off => "OFF",
            LampState::Unknown => "UNKNOWN",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
    Guest,
}

impl Role {
    /// Maps a stored role string. Anything unrecognised (including the legacy
    /// `dosen` and `mahasiswa` roles) is a plain user, never an admin.
    pub fn from_stored(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            "guest" => Role::Guest,
            _ => Role::User,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
            Role::Guest => "guest",
        }
    }

    pub fn is_admin(self) -> bool {
        self == Role::Admin
    }

    pub fn can_control_lamps(self) -> bool {
        matches!(self, Role::Admin | Role::User)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the identity provider hands back after a successful sign-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: Uid,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub uid: Uid,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: LogEntryId,
    pub actor_email: String,
    pub device: DeviceKey,
    pub action: SwitchAction,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_keys_parse_case_insensitively() {
        assert_eq!("Kitchen".parse::<DeviceKey>(), Ok(DeviceKey::Kitchen));
        assert_eq!(" dining ".parse::<DeviceKey>(), Ok(DeviceKey::Dining));
        assert!("garage".parse::<DeviceKey>().is_err());
    }

    #[test]
    fn payloads_accept_common_spellings() {
        assert_eq!(SwitchAction::parse_payload("ON"), Some(SwitchAction::On));
        assert_eq!(SwitchAction::parse_payload(" off\n"), Some(SwitchAction::Off));
        assert_eq!(SwitchAction::parse_payload("\"on\""), Some(SwitchAction::On));
        assert_eq!(SwitchAction::parse_payload("dimmed"), None);
    }

    #[test]
    fn unknown_roles_never_grant_admin() {
        assert_eq!(Role::from_stored("ADMIN"), Role::Admin);
        assert_eq!(Role::from_stored("dosen"), Role::User);
        assert_eq!(Role::from_stored(""), Role::User);
        assert!(!Role::Guest.can_control_lamps());
    }

    #[test]
    fn lamp_state_serializes_upper_case() {
        let json = serde_json::to_string(&LampState::Unknown).expect("json");
        assert_eq!(json, "\"UNKNOWN\"");
    }
}
