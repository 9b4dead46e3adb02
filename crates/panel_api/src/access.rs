use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{Identity, Role, Uid},
    error::{ApiError, ErrorCode},
    protocol::SessionView,
};
use storage::Storage;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("sign in required")]
    MissingSession,
    #[error("session expired")]
    Expired,
    #[error("invalid session token")]
    InvalidToken,
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("failed to issue session: {0}")]
    Issue(String),
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let code = match err {
            AuthError::MissingSession | AuthError::Expired | AuthError::InvalidToken => {
                ErrorCode::Unauthorized
            }
            AuthError::Forbidden(_) => ErrorCode::Forbidden,
            AuthError::Issue(_) => ErrorCode::Internal,
        };
        ApiError::new(code, err.to_string())
    }
}

/// Where roles come from. Profiles live in the panel database.
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn stored_role(&self, uid: &Uid) -> anyhow::Result<Option<Role>>;
}

#[async_trait]
impl ProfileDirectory for Storage {
    async fn stored_role(&self, uid: &Uid) -> anyhow::Result<Option<Role>> {
        Ok(self.profile(uid).await?.map(|profile| profile.role))
    }
}

#[derive(Debug, Clone)]
pub struct AccessConfig {
    pub session_secret: String,
    pub session_ttl: Duration,
    /// Lets callers without a session use the device command surface. Their
    /// commands are not logged.
    pub allow_anonymous_commands: bool,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            session_secret: "dev-session-secret".into(),
            session_ttl: Duration::from_secs(12 * 60 * 60),
            allow_anonymous_commands: true,
        }
    }
}

/// A signed-in viewer. The role is resolved once at sign-in and carried here
/// until the session expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub uid: Uid,
    pub email: String,
    pub role: Role,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn identity(&self) -> Identity {
        Identity {
            uid: self.uid.clone(),
            email: self.email.clone(),
            display_name: None,
            photo_url: None,
        }
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            uid: self.uid.clone(),
            email: self.email.clone(),
            role: self.role,
            can_view_admin: self.role.is_admin(),
            can_control_lamps: self.role.can_control_lamps(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    email: String,
    role: Role,
    iat: i64,
    exp: i64,
}

#[derive(Clone)]
pub struct AccessPolicy {
    directory: Arc<dyn ProfileDirectory>,
    encoding: EncodingKey,
    decoding: DecodingKey,
    config: AccessConfig,
}

impl AccessPolicy {
    pub fn new(directory: Arc<dyn ProfileDirectory>, config: AccessConfig) -> Self {
        Self {
            directory,
            encoding: EncodingKey::from_secret(config.session_secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.session_secret.as_bytes()),
            config,
        }
    }

    pub fn config(&self) -> &AccessConfig {
        &self.config
    }

    /// Never admin by default: a missing profile is a guest and a failed
    /// lookup degrades to a plain user.
    pub async fn role_for(&self, uid: &Uid) -> Role {
        match self.directory.stored_role(uid).await {
            Ok(Some(role)) => role,
            Ok(None) => Role::Guest,
            Err(err) => {
                warn!(%uid, error = %format!("{err:#}"), "role lookup failed; treating as user");
                Role::User
            }
        }
    }

    pub fn issue(&self, identity: &Identity, role: Role) -> Result<(String, Session), AuthError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.config.session_ttl)
            .map_err(|err| AuthError::Issue(err.to_string()))?;
        let expires_at = now + ttl;
        let claims = Claims {
            sub: identity.uid.as_str().to_string(),
            email: identity.email.clone(),
            role,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding)
            .map_err(|err| AuthError::Issue(err.to_string()))?;
        Ok((
            token,
            Session {
                uid: identity.uid.clone(),
                email: identity.email.clone(),
                role,
                expires_at: Utc
                    .timestamp_opt(claims.exp, 0)
                    .single()
                    .unwrap_or(expires_at),
            },
        ))
    }

    pub fn verify(&self, token: &str) -> Result<Session, AuthError> {
        let mut validation = Validation::default();
        validation.leeway = 0;
        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|err| {
            match err.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::InvalidToken,
            }
        })?;
        let claims = data.claims;
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or(AuthError::InvalidToken)?;
        Ok(Session {
            uid: Uid(claims.sub),
            email: claims.email,
            role: claims.role,
            expires_at,
        })
    }
}

pub fn require_session(session: Option<&Session>) -> Result<&Session, AuthError> {
    session.ok_or(AuthError::MissingSession)
}

/// Admin gating for log and user views. This only keeps ordinary viewers out
/// of admin screens.
pub fn require_admin(session: Option<&Session>) -> Result<&Session, AuthError> {
    let session = require_session(session)?;
    if session.role.is_admin() {
        Ok(session)
    } else {
        Err(AuthError::Forbidden("admin role required"))
    }
}

pub fn require_lamp_control(
    config: &AccessConfig,
    session: Option<&Session>,
) -> Result<(), AuthError> {
    match session {
        Some(session) if session.role.can_control_lamps() => Ok(()),
        Some(_) => Err(AuthError::Forbidden("guests cannot control lamps")),
        None if config.allow_anonymous_commands => Ok(()),
        None => Err(AuthError::MissingSession),
    }
}

#[cfg(test)]
#[path = "tests/access_tests.rs"]
mod tests;
