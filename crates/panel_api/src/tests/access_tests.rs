use anyhow::anyhow;
use jsonwebtoken::{encode, EncodingKey, Header};

use super::*;

struct FixedDirectory(Option<Role>);

#[async_trait]
impl ProfileDirectory for FixedDirectory {
    async fn stored_role(&self, _uid: &Uid) -> anyhow::Result<Option<Role>> {
        Ok(self.0)
    }
}

struct UnavailableDirectory;

#[async_trait]
impl ProfileDirectory for UnavailableDirectory {
    async fn stored_role(&self, _uid: &Uid) -> anyhow::Result<Option<Role>> {
        Err(anyhow!("profile store unavailable"))
    }
}

fn policy(directory: impl ProfileDirectory + 'static) -> AccessPolicy {
    AccessPolicy::new(Arc::new(directory), AccessConfig::default())
}

fn identity() -> Identity {
    Identity {
        uid: Uid::new("uid-1"),
        email: "rina@example.com".into(),
        display_name: Some("Rina".into()),
        photo_url: None,
    }
}

#[tokio::test]
async fn missing_profile_resolves_to_guest() {
    let role = policy(FixedDirectory(None)).role_for(&Uid::new("x")).await;
    assert_eq!(role, Role::Guest);
}

#[tokio::test]
async fn failed_lookup_falls_back_to_user() {
    let role = policy(UnavailableDirectory).role_for(&Uid::new("x")).await;
    assert_eq!(role, Role::User);
}

#[tokio::test]
async fn stored_role_is_used() {
    let role = policy(FixedDirectory(Some(Role::Admin)))
        .role_for(&Uid::new("x"))
        .await;
    assert_eq!(role, Role::Admin);
}

#[test]
fn issued_token_carries_role() {
    let policy = policy(FixedDirectory(None));
    let (token, issued) = policy.issue(&identity(), Role::Admin).expect("issue");
    let verified = policy.verify(&token).expect("verify");
    assert_eq!(verified, issued);
    assert!(verified.view().can_view_admin);
}

#[test]
fn expired_token_is_rejected() {
    let policy = policy(FixedDirectory(None));
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: "uid-1".into(),
        email: "rina@example.com".into(),
        role: Role::User,
        iat: now - 120,
        exp: now - 60,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(AccessConfig::default().session_secret.as_bytes()),
    )
    .expect("encode");
    assert_eq!(policy.verify(&token), Err(AuthError::Expired));
}

#[test]
fn token_signed_with_other_secret_is_rejected() {
    let other = AccessPolicy::new(
        Arc::new(FixedDirectory(None)),
        AccessConfig {
            session_secret: "another-secret".into(),
            ..AccessConfig::default()
        },
    );
    let (token, _) = other.issue(&identity(), Role::Admin).expect("issue");
    assert_eq!(
        policy(FixedDirectory(None)).verify(&token),
        Err(AuthError::InvalidToken)
    );
    assert_eq!(
        policy(FixedDirectory(None)).verify("not-a-token"),
        Err(AuthError::InvalidToken)
    );
}

#[test]
fn admin_gate_checks_session_and_role() {
    let session = |role| Session {
        uid: Uid::new("uid-1"),
        email: "rina@example.com".into(),
        role,
        expires_at: Utc::now(),
    };
    assert_eq!(require_admin(None), Err(AuthError::MissingSession));
    assert!(matches!(
        require_admin(Some(&session(Role::User))),
        Err(AuthError::Forbidden(_))
    ));
    assert!(require_admin(Some(&session(Role::Admin))).is_ok());

    let config = AccessConfig::default();
    assert!(matches!(
        require_lamp_control(&config, Some(&session(Role::Guest))),
        Err(AuthError::Forbidden(_))
    ));
    assert!(require_lamp_control(&config, Some(&session(Role::User))).is_ok());
}

#[test]
fn auth_errors_map_to_api_codes() {
    assert_eq!(ApiError::from(AuthError::Expired).code, ErrorCode::Unauthorized);
    assert_eq!(
        ApiError::from(AuthError::Forbidden("admin role required")).code,
        ErrorCode::Forbidden
    );
}
