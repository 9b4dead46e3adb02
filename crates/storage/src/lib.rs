use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::str::FromStr;

use shared::domain::{
    DeviceKey, Identity, LogEntry, LogEntryId, Role, SwitchAction, Uid, UserProfile,
};

mod audit;
mod database_url;

pub use audit::{AuditError, AuditLog};
pub use database_url::{prepare_database_url, DEFAULT_DATABASE_URL};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        let database_url = prepare_database_url(database_url)?;
        let in_memory = database_url.starts_with("sqlite::memory:");

        let connect_options =
            SqliteConnectOptions::from_str(&database_url)?.create_if_missing(true);
        // Every in-memory connection is its own database, so keep exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open database '{database_url}'"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn append_log(
        &self,
        actor_email: &str,
        device: DeviceKey,
        action: SwitchAction,
        timestamp: DateTime<Utc>,
    ) -> Result<LogEntry> {
        let rec = sqlx::query(
            "INSERT INTO lamp_logs (actor_email, device, action, timestamp) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(actor_email)
        .bind(device.as_str())
        .bind(action.to_string())
        .bind(timestamp)
        .fetch_one(&self.pool)
        .await?;
        Ok(LogEntry {
            id: LogEntryId(rec.get::<i64, _>(0)),
            actor_email: actor_email.to_string(),
            device,
            action,
            timestamp,
        })
    }

    /// Newest first. Entries sharing a timestamp fall back to insertion order.
    pub async fn list_logs(&self) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query(
            "SELECT id, actor_email, device, action, timestamp
             FROM lamp_logs
             ORDER BY timestamp DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_entry_from_row).collect()
    }

    pub async fn delete_log(&self, id: LogEntryId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM lamp_logs WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_all_logs(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM lamp_logs")
            .execute(&mut *tx)
            .await
            .context("failed to clear lamp_logs")?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// Creates the profile on first sign-in with the default `user` role.
    /// Later sign-ins refresh contact fields and `updated_at` but keep the role.
    pub async fn ensure_profile(&self, identity: &Identity) -> Result<UserProfile> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO user_profiles (uid, email, display_name, photo_url, role, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(uid) DO UPDATE SET
                 email = excluded.email,
                 display_name = COALESCE(excluded.display_name, user_profiles.display_name),
                 photo_url = COALESCE(excluded.photo_url, user_profiles.photo_url),
                 updated_at = excluded.updated_at
             RETURNING uid, email, display_name, photo_url, role, created_at, updated_at",
        )
        .bind(identity.uid.as_str())
        .bind(&identity.email)
        .bind(identity.display_name.as_deref())
        .bind(identity.photo_url.as_deref())
        .bind(Role::User.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        profile_from_row(&row)
    }

    pub async fn profile(&self, uid: &Uid) -> Result<Option<UserProfile>> {
        let row = sqlx::query(
            "SELECT uid, email, display_name, photo_url, role, created_at, updated_at
             FROM user_profiles WHERE uid = ?",
        )
        .bind(uid.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    pub async fn list_profiles(&self) -> Result<Vec<UserProfile>> {
        let rows = sqlx::query(
            "SELECT uid, email, display_name, photo_url, role, created_at, updated_at
             FROM user_profiles
             ORDER BY lower(email) ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(profile_from_row).collect()
    }

    pub async fn set_role(&self, uid: &Uid, role: Role) -> Result<bool> {
        let result =
            sqlx::query("UPDATE user_profiles SET role = ?, updated_at = ? WHERE uid = ?")
                .bind(role.as_str())
                .bind(Utc::now())
                .bind(uid.as_str())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_profile(&self, uid: &Uid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM user_profiles WHERE uid = ?")
            .bind(uid.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn log_entry_from_row(row: &SqliteRow) -> Result<LogEntry> {
    let device: String = row.try_get("device")?;
    let action: String = row.try_get("action")?;
    Ok(LogEntry {
        id: LogEntryId(row.try_get::<i64, _>("id")?),
        actor_email: row.try_get("actor_email")?,
        device: device.parse()?,
        action: SwitchAction::parse_payload(&action)
            .ok_or_else(|| anyhow!("corrupt lamp_logs action '{action}'"))?,
        timestamp: row.try_get::<DateTime<Utc>, _>("timestamp")?,
    })
}

fn profile_from_row(row: &SqliteRow) -> Result<UserProfile> {
    Ok(UserProfile {
        uid: Uid(row.try_get("uid")?),
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        photo_url: row.try_get("photo_url")?,
        role: Role::from_stored(&row.try_get::<String, _>("role")?),
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
