use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use shared::domain::{DeviceKey, Identity, LogEntry, LogEntryId, SwitchAction};

use crate::Storage;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuditError {
    #[error("log entry {0:?} not found")]
    NotFound(LogEntryId),
    #[error("audit log write failed: {0}")]
    Write(String),
    #[error("audit log read failed: {0}")]
    Read(String),
}

/// Append-only record of lamp commands.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(
        &self,
        actor: &Identity,
        device: DeviceKey,
        action: SwitchAction,
    ) -> Result<LogEntry, AuditError>;

    /// Snapshot of every entry, newest first.
    async fn list(&self) -> Result<Vec<LogEntry>, AuditError>;

    async fn delete(&self, id: LogEntryId) -> Result<(), AuditError>;

    /// Removes every entry in one transaction. Succeeds on an empty log.
    async fn delete_all(&self) -> Result<u64, AuditError>;
}

#[async_trait]
impl AuditLog for Storage {
    async fn append(
        &self,
        actor: &Identity,
        device: DeviceKey,
        action: SwitchAction,
    ) -> Result<LogEntry, AuditError> {
        self.append_log(&actor.email, device, action, Utc::now())
            .await
            .map_err(|err| AuditError::Write(format!("{err:#}")))
    }

    async fn list(&self) -> Result<Vec<LogEntry>, AuditError> {
        self.list_logs()
            .await
            .map_err(|err| AuditError::Read(format!("{err:#}")))
    }

    async fn delete(&self, id: LogEntryId) -> Result<(), AuditError> {
        let deleted = self
            .delete_log(id)
            .await
            .map_err(|err| AuditError::Write(format!("{err:#}")))?;
        if deleted {
            Ok(())
        } else {
            Err(AuditError::NotFound(id))
        }
    }

    async fn delete_all(&self) -> Result<u64, AuditError> {
        self.delete_all_logs()
            .await
            .map_err(|err| AuditError::Write(format!("{err:#}")))
    }
}
