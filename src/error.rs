//! Error taxonomy shared by the store, the queue and the sync engine.
use thiserror::Error;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Retryable: the remote side was unreachable, timed out or answered 5xx.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Not retryable until the input changes (remote 4xx or local validation).
    #[error("validation failed: {0}")]
    PermanentValidation(String),

    /// The write did not apply; nothing was partially persisted.
    #[error("storage write failed: {0}")]
    StorageWrite(#[from] sqlx::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("corrupt persisted record: {0}")]
    CorruptRecord(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl SyncError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        SyncError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientNetwork(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound { .. })
    }
}
