use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Failures surfaced to ingest callers. Alerting problems never appear here.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid reading: {0}")]
    Validation(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IngestError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Reasons a critical alert could not be delivered. Logged and counted only.
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification send timed out")]
    Timeout,
    #[error("notification channel rejected the message")]
    Rejected,
    #[error("no contact on file for user {0}")]
    NoRecipient(String),
    #[error("notification queue full")]
    QueueFull,
    #[error("notification bookkeeping failed: {0}")]
    Storage(#[from] StorageError),
}
