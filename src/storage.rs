mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{build_pool, PgStore};

use crate::alerts::types::{AlertEvent, Severity, StoredAlert};
use crate::error::StorageError;
use crate::ingest::ClassifiedReading;
use crate::telemetry::Reading;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CompressionSummary {
    pub readings: i64,
    pub predicted: i64,
    pub avg_compression_ratio: f64,
}

/// Persistence the ingest core depends on.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Stores the record and advances the device's last-seen time as one
    /// unit. On error neither write is visible.
    async fn put_reading(
        &self,
        user_id: &str,
        record: &ClassifiedReading,
        seen_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Most recently stored reading for the device, in arrival order.
    async fn get_last_reading(&self, device_id: &str) -> StorageResult<Option<Reading>>;

    /// Appends an alert and returns its id.
    async fn put_alert(&self, event: &AlertEvent) -> StorageResult<i64>;

    async fn mark_alert_notified(&self, alert_id: i64) -> StorageResult<()>;

    /// Contact address for critical notifications (the owner's phone).
    async fn owner_contact(&self, user_id: &str) -> StorageResult<Option<String>>;

    /// Open alerts at or above `min_severity` that were never delivered,
    /// oldest first.
    async fn unnotified_alerts(
        &self,
        min_severity: Severity,
        limit: i64,
    ) -> StorageResult<Vec<StoredAlert>>;

    async fn compression_summary(&self, user_id: &str) -> StorageResult<CompressionSummary>;
}
