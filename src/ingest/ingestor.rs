use super::state::DeviceState;
use super::types::{ClassifiedReading, IngestResult};
use super::{CompressionEngine, Ingestor};
use crate::alerts::types::StoredAlert;
use crate::alerts::{AlertDispatcher, ThresholdConfig, ThresholdEngine};
use crate::error::{IngestError, StorageError};
use crate::stats::IngestStats;
use crate::storage::{CompressionSummary, Storage};
use crate::telemetry::Reading;
use chrono::Utc;
use std::sync::Arc;

impl Ingestor {
    pub fn new(
        storage: Arc<dyn Storage>,
        compression: CompressionEngine,
        threshold_config: Arc<ThresholdConfig>,
        alerts: AlertDispatcher,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            storage,
            compression,
            thresholds: ThresholdEngine::new(),
            threshold_config,
            alerts,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    pub fn tracked_devices(&self) -> usize {
        self.compression.states().device_count()
    }

    /// Undelivered alerts at or above the notification cutoff, for
    /// out-of-band retry.
    pub async fn unnotified_alerts(&self, limit: i64) -> Result<Vec<StoredAlert>, IngestError> {
        Ok(self
            .storage
            .unnotified_alerts(self.alerts.notify_min_severity(), limit)
            .await?)
    }

    pub async fn compression_summary(&self, user_id: &str) -> Result<CompressionSummary, IngestError> {
        let user_id = required("user_id", user_id)?;
        Ok(self.storage.compression_summary(user_id).await?)
    }

    /// Drains queued notifications.
    pub async fn flush(&self) {
        self.alerts.flush().await;
    }

    pub async fn ingest(
        &self,
        device_id: &str,
        user_id: &str,
        mut reading: Reading,
    ) -> Result<IngestResult, IngestError> {
        let device_id = required("device_id", device_id)?;
        let user_id = required("user_id", user_id)?;
        let carried = reading.device_id.trim();
        if !carried.is_empty() && carried != device_id {
            return Err(IngestError::validation(format!(
                "reading is for device {carried}, not {device_id}"
            )));
        }
        reading.device_id = device_id.to_string();

        let classified = self.classify_and_store(device_id, user_id, reading).await?;

        IngestStats::incr(&self.stats.readings_total);
        if classified.is_predicted {
            IngestStats::incr(&self.stats.predicted_total);
        }

        let snapshot = self.threshold_config.clone();
        let alerts = self
            .thresholds
            .evaluate(device_id, user_id, &classified.reading, &snapshot);
        if !alerts.is_empty() {
            tracing::info!(device = %device_id, user = %user_id, count = alerts.len(), "threshold alerts raised");
        }
        for alert in alerts {
            let field = alert.field;
            if let Err(err) = self.alerts.dispatch(alert).await {
                self.stats.record_error(err.to_string());
                tracing::warn!(device = %device_id, field = %field, error = %err, "failed to persist alert");
            }
        }

        Ok(IngestResult::from(&classified))
    }

    /// Classifies under the device lock and persists the record together with
    /// the device's last-seen time. A failed write puts the previous baseline
    /// back before the lock is released.
    async fn classify_and_store(
        &self,
        device_id: &str,
        user_id: &str,
        reading: Reading,
    ) -> Result<ClassifiedReading, IngestError> {
        let mut slot = self.compression.states().lock(device_id).await;

        if !slot.hydrated {
            let last = self
                .storage
                .get_last_reading(device_id)
                .await
                .map_err(|err| self.storage_failure(device_id, err))?;
            if slot.last.is_none() {
                slot.last = last.as_ref().map(DeviceState::from);
            }
            slot.hydrated = true;
        }

        let previous = slot.last.clone();
        let classified = self.compression.classify_slot(&mut slot, &reading);

        if let Err(err) = self
            .storage
            .put_reading(user_id, &classified, Utc::now())
            .await
        {
            slot.last = previous;
            return Err(self.storage_failure(device_id, err));
        }

        Ok(classified)
    }

    fn storage_failure(&self, device_id: &str, err: StorageError) -> IngestError {
        IngestStats::incr(&self.stats.storage_errors);
        self.stats.record_error(err.to_string());
        tracing::error!(device = %device_id, error = %err, "storage failure during ingest");
        IngestError::Storage(err)
    }
}

fn required<'a>(name: &str, value: &'a str) -> Result<&'a str, IngestError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(IngestError::validation(format!("{name} is required")));
    }
    Ok(trimmed)
}
