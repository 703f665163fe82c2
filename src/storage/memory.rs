use super::{CompressionSummary, Storage, StorageResult};
use crate::alerts::types::{AlertEvent, Severity, StoredAlert};
use crate::error::StorageError;
use crate::ingest::ClassifiedReading;
use crate::telemetry::Reading;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct StoredReading {
    pub user_id: String,
    pub record: ClassifiedReading,
}

#[derive(Debug, Default)]
struct Tables {
    readings: Vec<StoredReading>,
    // only read back by tests
    #[cfg_attr(not(test), allow(dead_code))]
    device_last_seen: HashMap<String, DateTime<Utc>>,
    alerts: Vec<StoredAlert>,
    contacts: HashMap<String, String>,
}

/// Process-local backend. Used when no database is configured and by tests,
/// which can switch reading or alert writes into failure.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_readings: AtomicBool,
    fail_last_seen: AtomicBool,
    fail_alerts: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn set_contact(&self, user_id: &str, contact: &str) {
        self.lock().contacts.insert(user_id.to_string(), contact.to_string());
    }

    #[cfg(test)]
    pub fn fail_reading_writes(&self, fail: bool) {
        self.fail_readings.store(fail, Ordering::SeqCst);
    }

    /// Fails the last-seen half of `put_reading`.
    #[cfg(test)]
    pub fn fail_last_seen_writes(&self, fail: bool) {
        self.fail_last_seen.store(fail, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn fail_alert_writes(&self, fail: bool) {
        self.fail_alerts.store(fail, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn readings(&self) -> Vec<StoredReading> {
        self.lock().readings.clone()
    }

    #[cfg(test)]
    pub fn alerts(&self) -> Vec<StoredAlert> {
        self.lock().alerts.clone()
    }

    #[cfg(test)]
    pub fn device_last_seen(&self, device_id: &str) -> Option<DateTime<Utc>> {
        self.lock().device_last_seen.get(device_id).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        // poisoning only follows a panicked test
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(flag: &AtomicBool, what: &str) -> StorageResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(format!("{what} writes disabled")));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn put_reading(
        &self,
        user_id: &str,
        record: &ClassifiedReading,
        seen_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        Self::check(&self.fail_readings, "reading")?;
        Self::check(&self.fail_last_seen, "device")?;
        let mut tables = self.lock();
        tables.readings.push(StoredReading {
            user_id: user_id.to_string(),
            record: record.clone(),
        });
        tables
            .device_last_seen
            .insert(record.reading.device_id.clone(), seen_at);
        Ok(())
    }

    async fn get_last_reading(&self, device_id: &str) -> StorageResult<Option<Reading>> {
        Ok(self
            .lock()
            .readings
            .iter()
            .rev()
            .find(|stored| stored.record.reading.device_id == device_id)
            .map(|stored| stored.record.reading.clone()))
    }

    async fn put_alert(&self, event: &AlertEvent) -> StorageResult<i64> {
        Self::check(&self.fail_alerts, "alert")?;
        let mut tables = self.lock();
        let id = tables.alerts.len() as i64 + 1;
        tables.alerts.push(StoredAlert {
            id,
            event: event.clone(),
            resolved_at: None,
        });
        Ok(id)
    }

    async fn mark_alert_notified(&self, alert_id: i64) -> StorageResult<()> {
        let mut tables = self.lock();
        if let Some(alert) = tables.alerts.iter_mut().find(|alert| alert.id == alert_id) {
            alert.event.notification_sent = true;
        }
        Ok(())
    }

    async fn owner_contact(&self, user_id: &str) -> StorageResult<Option<String>> {
        Ok(self.lock().contacts.get(user_id).cloned())
    }

    async fn unnotified_alerts(
        &self,
        min_severity: Severity,
        limit: i64,
    ) -> StorageResult<Vec<StoredAlert>> {
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(self
            .lock()
            .alerts
            .iter()
            .filter(|alert| {
                alert.event.severity >= min_severity
                    && !alert.event.notification_sent
                    && !alert.event.is_resolved
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn compression_summary(&self, user_id: &str) -> StorageResult<CompressionSummary> {
        let tables = self.lock();
        let mut summary = CompressionSummary {
            readings: 0,
            predicted: 0,
            avg_compression_ratio: 0.0,
        };
        let mut total = 0.0;
        for stored in tables.readings.iter().filter(|s| s.user_id == user_id) {
            summary.readings += 1;
            if stored.record.is_predicted {
                summary.predicted += 1;
            }
            total += stored.record.compression_ratio;
        }
        if summary.readings > 0 {
            summary.avg_compression_ratio = total / summary.readings as f64;
        }
        Ok(summary)
    }
}
