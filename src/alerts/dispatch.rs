use super::types::{AlertEvent, Severity};
use crate::error::StorageError;
use crate::notify::{NotificationJob, Notifier};
use crate::stats::IngestStats;
use crate::storage::Storage;
use std::sync::Arc;

/// Persists alerts and hands the urgent ones to the notifier. Delivery is
/// best-effort and never rolls back the stored alert.
#[derive(Clone)]
pub struct AlertDispatcher {
    storage: Arc<dyn Storage>,
    notifier: Notifier,
    notify_min_severity: Severity,
    stats: Arc<IngestStats>,
}

impl AlertDispatcher {
    pub fn new(
        storage: Arc<dyn Storage>,
        notifier: Notifier,
        notify_min_severity: Severity,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            storage,
            notifier,
            notify_min_severity,
            stats,
        }
    }

    pub fn notify_min_severity(&self) -> Severity {
        self.notify_min_severity
    }

    pub async fn dispatch(&self, event: AlertEvent) -> Result<i64, StorageError> {
        let alert_id = match self.storage.put_alert(&event).await {
            Ok(id) => id,
            Err(err) => {
                IngestStats::incr(&self.stats.alert_persist_failures);
                return Err(err);
            }
        };
        IngestStats::incr(&self.stats.alerts_total);
        tracing::info!(
            alert_id,
            device = %event.device_id,
            user = %event.user_id,
            field = %event.field,
            severity = %event.severity,
            value = event.current_value,
            "alert created"
        );

        if event.severity >= self.notify_min_severity {
            // queue failures are already logged and counted by the notifier
            let _ = self.notifier.enqueue(NotificationJob {
                alert_id,
                user_id: event.user_id,
                device_id: event.device_id,
                title: event.title,
                message: event.message,
            });
        }

        Ok(alert_id)
    }

    pub async fn flush(&self) {
        self.notifier.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::eval::ThresholdEngine;
    use crate::alerts::types::ThresholdConfig;
    use crate::notify::testing::RecordingChannel;
    use crate::notify::NotifierSettings;
    use crate::storage::MemoryStore;
    use crate::telemetry::{Measurements, Reading};
    use anyhow::Result;
    use chrono::Utc;
    use std::time::Duration;

    fn dispatcher(
        store: &Arc<MemoryStore>,
        channel: Arc<RecordingChannel>,
    ) -> (AlertDispatcher, Arc<IngestStats>) {
        let stats = Arc::new(IngestStats::new());
        let (notifier, _worker) = Notifier::spawn(
            store.clone(),
            channel,
            NotifierSettings {
                queue: 16,
                send_timeout: Duration::from_secs(1),
                support_phone: None,
            },
            stats.clone(),
        );
        (
            AlertDispatcher::new(store.clone(), notifier, Severity::Critical, stats.clone()),
            stats,
        )
    }

    fn alerts_for(values: Measurements) -> Vec<AlertEvent> {
        let reading = Reading::new("dev-1", Utc::now(), values);
        ThresholdEngine::new().evaluate("dev-1", "7", &reading, &ThresholdConfig::default())
    }

    #[tokio::test]
    async fn failing_channel_still_persists_alert() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.set_contact("7", "+2348000000000");
        let channel = Arc::new(RecordingChannel::failing());
        let (dispatcher, stats) = dispatcher(&store, channel.clone());

        for alert in alerts_for(Measurements {
            temperature: Some(45.0),
            ..Default::default()
        }) {
            dispatcher.dispatch(alert).await?;
        }
        dispatcher.flush().await;

        let stored = store.alerts();
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].event.notification_sent);
        assert_eq!(channel.sent().len(), 1);
        assert_eq!(stats.snapshot().notifications_failed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn only_critical_alerts_are_notified() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.set_contact("7", "+2348000000000");
        let channel = Arc::new(RecordingChannel::default());
        let (dispatcher, _stats) = dispatcher(&store, channel.clone());

        // low temperature is a warning, low moisture is critical
        for alert in alerts_for(Measurements {
            temperature: Some(2.0),
            soil_moisture: Some(10.0),
            ..Default::default()
        }) {
            dispatcher.dispatch(alert).await?;
        }
        dispatcher.flush().await;

        let stored = store.alerts();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].event.severity, Severity::Warning);
        assert!(!stored[0].event.notification_sent);
        assert_eq!(stored[1].event.severity, Severity::Critical);
        assert!(stored[1].event.notification_sent);

        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("Low Soil Moisture Alert"));
        Ok(())
    }

    #[tokio::test]
    async fn persistence_failure_is_reported_and_not_notified() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.set_contact("7", "+2348000000000");
        store.fail_alert_writes(true);
        let channel = Arc::new(RecordingChannel::default());
        let (dispatcher, stats) = dispatcher(&store, channel.clone());

        let alert = alerts_for(Measurements {
            temperature: Some(45.0),
            ..Default::default()
        })
        .remove(0);
        assert!(dispatcher.dispatch(alert).await.is_err());
        dispatcher.flush().await;

        assert!(channel.sent().is_empty());
        assert_eq!(stats.snapshot().alert_persist_failures, 1);
        Ok(())
    }
}
