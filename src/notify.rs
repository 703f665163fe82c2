use crate::error::NotificationError;
use crate::stats::IngestStats;
use crate::storage::Storage;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Delivery transport for alert notifications. Transient failures return
/// `false` rather than erroring.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, recipient: &str, message: &str) -> bool;

    fn name(&self) -> &'static str;
}

/// Posts `{recipient, message}` to an SMS/email relay.
pub struct WebhookChannel {
    client: Client,
    url: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    recipient: &'a str,
    message: &'a str,
}

impl WebhookChannel {
    pub fn new(url: String, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url, token })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    async fn send(&self, recipient: &str, message: &str) -> bool {
        let mut request = self
            .client
            .post(&self.url)
            .json(&WebhookPayload { recipient, message });
        if let Some(token) = &self.token {
            request = request.header("X-Notify-Token", token);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!(status=%response.status(), "notification relay returned non-success");
                false
            }
            Err(err) => {
                tracing::warn!(error=%err, "notification relay request failed");
                false
            }
        }
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

/// Fallback when no relay is configured: the message only reaches the log.
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn send(&self, recipient: &str, message: &str) -> bool {
        tracing::info!(recipient, message, "notification (log channel)");
        true
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[derive(Debug, Clone)]
pub struct NotificationJob {
    pub alert_id: i64,
    pub user_id: String,
    pub device_id: String,
    pub title: String,
    pub message: String,
}

#[derive(Debug)]
enum NotifyCommand {
    Send(NotificationJob),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct NotifierSettings {
    pub queue: usize,
    pub send_timeout: Duration,
    pub support_phone: Option<String>,
}

/// Handle to the background delivery worker. Enqueueing never waits.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<NotifyCommand>,
    stats: Arc<IngestStats>,
}

impl Notifier {
    pub fn spawn(
        storage: Arc<dyn Storage>,
        channel: Arc<dyn NotificationChannel>,
        settings: NotifierSettings,
        stats: Arc<IngestStats>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.queue.max(1));
        let worker_stats = stats.clone();
        let handle = tokio::spawn(async move {
            run_notifier(rx, storage, channel, settings, worker_stats).await;
        });
        (Self { tx, stats }, handle)
    }

    pub fn enqueue(&self, job: NotificationJob) -> Result<(), NotificationError> {
        if let Err(err) = self.tx.try_send(NotifyCommand::Send(job)) {
            IngestStats::incr(&self.stats.notifications_dropped);
            tracing::warn!(error=%err, "notification queue unavailable; dropping notification");
            return Err(NotificationError::QueueFull);
        }
        Ok(())
    }

    /// Waits until every notification queued before this call was attempted.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(NotifyCommand::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_notifier(
    mut rx: mpsc::Receiver<NotifyCommand>,
    storage: Arc<dyn Storage>,
    channel: Arc<dyn NotificationChannel>,
    settings: NotifierSettings,
    stats: Arc<IngestStats>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            NotifyCommand::Send(job) => {
                let alert_id = job.alert_id;
                let device = job.device_id.clone();
                match deliver(storage.as_ref(), channel.as_ref(), &settings, job).await {
                    Ok(()) => {
                        IngestStats::incr(&stats.notifications_sent);
                        tracing::info!(alert_id, device=%device, channel = channel.name(), "notification sent");
                    }
                    Err(err) => {
                        IngestStats::incr(&stats.notifications_failed);
                        stats.record_error(err.to_string());
                        tracing::warn!(alert_id, device=%device, error=%err, "notification failed; alert left unnotified");
                    }
                }
            }
            NotifyCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("notifier queue closed");
}

async fn deliver(
    storage: &dyn Storage,
    channel: &dyn NotificationChannel,
    settings: &NotifierSettings,
    job: NotificationJob,
) -> Result<(), NotificationError> {
    let recipient = storage
        .owner_contact(&job.user_id)
        .await?
        .ok_or_else(|| NotificationError::NoRecipient(job.user_id.clone()))?;
    let text = format_alert_message(&job.title, &job.message, settings.support_phone.as_deref());

    match tokio::time::timeout(settings.send_timeout, channel.send(&recipient, &text)).await {
        Err(_) => return Err(NotificationError::Timeout),
        Ok(false) => return Err(NotificationError::Rejected),
        Ok(true) => {}
    }

    storage.mark_alert_notified(job.alert_id).await?;
    Ok(())
}

pub fn format_alert_message(title: &str, message: &str, support_phone: Option<&str>) -> String {
    match support_phone.map(str::trim).filter(|v| !v.is_empty()) {
        Some(phone) => format!("🚨 Smart Farm Alert: {title} - {message} Call {phone} for help."),
        None => format!("🚨 Smart Farm Alert: {title} - {message}"),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingChannel;
    use super::*;
    use crate::alerts::types::{AlertEvent, Breach, Severity};
    use crate::storage::MemoryStore;
    use crate::telemetry::Field;
    use anyhow::Result;
    use chrono::Utc;

    fn critical_alert() -> AlertEvent {
        AlertEvent {
            user_id: "7".to_string(),
            device_id: "dev-1".to_string(),
            field: Field::Temperature,
            breach: Breach::High,
            alert_type: "temperature_high".to_string(),
            severity: Severity::Critical,
            title: "High Temperature Alert".to_string(),
            message: "Temperature rose to 40.0°C".to_string(),
            current_value: 40.0,
            threshold_value: 35.0,
            created_at: Utc::now(),
            is_read: false,
            is_resolved: false,
            notification_sent: false,
        }
    }

    fn settings(timeout: Duration) -> NotifierSettings {
        NotifierSettings {
            queue: 8,
            send_timeout: timeout,
            support_phone: Some("+234-800".to_string()),
        }
    }

    async fn queue_one(store: &Arc<MemoryStore>, notifier: &Notifier) -> Result<i64> {
        let alert = critical_alert();
        let id = store.put_alert(&alert).await?;
        notifier.enqueue(NotificationJob {
            alert_id: id,
            user_id: alert.user_id,
            device_id: alert.device_id,
            title: alert.title,
            message: alert.message,
        })?;
        notifier.flush().await;
        Ok(id)
    }

    #[test]
    fn message_includes_support_line_when_configured() {
        assert_eq!(
            format_alert_message("High Temperature Alert", "too hot", Some("+234")),
            "🚨 Smart Farm Alert: High Temperature Alert - too hot Call +234 for help."
        );
        assert_eq!(
            format_alert_message("T", "m", Some("  ")),
            "🚨 Smart Farm Alert: T - m"
        );
    }

    #[tokio::test]
    async fn delivered_alerts_are_marked_sent() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.set_contact("7", "+2348000000000");
        let channel = Arc::new(RecordingChannel::default());
        let stats = Arc::new(IngestStats::new());
        let (notifier, _worker) = Notifier::spawn(
            store.clone(),
            channel.clone(),
            settings(Duration::from_secs(1)),
            stats.clone(),
        );

        queue_one(&store, &notifier).await?;

        assert!(store.alerts()[0].event.notification_sent);
        let sent = channel.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "+2348000000000");
        assert!(sent[0].1.ends_with("Call +234-800 for help."));
        assert_eq!(stats.snapshot().notifications_sent, 1);
        Ok(())
    }

    #[tokio::test]
    async fn slow_channel_times_out_without_marking() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        store.set_contact("7", "+2348000000000");
        let channel = Arc::new(RecordingChannel::slow(Duration::from_millis(500)));
        let stats = Arc::new(IngestStats::new());
        let (notifier, _worker) = Notifier::spawn(
            store.clone(),
            channel,
            settings(Duration::from_millis(20)),
            stats.clone(),
        );

        queue_one(&store, &notifier).await?;

        assert!(!store.alerts()[0].event.notification_sent);
        assert_eq!(stats.snapshot().notifications_failed, 1);
        assert_eq!(store.unnotified_alerts(Severity::Critical, 10).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_contact_leaves_alert_unnotified() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let channel = Arc::new(RecordingChannel::default());
        let stats = Arc::new(IngestStats::new());
        let (notifier, _worker) = Notifier::spawn(
            store.clone(),
            channel.clone(),
            settings(Duration::from_secs(1)),
            stats.clone(),
        );

        queue_one(&store, &notifier).await?;

        assert!(channel.sent().is_empty());
        assert!(!store.alerts()[0].event.notification_sent);
        assert_eq!(stats.snapshot().notifications_failed, 1);
        Ok(())
    }
}
