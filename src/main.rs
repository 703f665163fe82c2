mod alerts;
mod config;
mod error;
mod http;
mod ingest;
mod mqtt;
mod notify;
mod stats;
mod storage;
mod telemetry;

use crate::alerts::AlertDispatcher;
use crate::config::{Config, StorageBackend};
use crate::ingest::{CompressionEngine, DeviceStateStore, Ingestor};
use crate::notify::{LogChannel, NotificationChannel, Notifier, NotifierSettings, WebhookChannel};
use crate::stats::IngestStats;
use crate::storage::{build_pool, MemoryStore, PgStore, Storage};
use anyhow::{Context, Result};
use futures::future;
use std::sync::Arc;
use tokio::net::TcpListener;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,field_ingest=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "field-ingest"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind field-ingest listener on {addr}: port already in use. Stop the other service or set INGEST_HTTP_BIND.",
            );
        }
        Err(err) => Err(err).with_context(|| format!("failed to bind field-ingest listener on {addr}")),
    }
}

async fn open_storage(config: &Config) -> Result<Arc<dyn Storage>> {
    match config.storage_backend {
        StorageBackend::Memory => {
            tracing::warn!("using in-memory storage; readings are lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("database url is required for postgres storage")?;
            let pool = build_pool(url, config.db_pool_size).await?;
            let store = PgStore::new(pool);
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}

fn notification_channel(config: &Config) -> Result<Arc<dyn NotificationChannel>> {
    match &config.notify_webhook_url {
        Some(url) => Ok(Arc::new(WebhookChannel::new(
            url.clone(),
            config.notify_webhook_token.clone(),
            config.notify_timeout(),
        )?)),
        None => {
            tracing::info!("INGEST_NOTIFY_WEBHOOK_URL not set; notifications go to the log");
            Ok(Arc::new(LogChannel))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;
    if let Some(path) = &config.rules_path {
        tracing::info!(path=%path.display(), "loaded rules file");
    }

    let storage = open_storage(&config).await?;
    let stats = Arc::new(IngestStats::new());

    let (notifier, notifier_handle) = Notifier::spawn(
        storage.clone(),
        notification_channel(&config)?,
        NotifierSettings {
            queue: config.notify_queue,
            send_timeout: config.notify_timeout(),
            support_phone: config.support_phone.clone(),
        },
        stats.clone(),
    );
    let dispatcher = AlertDispatcher::new(
        storage.clone(),
        notifier,
        config.notify_min_severity,
        stats.clone(),
    );
    let compression = CompressionEngine::new(
        config.prediction.clone(),
        Arc::new(DeviceStateStore::new()),
    );
    let ingestor = Ingestor::new(
        storage,
        compression,
        Arc::new(config.thresholds.clone()),
        dispatcher,
        stats,
    );

    let listener = bind_listener(&config.http_bind).await?;
    tracing::info!(addr=%config.http_bind, "field-ingest listening");
    let app = http::router(ingestor.clone());
    let http_handle = tokio::spawn(async move { axum::serve(listener, app).await });

    let mqtt_handle = if config.enable_mqtt_listener {
        let config_clone = config.clone();
        let ingestor_clone = ingestor.clone();
        Some(tokio::spawn(async move {
            mqtt::run_listener(config_clone, ingestor_clone).await
        }))
    } else {
        None
    };

    tokio::select! {
        res = http_handle => {
            match res {
                Ok(Err(err)) => tracing::error!(error=%err, "HTTP server exited"),
                Err(err) => tracing::error!(error=%err, "HTTP task failed"),
                Ok(Ok(())) => {}
            }
        }
        _ = async {
            if let Some(handle) = mqtt_handle {
                if let Err(err) = handle.await { tracing::warn!(error=%err, "MQTT task failed"); }
            } else {
                future::pending::<()>().await;
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    ingestor.flush().await;
    drop(ingestor);
    notifier_handle.abort();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::normalize_otlp_http_endpoint;

    #[test]
    fn otlp_endpoint_gets_traces_path() {
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/v1/traces"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(normalize_otlp_http_endpoint("  "), "");
    }
}
