use crate::alerts::{Severity, ThresholdConfig};
use crate::ingest::PredictionConfig;
use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub storage_backend: StorageBackend,
    pub database_url: Option<String>,
    pub db_pool_size: u32,
    pub http_bind: String,
    pub enable_mqtt_listener: bool,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_client_id: String,
    pub notify_webhook_url: Option<String>,
    pub notify_webhook_token: Option<String>,
    pub notify_timeout_ms: u64,
    pub notify_queue: usize,
    pub notify_min_severity: Severity,
    pub support_phone: Option<String>,
    pub rules_path: Option<PathBuf>,
    pub prediction: PredictionConfig,
    pub thresholds: ThresholdConfig,
    pub otlp_endpoint: Option<String>,
}

/// Optional JSON file carrying prediction tuning and threshold rules.
#[derive(Debug, Default, Deserialize)]
struct RulesFile {
    #[serde(default)]
    prediction: Option<PredictionConfig>,
    #[serde(default)]
    thresholds: Option<ThresholdConfig>,
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_string(key)
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env_string(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let storage_backend = match env_string("INGEST_STORAGE").as_deref() {
            None | Some("postgres") => StorageBackend::Postgres,
            Some("memory") => StorageBackend::Memory,
            Some(other) => bail!("INGEST_STORAGE must be postgres or memory, got {other}"),
        };

        let database_url = env_string("INGEST_DATABASE_URL")
            .or_else(|| env_string("DATABASE_URL"))
            .map(normalize_database_url);
        if storage_backend == StorageBackend::Postgres && database_url.is_none() {
            bail!("INGEST_DATABASE_URL or DATABASE_URL is required (or set INGEST_STORAGE=memory)");
        }

        let notify_min_severity = match env_string("INGEST_NOTIFY_MIN_SEVERITY") {
            Some(raw) => Severity::parse(&raw)
                .with_context(|| format!("INGEST_NOTIFY_MIN_SEVERITY has unknown severity {raw}"))?,
            None => Severity::Critical,
        };

        let rules_path = env_string("INGEST_RULES_PATH").map(PathBuf::from);
        let (prediction, thresholds) = match rules_path.as_deref() {
            Some(path) => load_rules(path)?,
            None => (PredictionConfig::default(), ThresholdConfig::default()),
        };

        Ok(Self {
            storage_backend,
            database_url,
            db_pool_size: env_parse("INGEST_DB_POOL_SIZE", 10),
            http_bind: env_string("INGEST_HTTP_BIND").unwrap_or_else(|| "0.0.0.0:5000".to_string()),
            enable_mqtt_listener: env_flag("INGEST_ENABLE_MQTT", false),
            mqtt_host: env_string("INGEST_MQTT_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            mqtt_port: env_parse("INGEST_MQTT_PORT", 1883),
            mqtt_username: env_string("INGEST_MQTT_USERNAME"),
            mqtt_password: env_string("INGEST_MQTT_PASSWORD"),
            mqtt_topic_prefix: env_string("INGEST_MQTT_TOPIC_PREFIX")
                .unwrap_or_else(|| "farm".to_string()),
            mqtt_keepalive_secs: env_parse("INGEST_MQTT_KEEPALIVE_SECS", 30),
            mqtt_client_id: env_string("INGEST_MQTT_CLIENT_ID")
                .unwrap_or_else(|| format!("field-ingest-{}", std::process::id())),
            notify_webhook_url: env_string("INGEST_NOTIFY_WEBHOOK_URL"),
            notify_webhook_token: env_string("INGEST_NOTIFY_WEBHOOK_TOKEN"),
            notify_timeout_ms: env_parse("INGEST_NOTIFY_TIMEOUT_MS", 5000),
            notify_queue: env_parse("INGEST_NOTIFY_QUEUE", 256),
            notify_min_severity,
            support_phone: env_string("INGEST_SUPPORT_PHONE"),
            rules_path,
            prediction,
            thresholds,
            otlp_endpoint: env_string("OTEL_EXPORTER_OTLP_ENDPOINT"),
        })
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms.max(1))
    }
}

fn load_rules(path: &Path) -> Result<(PredictionConfig, ThresholdConfig)> {
    let contents = std::fs::read(path)
        .with_context(|| format!("failed to read rules file {}", path.display()))?;
    parse_rules(contents).with_context(|| format!("invalid rules file {}", path.display()))
}

/// Threshold entries in the file replace the defaults for the fields they
/// name; other fields keep their defaults.
fn parse_rules(mut contents: Vec<u8>) -> Result<(PredictionConfig, ThresholdConfig)> {
    let rules: RulesFile = simd_json::serde::from_slice(&mut contents)?;
    let prediction = rules.prediction.unwrap_or_default();
    let thresholds = match rules.thresholds {
        Some(overrides) => ThresholdConfig::default().merge(overrides),
        None => ThresholdConfig::default(),
    };
    prediction.validate().map_err(anyhow::Error::msg)?;
    thresholds.validate().map_err(anyhow::Error::msg)?;
    Ok((prediction, thresholds))
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
