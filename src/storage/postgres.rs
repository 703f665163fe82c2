use super::{CompressionSummary, Storage, StorageResult};
use crate::alerts::types::{AlertEvent, Breach, Severity, StoredAlert};
use crate::error::StorageError;
use crate::ingest::ClassifiedReading;
use crate::telemetry::{Field, Measurements, Reading};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Debug, FromRow)]
struct LastReadingRow {
    device_id: String,
    ts: DateTime<Utc>,
    temperature: Option<f64>,
    humidity: Option<f64>,
    soil_moisture: Option<f64>,
    light_intensity: Option<f64>,
    ph_level: Option<f64>,
    battery_level: Option<f64>,
    signal_strength: Option<i32>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Debug, FromRow)]
struct AlertRow {
    id: i64,
    user_id: String,
    device_id: String,
    field: String,
    breach: String,
    alert_type: String,
    severity: String,
    title: String,
    message: String,
    current_value: f64,
    threshold_value: f64,
    is_read: bool,
    is_resolved: bool,
    notification_sent: bool,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl AlertRow {
    fn into_stored(self) -> StorageResult<StoredAlert> {
        let field = parse_field(&self.field).ok_or_else(|| {
            StorageError::Unavailable(format!("alert {} has unknown field {}", self.id, self.field))
        })?;
        let severity = Severity::parse(&self.severity).ok_or_else(|| {
            StorageError::Unavailable(format!(
                "alert {} has unknown severity {}",
                self.id, self.severity
            ))
        })?;
        let breach = if self.breach == "high" {
            Breach::High
        } else {
            Breach::Low
        };
        Ok(StoredAlert {
            id: self.id,
            event: AlertEvent {
                user_id: self.user_id,
                device_id: self.device_id,
                field,
                breach,
                alert_type: self.alert_type,
                severity,
                title: self.title,
                message: self.message,
                current_value: self.current_value,
                threshold_value: self.threshold_value,
                created_at: self.created_at,
                is_read: self.is_read,
                is_resolved: self.is_resolved,
                notification_sent: self.notification_sent,
            },
            resolved_at: self.resolved_at,
        })
    }
}

fn parse_field(raw: &str) -> Option<Field> {
    Field::ALERT_ORDER
        .into_iter()
        .find(|field| field.as_str() == raw)
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

const SCHEMA: [&str; 5] = [
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id text primary key,
        name text not null default '',
        phone text null,
        email text null,
        created_at timestamptz not null default now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS devices (
        device_id varchar(50) primary key,
        user_id text null,
        device_name text not null default '',
        last_seen timestamptz null,
        is_active boolean not null default true,
        created_at timestamptz not null default now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sensor_data (
        id bigserial primary key,
        user_id text not null,
        device_id varchar(50) not null,
        temperature double precision null,
        humidity double precision null,
        soil_moisture double precision null,
        light_intensity double precision null,
        ph_level double precision null,
        battery_level double precision null,
        signal_strength int null,
        latitude double precision null,
        longitude double precision null,
        compression_ratio double precision not null,
        is_predicted boolean not null default false,
        ts timestamptz not null
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS sensor_data_device_id_idx ON sensor_data (device_id, id DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alerts (
        id bigserial primary key,
        user_id text not null,
        device_id varchar(50) not null,
        field text not null,
        breach text not null,
        alert_type varchar(50) not null,
        severity text not null,
        title varchar(200) not null,
        message text not null,
        current_value double precision not null,
        threshold_value double precision not null,
        is_read boolean not null default false,
        is_resolved boolean not null default false,
        notification_sent boolean not null default false,
        created_at timestamptz not null,
        resolved_at timestamptz null
    )
    "#,
];

#[async_trait]
impl Storage for PgStore {
    async fn put_reading(
        &self,
        user_id: &str,
        record: &ClassifiedReading,
        seen_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let reading = &record.reading;
        let values = &reading.values;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO sensor_data (
                user_id, device_id, temperature, humidity, soil_moisture, light_intensity,
                ph_level, battery_level, signal_strength, latitude, longitude,
                compression_ratio, is_predicted, ts
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(user_id)
        .bind(&reading.device_id)
        .bind(values.temperature)
        .bind(values.humidity)
        .bind(values.soil_moisture)
        .bind(values.light_intensity)
        .bind(values.ph_level)
        .bind(values.battery_level)
        .bind(values.signal_strength)
        .bind(values.latitude)
        .bind(values.longitude)
        .bind(record.compression_ratio)
        .bind(record.is_predicted)
        .bind(reading.timestamp)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO devices (device_id, last_seen)
            VALUES ($1, $2)
            ON CONFLICT (device_id) DO UPDATE
            SET last_seen = GREATEST(COALESCE(devices.last_seen, EXCLUDED.last_seen), EXCLUDED.last_seen)
            "#,
        )
        .bind(&reading.device_id)
        .bind(seen_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_last_reading(&self, device_id: &str) -> StorageResult<Option<Reading>> {
        let row: Option<LastReadingRow> = sqlx::query_as(
            r#"
            SELECT
                device_id, ts, temperature, humidity, soil_moisture, light_intensity,
                ph_level, battery_level, signal_strength, latitude, longitude
            FROM sensor_data
            WHERE device_id = $1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Reading {
            device_id: row.device_id,
            timestamp: row.ts,
            values: Measurements {
                temperature: row.temperature,
                humidity: row.humidity,
                soil_moisture: row.soil_moisture,
                light_intensity: row.light_intensity,
                ph_level: row.ph_level,
                battery_level: row.battery_level,
                signal_strength: row.signal_strength,
                latitude: row.latitude,
                longitude: row.longitude,
            },
        }))
    }

    async fn put_alert(&self, event: &AlertEvent) -> StorageResult<i64> {
        let breach = match event.breach {
            Breach::Low => "low",
            Breach::High => "high",
        };
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO alerts (
                user_id, device_id, field, breach, alert_type, severity, title, message,
                current_value, threshold_value, is_read, is_resolved, notification_sent, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING id
            "#,
        )
        .bind(&event.user_id)
        .bind(&event.device_id)
        .bind(event.field.as_str())
        .bind(breach)
        .bind(&event.alert_type)
        .bind(event.severity.as_str())
        .bind(&event.title)
        .bind(&event.message)
        .bind(event.current_value)
        .bind(event.threshold_value)
        .bind(event.is_read)
        .bind(event.is_resolved)
        .bind(event.notification_sent)
        .bind(event.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn mark_alert_notified(&self, alert_id: i64) -> StorageResult<()> {
        sqlx::query("UPDATE alerts SET notification_sent = TRUE WHERE id = $1")
            .bind(alert_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn owner_contact(&self, user_id: &str) -> StorageResult<Option<String>> {
        let phone: Option<Option<String>> =
            sqlx::query_scalar("SELECT phone FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(phone
            .flatten()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()))
    }

    async fn unnotified_alerts(
        &self,
        min_severity: Severity,
        limit: i64,
    ) -> StorageResult<Vec<StoredAlert>> {
        let severities: Vec<String> = Severity::at_least(min_severity)
            .map(|severity| severity.as_str().to_string())
            .collect();
        let rows: Vec<AlertRow> = sqlx::query_as(
            r#"
            SELECT
                id, user_id, device_id, field, breach, alert_type, severity, title, message,
                current_value, threshold_value, is_read, is_resolved, notification_sent,
                created_at, resolved_at
            FROM alerts
            WHERE severity = ANY($1)
              AND notification_sent = FALSE
              AND is_resolved = FALSE
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(severities)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(AlertRow::into_stored).collect()
    }

    async fn compression_summary(&self, user_id: &str) -> StorageResult<CompressionSummary> {
        let (readings, predicted, avg): (i64, i64, Option<f64>) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*),
                COUNT(*) FILTER (WHERE is_predicted),
                AVG(compression_ratio)
            FROM sensor_data
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(CompressionSummary {
            readings,
            predicted,
            avg_compression_ratio: avg.unwrap_or(0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::eval::ThresholdEngine;
    use crate::alerts::types::ThresholdConfig;
    use chrono::{SubsecRound, Utc};
    use std::env;

    async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
            .execute(&admin_pool)
            .await?;
        drop(admin_pool);

        let schema_name = schema.to_string();
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .after_connect(move |conn, _meta| {
                let schema = schema_name.clone();
                Box::pin(async move {
                    sqlx::query(&format!("SET search_path TO {}", schema))
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(database_url)
            .await?;
        Ok(pool)
    }

    #[tokio::test]
    async fn test_pg_store_round_trip() -> Result<()> {
        if env::var("INGEST_INTEGRATION_TEST").ok().as_deref() != Some("1") {
            return Ok(());
        }
        let database_url = match env::var("INGEST_TEST_DATABASE_URL") {
            Ok(value) => value,
            Err(_) => return Ok(()),
        };
        let schema = format!("ingest_test_{}", std::process::id());
        let pool = setup_test_pool(&database_url, &schema).await?;
        let store = PgStore::new(pool.clone());
        store.ensure_schema().await?;

        sqlx::query("INSERT INTO users (id, phone) VALUES ($1, $2)")
            .bind("7")
            .bind("+2348000000000")
            .execute(&pool)
            .await?;
        sqlx::query("INSERT INTO devices (device_id, user_id) VALUES ($1, $2)")
            .bind("esp32-a1")
            .bind("7")
            .execute(&pool)
            .await?;

        let ts = Utc::now().trunc_subsecs(6);
        let reading = Reading::new(
            "esp32-a1",
            ts,
            Measurements {
                temperature: Some(41.0),
                soil_moisture: Some(22.5),
                signal_strength: Some(-70),
                ..Default::default()
            },
        );
        store
            .put_reading(
                "7",
                &ClassifiedReading {
                    reading: reading.clone(),
                    compression_ratio: 65.0,
                    is_predicted: false,
                },
                ts,
            )
            .await?;

        // arrives second but carries an older device timestamp
        let late = Reading::new(
            "esp32-a1",
            ts - chrono::Duration::minutes(5),
            Measurements {
                temperature: Some(20.0),
                soil_moisture: Some(50.0),
                ..Default::default()
            },
        );
        store
            .put_reading(
                "7",
                &ClassifiedReading {
                    reading: late.clone(),
                    compression_ratio: 65.0,
                    is_predicted: false,
                },
                late.timestamp,
            )
            .await?;

        let last = store.get_last_reading("esp32-a1").await?;
        assert_eq!(last.as_ref().map(|r| &r.values), Some(&late.values));

        let last_seen: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT last_seen FROM devices WHERE device_id = $1")
                .bind("esp32-a1")
                .fetch_one(&pool)
                .await?;
        assert_eq!(last_seen, Some(ts));

        let alerts =
            ThresholdEngine::new().evaluate("esp32-a1", "7", &reading, &ThresholdConfig::default());
        assert_eq!(alerts.len(), 2);
        let mut ids = Vec::new();
        for alert in &alerts {
            ids.push(store.put_alert(alert).await?);
        }
        store.mark_alert_notified(ids[0]).await?;

        let cold = Reading::new(
            "esp32-a1",
            ts,
            Measurements {
                temperature: Some(2.0),
                ..Default::default()
            },
        );
        let warning =
            ThresholdEngine::new().evaluate("esp32-a1", "7", &cold, &ThresholdConfig::default());
        assert_eq!(warning.len(), 1);
        let warning_id = store.put_alert(&warning[0]).await?;

        let pending = store.unnotified_alerts(Severity::Critical, 10).await?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, ids[1]);
        assert_eq!(pending[0].event.field, Field::SoilMoisture);

        let pending = store.unnotified_alerts(Severity::Warning, 10).await?;
        let pending_ids: Vec<i64> = pending.iter().map(|alert| alert.id).collect();
        assert_eq!(pending_ids, vec![ids[1], warning_id]);

        assert_eq!(
            store.owner_contact("7").await?.as_deref(),
            Some("+2348000000000")
        );
        let summary = store.compression_summary("7").await?;
        assert_eq!(summary.readings, 2);
        assert_eq!(summary.predicted, 0);

        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&database_url)
            .await?;
        let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
            .execute(&admin_pool)
            .await;

        Ok(())
    }
}
