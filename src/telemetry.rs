use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Measurement channels a field device can report that thresholds may be
/// configured against. Location is carried on the reading but never monitored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Temperature,
    Humidity,
    SoilMoisture,
    LightIntensity,
    PhLevel,
    BatteryLevel,
    SignalStrength,
}

impl Field {
    /// Threshold check order. Temperature and soil moisture come first so alert
    /// lists are stable across runs.
    pub const ALERT_ORDER: [Field; 7] = [
        Field::Temperature,
        Field::SoilMoisture,
        Field::Humidity,
        Field::LightIntensity,
        Field::PhLevel,
        Field::BatteryLevel,
        Field::SignalStrength,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Temperature => "temperature",
            Field::Humidity => "humidity",
            Field::SoilMoisture => "soil_moisture",
            Field::LightIntensity => "light_intensity",
            Field::PhLevel => "ph_level",
            Field::BatteryLevel => "battery_level",
            Field::SignalStrength => "signal_strength",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub soil_moisture: Option<f64>,
    #[serde(default)]
    pub light_intensity: Option<f64>,
    #[serde(default)]
    pub ph_level: Option<f64>,
    #[serde(default)]
    pub battery_level: Option<f64>,
    #[serde(default)]
    pub signal_strength: Option<i32>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

impl Measurements {
    pub fn get(&self, field: Field) -> Option<f64> {
        match field {
            Field::Temperature => self.temperature,
            Field::Humidity => self.humidity,
            Field::SoilMoisture => self.soil_moisture,
            Field::LightIntensity => self.light_intensity,
            Field::PhLevel => self.ph_level,
            Field::BatteryLevel => self.battery_level,
            Field::SignalStrength => self.signal_strength.map(f64::from),
        }
    }
}

/// One timestamped set of measurements from a device.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub values: Measurements,
}

impl Reading {
    pub fn new(device_id: impl Into<String>, timestamp: DateTime<Utc>, values: Measurements) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            values,
        }
    }
}

/// Reading body as posted by devices over HTTP or published over MQTT.
#[derive(Debug, Clone, Deserialize)]
pub struct WireReading {
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<WireId>,
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
    #[serde(flatten)]
    pub values: Measurements,
}

/// User ids arrive as either JSON numbers or strings depending on firmware.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireId {
    Str(String),
    Int(i64),
}

impl WireId {
    pub fn into_string(self) -> String {
        match self {
            WireId::Str(s) => s.trim().to_string(),
            WireId::Int(v) => v.to_string(),
        }
    }
}

/// RFC 3339 strings, integer epoch milliseconds or float epoch seconds.
/// Anything unparseable falls back to receipt time.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Str(String),
    Int(i64),
    Float(f64),
}

impl WireTimestamp {
    pub fn to_datetime(&self) -> DateTime<Utc> {
        match self {
            WireTimestamp::Str(s) => DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            WireTimestamp::Int(ms) => millis_to_dt(*ms),
            WireTimestamp::Float(ts) => millis_to_dt((*ts * 1000.0) as i64),
        }
    }
}

fn millis_to_dt(ms: i64) -> DateTime<Utc> {
    let secs = ms.div_euclid(1000);
    let nanos = (ms.rem_euclid(1000) * 1_000_000) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_else(Utc::now)
}

impl WireReading {
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
            .as_ref()
            .map(WireTimestamp::to_datetime)
            .unwrap_or_else(Utc::now)
    }
}

/// A reading decoded from an MQTT publish, with the owner and device taken
/// from the topic.
#[derive(Debug, Clone)]
pub struct TopicReading {
    pub user_id: String,
    pub reading: Reading,
}

/// Decodes `<prefix>/<user_id>/<device_id>/reading`. Topics that do not match
/// yield `Ok(None)`.
pub fn parse_mqtt_payload(
    topic_prefix: &str,
    topic: &str,
    payload: &mut [u8],
) -> Result<Option<TopicReading>> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 4 || parts[0] != topic_prefix || parts[3] != "reading" {
        return Ok(None);
    }

    let wire: WireReading = simd_json::serde::from_slice(payload)?;
    let timestamp = wire.timestamp();

    Ok(Some(TopicReading {
        user_id: parts[1].to_string(),
        reading: Reading::new(parts[2], timestamp, wire.values),
    }))
}
