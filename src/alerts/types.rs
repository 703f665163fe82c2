use crate::telemetry::Field;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 3] = [Severity::Info, Severity::Warning, Severity::Critical];

    /// Every severity ranked at or above `min`.
    pub fn at_least(min: Severity) -> impl Iterator<Item = Severity> {
        Self::ALL.into_iter().filter(move |severity| *severity >= min)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Severity::Info),
            "warning" => Some(Severity::Warning),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a bound a value crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Breach {
    Low,
    High,
}

/// What to raise when a bound is crossed. `message` may reference `{value}`
/// and `{threshold}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertTemplate {
    pub alert_type: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
}

impl AlertTemplate {
    pub fn new(
        alert_type: impl Into<String>,
        severity: Severity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            alert_type: alert_type.into(),
            severity,
            title: title.into(),
            message: message.into(),
        }
    }

    pub fn render(&self, value: f64, threshold: f64) -> String {
        self.message
            .replace("{value}", &format_value(value))
            .replace("{threshold}", &format_value(threshold))
    }
}

/// Whole numbers keep one decimal place ("3.0") so messages read the same for
/// integral and fractional readings.
pub fn format_value(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldThreshold {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub low: Option<AlertTemplate>,
    #[serde(default)]
    pub high: Option<AlertTemplate>,
}

/// Safe operating bounds per field. Read-only while evaluating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThresholdConfig {
    fields: HashMap<Field, FieldThreshold>,
}

impl ThresholdConfig {
    pub fn empty() -> Self {
        Self {
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, field: Field, threshold: FieldThreshold) -> Self {
        self.fields.insert(field, threshold);
        self
    }

    pub fn get(&self, field: Field) -> Option<&FieldThreshold> {
        self.fields.get(&field)
    }

    /// Overlays `other` on top of `self`, field by field.
    pub fn merge(mut self, other: ThresholdConfig) -> Self {
        self.fields.extend(other.fields);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        for field in Field::ALERT_ORDER {
            let Some(threshold) = self.fields.get(&field) else {
                continue;
            };
            for bound in [threshold.min, threshold.max].into_iter().flatten() {
                if !bound.is_finite() {
                    return Err(format!("{field}: bounds must be finite"));
                }
            }
            if let (Some(min), Some(max)) = (threshold.min, threshold.max) {
                if min > max {
                    return Err(format!("{field}: min must be <= max"));
                }
            }
        }
        Ok(())
    }
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self::empty()
            .with_field(
                Field::Temperature,
                FieldThreshold {
                    min: Some(5.0),
                    max: Some(35.0),
                    low: Some(AlertTemplate::new(
                        "temperature_low",
                        Severity::Warning,
                        "Low Temperature Alert",
                        "Temperature dropped to {value}°C, below minimum threshold of {threshold}°C",
                    )),
                    high: Some(AlertTemplate::new(
                        "temperature_high",
                        Severity::Critical,
                        "High Temperature Alert",
                        "Temperature rose to {value}°C, above maximum threshold of {threshold}°C",
                    )),
                },
            )
            .with_field(
                Field::SoilMoisture,
                FieldThreshold {
                    min: Some(30.0),
                    max: Some(80.0),
                    low: Some(AlertTemplate::new(
                        "moisture_low",
                        Severity::Critical,
                        "Low Soil Moisture Alert",
                        "Soil moisture at {value}%, below minimum threshold. Irrigation recommended.",
                    )),
                    high: None,
                },
            )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvent {
    pub user_id: String,
    pub device_id: String,
    pub field: Field,
    pub breach: Breach,
    pub alert_type: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub current_value: f64,
    pub threshold_value: f64,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    pub is_resolved: bool,
    pub notification_sent: bool,
}

/// An alert as persisted, with its storage-assigned id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredAlert {
    pub id: i64,
    #[serde(flatten)]
    pub event: AlertEvent,
    pub resolved_at: Option<DateTime<Utc>>,
}
