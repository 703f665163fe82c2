use crate::telemetry::Reading;
use serde::{Deserialize, Serialize};

/// A reading plus its prediction classification. Never mutated once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedReading {
    pub reading: Reading,
    pub compression_ratio: f64,
    pub is_predicted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IngestResult {
    pub compression_ratio: f64,
    pub is_predicted: bool,
}

impl From<&ClassifiedReading> for IngestResult {
    fn from(classified: &ClassifiedReading) -> Self {
        Self {
            compression_ratio: classified.compression_ratio,
            is_predicted: classified.is_predicted,
        }
    }
}

/// How a reference field absent from either reading enters the diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingFieldPolicy {
    /// Absent values compare as 0.
    #[default]
    Zero,
    /// Absent values are left out of the comparison.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    pub temperature_delta: f64,
    pub humidity_delta: f64,
    pub soil_moisture_delta: f64,
    pub light_intensity_delta: f64,
    pub predicted_ratio: f64,
    pub transmitted_ratio: f64,
    pub cold_start_ratio: f64,
    pub missing_fields: MissingFieldPolicy,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            temperature_delta: 1.0,
            humidity_delta: 2.0,
            soil_moisture_delta: 1.5,
            light_intensity_delta: 50.0,
            predicted_ratio: 85.0,
            transmitted_ratio: 65.0,
            cold_start_ratio: 0.0,
            missing_fields: MissingFieldPolicy::Zero,
        }
    }
}

impl PredictionConfig {
    pub fn validate(&self) -> Result<(), String> {
        let deltas = [
            ("temperature_delta", self.temperature_delta),
            ("humidity_delta", self.humidity_delta),
            ("soil_moisture_delta", self.soil_moisture_delta),
            ("light_intensity_delta", self.light_intensity_delta),
        ];
        for (name, value) in deltas {
            if !value.is_finite() || value < 0.0 {
                return Err(format!("prediction.{name} must be a finite value >= 0"));
            }
        }
        let ratios = [
            ("predicted_ratio", self.predicted_ratio),
            ("transmitted_ratio", self.transmitted_ratio),
            ("cold_start_ratio", self.cold_start_ratio),
        ];
        for (name, value) in ratios {
            if !(0.0..=100.0).contains(&value) {
                return Err(format!("prediction.{name} must be within 0..=100"));
            }
        }
        Ok(())
    }
}
