use super::state::{DeviceSlot, DeviceState, DeviceStateStore};
use super::types::{ClassifiedReading, MissingFieldPolicy, PredictionConfig};
use crate::telemetry::{Field, Measurements, Reading};
use std::sync::Arc;

/// Classifies readings as predicted or transmitted by comparing them with the
/// device's previous values. Every classification advances the baseline.
#[derive(Clone)]
pub struct CompressionEngine {
    config: PredictionConfig,
    states: Arc<DeviceStateStore>,
}

impl CompressionEngine {
    pub fn new(config: PredictionConfig, states: Arc<DeviceStateStore>) -> Self {
        Self { config, states }
    }

    pub fn states(&self) -> &Arc<DeviceStateStore> {
        &self.states
    }

    #[cfg(test)]
    pub async fn classify(&self, device_id: &str, reading: &Reading) -> ClassifiedReading {
        let mut slot = self.states.lock(device_id).await;
        self.classify_slot(&mut slot, reading)
    }

    /// Classifies against a slot the caller already holds locked.
    pub(in crate::ingest) fn classify_slot(
        &self,
        slot: &mut DeviceSlot,
        reading: &Reading,
    ) -> ClassifiedReading {
        let (compression_ratio, is_predicted) = match slot.last.as_ref() {
            None => (self.config.cold_start_ratio, false),
            Some(previous) if self.is_predictable(&previous.values, &reading.values) => {
                (self.config.predicted_ratio, true)
            }
            Some(_) => (self.config.transmitted_ratio, false),
        };

        slot.last = Some(DeviceState::from(reading));

        tracing::debug!(
            device = %reading.device_id,
            compression_ratio,
            is_predicted,
            "classified reading"
        );

        ClassifiedReading {
            reading: reading.clone(),
            compression_ratio,
            is_predicted,
        }
    }

    /// True when every reference field moved less than its delta.
    pub fn is_predictable(&self, previous: &Measurements, current: &Measurements) -> bool {
        let checks = [
            (Field::Temperature, self.config.temperature_delta),
            (Field::Humidity, self.config.humidity_delta),
            (Field::SoilMoisture, self.config.soil_moisture_delta),
            (Field::LightIntensity, self.config.light_intensity_delta),
        ];

        checks.into_iter().all(|(field, delta)| {
            match self.field_diff(previous.get(field), current.get(field)) {
                Some(diff) => diff < delta,
                None => true,
            }
        })
    }

    fn field_diff(&self, previous: Option<f64>, current: Option<f64>) -> Option<f64> {
        match self.config.missing_fields {
            MissingFieldPolicy::Zero => {
                Some((previous.unwrap_or(0.0) - current.unwrap_or(0.0)).abs())
            }
            MissingFieldPolicy::Skip => match (previous, current) {
                (Some(prev), Some(cur)) => Some((prev - cur).abs()),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn values(temp: f64, humidity: f64, moisture: f64, light: f64) -> Measurements {
        Measurements {
            temperature: Some(temp),
            humidity: Some(humidity),
            soil_moisture: Some(moisture),
            light_intensity: Some(light),
            ..Default::default()
        }
    }

    fn engine(config: PredictionConfig) -> CompressionEngine {
        CompressionEngine::new(config, Arc::new(DeviceStateStore::new()))
    }

    async fn seed(engine: &CompressionEngine, device: &str, baseline: Measurements) {
        engine
            .states()
            .put(
                device,
                DeviceState {
                    timestamp: Utc::now(),
                    values: baseline,
                },
            )
            .await;
    }

    #[tokio::test]
    async fn cold_start_is_transmitted_with_zero_ratio() {
        let engine = engine(PredictionConfig::default());
        let reading = Reading::new("dev-1", Utc::now(), values(25.0, 60.0, 50.0, 500.0));
        let classified = engine.classify("dev-1", &reading).await;
        assert!(!classified.is_predicted);
        assert_eq!(classified.compression_ratio, 0.0);
        let stored = engine.states().get("dev-1").await.expect("baseline stored");
        assert_eq!(stored.values, reading.values);
    }

    #[tokio::test]
    async fn small_changes_are_predicted() {
        let engine = engine(PredictionConfig::default());
        seed(&engine, "dev-1", values(25.0, 60.0, 50.0, 500.0)).await;

        let reading = Reading::new("dev-1", Utc::now(), values(25.5, 61.0, 50.5, 520.0));
        let classified = engine.classify("dev-1", &reading).await;
        assert!(classified.is_predicted);
        assert_eq!(classified.compression_ratio, 85.0);
    }

    #[tokio::test]
    async fn large_change_is_transmitted() {
        let engine = engine(PredictionConfig::default());
        seed(&engine, "dev-1", values(25.0, 60.0, 50.0, 500.0)).await;

        let reading = Reading::new("dev-1", Utc::now(), values(30.0, 60.0, 50.0, 500.0));
        let classified = engine.classify("dev-1", &reading).await;
        assert!(!classified.is_predicted);
        assert_eq!(classified.compression_ratio, 65.0);
    }

    async fn predicted_after(baseline: Measurements, next: Measurements) -> bool {
        let engine = engine(PredictionConfig::default());
        seed(&engine, "dev-1", baseline).await;
        let reading = Reading::new("dev-1", Utc::now(), next);
        engine.classify("dev-1", &reading).await.is_predicted
    }

    #[tokio::test]
    async fn temperature_delta_is_strict() {
        let base = values(25.0, 60.0, 50.0, 500.0);
        assert!(!predicted_after(base.clone(), values(26.0, 60.0, 50.0, 500.0)).await);
        assert!(predicted_after(base, values(25.75, 60.0, 50.0, 500.0)).await);
    }

    #[tokio::test]
    async fn humidity_delta_is_strict() {
        let base = values(25.0, 60.0, 50.0, 500.0);
        assert!(!predicted_after(base.clone(), values(25.0, 62.0, 50.0, 500.0)).await);
        assert!(!predicted_after(base.clone(), values(25.0, 58.0, 50.0, 500.0)).await);
        assert!(predicted_after(base, values(25.0, 61.5, 50.0, 500.0)).await);
    }

    #[tokio::test]
    async fn soil_moisture_delta_is_strict() {
        let base = values(25.0, 60.0, 50.0, 500.0);
        assert!(!predicted_after(base.clone(), values(25.0, 60.0, 51.5, 500.0)).await);
        assert!(!predicted_after(base.clone(), values(25.0, 60.0, 48.5, 500.0)).await);
        assert!(predicted_after(base, values(25.0, 60.0, 51.25, 500.0)).await);
    }

    #[tokio::test]
    async fn light_intensity_delta_is_strict() {
        let base = values(25.0, 60.0, 50.0, 500.0);
        assert!(!predicted_after(base.clone(), values(25.0, 60.0, 50.0, 550.0)).await);
        assert!(!predicted_after(base.clone(), values(25.0, 60.0, 50.0, 450.0)).await);
        assert!(predicted_after(base, values(25.0, 60.0, 50.0, 549.0)).await);
    }

    #[tokio::test]
    async fn baseline_advances_on_predicted_readings() {
        let engine = engine(PredictionConfig::default());
        seed(&engine, "dev-1", values(25.0, 60.0, 50.0, 500.0)).await;

        // Each step is under the delta, but the drift from the first baseline
        // is not. Tracking drift means every step is still predicted.
        for step in 1..=4 {
            let temp = 25.0 + 0.9 * step as f64;
            let reading = Reading::new("dev-1", Utc::now(), values(temp, 60.0, 50.0, 500.0));
            let classified = engine.classify("dev-1", &reading).await;
            assert!(classified.is_predicted, "step {step}");
            let stored = engine.states().get("dev-1").await.expect("baseline");
            assert_eq!(stored.values.temperature, Some(temp));
        }
    }

    #[tokio::test]
    async fn missing_fields_compare_as_zero_by_default() {
        let engine = engine(PredictionConfig::default());
        seed(&engine, "dev-1", values(25.0, 60.0, 50.0, 500.0)).await;

        let reading = Reading::new(
            "dev-1",
            Utc::now(),
            Measurements {
                temperature: Some(25.0),
                humidity: Some(60.0),
                soil_moisture: Some(50.0),
                ..Default::default()
            },
        );
        let classified = engine.classify("dev-1", &reading).await;
        assert!(!classified.is_predicted, "light 500 vs 0 exceeds the delta");
    }

    #[tokio::test]
    async fn skip_policy_ignores_missing_fields() {
        let engine = engine(PredictionConfig {
            missing_fields: MissingFieldPolicy::Skip,
            ..Default::default()
        });
        seed(&engine, "dev-1", values(25.0, 60.0, 50.0, 500.0)).await;

        let reading = Reading::new(
            "dev-1",
            Utc::now(),
            Measurements {
                temperature: Some(25.2),
                ..Default::default()
            },
        );
        let classified = engine.classify("dev-1", &reading).await;
        assert!(classified.is_predicted);
    }

    #[tokio::test]
    async fn ratios_come_from_config() {
        let engine = engine(PredictionConfig {
            predicted_ratio: 90.0,
            transmitted_ratio: 50.0,
            ..Default::default()
        });
        seed(&engine, "dev-1", values(25.0, 60.0, 50.0, 500.0)).await;

        let same = Reading::new("dev-1", Utc::now(), values(25.0, 60.0, 50.0, 500.0));
        assert_eq!(engine.classify("dev-1", &same).await.compression_ratio, 90.0);
        let jump = Reading::new("dev-1", Utc::now(), values(25.0, 80.0, 50.0, 500.0));
        assert_eq!(engine.classify("dev-1", &jump).await.compression_ratio, 50.0);
    }
}
