use super::types::{AlertEvent, AlertTemplate, Breach, ThresholdConfig};
use crate::telemetry::{Field, Reading};

/// Evaluates readings against configured bounds. Holds no state, so the same
/// input always yields the same alerts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdEngine;

impl ThresholdEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(
        &self,
        device_id: &str,
        user_id: &str,
        reading: &Reading,
        config: &ThresholdConfig,
    ) -> Vec<AlertEvent> {
        let mut alerts = Vec::new();

        for field in Field::ALERT_ORDER {
            let Some(value) = reading.values.get(field) else {
                continue;
            };
            let Some(threshold) = config.get(field) else {
                continue;
            };

            let breach = match (threshold.min, threshold.max) {
                (Some(min), _) if value < min => Some((Breach::Low, min, threshold.low.as_ref())),
                (_, Some(max)) if value > max => {
                    Some((Breach::High, max, threshold.high.as_ref()))
                }
                _ => None,
            };

            let Some((breach, bound, Some(template))) = breach else {
                continue;
            };

            alerts.push(build_alert(
                device_id, user_id, reading, field, breach, bound, value, template,
            ));
        }

        alerts
    }
}

#[allow(clippy::too_many_arguments)]
fn build_alert(
    device_id: &str,
    user_id: &str,
    reading: &Reading,
    field: Field,
    breach: Breach,
    bound: f64,
    value: f64,
    template: &AlertTemplate,
) -> AlertEvent {
    AlertEvent {
        user_id: user_id.to_string(),
        device_id: device_id.to_string(),
        field,
        breach,
        alert_type: template.alert_type.clone(),
        severity: template.severity,
        title: template.title.clone(),
        message: template.render(value, bound),
        current_value: value,
        threshold_value: bound,
        created_at: reading.timestamp,
        is_read: false,
        is_resolved: false,
        notification_sent: false,
    }
}
