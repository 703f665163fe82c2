use crate::telemetry::{Measurements, Reading};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Last accepted values for one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub timestamp: DateTime<Utc>,
    pub values: Measurements,
}

impl From<&Reading> for DeviceState {
    fn from(reading: &Reading) -> Self {
        Self {
            timestamp: reading.timestamp,
            values: reading.values.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct DeviceSlot {
    pub(in crate::ingest) last: Option<DeviceState>,
    /// Set once the slot was seeded from storage (or written directly).
    pub(in crate::ingest) hydrated: bool,
}

/// Per-device baselines. Each device has its own async lock so a
/// read-classify-write cycle is atomic for that device while other devices
/// proceed in parallel.
#[derive(Debug, Default)]
pub struct DeviceStateStore {
    slots: std::sync::Mutex<HashMap<String, Arc<Mutex<DeviceSlot>>>>,
}

impl DeviceStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, device_id: &str) -> Arc<Mutex<DeviceSlot>> {
        let mut slots = self
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slots
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DeviceSlot::default())))
            .clone()
    }

    /// Exclusive access to a device's baseline until the guard drops.
    pub async fn lock(&self, device_id: &str) -> OwnedMutexGuard<DeviceSlot> {
        self.slot(device_id).lock_owned().await
    }

    #[cfg(test)]
    pub async fn get(&self, device_id: &str) -> Option<DeviceState> {
        let slot = {
            let slots = self
                .slots
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slots.get(device_id).cloned()
        }?;
        let guard = slot.lock().await;
        guard.last.clone()
    }

    #[cfg(test)]
    pub async fn put(&self, device_id: &str, state: DeviceState) {
        let mut guard = self.lock(device_id).await;
        guard.last = Some(state);
        guard.hydrated = true;
    }

    pub fn device_count(&self) -> usize {
        self.slots
            .lock()
            .map(|slots| slots.len())
            .unwrap_or_default()
    }
}
