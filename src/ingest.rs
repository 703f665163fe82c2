mod compression;
mod ingestor;
mod state;
pub mod types;


pub use compression::CompressionEngine;
pub use state::DeviceStateStore;
pub use types::{ClassifiedReading, PredictionConfig};

use crate::alerts::{AlertDispatcher, ThresholdConfig, ThresholdEngine};
use crate::stats::IngestStats;
use crate::storage::Storage;
use std::sync::Arc;

/// Entry point for incoming readings: classification, persistence, threshold
/// checks and alert dispatch.
#[derive(Clone)]
pub struct Ingestor {
    storage: Arc<dyn Storage>,
    compression: CompressionEngine,
    thresholds: ThresholdEngine,
    threshold_config: Arc<ThresholdConfig>,
    alerts: AlertDispatcher,
    stats: Arc<IngestStats>,
}
