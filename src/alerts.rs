mod dispatch;
pub mod eval;
pub mod types;

pub use dispatch::AlertDispatcher;
pub use eval::ThresholdEngine;
pub use types::{Severity, ThresholdConfig};
