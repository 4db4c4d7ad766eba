pub mod correlation;
pub mod metrics;

pub use correlation::{correlate, CorrelationMatrix, PivotTable};
pub use metrics::{Annualization, MetricsEngine, MetricsRow};
