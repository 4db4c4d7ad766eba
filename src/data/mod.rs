pub mod blue;
pub mod identity;
pub mod ingestion;
pub mod messari;
pub mod processing;
pub mod unified;

pub use blue::{BlueAdapter, BlueSource};
pub use identity::{IdentityResolver, LabelOverrides};
pub use ingestion::{
    FetchWindow, GraphQlTransport, HttpTransport, Observation, Protocol, ProtocolAdapter,
};
pub use messari::{MessariAdapter, MessariSource};
pub use processing::DataProcessor;
pub use unified::{MetricKind, UnifiedRow, UnifiedSeries, UtilizationTargets};
