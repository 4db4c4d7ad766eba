use crate::data::Protocol;
use thiserror::Error;

/// Why a single protocol's ingestion was abandoned for this refresh cycle.
#[derive(Debug, Error)]
pub enum IngestionCause {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("graphql endpoint returned errors: {0}")]
    GraphQl(String),

    #[error("unexpected response shape: {0}")]
    Shape(String),

    #[error("pagination cursor did not advance past {0}")]
    StalledCursor(String),
}

/// All of a protocol's data for this cycle is unavailable.
#[derive(Debug, Error)]
#[error("{protocol} ingestion failed: {cause}")]
pub struct IngestionError {
    pub protocol: Protocol,
    pub cause: IngestionCause,
}

impl IngestionError {
    pub fn new(protocol: Protocol, cause: impl Into<IngestionCause>) -> Self {
        Self {
            protocol,
            cause: cause.into(),
        }
    }
}

/// A single upstream record could not be normalised into an `Observation`.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("malformed {protocol} record: {reason}")]
pub struct MalformedRecordError {
    pub protocol: Protocol,
    pub reason: String,
}

/// A market has no usable utilization target, so target-tracking metrics are undefined.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("market {market} has no valid utilization target")]
pub struct MissingTargetError {
    pub market: String,
}

/// A correlation pair shares fewer than two timestamps.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("markets {left} and {right} overlap on {overlap} timestamps")]
pub struct InsufficientOverlapError {
    pub left: String,
    pub right: String,
    pub overlap: usize,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("refresh failed: every protocol adapter failed ({})", summarise(.0))]
    AllSourcesFailed(Vec<IngestionError>),

    #[error("refresh failed: no adapters configured")]
    NoSources,

    #[error("refresh failed: no observations in the requested window")]
    EmptySeries,
}

fn summarise(errors: &[IngestionError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid refresh marker: {0}")]
    InvalidMarker(String),
}
