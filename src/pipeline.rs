use crate::config::Config;
use crate::data::{
    BlueAdapter, DataProcessor, FetchWindow, GraphQlTransport, IdentityResolver, MessariAdapter,
    Observation, ProtocolAdapter, UnifiedSeries, UtilizationTargets,
};
use crate::error::{IngestionError, RefreshError};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

/// Whether the persisted snapshot is too old to reuse.
///
/// A missing marker always refreshes; otherwise the elapsed time must exceed
/// `threshold_secs`.
pub fn needs_refresh(
    last_marker: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold_secs: i64,
) -> bool {
    match last_marker {
        Some(marker) => (now - marker).num_seconds() > threshold_secs,
        None => true,
    }
}

/// Result of a completed refresh cycle.
#[derive(Debug)]
pub struct RefreshOutcome {
    pub series: UnifiedSeries,
    /// Marker to persist once the series has been written.
    pub marker: DateTime<Utc>,
    /// Protocols skipped this cycle.
    pub failures: Vec<IngestionError>,
}

#[derive(Debug)]
pub enum RefreshDecision {
    /// The prior snapshot is recent enough; the marker is unchanged.
    Skipped { marker: DateTime<Utc> },
    Refreshed(RefreshOutcome),
}

/// Ingestion, identity resolution, unification and rolling derivation in one pass.
pub struct Pipeline {
    adapters: Vec<Box<dyn ProtocolAdapter>>,
    resolver: IdentityResolver,
    targets: UtilizationTargets,
    processor: DataProcessor,
    start: DateTime<Utc>,
}

impl Pipeline {
    pub fn new(
        adapters: Vec<Box<dyn ProtocolAdapter>>,
        resolver: IdentityResolver,
        targets: UtilizationTargets,
        processor: DataProcessor,
        start: DateTime<Utc>,
    ) -> Self {
        Self {
            adapters,
            resolver,
            targets,
            processor,
            start,
        }
    }

    /// Wires the three protocol adapters over a shared transport.
    ///
    /// # Arguments
    /// * `config`: Endpoints, page size, identity overrides, targets and start time
    /// * `transport`: GraphQL transport shared by every adapter
    ///
    /// # Returns
    /// A `Pipeline` ingesting Morpho Blue, Compound and Aave
    pub fn from_config(config: &Config, transport: Arc<dyn GraphQlTransport>) -> Self {
        let adapters: Vec<Box<dyn ProtocolAdapter>> = vec![
            Box::new(BlueAdapter::new(
                config.blue.clone(),
                transport.clone(),
                config.page_size,
            )),
            Box::new(MessariAdapter::new(
                config.compound.clone(),
                transport.clone(),
                config.page_size,
            )),
            Box::new(MessariAdapter::new(
                config.aave.clone(),
                transport,
                config.page_size,
            )),
        ];

        Self::new(
            adapters,
            IdentityResolver::new(config.overrides.clone()),
            config.targets.clone(),
            DataProcessor::default(),
            config.start,
        )
    }

    /// Refreshes only when the prior marker is older than `threshold_secs`.
    ///
    /// # Arguments
    /// * `prior_marker`: Time of the last successful refresh, if any
    /// * `now`: Current time, used as the fetch window end and the new marker
    /// * `threshold_secs`: Maximum snapshot age in seconds
    ///
    /// # Returns
    /// `RefreshDecision::Skipped` carrying the unchanged marker, or the refreshed series
    /// with the marker to persist
    ///
    /// # Errors
    /// Returns a [`RefreshError`] if a refresh was needed and could not produce data
    pub async fn run(
        &self,
        prior_marker: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        threshold_secs: i64,
    ) -> Result<RefreshDecision, RefreshError> {
        match prior_marker {
            Some(marker) if !needs_refresh(prior_marker, now, threshold_secs) => {
                info!(%marker, "snapshot is fresh, skipping refresh");
                Ok(RefreshDecision::Skipped { marker })
            }
            _ => self.refresh(now).await.map(RefreshDecision::Refreshed),
        }
    }

    /// Fetches every protocol concurrently and rebuilds the unified series from scratch.
    ///
    /// A failing protocol is dropped for this cycle. The refresh fails only when no
    /// protocol delivered data.
    ///
    /// # Arguments
    /// * `now`: End of the fetch window and the marker of the new snapshot
    ///
    /// # Returns
    /// The resolved, unified and derived series together with the per-protocol failures
    ///
    /// # Errors
    /// * `RefreshError::NoSources` if no adapter is configured
    /// * `RefreshError::AllSourcesFailed` if every adapter failed
    /// * `RefreshError::EmptySeries` if the adapters returned no observations
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<RefreshOutcome, RefreshError> {
        if self.adapters.is_empty() {
            return Err(RefreshError::NoSources);
        }

        let window = FetchWindow {
            start: self.start,
            end: now,
        };
        let results = join_all(self.adapters.iter().map(|adapter| adapter.fetch(&window))).await;

        let mut tables: Vec<Vec<Observation>> = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(table) => tables.push(table),
                Err(error) => {
                    warn!(%error, "skipping protocol for this refresh");
                    failures.push(error);
                }
            }
        }

        if tables.is_empty() {
            return Err(RefreshError::AllSourcesFailed(failures));
        }

        let observations = self.resolver.resolve(tables.into_iter().flatten().collect());
        if observations.is_empty() {
            return Err(RefreshError::EmptySeries);
        }

        let mut series = UnifiedSeries::build(observations, &self.targets);
        self.processor.process_batch(&mut series);

        info!(
            rows = series.len(),
            markets = series.markets().count(),
            failed = failures.len(),
            "refresh complete"
        );
        Ok(RefreshOutcome {
            series,
            marker: now,
            failures,
        })
    }
}
