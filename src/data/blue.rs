//! Adapter for the Morpho Blue GraphQL API.
//!
//! Every market carries its own historical series (`{x: unix seconds, y}` points),
//! so a single market record fans out into one observation per timestamp.

use super::ingestion::{
    de_opt_f64, extract_records, paginate, timestamp_from_secs, FetchWindow, GraphQlRequest,
    GraphQlTransport, Observation, PageRequest, Protocol, ProtocolAdapter,
};
use crate::error::{IngestionCause, IngestionError, MalformedRecordError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MARKETS_QUERY: &str = r#"
query Markets($first: Int, $skip: Int, $minSupplyUsd: Float, $options: TimeseriesOptions) {
  markets(
    first: $first
    skip: $skip
    orderBy: SupplyAssetsUsd
    where: { supplyAssetsUsd_gte: $minSupplyUsd }
  ) {
    items {
      uniqueKey
      lltv
      morphoBlue { chain { network } }
      loanAsset { symbol }
      collateralAsset { symbol }
      historicalState {
        borrowAssetsUsd(options: $options) { x y }
        supplyAssetsUsd(options: $options) { x y }
        utilization(options: $options) { x y }
        rateAtUTarget(options: $options) { x y }
        supplyApy(options: $options) { x y }
        borrowApy(options: $options) { x y }
      }
    }
  }
}"#;

const MARKETS_PATH: [&str; 3] = ["data", "markets", "items"];

#[derive(Debug, Clone, Deserialize)]
struct Point {
    x: f64,
    #[serde(default, deserialize_with = "de_opt_f64")]
    y: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Chain {
    network: String,
}

#[derive(Debug, Deserialize)]
struct Deployment {
    chain: Chain,
}

#[derive(Debug, Deserialize)]
struct Asset {
    symbol: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoricalState {
    borrow_assets_usd: Option<Vec<Point>>,
    supply_assets_usd: Option<Vec<Point>>,
    utilization: Option<Vec<Point>>,
    #[serde(rename = "rateAtUTarget")]
    rate_at_target: Option<Vec<Point>>,
    supply_apy: Option<Vec<Point>>,
    borrow_apy: Option<Vec<Point>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlueMarket {
    unique_key: String,
    #[serde(default, deserialize_with = "de_opt_f64")]
    lltv: Option<f64>,
    morpho_blue: Deployment,
    loan_asset: Asset,
    collateral_asset: Option<Asset>,
    historical_state: Option<HistoricalState>,
}

/// Series values keyed by unix second.
struct SeriesLookup(HashMap<i64, Option<f64>>);

impl SeriesLookup {
    fn new(points: Option<&Vec<Point>>) -> Self {
        let map = points
            .map(|points| points.iter().map(|p| (p.x as i64, p.y)).collect())
            .unwrap_or_default();
        Self(map)
    }

    fn at(&self, x: i64) -> Option<f64> {
        self.0.get(&x).copied().flatten()
    }
}

/// Endpoint and filters for the Morpho Blue API.
#[derive(Debug, Clone)]
pub struct BlueSource {
    pub endpoint: String,
    /// Markets deployed on any other network are dropped.
    pub network: String,
    pub min_supply_usd: f64,
    /// Divisor turning the fixed-point `lltv` into a percentage. Schema versions differ
    /// (1e16 vs 1e17), so it is configured per deployment.
    pub lltv_scale: f64,
    /// Timeseries bucket, e.g. `HOUR` or `DAY`.
    pub interval: String,
}

/// Display label for a Morpho Blue market.
///
/// The LLTV is printed at full precision (shortest round-trip form, keeping a trailing
/// `.0`), so distinct risk parameters never share a label.
pub fn market_label(loan: &str, collateral: Option<&str>, ltv: Option<f64>) -> String {
    match collateral {
        Some(collateral) => {
            let ltv = ltv
                .map(|v| format!("{:?}", v))
                .unwrap_or_else(|| "n/a".to_string());
            format!("{}/{} ({})", collateral, loan, ltv)
        }
        None => format!("{} idle", loan),
    }
}

pub struct BlueAdapter {
    source: BlueSource,
    transport: Arc<dyn GraphQlTransport>,
    page_size: usize,
}

impl BlueAdapter {
    pub fn new(source: BlueSource, transport: Arc<dyn GraphQlTransport>, page_size: usize) -> Self {
        Self {
            source,
            transport,
            page_size,
        }
    }

    fn page_request(&self, window: &FetchWindow, page: &PageRequest) -> GraphQlRequest {
        GraphQlRequest {
            query: MARKETS_QUERY.to_string(),
            variables: json!({
                "first": page.first,
                "skip": page.skip,
                "minSupplyUsd": self.source.min_supply_usd,
                "options": {
                    "startTimestamp": window.start.timestamp(),
                    "endTimestamp": window.end.timestamp(),
                    "interval": self.source.interval,
                },
            }),
        }
    }

    async fn fetch_page(
        &self,
        window: &FetchWindow,
        page: PageRequest,
    ) -> Result<Vec<Value>, IngestionCause> {
        let request = self.page_request(window, &page);
        let response = self
            .transport
            .execute(&self.source.endpoint, &request)
            .await?;
        extract_records(response, &MARKETS_PATH)
    }

    /// Expands one market record into its observations.
    ///
    /// Markets on another network yield an empty vector. Points without borrow or supply
    /// size are dropped individually.
    fn normalise(&self, record: Value) -> Result<Vec<Observation>, MalformedRecordError> {
        let malformed = |reason: String| MalformedRecordError {
            protocol: Protocol::Blue,
            reason,
        };

        let market: BlueMarket =
            serde_json::from_value(record).map_err(|e| malformed(e.to_string()))?;

        if market.morpho_blue.chain.network != self.source.network {
            return Ok(Vec::new());
        }

        let loan_asset = market
            .loan_asset
            .symbol
            .ok_or_else(|| malformed(format!("market {} without loan symbol", market.unique_key)))?;
        let collateral_asset = market.collateral_asset.and_then(|asset| asset.symbol);
        let ltv = market.lltv.map(|raw| raw / self.source.lltv_scale);
        let label = market_label(&loan_asset, collateral_asset.as_deref(), ltv);

        let state = market.historical_state.unwrap_or_default();
        let supply_usd = SeriesLookup::new(state.supply_assets_usd.as_ref());
        let utilization = SeriesLookup::new(state.utilization.as_ref());
        let rate_at_target = SeriesLookup::new(state.rate_at_target.as_ref());
        let supply_apy = SeriesLookup::new(state.supply_apy.as_ref());
        let borrow_apy = SeriesLookup::new(state.borrow_apy.as_ref());

        let mut observations = Vec::new();
        for point in state.borrow_assets_usd.unwrap_or_default() {
            let x = point.x as i64;
            let (Some(total_borrow_usd), Some(total_supply_usd)) = (point.y, supply_usd.at(x))
            else {
                debug!(market = %label, x, "dropping point without market size");
                continue;
            };
            let timestamp = timestamp_from_secs(x).map_err(malformed)?;

            observations.push(Observation {
                timestamp,
                protocol: Protocol::Blue,
                market_id: Some(market.unique_key.clone()),
                market: label.clone(),
                loan_asset: loan_asset.clone(),
                collateral_asset: collateral_asset.clone(),
                supply_apy: supply_apy.at(x),
                borrow_apy: borrow_apy.at(x),
                rate_at_target: rate_at_target.at(x),
                utilization: utilization.at(x),
                total_supply_usd,
                total_borrow_usd,
            });
        }

        Ok(observations)
    }
}

#[async_trait]
impl ProtocolAdapter for BlueAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Blue
    }

    async fn fetch(&self, window: &FetchWindow) -> Result<Vec<Observation>, IngestionError> {
        let records = paginate(self.page_size, "uniqueKey", |page| {
            self.fetch_page(window, page)
        })
        .await
        .map_err(|cause| IngestionError::new(Protocol::Blue, cause))?;

        let markets = records.len();
        let mut observations = Vec::new();
        for record in records {
            match self.normalise(record) {
                Ok(market_observations) => observations.extend(market_observations),
                Err(error) => warn!(%error, "skipping market"),
            }
        }

        info!(
            protocol = %Protocol::Blue,
            markets,
            observations = observations.len(),
            "ingested market histories"
        );
        Ok(observations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ingestion::testing::FakeTransport;
    use chrono::{TimeZone, Utc};

    fn source() -> BlueSource {
        BlueSource {
            endpoint: "http://blue.test".into(),
            network: "ethereum".into(),
            min_supply_usd: 100_000.0,
            lltv_scale: 1e16,
            interval: "HOUR".into(),
        }
    }

    fn window() -> FetchWindow {
        FetchWindow {
            start: Utc.with_ymd_and_hms(2024, 1, 11, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 12, 0, 0, 0).unwrap(),
        }
    }

    fn series(values: &[Option<f64>]) -> Value {
        let points: Vec<Value> = values
            .iter()
            .enumerate()
            .map(|(i, y)| json!({ "x": 1_704_931_200 + 3600 * i as i64, "y": y }))
            .collect();
        json!(points)
    }

    fn market(key: &str, network: &str, collateral: Option<&str>) -> Value {
        json!({
            "uniqueKey": key,
            "lltv": "945000000000000000",
            "morphoBlue": { "chain": { "network": network } },
            "loanAsset": { "symbol": "WETH" },
            "collateralAsset": collateral.map(|symbol| json!({ "symbol": symbol })),
            "historicalState": {
                "borrowAssetsUsd": series(&[Some(80.0), Some(90.0), None]),
                "supplyAssetsUsd": series(&[Some(100.0), Some(100.0), Some(100.0)]),
                "utilization": series(&[Some(0.8), Some(0.9), Some(0.95)]),
                "rateAtUTarget": series(&[Some(0.04), Some(0.0), Some(0.04)]),
                "supplyApy": series(&[Some(0.02), Some(0.03), Some(0.03)]),
                "borrowApy": series(&[Some(0.05), None, Some(0.06)])
            }
        })
    }

    #[test]
    fn test_market_labels() {
        assert_eq!(market_label("WETH", Some("wstETH"), Some(94.5)), "wstETH/WETH (94.5)");
        assert_eq!(market_label("USDC", Some("WBTC"), Some(86.0)), "WBTC/USDC (86.0)");
        assert_eq!(market_label("USDC", None, None), "USDC idle");
    }

    #[test]
    fn test_market_labels_keep_two_decimal_lltv() {
        let scale = 1e17;
        assert_eq!(
            market_label("WETH", Some("wstETH"), Some(945e15 / scale)),
            "wstETH/WETH (9.45)"
        );
        assert_eq!(
            market_label("WETH", Some("wstETH"), Some(915e15 / scale)),
            "wstETH/WETH (9.15)"
        );
    }

    #[tokio::test]
    async fn test_fetch_expands_histories_and_filters_network() {
        let transport = Arc::new(FakeTransport::new(|_request: &GraphQlRequest| {
            Ok(json!({ "data": { "markets": { "items": [
                market("0xaaaa01", "ethereum", Some("wstETH")),
                market("0xbbbb02", "base", Some("wstETH")),
                market("0xcccc03", "ethereum", None),
            ] } } }))
        }));
        let adapter = BlueAdapter::new(source(), transport.clone(), 100);

        let observations = adapter.fetch(&window()).await.unwrap();

        // Third point of each market has no borrow size and is dropped
        assert_eq!(observations.len(), 4);
        assert!(observations
            .iter()
            .all(|o| o.market_id.as_deref() != Some("0xbbbb02")));

        let first = &observations[0];
        assert_eq!(first.market, "wstETH/WETH (94.5)");
        assert_eq!(first.collateral_asset.as_deref(), Some("wstETH"));
        assert_eq!(first.utilization, Some(0.8));
        assert_eq!(first.rate_at_target, Some(0.04));

        let second = &observations[1];
        assert_eq!(second.borrow_apy, None);
        assert_eq!(second.rate_at_target, Some(0.0));

        assert_eq!(observations[2].market, "WETH idle");

        let request = &transport.requests()[0];
        assert_eq!(request.variables["skip"], 0);
        assert_eq!(request.variables["options"]["interval"], "HOUR");
    }

    #[tokio::test]
    async fn test_lltv_scale_is_configurable() {
        let transport = Arc::new(FakeTransport::new(|_request: &GraphQlRequest| {
            let mut record = market("0xaaaa01", "ethereum", Some("wstETH"));
            record["lltv"] = json!("860000000000000000");
            let mut sibling = market("0xdddd04", "ethereum", Some("wstETH"));
            sibling["lltv"] = json!("915000000000000000");
            Ok(json!({ "data": { "markets": { "items": [record, sibling] } } }))
        }));
        let mut legacy = source();
        legacy.lltv_scale = 1e17;
        let adapter = BlueAdapter::new(legacy, transport, 100);

        let observations = adapter.fetch(&window()).await.unwrap();
        assert_eq!(observations[0].market, "wstETH/WETH (8.6)");
        assert_eq!(observations[2].market, "wstETH/WETH (9.15)");
    }

    #[tokio::test]
    async fn test_fetch_surfaces_graphql_errors() {
        let transport = Arc::new(FakeTransport::new(|_request: &GraphQlRequest| {
            Ok(json!({ "errors": [{ "message": "rate limited" }] }))
        }));
        let adapter = BlueAdapter::new(source(), transport, 100);

        let error = adapter.fetch(&window()).await.unwrap_err();
        assert_eq!(error.protocol, Protocol::Blue);
        assert!(matches!(error.cause, IngestionCause::GraphQl(_)));
    }
}
