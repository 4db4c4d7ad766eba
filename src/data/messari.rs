//! Adapter for lending protocols indexed with the Messari subgraph schema
//! (Aave v3 and Compound v3 hourly market snapshots).

use super::ingestion::{
    de_f64, extract_records, paginate, timestamp_from_secs, utilization_of, FetchWindow,
    GraphQlRequest, GraphQlTransport, Observation, PageRequest, Protocol, ProtocolAdapter,
};
use crate::error::{IngestionCause, IngestionError, MalformedRecordError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SNAPSHOT_QUERY: &str = r#"
query HourlySnapshots($startHour: Int, $endHour: Int, $id: String, $first: Int) {
  marketHourlySnapshots(
    first: $first
    orderBy: id
    orderDirection: asc
    where: { hours_gte: $startHour, hours_lte: $endHour, id_gt: $id }
  ) {
    id
    hours
    rates { rate side type }
    totalBorrowBalanceUSD
    totalDepositBalanceUSD
    market { name }
  }
}"#;

const FILTERED_SNAPSHOT_QUERY: &str = r#"
query HourlySnapshots($startHour: Int, $endHour: Int, $id: String, $first: Int, $marketNames: [String!]) {
  marketHourlySnapshots(
    first: $first
    orderBy: id
    orderDirection: asc
    where: { hours_gte: $startHour, hours_lte: $endHour, id_gt: $id, market_: { name_in: $marketNames } }
  ) {
    id
    hours
    rates { rate side type }
    totalBorrowBalanceUSD
    totalDepositBalanceUSD
    market { name }
  }
}"#;

const SNAPSHOT_PATH: [&str; 2] = ["data", "marketHourlySnapshots"];

/// Which side of the market a rate applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateSide {
    Lender,
    Borrower,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateType {
    Variable,
    Stable,
    Fixed,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateEntry {
    #[serde(deserialize_with = "de_f64")]
    pub rate: f64,
    pub side: RateSide,
    #[serde(rename = "type")]
    pub kind: RateType,
}

#[derive(Debug, Deserialize)]
struct MarketRef {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HourlySnapshot {
    hours: i64,
    #[serde(default)]
    rates: Vec<RateEntry>,
    #[serde(rename = "totalBorrowBalanceUSD", deserialize_with = "de_f64")]
    total_borrow_usd: f64,
    #[serde(rename = "totalDepositBalanceUSD", deserialize_with = "de_f64")]
    total_supply_usd: f64,
    market: MarketRef,
}

/// Picks the variable-rate entry for `side`, as a percentage.
///
/// Returns `None` when no such entry exists; a reported 0% stays `Some(0.0)`.
pub fn select_variable_rate(rates: &[RateEntry], side: RateSide) -> Option<f64> {
    rates
        .iter()
        .rev()
        .find(|entry| entry.side == side && entry.kind == RateType::Variable)
        .map(|entry| entry.rate)
}

/// Loan asset symbol from a Messari market name.
///
/// "Aave Ethereum USDC" -> "USDC", "Compound v3 Ethereum WETH - wstETH" -> "WETH".
pub fn loan_asset_from_name(name: &str) -> Option<&str> {
    name.split(" - ")
        .next()
        .and_then(|head| head.split_whitespace().last())
}

/// Endpoint and market selection for one Messari-indexed protocol.
#[derive(Debug, Clone)]
pub struct MessariSource {
    pub protocol: Protocol,
    pub endpoint: String,
    /// Restricts the query to `"{prefix} {asset}"` market names when set.
    pub market_name_prefix: Option<String>,
    pub loan_assets: Vec<String>,
}

impl MessariSource {
    fn market_names(&self) -> Option<Vec<String>> {
        let prefix = self.market_name_prefix.as_ref()?;
        if self.loan_assets.is_empty() {
            return None;
        }
        Some(
            self.loan_assets
                .iter()
                .map(|asset| format!("{} {}", prefix, asset))
                .collect(),
        )
    }
}

pub struct MessariAdapter {
    source: MessariSource,
    transport: Arc<dyn GraphQlTransport>,
    page_size: usize,
}

impl MessariAdapter {
    pub fn new(source: MessariSource, transport: Arc<dyn GraphQlTransport>, page_size: usize) -> Self {
        Self {
            source,
            transport,
            page_size,
        }
    }

    fn page_request(&self, window: &FetchWindow, page: &PageRequest) -> GraphQlRequest {
        let mut variables = json!({
            "startHour": window.start.timestamp() / 3600,
            "endHour": window.end.timestamp() / 3600,
            "id": page.after,
            "first": page.first,
        });

        let query = match self.source.market_names() {
            Some(names) => {
                variables["marketNames"] = json!(names);
                FILTERED_SNAPSHOT_QUERY
            }
            None => SNAPSHOT_QUERY,
        };

        GraphQlRequest {
            query: query.to_string(),
            variables,
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
        extract_records(response, &SNAPSHOT_PATH)
    }

    /// Normalises one snapshot record.
    ///
    /// `Ok(None)` marks a snapshot without any rate entries, which the subgraph emits
    /// for markets that were not yet active.
    fn normalise(&self, record: Value) -> Result<Option<Observation>, MalformedRecordError> {
        let protocol = self.source.protocol;
        let malformed = |reason: String| MalformedRecordError { protocol, reason };

        let snapshot: HourlySnapshot =
            serde_json::from_value(record).map_err(|e| malformed(e.to_string()))?;

        if snapshot.rates.is_empty() {
            return Ok(None);
        }

        let loan_asset = loan_asset_from_name(&snapshot.market.name)
            .ok_or_else(|| malformed(format!("empty market name {:?}", snapshot.market.name)))?
            .to_string();
        let timestamp = timestamp_from_secs(snapshot.hours * 3600).map_err(malformed)?;

        Ok(Some(Observation {
            timestamp,
            protocol,
            market_id: None,
            market: format!("{} - {}", loan_asset, protocol),
            collateral_asset: None,
            supply_apy: select_variable_rate(&snapshot.rates, RateSide::Lender).map(|r| r / 100.0),
            borrow_apy: select_variable_rate(&snapshot.rates, RateSide::Borrower)
                .map(|r| r / 100.0),
            rate_at_target: None,
            utilization: utilization_of(snapshot.total_supply_usd, snapshot.total_borrow_usd),
            total_supply_usd: snapshot.total_supply_usd,
            total_borrow_usd: snapshot.total_borrow_usd,
            loan_asset,
        }))
    }
}

#[async_trait]
impl ProtocolAdapter for MessariAdapter {
    fn protocol(&self) -> Protocol {
        self.source.protocol
    }

    async fn fetch(&self, window: &FetchWindow) -> Result<Vec<Observation>, IngestionError> {
        let protocol = self.source.protocol;
        let records = paginate(self.page_size, "id", |page| self.fetch_page(window, page))
            .await
            .map_err(|cause| IngestionError::new(protocol, cause))?;

        let fetched = records.len();
        let mut observations = Vec::with_capacity(fetched);
        let mut inactive = 0usize;
        for record in records {
            match self.normalise(record) {
                Ok(Some(observation)) => observations.push(observation),
                Ok(None) => inactive += 1,
                Err(error) => warn!(%error, "skipping record"),
            }
        }

        debug!(%protocol, inactive, "skipped snapshots without rates");
        info!(
            %protocol,
            fetched,
            kept = observations.len(),
            "ingested hourly snapshots"
        );
        Ok(observations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ingestion::testing::FakeTransport;
    use chrono::{TimeZone, Utc};

    fn window() -> FetchWindow {
        FetchWindow {
            start: Utc.with_ymd_and_hms(2024, 1, 11, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 1, 12, 0, 0, 0).unwrap(),
        }
    }

    fn snapshot(id: usize, hours: i64) -> Value {
        json!({
            "id": format!("{:04}", id),
            "hours": hours,
            "rates": [
                { "rate": "3.5", "side": "LENDER", "type": "VARIABLE" },
                { "rate": "5.0", "side": "BORROWER", "type": "VARIABLE" },
                { "rate": "9.0", "side": "BORROWER", "type": "STABLE" }
            ],
            "totalBorrowBalanceUSD": "900",
            "totalDepositBalanceUSD": "1000",
            "market": { "name": "Aave Ethereum USDC" }
        })
    }

    fn aave_source(loan_assets: Vec<String>) -> MessariSource {
        MessariSource {
            protocol: Protocol::Aave,
            endpoint: "http://aave.test".into(),
            market_name_prefix: Some("Aave Ethereum".into()),
            loan_assets,
        }
    }

    #[test]
    fn test_variable_rate_selection_keeps_missing_distinct_from_zero() {
        let rates: Vec<RateEntry> = serde_json::from_value(json!([
            { "rate": "0", "side": "LENDER", "type": "VARIABLE" },
            { "rate": "7.1", "side": "BORROWER", "type": "STABLE" }
        ]))
        .unwrap();

        assert_eq!(select_variable_rate(&rates, RateSide::Lender), Some(0.0));
        assert_eq!(select_variable_rate(&rates, RateSide::Borrower), None);
    }

    #[test]
    fn test_loan_asset_from_market_name() {
        assert_eq!(loan_asset_from_name("Aave Ethereum USDC"), Some("USDC"));
        assert_eq!(
            loan_asset_from_name("Compound v3 Ethereum WETH - wstETH"),
            Some("WETH")
        );
        assert_eq!(loan_asset_from_name(""), None);
    }

    #[tokio::test]
    async fn test_fetch_paginates_and_normalises() {
        let total = 5;
        let transport = Arc::new(FakeTransport::new(move |request: &GraphQlRequest| {
            let after = request.variables["id"].as_str().unwrap_or_default().to_string();
            let first = request.variables["first"].as_u64().unwrap() as usize;
            let page: Vec<Value> = (0..total)
                .map(|i| snapshot(i, 473_592 + i as i64))
                .filter(|s| s["id"].as_str().unwrap() > after.as_str())
                .take(first)
                .collect();
            Ok(json!({ "data": { "marketHourlySnapshots": page } }))
        }));

        let adapter = MessariAdapter::new(aave_source(vec!["USDC".into()]), transport.clone(), 2);
        let observations = adapter.fetch(&window()).await.unwrap();

        assert_eq!(observations.len(), 5);
        assert_eq!(transport.requests().len(), 3);

        let first = &observations[0];
        assert_eq!(first.market, "USDC - Aave");
        assert_eq!(first.loan_asset, "USDC");
        assert_eq!(first.supply_apy, Some(0.035));
        assert_eq!(first.borrow_apy, Some(0.05));
        assert_eq!(first.utilization, Some(0.9));
        assert_eq!(first.rate_at_target, None);
        assert_eq!(first.timestamp.timestamp(), 473_592 * 3600);

        let request = &transport.requests()[0];
        assert_eq!(request.variables["marketNames"], json!(["Aave Ethereum USDC"]));
        assert!(request.query.contains("name_in"));
    }

    #[tokio::test]
    async fn test_fetch_skips_malformed_and_inactive_records() {
        let transport = Arc::new(FakeTransport::new(|_request: &GraphQlRequest| {
            let mut inactive = snapshot(1, 10);
            inactive["rates"] = json!([]);
            let mut broken = snapshot(2, 11);
            broken["totalDepositBalanceUSD"] = json!("not-a-number");
            Ok(json!({ "data": { "marketHourlySnapshots": [snapshot(0, 9), inactive, broken] } }))
        }));

        let source = MessariSource {
            protocol: Protocol::Compound,
            endpoint: "http://compound.test".into(),
            market_name_prefix: None,
            loan_assets: Vec::new(),
        };
        let adapter = MessariAdapter::new(source, transport.clone(), 100);
        let observations = adapter.fetch(&window()).await.unwrap();

        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].market, "USDC - Compound");
        assert!(transport.requests()[0].variables.get("marketNames").is_none());
    }

    #[tokio::test]
    async fn test_fetch_fails_protocol_on_schema_deviation() {
        let transport = Arc::new(FakeTransport::new(|_request: &GraphQlRequest| {
            Ok(json!({ "data": { "snapshots": [] } }))
        }));
        let adapter = MessariAdapter::new(aave_source(Vec::new()), transport, 100);

        let error = adapter.fetch(&window()).await.unwrap_err();
        assert_eq!(error.protocol, Protocol::Aave);
        assert!(matches!(error.cause, IngestionCause::Shape(_)));
    }
}
