use crate::error::{IngestionCause, IngestionError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Lending venues the pipeline knows how to ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Protocol {
    Aave,
    Compound,
    Blue,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Aave => "Aave",
            Protocol::Compound => "Compound",
            Protocol::Blue => "Blue",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One normalised sample of a lending market.
///
/// Rates and utilization are fractions (0.05 == 5%). `None` always means the upstream
/// source did not report the value; a reported zero stays `Some(0.0)`.
///
/// # Fields
/// * `timestamp`: Sample time
/// * `protocol`: Venue the sample came from
/// * `market_id`: Protocol-native stable key, absent for venues without one
/// * `market`: Display label, rewritten by the identity resolver
/// * `loan_asset`: Symbol of the borrowable asset
/// * `collateral_asset`: Symbol of the collateral asset for isolated markets
/// * `supply_apy` / `borrow_apy`: Variable lender and borrower rates
/// * `rate_at_target`: Borrow rate at target utilization (Morpho Blue only)
/// * `utilization`: Borrowed over supplied
/// * `total_supply_usd` / `total_borrow_usd`: Market size in USD
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    pub protocol: Protocol,
    pub market_id: Option<String>,
    pub market: String,
    pub loan_asset: String,
    pub collateral_asset: Option<String>,
    pub supply_apy: Option<f64>,
    pub borrow_apy: Option<f64>,
    pub rate_at_target: Option<f64>,
    pub utilization: Option<f64>,
    pub total_supply_usd: f64,
    pub total_borrow_usd: f64,
}

/// Time bounds requested from every adapter during one refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A source of normalised observations for one protocol.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Fetches every observation inside `window`.
    ///
    /// Records that fail normalisation are skipped; transport or schema failures abort
    /// the whole protocol with an [`IngestionError`].
    async fn fetch(&self, window: &FetchWindow) -> Result<Vec<Observation>, IngestionError>;
}

/// Body of a GraphQL POST request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphQlRequest {
    pub query: String,
    pub variables: Value,
}

/// Executes GraphQL documents against an endpoint and returns the raw JSON body.
#[async_trait]
pub trait GraphQlTransport: Send + Sync {
    async fn execute(&self, endpoint: &str, request: &GraphQlRequest)
        -> Result<Value, IngestionCause>;
}

/// `reqwest` backed transport with a per-request timeout.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl GraphQlTransport for HttpTransport {
    async fn execute(
        &self,
        endpoint: &str,
        request: &GraphQlRequest,
    ) -> Result<Value, IngestionCause> {
        let response = self
            .client
            .post(endpoint)
            .json(request)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;

        Ok(response)
    }
}

/// Pulls the record array found at `path` out of a GraphQL response body.
///
/// A non-empty `errors` member or any missing path segment fails the whole response.
pub fn extract_records(mut response: Value, path: &[&str]) -> Result<Vec<Value>, IngestionCause> {
    if let Some(errors) = response.get("errors") {
        let empty = errors.as_array().map(Vec::is_empty).unwrap_or(errors.is_null());
        if !empty {
            return Err(IngestionCause::GraphQl(errors.to_string()));
        }
    }

    let mut cursor = &mut response;
    for segment in path {
        cursor = cursor
            .get_mut(*segment)
            .ok_or_else(|| IngestionCause::Shape(format!("missing `{}`", path.join("."))))?;
    }

    match cursor.take() {
        Value::Array(records) => Ok(records),
        other => Err(IngestionCause::Shape(format!(
            "`{}` is not an array: {}",
            path.join("."),
            other
        ))),
    }
}

/// Position of the next page to request.
///
/// `after` is the cursor value of the previous page's last record, `skip` the number of
/// records received so far. Sources use whichever their API supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub first: usize,
    pub after: String,
    pub skip: usize,
}

/// Drives cursor pagination until a short page signals the end of the data.
///
/// The loop stops as soon as a page holds fewer than `page_size` records, so an empty
/// page terminates too. A full page ending on the cursor it was requested with means the
/// server ignored the cursor, which is reported rather than looped on.
pub async fn paginate<F, Fut>(
    page_size: usize,
    cursor_field: &str,
    mut fetch_page: F,
) -> Result<Vec<Value>, IngestionCause>
where
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = Result<Vec<Value>, IngestionCause>>,
{
    let page_size = page_size.max(1);
    let mut records = Vec::new();
    let mut request = PageRequest {
        first: page_size,
        after: String::new(),
        skip: 0,
    };

    loop {
        let page = fetch_page(request.clone()).await?;
        let received = page.len();
        debug!(
            skip = request.skip,
            after = %request.after,
            received,
            "fetched page"
        );

        if received < page_size {
            records.extend(page);
            break;
        }

        let next_cursor = page
            .last()
            .and_then(|record| record.get(cursor_field))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| {
                IngestionCause::Shape(format!("page record without `{}` cursor", cursor_field))
            })?;

        if !request.after.is_empty() && next_cursor == request.after {
            return Err(IngestionCause::StalledCursor(request.after));
        }

        records.extend(page);
        request = PageRequest {
            first: page_size,
            after: next_cursor,
            skip: request.skip + received,
        };
    }

    Ok(records)
}

/// Borrowed over supplied, undefined when nothing is supplied.
pub fn utilization_of(total_supply_usd: f64, total_borrow_usd: f64) -> Option<f64> {
    if total_supply_usd > 0.0 {
        Some(total_borrow_usd / total_supply_usd)
    } else {
        None
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberRepr {
    Number(f64),
    Text(String),
}

impl NumberRepr {
    fn into_f64<E: serde::de::Error>(self) -> Result<f64, E> {
        match self {
            NumberRepr::Number(value) => Ok(value),
            NumberRepr::Text(text) => text
                .trim()
                .parse::<f64>()
                .map_err(|e| E::custom(format!("invalid number {:?}: {}", text, e))),
        }
    }
}

/// Accepts JSON numbers and decimal strings (subgraphs encode BigDecimal as text).
pub(crate) fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    NumberRepr::deserialize(deserializer)?.into_f64()
}

pub(crate) fn de_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<NumberRepr>::deserialize(deserializer)? {
        Some(repr) => repr.into_f64().map(Some),
        None => Ok(None),
    }
}

pub(crate) fn timestamp_from_secs(secs: i64) -> Result<DateTime<Utc>, String> {
    DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| format!("timestamp {} out of range", secs))
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;

    fn ids(total: usize) -> Vec<Value> {
        (0..total).map(|i| json!({ "id": format!("{:06}", i) })).collect()
    }

    async fn run_paged(total: usize, page_size: usize) -> (Vec<Value>, usize) {
        let source = ids(total);
        let calls = Cell::new(0);
        let records = paginate(page_size, "id", |page| {
            calls.set(calls.get() + 1);
            let start = source
                .iter()
                .position(|r| r["id"].as_str().unwrap() > page.after.as_str())
                .unwrap_or(source.len());
            let end = (start + page.first).min(source.len());
            let slice = source[start..end].to_vec();
            async move { Ok(slice) }
        })
        .await
        .unwrap();
        (records, calls.get())
    }

    #[tokio::test]
    async fn test_pagination_returns_every_record_in_ceil_requests() {
        let (records, calls) = run_paged(2500, 1000).await;
        assert_eq!(records.len(), 2500);
        assert_eq!(calls, 3);
        assert_eq!(records[1000]["id"], "001000");
    }

    #[tokio::test]
    async fn test_pagination_stops_on_empty_final_page() {
        let (records, calls) = run_paged(2000, 1000).await;
        assert_eq!(records.len(), 2000);
        assert_eq!(calls, 3);

        let (records, calls) = run_paged(0, 1000).await;
        assert!(records.is_empty());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_pagination_rejects_stalled_cursor() {
        let result = paginate(2, "id", |_page| async {
            Ok(vec![json!({ "id": "a" }), json!({ "id": "b" })])
        })
        .await;

        assert!(matches!(result, Err(IngestionCause::StalledCursor(cursor)) if cursor == "b"));
    }

    #[tokio::test]
    async fn test_pagination_tracks_offset() {
        let skips = std::cell::RefCell::new(Vec::new());
        let records = paginate(2, "uniqueKey", |page| {
            skips.borrow_mut().push(page.skip);
            let page_records: Vec<Value> = (page.skip..(page.skip + 2).min(5))
                .map(|i| json!({ "uniqueKey": format!("k{}", i) }))
                .collect();
            async move { Ok(page_records) }
        })
        .await
        .unwrap();

        assert_eq!(records.len(), 5);
        assert_eq!(*skips.borrow(), vec![0, 2, 4]);
    }

    #[test]
    fn test_extract_records_reports_graphql_errors() {
        let response = json!({ "errors": [{ "message": "bad query" }], "data": null });
        let result = extract_records(response, &["data", "markets"]);
        assert!(matches!(result, Err(IngestionCause::GraphQl(_))));
    }

    #[test]
    fn test_extract_records_walks_nested_path() {
        let response = json!({ "data": { "markets": { "items": [1, 2, 3] } } });
        let records = extract_records(response, &["data", "markets", "items"]).unwrap();
        assert_eq!(records.len(), 3);

        let missing = extract_records(json!({ "data": {} }), &["data", "markets", "items"]);
        assert!(matches!(missing, Err(IngestionCause::Shape(_))));
    }

    #[test]
    fn test_number_parsing_accepts_strings_and_numbers() {
        #[derive(Deserialize)]
        struct Sample {
            #[serde(deserialize_with = "de_f64")]
            a: f64,
            #[serde(default, deserialize_with = "de_opt_f64")]
            b: Option<f64>,
        }

        let sample: Sample = serde_json::from_value(json!({ "a": "12.5", "b": 3 })).unwrap();
        assert_eq!(sample.a, 12.5);
        assert_eq!(sample.b, Some(3.0));

        let sample: Sample = serde_json::from_value(json!({ "a": 1, "b": null })).unwrap();
        assert_eq!(sample.b, None);
    }

    #[test]
    fn test_utilization_requires_supply() {
        assert_eq!(utilization_of(100.0, 50.0), Some(0.5));
        assert_eq!(utilization_of(0.0, 50.0), None);
        // Over-utilization passes through unchanged
        assert_eq!(utilization_of(100.0, 120.0), Some(1.2));
    }
}
