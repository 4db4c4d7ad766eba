use super::ingestion::{Observation, Protocol};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// Utilization targets the protocols' rate curves are tuned around.
///
/// Lookup is by `(protocol, loan_asset)` first, then the protocol-wide value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UtilizationTargets {
    #[serde(default)]
    pub per_asset: HashMap<Protocol, HashMap<String, f64>>,
    #[serde(default)]
    pub protocol_wide: HashMap<Protocol, f64>,
}

impl UtilizationTargets {
    /// Targets published by the protocols' interest rate models.
    pub fn known() -> Self {
        let assets = |pairs: &[(&str, f64)]| -> HashMap<String, f64> {
            pairs.iter().map(|(a, t)| (a.to_string(), *t)).collect()
        };

        Self {
            per_asset: HashMap::from([
                (
                    Protocol::Aave,
                    assets(&[
                        ("USDC", 0.92),
                        ("USDT", 0.92),
                        ("WETH", 0.90),
                        ("DAI", 0.92),
                        ("PYUSD", 0.80),
                    ]),
                ),
                (Protocol::Compound, assets(&[("WETH", 0.85), ("USDC", 0.90)])),
            ]),
            protocol_wide: HashMap::from([(Protocol::Blue, 0.90)]),
        }
    }

    pub fn lookup(&self, protocol: Protocol, loan_asset: &str) -> Option<f64> {
        self.per_asset
            .get(&protocol)
            .and_then(|assets| assets.get(loan_asset))
            .or_else(|| self.protocol_wide.get(&protocol))
            .copied()
    }
}

/// An observation aligned onto the unified schema, with its derived columns.
///
/// # Fields
/// * `raw_data`: The normalised observation
/// * `utilization_target`: Target attached from [`UtilizationTargets`]
/// * `*_daily` / `*_weekly`: Centered 24 and 168 sample rolling means
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedRow {
    pub raw_data: Observation,
    pub utilization_target: Option<f64>,
    pub borrow_apy_daily: Option<f64>,
    pub borrow_apy_weekly: Option<f64>,
    pub supply_apy_daily: Option<f64>,
    pub supply_apy_weekly: Option<f64>,
    pub utilization_daily: Option<f64>,
    pub utilization_weekly: Option<f64>,
}

impl UnifiedRow {
    pub fn new(raw_data: Observation, utilization_target: Option<f64>) -> Self {
        Self {
            raw_data,
            utilization_target,
            borrow_apy_daily: None,
            borrow_apy_weekly: None,
            supply_apy_daily: None,
            supply_apy_weekly: None,
            utilization_daily: None,
            utilization_weekly: None,
        }
    }
}

/// Columns a caller can select from the unified series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    BorrowApy,
    BorrowApyDaily,
    BorrowApyWeekly,
    SupplyApy,
    SupplyApyDaily,
    SupplyApyWeekly,
    Utilization,
    UtilizationDaily,
    UtilizationWeekly,
    RateAtTarget,
}

impl MetricKind {
    pub const ALL: [MetricKind; 10] = [
        MetricKind::BorrowApy,
        MetricKind::BorrowApyDaily,
        MetricKind::BorrowApyWeekly,
        MetricKind::SupplyApy,
        MetricKind::SupplyApyDaily,
        MetricKind::SupplyApyWeekly,
        MetricKind::Utilization,
        MetricKind::UtilizationDaily,
        MetricKind::UtilizationWeekly,
        MetricKind::RateAtTarget,
    ];

    pub fn value(&self, row: &UnifiedRow) -> Option<f64> {
        match self {
            MetricKind::BorrowApy => row.raw_data.borrow_apy,
            MetricKind::BorrowApyDaily => row.borrow_apy_daily,
            MetricKind::BorrowApyWeekly => row.borrow_apy_weekly,
            MetricKind::SupplyApy => row.raw_data.supply_apy,
            MetricKind::SupplyApyDaily => row.supply_apy_daily,
            MetricKind::SupplyApyWeekly => row.supply_apy_weekly,
            MetricKind::Utilization => row.raw_data.utilization,
            MetricKind::UtilizationDaily => row.utilization_daily,
            MetricKind::UtilizationWeekly => row.utilization_weekly,
            MetricKind::RateAtTarget => row.raw_data.rate_at_target,
        }
    }

    /// Snapshot column name.
    pub fn column(&self) -> &'static str {
        match self {
            MetricKind::BorrowApy => "borrow_apy",
            MetricKind::BorrowApyDaily => "borrow_apy_daily",
            MetricKind::BorrowApyWeekly => "borrow_apy_weekly",
            MetricKind::SupplyApy => "supply_apy",
            MetricKind::SupplyApyDaily => "supply_apy_daily",
            MetricKind::SupplyApyWeekly => "supply_apy_weekly",
            MetricKind::Utilization => "utilization",
            MetricKind::UtilizationDaily => "utilization_daily",
            MetricKind::UtilizationWeekly => "utilization_weekly",
            MetricKind::RateAtTarget => "rate_at_target",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MetricKind::ALL
            .into_iter()
            .find(|kind| kind.column().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown metric column {:?}", s))
    }
}

/// All protocols' observations in one table, ordered by `(market, timestamp)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnifiedSeries {
    rows: Vec<UnifiedRow>,
}

impl UnifiedSeries {
    /// Unions observations from every protocol and attaches utilization targets.
    ///
    /// Upstream pages are not globally ordered, so rows are re-sorted here; the rolling
    /// deriver relies on this order.
    pub fn build<I>(observations: I, targets: &UtilizationTargets) -> Self
    where
        I: IntoIterator<Item = Observation>,
    {
        let rows = observations
            .into_iter()
            .map(|observation| {
                let target = targets.lookup(observation.protocol, &observation.loan_asset);
                UnifiedRow::new(observation, target)
            })
            .collect();
        Self::from_rows(rows)
    }

    /// Wraps already derived rows, restoring the `(market, timestamp)` order.
    pub fn from_rows(mut rows: Vec<UnifiedRow>) -> Self {
        rows.sort_by(|a, b| {
            a.raw_data
                .market
                .cmp(&b.raw_data.market)
                .then(a.raw_data.timestamp.cmp(&b.raw_data.timestamp))
        });
        Self { rows }
    }

    pub fn rows(&self) -> &[UnifiedRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Contiguous per-market slices, in market order.
    pub fn markets(&self) -> impl Iterator<Item = &[UnifiedRow]> {
        self.rows
            .chunk_by(|a, b| a.raw_data.market == b.raw_data.market)
    }

    pub(crate) fn markets_mut(&mut self) -> impl Iterator<Item = &mut [UnifiedRow]> {
        self.rows
            .chunk_by_mut(|a, b| a.raw_data.market == b.raw_data.market)
    }

    pub fn loan_assets(&self) -> BTreeSet<&str> {
        self.rows
            .iter()
            .map(|row| row.raw_data.loan_asset.as_str())
            .collect()
    }

    /// Markets lending `loan_asset`.
    pub fn markets_for_asset(&self, loan_asset: &str) -> BTreeSet<&str> {
        self.rows
            .iter()
            .filter(|row| row.raw_data.loan_asset == loan_asset)
            .map(|row| row.raw_data.market.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn observation(protocol: Protocol, market: &str, asset: &str, hour: u32) -> Observation {
        Observation {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap(),
            protocol,
            market_id: None,
            market: market.to_string(),
            loan_asset: asset.to_string(),
            collateral_asset: None,
            supply_apy: Some(0.02),
            borrow_apy: Some(0.04),
            rate_at_target: None,
            utilization: Some(0.8),
            total_supply_usd: 10.0,
            total_borrow_usd: 8.0,
        }
    }

    #[test]
    fn test_target_lookup_prefers_asset_then_protocol() {
        let targets = UtilizationTargets::known();
        assert_eq!(targets.lookup(Protocol::Aave, "PYUSD"), Some(0.80));
        assert_eq!(targets.lookup(Protocol::Compound, "WETH"), Some(0.85));
        assert_eq!(targets.lookup(Protocol::Blue, "anything"), Some(0.90));
        assert_eq!(targets.lookup(Protocol::Aave, "GHO"), None);
    }

    #[test]
    fn test_build_sorts_by_market_then_time() {
        let series = UnifiedSeries::build(
            vec![
                observation(Protocol::Compound, "USDC - Compound", "USDC", 2),
                observation(Protocol::Aave, "USDC - Aave", "USDC", 1),
                observation(Protocol::Compound, "USDC - Compound", "USDC", 0),
                observation(Protocol::Aave, "USDC - Aave", "USDC", 0),
            ],
            &UtilizationTargets::known(),
        );

        let order: Vec<(&str, u32)> = series
            .rows()
            .iter()
            .map(|r| {
                (
                    r.raw_data.market.as_str(),
                    chrono::Timelike::hour(&r.raw_data.timestamp),
                )
            })
            .collect();
        assert_eq!(
            order,
            vec![
                ("USDC - Aave", 0),
                ("USDC - Aave", 1),
                ("USDC - Compound", 0),
                ("USDC - Compound", 2),
            ]
        );
        assert_eq!(series.rows()[0].utilization_target, Some(0.92));
        assert_eq!(series.rows()[2].utilization_target, Some(0.90));
        assert_eq!(series.markets().count(), 2);
    }

    #[test]
    fn test_metric_kind_parses_column_names() {
        assert_eq!("borrow_apy_daily".parse(), Ok(MetricKind::BorrowApyDaily));
        assert_eq!("Utilization".parse(), Ok(MetricKind::Utilization));
        assert!("hourly_rolling_avg".parse::<MetricKind>().is_err());
    }
}
