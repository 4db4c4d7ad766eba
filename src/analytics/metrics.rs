use crate::data::{Protocol, UnifiedRow, UnifiedSeries};
use crate::error::MissingTargetError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Periods per year for 10 minute samples over 252 trading days.
pub const TEN_MINUTE_PERIODS_PER_YEAR: f64 = 252.0 * 24.0 * 6.0;

/// Utilization above which a market is considered close to illiquid.
pub const DEFAULT_LIQUIDITY_THRESHOLD: f64 = 0.99;

/// How the per-sample volatility of borrow rates is scaled to a yearly figure.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Annualization {
    /// Fixed number of sampling periods per year.
    Fixed(f64),
    /// Periods per year derived from the market's median sample spacing.
    FromSampling { trading_days: f64 },
}

impl Default for Annualization {
    fn default() -> Self {
        Annualization::FromSampling {
            trading_days: 252.0,
        }
    }
}

impl Annualization {
    /// Sampling periods per year for a market sampled at `timestamps`.
    ///
    /// Falls back to [`TEN_MINUTE_PERIODS_PER_YEAR`] when the spacing cannot be
    /// measured (fewer than two distinct timestamps).
    pub fn periods_per_year(&self, timestamps: &[DateTime<Utc>]) -> f64 {
        match *self {
            Annualization::Fixed(periods) => periods,
            Annualization::FromSampling { trading_days } => median_spacing_secs(timestamps)
                .map(|spacing| trading_days * 86_400.0 / spacing)
                .unwrap_or(TEN_MINUTE_PERIODS_PER_YEAR),
        }
    }
}

/// Risk and performance summary of one market.
///
/// Target-tracking fields are `None` when the market has no valid utilization target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRow {
    pub market: String,
    pub protocol: Protocol,
    pub loan_asset: String,
    pub utilization_target: Option<f64>,
    pub samples: usize,
    pub avg_utilization: f64,
    pub iae: Option<f64>,
    pub ise: Option<f64>,
    pub liquidity: f64,
    pub ise_positive: Option<f64>,
    pub iae_negative: Option<f64>,
    pub volatility: Option<f64>,
    pub avg_borrow_rate: Option<f64>,
    pub time_weighted_borrow_rate: Option<f64>,
}

/// Computes one [`MetricsRow`] per market of a unified series.
pub struct MetricsEngine {
    liquidity_threshold: f64,
    annualization: Annualization,
}

impl Default for MetricsEngine {
    fn default() -> Self {
        Self::new(DEFAULT_LIQUIDITY_THRESHOLD, Annualization::default())
    }
}

impl MetricsEngine {
    pub fn new(liquidity_threshold: f64, annualization: Annualization) -> Self {
        Self {
            liquidity_threshold,
            annualization,
        }
    }

    /// Metrics for every market; markets without utilization data are skipped.
    pub fn compute(&self, series: &UnifiedSeries) -> Vec<MetricsRow> {
        series
            .markets()
            .filter_map(|rows| self.compute_market(rows))
            .collect()
    }

    /// Metrics for one market's time-ordered rows.
    pub fn compute_market(&self, rows: &[UnifiedRow]) -> Option<MetricsRow> {
        let first = rows.first()?;
        let market = first.raw_data.market.clone();

        let utilization: Vec<f64> = rows.iter().filter_map(|r| r.raw_data.utilization).collect();
        if utilization.is_empty() {
            warn!(%market, "no utilization samples, skipping metrics");
            return None;
        }

        let target = first
            .utilization_target
            .filter(|t| *t > 0.0 && *t < 1.0);
        if target.is_none() {
            let error = MissingTargetError {
                market: market.clone(),
            };
            warn!(%error, "target-tracking metrics undefined");
        }

        let borrow: Vec<(DateTime<Utc>, f64)> = rows
            .iter()
            .filter_map(|r| r.raw_data.borrow_apy.map(|rate| (r.raw_data.timestamp, rate)))
            .collect();
        let borrow_rates: Vec<f64> = borrow.iter().map(|(_, rate)| *rate).collect();
        let timestamps: Vec<DateTime<Utc>> = rows.iter().map(|r| r.raw_data.timestamp).collect();

        let row = MetricsRow {
            protocol: first.raw_data.protocol,
            loan_asset: first.raw_data.loan_asset.clone(),
            utilization_target: first.utilization_target,
            samples: utilization.len(),
            avg_utilization: mean(&utilization).unwrap_or_default(),
            iae: target.map(|t| iae(&utilization, t)),
            ise: target.map(|t| ise(&utilization, t)),
            liquidity: liquidity(&utilization, self.liquidity_threshold),
            ise_positive: target.map(|t| ise_positive(&utilization, t)),
            iae_negative: target.map(|t| iae_negative(&utilization, t)),
            volatility: volatility(&borrow_rates, self.annualization.periods_per_year(&timestamps)),
            avg_borrow_rate: mean(&borrow_rates),
            time_weighted_borrow_rate: time_weighted_average(&borrow),
            market,
        };
        debug!(market = %row.market, samples = row.samples, "computed metrics");
        Some(row)
    }
}

/// Integral absolute error: mean of `|u - target|`.
pub fn iae(utilization: &[f64], target: f64) -> f64 {
    utilization.iter().map(|u| (u - target).abs()).sum::<f64>() / utilization.len() as f64
}

/// Integral squared error: mean of `(u - target)^2`.
pub fn ise(utilization: &[f64], target: f64) -> f64 {
    utilization.iter().map(|u| (u - target).powi(2)).sum::<f64>() / utilization.len() as f64
}

/// Fraction of samples strictly above `threshold`.
pub fn liquidity(utilization: &[f64], threshold: f64) -> f64 {
    let above = utilization.iter().filter(|u| **u > threshold).count();
    above as f64 / utilization.len() as f64
}

/// Squared overshoot normalised by the headroom `1 - target`.
///
/// Summed over overshooting samples but divided by the total sample count, so the
/// result grows with how often overshoot happens as well as with its size.
pub fn ise_positive(utilization: &[f64], target: f64) -> f64 {
    let headroom = 1.0 - target;
    utilization
        .iter()
        .filter(|u| **u > target)
        .map(|u| ((u - target) / headroom).powi(2))
        .sum::<f64>()
        / utilization.len() as f64
}

/// Absolute undershoot relative to the target, divided by the total sample count.
pub fn iae_negative(utilization: &[f64], target: f64) -> f64 {
    utilization
        .iter()
        .filter(|u| **u < target)
        .map(|u| (u - target).abs() / target)
        .sum::<f64>()
        / utilization.len() as f64
}

/// Fraction of samples where the market beats a benchmark on both sides at once.
///
/// A sample counts when its borrow rate is below `borrow_benchmark` while the implied
/// lender yield `rate * utilization` is above `deposit_benchmark`.
///
/// # Arguments
/// * `borrow_rates`: Borrow rate per sample
/// * `utilization`: Utilization per sample, aligned with `borrow_rates`
/// * `borrow_benchmark`: Rate a borrower would pay elsewhere
/// * `deposit_benchmark`: Rate a lender would earn elsewhere
///
/// # Returns
/// `None` when there are no aligned samples.
pub fn inside_spread(
    borrow_rates: &[f64],
    utilization: &[f64],
    borrow_benchmark: f64,
    deposit_benchmark: f64,
) -> Option<f64> {
    let n = borrow_rates.len().min(utilization.len());
    if n == 0 {
        return None;
    }
    let inside = borrow_rates
        .iter()
        .zip(utilization)
        .filter(|(r, u)| **r < borrow_benchmark && *r * *u > deposit_benchmark)
        .count();
    Some(inside as f64 / n as f64)
}

/// Annualized sample standard deviation of period-over-period relative changes.
///
/// Changes from a zero rate are undefined and skipped. Needs at least two changes.
pub fn volatility(rates: &[f64], periods_per_year: f64) -> Option<f64> {
    let changes: Vec<f64> = rates
        .windows(2)
        .map(|pair| (pair[1] - pair[0]) / pair[0])
        .filter(|change| change.is_finite())
        .collect();
    std_dev(&changes).map(|sd| sd * periods_per_year.sqrt())
}

/// Rate average weighted by the time until the next sample; the last sample weighs 0.
pub fn time_weighted_average(samples: &[(DateTime<Utc>, f64)]) -> Option<f64> {
    let mut weighted = 0.0;
    let mut total = 0.0;
    for pair in samples.windows(2) {
        let duration = (pair[1].0 - pair[0].0).num_seconds() as f64;
        weighted += pair[0].1 * duration;
        total += duration;
    }

    if total > 0.0 {
        Some(weighted / total)
    } else {
        None
    }
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n - 1 denominator).
pub fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let avg = mean(values)?;
    let variance =
        values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(variance.sqrt())
}

fn median_spacing_secs(timestamps: &[DateTime<Utc>]) -> Option<f64> {
    let mut spacings: Vec<i64> = timestamps
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_seconds())
        .filter(|secs| *secs > 0)
        .collect();
    if spacings.is_empty() {
        return None;
    }
    spacings.sort_unstable();

    let mid = spacings.len() / 2;
    let median = if spacings.len() % 2 == 0 {
        (spacings[mid - 1] + spacings[mid]) as f64 / 2.0
    } else {
        spacings[mid] as f64
    };
    Some(median)
}
