use crate::data::{MetricKind, UnifiedSeries};
use crate::error::InsufficientOverlapError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Pairwise correlation of one metric across markets.
///
/// `corr[i][j]` and `p_values[i][j]` refer to `markets[i]` and `markets[j]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationMatrix {
    pub field: String,
    pub markets: Vec<String>,
    pub corr: Vec<Vec<Option<f64>>>,
    pub p_values: Vec<Vec<Option<f64>>>,
}

impl CorrelationMatrix {
    pub fn get(&self, left: &str, right: &str) -> Option<f64> {
        let i = self.markets.iter().position(|m| m == left)?;
        let j = self.markets.iter().position(|m| m == right)?;
        self.corr[i][j]
    }
}

/// `(timestamp x market)` grid of one metric, forward-filled per market.
#[derive(Debug, Clone, PartialEq)]
pub struct PivotTable {
    pub timestamps: Vec<DateTime<Utc>>,
    pub markets: Vec<String>,
    /// One column per market, aligned with `timestamps`.
    pub columns: Vec<Vec<Option<f64>>>,
}

impl PivotTable {
    /// Pivots `field` for `markets` onto the union of their sample times.
    ///
    /// Each column is forward-filled so markets reporting at different cadences line up
    /// on a common grid. Cells before a market's first sample stay empty.
    pub fn build(series: &UnifiedSeries, markets: &BTreeSet<String>, field: MetricKind) -> Self {
        let mut cells: BTreeMap<DateTime<Utc>, BTreeMap<&str, Option<f64>>> = BTreeMap::new();
        for row in series.rows() {
            let market = row.raw_data.market.as_str();
            if !markets.contains(market) {
                continue;
            }
            cells
                .entry(row.raw_data.timestamp)
                .or_default()
                .insert(market, field.value(row));
        }

        let timestamps: Vec<DateTime<Utc>> = cells.keys().copied().collect();
        let markets: Vec<String> = markets.iter().cloned().collect();
        let columns = markets
            .iter()
            .map(|market| {
                let mut column: Vec<Option<f64>> = cells
                    .values()
                    .map(|by_market| by_market.get(market.as_str()).copied().flatten())
                    .collect();
                forward_fill(&mut column);
                column
            })
            .collect();

        Self {
            timestamps,
            markets,
            columns,
        }
    }
}

fn forward_fill(column: &mut [Option<f64>]) {
    let mut last = None;
    for cell in column.iter_mut() {
        match cell {
            Some(value) => last = Some(*value),
            None => *cell = last,
        }
    }
}

/// Pearson correlation and two-sided p-value computed per market pair, using only the
/// timestamps where both markets have a value.
pub fn correlate(
    series: &UnifiedSeries,
    markets: &BTreeSet<String>,
    field: MetricKind,
) -> CorrelationMatrix {
    let pivot = PivotTable::build(series, markets, field);
    let n = pivot.markets.len();
    let mut corr = vec![vec![None; n]; n];
    let mut p_values = vec![vec![None; n]; n];

    for i in 0..n {
        for j in i..n {
            let (x, y) = overlapping(&pivot.columns[i], &pivot.columns[j]);
            if x.len() < 2 {
                let error = InsufficientOverlapError {
                    left: pivot.markets[i].clone(),
                    right: pivot.markets[j].clone(),
                    overlap: x.len(),
                };
                debug!(%error, "correlation undefined");
                continue;
            }

            if let Some(r) = pearson(&x, &y) {
                let p = p_value(r, x.len());
                corr[i][j] = Some(r);
                corr[j][i] = Some(r);
                p_values[i][j] = p;
                p_values[j][i] = p;
            }
        }
    }

    CorrelationMatrix {
        field: field.to_string(),
        markets: pivot.markets,
        corr,
        p_values,
    }
}

fn overlapping(left: &[Option<f64>], right: &[Option<f64>]) -> (Vec<f64>, Vec<f64>) {
    left.iter()
        .zip(right)
        .filter_map(|(a, b)| Some(((*a)?, (*b)?)))
        .unzip()
}

/// Pearson correlation coefficient, `None` when either side is constant.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let mean_x = x[..n].iter().sum::<f64>() / n as f64;
    let mean_y = y[..n].iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (a, b) in x[..n].iter().zip(&y[..n]) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    if var_x == 0.0 || var_y == 0.0 {
        return None;
    }
    Some((cov / (var_x * var_y).sqrt()).clamp(-1.0, 1.0))
}

/// Two-sided p-value of `r` under the null of zero correlation (Student t, n - 2 dof).
pub fn p_value(r: f64, n: usize) -> Option<f64> {
    if n < 2 {
        return None;
    }
    // Two points always correlate perfectly
    if n == 2 {
        return Some(1.0);
    }
    if r.abs() >= 1.0 {
        return Some(0.0);
    }

    let dof = (n - 2) as f64;
    let t = r * (dof / (1.0 - r * r)).sqrt();
    let distribution = StudentsT::new(0.0, 1.0, dof).ok()?;
    Some((2.0 * (1.0 - distribution.cdf(t.abs()))).clamp(0.0, 1.0))
}
