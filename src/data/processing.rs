use super::unified::{UnifiedRow, UnifiedSeries};
use tracing::debug;

/// Samples in the "daily" rolling window (hourly data).
pub const DAILY_WINDOW: usize = 24;
/// Samples in the "weekly" rolling window.
pub const WEEKLY_WINDOW: usize = 7 * 24;

/// Derives gap-filled rates and rolling means for every market of a unified series.
///
/// Each market is processed in isolation: no value ever leaks across a market boundary.
///
/// # Key Features
/// * Forward-fills zero `rate_at_target` and `borrow_apy` samples
/// * Centered daily and weekly rolling means of borrow rate, supply rate and utilization
pub struct DataProcessor {
    daily_window: usize,
    weekly_window: usize,
}

impl Default for DataProcessor {
    fn default() -> Self {
        Self::new(DAILY_WINDOW, WEEKLY_WINDOW)
    }
}

impl DataProcessor {
    /// Creates a new `DataProcessor` with custom rolling window lengths.
    ///
    /// # Arguments
    /// * `daily_window`: Samples in the short rolling window
    /// * `weekly_window`: Samples in the long rolling window
    ///
    /// # Returns
    /// A new `DataProcessor` instance
    pub fn new(daily_window: usize, weekly_window: usize) -> Self {
        Self {
            daily_window,
            weekly_window,
        }
    }

    /// Processes every market of `series` in place.
    ///
    /// Applies `process_market` to each contiguous market slice, so the series must be
    /// ordered by `(market, timestamp)` as [`UnifiedSeries`] guarantees.
    ///
    /// # Arguments
    /// * `series`: Unified series whose derived columns are overwritten
    pub fn process_batch(&self, series: &mut UnifiedSeries) {
        let mut markets = 0usize;
        for rows in series.markets_mut() {
            self.process_market(rows);
            markets += 1;
        }
        debug!(markets, rows = series.len(), "derived rolling statistics");
    }

    /// Processes one market's time-ordered rows.
    ///
    /// Forward-fills zero `rate_at_target` and `borrow_apy` samples, then computes the
    /// daily and weekly centered means of borrow rate, supply rate and utilization from
    /// the filled values.
    ///
    /// # Arguments
    /// * `rows`: Rows of a single market, oldest first
    pub fn process_market(&self, rows: &mut [UnifiedRow]) {
        let mut rate_at_target: Vec<Option<f64>> =
            rows.iter().map(|r| r.raw_data.rate_at_target).collect();
        let mut borrow: Vec<Option<f64>> = rows.iter().map(|r| r.raw_data.borrow_apy).collect();
        forward_fill_zeros(&mut rate_at_target);
        forward_fill_zeros(&mut borrow);

        let supply: Vec<Option<f64>> = rows.iter().map(|r| r.raw_data.supply_apy).collect();
        let utilization: Vec<Option<f64>> = rows.iter().map(|r| r.raw_data.utilization).collect();

        let borrow_daily = calculate_moving_average(&borrow, self.daily_window);
        let borrow_weekly = calculate_moving_average(&borrow, self.weekly_window);
        let supply_daily = calculate_moving_average(&supply, self.daily_window);
        let supply_weekly = calculate_moving_average(&supply, self.weekly_window);
        let utilization_daily = calculate_moving_average(&utilization, self.daily_window);
        let utilization_weekly = calculate_moving_average(&utilization, self.weekly_window);

        for (i, row) in rows.iter_mut().enumerate() {
            row.raw_data.rate_at_target = rate_at_target[i];
            row.raw_data.borrow_apy = borrow[i];
            row.borrow_apy_daily = borrow_daily[i];
            row.borrow_apy_weekly = borrow_weekly[i];
            row.supply_apy_daily = supply_daily[i];
            row.supply_apy_weekly = supply_weekly[i];
            row.utilization_daily = utilization_daily[i];
            row.utilization_weekly = utilization_weekly[i];
        }
    }
}

/// Replaces zero samples with the most recent non-zero sample.
///
/// Zeros before the first non-zero value have nothing to fall back on and are kept.
/// Missing samples are left missing and do not reset the carried value.
pub fn forward_fill_zeros(values: &mut [Option<f64>]) {
    let mut last_non_zero: Option<f64> = None;
    for value in values.iter_mut() {
        match *value {
            Some(v) if v == 0.0 => {
                if let Some(previous) = last_non_zero {
                    *value = Some(previous);
                }
            }
            Some(v) => last_non_zero = Some(v),
            None => {}
        }
    }
}

/// Centered simple moving average over `window` consecutive samples.
///
/// The window at position `i` covers `[i - window/2, i - window/2 + window - 1]`.
/// Positions whose window runs past either end of the series, or contains a missing
/// sample, yield `None`.
///
/// # Arguments
/// * `values`: Samples in time order, `None` for missing
/// * `window`: Number of samples averaged per position
///
/// # Returns
/// A vector the same length as `values`, with `None` wherever the mean is undefined
pub fn calculate_moving_average(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let n = values.len();
    let mut averages = vec![None; n];
    if window == 0 || window > n {
        return averages;
    }

    let left = window / 2;
    for (i, average) in averages.iter_mut().enumerate() {
        if i < left || i - left + window > n {
            continue;
        }
        let start = i - left;
        let sum: Option<f64> = values[start..start + window].iter().copied().sum();
        *average = sum.map(|s| s / window as f64);
    }

    averages
}
