//! Flat CSV snapshot of the unified series and the refresh marker file.
//!
//! The snapshot is the only artifact handed to presentation code. Writes go through a
//! temporary file and a rename so readers never observe a half-written table.

use crate::data::{Observation, Protocol, UnifiedRow, UnifiedSeries};
use crate::error::SnapshotError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One CSV line. Empty cells are missing values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SnapshotRow {
    date: DateTime<Utc>,
    protocol: Protocol,
    market: String,
    loan_asset: String,
    supply_apy: Option<f64>,
    borrow_apy: Option<f64>,
    rate_at_target: Option<f64>,
    utilization: Option<f64>,
    total_supply_usd: f64,
    total_borrow_usd: f64,
    utilization_target: Option<f64>,
    borrow_apy_daily: Option<f64>,
    borrow_apy_weekly: Option<f64>,
    utilization_daily: Option<f64>,
    utilization_weekly: Option<f64>,
    supply_apy_daily: Option<f64>,
    supply_apy_weekly: Option<f64>,
}

impl From<&UnifiedRow> for SnapshotRow {
    fn from(row: &UnifiedRow) -> Self {
        let raw = &row.raw_data;
        Self {
            date: raw.timestamp,
            protocol: raw.protocol,
            market: raw.market.clone(),
            loan_asset: raw.loan_asset.clone(),
            supply_apy: raw.supply_apy,
            borrow_apy: raw.borrow_apy,
            rate_at_target: raw.rate_at_target,
            utilization: raw.utilization,
            total_supply_usd: raw.total_supply_usd,
            total_borrow_usd: raw.total_borrow_usd,
            utilization_target: row.utilization_target,
            borrow_apy_daily: row.borrow_apy_daily,
            borrow_apy_weekly: row.borrow_apy_weekly,
            utilization_daily: row.utilization_daily,
            utilization_weekly: row.utilization_weekly,
            supply_apy_daily: row.supply_apy_daily,
            supply_apy_weekly: row.supply_apy_weekly,
        }
    }
}

impl From<SnapshotRow> for UnifiedRow {
    fn from(row: SnapshotRow) -> Self {
        UnifiedRow {
            raw_data: Observation {
                timestamp: row.date,
                protocol: row.protocol,
                market_id: None,
                market: row.market,
                loan_asset: row.loan_asset,
                collateral_asset: None,
                supply_apy: row.supply_apy,
                borrow_apy: row.borrow_apy,
                rate_at_target: row.rate_at_target,
                utilization: row.utilization,
                total_supply_usd: row.total_supply_usd,
                total_borrow_usd: row.total_borrow_usd,
            },
            utilization_target: row.utilization_target,
            borrow_apy_daily: row.borrow_apy_daily,
            borrow_apy_weekly: row.borrow_apy_weekly,
            supply_apy_daily: row.supply_apy_daily,
            supply_apy_weekly: row.supply_apy_weekly,
            utilization_daily: row.utilization_daily,
            utilization_weekly: row.utilization_weekly,
        }
    }
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Replaces the snapshot at `path` with `series`.
///
/// The table is written next to `path` first and renamed over it once complete. On
/// failure the partial file is removed and any previous snapshot is left as it was.
///
/// # Errors
/// Returns a [`SnapshotError`] if the temporary file cannot be written or renamed.
pub fn write_snapshot(path: &Path, series: &UnifiedSeries) -> Result<(), SnapshotError> {
    let tmp = temporary_path(path);
    let written = write_rows(&tmp, series)
        .and_then(|_| fs::rename(&tmp, path).map_err(SnapshotError::from));

    if let Err(e) = written {
        if let Err(cleanup) = fs::remove_file(&tmp) {
            if cleanup.kind() != ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %cleanup, "could not remove partial snapshot");
            }
        }
        return Err(e);
    }

    info!(path = %path.display(), rows = series.len(), "wrote snapshot");
    Ok(())
}

fn write_rows(path: &Path, series: &UnifiedSeries) -> Result<(), SnapshotError> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in series.rows() {
        writer.serialize(SnapshotRow::from(row))?;
    }
    writer.flush()?;
    Ok(())
}

/// Loads a snapshot written by [`write_snapshot`].
///
/// Market ids and collateral assets are not part of the table and come back empty.
pub fn read_snapshot(path: &Path) -> Result<UnifiedSeries, SnapshotError> {
    let mut reader = csv::Reader::from_path(path)?;
    let rows = reader
        .deserialize::<SnapshotRow>()
        .map(|row| row.map(UnifiedRow::from))
        .collect::<Result<Vec<_>, _>>()?;

    info!(path = %path.display(), rows = rows.len(), "loaded snapshot");
    Ok(UnifiedSeries::from_rows(rows))
}

/// Reads the time of the last successful refresh; a missing file means never.
pub fn read_marker(path: &Path) -> Result<Option<DateTime<Utc>>, SnapshotError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let secs: f64 = contents
        .trim()
        .parse()
        .map_err(|_| SnapshotError::InvalidMarker(contents.trim().to_string()))?;
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9).round().clamp(0.0, 999_999_999.0) as u32;

    DateTime::<Utc>::from_timestamp(whole, nanos)
        .map(Some)
        .ok_or_else(|| SnapshotError::InvalidMarker(contents.trim().to_string()))
}

/// Records `at` as the time of the last successful refresh (unix seconds).
pub fn write_marker(path: &Path, at: DateTime<Utc>) -> Result<(), SnapshotError> {
    let secs = at.timestamp() as f64 + f64::from(at.timestamp_subsec_micros()) / 1e6;
    fs::write(path, format!("{:.6}", secs))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataProcessor, UtilizationTargets};
    use chrono::{Duration, TimeZone};
    use tempfile::tempdir;

    fn sample_series() -> UnifiedSeries {
        let start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let observations = (0..30).map(|i| Observation {
            timestamp: start + Duration::hours(i),
            protocol: if i % 2 == 0 { Protocol::Aave } else { Protocol::Blue },
            market_id: (i % 2 == 1).then(|| "0xabc".to_string()),
            market: if i % 2 == 0 { "USDC - Aave".into() } else { "WBTC/USDC (86.0)".into() },
            loan_asset: "USDC".into(),
            collateral_asset: None,
            supply_apy: Some(0.02),
            borrow_apy: Some(0.04 + i as f64 / 1000.0),
            rate_at_target: (i % 2 == 1).then_some(0.04),
            utilization: Some(0.9),
            total_supply_usd: 1_000_000.0,
            total_borrow_usd: 900_000.0,
        });
        let mut series = UnifiedSeries::build(observations, &UtilizationTargets::known());
        DataProcessor::new(3, 5).process_batch(&mut series);
        series
    }

    #[test]
    fn test_snapshot_preserves_table_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("df_all.csv");
        let series = sample_series();

        write_snapshot(&path, &series).unwrap();
        let loaded = read_snapshot(&path).unwrap();

        assert_eq!(loaded.len(), series.len());
        for (original, restored) in series.rows().iter().zip(loaded.rows()) {
            assert_eq!(restored.raw_data.market, original.raw_data.market);
            assert_eq!(restored.raw_data.timestamp, original.raw_data.timestamp);
            assert_eq!(restored.raw_data.rate_at_target, original.raw_data.rate_at_target);
            assert_eq!(restored.utilization_target, original.utilization_target);
            assert_eq!(restored.borrow_apy_daily, original.borrow_apy_daily);
            assert_eq!(restored.raw_data.market_id, None);
        }
        assert!(!temporary_path(&path).exists());

        let header = fs::read_to_string(&path).unwrap();
        assert!(header.starts_with(
            "date,protocol,market,loan_asset,supply_apy,borrow_apy,rate_at_target,utilization,\
             total_supply_usd,total_borrow_usd,utilization_target,borrow_apy_daily,\
             borrow_apy_weekly,utilization_daily,utilization_weekly,supply_apy_daily,supply_apy_weekly"
        ));
    }

    #[test]
    fn test_failed_write_leaves_no_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("df_all.csv");
        fs::write(&path, "previous").unwrap();

        // Renaming a file over a non-empty directory fails after the rows are written
        let blocked = dir.path().join("blocked");
        fs::create_dir(&blocked).unwrap();
        fs::write(blocked.join("keep"), "x").unwrap();

        let result = write_snapshot(&blocked, &sample_series());

        assert!(matches!(result, Err(SnapshotError::Io(_))));
        assert!(!temporary_path(&blocked).exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), "previous");
    }

    #[test]
    fn test_marker_round_trip_and_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("last_update.txt");
        assert_eq!(read_marker(&path).unwrap(), None);

        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap();
        write_marker(&path, at).unwrap();
        assert_eq!(read_marker(&path).unwrap(), Some(at));

        fs::write(&path, "1717245000.5").unwrap();
        let parsed = read_marker(&path).unwrap().unwrap();
        assert_eq!(parsed.timestamp(), 1_717_245_000);
        assert_eq!(parsed.timestamp_subsec_millis(), 500);

        fs::write(&path, "yesterday").unwrap();
        assert!(matches!(read_marker(&path), Err(SnapshotError::InvalidMarker(_))));
    }
}
