use chrono::Utc;
use dotenv::dotenv;
use lending_bench::analytics::{correlate, CorrelationMatrix, MetricsEngine, MetricsRow};
use lending_bench::config::Config;
use lending_bench::data::{HttpTransport, UnifiedSeries};
use lending_bench::pipeline::{Pipeline, RefreshDecision};
use lending_bench::snapshot::{read_marker, read_snapshot, write_marker, write_snapshot};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.3}", v))
}

/// Prints one line of risk metrics per market, grouped by loan asset.
///
/// # Arguments
/// * `rows`: Metrics rows, already sorted for display
///
/// # Columns Displayed
/// - Utilization target and average utilization
/// - IAE and ISE around the target
/// - Liquidity (share of samples above the threshold)
/// - One-sided errors ISE+ and IAE-
/// - Annualized borrow rate volatility and average borrow rate
fn print_metrics(rows: &[MetricsRow]) {
    println!("\nMarket Metrics:");
    println!(
        "{:<32} {:<9} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7}",
        "Market", "Protocol", "Target", "AvgU", "IAE", "ISE", "Liq", "ISE+", "IAE-", "Vol", "Borrow"
    );
    for row in rows {
        println!(
            "{:<32} {:<9} {:>7} {:>7.3} {:>7} {:>7} {:>7.3} {:>7} {:>7} {:>7} {:>7}",
            row.market,
            row.protocol,
            fmt_opt(row.utilization_target),
            row.avg_utilization,
            fmt_opt(row.iae),
            fmt_opt(row.ise),
            row.liquidity,
            fmt_opt(row.ise_positive),
            fmt_opt(row.iae_negative),
            fmt_opt(row.volatility),
            fmt_opt(row.avg_borrow_rate),
        );
    }
}

/// Prints the correlation matrix of one loan asset's markets with p-values.
///
/// # Arguments
/// * `asset`: Loan asset the markets share
/// * `matrix`: Pairwise correlation of the configured field
fn print_correlation(asset: &str, matrix: &CorrelationMatrix) {
    println!("\n{} correlation of {}:", asset, matrix.field);
    for (i, left) in matrix.markets.iter().enumerate() {
        let cells: Vec<String> = matrix.corr[i]
            .iter()
            .zip(&matrix.p_values[i])
            .map(|(r, p)| format!("{} (p={})", fmt_opt(*r), fmt_opt(*p)))
            .collect();
        println!("{:<32} {}", left, cells.join("  "));
    }
}

/// Refreshes the snapshot when it is stale and falls back to the stored copy otherwise.
///
/// A successful refresh writes the snapshot first and the marker second. A failed
/// refresh keeps the previous snapshot when one exists.
///
/// # Arguments
/// * `config`: Runtime configuration
///
/// # Returns
/// The unified series to report on
///
/// # Errors
/// Returns an error if the marker or snapshot cannot be read or written, or if the
/// refresh fails and no previous snapshot exists
async fn load_series(config: &Config) -> anyhow::Result<UnifiedSeries> {
    let marker = read_marker(&config.marker_path)?;
    let transport = Arc::new(HttpTransport::new(config.request_timeout)?);
    let pipeline = Pipeline::from_config(config, transport);

    match pipeline
        .run(marker, Utc::now(), config.refresh_threshold_secs)
        .await
    {
        Ok(RefreshDecision::Refreshed(outcome)) => {
            for failure in &outcome.failures {
                warn!(%failure, "protocol missing from this snapshot");
            }
            write_snapshot(&config.snapshot_path, &outcome.series)?;
            write_marker(&config.marker_path, outcome.marker)?;
            Ok(outcome.series)
        }
        Ok(RefreshDecision::Skipped { .. }) => Ok(read_snapshot(&config.snapshot_path)?),
        Err(e) if config.snapshot_path.exists() => {
            error!(error = %e, "refresh failed, keeping previous snapshot");
            Ok(read_snapshot(&config.snapshot_path)?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Main application entry point for the lending rate benchmark.
///
/// # Workflow Steps
/// - Load environment variables and build the configuration
/// - Refresh or load the unified series
/// - Compute and print per-market metrics
/// - Compute and print per-asset correlation matrices
///
/// # Returns
/// Returns `Ok(())` if all operations complete successfully,
/// otherwise returns an error
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Load environment variables from .env file
    dotenv().ok();

    let config = Config::from_env()?;

    // Refresh stale data or reuse the stored snapshot
    let series = load_series(&config).await?;
    info!(rows = series.len(), "unified series ready");

    // Per-market metrics
    let engine = MetricsEngine::new(config.liquidity_threshold, config.annualization);
    let mut metrics = engine.compute(&series);
    metrics.sort_by(|a, b| (&a.loan_asset, &a.market).cmp(&(&b.loan_asset, &b.market)));
    print_metrics(&metrics);

    // Correlate markets sharing a loan asset
    for asset in series.loan_assets() {
        let markets: BTreeSet<String> = series
            .markets_for_asset(asset)
            .into_iter()
            .map(str::to_string)
            .collect();
        if markets.len() < 2 {
            continue;
        }
        let matrix = correlate(&series, &markets, config.correlation_field);
        print_correlation(asset, &matrix);
    }

    Ok(())
}
