use crate::analytics::metrics::{Annualization, DEFAULT_LIQUIDITY_THRESHOLD};
use crate::data::{BlueSource, LabelOverrides, MessariSource, MetricKind, Protocol, UtilizationTargets};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::env;
use std::fmt::Display;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const AAVE_ENDPOINT: &str = "https://api.thegraph.com/subgraphs/name/messari/aave-v3-ethereum";
const COMPOUND_ENDPOINT: &str =
    "https://api.thegraph.com/subgraphs/name/messari/compound-v3-ethereum";
const BLUE_ENDPOINT: &str = "https://blue-api.morpho.org/graphql";

/// Morpho Blue launch, the earliest point all three protocols can be compared from.
const DEFAULT_START_TIMESTAMP: i64 = 1_704_927_599;

const DEFAULT_AAVE_LOAN_ASSETS: [&str; 8] =
    ["DAI", "USDC", "WETH", "USDT", "USDA", "PYUSD", "crvUSD", "WBTC"];

/// Runtime settings, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub aave: MessariSource,
    pub compound: MessariSource,
    pub blue: BlueSource,
    pub page_size: usize,
    pub request_timeout: Duration,
    pub start: DateTime<Utc>,
    pub refresh_threshold_secs: i64,
    pub snapshot_path: PathBuf,
    pub marker_path: PathBuf,
    pub overrides: LabelOverrides,
    pub targets: UtilizationTargets,
    pub correlation_field: MetricKind,
    pub liquidity_threshold: f64,
    pub annualization: Annualization,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            aave: MessariSource {
                protocol: Protocol::Aave,
                endpoint: AAVE_ENDPOINT.to_string(),
                market_name_prefix: Some("Aave Ethereum".to_string()),
                loan_assets: DEFAULT_AAVE_LOAN_ASSETS.iter().map(|s| s.to_string()).collect(),
            },
            compound: MessariSource {
                protocol: Protocol::Compound,
                endpoint: COMPOUND_ENDPOINT.to_string(),
                market_name_prefix: None,
                loan_assets: Vec::new(),
            },
            blue: BlueSource {
                endpoint: BLUE_ENDPOINT.to_string(),
                network: "ethereum".to_string(),
                min_supply_usd: 100_000.0,
                lltv_scale: 1e16,
                interval: "HOUR".to_string(),
            },
            page_size: 1000,
            request_timeout: Duration::from_secs(60),
            start: DateTime::<Utc>::from_timestamp(DEFAULT_START_TIMESTAMP, 0)
                .unwrap_or_default(),
            refresh_threshold_secs: 86_400,
            snapshot_path: PathBuf::from("df_all.csv"),
            marker_path: PathBuf::from("last_update.txt"),
            overrides: LabelOverrides::known(),
            targets: UtilizationTargets::known(),
            correlation_field: MetricKind::BorrowApy,
            liquidity_threshold: DEFAULT_LIQUIDITY_THRESHOLD,
            annualization: Annualization::default(),
        }
    }
}

impl Config {
    /// Builds the configuration from environment variables, falling back to defaults.
    ///
    /// # Errors
    /// Returns an error if a variable is set but cannot be parsed, or if an override or
    /// target file cannot be read.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    ///
    /// # Arguments
    /// * `lookup`: Returns the raw value of a variable, `None` when unset
    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(endpoint) = lookup("AAVE_ENDPOINT") {
            config.aave.endpoint = endpoint;
        }
        if let Some(endpoint) = lookup("COMPOUND_ENDPOINT") {
            config.compound.endpoint = endpoint;
        }
        if let Some(endpoint) = lookup("BLUE_ENDPOINT") {
            config.blue.endpoint = endpoint;
        }
        if let Some(assets) = lookup("AAVE_LOAN_ASSETS") {
            config.aave.loan_assets = assets
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(network) = lookup("TARGET_NETWORK") {
            config.blue.network = network;
        }
        if let Some(interval) = lookup("BLUE_INTERVAL") {
            config.blue.interval = interval;
        }

        config.blue.min_supply_usd =
            parsed(&lookup, "BLUE_MIN_SUPPLY_USD", config.blue.min_supply_usd)?;
        config.blue.lltv_scale = parsed(&lookup, "BLUE_LLTV_SCALE", config.blue.lltv_scale)?;
        config.page_size = parsed(&lookup, "PAGE_SIZE", config.page_size)?;
        config.request_timeout = Duration::from_secs(parsed(
            &lookup,
            "REQUEST_TIMEOUT_SECS",
            config.request_timeout.as_secs(),
        )?);
        config.refresh_threshold_secs =
            parsed(&lookup, "REFRESH_THRESHOLD_SECS", config.refresh_threshold_secs)?;
        config.liquidity_threshold =
            parsed(&lookup, "LIQUIDITY_THRESHOLD", config.liquidity_threshold)?;

        let start_secs: i64 = parsed(&lookup, "START_TIMESTAMP", config.start.timestamp())?;
        config.start = DateTime::<Utc>::from_timestamp(start_secs, 0)
            .ok_or_else(|| anyhow!("START_TIMESTAMP {} out of range", start_secs))?;

        if let Some(path) = lookup("SNAPSHOT_PATH") {
            config.snapshot_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("MARKER_PATH") {
            config.marker_path = PathBuf::from(path);
        }
        if let Some(field) = lookup("CORRELATION_FIELD") {
            config.correlation_field = field.parse().map_err(|e: String| anyhow!(e))?;
        }
        if let Some(periods) = lookup("VOLATILITY_PERIODS_PER_YEAR") {
            let periods: f64 = periods
                .trim()
                .parse()
                .context("VOLATILITY_PERIODS_PER_YEAR must be a number")?;
            config.annualization = Annualization::Fixed(periods);
        }

        if let Some(path) = lookup("MARKET_OVERRIDES_FILE") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("reading market overrides from {}", path))?;
            config.overrides = serde_json::from_str(&contents)
                .with_context(|| format!("parsing market overrides in {}", path))?;
        }
        if let Some(path) = lookup("UTILIZATION_TARGETS_FILE") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("reading utilization targets from {}", path))?;
            config.targets = serde_json::from_str(&contents)
                .with_context(|| format!("parsing utilization targets in {}", path))?;
        }

        if config.page_size == 0 {
            return Err(anyhow!("PAGE_SIZE must be positive"));
        }
        Ok(config)
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("invalid {}={:?}: {}", key, raw, e)),
        None => Ok(default),
    }
}
