//! Domain value types and normalization of query inputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::wire::Validate;

/// The smallest accepted `limit` of list queries.
pub const MIN_LIMIT: usize = 1;
/// The largest accepted `limit` of list queries.
pub const MAX_LIMIT: usize = 500;

/// Normalizes a ticker symbol: surrounding whitespace is removed and letters are upper-cased.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

/// Normalizes timeframes, sort orders and categories to lower case.
pub fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

/// Clamps a list `limit` to `1..=500`.
pub fn clamp_limit(limit: usize) -> usize {
    limit.clamp(MIN_LIMIT, MAX_LIMIT)
}

fn check_finite(field: &str, value: f64) -> Result<(), String> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(format!("`{field}` is not a finite number"))
    }
}

fn check_non_negative(field: &str, value: f64) -> Result<(), String> {
    check_finite(field, value)?;
    if value < 0.0 {
        return Err(format!("`{field}` must not be negative"));
    }
    Ok(())
}

fn check_symbol(symbol: &str) -> Result<(), String> {
    if symbol.trim().is_empty() {
        return Err("`symbol` is empty".into());
    }
    Ok(())
}

/// The latest traded price of a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub symbol: String,
    pub price: f64,
    #[serde(default)]
    pub change_24h: Option<f64>,
    #[serde(default)]
    pub volume_24h: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Validate for Price {
    fn validate(&self) -> Result<(), String> {
        check_symbol(&self.symbol)?;
        check_non_negative("price", self.price)?;
        if let Some(volume) = self.volume_24h {
            check_non_negative("volume_24h", volume)?;
        }
        Ok(())
    }
}

/// Aggregated open interest of perpetual futures for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenInterest {
    pub symbol: String,
    pub open_interest: f64,
    #[serde(default)]
    pub open_interest_usd: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Validate for OpenInterest {
    fn validate(&self) -> Result<(), String> {
        check_symbol(&self.symbol)?;
        check_non_negative("open_interest", self.open_interest)
    }
}

/// The current funding rate of a perpetual future.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRate {
    pub symbol: String,
    /// The rate per funding interval, may be negative.
    pub rate: f64,
    #[serde(default)]
    pub next_funding_time: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
}

impl Validate for FundingRate {
    fn validate(&self) -> Result<(), String> {
        check_symbol(&self.symbol)?;
        check_finite("rate", self.rate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

/// Estimated liquidation volume around one price level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationLevel {
    pub price: f64,
    pub volume_usd: f64,
    pub side: Side,
}

/// Liquidation estimates for a symbol within a timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Liquidations {
    pub symbol: String,
    pub timeframe: String,
    pub long_usd: f64,
    pub short_usd: f64,
    #[serde(default)]
    pub levels: Vec<LiquidationLevel>,
}

impl Validate for Liquidations {
    fn validate(&self) -> Result<(), String> {
        check_symbol(&self.symbol)?;
        check_non_negative("long_usd", self.long_usd)?;
        check_non_negative("short_usd", self.short_usd)?;
        for level in &self.levels {
            check_non_negative("levels.price", level.price)?;
            check_non_negative("levels.volume_usd", level.volume_usd)?;
        }
        Ok(())
    }
}

/// Parameters of a heatmap query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeatmapQuery {
    pub timeframe: String,
    pub limit: usize,
    pub sort: String,
}

impl HeatmapQuery {
    pub fn new(timeframe: &str, limit: usize, sort: &str) -> Self {
        Self {
            timeframe: timeframe.into(),
            limit,
            sort: sort.into(),
        }
    }

    /// Returns the query with lower-cased labels and a clamped limit.
    pub fn normalized(&self) -> Self {
        Self {
            timeframe: normalize_label(&self.timeframe),
            limit: clamp_limit(self.limit),
            sort: normalize_label(&self.sort),
        }
    }
}

impl Default for HeatmapQuery {
    fn default() -> Self {
        Self::new("24h", 50, "volume")
    }
}

/// One tile of a heatmap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapEntry {
    pub symbol: String,
    /// Relative price change within the timeframe, in percent.
    pub change: f64,
    #[serde(default)]
    pub volume_usd: Option<f64>,
    #[serde(default)]
    pub market_cap_usd: Option<f64>,
}

fn validate_entries(entries: &[HeatmapEntry]) -> Result<(), String> {
    for entry in entries {
        check_symbol(&entry.symbol)?;
        check_finite("change", entry.change)?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heatmap {
    pub timeframe: String,
    pub entries: Vec<HeatmapEntry>,
}

impl Validate for Heatmap {
    fn validate(&self) -> Result<(), String> {
        validate_entries(&self.entries)
    }
}

/// A heatmap restricted to one market category, e.g. `"defi"` or `"layer-1"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketHeatmap {
    pub category: String,
    pub entries: Vec<HeatmapEntry>,
}

impl Validate for MarketHeatmap {
    fn validate(&self) -> Result<(), String> {
        validate_entries(&self.entries)
    }
}

/// Fees collected by a protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolFees {
    pub protocol: String,
    pub fees_24h_usd: f64,
    #[serde(default)]
    pub fees_7d_usd: Option<f64>,
    #[serde(default)]
    pub revenue_24h_usd: Option<f64>,
}

impl Validate for ProtocolFees {
    fn validate(&self) -> Result<(), String> {
        if self.protocol.trim().is_empty() {
            return Err("`protocol` is empty".into());
        }
        check_non_negative("fees_24h_usd", self.fees_24h_usd)
    }
}

/// Descriptive, rarely changing information about an asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub symbol: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub website: Option<String>,
}

impl Validate for Metadata {
    fn validate(&self) -> Result<(), String> {
        check_symbol(&self.symbol)
    }
}
