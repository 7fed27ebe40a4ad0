//! Normalized inputs of the aggregator queries.
//!
//! Every query type normalizes its input on construction, so that equivalent inputs map to the
//! same [`CacheKey`].

use std::fmt;

use crate::caching::{CacheKey, CacheRequest};
use crate::types::{HeatmapQuery, clamp_limit, normalize_label, normalize_symbol};

/// The query categories served by the aggregator, each backed by its own cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    Price,
    OpenInterest,
    FundingRate,
    Liquidations,
    Heatmap,
    MarketHeatmap,
    ProtocolFees,
    Metadata,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Price,
        Category::OpenInterest,
        Category::FundingRate,
        Category::Liquidations,
        Category::Heatmap,
        Category::MarketHeatmap,
        Category::ProtocolFees,
        Category::Metadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Price => "price",
            Category::OpenInterest => "open_interest",
            Category::FundingRate => "funding_rate",
            Category::Liquidations => "liquidations",
            Category::Heatmap => "heatmap",
            Category::MarketHeatmap => "market_heatmap",
            Category::ProtocolFees => "protocol_fees",
            Category::Metadata => "metadata",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A query for a single symbol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolQuery {
    pub category: Category,
    pub symbol: String,
}

impl SymbolQuery {
    pub fn new(category: Category, symbol: &str) -> Self {
        Self {
            category,
            symbol: normalize_symbol(symbol),
        }
    }
}

impl CacheRequest for SymbolQuery {
    fn cache_key(&self) -> CacheKey {
        CacheKey::builder(self.category.as_str())
            .param("symbol", &self.symbol)
            .build()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiquidationsQuery {
    pub symbol: String,
    pub timeframe: String,
}

impl LiquidationsQuery {
    pub fn new(symbol: &str, timeframe: &str) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            timeframe: normalize_label(timeframe),
        }
    }
}

impl CacheRequest for LiquidationsQuery {
    fn cache_key(&self) -> CacheKey {
        CacheKey::builder(Category::Liquidations.as_str())
            .param("symbol", &self.symbol)
            .param("timeframe", &self.timeframe)
            .build()
    }
}

impl CacheRequest for HeatmapQuery {
    fn cache_key(&self) -> CacheKey {
        let query = self.normalized();
        CacheKey::builder(Category::Heatmap.as_str())
            .param("timeframe", &query.timeframe)
            .param("limit", query.limit)
            .param("sort", &query.sort)
            .build()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MarketHeatmapQuery {
    pub category: String,
    pub limit: usize,
}

impl MarketHeatmapQuery {
    pub fn new(category: &str, limit: usize) -> Self {
        Self {
            category: normalize_label(category),
            limit: clamp_limit(limit),
        }
    }
}

impl CacheRequest for MarketHeatmapQuery {
    fn cache_key(&self) -> CacheKey {
        CacheKey::builder(Category::MarketHeatmap.as_str())
            .param("category", &self.category)
            .param("limit", self.limit)
            .build()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProtocolQuery {
    pub protocol: String,
}

impl ProtocolQuery {
    pub fn new(protocol: &str) -> Self {
        Self {
            protocol: normalize_label(protocol),
        }
    }
}

impl CacheRequest for ProtocolQuery {
    fn cache_key(&self) -> CacheKey {
        CacheKey::builder(Category::ProtocolFees.as_str())
            .param("protocol", &self.protocol)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equivalent_inputs_share_keys() {
        assert_eq!(
            SymbolQuery::new(Category::Price, " btc").cache_key(),
            SymbolQuery::new(Category::Price, "BTC").cache_key(),
        );
        assert_ne!(
            SymbolQuery::new(Category::Price, "BTC").cache_key(),
            SymbolQuery::new(Category::Metadata, "BTC").cache_key(),
        );
        assert_eq!(
            HeatmapQuery::new("24H", 9999, "Volume").cache_key(),
            HeatmapQuery::new("24h", 500, "volume").cache_key(),
        );
        assert_eq!(
            MarketHeatmapQuery::new("DeFi", 0),
            MarketHeatmapQuery {
                category: "defi".into(),
                limit: 1
            }
        );
    }
}
