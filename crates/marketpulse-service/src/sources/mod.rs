//! The boundary to upstream market data providers.
//!
//! Providers implement [`MarketDataSource`]. Every provider describes itself with an
//! [`AdapterInfo`], which the aggregator uses to pick the provider answering a query.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{FetchError, FetchResult};
use crate::types::{
    FundingRate, Heatmap, HeatmapQuery, Liquidations, MarketHeatmap, Metadata, OpenInterest,
    Price, ProtocolFees,
};

mod json;

pub use json::JsonApiSource;

/// The kinds of queries a provider can answer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub prices: bool,
    pub open_interest: bool,
    pub funding_rates: bool,
    pub liquidations: bool,
    pub heatmap: bool,
    pub market_heatmap: bool,
    pub protocol_fees: bool,
    pub metadata: bool,
}

impl Capabilities {
    /// A provider answering every kind of query.
    pub fn all() -> Self {
        Self {
            prices: true,
            open_interest: true,
            funding_rates: true,
            liquidations: true,
            heatmap: true,
            market_heatmap: true,
            protocol_fees: true,
            metadata: true,
        }
    }

    /// Whether queries of the given category are supported.
    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Prices => self.prices,
            Capability::OpenInterest => self.open_interest,
            Capability::FundingRates => self.funding_rates,
            Capability::Liquidations => self.liquidations,
            Capability::Heatmap => self.heatmap,
            Capability::MarketHeatmap => self.market_heatmap,
            Capability::ProtocolFees => self.protocol_fees,
            Capability::Metadata => self.metadata,
        }
    }
}

/// A single query category, see [`Capabilities`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    Prices,
    OpenInterest,
    FundingRates,
    Liquidations,
    Heatmap,
    MarketHeatmap,
    ProtocolFees,
    Metadata,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Prices => "prices",
            Capability::OpenInterest => "open_interest",
            Capability::FundingRates => "funding_rates",
            Capability::Liquidations => "liquidations",
            Capability::Heatmap => "heatmap",
            Capability::MarketHeatmap => "market_heatmap",
            Capability::ProtocolFees => "protocol_fees",
            Capability::Metadata => "metadata",
        }
    }
}

/// The documented rate limit of a provider.
///
/// This is informational only; the wire client reacts to `429` responses instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimit {
    /// Maximum requests allowed per minute.
    pub requests_per_minute: u32,
    /// Maximum concurrent requests to this provider.
    pub max_concurrency: usize,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            max_concurrency: 5,
        }
    }
}

/// Static description of a provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AdapterInfo {
    pub name: String,
    pub capabilities: Capabilities,
    pub rate_limit: RateLimit,
}

fn unsupported(info: &AdapterInfo, capability: Capability, symbol: Option<&str>) -> FetchError {
    FetchError::Unsupported(capability.as_str().to_owned())
        .with_source(&info.name, symbol)
}

/// A provider of market data.
///
/// Queries the provider does not support fail with [`FetchError::DataSource`].
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    fn info(&self) -> AdapterInfo;

    async fn price(&self, symbol: &str) -> FetchResult<Price> {
        Err(unsupported(&self.info(), Capability::Prices, Some(symbol)))
    }

    async fn open_interest(&self, symbol: &str) -> FetchResult<OpenInterest> {
        Err(unsupported(&self.info(), Capability::OpenInterest, Some(symbol)))
    }

    async fn funding_rate(&self, symbol: &str) -> FetchResult<FundingRate> {
        Err(unsupported(&self.info(), Capability::FundingRates, Some(symbol)))
    }

    async fn liquidations(&self, symbol: &str, _timeframe: &str) -> FetchResult<Liquidations> {
        Err(unsupported(&self.info(), Capability::Liquidations, Some(symbol)))
    }

    async fn heatmap(&self, _query: &HeatmapQuery) -> FetchResult<Heatmap> {
        Err(unsupported(&self.info(), Capability::Heatmap, None))
    }

    async fn market_heatmap(&self, _category: &str, _limit: usize) -> FetchResult<MarketHeatmap> {
        Err(unsupported(&self.info(), Capability::MarketHeatmap, None))
    }

    async fn protocol_fees(&self, _protocol: &str) -> FetchResult<ProtocolFees> {
        Err(unsupported(&self.info(), Capability::ProtocolFees, None))
    }

    async fn metadata(&self, symbol: &str) -> FetchResult<Metadata> {
        Err(unsupported(&self.info(), Capability::Metadata, Some(symbol)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PricesOnly;

    #[async_trait]
    impl MarketDataSource for PricesOnly {
        fn info(&self) -> AdapterInfo {
            AdapterInfo {
                name: "prices-only".into(),
                capabilities: Capabilities {
                    prices: true,
                    ..Default::default()
                },
                rate_limit: RateLimit::default(),
            }
        }
    }

    #[tokio::test]
    async fn test_unsupported_queries() {
        let source = PricesOnly;
        assert!(source.info().capabilities.supports(Capability::Prices));
        assert!(!source.info().capabilities.supports(Capability::Metadata));

        let err = source.metadata("BTC").await.unwrap_err();
        assert!(matches!(err, FetchError::DataSource { .. }));
        assert_eq!(
            err.to_string(),
            "prices-only (BTC): metadata not supported"
        );
        assert!(!err.is_retryable());
    }
}
