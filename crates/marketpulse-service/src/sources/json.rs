use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use url::Url;

use super::{AdapterInfo, Capabilities, MarketDataSource, RateLimit};
use crate::config::SourceConfig;
use crate::error::{FetchError, FetchResult};
use crate::types::{
    FundingRate, Heatmap, HeatmapQuery, Liquidations, MarketHeatmap, Metadata, OpenInterest,
    Price, ProtocolFees,
};
use crate::wire::{RequestDeduplicator, Validate, WireClient, WireRequest};

/// A provider speaking a plain JSON REST layout.
///
/// All endpoints live below the configured base URL:
///
/// - `price/{symbol}`
/// - `open-interest/{symbol}`
/// - `funding/{symbol}`
/// - `liquidations/{symbol}?timeframe=`
/// - `heatmap?timeframe=&limit=&sort=`
/// - `market-heatmap/{category}?limit=`
/// - `fees/{protocol}`
/// - `metadata/{symbol}`
#[derive(Debug)]
pub struct JsonApiSource {
    name: String,
    base: Url,
    headers: BTreeMap<String, String>,
    capabilities: Capabilities,
    rate_limit: RateLimit,
    client: WireClient,
    dedup: RequestDeduplicator,
}

impl JsonApiSource {
    pub fn new(config: &SourceConfig, client: WireClient, dedup: RequestDeduplicator) -> Self {
        Self {
            name: config.name.clone(),
            base: config.url.clone(),
            headers: config.headers.clone(),
            capabilities: config.capabilities,
            rate_limit: config.rate_limit,
            client,
            dedup,
        }
    }

    fn endpoint(&self, segments: &[&str], query: &[(&str, String)]) -> FetchResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::InternalError)?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    async fn fetch<T>(&self, url: Url, symbol: Option<&str>) -> FetchResult<T>
    where
        T: DeserializeOwned + Validate + Clone + Send + Sync + 'static,
    {
        let request = WireRequest::get(&self.name, url).with_headers(&self.headers);
        self.dedup
            .request(&self.client, request)
            .await
            .map_err(|err| err.with_source(&self.name, symbol))
    }
}

#[async_trait]
impl MarketDataSource for JsonApiSource {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: self.name.clone(),
            capabilities: self.capabilities,
            rate_limit: self.rate_limit,
        }
    }

    async fn price(&self, symbol: &str) -> FetchResult<Price> {
        let url = self.endpoint(&["price", symbol], &[])?;
        self.fetch(url, Some(symbol)).await
    }

    async fn open_interest(&self, symbol: &str) -> FetchResult<OpenInterest> {
        let url = self.endpoint(&["open-interest", symbol], &[])?;
        self.fetch(url, Some(symbol)).await
    }

    async fn funding_rate(&self, symbol: &str) -> FetchResult<FundingRate> {
        let url = self.endpoint(&["funding", symbol], &[])?;
        self.fetch(url, Some(symbol)).await
    }

    async fn liquidations(&self, symbol: &str, timeframe: &str) -> FetchResult<Liquidations> {
        let url = self.endpoint(
            &["liquidations", symbol],
            &[("timeframe", timeframe.to_owned())],
        )?;
        self.fetch(url, Some(symbol)).await
    }

    async fn heatmap(&self, query: &HeatmapQuery) -> FetchResult<Heatmap> {
        let url = self.endpoint(
            &["heatmap"],
            &[
                ("timeframe", query.timeframe.clone()),
                ("limit", query.limit.to_string()),
                ("sort", query.sort.clone()),
            ],
        )?;
        self.fetch(url, None).await
    }

    async fn market_heatmap(&self, category: &str, limit: usize) -> FetchResult<MarketHeatmap> {
        let url = self.endpoint(
            &["market-heatmap", category],
            &[("limit", limit.to_string())],
        )?;
        self.fetch(url, None).await
    }

    async fn protocol_fees(&self, protocol: &str) -> FetchResult<ProtocolFees> {
        let url = self.endpoint(&["fees", protocol], &[])?;
        self.fetch(url, None).await
    }

    async fn metadata(&self, symbol: &str) -> FetchResult<Metadata> {
        let url = self.endpoint(&["metadata", symbol], &[])?;
        self.fetch(url, Some(symbol)).await
    }
}
