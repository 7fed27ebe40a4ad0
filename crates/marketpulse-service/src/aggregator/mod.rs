//! The [`MarketDataAggregator`], serving every domain query from its own cache.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::caching::{CacheKey, CacheStats, Cacher, MaybeStale};
use crate::config::{AggregatorConfig, CacheConfigs};
use crate::error::{FetchError, FetchResult};
use crate::sources::{AdapterInfo, Capability, MarketDataSource};
use crate::types::{
    FundingRate, Heatmap, HeatmapQuery, Liquidations, MarketHeatmap, Metadata, OpenInterest,
    Price, ProtocolFees,
};

mod queries;

pub use queries::{Category, LiquidationsQuery, MarketHeatmapQuery, ProtocolQuery, SymbolQuery};

type SourceList = Arc<[Arc<dyn MarketDataSource>]>;

/// Returns the first source able to answer queries of the given `capability`.
fn select_source(
    sources: &[Arc<dyn MarketDataSource>],
    capability: Capability,
) -> FetchResult<Arc<dyn MarketDataSource>> {
    sources
        .iter()
        .find(|source| source.info().capabilities.supports(capability))
        .cloned()
        .ok_or_else(|| FetchError::Unsupported(capability.as_str().to_owned()))
}

/// Creates a cache whose lookups are answered by the first source supporting `capability`.
macro_rules! source_cache {
    ($sources:expr, $settings:expr, $category:expr, $capability:expr, |$source:ident, $query:ident: $ty:ty| $call:expr) => {{
        let sources = SourceList::clone(&$sources);
        Cacher::new($category.as_str(), $settings, move |$query: $ty| {
            let sources = SourceList::clone(&sources);
            async move {
                let $source = select_source(&sources, $capability)?;
                $call.await
            }
        })
    }};
}

/// Serves market data queries from per-category caches backed by a list of sources.
///
/// Every query normalizes its input, so that equivalent requests share one cache entry and one
/// upstream computation.
pub struct MarketDataAggregator {
    sources: SourceList,
    prices: Cacher<SymbolQuery, Price>,
    open_interest: Cacher<SymbolQuery, OpenInterest>,
    funding_rates: Cacher<SymbolQuery, FundingRate>,
    liquidations: Cacher<LiquidationsQuery, Liquidations>,
    heatmaps: Cacher<HeatmapQuery, Heatmap>,
    market_heatmaps: Cacher<MarketHeatmapQuery, MarketHeatmap>,
    protocol_fees: Cacher<ProtocolQuery, ProtocolFees>,
    metadata: Cacher<SymbolQuery, Metadata>,

    /// Bounds the number of concurrent lookups of all batch calls together.
    batch_limiter: Arc<Semaphore>,
}

impl std::fmt::Debug for MarketDataAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataAggregator")
            .field("sources", &self.get_sources())
            .finish_non_exhaustive()
    }
}

impl MarketDataAggregator {
    /// Creates an aggregator querying `sources` in order of preference.
    pub fn new(
        sources: Vec<Arc<dyn MarketDataSource>>,
        caches: &CacheConfigs,
        config: &AggregatorConfig,
    ) -> Self {
        let sources: SourceList = sources.into();

        let prices = source_cache!(
            sources, caches.price, Category::Price, Capability::Prices,
            |source, query: SymbolQuery| source.price(&query.symbol)
        );
        let open_interest = source_cache!(
            sources, caches.open_interest, Category::OpenInterest, Capability::OpenInterest,
            |source, query: SymbolQuery| source.open_interest(&query.symbol)
        );
        let funding_rates = source_cache!(
            sources, caches.funding_rate, Category::FundingRate, Capability::FundingRates,
            |source, query: SymbolQuery| source.funding_rate(&query.symbol)
        );
        let liquidations = source_cache!(
            sources, caches.liquidations, Category::Liquidations, Capability::Liquidations,
            |source, query: LiquidationsQuery| source.liquidations(&query.symbol, &query.timeframe)
        );
        let heatmaps = source_cache!(
            sources, caches.heatmap, Category::Heatmap, Capability::Heatmap,
            |source, query: HeatmapQuery| source.heatmap(&query)
        );
        let market_heatmaps = source_cache!(
            sources, caches.market_heatmap, Category::MarketHeatmap, Capability::MarketHeatmap,
            |source, query: MarketHeatmapQuery| source.market_heatmap(&query.category, query.limit)
        );
        let protocol_fees = source_cache!(
            sources, caches.protocol_fees, Category::ProtocolFees, Capability::ProtocolFees,
            |source, query: ProtocolQuery| source.protocol_fees(&query.protocol)
        );
        let metadata = source_cache!(
            sources, caches.metadata, Category::Metadata, Capability::Metadata,
            |source, query: SymbolQuery| source.metadata(&query.symbol)
        );

        Self {
            sources,
            prices,
            open_interest,
            funding_rates,
            liquidations,
            heatmaps,
            market_heatmaps,
            protocol_fees,
            metadata,
            batch_limiter: Arc::new(Semaphore::new(config.batch_concurrency.max(1))),
        }
    }

    pub async fn get_price(&self, symbol: &str) -> FetchResult<Price> {
        self.prices
            .get(SymbolQuery::new(Category::Price, symbol))
            .await
    }

    /// Like [`get_price`](Self::get_price), but serves the last known price if the lookup fails.
    pub async fn get_price_resilient(&self, symbol: &str) -> FetchResult<MaybeStale<Price>> {
        self.prices
            .get_or_stale(SymbolQuery::new(Category::Price, symbol))
            .await
    }

    pub async fn get_open_interest(&self, symbol: &str) -> FetchResult<OpenInterest> {
        self.open_interest
            .get(SymbolQuery::new(Category::OpenInterest, symbol))
            .await
    }

    pub async fn get_funding_rate(&self, symbol: &str) -> FetchResult<FundingRate> {
        self.funding_rates
            .get(SymbolQuery::new(Category::FundingRate, symbol))
            .await
    }

    pub async fn get_liquidations(&self, symbol: &str, timeframe: &str) -> FetchResult<Liquidations> {
        self.liquidations
            .get(LiquidationsQuery::new(symbol, timeframe))
            .await
    }

    pub async fn get_heatmap(&self, query: &HeatmapQuery) -> FetchResult<Heatmap> {
        self.heatmaps.get(query.normalized()).await
    }

    pub async fn get_market_heatmap(&self, category: &str, limit: usize) -> FetchResult<MarketHeatmap> {
        self.market_heatmaps
            .get(MarketHeatmapQuery::new(category, limit))
            .await
    }

    pub async fn get_protocol_fees(&self, protocol: &str) -> FetchResult<ProtocolFees> {
        self.protocol_fees.get(ProtocolQuery::new(protocol)).await
    }

    pub async fn get_metadata(&self, symbol: &str) -> FetchResult<Metadata> {
        self.metadata
            .get(SymbolQuery::new(Category::Metadata, symbol))
            .await
    }

    pub async fn get_prices<S: AsRef<str>>(&self, symbols: &[S]) -> Vec<Price> {
        self.get_many(symbols, |symbol| self.get_price(symbol.as_ref()))
            .await
    }

    pub async fn get_open_interests<S: AsRef<str>>(&self, symbols: &[S]) -> Vec<OpenInterest> {
        self.get_many(symbols, |symbol| self.get_open_interest(symbol.as_ref()))
            .await
    }

    pub async fn get_funding_rates<S: AsRef<str>>(&self, symbols: &[S]) -> Vec<FundingRate> {
        self.get_many(symbols, |symbol| self.get_funding_rate(symbol.as_ref()))
            .await
    }

    /// Runs `f` for every item with bounded concurrency.
    ///
    /// The concurrency limit is shared with all other batch calls on this aggregator. Failed items
    /// are logged and left out, the remaining results keep the order of `items`.
    pub async fn get_many<'a, I, T, F, Fut>(&self, items: &'a [I], f: F) -> Vec<T>
    where
        F: Fn(&'a I) -> Fut,
        Fut: Future<Output = FetchResult<T>>,
    {
        let lookups = items.iter().map(|item| {
            let limiter = Arc::clone(&self.batch_limiter);
            let lookup = f(item);
            async move {
                let _permit = limiter
                    .acquire_owned()
                    .await
                    .map_err(|_| FetchError::Cancelled)?;
                lookup.await
            }
        });

        let results = future::join_all(lookups).await;
        let total = results.len();
        let values: Vec<T> = results
            .into_iter()
            .filter_map(|result| match result {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::warn!(error = %err, "Dropping failed batch item");
                    None
                }
            })
            .collect();

        metric!(counter("aggregator.batch.items") += total as i64);
        metric!(counter("aggregator.batch.dropped") += (total - values.len()) as i64);
        values
    }

    /// Describes all sources, in order of preference.
    pub fn get_sources(&self) -> Vec<AdapterInfo> {
        self.sources.iter().map(|source| source.info()).collect()
    }

    /// Removes the entry for `key` from the cache of `category`, detaching a running lookup.
    pub fn invalidate(&self, category: Category, key: &CacheKey) -> bool {
        match category {
            Category::Price => self.prices.invalidate(key),
            Category::OpenInterest => self.open_interest.invalidate(key),
            Category::FundingRate => self.funding_rates.invalidate(key),
            Category::Liquidations => self.liquidations.invalidate(key),
            Category::Heatmap => self.heatmaps.invalidate(key),
            Category::MarketHeatmap => self.market_heatmaps.invalidate(key),
            Category::ProtocolFees => self.protocol_fees.invalidate(key),
            Category::Metadata => self.metadata.invalidate(key),
        }
    }

    /// Clears all caches.
    pub fn invalidate_all(&self) {
        self.prices.invalidate_all();
        self.open_interest.invalidate_all();
        self.funding_rates.invalidate_all();
        self.liquidations.invalidate_all();
        self.heatmaps.invalidate_all();
        self.market_heatmaps.invalidate_all();
        self.protocol_fees.invalidate_all();
        self.metadata.invalidate_all();
    }

    /// Fetches the price of `symbol` again, even if a fresh one is cached.
    ///
    /// The `refresh_*` methods attach to a lookup that is already running for the same input.
    pub async fn refresh_price(&self, symbol: &str) -> FetchResult<Price> {
        self.prices
            .refresh(SymbolQuery::new(Category::Price, symbol))
            .await
    }

    pub async fn refresh_open_interest(&self, symbol: &str) -> FetchResult<OpenInterest> {
        self.open_interest
            .refresh(SymbolQuery::new(Category::OpenInterest, symbol))
            .await
    }

    pub async fn refresh_funding_rate(&self, symbol: &str) -> FetchResult<FundingRate> {
        self.funding_rates
            .refresh(SymbolQuery::new(Category::FundingRate, symbol))
            .await
    }

    pub async fn refresh_liquidations(&self, symbol: &str, timeframe: &str) -> FetchResult<Liquidations> {
        self.liquidations
            .refresh(LiquidationsQuery::new(symbol, timeframe))
            .await
    }

    pub async fn refresh_heatmap(&self, query: &HeatmapQuery) -> FetchResult<Heatmap> {
        self.heatmaps.refresh(query.normalized()).await
    }

    pub async fn refresh_market_heatmap(&self, category: &str, limit: usize) -> FetchResult<MarketHeatmap> {
        self.market_heatmaps
            .refresh(MarketHeatmapQuery::new(category, limit))
            .await
    }

    pub async fn refresh_protocol_fees(&self, protocol: &str) -> FetchResult<ProtocolFees> {
        self.protocol_fees.refresh(ProtocolQuery::new(protocol)).await
    }

    pub async fn refresh_metadata(&self, symbol: &str) -> FetchResult<Metadata> {
        self.metadata
            .refresh(SymbolQuery::new(Category::Metadata, symbol))
            .await
    }

    pub fn cache_stats(&self) -> Vec<CacheStats> {
        vec![
            self.prices.stats(),
            self.open_interest.stats(),
            self.funding_rates.stats(),
            self.liquidations.stats(),
            self.heatmaps.stats(),
            self.market_heatmaps.stats(),
            self.protocol_fees.stats(),
            self.metadata.stats(),
        ]
    }

    /// Starts a background sweeper for every cache.
    pub fn spawn_sweepers(&self, interval: Duration) -> Vec<JoinHandle<()>> {
        vec![
            self.prices.spawn_sweeper(interval),
            self.open_interest.spawn_sweeper(interval),
            self.funding_rates.spawn_sweeper(interval),
            self.liquidations.spawn_sweeper(interval),
            self.heatmaps.spawn_sweeper(interval),
            self.market_heatmaps.spawn_sweeper(interval),
            self.protocol_fees.spawn_sweeper(interval),
            self.metadata.spawn_sweeper(interval),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;

    use crate::sources::{Capabilities, RateLimit};

    use super::*;

    #[derive(Default)]
    struct FakeSource {
        name: &'static str,
        capabilities: Capabilities,
        delay: Duration,
        failing: Mutex<HashSet<&'static str>>,
        calls: Mutex<Vec<String>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl FakeSource {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                capabilities: Capabilities::all(),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        async fn call(&self, call: String, symbol: &str) -> FetchResult<()> {
            self.calls.lock().push(call);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.failing.lock().contains(symbol) {
                return Err(FetchError::Http {
                    status: 500,
                    message: "Internal Server Error".into(),
                }
                .with_source(self.name, Some(symbol)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MarketDataSource for FakeSource {
        fn info(&self) -> AdapterInfo {
            AdapterInfo {
                name: self.name.into(),
                capabilities: self.capabilities,
                rate_limit: RateLimit::default(),
            }
        }

        async fn price(&self, symbol: &str) -> FetchResult<Price> {
            self.call(format!("price:{symbol}"), symbol).await?;
            Ok(Price {
                symbol: symbol.into(),
                price: 100.0,
                change_24h: None,
                volume_24h: None,
                timestamp: Utc::now(),
            })
        }

        async fn market_heatmap(&self, category: &str, limit: usize) -> FetchResult<MarketHeatmap> {
            self.call(format!("market_heatmap:{category}:{limit}"), category)
                .await?;
            Ok(MarketHeatmap {
                category: category.into(),
                entries: vec![],
            })
        }
    }

    fn aggregator(sources: &[Arc<FakeSource>]) -> MarketDataAggregator {
        let sources = sources
            .iter()
            .map(|source| Arc::clone(source) as Arc<dyn MarketDataSource>)
            .collect();
        MarketDataAggregator::new(sources, &CacheConfigs::default(), &AggregatorConfig::default())
    }

    #[tokio::test]
    async fn test_normalized_inputs_share_cache() {
        let source = Arc::new(FakeSource::new("fake"));
        let aggregator = aggregator(&[source.clone()]);

        let (a, b) = tokio::join!(aggregator.get_price(" btc"), aggregator.get_price("BTC"));
        assert_eq!(a.unwrap().symbol, "BTC");
        assert_eq!(b.unwrap().symbol, "BTC");
        aggregator.get_price("Btc").await.unwrap();

        assert_eq!(source.calls(), ["price:BTC"]);
    }

    #[tokio::test]
    async fn test_limits_are_clamped() {
        let source = Arc::new(FakeSource::new("fake"));
        let aggregator = aggregator(&[source.clone()]);

        aggregator.get_market_heatmap(" DeFi", 0).await.unwrap();
        aggregator.get_market_heatmap("defi", 10_000).await.unwrap();

        assert_eq!(
            source.calls(),
            ["market_heatmap:defi:1", "market_heatmap:defi:500"]
        );
    }

    #[tokio::test]
    async fn test_batch_drops_failed_items() {
        let source = Arc::new(FakeSource {
            failing: Mutex::new(HashSet::from(["SOL"])),
            ..FakeSource::new("fake")
        });
        let aggregator = aggregator(&[source]);

        let prices = aggregator
            .get_prices(&["BTC", "ETH", "SOL", "DOGE", "AVAX"])
            .await;

        let symbols: Vec<_> = prices.iter().map(|p| p.symbol.as_str()).collect();
        assert_eq!(symbols, ["BTC", "ETH", "DOGE", "AVAX"]);
    }

    #[tokio::test]
    async fn test_batches_share_concurrency_limit() {
        let source = Arc::new(FakeSource {
            delay: Duration::from_millis(20),
            ..FakeSource::new("fake")
        });
        let aggregator = aggregator(&[source.clone()]);

        let first: Vec<_> = (0..12).map(|i| format!("A{i}")).collect();
        let second: Vec<_> = (0..12).map(|i| format!("B{i}")).collect();
        let (a, b) = tokio::join!(aggregator.get_prices(&first), aggregator.get_prices(&second));

        assert_eq!(a.len(), 12);
        assert_eq!(b.len(), 12);
        assert_eq!(a[0].symbol, "A0");
        assert_eq!(a[11].symbol, "A11");
        assert_eq!(source.max_active.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_first_capable_source_is_used() {
        let metadata_only = Arc::new(FakeSource {
            capabilities: Capabilities {
                metadata: true,
                ..Default::default()
            },
            ..FakeSource::new("metadata-only")
        });
        let full = Arc::new(FakeSource::new("full"));
        let aggregator = aggregator(&[metadata_only.clone(), full.clone()]);

        aggregator.get_price("ETH").await.unwrap();

        assert!(metadata_only.calls().is_empty());
        assert_eq!(full.calls(), ["price:ETH"]);

        let infos = aggregator.get_sources();
        assert_eq!(infos[0].name, "metadata-only");
        assert_eq!(infos[1].name, "full");
    }

    #[tokio::test]
    async fn test_no_capable_source() {
        let aggregator = aggregator(&[]);

        let err = aggregator.get_protocol_fees("uniswap").await.unwrap_err();
        assert_eq!(err, FetchError::Unsupported("protocol_fees".into()));
    }

    #[tokio::test]
    async fn test_invalidate_and_refresh() {
        let source = Arc::new(FakeSource::new("fake"));
        let aggregator = aggregator(&[source.clone()]);

        aggregator.get_price("BTC").await.unwrap();
        aggregator.refresh_price("btc").await.unwrap();
        assert_eq!(source.calls().len(), 2);

        let key = crate::caching::CacheRequest::cache_key(&SymbolQuery::new(Category::Price, "BTC"));
        assert!(aggregator.invalidate(Category::Price, &key));
        assert!(!aggregator.invalidate(Category::Metadata, &key));

        aggregator.get_price("BTC").await.unwrap();
        assert_eq!(source.calls().len(), 3);

        let stats = &aggregator.cache_stats()[0];
        assert_eq!(stats.name, "price");
        assert_eq!(stats.computations, 3);
    }

    #[tokio::test]
    async fn test_refresh_market_heatmap() {
        let source = Arc::new(FakeSource::new("fake"));
        let aggregator = aggregator(&[source.clone()]);

        aggregator.get_market_heatmap("defi", 20).await.unwrap();
        aggregator.get_market_heatmap("DeFi", 20).await.unwrap();
        assert_eq!(source.calls(), ["market_heatmap:defi:20"]);

        aggregator.refresh_market_heatmap(" DEFI", 20).await.unwrap();
        assert_eq!(
            source.calls(),
            ["market_heatmap:defi:20", "market_heatmap:defi:20"]
        );

        // the refreshed value is served from the cache afterwards
        aggregator.get_market_heatmap("defi", 20).await.unwrap();
        assert_eq!(source.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_stats_cover_every_category() {
        let aggregator = aggregator(&[]);

        let names: Vec<_> = aggregator
            .cache_stats()
            .iter()
            .map(|stats| stats.name)
            .collect();
        let categories: Vec<_> = Category::ALL.iter().map(Category::as_str).collect();
        assert_eq!(names, categories);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resilient_price_falls_back() {
        let source = Arc::new(FakeSource::new("fake"));
        let aggregator = aggregator(&[source.clone()]);

        let fresh = aggregator.get_price_resilient("BTC").await.unwrap();
        assert!(!fresh.is_stale);

        source.failing.lock().insert("BTC");
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(aggregator.get_price("BTC").await.is_err());
        let stale = aggregator.get_price_resilient("BTC").await.unwrap();
        assert!(stale.is_stale);
        assert_eq!(stale.value.price, 100.0);

        source.failing.lock().insert("ETH");
        assert!(aggregator.get_price_resilient("ETH").await.is_err());
    }
}
