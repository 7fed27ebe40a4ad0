//! Provides the internal marketpulse services and a way to initialize them.
//!
//! All services are created exactly once per [`SharedServices`], leaves first: the wire client and
//! request deduplicator are shared by all sources, which in turn are shared by all caches of the
//! aggregator.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::aggregator::MarketDataAggregator;
use crate::config::Config;
use crate::sources::{JsonApiSource, MarketDataSource};
use crate::wire::{RequestDeduplicator, WireClient};

#[derive(Debug, Clone)]
pub struct SharedServices {
    pub config: Arc<Config>,
    pub wire: WireClient,
    pub dedup: RequestDeduplicator,
    pub aggregator: Arc<MarketDataAggregator>,
}

impl SharedServices {
    /// Creates all services, with one [`JsonApiSource`] per configured source.
    pub fn new(config: Config) -> Result<Self> {
        let wire = WireClient::new(&config.wire).context("failed to create HTTP client")?;
        let dedup = RequestDeduplicator::new();

        let sources = config
            .sources
            .iter()
            .map(|source| {
                tracing::debug!(name = %source.name, url = %source.url, "Adding source");
                Arc::new(JsonApiSource::new(source, wire.clone(), dedup.clone()))
                    as Arc<dyn MarketDataSource>
            })
            .collect();

        Ok(Self::with_sources(config, wire, dedup, sources))
    }

    /// Creates all services on top of the given `sources`, in order of preference.
    pub fn with_sources(
        config: Config,
        wire: WireClient,
        dedup: RequestDeduplicator,
        sources: Vec<Arc<dyn MarketDataSource>>,
    ) -> Self {
        let aggregator = Arc::new(MarketDataAggregator::new(
            sources,
            &config.caches,
            &config.aggregator,
        ));

        Self {
            config: Arc::new(config),
            wire,
            dedup,
            aggregator,
        }
    }

    /// Starts the background sweepers of all caches on the given runtime.
    pub fn spawn_sweepers(&self, handle: &tokio::runtime::Handle) {
        let _guard = handle.enter();
        let sweepers = self
            .aggregator
            .spawn_sweepers(self.config.caches.sweep_interval);
        tracing::debug!(count = sweepers.len(), "Started cache sweepers");
    }
}
