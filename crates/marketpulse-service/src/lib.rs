#[macro_use]
pub mod metrics;

pub mod aggregator;
pub mod caching;
pub mod config;
pub mod error;
pub mod logging;
pub mod query;
pub mod runtime;
pub mod services;
pub mod sources;
pub mod types;
pub mod utils;
pub mod wire;
