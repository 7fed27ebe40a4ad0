use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::sources::{Capabilities, RateLimit};

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for marketpulse.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "marketpulse".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Tuning of a single in-memory cache.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheSettings {
    /// How long a computed value is served before it is recomputed.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Maximum number of entries held by the cache.
    pub capacity: usize,
    /// The fraction of `capacity` evicted at once when the cache is full.
    pub eviction_fraction: f64,
}

impl CacheSettings {
    /// Settings with the given `ttl` and default capacity.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            capacity: 1_000,
            eviction_fraction: 0.2,
        }
    }
}

/// Configuration of the in-memory caches, one per data category.
///
/// Fast moving data (prices, liquidations) gets a short TTL, while rather stable data
/// (protocol fees, metadata) is kept around for much longer.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfigs {
    pub price: CacheSettings,
    pub open_interest: CacheSettings,
    pub funding_rate: CacheSettings,
    pub liquidations: CacheSettings,
    pub heatmap: CacheSettings,
    pub market_heatmap: CacheSettings,
    pub protocol_fees: CacheSettings,
    pub metadata: CacheSettings,

    /// How often expired entries are swept from all caches, independent of reads.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfigs {
    fn default() -> Self {
        Self {
            price: CacheSettings::with_ttl(Duration::from_secs(30)),
            open_interest: CacheSettings::with_ttl(Duration::from_secs(60)),
            funding_rate: CacheSettings::with_ttl(Duration::from_secs(120)),
            liquidations: CacheSettings::with_ttl(Duration::from_secs(60)),
            heatmap: CacheSettings::with_ttl(Duration::from_secs(60)),
            market_heatmap: CacheSettings::with_ttl(Duration::from_secs(120)),
            protocol_fees: CacheSettings::with_ttl(Duration::from_secs(10 * 60)),
            metadata: CacheSettings::with_ttl(Duration::from_secs(30 * 60)),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Configuration of the wire client.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct WireConfig {
    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for a single request attempt, including reading the body.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Total number of attempts for retryable failures, including the first one.
    pub max_attempts: u32,

    /// The delay before the first retry. Doubles on every further retry.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for a single retry delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// The `User-Agent` sent with every request.
    pub user_agent: String,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            user_agent: concat!("marketpulse/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}

/// Configuration of the aggregator.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Maximum number of concurrent upstream lookups issued by batch operations.
    ///
    /// This limit is shared by all batch calls on one aggregator.
    pub batch_concurrency: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            batch_concurrency: 5,
        }
    }
}

/// Configuration of the task runtime.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Timeout for a single attempt of a resilient task.
    #[serde(with = "humantime_serde")]
    pub resilient_timeout: Duration,
    /// Number of retries of a resilient task after the first attempt.
    pub resilient_retries: u32,
    /// Delay between attempts of a resilient task.
    #[serde(with = "humantime_serde")]
    pub resilient_delay: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            resilient_timeout: Duration::from_secs(10),
            resilient_retries: 2,
            resilient_delay: Duration::from_secs(1),
        }
    }
}

/// An upstream provider speaking the generic JSON layout.
#[derive(Clone, Debug, Deserialize)]
pub struct SourceConfig {
    /// Name of the provider, used for attribution in errors, logs and metrics.
    pub name: String,
    /// Base URL under which the endpoints live.
    pub url: Url,
    /// Additional headers sent with every request, e.g. API keys.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// The queries this provider can answer.
    #[serde(default)]
    pub capabilities: Capabilities,
    /// The documented rate limit of this provider.
    #[serde(default)]
    pub rate_limit: RateLimit,
}

/// The marketpulse configuration, usually loaded from a YAML file via [`Config::get`].
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune the in-memory caches.
    pub caches: CacheConfigs,

    /// Timeouts and retries of upstream requests.
    pub wire: WireConfig,

    /// Batch fan-out limits.
    pub aggregator: AggregatorConfig,

    /// Defaults of the task runtime.
    pub runtime: RuntimeConfig,

    /// Upstream providers, in order of preference.
    pub sources: Vec<SourceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            wire: WireConfig::default(),
            aggregator: AggregatorConfig::default(),
            runtime: RuntimeConfig::default(),
            sources: Vec::new(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
