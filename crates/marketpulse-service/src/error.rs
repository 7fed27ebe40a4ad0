//! The central [`FetchError`] type.
//!
//! All failures that cross a component boundary are expressed as a [`FetchError`]. It is
//! [`Clone`] so that the result of a single upstream computation can be handed to every
//! concurrent waiter of a cache key.

use std::time::Duration;

use thiserror::Error;

/// An error that happens while fetching market data from an upstream provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// No response was received from the remote host.
    ///
    /// This covers connection failures, DNS resolution, and TLS problems.
    #[error("network error: {0}")]
    Network(String),
    /// The remote host responded with a non-2xx status code.
    #[error("http error {status}: {message}")]
    Http { status: u16, message: String },
    /// The remote host asked us to slow down (HTTP 429).
    #[error("rate limited{}", format_retry_after(.retry_after))]
    RateLimited { retry_after: Option<Duration> },
    /// The payload could not be deserialized or failed validation.
    #[error("malformed payload: {0}")]
    Parse(String),
    /// A failure attributed to a named upstream provider and optionally a symbol.
    #[error("{provider}{}: {source}", format_symbol(.symbol))]
    DataSource {
        provider: String,
        symbol: Option<String>,
        #[source]
        source: Box<FetchError>,
    },
    /// The provider does not offer this kind of query.
    #[error("{0} not supported")]
    Unsupported(String),
    /// The operation did not complete within the given duration.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// The task was interrupted before it completed.
    #[error("cancelled")]
    Cancelled,
    /// All configured attempts were used up without a result.
    #[error("gave up after {attempts} attempts")]
    Exhausted { attempts: u32 },
    /// An unexpected error in marketpulse itself.
    #[error("internal error")]
    InternalError,
}

fn format_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(duration) => format!(", retry after {duration:?}"),
        None => String::new(),
    }
}

fn format_symbol(symbol: &Option<String>) -> String {
    match symbol {
        Some(symbol) => format!(" ({symbol})"),
        None => String::new(),
    }
}

impl FetchError {
    /// Wraps this error, attributing it to `provider` and optionally a `symbol`.
    ///
    /// Rate limit errors are passed through unchanged so that callers can still react to
    /// `retry_after`.
    pub fn with_source(self, provider: &str, symbol: Option<&str>) -> Self {
        match self {
            err @ (Self::RateLimited { .. } | Self::DataSource { .. } | Self::Cancelled) => err,
            err => Self::DataSource {
                provider: provider.to_owned(),
                symbol: symbol.map(str::to_owned),
                source: Box::new(err),
            },
        }
    }

    /// Whether retrying the same request might lead to a different result.
    ///
    /// Only rate limits and server errors (5xx) are considered transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Http { status, .. } => (500..600).contains(status),
            Self::DataSource { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Returns the innermost error, looking through [`DataSource`](Self::DataSource) wrappers.
    pub fn root(&self) -> &FetchError {
        match self {
            Self::DataSource { source, .. } => source.root(),
            err => err,
        }
    }

    /// A short, stable name usable as a metrics tag.
    pub fn metrics_tag(&self) -> &'static str {
        match self.root() {
            Self::Network(_) => "network",
            Self::Http { .. } => "http",
            Self::RateLimited { .. } => "ratelimited",
            Self::Parse(_) => "parse",
            Self::DataSource { .. } => "datasource",
            Self::Unsupported(_) => "unsupported",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Exhausted { .. } => "exhausted",
            Self::InternalError => "internalerror",
        }
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<tokio::task::JoinError> for FetchError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::from_std_error(err)
        }
    }
}

/// The result of any fallible fetch.
pub type FetchResult<T> = Result<T, FetchError>;
