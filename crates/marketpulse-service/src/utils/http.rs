use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::config::WireConfig;
use crate::error::FetchError;

/// Various timeouts for the wire client.
#[derive(Copy, Clone, Debug)]
pub struct WireTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// Global timeout for one request attempt.
    pub request: Duration,
}

impl WireTimeouts {
    pub fn from_config(config: &WireConfig) -> Self {
        Self {
            connect: config.connect_timeout,
            request: config.request_timeout,
        }
    }
}

impl Default for WireTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(2),
            request: Duration::from_secs(10),
        }
    }
}

/// Creates a [`reqwest::Client`] with the provided options.
///
/// * `timeouts` controls connection and request timeouts.
/// * `user_agent` is sent as default `User-Agent` header with every request.
pub fn create_client(
    timeouts: &WireTimeouts,
    user_agent: &str,
) -> Result<reqwest::Client, FetchError> {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(user_agent) {
        headers.insert(USER_AGENT, value);
    }

    reqwest::ClientBuilder::new()
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.request)
        .pool_idle_timeout(Duration::from_secs(30))
        .default_headers(headers)
        .build()
        .map_err(FetchError::from_std_error)
}
