use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use super::{Validate, WireClient, WireRequest};
use crate::error::{FetchError, FetchResult};
use crate::utils::futures::CallOnDrop;

type AnyValue = Arc<dyn Any + Send + Sync>;
type RequestFuture = BoxFuture<'static, FetchResult<AnyValue>>;

struct InFlightRequest {
    channel: WeakShared<RequestFuture>,
    generation: u64,
}

type RequestMap = Arc<Mutex<HashMap<String, InFlightRequest>>>;

/// Collapses identical concurrent requests into a single network call.
///
/// Requests are identified by `METHOD:url`. A request only shares the call that is currently in
/// flight; once that call resolves, the next request issues a new one. This is independent of any
/// caching.
#[derive(Clone, Default)]
pub struct RequestDeduplicator {
    in_flight: RequestMap,
    next_generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for RequestDeduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDeduplicator")
            .field("in_flight", &self.len())
            .finish()
    }
}

impl RequestDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Performs `request` through `client`, sharing the call with identical concurrent requests.
    pub async fn request<T>(&self, client: &WireClient, request: WireRequest) -> FetchResult<T>
    where
        T: DeserializeOwned + Validate + Clone + Send + Sync + 'static,
    {
        let key = request.dedup_key();
        let client = client.clone();
        self.deduplicate(key, move || async move { client.request::<T>(request).await })
            .await
    }

    /// Runs the future created by `make_future`, unless a call for `key` is already in flight.
    ///
    /// All callers of the same `key` receive a clone of the same result. If every caller goes away
    /// before the call resolves, the call is dropped.
    pub async fn deduplicate<T, F, Fut>(&self, key: String, make_future: F) -> FetchResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let channel = {
            let mut in_flight = self.in_flight.lock();
            let existing = in_flight.get(&key).and_then(|r| r.channel.upgrade());
            match existing {
                Some(channel) => {
                    tracing::trace!(%key, "Joining in-flight request");
                    metric!(counter("wire.dedup.hit") += 1);
                    channel
                }
                None => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let channel = self.create_channel(key.clone(), generation, make_future());
                    if let Some(weak) = channel.downgrade() {
                        in_flight.insert(
                            key,
                            InFlightRequest {
                                channel: weak,
                                generation,
                            },
                        );
                    }
                    channel
                }
            }
        };

        let value = channel.await?;
        match value.downcast::<T>() {
            Ok(value) => Ok(T::clone(&value)),
            // the same key was requested with a different response type
            Err(_) => Err(FetchError::InternalError),
        }
    }

    fn create_channel<T, Fut>(&self, key: String, generation: u64, future: Fut) -> Shared<RequestFuture>
    where
        T: Send + Sync + 'static,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let in_flight = Arc::clone(&self.in_flight);
        let remove_request_token = CallOnDrop::new(move || {
            let mut in_flight = in_flight.lock();
            if in_flight
                .get(&key)
                .is_some_and(|r| r.generation == generation)
            {
                in_flight.remove(&key);
            }
        });

        async move {
            let result = future.await;
            // Drop the token first to evict from the map. Later callers start a new request.
            drop(remove_request_token);
            result.map(|value| Arc::new(value) as AnyValue)
        }
        .boxed()
        .shared()
    }

    /// Number of requests currently in flight.
    pub fn len(&self) -> usize {
        self.in_flight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use marketpulse_test::{self as test, MockProvider};
    use serde_json::json;

    use crate::config::WireConfig;

    use super::*;

    #[tokio::test]
    async fn test_concurrent_requests_share_one_call() {
        test::setup();
        let provider = MockProvider::new();
        provider.set_json("price/BTC", json!({"price": 1}));

        let client = WireClient::new(&WireConfig::default()).unwrap();
        let dedup = RequestDeduplicator::new();
        let url = provider.url("delay/200ms/price/BTC");

        let requests = (0..5).map(|_| {
            dedup.request::<serde_json::Value>(&client, WireRequest::get("mock", url.clone()))
        });
        let results = futures::future::join_all(requests).await;

        assert!(results.iter().all(|r| *r == Ok(json!({"price": 1}))));
        assert_eq!(provider.accesses(), 1);
        assert!(dedup.is_empty());

        // the first call has resolved, so this issues a new one
        dedup
            .request::<serde_json::Value>(&client, WireRequest::get("mock", url))
            .await
            .unwrap();
        assert_eq!(provider.accesses(), 1);
    }

    #[tokio::test]
    async fn test_post_bodies_are_not_part_of_the_key() {
        test::setup();
        let provider = MockProvider::new();
        provider.set_json("heatmap", json!({"cells": []}));

        let client = WireClient::new(&WireConfig::default()).unwrap();
        let dedup = RequestDeduplicator::new();
        let url = provider.url("delay/200ms/heatmap");

        let requests = ["1h", "4h"].map(|timeframe| {
            let body = json!({"timeframe": timeframe});
            dedup.request::<serde_json::Value>(&client, WireRequest::post("mock", url.clone(), body))
        });
        let [first, second] = futures::future::join_all(requests)
            .await
            .try_into()
            .unwrap();

        assert_eq!(first, Ok(json!({"cells": []})));
        assert_eq!(first, second);
        assert_eq!(provider.accesses(), 1);

        // the shared call has resolved, so this issues a new one
        dedup
            .request::<serde_json::Value>(&client, WireRequest::get("mock", url))
            .await
            .unwrap();
        assert_eq!(provider.accesses(), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_are_not_shared() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dedup = RequestDeduplicator::new();

        let make = |key: &str| {
            let calls = Arc::clone(&calls);
            dedup.deduplicate(key.to_owned(), move || async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(calls.fetch_add(1, Ordering::SeqCst))
            })
        };

        let (a, b, c) = tokio::join!(make("GET:a"), make("GET:b"), make("GET:a"));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(a, c);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_errors_are_shared_and_not_kept() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dedup = RequestDeduplicator::new();

        let make = || {
            let calls = Arc::clone(&calls);
            dedup.deduplicate::<u32, _, _>("GET:x".to_owned(), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(FetchError::Http {
                    status: 502,
                    message: "Bad Gateway".into(),
                })
            })
        };

        let (a, b) = tokio::join!(make(), make());
        assert!(a.is_err());
        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(make().await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abandoned_request_is_removed() {
        let dedup = RequestDeduplicator::new();

        let slow = dedup.deduplicate("GET:slow".to_owned(), || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1u32)
        });
        let result = tokio::time::timeout(Duration::from_millis(10), slow).await;

        assert!(result.is_err());
        assert!(dedup.is_empty());
    }
}
