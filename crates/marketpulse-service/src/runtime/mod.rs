//! The process-wide task runtime.
//!
//! A [`MarketRuntime`] owns the [`SharedServices`], so that every caller shares the same caches,
//! and runs tasks under a tree of cancellation tokens. Tasks forked from within a task are
//! interrupted together with their parent.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::aggregator::MarketDataAggregator;
use crate::config::{Config, RuntimeConfig};
use crate::error::{FetchError, FetchResult};
use crate::services::SharedServices;
use crate::utils::futures::measure;
use crate::{logging, metrics};

mod handle;

pub use handle::{Outcome, TaskHandle};

static GLOBAL_RUNTIME: Mutex<Option<Arc<MarketRuntime>>> = parking_lot::const_mutex(None);

tokio::task_local! {
    /// The token of the task currently running on a [`MarketRuntime`].
    static CURRENT_TOKEN: CancellationToken;
}

/// Options of [`MarketRuntime::run_resilient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResilientOptions {
    /// Bound of every single attempt.
    pub timeout: Duration,
    /// Number of attempts after the first one.
    pub retries: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl ResilientOptions {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            timeout: config.resilient_timeout,
            retries: config.resilient_retries,
            delay: config.resilient_delay,
        }
    }
}

impl Default for ResilientOptions {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

/// Runs market data tasks on a shared set of services.
pub struct MarketRuntime {
    services: SharedServices,
    handle: Handle,
    root: CancellationToken,
    /// The runtime backing `handle`, if it was created by us.
    owned: Option<Runtime>,
}

impl std::fmt::Debug for MarketRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketRuntime")
            .field("services", &self.services)
            .field("is_shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl MarketRuntime {
    /// Creates a runtime spawning its tasks on `handle`.
    ///
    /// This does not start the cache sweepers. Expired entries are then only replaced on access,
    /// unless the caller starts them with [`SharedServices::spawn_sweepers`].
    pub fn new(services: SharedServices, handle: Handle) -> Self {
        Self {
            services,
            handle,
            root: CancellationToken::new(),
            owned: None,
        }
    }

    /// Creates a runtime with its own worker threads and all services described by `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("marketpulse-worker")
            .enable_all()
            .build()
            .context("failed to create tokio runtime")?;
        let services = SharedServices::new(config).context("failed to create services")?;
        services.spawn_sweepers(runtime.handle());

        let mut market_runtime = Self::new(services, runtime.handle().clone());
        market_runtime.owned = Some(runtime);
        Ok(market_runtime)
    }

    /// Sets up sentry, logging and metrics from `config`, then creates a runtime.
    ///
    /// The returned sentry guard flushes pending events on drop and should be held until exit.
    pub fn init(config: Config) -> Result<(Self, Option<sentry::ClientInitGuard>)> {
        let sentry = logging::init_sentry(&config);
        logging::init_logging(&config);
        if let Some(ref statsd) = config.metrics.statsd {
            let tags = config.metrics.custom_tags.clone();
            metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)?;
        }

        match Self::from_config(config) {
            Ok(runtime) => Ok((runtime, sentry)),
            Err(err) => {
                logging::ensure_log_error(&err);
                Err(err)
            }
        }
    }

    /// Returns the process-wide runtime, creating it from the default configuration on first use.
    pub fn global() -> Result<Arc<Self>> {
        let mut global = GLOBAL_RUNTIME.lock();
        if let Some(runtime) = global.as_ref() {
            return Ok(Arc::clone(runtime));
        }

        tracing::debug!("Creating global market runtime");
        let runtime = Arc::new(Self::from_config(Config::default())?);
        *global = Some(Arc::clone(&runtime));
        Ok(runtime)
    }

    /// Replaces the process-wide runtime, returning the previous one.
    pub fn install(runtime: Arc<Self>) -> Option<Arc<Self>> {
        GLOBAL_RUNTIME.lock().replace(runtime)
    }

    /// Removes the process-wide runtime and interrupts all of its tasks.
    pub fn dispose() -> Option<Arc<Self>> {
        let runtime = GLOBAL_RUNTIME.lock().take()?;
        runtime.shutdown();
        Some(runtime)
    }

    /// Interrupts every outstanding task. Tasks started afterwards are interrupted immediately.
    pub fn shutdown(&self) {
        tracing::debug!("Shutting down market runtime");
        self.root.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }

    pub fn services(&self) -> &SharedServices {
        &self.services
    }

    pub fn aggregator(&self) -> &Arc<MarketDataAggregator> {
        &self.services.aggregator
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// The default options of [`run_resilient`](Self::run_resilient).
    pub fn resilient_options(&self) -> ResilientOptions {
        ResilientOptions::from_config(&self.services.config.runtime)
    }

    /// The token new tasks are children of: the current task's token, or the root.
    fn parent_token(&self) -> CancellationToken {
        CURRENT_TOKEN
            .try_with(CancellationToken::clone)
            .unwrap_or_else(|_| self.root.clone())
    }

    fn spawn_under<T, F>(&self, token: CancellationToken, mode: &'static str, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let task_token = token.clone();
        let future = async move {
            tokio::select! {
                biased;
                _ = task_token.cancelled() => Outcome::Interrupted,
                result = task => Outcome::from(result),
            }
        };
        let future = CURRENT_TOKEN.scope(token.clone(), future);
        let future = measure(mode, Outcome::metrics_tag, future);
        let join = self
            .handle
            .spawn(future.bind_hub(Hub::new_from_top(Hub::current())));

        TaskHandle { token, join }
    }

    /// Starts `task` in the background.
    pub fn fork<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = FetchResult<T>> + Send + 'static,
    {
        self.spawn_under(self.parent_token().child_token(), "runtime.fork", task)
    }

    /// Runs `task` to completion.
    ///
    /// Dropping the returned future interrupts the task.
    pub async fn run<T, F>(&self, task: F) -> FetchResult<T>
    where
        T: Send + 'static,
        F: Future<Output = FetchResult<T>> + Send + 'static,
    {
        self.run_with_mode("runtime.run", task).await.into_result()
    }

    /// Runs `task` to completion, reporting interruptions separately from failures.
    pub async fn run_to_outcome<T, F>(&self, task: F) -> Outcome<T>
    where
        T: Send + 'static,
        F: Future<Output = FetchResult<T>> + Send + 'static,
    {
        self.run_with_mode("runtime.run_to_outcome", task).await
    }

    async fn run_with_mode<T, F>(&self, mode: &'static str, task: F) -> Outcome<T>
    where
        T: Send + 'static,
        F: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let handle = self.spawn_under(self.parent_token().child_token(), mode, task);
        let guard = handle.token.clone().drop_guard();
        let outcome = handle.join().await;
        guard.disarm();
        outcome
    }

    /// Runs `task`, giving up after `duration`.
    ///
    /// Returns `Ok(None)` on timeout, in which case the task is interrupted.
    pub async fn run_with_timeout<T, F>(&self, task: F, duration: Duration) -> FetchResult<Option<T>>
    where
        T: Send + 'static,
        F: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let handle = self.spawn_under(
            self.parent_token().child_token(),
            "runtime.run_with_timeout",
            task,
        );
        let guard = handle.token.clone().drop_guard();

        match tokio::time::timeout(duration, handle.join()).await {
            Ok(outcome) => {
                guard.disarm();
                outcome.into_result().map(Some)
            }
            Err(_) => {
                tracing::debug!(?duration, "Task timed out");
                metric!(counter("runtime.timeout") += 1);
                // dropping the guard interrupts the task
                drop(guard);
                Ok(None)
            }
        }
    }

    /// Runs all `tasks` concurrently, at most `limit` at a time.
    ///
    /// The results keep the order of `tasks`. The first failure interrupts all remaining tasks and
    /// is returned.
    pub async fn run_concurrent<T, F>(&self, tasks: Vec<F>, limit: Option<usize>) -> FetchResult<Vec<T>>
    where
        T: Send + 'static,
        F: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let group = self.parent_token().child_token();
        let guard = group.clone().drop_guard();
        let count = tasks.len();

        let mut pending: FuturesUnordered<_> = self
            .spawn_group(&group, "runtime.run_concurrent", tasks, limit)
            .into_iter()
            .enumerate()
            .map(|(index, handle)| async move { (index, handle.join().await) })
            .collect();

        let mut results: Vec<Option<T>> = (0..count).map(|_| None).collect();
        while let Some((index, outcome)) = pending.next().await {
            match outcome {
                Outcome::Success(value) => results[index] = Some(value),
                // returning drops the guard, which interrupts the remaining tasks
                Outcome::Failure(err) => return Err(err),
                Outcome::Interrupted => return Err(FetchError::Cancelled),
            }
        }

        guard.disarm();
        Ok(results.into_iter().flatten().collect())
    }

    /// Runs all `tasks` concurrently, at most `limit` at a time, and reports every outcome.
    ///
    /// Unlike [`run_concurrent`](Self::run_concurrent), a failure does not affect other tasks.
    pub async fn run_concurrent_outcomes<T, F>(&self, tasks: Vec<F>, limit: Option<usize>) -> Vec<Outcome<T>>
    where
        T: Send + 'static,
        F: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let group = self.parent_token().child_token();
        let guard = group.clone().drop_guard();

        let handles = self.spawn_group(&group, "runtime.run_concurrent_outcomes", tasks, limit);
        let outcomes = futures::future::join_all(handles.into_iter().map(TaskHandle::join)).await;

        guard.disarm();
        outcomes
    }

    fn spawn_group<T, F>(
        &self,
        group: &CancellationToken,
        mode: &'static str,
        tasks: Vec<F>,
        limit: Option<usize>,
    ) -> Vec<TaskHandle<T>>
    where
        T: Send + 'static,
        F: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let semaphore = limit.map(|limit| Arc::new(Semaphore::new(limit.max(1))));

        tasks
            .into_iter()
            .map(|task| {
                let semaphore = semaphore.clone();
                let task = async move {
                    let _permit = match semaphore {
                        Some(semaphore) => Some(
                            semaphore
                                .acquire_owned()
                                .await
                                .map_err(|_| FetchError::Cancelled)?,
                        ),
                        None => None,
                    };
                    task.await
                };
                self.spawn_under(group.child_token(), mode, task)
            })
            .collect()
    }

    /// Runs the task created by `factory`, retrying on failure or timeout.
    ///
    /// Every attempt is bounded by `options.timeout`. Up to `options.retries` further attempts
    /// are made, `options.delay` apart. Returns `None` once all attempts are used up.
    pub async fn run_resilient<T, F, Fut>(&self, factory: F, options: ResilientOptions) -> Option<T>
    where
        T: Send + 'static,
        F: Fn() -> Fut,
        Fut: Future<Output = FetchResult<T>> + Send + 'static,
    {
        let attempts = options.retries.saturating_add(1);
        for attempt in 1..=attempts {
            match self.run_with_timeout(factory(), options.timeout).await {
                Ok(Some(value)) => return Some(value),
                Ok(None) => tracing::debug!(attempt, "Resilient task timed out"),
                Err(FetchError::Cancelled) => return None,
                Err(err) => tracing::debug!(attempt, error = %err, "Resilient task failed"),
            }

            if attempt < attempts {
                tokio::time::sleep(options.delay).await;
            }
        }

        metric!(counter("runtime.resilient.exhausted") += 1);
        None
    }
}

#[cfg(test)]
impl MarketRuntime {
    /// Creates a runtime without sources on the current tokio runtime.
    pub(crate) fn for_tests() -> Self {
        let config = Config::default();
        let wire = match crate::wire::WireClient::new(&config.wire) {
            Ok(wire) => wire,
            Err(err) => panic!("failed to create wire client: {err}"),
        };
        let dedup = crate::wire::RequestDeduplicator::new();
        let services = SharedServices::with_sources(config, wire, dedup, vec![]);
        Self::new(services, Handle::current())
    }
}

impl Drop for MarketRuntime {
    fn drop(&mut self) {
        self.root.cancel();
        if let Some(runtime) = self.owned.take() {
            runtime.shutdown_background();
        }
    }
}
