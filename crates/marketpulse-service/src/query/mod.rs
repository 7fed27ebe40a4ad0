//! Query bindings: per-consumer task lifecycles on top of the [`MarketRuntime`].
//!
//! A [`QueryBinding`] runs a task on the shared runtime and publishes a [`QueryState`] after
//! every transition. Restarting a binding interrupts the task it started before, and values
//! from a previous run stay visible while the next one is loading.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::{FetchError, FetchResult};
use crate::runtime::{MarketRuntime, ResilientOptions, TaskHandle};

mod group;

pub use group::{GroupMode, GroupRecord, QueryGroup};

/// Creates a fresh task every time a binding (re)starts.
pub type TaskFactory<T> = Arc<dyn Fn() -> BoxFuture<'static, FetchResult<T>> + Send + Sync>;

/// Boxes `factory` into a [`TaskFactory`].
pub fn task_factory<T, F, Fut>(factory: F) -> TaskFactory<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult<T>> + Send + 'static,
{
    Arc::new(move || Box::pin(factory()) as BoxFuture<'static, FetchResult<T>>)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStatus {
    /// Nothing was started yet, or the binding was reset.
    Idle,
    Loading,
    Success,
    Error,
}

/// A snapshot of a binding.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryState<T> {
    /// The last successfully loaded value.
    pub data: Option<T>,
    /// The error of the last run, if it failed.
    pub error: Option<FetchError>,
    pub status: QueryStatus,
    /// Whether `data` stems from an earlier run than the current or failed one.
    pub is_stale: bool,
}

impl<T> QueryState<T> {
    fn idle() -> Self {
        Self {
            data: None,
            error: None,
            status: QueryStatus::Idle,
            is_stale: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == QueryStatus::Idle
    }

    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }
}

/// Options shared by all binding variants.
#[derive(Clone)]
pub struct QueryOptions<T> {
    /// Keep the last value visible while reloading. Enabled by default.
    pub keep_previous_data: bool,
    /// Wrap every run with [`MarketRuntime::run_resilient`].
    pub resilient: Option<ResilientOptions>,
    /// The value a resilient run settles with once all attempts are used up.
    pub fallback: Option<T>,
}

impl<T> QueryOptions<T> {
    pub fn keep_previous_data(mut self, keep: bool) -> Self {
        self.keep_previous_data = keep;
        self
    }

    pub fn resilient(mut self, options: ResilientOptions) -> Self {
        self.resilient = Some(options);
        self
    }

    pub fn fallback(mut self, value: T) -> Self {
        self.fallback = Some(value);
        self
    }
}

impl<T> Default for QueryOptions<T> {
    fn default() -> Self {
        Self {
            keep_previous_data: true,
            resilient: None,
            fallback: None,
        }
    }
}

impl<T> fmt::Debug for QueryOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("keep_previous_data", &self.keep_previous_data)
            .field("resilient", &self.resilient)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

/// The run a binding is currently waiting for.
struct Attempt {
    generation: u64,
    handle: TaskHandle<()>,
}

/// The state behind a [`QueryState`].
///
/// Only the run in `current` may settle. Interrupting or replacing it makes its result vanish.
struct RevalidationSlots<T> {
    last_good: Option<T>,
    current: Option<Attempt>,
    error: Option<FetchError>,
    status: QueryStatus,
    is_stale: bool,
    next_generation: u64,
    unmounted: bool,
}

impl<T: Clone> RevalidationSlots<T> {
    fn new() -> Self {
        Self {
            last_good: None,
            current: None,
            error: None,
            status: QueryStatus::Idle,
            is_stale: false,
            next_generation: 0,
            unmounted: false,
        }
    }

    fn interrupt(&mut self) {
        if let Some(attempt) = self.current.take() {
            attempt.handle.interrupt();
        }
    }

    /// Interrupts the current run and returns the generation of the next one.
    fn start(&mut self, keep_previous_data: bool) -> u64 {
        self.interrupt();
        if !keep_previous_data {
            self.last_good = None;
        }
        self.status = QueryStatus::Loading;
        self.is_stale = self.last_good.is_some();

        self.next_generation += 1;
        self.next_generation
    }

    fn is_current(&self, generation: u64) -> bool {
        self.current
            .as_ref()
            .is_some_and(|attempt| attempt.generation == generation)
    }

    fn succeed(&mut self, value: T) {
        self.current = None;
        self.last_good = Some(value);
        self.error = None;
        self.status = QueryStatus::Success;
        self.is_stale = false;
    }

    fn fail(&mut self, error: FetchError) {
        self.current = None;
        self.error = Some(error);
        self.status = QueryStatus::Error;
        self.is_stale = self.last_good.is_some();
    }

    fn reset(&mut self) {
        self.interrupt();
        self.last_good = None;
        self.error = None;
        self.status = QueryStatus::Idle;
        self.is_stale = false;
    }

    fn snapshot(&self) -> QueryState<T> {
        QueryState {
            data: self.last_good.clone(),
            error: self.error.clone(),
            status: self.status,
            is_stale: self.is_stale,
        }
    }
}

struct BindingInner<T> {
    runtime: Arc<MarketRuntime>,
    factory: Mutex<TaskFactory<T>>,
    options: QueryOptions<T>,
    slots: Mutex<RevalidationSlots<T>>,
    sender: watch::Sender<QueryState<T>>,
    poller: Mutex<Option<TaskHandle<()>>>,
}

impl<T> BindingInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates the task of the next run, applying the resilient option.
    fn create_task(&self) -> BoxFuture<'static, FetchResult<T>> {
        let factory = Arc::clone(&*self.factory.lock());
        let Some(options) = self.options.resilient else {
            return factory();
        };

        let runtime = Arc::clone(&self.runtime);
        let fallback = self.options.fallback.clone();
        Box::pin(async move {
            match runtime.run_resilient(move || factory(), options).await {
                Some(value) => Ok(value),
                None => fallback.ok_or(FetchError::Exhausted {
                    attempts: options.retries.saturating_add(1),
                }),
            }
        })
    }

    /// Starts a new run, interrupting the current one.
    ///
    /// Returns `false` once the binding is unmounted.
    fn start(self: &Arc<Self>) -> bool {
        let task = self.create_task();

        let mut slots = self.slots.lock();
        if slots.unmounted {
            return false;
        }
        let generation = slots.start(self.options.keep_previous_data);

        let inner = Arc::clone(self);
        let handle = self.runtime.fork(async move {
            let result = task.await;
            inner.settle(generation, result);
            Ok(())
        });
        slots.current = Some(Attempt { generation, handle });

        self.sender.send_replace(slots.snapshot());
        true
    }

    fn settle(&self, generation: u64, result: FetchResult<T>) {
        let mut slots = self.slots.lock();
        if slots.unmounted || !slots.is_current(generation) {
            return;
        }

        match result {
            Ok(value) => {
                metric!(counter("query.settled") += 1, "status" => "ok");
                slots.succeed(value);
            }
            Err(err) => {
                tracing::debug!(error = %err, generation, "Query failed");
                metric!(counter("query.settled") += 1, "status" => err.metrics_tag());
                slots.fail(err);
            }
        }

        self.sender.send_replace(slots.snapshot());
    }

    fn reset(&self) {
        let mut slots = self.slots.lock();
        if slots.unmounted {
            return;
        }
        slots.reset();
        self.sender.send_replace(slots.snapshot());
    }

    fn unmount(&self) {
        if let Some(poller) = self.poller.lock().take() {
            poller.interrupt();
        }
        let mut slots = self.slots.lock();
        slots.unmounted = true;
        slots.interrupt();
    }
}

/// Binds a task to a consumer and tracks its [`QueryState`].
///
/// Dropping the binding unmounts it.
pub struct QueryBinding<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<BindingInner<T>>,
}

impl<T> QueryBinding<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new(runtime: Arc<MarketRuntime>, factory: TaskFactory<T>, options: QueryOptions<T>) -> Self {
        let (sender, _) = watch::channel(QueryState::idle());
        let inner = BindingInner {
            runtime,
            factory: Mutex::new(factory),
            options,
            slots: Mutex::new(RevalidationSlots::new()),
            sender,
            poller: Mutex::new(None),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Creates a binding that starts its task right away.
    pub fn eager(runtime: Arc<MarketRuntime>, factory: TaskFactory<T>, options: QueryOptions<T>) -> Self {
        let binding = Self::new(runtime, factory, options);
        binding.inner.start();
        binding
    }

    /// Creates a binding that stays idle until [`execute`](Self::execute) is called.
    pub fn lazy(runtime: Arc<MarketRuntime>, factory: TaskFactory<T>, options: QueryOptions<T>) -> Self {
        Self::new(runtime, factory, options)
    }

    /// Creates a binding that runs its task right away and then every `interval`.
    ///
    /// Every tick interrupts the run of the previous tick if it is still going.
    pub fn polling(
        runtime: Arc<MarketRuntime>,
        factory: TaskFactory<T>,
        interval: Duration,
        options: QueryOptions<T>,
    ) -> Self {
        let binding = Self::new(Arc::clone(&runtime), factory, options);

        let weak = Arc::downgrade(&binding.inner);
        let poller = runtime.fork(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.start() {
                    break;
                }
            }
            Ok(())
        });
        *binding.inner.poller.lock() = Some(poller);

        binding
    }

    /// Starts the task, interrupting a run that is still going.
    pub fn execute(&self) {
        self.inner.start();
    }

    /// Runs the task again, keeping the current data visible as stale.
    pub fn refetch(&self) {
        self.inner.start();
    }

    /// Replaces the task, for instance after its inputs changed, and restarts it.
    pub fn set_task(&self, factory: TaskFactory<T>) {
        *self.inner.factory.lock() = factory;
        self.inner.start();
    }

    /// Interrupts the current run and returns to [`QueryStatus::Idle`].
    pub fn reset(&self) {
        self.inner.reset();
    }

    /// Interrupts everything this binding started. No state is published afterwards.
    pub fn unmount(&self) {
        self.inner.unmount();
    }

    pub fn state(&self) -> QueryState<T> {
        self.inner.sender.borrow().clone()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<QueryState<T>> {
        self.inner.sender.subscribe()
    }
}

impl<T> Drop for QueryBinding<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.unmount();
    }
}

impl<T> fmt::Debug for QueryBinding<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryBinding")
            .field("state", &self.state())
            .field("options", &self.inner.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;

    /// A factory counting its calls, answering with the call number after `delay`.
    fn counting(delay: Duration) -> (TaskFactory<u32>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let factory = task_factory({
            let calls = Arc::clone(&calls);
            move || {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    tokio::time::sleep(delay).await;
                    Ok(call)
                }
            }
        });
        (factory, calls)
    }

    fn failing() -> TaskFactory<u32> {
        task_factory(|| async { Err(FetchError::Network("connection reset".into())) })
    }

    async fn settled(binding: &QueryBinding<u32>) -> QueryState<u32> {
        let mut receiver = binding.subscribe();
        let state = receiver
            .wait_for(|state| state.is_success() || state.is_error())
            .await
            .unwrap();
        state.clone()
    }

    #[tokio::test(start_paused = true)]
    async fn test_eager_binding() {
        let runtime = Arc::new(MarketRuntime::for_tests());
        let (factory, calls) = counting(Duration::from_millis(100));

        let binding = QueryBinding::eager(runtime, factory, QueryOptions::default());
        let state = binding.state();
        assert!(state.is_loading());
        assert_eq!(state.data, None);
        assert!(!state.is_stale);

        let state = settled(&binding).await;
        assert!(state.is_success());
        assert_eq!(state.data, Some(1));
        assert_eq!(state.error, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_while_revalidate() {
        let runtime = Arc::new(MarketRuntime::for_tests());
        let (factory, _) = counting(Duration::from_millis(100));

        let binding = QueryBinding::eager(runtime, factory, QueryOptions::default());
        settled(&binding).await;

        binding.refetch();
        let state = binding.state();
        assert!(state.is_loading());
        assert!(state.is_stale);
        assert_eq!(state.data, Some(1));

        let state = settled(&binding).await;
        assert_eq!(state.data, Some(2));
        assert!(!state.is_stale);

        // a failure keeps the last good value around
        binding.set_task(failing());
        let state = settled(&binding).await;
        assert!(state.is_error());
        assert!(state.is_stale);
        assert_eq!(state.data, Some(2));
        assert_eq!(
            state.error,
            Some(FetchError::Network("connection reset".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_previous_data() {
        let runtime = Arc::new(MarketRuntime::for_tests());
        let (factory, _) = counting(Duration::from_millis(100));
        let options = QueryOptions::default().keep_previous_data(false);

        let binding = QueryBinding::eager(runtime, factory, options);
        settled(&binding).await;

        binding.refetch();
        let state = binding.state();
        assert!(state.is_loading());
        assert_eq!(state.data, None);
        assert!(!state.is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_run_never_settles() {
        let runtime = Arc::new(MarketRuntime::for_tests());
        let finished = Arc::new(AtomicBool::new(false));
        let slow = task_factory({
            let finished = Arc::clone(&finished);
            move || {
                let finished = Arc::clone(&finished);
                async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(100)
                }
            }
        });
        let (fast, _) = counting(Duration::from_secs(1));

        let binding = QueryBinding::eager(runtime, slow, QueryOptions::default());
        tokio::time::sleep(Duration::from_millis(100)).await;
        binding.set_task(fast);

        let state = settled(&binding).await;
        assert_eq!(state.data, Some(1));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(binding.state().data, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_binding() {
        let runtime = Arc::new(MarketRuntime::for_tests());
        let (factory, calls) = counting(Duration::from_millis(100));

        let binding = QueryBinding::lazy(runtime, factory, QueryOptions::default());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(binding.state().is_idle());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        binding.execute();
        let state = settled(&binding).await;
        assert_eq!(state.data, Some(1));

        binding.execute();
        binding.reset();
        assert_eq!(binding.state(), QueryState::idle());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(binding.state(), QueryState::idle());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_binding() {
        let runtime = Arc::new(MarketRuntime::for_tests());
        let (factory, calls) = counting(Duration::from_millis(10));

        let binding = QueryBinding::polling(
            runtime,
            factory,
            Duration::from_secs(1),
            QueryOptions::default(),
        );
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(binding.state().data, Some(4));

        drop(binding);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmount_stops_state_updates() {
        let runtime = Arc::new(MarketRuntime::for_tests());
        let (factory, _) = counting(Duration::from_secs(1));

        let binding = QueryBinding::eager(runtime, factory, QueryOptions::default());
        let receiver = binding.subscribe();
        binding.unmount();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(binding.state().is_loading());
        assert!(!receiver.has_changed().unwrap());

        binding.execute();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(binding.state().is_loading());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resilient_binding() {
        let runtime = Arc::new(MarketRuntime::for_tests());
        let resilient = ResilientOptions {
            timeout: Duration::from_secs(1),
            retries: 2,
            delay: Duration::from_millis(100),
        };

        let options = QueryOptions::default().resilient(resilient);
        let binding = QueryBinding::eager(Arc::clone(&runtime), failing(), options);
        let state = settled(&binding).await;
        assert_eq!(state.error, Some(FetchError::Exhausted { attempts: 3 }));

        let options = QueryOptions::default().resilient(resilient).fallback(7);
        let binding = QueryBinding::eager(runtime, failing(), options);
        let state = settled(&binding).await;
        assert!(state.is_success());
        assert_eq!(state.data, Some(7));
    }
}
