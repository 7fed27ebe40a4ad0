use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::FetchResult;
use crate::runtime::{MarketRuntime, Outcome};

use super::TaskFactory;

/// How a [`QueryGroup`] treats failing members.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupMode {
    /// Any failure fails the whole group and interrupts the other members.
    FailFast,
    /// Failed members show up as `None`.
    NullOnError,
}

/// The values of a [`QueryGroup`] by key.
pub type GroupRecord<K, T> = BTreeMap<K, Option<T>>;

/// Keyed tasks that run together and settle as one [`GroupRecord`].
///
/// A group is bound like any other task via [`QueryGroup::into_factory`].
pub struct QueryGroup<K, T> {
    mode: GroupMode,
    members: Vec<(K, TaskFactory<T>)>,
    limit: Option<usize>,
}

impl<K, T> Clone for QueryGroup<K, T>
where
    K: Clone,
{
    fn clone(&self) -> Self {
        Self {
            mode: self.mode,
            members: self.members.clone(),
            limit: self.limit,
        }
    }
}

impl<K, T> fmt::Debug for QueryGroup<K, T>
where
    K: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<_> = self.members.iter().map(|(key, _)| key).collect();
        f.debug_struct("QueryGroup")
            .field("mode", &self.mode)
            .field("keys", &keys)
            .field("limit", &self.limit)
            .finish()
    }
}

impl<K, T> QueryGroup<K, T>
where
    K: Ord + Clone + fmt::Debug + Send + Sync + 'static,
    T: Send + 'static,
{
    pub fn new(mode: GroupMode) -> Self {
        Self {
            mode,
            members: Vec::new(),
            limit: None,
        }
    }

    /// Adds a member. A later member with the same key replaces the earlier one in the record.
    pub fn member(mut self, key: K, factory: TaskFactory<T>) -> Self {
        self.members.push((key, factory));
        self
    }

    /// Runs at most `limit` members at a time.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn mode(&self) -> GroupMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Runs all members on `runtime`.
    pub async fn run(&self, runtime: &MarketRuntime) -> FetchResult<GroupRecord<K, T>> {
        let tasks: Vec<_> = self.members.iter().map(|(_, factory)| factory()).collect();
        let keys = self.members.iter().map(|(key, _)| key.clone());

        match self.mode {
            GroupMode::FailFast => {
                let values = runtime.run_concurrent(tasks, self.limit).await?;
                Ok(keys.zip(values.into_iter().map(Some)).collect())
            }
            GroupMode::NullOnError => {
                let outcomes = runtime.run_concurrent_outcomes(tasks, self.limit).await;
                let record = keys
                    .zip(outcomes)
                    .map(|(key, outcome)| match outcome {
                        Outcome::Success(value) => (key, Some(value)),
                        Outcome::Failure(err) => {
                            tracing::debug!(?key, error = %err, "Group member failed");
                            (key, None)
                        }
                        Outcome::Interrupted => (key, None),
                    })
                    .collect();
                Ok(record)
            }
        }
    }

    /// Turns the group into a task factory running it on `runtime`.
    pub fn into_factory(self, runtime: Arc<MarketRuntime>) -> TaskFactory<GroupRecord<K, T>> {
        let group = Arc::new(self);
        Arc::new(move || {
            let group = Arc::clone(&group);
            let runtime = Arc::clone(&runtime);
            Box::pin(async move { group.run(&runtime).await })
                as BoxFuture<'static, FetchResult<GroupRecord<K, T>>>
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::error::FetchError;
    use crate::query::{QueryBinding, QueryOptions, task_factory};

    use super::*;

    fn value(value: u32, delay: Duration) -> TaskFactory<u32> {
        task_factory(move || async move {
            tokio::time::sleep(delay).await;
            Ok(value)
        })
    }

    fn failure() -> TaskFactory<u32> {
        task_factory(|| async {
            Err(FetchError::Http {
                status: 502,
                message: "Bad Gateway".into(),
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_null_on_error() {
        let runtime = MarketRuntime::for_tests();
        let group = QueryGroup::new(GroupMode::NullOnError)
            .member("btc", value(1, Duration::from_millis(200)))
            .member("eth", failure())
            .member("sol", value(3, Duration::from_millis(100)));

        let record = group.run(&runtime).await.unwrap();

        assert_eq!(
            record,
            BTreeMap::from([("btc", Some(1)), ("eth", None), ("sol", Some(3))])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fast() {
        let runtime = MarketRuntime::for_tests();
        let group = QueryGroup::new(GroupMode::FailFast)
            .member("btc", value(1, Duration::from_millis(200)))
            .member("sol", value(3, Duration::from_millis(100)));

        let record = group.clone().run(&runtime).await.unwrap();
        assert_eq!(record, BTreeMap::from([("btc", Some(1)), ("sol", Some(3))]));

        let result = group.member("eth", failure()).run(&runtime).await;
        assert!(matches!(result, Err(FetchError::Http { status: 502, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bound_group() {
        let runtime = Arc::new(MarketRuntime::for_tests());
        let group = QueryGroup::new(GroupMode::NullOnError)
            .member("btc", value(1, Duration::from_millis(10)))
            .member("eth", failure());

        let binding = QueryBinding::eager(
            Arc::clone(&runtime),
            group.into_factory(runtime),
            QueryOptions::default(),
        );
        let mut receiver = binding.subscribe();
        let state = receiver
            .wait_for(|state| state.is_success())
            .await
            .unwrap()
            .clone();

        assert_eq!(
            state.data,
            Some(BTreeMap::from([("btc", Some(1)), ("eth", None)]))
        );
    }
}
