//! Aggregates a dynamic set of [`QueryObserver`]s so a caller can subscribe
//! to many keys at once (spec §4.6).

use std::sync::Arc;

use tracing::instrument;

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::observer::{QueryObserver, QueryObserverOptions, QueryState};

/// Parallel fan-out over a set of [`QueryObserver`]s. Rebuilding the option
/// set disposes observers for keys that dropped out and wires up new ones
/// for keys that appeared, reusing observers whose key is unchanged.
pub struct QueriesObserver<T: Send + Sync + 'static> {
    client: QueryClient,
    observers: parking_lot::RwLock<Vec<Arc<QueryObserver<T>>>>,
}

impl<T: Send + Sync + 'static> QueriesObserver<T> {
    pub fn new(client: QueryClient) -> Self {
        Self { client, observers: parking_lot::RwLock::new(Vec::new()) }
    }

    /// Replaces the tracked set of queries. Observers for keys no longer
    /// present are disposed; the rest are rebuilt fresh (spec §4.6
    /// `setQueries`).
    #[instrument(skip(self, option_sets))]
    pub async fn set_queries(
        &self,
        option_sets: Vec<QueryObserverOptions<T>>,
    ) -> Result<(), QueryError> {
        let previous = std::mem::take(&mut *self.observers.write());
        for observer in previous {
            observer.dispose().await;
        }

        let mut next = Vec::with_capacity(option_sets.len());
        for options in option_sets {
            let observer = QueryObserver::new(self.client.clone(), options).await?;
            next.push(Arc::new(observer));
        }
        *self.observers.write() = next;
        Ok(())
    }

    pub fn queries(&self) -> Vec<QueryState<T>> {
        self.observers.read().iter().map(|o| o.state()).collect()
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// Runs `execute` on every tracked observer concurrently, collecting
    /// each result rather than short-circuiting on the first failure (spec
    /// §4.6 `executeAll`: every query settles independently).
    #[instrument(skip(self))]
    pub async fn execute_all(&self) -> Vec<Result<(), QueryError>> {
        let observers = self.observers.read().clone();
        let futures = observers.iter().map(|o| o.execute(false));
        futures::future::join_all(futures).await
    }

    pub async fn refetch_all(&self) -> Vec<Result<(), QueryError>> {
        let observers = self.observers.read().clone();
        let futures = observers.iter().map(|o| o.execute(true));
        futures::future::join_all(futures).await
    }

    /// Disposes every tracked observer, releasing their cache registrations.
    pub async fn dispose(&self) {
        let observers = std::mem::take(&mut *self.observers.write());
        for observer in observers {
            observer.dispose().await;
        }
    }
}
