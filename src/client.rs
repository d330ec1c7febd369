//! The query client: owns the cache, the ambient managers, per-type default
//! fetch functions, the global fetching counter, and the filter-driven
//! lifecycle operations (spec §4.3).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::cache::{Cache, ObserverRegistration};
use crate::error::QueryError;
use crate::filter::{QueryFilters, QuerySnapshot};
use crate::key::Key;
use crate::manager::{FocusManager, OnlineManager};
use crate::types::{FetchStatus, NetworkMode};

/// Client-wide defaults applied to observers that don't override them.
#[derive(Debug, Clone)]
pub struct QueryClientConfig {
    pub default_network_mode: NetworkMode,
    pub default_refetch_on_window_focus: bool,
    pub default_stale_window: Duration,
}

impl Default for QueryClientConfig {
    fn default() -> Self {
        Self {
            default_network_mode: NetworkMode::Online,
            default_refetch_on_window_focus: true,
            default_stale_window: Duration::ZERO,
        }
    }
}

/// Options accepted by `cancelQueries` (spec §6 `CancelOptions`).
#[derive(Debug, Clone, Copy)]
pub struct CancelOptions {
    pub silent: bool,
    pub revert: bool,
}

impl Default for CancelOptions {
    fn default() -> Self {
        Self { silent: false, revert: true }
    }
}

/// Fan-in events emitted by lifecycle operations (spec §6).
#[derive(Debug, Clone)]
pub enum ClientEvent {
    QueriesInvalidated(Vec<Key>),
    QueriesRefetched(Vec<Key>),
    QueriesCancelled(Vec<Key>),
}

type DefaultFetchFn = Arc<dyn Any + Send + Sync>;

/// Owns the cache and coordinates the cross-cutting concerns every observer
/// depends on. Cheap to clone: cloning shares the same underlying state.
#[derive(Clone)]
pub struct QueryClient {
    cache: Arc<Cache>,
    online: OnlineManager,
    focus: FocusManager,
    config: QueryClientConfig,
    default_fetch_fns: Arc<parking_lot::RwLock<HashMap<TypeId, DefaultFetchFn>>>,
    fetching_count: Arc<AtomicI64>,
    fetching_tx: Arc<tokio::sync::watch::Sender<i64>>,
    events: Arc<broadcast::Sender<ClientEvent>>,
    mutation_scopes: Arc<AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl QueryClient {
    pub fn new() -> Self {
        Self::with_config(QueryClientConfig::default())
    }

    pub fn with_config(config: QueryClientConfig) -> Self {
        let (fetching_tx, _rx) = tokio::sync::watch::channel(0);
        let (events_tx, _rx) = broadcast::channel(256);
        Self {
            cache: Arc::new(Cache::new()),
            online: OnlineManager::new(),
            focus: FocusManager::new(),
            config,
            default_fetch_fns: Arc::new(parking_lot::RwLock::new(HashMap::new())),
            fetching_count: Arc::new(AtomicI64::new(0)),
            fetching_tx: Arc::new(fetching_tx),
            events: Arc::new(events_tx),
            mutation_scopes: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &QueryClientConfig {
        &self.config
    }

    pub fn online_manager(&self) -> &OnlineManager {
        &self.online
    }

    pub fn focus_manager(&self) -> &FocusManager {
        &self.focus
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Current count of observers in the `Fetching` state.
    pub fn global_fetching_count(&self) -> i64 {
        self.fetching_count.load(Ordering::SeqCst)
    }

    pub fn subscribe_global_fetching_count(&self) -> tokio::sync::watch::Receiver<i64> {
        self.fetching_tx.subscribe()
    }

    /// Marks one observer as entering/leaving `Fetching`. Only fires a
    /// change event on the 0→1 and N→0 transitions (spec §4.3, §9).
    pub(crate) fn note_fetching_delta(&self, delta: i64) {
        let previous = self.fetching_count.fetch_add(delta, Ordering::SeqCst);
        let current = previous + delta;
        if (previous == 0 && current > 0) || (previous > 0 && current == 0) {
            let _ = self.fetching_tx.send(current);
        }
    }

    pub fn set_default_fetch_fn<T, F, Fut>(&self, fetch_fn: F)
    where
        T: Send + Sync + 'static,
        F: Fn(crate::observer::FetchContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        let boxed: Arc<dyn Fn(crate::observer::FetchContext) -> crate::observer::BoxFetchFuture<T> + Send + Sync> =
            Arc::new(move |ctx| Box::pin(fetch_fn(ctx)));
        self.default_fetch_fns.write().insert(TypeId::of::<T>(), Arc::new(boxed));
    }

    pub(crate) fn default_fetch_fn<T: Send + Sync + 'static>(
        &self,
    ) -> Option<Arc<dyn Fn(crate::observer::FetchContext) -> crate::observer::BoxFetchFuture<T> + Send + Sync>> {
        let registry = self.default_fetch_fns.read();
        let boxed = registry.get(&TypeId::of::<T>())?;
        boxed
            .clone()
            .downcast::<Arc<dyn Fn(crate::observer::FetchContext) -> crate::observer::BoxFetchFuture<T> + Send + Sync>>()
            .ok()
            .map(|arc| (*arc).clone())
    }

    pub async fn get<T: Send + Sync + 'static>(&self, key: &Key) -> Option<Arc<T>> {
        self.cache.get::<T>(key).await
    }

    pub async fn set<T: Send + Sync + 'static>(&self, key: &Key, value: T) {
        self.cache.set(key, value).await
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// Client-level fetch: dedup + freshness check, per spec §4.3.
    #[instrument(skip(self, fetch_fn), fields(key = %key))]
    pub async fn fetch<T, F, Fut>(
        &self,
        key: &Key,
        stale_window: Duration,
        token: CancellationToken,
        fetch_fn: F,
    ) -> Result<Arc<T>, QueryError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        tracing::debug!("fetch requested");
        let result = self.cache.fetch(key, stale_window, token, fetch_fn).await;
        match &result {
            Ok(_) => tracing::debug!("fetch resolved"),
            Err(err) if err.is_cancelled() => tracing::debug!("fetch cancelled"),
            Err(err) => tracing::warn!(error = %err, "fetch failed"),
        }
        result
    }

    pub(crate) async fn register_active_observer(&self, key: &Key, registration: ObserverRegistration) {
        self.cache.register_observer(key, registration).await;
    }

    pub(crate) async fn unregister_active_observer(&self, key: &Key, id: u64) {
        self.cache.unregister_observer(key, id).await;
    }

    async fn matching_keys(&self, filter: &QueryFilters) -> Vec<Key> {
        let mut matched = Vec::new();
        for key in self.cache.keys() {
            let snapshot = self
                .cache
                .with_entry(&key, |entry| {
                    let fetch_status = entry
                        .registrations()
                        .first()
                        .map(|r| (r.fetch_status)())
                        .unwrap_or(FetchStatus::Idle);
                    let is_stale = match entry.registrations().first() {
                        Some(r) => !entry.is_fresh(chrono::Utc::now(), r.stale_window),
                        None => true,
                    };
                    (entry.is_active(), is_stale, fetch_status)
                })
                .await;
            let (is_active, is_stale, fetch_status) = snapshot;
            if filter.matches(&QuerySnapshot { key: &key, is_active, is_stale, fetch_status }) {
                matched.push(key);
            }
        }
        matched
    }

    /// Marks every matching entry stale; for keys with an active, enabled
    /// observer, that observer is responsible for noticing the emitted
    /// event and triggering its own background refetch.
    #[instrument(skip(self, filter))]
    pub async fn invalidate_queries(&self, filter: QueryFilters) -> Vec<Key> {
        let keys = self.matching_keys(&filter).await;
        for key in &keys {
            self.cache.with_entry_mut(key, |entry| entry.invalidate()).await;
        }
        let _ = self.events.send(ClientEvent::QueriesInvalidated(keys.clone()));
        keys
    }

    pub async fn remove_queries(&self, filter: QueryFilters) -> Vec<Key> {
        let keys = self.matching_keys(&filter).await;
        for key in &keys {
            self.cache.remove(key);
        }
        keys
    }

    pub async fn reset_queries(&self, filter: QueryFilters) -> Vec<Key> {
        self.remove_queries(filter).await
    }

    #[instrument(skip(self, filter, options))]
    pub async fn cancel_queries(&self, filter: QueryFilters, options: CancelOptions) -> Vec<Key> {
        let keys = self.matching_keys(&filter).await;
        for key in &keys {
            self.cache.with_entry_mut(key, |entry| entry.cancel_in_flight(options.revert)).await;
        }
        if !options.silent {
            let _ = self.events.send(ClientEvent::QueriesCancelled(keys.clone()));
        }
        keys
    }

    pub async fn refetch_queries(&self, filter: QueryFilters) -> Vec<Key> {
        let keys = self.matching_keys(&filter).await;
        let _ = self.events.send(ClientEvent::QueriesRefetched(keys.clone()));
        keys
    }

    /// Acquires the FIFO lock for a mutation scope, creating it on first use
    /// (spec §4.7, §9 "mutation scope serialization").
    pub(crate) async fn scope_lock(&self, scope_id: &str) -> Arc<AsyncMutex<()>> {
        let mut scopes = self.mutation_scopes.lock().await;
        Arc::clone(scopes.entry(scope_id.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))))
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("global_fetching_count", &self.global_fetching_count())
            .finish()
    }
}
