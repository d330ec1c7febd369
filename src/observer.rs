//! The query observer state machine: the component that actually drives
//! fetches of one key against a [`QueryClient`] (spec §4.4).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::key::Key;
use crate::retry::RetryPolicy;
use crate::types::{FetchStatus, NetworkMode, QueryStatus};

pub type BoxFetchFuture<T> = Pin<Box<dyn Future<Output = Result<T, QueryError>> + Send>>;

/// What a fetch function receives: the key it was invoked for, a
/// cancellation signal, and the opaque `meta` bag from observer options.
#[derive(Clone)]
pub struct FetchContext {
    pub key: Key,
    pub cancellation: CancellationToken,
    pub meta: serde_json::Value,
}

pub type FetchFn<T> = Arc<dyn Fn(FetchContext) -> BoxFetchFuture<T> + Send + Sync>;

/// A seed value committed to the cache at construction (spec §4.4).
pub enum InitialData<T> {
    Value(Arc<T>, Option<DateTime<Utc>>),
    Fn(Arc<dyn Fn() -> Option<Arc<T>> + Send + Sync>),
}

/// A transient display value shown before real data arrives. Never cached.
/// The `Fn` variant receives the data and `meta` that a caller carries over
/// from whatever this observer replaces (spec §4.4 `placeholderFn(prevData,
/// prevMeta)`), supplied via [`QueryObserverOptions::previous_data`].
pub enum PlaceholderData<T> {
    Value(Arc<T>),
    Fn(Arc<dyn Fn(Option<Arc<T>>, serde_json::Value) -> Option<Arc<T>> + Send + Sync>),
}

/// Construction-time configuration (spec §4.4 table).
pub struct QueryObserverOptions<T: Send + Sync + 'static> {
    pub key: Key,
    pub fetch_fn: Option<FetchFn<T>>,
    pub enabled: bool,
    pub stale_window: Duration,
    pub network_mode: NetworkMode,
    pub refetch_on_reconnect: bool,
    pub refetch_on_window_focus: bool,
    pub refetch_interval: Option<Duration>,
    pub retry: RetryPolicy,
    pub meta: serde_json::Value,
    pub initial_data: Option<InitialData<T>>,
    pub placeholder_data: Option<PlaceholderData<T>>,
    pub previous_data: Option<(Arc<T>, serde_json::Value)>,
}

impl<T: Send + Sync + 'static> QueryObserverOptions<T> {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            fetch_fn: None,
            enabled: true,
            stale_window: Duration::ZERO,
            network_mode: NetworkMode::Online,
            refetch_on_reconnect: true,
            refetch_on_window_focus: true,
            refetch_interval: None,
            retry: RetryPolicy::default(),
            meta: serde_json::Value::Null,
            initial_data: None,
            placeholder_data: None,
            previous_data: None,
        }
    }

    pub fn fetch_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(FetchContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        self.fetch_fn = Some(Arc::new(move |ctx| Box::pin(f(ctx)) as BoxFetchFuture<T>));
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn stale_window(mut self, window: Duration) -> Self {
        self.stale_window = window;
        self
    }

    pub fn network_mode(mut self, mode: NetworkMode) -> Self {
        self.network_mode = mode;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn initial_data(mut self, value: T, updated_at: Option<DateTime<Utc>>) -> Self {
        self.initial_data = Some(InitialData::Value(Arc::new(value), updated_at));
        self
    }

    pub fn placeholder_data(mut self, value: T) -> Self {
        self.placeholder_data = Some(PlaceholderData::Value(Arc::new(value)));
        self
    }

    pub fn placeholder_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<Arc<T>>, serde_json::Value) -> Option<Arc<T>> + Send + Sync + 'static,
    {
        self.placeholder_data = Some(PlaceholderData::Fn(Arc::new(f)));
        self
    }

    /// Carries the data and `meta` previously displayed for whatever this
    /// observer is replacing (e.g. a key change on the same call site) into
    /// a [`PlaceholderData::Fn`] so it can compute a placeholder from real
    /// prior state instead of always seeing `None`.
    pub fn previous_data(mut self, value: Arc<T>, meta: serde_json::Value) -> Self {
        self.previous_data = Some((value, meta));
        self
    }
}

/// Published, read-only observer state (spec §3, §6).
pub struct QueryState<T> {
    pub data: Option<Arc<T>>,
    pub error: Option<Arc<QueryError>>,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub failure_count: u32,
    pub failure_reason: Option<Arc<QueryError>>,
    pub is_placeholder_data: bool,
    pub data_updated_at: Option<DateTime<Utc>>,
    pub error_updated_at: Option<DateTime<Utc>>,
}

impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            error: self.error.clone(),
            status: self.status,
            fetch_status: self.fetch_status,
            failure_count: self.failure_count,
            failure_reason: self.failure_reason.clone(),
            is_placeholder_data: self.is_placeholder_data,
            data_updated_at: self.data_updated_at,
            error_updated_at: self.error_updated_at,
        }
    }
}

impl<T> QueryState<T> {
    fn new() -> Self {
        Self {
            data: None,
            error: None,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            failure_count: 0,
            failure_reason: None,
            is_placeholder_data: false,
            data_updated_at: None,
            error_updated_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, QueryStatus::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, QueryStatus::Success)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, QueryStatus::Error)
    }

    pub fn is_fetching(&self) -> bool {
        matches!(self.fetch_status, FetchStatus::Fetching)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.fetch_status, FetchStatus::Paused)
    }

    /// `isLoading ⇔ isPending ∧ (isFetching ∨ isPaused)` (spec §8 invariant 4).
    pub fn is_loading(&self) -> bool {
        self.is_pending() && (self.is_fetching() || self.is_paused())
    }

    pub fn is_fetching_background(&self) -> bool {
        self.is_fetching() && self.data.is_some()
    }

    /// A failure that left previously-fetched data intact (spec §4.4, §7).
    pub fn is_refetch_error(&self) -> bool {
        self.is_error() && self.data.is_some()
    }

    fn recompute_status(&mut self) {
        self.status = if self.error.is_some() {
            QueryStatus::Error
        } else if self.data.is_none() {
            QueryStatus::Pending
        } else {
            QueryStatus::Success
        };
    }
}

fn next_observer_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Drives fetches of one key against a [`QueryClient`] and exposes the
/// resulting stale-while-revalidate state.
pub struct QueryObserver<T: Send + Sync + 'static> {
    id: u64,
    client: QueryClient,
    options: parking_lot::RwLock<QueryObserverOptions<T>>,
    state: Arc<parking_lot::RwLock<QueryState<T>>>,
    change_tx: tokio::sync::watch::Sender<u64>,
    cancellation: parking_lot::Mutex<CancellationToken>,
}

impl<T: Send + Sync + 'static> QueryObserver<T> {
    pub async fn new(client: QueryClient, options: QueryObserverOptions<T>) -> Result<Self, QueryError> {
        if options.fetch_fn.is_none() && client.default_fetch_fn::<T>().is_none() {
            return Err(QueryError::NoFetchFn);
        }

        let id = next_observer_id();
        let mut state = QueryState::new();

        match &options.initial_data {
            Some(InitialData::Value(value, updated_at)) => {
                let updated_at = updated_at.unwrap_or_else(Utc::now);
                client.cache().with_entry_mut(&options.key, |entry| {
                    entry.set_data(Arc::clone(value) as Arc<crate::cache::AnyValue>, updated_at);
                }).await;
                state.data = Some(Arc::clone(value));
                state.data_updated_at = Some(updated_at);
            }
            Some(InitialData::Fn(f)) => {
                if let Some(value) = f() {
                    let updated_at = Utc::now();
                    client.cache().with_entry_mut(&options.key, |entry| {
                        entry.set_data(Arc::clone(&value) as Arc<crate::cache::AnyValue>, updated_at);
                    }).await;
                    state.data = Some(value);
                    state.data_updated_at = Some(updated_at);
                }
            }
            None => {
                if let Some(placeholder) = &options.placeholder_data {
                    let value = match placeholder {
                        PlaceholderData::Value(v) => Some(Arc::clone(v)),
                        PlaceholderData::Fn(f) => {
                            let (prev_data, prev_meta) = match &options.previous_data {
                                Some((data, meta)) => (Some(Arc::clone(data)), meta.clone()),
                                None => (None, serde_json::Value::Null),
                            };
                            f(prev_data, prev_meta)
                        }
                    };
                    if let Some(value) = value {
                        state.data = Some(value);
                        state.is_placeholder_data = true;
                    }
                }
            }
        }
        state.recompute_status();

        let (change_tx, _rx) = tokio::sync::watch::channel(0);
        let observer = Self {
            id,
            client: client.clone(),
            options: parking_lot::RwLock::new(options),
            state: Arc::new(parking_lot::RwLock::new(state)),
            change_tx,
            cancellation: parking_lot::Mutex::new(CancellationToken::new()),
        };

        let fetch_status_state = Arc::clone(&observer.state);
        client
            .register_active_observer(
                &observer.options.read().key,
                crate::cache::ObserverRegistration {
                    id: observer.id,
                    fetch_status: Arc::new(move || fetch_status_state.read().fetch_status),
                    stale_window: observer.options.read().stale_window,
                },
            )
            .await;

        Ok(observer)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> QueryState<T> {
        self.state.read().clone()
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<u64> {
        self.change_tx.subscribe()
    }

    fn notify(&self) {
        let _ = self.change_tx.send(self.id);
    }

    pub async fn dispose(&self) {
        let key = self.options.read().key.clone();
        self.client.unregister_active_observer(&key, self.id).await;
    }

    /// Runs the execute protocol (spec §4.4). `force` bypasses the
    /// freshness check (used by explicit refetches and invalidation).
    #[instrument(skip(self), fields(observer_id = self.id))]
    pub async fn execute(&self, force: bool) -> Result<(), QueryError> {
        let (key, enabled, stale_window, network_mode, retry, fetch_fn, meta) = {
            let options = self.options.read();
            (
                options.key.clone(),
                options.enabled,
                options.stale_window,
                options.network_mode,
                options.retry.clone(),
                options.fetch_fn.clone(),
                options.meta.clone(),
            )
        };

        if !enabled {
            let mut state = self.state.write();
            if state.fetch_status != FetchStatus::Idle {
                state.fetch_status = FetchStatus::Idle;
                drop(state);
                self.notify();
            }
            return Ok(());
        }

        let fetch_fn = match fetch_fn.or_else(|| self.client.default_fetch_fn::<T>()) {
            Some(f) => f,
            None => return Err(QueryError::NoFetchFn),
        };

        let is_fresh = self
            .client
            .cache()
            .with_entry(&key, |entry| entry.is_fresh(Utc::now(), stale_window))
            .await;
        if is_fresh && !force {
            self.publish_from_cache(&key).await;
            return Ok(());
        }

        let online = self.client.online_manager().clone();
        let has_data = self.state.read().data.is_some();
        match network_mode {
            NetworkMode::Online if !online.is_online() => {
                if has_data {
                    self.publish_from_cache(&key).await;
                }
                self.set_fetch_status(FetchStatus::Paused);
                return Ok(());
            }
            NetworkMode::OfflineFirst if !online.is_online() && has_data => {
                self.publish_from_cache(&key).await;
                self.set_fetch_status(FetchStatus::Paused);
                return Ok(());
            }
            NetworkMode::OfflineFirst if !online.is_online() && !has_data => {
                self.set_fetch_status(FetchStatus::Paused);
                return Ok(());
            }
            _ => {}
        }

        let token = {
            let mut guard = self.cancellation.lock();
            *guard = CancellationToken::new();
            guard.clone()
        };

        self.client.note_fetching_delta(1);
        self.set_fetch_status(FetchStatus::Fetching);

        let state_for_callback = Arc::clone(&self.state);
        let online_for_callback = online.clone();
        let fetch_fn_for_loop = Arc::clone(&fetch_fn);
        let key_for_loop = key.clone();
        let token_for_loop = token.clone();
        let token_for_store = token.clone();

        let result = self
            .client
            .fetch(
                &key,
                stale_window,
                token_for_store,
                move || async move {
                    run_retry_loop(
                        retry,
                        fetch_fn_for_loop,
                        key_for_loop,
                        meta,
                        token_for_loop,
                        online_for_callback,
                        state_for_callback,
                    )
                    .await
                },
            )
            .await;

        self.client.note_fetching_delta(-1);

        match result {
            Ok(value) => {
                let mut state = self.state.write();
                state.data = Some(value);
                state.error = None;
                state.data_updated_at = Some(Utc::now());
                state.is_placeholder_data = false;
                state.fetch_status = FetchStatus::Idle;
                state.recompute_status();
                drop(state);
                self.notify();
                Ok(())
            }
            Err(err) if err.is_cancelled() => {
                let revert = self.client.cache().with_entry(&key, |e| e.cancel_revert()).await;
                if revert {
                    self.set_fetch_status(FetchStatus::Idle);
                    Ok(())
                } else {
                    let mut state = self.state.write();
                    state.error = Some(Arc::new(err.clone()));
                    state.error_updated_at = Some(Utc::now());
                    state.fetch_status = FetchStatus::Idle;
                    state.recompute_status();
                    drop(state);
                    self.notify();
                    Err(err)
                }
            }
            Err(err) => {
                let mut state = self.state.write();
                state.error = Some(Arc::new(err.clone()));
                state.error_updated_at = Some(Utc::now());
                state.fetch_status = FetchStatus::Idle;
                state.recompute_status();
                drop(state);
                self.notify();
                Err(err)
            }
        }
    }

    async fn publish_from_cache(&self, key: &Key) {
        if let Some(data) = self.client.get::<T>(key).await {
            let fetch_time = self.client.cache().with_entry(key, |e| e.fetch_time()).await;
            let mut state = self.state.write();
            state.data = Some(data);
            state.error = None;
            state.data_updated_at = fetch_time;
            state.is_placeholder_data = false;
            state.recompute_status();
            drop(state);
            self.notify();
        }
    }

    fn set_fetch_status(&self, status: FetchStatus) {
        let mut state = self.state.write();
        if state.fetch_status != status {
            state.fetch_status = status;
            drop(state);
            self.notify();
        }
    }

    /// Cancels the observer's own cancellation token (used when the
    /// observer itself, rather than `client.cancel_queries`, wants to
    /// abandon an in-flight execute).
    pub fn cancel(&self) {
        self.cancellation.lock().cancel();
    }

    /// Called by the host on a focus-regained transition (spec §4.4).
    pub async fn on_focus_regained(&self) -> Result<(), QueryError> {
        let (enabled, refetch_on_focus, stale_window) = {
            let options = self.options.read();
            (options.enabled, options.refetch_on_window_focus, options.stale_window)
        };
        let is_fetching = self.state.read().is_fetching();
        let is_stale = !self
            .client
            .cache()
            .with_entry(&self.options.read().key.clone(), |e| e.is_fresh(Utc::now(), stale_window))
            .await;
        if enabled && refetch_on_focus && !is_fetching && is_stale {
            self.execute(true).await
        } else {
            Ok(())
        }
    }

    /// Called by the host on a reconnect transition (spec §4.4).
    pub async fn on_reconnect(&self) -> Result<(), QueryError> {
        let (enabled, refetch_on_reconnect) = {
            let options = self.options.read();
            (options.enabled, options.refetch_on_reconnect)
        };
        if enabled && refetch_on_reconnect {
            self.execute(true).await
        } else {
            Ok(())
        }
    }

    /// Spawns the periodic refetch loop for `refetchInterval` (spec §4.4:
    /// "while the observer is live, schedule a refetch every interval; skip
    /// if a fetch is already in progress"). A no-op if no interval was
    /// configured. The task runs until the observer itself is dropped.
    pub fn spawn_refetch_interval(self: &Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let interval = self.options.read().refetch_interval?;
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if this.state.read().is_fetching() {
                    continue;
                }
                let _ = this.execute(true).await;
            }
        }))
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_retry_loop<T: Send + Sync + 'static>(
    retry: RetryPolicy,
    fetch_fn: FetchFn<T>,
    key: Key,
    meta: serde_json::Value,
    token: CancellationToken,
    online: crate::manager::OnlineManager,
    state: Arc<parking_lot::RwLock<QueryState<T>>>,
) -> Result<T, QueryError> {
    let mut retries_done: u32 = 0;
    loop {
        if !online.is_online() {
            {
                let mut s = state.write();
                s.fetch_status = FetchStatus::Paused;
            }
            if !online.wait_until_online_cancellable(&token).await {
                return Err(QueryError::Cancelled);
            }
            let mut s = state.write();
            s.fetch_status = FetchStatus::Fetching;
        }

        let ctx = FetchContext { key: key.clone(), cancellation: token.clone(), meta: meta.clone() };
        let attempt = fetch_fn(ctx);

        let result = tokio::select! {
            result = attempt => result,
            _ = token.cancelled() => Err(QueryError::Cancelled),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                {
                    let mut s = state.write();
                    s.failure_count += 1;
                    s.failure_reason = Some(Arc::new(err.clone()));
                }
                if !retry.should_retry(retries_done, &err) {
                    return Err(err);
                }
                let delay = retry.delay.call(retries_done);
                retries_done += 1;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return Err(QueryError::Cancelled),
                }
            }
        }
    }
}
