//! Imperative write-path state machine against a [`QueryClient`] (spec §4.7).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::retry::{mutation_default_policy, RetryPolicy};
use crate::types::{MutationStatus, NetworkMode};

pub type BoxMutationFuture<T> = Pin<Box<dyn Future<Output = Result<T, QueryError>> + Send>>;
pub type MutationFn<V, T> = Arc<dyn Fn(V) -> BoxMutationFuture<T> + Send + Sync>;

/// Opaque identity serializing concurrent mutations that share it (spec
/// §4.7, §5 "Mutation scope serialization").
#[derive(Debug, Clone)]
pub struct MutationScope {
    pub id: String,
}

type CallbackFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
/// `onMutate(vars, client) -> onMutateResult`.
pub type OnMutate<V, OM> = Arc<dyn Fn(V, QueryClient) -> Pin<Box<dyn Future<Output = OM> + Send>> + Send + Sync>;
pub type OnSuccess<T, V, OM> = Arc<dyn Fn(Arc<T>, V, Option<OM>, QueryClient) -> CallbackFuture + Send + Sync>;
pub type OnError<V, OM> = Arc<dyn Fn(QueryError, V, Option<OM>, QueryClient) -> CallbackFuture + Send + Sync>;
pub type OnSettled<T, V, OM> =
    Arc<dyn Fn(Option<Arc<T>>, Option<QueryError>, V, Option<OM>, QueryClient) -> CallbackFuture + Send + Sync>;

/// Construction-time configuration (spec §4.7). `OM` is the caller-chosen
/// type returned by `onMutate` and forwarded to the later callbacks.
pub struct MutationOptions<V, T, OM = ()>
where
    V: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    OM: Clone + Send + Sync + 'static,
{
    pub mutation_fn: MutationFn<V, T>,
    pub network_mode: NetworkMode,
    pub retry: RetryPolicy,
    pub scope: Option<MutationScope>,
    pub on_mutate: Option<OnMutate<V, OM>>,
    pub on_success: Option<OnSuccess<T, V, OM>>,
    pub on_error: Option<OnError<V, OM>>,
    pub on_settled: Option<OnSettled<T, V, OM>>,
}

impl<V, T, OM> MutationOptions<V, T, OM>
where
    V: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    OM: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(mutation_fn: F) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        Self {
            mutation_fn: Arc::new(move |vars| Box::pin(mutation_fn(vars)) as BoxMutationFuture<T>),
            network_mode: NetworkMode::Online,
            retry: mutation_default_policy(),
            scope: None,
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    pub fn network_mode(mut self, mode: NetworkMode) -> Self {
        self.network_mode = mode;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn scope(mut self, id: impl Into<String>) -> Self {
        self.scope = Some(MutationScope { id: id.into() });
        self
    }

    pub fn on_mutate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(V, QueryClient) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = OM> + Send + 'static,
    {
        self.on_mutate = Some(Arc::new(move |vars, client| Box::pin(f(vars, client)) as Pin<Box<dyn Future<Output = OM> + Send>>));
        self
    }

    pub fn on_success<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<T>, V, Option<OM>, QueryClient) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_success = Some(Arc::new(move |data, vars, om, client| Box::pin(f(data, vars, om, client)) as CallbackFuture));
        self
    }

    pub fn on_error<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(QueryError, V, Option<OM>, QueryClient) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_error = Some(Arc::new(move |err, vars, om, client| Box::pin(f(err, vars, om, client)) as CallbackFuture));
        self
    }

    pub fn on_settled<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Option<Arc<T>>, Option<QueryError>, V, Option<OM>, QueryClient) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_settled =
            Some(Arc::new(move |data, err, vars, om, client| Box::pin(f(data, err, vars, om, client)) as CallbackFuture));
        self
    }
}

/// Per-call lifecycle callbacks: fire only for the call that supplied them,
/// and only if it's still the latest call by the time it settles (spec
/// §4.7 "per-call vs option-level callback rule").
pub struct MutateCallbacks<T, V, OM>
where
    T: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    OM: Clone + Send + Sync + 'static,
{
    pub on_success: Option<OnSuccess<T, V, OM>>,
    pub on_error: Option<OnError<V, OM>>,
    pub on_settled: Option<OnSettled<T, V, OM>>,
}

impl<T, V, OM> Default for MutateCallbacks<T, V, OM>
where
    T: Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    OM: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self { on_success: None, on_error: None, on_settled: None }
    }
}

/// Published, read-only mutation state (spec §3).
pub struct MutationState<T, V> {
    pub status: MutationStatus,
    pub data: Option<Arc<T>>,
    pub error: Option<Arc<QueryError>>,
    pub variables: Option<V>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    pub failure_reason: Option<Arc<QueryError>>,
    pub is_paused: bool,
}

impl<T, V: Clone> Clone for MutationState<T, V> {
    fn clone(&self) -> Self {
        Self {
            status: self.status,
            data: self.data.clone(),
            error: self.error.clone(),
            variables: self.variables.clone(),
            submitted_at: self.submitted_at,
            failure_count: self.failure_count,
            failure_reason: self.failure_reason.clone(),
            is_paused: self.is_paused,
        }
    }
}

impl<T, V> MutationState<T, V> {
    fn new() -> Self {
        Self {
            status: MutationStatus::Idle,
            data: None,
            error: None,
            variables: None,
            submitted_at: None,
            failure_count: 0,
            failure_reason: None,
            is_paused: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.status, MutationStatus::Idle)
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, MutationStatus::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, MutationStatus::Success)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, MutationStatus::Error)
    }
}

/// Drives one mutation's lifecycle. Calls may overlap; only the call that
/// is still latest by the time it settles runs its per-call callbacks
/// (spec §4.7).
pub struct MutationObserver<V, T, OM = ()>
where
    V: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    OM: Clone + Send + Sync + 'static,
{
    client: QueryClient,
    options: MutationOptions<V, T, OM>,
    state: parking_lot::RwLock<MutationState<T, V>>,
    latest_call_index: AtomicU64,
    change_tx: tokio::sync::watch::Sender<u64>,
}

impl<V, T, OM> MutationObserver<V, T, OM>
where
    V: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    OM: Clone + Send + Sync + 'static,
{
    pub fn new(client: QueryClient, options: MutationOptions<V, T, OM>) -> Self {
        let (change_tx, _rx) = tokio::sync::watch::channel(0);
        Self {
            client,
            options,
            state: parking_lot::RwLock::new(MutationState::new()),
            latest_call_index: AtomicU64::new(0),
            change_tx,
        }
    }

    pub fn state(&self) -> MutationState<T, V> {
        self.state.read().clone()
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<u64> {
        self.change_tx.subscribe()
    }

    fn notify(&self) {
        let _ = self.change_tx.send(self.latest_call_index.load(Ordering::SeqCst));
    }

    /// Restores `Idle` and clears every recorded field (spec §4.7 step 8).
    pub fn reset(&self) {
        *self.state.write() = MutationState::new();
        self.notify();
    }

    /// Fire-and-forget: errors never propagate to the caller (spec §4.7
    /// `mutate`). Requires `Self: 'static` since the call outlives this
    /// method via a detached task.
    pub fn mutate(self: &Arc<Self>, vars: V, callbacks: MutateCallbacks<T, V, OM>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _ = this.mutate_async(vars, callbacks).await;
        });
    }

    /// Awaitable: resolves with data or rejects with the mutation's error
    /// (spec §4.7 `mutateAsync`).
    #[instrument(skip(self, vars, callbacks))]
    pub async fn mutate_async(
        &self,
        vars: V,
        callbacks: MutateCallbacks<T, V, OM>,
    ) -> Result<Arc<T>, QueryError> {
        let call_index = self.latest_call_index.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut state = self.state.write();
            state.variables = Some(vars.clone());
            state.submitted_at = Some(Utc::now());
            state.status = MutationStatus::Pending;
            state.is_paused = false;
        }
        self.notify();

        if matches!(self.options.network_mode, NetworkMode::Online) && !self.client.online_manager().is_online() {
            let mut state = self.state.write();
            state.is_paused = true;
            drop(state);
            self.notify();
            return Err(QueryError::MutationPaused);
        }

        let on_mutate_result: Option<OM> = match &self.options.on_mutate {
            Some(f) => Some(f(vars.clone(), self.client.clone()).await),
            None => None,
        };

        let _scope_guard = match &self.options.scope {
            Some(scope) => Some(self.client.scope_lock(&scope.id).await.lock_owned().await),
            None => None,
        };

        let result = self.run_retry_loop(vars.clone()).await;
        drop(_scope_guard);

        let is_latest = self.latest_call_index.load(Ordering::SeqCst) == call_index;

        match result {
            Ok(value) => {
                {
                    let mut state = self.state.write();
                    state.status = MutationStatus::Success;
                    state.data = Some(Arc::clone(&value));
                    state.error = None;
                }
                self.notify();

                if let Some(f) = &self.options.on_success {
                    f(Arc::clone(&value), vars.clone(), on_mutate_result.clone(), self.client.clone()).await;
                }
                if is_latest {
                    if let Some(f) = &callbacks.on_success {
                        f(Arc::clone(&value), vars.clone(), on_mutate_result.clone(), self.client.clone()).await;
                    }
                }
                self.fire_settled(Some(Arc::clone(&value)), None, vars, on_mutate_result, is_latest, &callbacks).await;
                Ok(value)
            }
            Err(err) => {
                {
                    let mut state = self.state.write();
                    state.status = MutationStatus::Error;
                    state.error = Some(Arc::new(err.clone()));
                }
                self.notify();

                if let Some(f) = &self.options.on_error {
                    f(err.clone(), vars.clone(), on_mutate_result.clone(), self.client.clone()).await;
                }
                if is_latest {
                    if let Some(f) = &callbacks.on_error {
                        f(err.clone(), vars.clone(), on_mutate_result.clone(), self.client.clone()).await;
                    }
                }
                self.fire_settled(None, Some(err.clone()), vars, on_mutate_result, is_latest, &callbacks).await;
                Err(err)
            }
        }
    }

    async fn fire_settled(
        &self,
        data: Option<Arc<T>>,
        err: Option<QueryError>,
        vars: V,
        on_mutate_result: Option<OM>,
        is_latest: bool,
        callbacks: &MutateCallbacks<T, V, OM>,
    ) {
        if let Some(f) = &self.options.on_settled {
            f(data.clone(), err.clone(), vars.clone(), on_mutate_result.clone(), self.client.clone()).await;
        }
        if is_latest {
            if let Some(f) = &callbacks.on_settled {
                f(data, err, vars, on_mutate_result, self.client.clone()).await;
            }
        }
    }

    /// Identical in shape to the observer retry loop but defaults to zero
    /// retries (spec §4.7 step 5).
    async fn run_retry_loop(&self, vars: V) -> Result<Arc<T>, QueryError> {
        let mutation_fn = Arc::clone(&self.options.mutation_fn);
        let mut retries_done: u32 = 0;
        loop {
            match mutation_fn(vars.clone()).await {
                Ok(value) => return Ok(Arc::new(value)),
                Err(err) => {
                    {
                        let mut state = self.state.write();
                        state.failure_count += 1;
                        state.failure_reason = Some(Arc::new(err.clone()));
                    }
                    if !self.options.retry.should_retry(retries_done, &err) {
                        return Err(err);
                    }
                    let delay = self.options.retry.delay.call(retries_done);
                    retries_done += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
