//! Cursor-based paginated observer composed of per-page fetches against a
//! [`QueryClient`] (spec §4.5).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::client::QueryClient;
use crate::error::QueryError;
use crate::key::{Key, KeyPart};
use crate::observer::{BoxFetchFuture, FetchContext};
use crate::retry::RetryPolicy;
use crate::types::{FetchStatus, NetworkMode, QueryStatus};

pub type PageFetchFn<T, P> = Arc<dyn Fn(FetchContext, P) -> BoxFetchFuture<T> + Send + Sync>;
pub type NextPageParamFn<T, P> = Arc<dyn Fn(&T, &[Arc<T>], &P) -> Option<P> + Send + Sync>;

/// Configuration for an [`InfiniteQueryObserver`] (spec §4.5 adds these
/// fields on top of the plain observer table in §4.4).
pub struct InfiniteQueryOptions<T, P> {
    pub key: Key,
    pub fetch_fn: PageFetchFn<T, P>,
    pub initial_page_param: P,
    pub get_next_page_param: NextPageParamFn<T, P>,
    pub get_previous_page_param: Option<NextPageParamFn<T, P>>,
    pub max_pages: Option<usize>,
    pub enabled: bool,
    pub stale_window: Duration,
    pub network_mode: NetworkMode,
    pub retry: RetryPolicy,
}

impl<T, P> InfiniteQueryOptions<T, P> {
    pub fn new(
        key: Key,
        initial_page_param: P,
        fetch_fn: PageFetchFn<T, P>,
        get_next_page_param: NextPageParamFn<T, P>,
    ) -> Self {
        Self {
            key,
            fetch_fn,
            initial_page_param,
            get_next_page_param,
            get_previous_page_param: None,
            max_pages: None,
            enabled: true,
            stale_window: Duration::ZERO,
            network_mode: NetworkMode::Online,
            retry: RetryPolicy::default(),
        }
    }

    pub fn max_pages(mut self, n: usize) -> Self {
        self.max_pages = Some(n);
        self
    }

    pub fn get_previous_page_param(mut self, f: NextPageParamFn<T, P>) -> Self {
        self.get_previous_page_param = Some(f);
        self
    }
}

/// `{ pages: T[], pageParams: P[] }` with `|pages| = |pageParams|` (spec §3).
pub struct InfiniteData<T, P> {
    pub pages: Vec<Arc<T>>,
    pub page_params: Vec<P>,
}

impl<T, P> InfiniteData<T, P> {
    fn new() -> Self {
        Self { pages: Vec::new(), page_params: Vec::new() }
    }
}

/// Drives sequenced, page-keyed fetches for one infinite query.
pub struct InfiniteQueryObserver<T: Send + Sync + 'static, P: Clone + Send + Sync + 'static> {
    client: QueryClient,
    options: InfiniteQueryOptions<T, P>,
    data: parking_lot::RwLock<InfiniteData<T, P>>,
    status: parking_lot::RwLock<QueryStatus>,
    fetch_status: parking_lot::RwLock<FetchStatus>,
    is_fetching_next_page: std::sync::atomic::AtomicBool,
    is_fetching_previous_page: std::sync::atomic::AtomicBool,
    change_tx: tokio::sync::watch::Sender<()>,
}

fn page_key(base: &Key, param_index: usize) -> Key {
    let mut parts = base.parts().to_vec();
    parts.push(KeyPart::from(param_index as i64));
    Key::new(parts)
}

impl<T: Send + Sync + 'static, P: Clone + Send + Sync + 'static> InfiniteQueryObserver<T, P> {
    pub fn new(client: QueryClient, options: InfiniteQueryOptions<T, P>) -> Self {
        let (change_tx, _rx) = tokio::sync::watch::channel(());
        Self {
            client,
            options,
            data: parking_lot::RwLock::new(InfiniteData::new()),
            status: parking_lot::RwLock::new(QueryStatus::Pending),
            fetch_status: parking_lot::RwLock::new(FetchStatus::Idle),
            is_fetching_next_page: std::sync::atomic::AtomicBool::new(false),
            is_fetching_previous_page: std::sync::atomic::AtomicBool::new(false),
            change_tx,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<()> {
        self.change_tx.subscribe()
    }

    fn notify(&self) {
        let _ = self.change_tx.send(());
    }

    pub fn pages(&self) -> Vec<Arc<T>> {
        self.data.read().pages.clone()
    }

    pub fn page_params(&self) -> Vec<P> {
        self.data.read().page_params.clone()
    }

    pub fn status(&self) -> QueryStatus {
        *self.status.read()
    }

    pub fn fetch_status(&self) -> FetchStatus {
        *self.fetch_status.read()
    }

    pub fn is_fetching_next_page(&self) -> bool {
        self.is_fetching_next_page.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn is_fetching_previous_page(&self) -> bool {
        self.is_fetching_previous_page.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn has_next_page(&self) -> bool {
        let data = self.data.read();
        match (data.pages.last(), data.page_params.last()) {
            (Some(last_page), Some(last_param)) => {
                (self.options.get_next_page_param)(last_page, &data.pages, last_param).is_some()
            }
            _ => false,
        }
    }

    pub fn has_previous_page(&self) -> bool {
        let data = self.data.read();
        match (&self.options.get_previous_page_param, data.pages.first(), data.page_params.first()) {
            (Some(get_prev), Some(first_page), Some(first_param)) => {
                get_prev(first_page, &data.pages, first_param).is_some()
            }
            _ => false,
        }
    }

    async fn fetch_one(&self, param: P, token: CancellationToken) -> Result<Arc<T>, QueryError> {
        let key = page_key(&self.options.key, self.data.read().page_params.len());
        let key_for_call = key.clone();
        let fetch_fn = Arc::clone(&self.options.fetch_fn);
        let param_for_loop = param.clone();
        let ctx_token = token.clone();
        self.client
            .fetch(&key_for_call, self.options.stale_window, token, move || {
                let ctx = FetchContext { key, cancellation: ctx_token, meta: serde_json::Value::Null };
                fetch_fn(ctx, param_for_loop)
            })
            .await
    }

    /// Fetches the initial page, or (on an explicit refetch) re-fetches
    /// every currently-held page param in order (spec §4.5).
    #[instrument(skip(self))]
    pub async fn execute(&self) -> Result<(), QueryError> {
        if !self.options.enabled {
            *self.fetch_status.write() = FetchStatus::Idle;
            return Ok(());
        }

        let existing_params = self.data.read().page_params.clone();
        let params = if existing_params.is_empty() { vec![self.options.initial_page_param.clone()] } else { existing_params };

        *self.fetch_status.write() = FetchStatus::Fetching;
        self.notify();

        let mut pages = Vec::with_capacity(params.len());
        for param in &params {
            match self.fetch_one(param.clone(), CancellationToken::new()).await {
                Ok(page) => pages.push(page),
                Err(err) => {
                    *self.fetch_status.write() = FetchStatus::Idle;
                    *self.status.write() = QueryStatus::Error;
                    self.notify();
                    return Err(err);
                }
            }
        }

        let mut data = self.data.write();
        data.pages = pages;
        data.page_params = params;
        drop(data);
        *self.status.write() = QueryStatus::Success;
        *self.fetch_status.write() = FetchStatus::Idle;
        self.notify();
        Ok(())
    }

    /// Appends the next page, enforcing `maxPages` via oldest-first
    /// eviction (spec §4.5). `cancel_refetch` (default `true` in spirit of
    /// the spec's own default) makes a call a no-op while one is already in
    /// flight; passing `false` lets the new fetch run concurrently instead.
    #[instrument(skip(self))]
    pub async fn fetch_next_page(&self, cancel_refetch: bool) -> Result<(), QueryError> {
        if cancel_refetch && self.is_fetching_next_page.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }
        self.is_fetching_next_page.store(true, std::sync::atomic::Ordering::SeqCst);
        let result = self.fetch_next_page_inner().await;
        self.is_fetching_next_page.store(false, std::sync::atomic::Ordering::SeqCst);
        result
    }

    async fn fetch_next_page_inner(&self) -> Result<(), QueryError> {
        let next_param = {
            let data = self.data.read();
            match (data.pages.last(), data.page_params.last()) {
                (Some(last_page), Some(last_param)) => {
                    (self.options.get_next_page_param)(last_page, &data.pages, last_param)
                }
                _ => Some(self.options.initial_page_param.clone()),
            }
        };
        let Some(next_param) = next_param else { return Ok(()) };

        *self.fetch_status.write() = FetchStatus::Fetching;
        self.notify();
        let page = self.fetch_one(next_param.clone(), CancellationToken::new()).await;
        *self.fetch_status.write() = FetchStatus::Idle;

        match page {
            Ok(page) => {
                let mut data = self.data.write();
                data.pages.push(page);
                data.page_params.push(next_param);
                if let Some(max) = self.options.max_pages {
                    while data.pages.len() > max {
                        data.pages.remove(0);
                        data.page_params.remove(0);
                    }
                }
                drop(data);
                *self.status.write() = QueryStatus::Success;
                self.notify();
                Ok(())
            }
            Err(err) => {
                *self.status.write() = QueryStatus::Error;
                self.notify();
                Err(err)
            }
        }
    }

    /// Symmetric with [`InfiniteQueryObserver::fetch_next_page`], prepending
    /// via `getPreviousPageParam`.
    #[instrument(skip(self))]
    pub async fn fetch_previous_page(&self, cancel_refetch: bool) -> Result<(), QueryError> {
        if cancel_refetch && self.is_fetching_previous_page.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }
        self.is_fetching_previous_page.store(true, std::sync::atomic::Ordering::SeqCst);
        let result = self.fetch_previous_page_inner().await;
        self.is_fetching_previous_page.store(false, std::sync::atomic::Ordering::SeqCst);
        result
    }

    async fn fetch_previous_page_inner(&self) -> Result<(), QueryError> {
        let Some(get_prev) = &self.options.get_previous_page_param else { return Ok(()) };
        let prev_param = {
            let data = self.data.read();
            match (data.pages.first(), data.page_params.first()) {
                (Some(first_page), Some(first_param)) => get_prev(first_page, &data.pages, first_param),
                _ => None,
            }
        };
        let Some(prev_param) = prev_param else { return Ok(()) };

        *self.fetch_status.write() = FetchStatus::Fetching;
        self.notify();
        let page = self.fetch_one(prev_param.clone(), CancellationToken::new()).await;
        *self.fetch_status.write() = FetchStatus::Idle;

        match page {
            Ok(page) => {
                let mut data = self.data.write();
                data.pages.insert(0, page);
                data.page_params.insert(0, prev_param);
                if let Some(max) = self.options.max_pages {
                    while data.pages.len() > max {
                        data.pages.pop();
                        data.page_params.pop();
                    }
                }
                drop(data);
                *self.status.write() = QueryStatus::Success;
                self.notify();
                Ok(())
            }
            Err(err) => {
                *self.status.write() = QueryStatus::Error;
                self.notify();
                Err(err)
            }
        }
    }
}
