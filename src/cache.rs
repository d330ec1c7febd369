//! The keyed cache store: per-key entries holding data/error/timestamps
//! with in-flight request deduplication (spec §3, §4.3).

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;
use crate::key::Key;
use crate::types::FetchStatus;

pub type AnyValue = dyn Any + Send + Sync;

type InFlightResult = Result<Arc<AnyValue>, QueryError>;
type InFlightFuture = Shared<BoxFuture<'static, InFlightResult>>;

/// What an active observer exposes to the cache for the filter algebra and
/// for staleness checks when no explicit freshness window is given.
pub struct ObserverRegistration {
    pub id: u64,
    pub fetch_status: Arc<dyn Fn() -> FetchStatus + Send + Sync>,
    pub stale_window: Duration,
}

/// The cache record for one key: data, error, timestamp, in-flight handle,
/// and the observers currently registered against it.
pub struct CacheEntry {
    data: Option<Arc<AnyValue>>,
    error: Option<Arc<QueryError>>,
    fetch_time: Option<DateTime<Utc>>,
    in_flight: Option<InFlightFuture>,
    in_flight_token: Option<CancellationToken>,
    /// Whether the most recent cancellation of this entry's in-flight fetch
    /// should revert quietly (spec §4.3 `CancelOptions.revert`). Reset to
    /// `true` whenever a new fetch starts; only `cancel_in_flight(false)`
    /// ever clears it.
    cancel_revert: bool,
    registrations: Vec<ObserverRegistration>,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            data: None,
            error: None,
            fetch_time: None,
            in_flight: None,
            in_flight_token: None,
            cancel_revert: true,
            registrations: Vec::new(),
        }
    }

    /// Signals cancellation on the in-flight fetch, if any (spec §4.3
    /// `cancelQueries`). A no-op if nothing is in flight. `revert` carries
    /// `CancelOptions.revert`: when `false`, the cancellation is meant to
    /// surface to observers as `Error(Cancelled)` rather than be silently
    /// absorbed.
    pub fn cancel_in_flight(&mut self, revert: bool) {
        self.cancel_revert = revert;
        if let Some(token) = &self.in_flight_token {
            token.cancel();
        }
    }

    /// Whether the entry's most recent cancellation (if any) should be
    /// reverted quietly rather than surfaced as an error.
    pub fn cancel_revert(&self) -> bool {
        self.cancel_revert
    }

    pub fn data(&self) -> Option<Arc<AnyValue>> {
        self.data.clone()
    }

    pub fn error(&self) -> Option<Arc<QueryError>> {
        self.error.clone()
    }

    pub fn fetch_time(&self) -> Option<DateTime<Utc>> {
        self.fetch_time
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn is_active(&self) -> bool {
        !self.registrations.is_empty()
    }

    pub fn registrations(&self) -> &[ObserverRegistration] {
        &self.registrations
    }

    /// Fresh iff data exists, there's no error, and the entry is within its
    /// freshness window (spec §4.3, §4.4 step 2).
    pub fn is_fresh(&self, now: DateTime<Utc>, stale_window: Duration) -> bool {
        match (&self.data, &self.error, self.fetch_time) {
            (Some(_), None, Some(fetched_at)) => {
                let age = now - fetched_at;
                age.to_std().map(|age| age <= stale_window).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// Marks the entry stale by resetting its timestamp to the epoch —
    /// spec §4.3's "reset fetchTime to a sentinel past".
    pub fn invalidate(&mut self) {
        self.fetch_time = Some(DateTime::<Utc>::UNIX_EPOCH);
    }

    pub fn set_data(&mut self, data: Arc<AnyValue>, fetched_at: DateTime<Utc>) {
        self.data = Some(data);
        self.error = None;
        self.fetch_time = Some(fetched_at);
    }

    /// A failed refetch sets `error` but never clears existing `data`
    /// (spec §3 invariant: "data is never cleared by a failed refetch").
    pub fn set_error(&mut self, error: QueryError) {
        self.error = Some(Arc::new(error));
    }

    fn register(&mut self, registration: ObserverRegistration) {
        self.registrations.push(registration);
    }

    fn unregister(&mut self, id: u64) {
        self.registrations.retain(|r| r.id != id);
    }
}

/// The concurrent map from [`Key`] to [`CacheEntry`].
///
/// The outer map is guarded by a plain sync lock (brief critical sections,
/// never held across an await); each entry is guarded by an async mutex so
/// fetch bookkeeping can safely await inside the critical section up to the
/// point where the in-flight future is cloned out and awaited lock-free.
pub struct Cache {
    entries: parking_lot::RwLock<HashMap<Key, Arc<tokio::sync::Mutex<CacheEntry>>>>,
}

impl Cache {
    pub fn new() -> Self {
        Self { entries: parking_lot::RwLock::new(HashMap::new()) }
    }

    fn entry_handle(&self, key: &Key) -> Arc<tokio::sync::Mutex<CacheEntry>> {
        if let Some(entry) = self.entries.read().get(key) {
            return Arc::clone(entry);
        }
        Arc::clone(
            self.entries
                .write()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(CacheEntry::new()))),
        )
    }

    pub fn keys(&self) -> Vec<Key> {
        self.entries.read().keys().cloned().collect()
    }

    pub async fn get<T: Send + Sync + 'static>(&self, key: &Key) -> Option<Arc<T>> {
        let handle = self.entry_handle(key);
        let data = handle.lock().await.data()?;
        data.downcast::<T>().ok()
    }

    pub async fn set<T: Send + Sync + 'static>(&self, key: &Key, value: T) {
        let handle = self.entry_handle(key);
        handle.lock().await.set_data(Arc::new(value), Utc::now());
    }

    pub async fn with_entry<R>(&self, key: &Key, f: impl FnOnce(&CacheEntry) -> R) -> R {
        let handle = self.entry_handle(key);
        let guard = handle.lock().await;
        f(&guard)
    }

    pub async fn with_entry_mut<R>(&self, key: &Key, f: impl FnOnce(&mut CacheEntry) -> R) -> R {
        let handle = self.entry_handle(key);
        let mut guard = handle.lock().await;
        f(&mut guard)
    }

    pub fn remove(&self, key: &Key) {
        self.entries.write().remove(key);
    }

    pub async fn register_observer(&self, key: &Key, registration: ObserverRegistration) {
        self.with_entry_mut(key, |entry| entry.register(registration)).await;
    }

    pub async fn unregister_observer(&self, key: &Key, id: u64) {
        self.with_entry_mut(key, |entry| entry.unregister(id)).await;
    }

    /// Fetch, deduplicating concurrent callers on the same key behind a
    /// shared future (spec §3, §9 "in-flight deduplication").
    ///
    /// If the entry already holds fresh data, returns it without invoking
    /// `fetch_fn`. If a fetch is already in flight, awaits that shared
    /// future instead of starting a second one.
    ///
    /// `token` is stored as the entry's in-flight cancellation handle while
    /// this call is the one that actually starts the fetch; callers that
    /// join an already-running fetch observe (and are bound by) whichever
    /// token the first caller supplied.
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
        let handle = self.entry_handle(key);
        let shared = {
            let mut guard = handle.lock().await;
            if guard.is_fresh(Utc::now(), stale_window) {
                let data = guard.data().expect("fresh entries always hold data");
                return data.downcast::<T>().map_err(|_| QueryError::failed_msg("cached value type mismatch"));
            }
            if let Some(shared) = guard.in_flight.clone() {
                shared
            } else {
                let handle_for_write = Arc::clone(&handle);
                let fut: BoxFuture<'static, InFlightResult> = Box::pin(async move {
                    let result = fetch_fn().await;
                    let mut guard = handle_for_write.lock().await;
                    guard.in_flight = None;
                    guard.in_flight_token = None;
                    match result {
                        Ok(value) => {
                            let value: Arc<AnyValue> = Arc::new(value);
                            guard.set_data(Arc::clone(&value), Utc::now());
                            Ok(value)
                        }
                        Err(err) => {
                            guard.set_error(err.clone());
                            Err(err)
                        }
                    }
                });
                let shared = fut.shared();
                guard.in_flight = Some(shared.clone());
                guard.in_flight_token = Some(token);
                guard.cancel_revert = true;
                shared
            }
        };

        let result = shared.await;
        result.and_then(|value| value.downcast::<T>().map_err(|_| QueryError::failed_msg("cached value type mismatch")))
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}
