//! A client-side asynchronous data-synchronization cache.
//!
//! This crate coordinates the fetching, caching, background revalidation,
//! retry, cancellation, and mutation of remote resources keyed by
//! structured identifiers, independent of any UI framework.
//!
//! The pieces, leaves first:
//!
//! - [`key`] — structured, deeply-equal query keys.
//! - [`manager`] — [`manager::OnlineManager`] / [`manager::FocusManager`],
//!   the ambient connectivity and focus signals.
//! - [`retry`] — the shared retry/backoff policy.
//! - [`cache`] — the keyed store with in-flight fetch deduplication.
//! - [`client`] — [`client::QueryClient`], owning the cache and the
//!   filter-driven lifecycle operations (invalidate/cancel/remove/reset).
//! - [`observer`] — [`observer::QueryObserver`], the per-key state machine.
//! - [`infinite`] — [`infinite::InfiniteQueryObserver`], cursor-paginated
//!   fetching built on the same client.
//! - [`queries_observer`] — [`queries_observer::QueriesObserver`], a
//!   dynamic set of [`observer::QueryObserver`]s driven together.
//! - [`mutation`] — [`mutation::MutationObserver`], the imperative
//!   write-path state machine.
//!
//! ```no_run
//! use async_query_cache::client::QueryClient;
//! use async_query_cache::observer::{QueryObserver, QueryObserverOptions};
//! use async_query_cache::key;
//!
//! # async fn example() -> Result<(), async_query_cache::error::QueryError> {
//! let client = QueryClient::new();
//! let options = QueryObserverOptions::<String>::new(key!["todos", 1])
//!     .fetch_fn(|_ctx| async { Ok("hello".to_string()) });
//! let observer = QueryObserver::new(client, options).await?;
//! observer.execute(false).await?;
//! assert!(observer.state().is_success());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod error;
pub mod filter;
pub mod infinite;
pub mod key;
pub mod manager;
pub mod mutation;
pub mod observer;
pub mod queries_observer;
pub mod retry;
pub mod types;

pub use client::QueryClient;
pub use error::QueryError;
pub use key::{Key, KeyPart};
pub use observer::{QueryObserver, QueryObserverOptions, QueryState};
