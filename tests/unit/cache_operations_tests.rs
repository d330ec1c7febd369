//! Client/cache-level round-trips and filter-driven lifecycle operations
//! (spec §8 S8, round-trip idempotence, invariant 3).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_query_cache::client::QueryClient;
use async_query_cache::filter::QueryFilters;
use async_query_cache::key;
use async_query_cache::observer::{QueryObserver, QueryObserverOptions};

#[tokio::test]
async fn set_get_remove_round_trip() {
    let client = QueryClient::new();
    client.set(&key!["todos"], vec![1, 2, 3]).await;
    assert_eq!(*client.get::<Vec<i32>>(&key!["todos"]).await.unwrap(), vec![1, 2, 3]);

    client.remove_queries(QueryFilters::new().exact(key!["todos"])).await;
    assert!(client.get::<Vec<i32>>(&key!["todos"]).await.is_none());
}

/// Invariant 3: equal-content keys share an entry, unequal keys do not.
#[tokio::test]
async fn equal_content_keys_share_an_entry_distinct_keys_do_not() {
    let client = QueryClient::new();
    client.set(&key!["todos", 1i64], "a").await;
    client.set(&key!["todos", 2i64], "b").await;

    assert_eq!(*client.get::<&str>(&key!["todos", 1i64]).await.unwrap(), "a");
    assert_eq!(*client.get::<&str>(&key!["todos", 2i64]).await.unwrap(), "b");
}

/// `invalidateQueries` followed by a fetch of a matching key bypasses the
/// freshness window, per the round-trip/idempotence rule in spec §8.
#[tokio::test]
async fn invalidate_then_fetch_bypasses_freshness_window() {
    let client = QueryClient::new();
    let key = key!["todos"];
    client.set(&key, 1i32).await;

    client.invalidate_queries(QueryFilters::new().exact(key.clone())).await;

    let calls = Arc::new(AtomicU32::new(0));
    let calls_for_fn = Arc::clone(&calls);
    let value = client
        .fetch(
            &key,
            Duration::from_secs(3600),
            tokio_util::sync::CancellationToken::new(),
            move || {
                let calls = Arc::clone(&calls_for_fn);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<i32, async_query_cache::error::QueryError>(2)
                }
            },
        )
        .await
        .unwrap();
    assert_eq!(*value, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// S8: invalidating `["todos"]` with a prefix filter marks `["todos"]` and
/// `["todos",1]` stale and triggers their next fetch; `["users"]` is
/// untouched and does not re-fetch.
#[tokio::test]
async fn filter_driven_invalidation_only_refetches_matching_keys() {
    let client = QueryClient::new();

    let todos_calls = Arc::new(AtomicU32::new(0));
    let todos_child_calls = Arc::new(AtomicU32::new(0));
    let users_calls = Arc::new(AtomicU32::new(0));

    let make = |key, counter: Arc<AtomicU32>| {
        let counter = Arc::clone(&counter);
        QueryObserverOptions::<i32>::new(key)
            .stale_window(Duration::from_secs(3600))
            .fetch_fn(move |_ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                }
            })
    };

    let todos = QueryObserver::new(client.clone(), make(key!["todos"], Arc::clone(&todos_calls))).await.unwrap();
    let todos_child =
        QueryObserver::new(client.clone(), make(key!["todos", 1i64], Arc::clone(&todos_child_calls))).await.unwrap();
    let users = QueryObserver::new(client.clone(), make(key!["users"], Arc::clone(&users_calls))).await.unwrap();

    todos.execute(false).await.unwrap();
    todos_child.execute(false).await.unwrap();
    users.execute(false).await.unwrap();
    assert_eq!(todos_calls.load(Ordering::SeqCst), 1);
    assert_eq!(todos_child_calls.load(Ordering::SeqCst), 1);
    assert_eq!(users_calls.load(Ordering::SeqCst), 1);

    client.invalidate_queries(QueryFilters::new().prefix(key!["todos"])).await;

    todos.execute(false).await.unwrap();
    todos_child.execute(false).await.unwrap();
    users.execute(false).await.unwrap();

    assert_eq!(todos_calls.load(Ordering::SeqCst), 2);
    assert_eq!(todos_child_calls.load(Ordering::SeqCst), 2);
    assert_eq!(users_calls.load(Ordering::SeqCst), 1, "users was never invalidated and stays fresh");
}
