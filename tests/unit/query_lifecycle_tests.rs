//! End-to-end observer lifecycle scenarios (spec §8 S1, S2, S4, S5).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_query_cache::client::QueryClient;
use async_query_cache::key;
use async_query_cache::observer::{QueryObserver, QueryObserverOptions};

/// S1: two observers on the same key racing `execute` dedupe to one
/// `fetchFn` invocation and both settle Success with the shared value.
#[tokio::test]
async fn two_concurrent_observers_dedupe_to_one_fetch() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));

    let make_options = || {
        let calls = Arc::clone(&calls);
        QueryObserverOptions::<Vec<String>>::new(key!["todos"]).fetch_fn(move |_ctx| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(vec!["A".to_string(), "B".to_string()])
            }
        })
    };

    let a = QueryObserver::new(client.clone(), make_options()).await.unwrap();
    let b = QueryObserver::new(client.clone(), make_options()).await.unwrap();

    let (ra, rb) = tokio::join!(a.execute(false), b.execute(false));
    ra.unwrap();
    rb.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(a.state().is_success());
    assert!(b.state().is_success());
    assert_eq!(a.state().data.as_deref(), Some(&vec!["A".to_string(), "B".to_string()]));
    assert_eq!(b.state().data.as_deref(), a.state().data.as_deref());
}

/// S2: two observers whose keys are anonymous records with differing
/// field order and a null-valued extra field land on the same cache entry.
#[tokio::test]
async fn anonymous_record_keys_with_different_field_order_share_an_entry() {
    use async_query_cache::key::{Key, KeyPart, RecordBuilder, Scalar};

    let key_a = Key::new(vec![
        KeyPart::from("todos"),
        RecordBuilder::new().field("status", "active").field("page", 2i64).build(),
    ]);
    let key_b = Key::new(vec![
        KeyPart::from("todos"),
        RecordBuilder::new()
            .field("page", 2i64)
            .field("status", "active")
            .field("other", KeyPart::Scalar(Scalar::Null))
            .build(),
    ]);
    assert_eq!(key_a, key_b);

    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let calls_for_fn = Arc::clone(&calls);

    let options_a = QueryObserverOptions::<i32>::new(key_a)
        .fetch_fn(move |_ctx| {
            let calls = Arc::clone(&calls_for_fn);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            }
        });
    let observer_a = QueryObserver::new(client.clone(), options_a).await.unwrap();
    observer_a.execute(false).await.unwrap();

    let value_via_b = client.get::<i32>(&key_b).await.unwrap();
    assert_eq!(*value_via_b, 7);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// S4: first attempt fails, the client goes offline before the retry delay
/// elapses, the observer pauses, and resumes with exactly one further call
/// once back online.
#[tokio::test(start_paused = true)]
async fn offline_pause_mid_retry_then_resumes_once_online() {
    use async_query_cache::retry::RetryPolicy;

    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let calls_for_fn = Arc::clone(&calls);

    let options = QueryObserverOptions::<String>::new(key!["todos"])
        .retry(RetryPolicy::new(5u32, Duration::from_secs(30)))
        .fetch_fn(move |_ctx| {
            let calls = Arc::clone(&calls_for_fn);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(async_query_cache::error::QueryError::failed_msg("boom"))
                } else {
                    Ok("ok".to_string())
                }
            }
        });
    let observer = QueryObserver::new(client.clone(), options).await.unwrap();

    let fut = observer.execute(false);
    tokio::pin!(fut);

    // First attempt runs and fails immediately.
    assert!(futures::poll!(&mut fut).is_pending());
    // Go offline before the retry delay (1s) elapses.
    client.online_manager().set_online(false);
    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(futures::poll!(&mut fut).is_pending());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    client.online_manager().set_online(true);
    fut.await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let state = observer.state();
    assert!(state.is_success());
    assert_eq!(state.failure_count, 1);
}

/// S5: a background refetch of stale data keeps the prior value visible
/// (`isFetchingBackground`) until the new value lands.
#[tokio::test]
async fn background_refetch_keeps_prior_data_visible_until_settled() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let calls_for_fn = Arc::clone(&calls);
    let release_second_fetch = Arc::new(tokio::sync::Notify::new());
    let release_for_fn = Arc::clone(&release_second_fetch);

    let options = QueryObserverOptions::<String>::new(key!["todos"])
        .stale_window(Duration::from_millis(100))
        .fetch_fn(move |_ctx| {
            let calls = Arc::clone(&calls_for_fn);
            let release = Arc::clone(&release_for_fn);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n > 0 {
                    release.notified().await;
                }
                Ok(if n == 0 { "v1".to_string() } else { "v2".to_string() })
            }
        });
    let observer = Arc::new(QueryObserver::new(client, options).await.unwrap());

    observer.execute(false).await.unwrap();
    assert_eq!(observer.state().data.as_deref(), Some(&"v1".to_string()));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let observer_for_refetch = Arc::clone(&observer);
    let handle = tokio::spawn(async move { observer_for_refetch.execute(false).await });

    // Give the second fetch a chance to start and block on the notify.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(observer.state().is_fetching_background());
    assert_eq!(observer.state().data.as_deref(), Some(&"v1".to_string()));

    release_second_fetch.notify_one();
    handle.await.unwrap().unwrap();

    assert_eq!(observer.state().data.as_deref(), Some(&"v2".to_string()));
    assert!(!observer.state().is_fetching_background());
}

/// Invariant 6: the global fetching counter returns to 0 once every
/// observer's execute has settled.
#[tokio::test]
async fn global_fetching_counter_returns_to_zero_after_settling() {
    let client = QueryClient::new();
    let a = QueryObserver::new(
        client.clone(),
        QueryObserverOptions::<i32>::new(key!["a"]).fetch_fn(|_ctx| async { Ok(1) }),
    )
    .await
    .unwrap();
    let b = QueryObserver::new(
        client.clone(),
        QueryObserverOptions::<i32>::new(key!["b"]).fetch_fn(|_ctx| async { Ok(2) }),
    )
    .await
    .unwrap();

    let (ra, rb) = tokio::join!(a.execute(false), b.execute(false));
    ra.unwrap();
    rb.unwrap();

    assert_eq!(client.global_fetching_count(), 0);
}

/// Invariant 8: invalidating a key with an active, enabled observer causes
/// that observer's next execute to bypass the freshness window.
#[tokio::test]
async fn invalidating_an_active_key_forces_the_next_execute_to_refetch() {
    use async_query_cache::filter::QueryFilters;

    let client = QueryClient::new();
    let calls = Arc::new(AtomicU32::new(0));
    let calls_for_fn = Arc::clone(&calls);

    let options = QueryObserverOptions::<i32>::new(key!["todos"])
        .stale_window(Duration::from_secs(3600))
        .fetch_fn(move |_ctx| {
            let calls = Arc::clone(&calls_for_fn);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            }
        });
    let observer = QueryObserver::new(client.clone(), options).await.unwrap();
    observer.execute(false).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Still fresh: a plain execute should not refetch.
    observer.execute(false).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    client.invalidate_queries(QueryFilters::new().exact(key!["todos"])).await;
    observer.execute(false).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}
