//! Mutation scope serialization and fire-and-forget `mutate` (spec §4.7, §9
//! "mutation scope serialization").

use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_query_cache::client::QueryClient;
use async_query_cache::mutation::{MutateCallbacks, MutationObserver, MutationOptions};

/// Two mutations sharing a scope never overlap: the second's mutationFn
/// only starts after the first's has fully returned.
#[tokio::test]
async fn mutations_sharing_a_scope_run_one_at_a_time() {
    let client = QueryClient::new();
    let order: Arc<parking_lot::Mutex<Vec<&'static str>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let order_for_fn = Arc::clone(&order);
    let options = MutationOptions::<i32, i32, ()>::new(move |vars| {
        let order = Arc::clone(&order_for_fn);
        async move {
            order.lock().push("start");
            tokio::time::sleep(Duration::from_millis(30)).await;
            order.lock().push("end");
            Ok(vars)
        }
    })
    .scope("account-balance");

    let observer = Arc::new(MutationObserver::new(client, options));
    let a = Arc::clone(&observer);
    let b = Arc::clone(&observer);

    let (ra, rb) = tokio::join!(
        a.mutate_async(1, MutateCallbacks::default()),
        b.mutate_async(2, MutateCallbacks::default()),
    );
    ra.unwrap();
    rb.unwrap();

    assert_eq!(*order.lock(), vec!["start", "end", "start", "end"]);
}

/// Mutations with no shared scope may run concurrently.
#[tokio::test]
async fn unscoped_mutations_run_concurrently() {
    let client = QueryClient::new();
    let order: Arc<parking_lot::Mutex<Vec<&'static str>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let order_for_fn = Arc::clone(&order);
    let options = MutationOptions::<i32, i32, ()>::new(move |vars| {
        let order = Arc::clone(&order_for_fn);
        async move {
            order.lock().push("start");
            tokio::time::sleep(Duration::from_millis(30)).await;
            order.lock().push("end");
            Ok(vars)
        }
    });

    let observer = Arc::new(MutationObserver::new(client, options));
    let a = Arc::clone(&observer);
    let b = Arc::clone(&observer);

    tokio::join!(a.mutate_async(1, MutateCallbacks::default()), b.mutate_async(2, MutateCallbacks::default()))
        .0
        .unwrap();

    assert_eq!(*order.lock(), vec!["start", "start", "end", "end"]);
}

/// Fire-and-forget `mutate` never propagates its error to the caller, but
/// the failure is still visible via state and fires `on_error`.
#[tokio::test]
async fn fire_and_forget_mutate_swallows_errors_but_updates_state() {
    let client = QueryClient::new();
    let error_fired = Arc::new(AtomicU32::new(0));
    let error_fired_for_cb = Arc::clone(&error_fired);

    let options = MutationOptions::<i32, i32, ()>::new(|_vars| async move {
        Err(async_query_cache::error::QueryError::failed_msg("rejected"))
    });
    let observer = Arc::new(MutationObserver::new(client, options));

    let callbacks = MutateCallbacks {
        on_success: None,
        on_error: Some(Arc::new(move |_err, _vars, _om, _client| {
            let fired = Arc::clone(&error_fired_for_cb);
            Box::pin(async move {
                fired.fetch_add(1, Ordering::SeqCst);
            }) as Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        })),
        on_settled: None,
    };

    observer.mutate(1, callbacks);
    // Give the detached task a chance to run to completion.
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(error_fired.load(Ordering::SeqCst), 1);
    assert!(observer.state().is_error());
}
