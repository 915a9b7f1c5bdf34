//! Singleflight behaviour under concurrent callers.

use futures::future::join_all;
use provesid_cache::{CacheManager, CachePolicy, HitSource, Lookup};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, thiserror::Error)]
#[error("rate limited")]
struct RateLimited;

fn open(dir: &std::path::Path) -> Arc<CacheManager> {
    Arc::new(CacheManager::at(dir).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_share_one_computation() {
    let root = tempfile::tempdir().unwrap();
    let cache = open(root.path());
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks = (0..32).map(|_| {
        let cache = cache.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            cache
                .fetch("pubchem", "get_compound_by_cid", &(2244,), CachePolicy::ReadWrite, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, RateLimited>("C9H8O4".to_string())
                })
                .await
        })
    });
    let lookups: Vec<Lookup<String>> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(lookups.iter().all(|l| l.value == "C9H8O4"));
    let computed = lookups.iter().filter(|l| l.source == HitSource::Computed).count();
    assert_eq!(computed, 1);
    assert_eq!(cache.namespace("pubchem").unwrap().in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_run_in_parallel() {
    let root = tempfile::tempdir().unwrap();
    let cache = open(root.path());
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks = (0..8u32).map(|cid| {
        let cache = cache.clone();
        let running = running.clone();
        let peak = peak.clone();
        tokio::spawn(async move {
            cache
                .get_or_compute("pubchem", "cid", &(cid,), move || async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, RateLimited>(cid)
                })
                .await
        })
    });
    let values: Vec<u32> = join_all(tasks).await.into_iter().map(|r| r.unwrap().unwrap()).collect();
    assert_eq!(values, (0..8).collect::<Vec<_>>());
    assert!(peak.load(Ordering::SeqCst) > 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_waiter_sees_the_error_and_can_retry() {
    let root = tempfile::tempdir().unwrap();
    let cache = open(root.path());
    let calls = Arc::new(AtomicUsize::new(0));

    let tasks = (0..6).map(|_| {
        let cache = cache.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            cache
                .get_or_compute("classyfire", "classify", &("CCO",), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    Err::<String, _>(RateLimited)
                })
                .await
        })
    });
    for result in join_all(tasks).await {
        let err = result.unwrap().unwrap_err();
        assert!(err.compute_source::<RateLimited>().is_some());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let ok: String = cache
        .get_or_compute("classyfire", "classify", &("CCO",), || async {
            Ok::<_, RateLimited>("Organic compounds".to_string())
        })
        .await
        .unwrap();
    assert_eq!(ok, "Organic compounds");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_waiter_does_not_cancel_computation() {
    let root = tempfile::tempdir().unwrap();
    let cache = open(root.path());
    let release = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let first = {
        let cache = cache.clone();
        let release = release.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            cache
                .get_or_compute("opsin", "parse", &("benzene",), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok::<_, RateLimited>("c1ccccc1".to_string())
                })
                .await
        })
    };
    while calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let second = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .get_or_compute("opsin", "parse", &("benzene",), || async {
                    Ok::<_, RateLimited>("never".to_string())
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    first.abort();
    let _ = first.await;

    release.notify_one();
    let value = second.await.unwrap().unwrap();
    assert_eq!(value, "c1ccccc1");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
