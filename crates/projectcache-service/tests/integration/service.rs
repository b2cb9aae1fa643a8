use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use projectcache_service::caching::CacheError;
use projectcache_service::source::StoreError;
use projectcache_service::source::paths::{self, Collection};

use crate::{seed_project, setup_service};

const MINUTE: Duration = Duration::from_secs(60);

/// Lets spawned background refreshes run to completion.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test(start_paused = true)]
async fn test_freshness_scenario() {
    let (service, store, clock) = setup_service(|_| ());
    seed_project(&store, "p1");

    let first = service.get_project_data("p1", false).await.unwrap().unwrap();
    assert_eq!(store.project_loads("p1"), 1);

    // fresh
    clock.advance(3 * MINUTE);
    let snapshot = service.get_project_data("p1", false).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &snapshot));
    settle().await;
    assert_eq!(store.project_loads("p1"), 1);

    // stale, served while refreshing
    clock.advance(4 * MINUTE);
    let snapshot = service.get_project_data("p1", false).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &snapshot));
    settle().await;
    assert_eq!(store.project_loads("p1"), 2);

    let refreshed = service.get_project_data("p1", false).await.unwrap().unwrap();
    assert!(!Arc::ptr_eq(&first, &refreshed));
    assert!(refreshed.loaded_at > first.loaded_at);

    // expired, reloaded before returning
    clock.advance(12 * MINUTE);
    let reloaded = service.get_project_data("p1", false).await.unwrap().unwrap();
    assert_eq!(store.project_loads("p1"), 3);
    assert!(reloaded.loaded_at > refreshed.loaded_at);
}

#[tokio::test]
async fn test_custom_thresholds() {
    let (service, store, clock) = setup_service(|config| {
        config.cache.fresh_for = Duration::from_secs(10);
        config.cache.stale_after = Duration::from_secs(20);
    });
    seed_project(&store, "p1");

    service.get_project_data("p1", false).await.unwrap();
    clock.advance(Duration::from_secs(30));
    service.get_project_data("p1", false).await.unwrap();

    assert_eq!(store.project_loads("p1"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_reads_are_coalesced() {
    let (service, store, _clock) = setup_service(|_| ());
    seed_project(&store, "p1");
    store.set_latency(Duration::from_millis(50));

    let requests = (0..20).map(|_| service.get_project_data("p1", false));
    let responses = join_all(requests).await;

    assert_eq!(store.project_loads("p1"), 1);
    assert_eq!(store.reads(&paths::user_profile("u1")), 1);

    let first = responses[0].clone().unwrap().unwrap();
    for response in responses {
        assert!(Arc::ptr_eq(&first, &response.unwrap().unwrap()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_reads_of_different_projects() {
    let (service, store, _clock) = setup_service(|_| ());
    seed_project(&store, "p1");
    seed_project(&store, "p2");
    store.set_latency(Duration::from_millis(100));

    let start = tokio::time::Instant::now();
    let (p1, p2) = futures::join!(
        service.get_project_data("p1", false),
        service.get_project_data("p2", false),
    );

    assert_eq!(p1.unwrap().unwrap().project.id, "p1");
    assert_eq!(p2.unwrap().unwrap().project.id, "p2");
    assert!(start.elapsed() < Duration::from_millis(300));
}

#[tokio::test]
async fn test_force_refresh() {
    let (service, store, _clock) = setup_service(|_| ());
    seed_project(&store, "p1");

    service.get_project_data("p1", false).await.unwrap();
    let tasks = paths::collection("p1", Collection::Tasks);
    store.remove(&tasks, "t3");

    let cached = service.get_project_data("p1", false).await.unwrap().unwrap();
    assert_eq!(cached.tasks.len(), 3);

    let refreshed = service.get_project_data("p1", true).await.unwrap().unwrap();
    assert_eq!(refreshed.tasks.len(), 2);
    assert_eq!(store.project_loads("p1"), 2);
}

#[tokio::test]
async fn test_missing_project_is_not_cached() {
    let (service, store, _clock) = setup_service(|_| ());

    assert_eq!(service.get_project_data("p404", false).await, Ok(None));
    assert_eq!(service.get_project_data("p404", false).await, Ok(None));

    assert_eq!(store.project_loads("p404"), 2);
    assert_eq!(service.cache_stats().size, 0);
}

#[tokio::test]
async fn test_deleted_project_is_evicted() {
    let (service, store, _clock) = setup_service(|_| ());
    seed_project(&store, "p1");
    service.get_project_data("p1", false).await.unwrap();

    store.delete_document(&paths::project("p1"));
    service.cache().invalidate("p1");

    assert_eq!(service.get_project_data("p1", false).await, Ok(None));
    assert_eq!(service.cache_stats().size, 0);
}

#[tokio::test]
async fn test_failed_reload_keeps_cached_data() {
    let (service, store, clock) = setup_service(|_| ());
    seed_project(&store, "p1");
    let first = service.get_project_data("p1", false).await.unwrap().unwrap();

    clock.advance(15 * MINUTE);
    let error = StoreError::Unavailable("connection refused".into());
    store.fail_reads(&paths::project("p1"), error.clone());

    let err = service.get_project_data("p1", false).await.unwrap_err();
    assert_eq!(err, CacheError::Load(error));
    assert!(err.is_retryable());

    let entry = service.cache().peek("p1").unwrap();
    assert!(Arc::ptr_eq(&entry.snapshot, &first));

    store.heal();
    service.get_project_data("p1", false).await.unwrap();
    assert_eq!(store.project_loads("p1"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_background_refresh_is_absorbed() {
    let (service, store, clock) = setup_service(|_| ());
    seed_project(&store, "p1");
    let first = service.get_project_data("p1", false).await.unwrap().unwrap();

    clock.advance(7 * MINUTE);
    store.fail_reads(
        &paths::collection("p1", Collection::Members),
        StoreError::Timeout(Duration::from_secs(1)),
    );

    let snapshot = service.get_project_data("p1", false).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &snapshot));
    settle().await;

    let entry = service.cache().peek("p1").unwrap();
    assert!(Arc::ptr_eq(&entry.snapshot, &first));
}

#[tokio::test]
async fn test_clear_cache() {
    let (service, store, _clock) = setup_service(|_| ());
    for project_id in ["p1", "p2", "p3"] {
        seed_project(&store, project_id);
        service.get_project_data(project_id, false).await.unwrap();
    }
    service.subscribe_to_project_updates("p1").await.unwrap();

    service.clear_cache(Some("p2"));
    assert_eq!(service.cache_stats().projects, ["p1", "p3"]);

    service.clear_cache(None);
    assert_eq!(service.cache_stats().size, 0);

    // subscriptions survive clearing the cache
    assert!(service.listener().is_attached("p1"));

    service.get_project_data("p1", false).await.unwrap();
    service.get_project_data("p2", false).await.unwrap();
    assert_eq!(store.project_loads("p1"), 2);
    assert_eq!(store.project_loads("p2"), 2);
}

#[tokio::test]
async fn test_cache_stats() {
    let (service, store, _clock) = setup_service(|_| ());
    seed_project(&store, "p2");
    seed_project(&store, "p1");
    service.get_project_data("p2", false).await.unwrap();
    service.get_project_data("p1", false).await.unwrap();

    let stats = service.cache_stats();
    assert!(stats.memory_usage > 0);
    assert_eq!(stats, service.cache_stats());

    insta::assert_yaml_snapshot!(stats, {".memoryUsage" => "[bytes]"}, @r#"
    size: 2
    projects:
      - p1
      - p2
    memoryUsage: "[bytes]"
    "#);
}
