use projectcache_service::source::StoreError;
use projectcache_service::source::paths::{self, Collection};

use crate::{seed_project, setup_service};

#[tokio::test]
async fn test_attach_subscribes_to_tracked_paths() {
    let (service, store, _clock) = setup_service(|_| ());

    let subscription = service.subscribe_to_project_updates("p1").await.unwrap();

    assert!(subscription.is_active());
    assert_eq!(subscription.project_id(), "p1");
    assert!(service.listener().is_attached("p1"));

    let mut expected = paths::tracked("p1");
    expected.sort();
    assert_eq!(store.subscribed_paths(), expected);
}

#[tokio::test]
async fn test_change_invalidates_cached_project() {
    let (service, store, _clock) = setup_service(|_| ());
    seed_project(&store, "p1");

    service.get_project_data("p1", false).await.unwrap();
    service.subscribe_to_project_updates("p1").await.unwrap();

    let tasks = paths::collection("p1", Collection::Tasks);
    assert_eq!(store.emit_change(&tasks), 1);

    // the entry is kept, but marked for reload
    let entry = service.cache().peek("p1").unwrap();
    assert!(entry.is_forced_stale());
    assert_eq!(store.project_loads("p1"), 1);

    service.get_project_data("p1", false).await.unwrap();
    assert_eq!(store.project_loads("p1"), 2);
    assert!(!service.cache().peek("p1").unwrap().is_forced_stale());
}

#[tokio::test]
async fn test_change_of_uncached_project() {
    let (service, store, _clock) = setup_service(|_| ());
    seed_project(&store, "p1");

    service.subscribe_to_project_updates("p1").await.unwrap();
    assert_eq!(store.emit_change(&paths::project("p1")), 1);

    assert!(service.cache().peek("p1").is_none());
    assert_eq!(store.project_loads("p1"), 0);
}

#[tokio::test]
async fn test_duplicate_attach_is_skipped() {
    let (service, store, _clock) = setup_service(|_| ());

    let first = service.subscribe_to_project_updates("p1").await.unwrap();
    let second = service.subscribe_to_project_updates("p1").await.unwrap();
    assert_eq!(store.active_subscriptions(), 5);

    // both handles refer to the same subscriptions
    second.detach().await;
    assert!(!first.is_active());
    assert_eq!(store.active_subscriptions(), 0);
}

#[tokio::test]
async fn test_detach_is_idempotent() {
    let (service, store, _clock) = setup_service(|_| ());
    seed_project(&store, "p1");
    service.get_project_data("p1", false).await.unwrap();

    let subscription = service.subscribe_to_project_updates("p1").await.unwrap();
    subscription.detach().await;
    subscription.detach().await;

    assert!(!subscription.is_active());
    assert!(!service.listener().is_attached("p1"));
    assert_eq!(store.active_subscriptions(), 0);
    assert_eq!(store.cancelled_subscriptions(), 5);

    // nothing is listening anymore
    assert_eq!(store.emit_change(&paths::project("p1")), 0);
    assert!(!service.cache().peek("p1").unwrap().is_forced_stale());
}

#[tokio::test]
async fn test_attach_after_detach() {
    let (service, store, _clock) = setup_service(|_| ());

    let first = service.subscribe_to_project_updates("p1").await.unwrap();
    first.detach().await;

    let second = service.subscribe_to_project_updates("p1").await.unwrap();
    assert!(second.is_active());
    assert!(!first.is_active());
    assert_eq!(store.active_subscriptions(), 5);

    // detaching the old handle again does not touch the new attachment
    first.detach().await;
    assert!(service.listener().is_attached("p1"));
    assert_eq!(store.active_subscriptions(), 5);
}

#[tokio::test]
async fn test_failed_attach_closes_opened_subscriptions() {
    let (service, store, _clock) = setup_service(|_| ());
    let error = StoreError::PermissionDenied("sprints".into());
    store.fail_subscriptions(&paths::collection("p1", Collection::Sprints), error.clone());

    let result = service.subscribe_to_project_updates("p1").await;

    assert_eq!(result.unwrap_err(), error);
    assert!(!service.listener().is_attached("p1"));
    assert_eq!(store.active_subscriptions(), 0);
    assert_eq!(store.cancelled_subscriptions(), 4);

    // a later attempt starts from scratch
    store.heal();
    service.subscribe_to_project_updates("p1").await.unwrap();
    assert_eq!(store.active_subscriptions(), 5);
}

#[tokio::test]
async fn test_detach_tolerates_cancel_errors() {
    let (service, store, _clock) = setup_service(|_| ());

    let subscription = service.subscribe_to_project_updates("p1").await.unwrap();
    store.fail_cancels(StoreError::Unavailable("gone".into()));
    subscription.detach().await;

    assert!(!subscription.is_active());
    assert!(!service.listener().is_attached("p1"));
    assert_eq!(store.active_subscriptions(), 0);
}

#[tokio::test]
async fn test_unsubscribe_all() {
    let (service, store, _clock) = setup_service(|_| ());

    let p1 = service.subscribe_to_project_updates("p1").await.unwrap();
    let p2 = service.subscribe_to_project_updates("p2").await.unwrap();
    assert_eq!(store.active_subscriptions(), 10);

    service.unsubscribe_all().await;

    assert!(!p1.is_active());
    assert!(!p2.is_active());
    assert!(!service.listener().is_attached("p1"));
    assert_eq!(store.active_subscriptions(), 0);
}
