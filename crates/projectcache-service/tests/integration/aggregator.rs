use std::time::Duration;

use serde_json::json;

use projectcache_service::aggregator::ProjectAggregator;
use projectcache_service::aggregator::fingerprint::Shape;
use projectcache_service::caching::{CacheError, Clock};
use projectcache_service::source::StoreError;
use projectcache_service::source::paths::{self, Collection};
use projectcache_service::types::ProjectSnapshot;

use crate::{InMemoryStore, ManualClock, seed_project, seed_user};

fn aggregator() -> (ProjectAggregator, std::sync::Arc<InMemoryStore>) {
    projectcache_test::setup();
    let store = InMemoryStore::new();
    let aggregator = ProjectAggregator::new(store.clone(), ManualClock::new());
    (aggregator, store)
}

async fn load(aggregator: &ProjectAggregator, project_id: &str) -> ProjectSnapshot {
    aggregator.load_project(project_id).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_load_complete_project() {
    let (aggregator, store) = aggregator();
    seed_project(&store, "p1");

    let snapshot = load(&aggregator, "p1").await;

    assert_eq!(snapshot.project.id, "p1");
    assert_eq!(snapshot.project.name, "Project p1");
    assert_eq!(snapshot.project.extra["visibility"], json!("private"));
    assert_eq!(snapshot.loaded_at, ManualClock::new().now());

    let members: Vec<_> = snapshot
        .members
        .iter()
        .map(|member| (member.id.as_str(), member.profile.display_name.as_str()))
        .collect();
    assert_eq!(members, [("m1", "Ada"), ("m2", "Grace")]);
    assert!(snapshot.members.iter().all(|member| member.enriched));
    assert_eq!(
        snapshot.members[0].profile.email.as_deref(),
        Some("ada@example.com")
    );

    assert_eq!(snapshot.active_sprint_id.as_deref(), Some("sp2"));

    let tasks: Vec<_> = snapshot.tasks.iter().map(|task| task.id.as_str()).collect();
    assert_eq!(tasks, ["t2", "t1", "t3"]);
}

#[tokio::test]
async fn test_backlog_is_flattened() {
    let (aggregator, store) = aggregator();
    seed_project(&store, "p1");

    let snapshot = load(&aggregator, "p1").await;

    let backlog: Vec<_> = snapshot
        .backlog
        .iter()
        .map(|item| (item.id.as_str(), item.parent_id.as_deref()))
        .collect();
    assert_eq!(
        backlog,
        [
            ("e1", None),
            ("s1", Some("e1")),
            ("s2", Some("e1")),
            ("b1", None),
        ]
    );
    assert_eq!(snapshot.backlog[1].parent_title.as_deref(), Some("Onboarding"));

    // only epics are asked for stories
    assert_eq!(store.reads(&paths::stories("p1", "e1")), 1);
    assert_eq!(store.reads(&paths::stories("p1", "b1")), 0);
}

#[tokio::test]
async fn test_fingerprint() {
    let (aggregator, store) = aggregator();
    seed_project(&store, "p1");

    let snapshot = load(&aggregator, "p1").await;
    let expected = Shape {
        members: 2,
        backlog: 4,
        sprints: 2,
        tasks: 3,
        active_sprint_id: Some("sp2"),
        updated_at: snapshot.project.updated_at_millis(),
    };
    assert_eq!(snapshot.fingerprint, expected.fingerprint());

    // unchanged data, unchanged fingerprint
    assert_eq!(load(&aggregator, "p1").await.fingerprint, snapshot.fingerprint);

    let tasks = paths::collection("p1", Collection::Tasks);
    store.push(&tasks, "t4", json!({"title": "Release"}));
    assert_ne!(load(&aggregator, "p1").await.fingerprint, snapshot.fingerprint);
}

#[tokio::test]
async fn test_missing_project() {
    let (aggregator, store) = aggregator();
    seed_project(&store, "p1");

    let result = aggregator.load_project("p404").await;
    assert_eq!(result, Ok(None));
}

#[tokio::test(start_paused = true)]
async fn test_reads_are_concurrent() {
    let (aggregator, store) = aggregator();
    seed_project(&store, "p1");
    store.set_latency(Duration::from_millis(100));

    let start = tokio::time::Instant::now();
    load(&aggregator, "p1").await;

    // one round trip for the project and its collections, one for profiles and stories
    assert!(start.elapsed() < Duration::from_millis(300));
}

/// One member profile failing to load degrades only that member.
#[tokio::test]
async fn test_member_enrichment_failure() {
    let (aggregator, store) = aggregator();
    seed_project(&store, "p2");
    let members = paths::collection("p2", Collection::Members);
    store.push(&members, "m7", json!({"userId": "u7"}));
    seed_user(&store, "u7", "Barbara");
    store.fail_reads(
        &paths::user_profile("u7"),
        StoreError::Unavailable("connection reset".into()),
    );

    let snapshot = load(&aggregator, "p2").await;
    assert_eq!(snapshot.members.len(), 3);

    for member in &snapshot.members {
        if member.user_id == "u7" {
            assert!(!member.enriched);
            assert_eq!(member.profile.display_name, "u7");
            assert_eq!(member.profile.email, None);
        } else {
            assert!(member.enriched);
            assert!(member.profile.email.is_some());
        }
    }
}

#[tokio::test]
async fn test_missing_profile_degrades() {
    let (aggregator, store) = aggregator();
    seed_project(&store, "p1");
    store.delete_document(&paths::user_profile("u2"));

    let snapshot = load(&aggregator, "p1").await;

    assert!(snapshot.members[0].enriched);
    assert!(!snapshot.members[1].enriched);
    assert_eq!(snapshot.members[1].profile.display_name, "u2");
}

#[tokio::test]
async fn test_member_without_user_id() {
    let (aggregator, store) = aggregator();
    seed_project(&store, "p1");
    let members = paths::collection("p1", Collection::Members);
    store.push(&members, "u3", json!({"role": "viewer"}));
    seed_user(&store, "u3", "Edsger");

    let snapshot = load(&aggregator, "p1").await;

    let member = &snapshot.members[2];
    assert_eq!(member.user_id, "u3");
    assert!(member.enriched);
    assert_eq!(member.profile.display_name, "Edsger");
}

#[tokio::test]
async fn test_stories_failure_degrades() {
    let (aggregator, store) = aggregator();
    seed_project(&store, "p1");
    store.fail_reads(
        &paths::stories("p1", "e1"),
        StoreError::PermissionDenied("stories".into()),
    );

    let snapshot = load(&aggregator, "p1").await;

    let backlog: Vec<_> = snapshot.backlog.iter().map(|item| item.id.as_str()).collect();
    assert_eq!(backlog, ["e1", "b1"]);
}

#[tokio::test]
async fn test_collection_failure_fails_load() {
    let (aggregator, store) = aggregator();
    seed_project(&store, "p1");
    let error = StoreError::Timeout(Duration::from_secs(5));
    store.fail_reads(&paths::collection("p1", Collection::Sprints), error.clone());

    let result = aggregator.load_project("p1").await;
    assert_eq!(result, Err(CacheError::Load(error)));
}

#[tokio::test]
async fn test_malformed_document() {
    let (aggregator, store) = aggregator();
    seed_project(&store, "p1");
    let tasks = paths::collection("p1", Collection::Tasks);
    store.push(&tasks, "t1", json!({"title": "Write docs", "order": "first"}));

    let err = aggregator.load_project("p1").await.unwrap_err();

    assert!(!err.is_retryable());
    match err {
        CacheError::Malformed { path, .. } => assert_eq!(path, "projects/p1/tasks/t1"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_malformed_project_record() {
    let (aggregator, store) = aggregator();
    seed_project(&store, "p1");
    store.set_document(&paths::project("p1"), json!({"name": 42}));

    let err = aggregator.load_project("p1").await.unwrap_err();

    match err {
        CacheError::Malformed { path, .. } => assert_eq!(path, "projects/p1"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_update_marker_formats() {
    let (aggregator, store) = aggregator();
    seed_project(&store, "p1");
    let base = load(&aggregator, "p1").await;
    assert_eq!(base.project.updated_at_millis(), Some(1_709_294_400_000));

    let markers = [
        (json!(1_700_000_000_000u64), Some(1_700_000_000_000)),
        (
            json!({"seconds": 1_700_000_000, "nanos": 500_000_000}),
            Some(1_700_000_000_500),
        ),
        (json!({"_seconds": 1_700_000_000, "_nanoseconds": 0}), Some(1_700_000_000_000)),
        (json!("last tuesday"), None),
        (json!(true), None),
    ];
    for (marker, millis) in markers {
        store.set_document(
            &paths::project("p1"),
            json!({"name": "Apollo", "updatedAt": marker}),
        );

        // an unknown marker format never fails the load
        let snapshot = load(&aggregator, "p1").await;
        assert_eq!(snapshot.project.updated_at.as_ref(), Some(&marker));
        assert_eq!(snapshot.project.updated_at_millis(), millis);

        let expected = Shape {
            members: 2,
            backlog: 4,
            sprints: 2,
            tasks: 3,
            active_sprint_id: Some("sp2"),
            updated_at: millis,
        };
        assert_eq!(snapshot.fingerprint, expected.fingerprint());
    }
}
