//! Helpers for testing the project cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Use [`InMemoryStore`] as the backing store. It counts reads per path, can delay and fail
//!    reads, and lets tests fire change events through [`InMemoryStore::emit_change`].
//!
//!  - Use [`ManualClock`] to move time forward instead of sleeping. It starts at
//!    [`ManualClock::START`], never at `0`, which is reserved for invalidated entries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde_json::{Value, json};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use projectcache_service::caching::Clock;
use projectcache_service::source::paths::{self, Collection};
use projectcache_service::source::{
    ChangeEvent, ChangeHandler, Document, DocumentSource, StoreError, Subscription,
};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `projectcache_service` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("projectcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A [`Clock`] that only moves when told to.
#[derive(Debug)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    /// The initial time of every clock, in epoch millis.
    pub const START: u64 = 1_700_000_000_000;

    pub fn new() -> Arc<Self> {
        Arc::new(Self(AtomicU64::new(Self::START)))
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, now: u64) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct StoreState {
    documents: HashMap<String, Value>,
    /// Collections keep their documents in insertion order.
    collections: HashMap<String, Vec<Document>>,
    reads: HashMap<String, usize>,
    read_failures: HashMap<String, StoreError>,
    subscribe_failures: HashMap<String, StoreError>,
    cancel_failure: Option<StoreError>,
    subscriptions: HashMap<u64, (String, ChangeHandler)>,
    next_subscription: u64,
    cancelled: usize,
    latency: Duration,
}

type SharedState = Arc<Mutex<StoreState>>;

fn lock(state: &Mutex<StoreState>) -> MutexGuard<'_, StoreState> {
    state.lock().unwrap()
}

/// An in-memory [`DocumentSource`].
///
/// Documents are addressed by their full path. Collections are separate from single documents, a
/// collection at `projects/p1/tasks` is filled with [`push`](Self::push).
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: SharedState,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// Delays every read by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = latency;
    }

    /// Creates or replaces the document at `path`.
    pub fn set_document(&self, path: &str, data: Value) {
        lock(&self.state).documents.insert(path.to_owned(), data);
    }

    pub fn delete_document(&self, path: &str) {
        lock(&self.state).documents.remove(path);
    }

    /// Appends a document to a collection, or replaces the document with the same id in place.
    pub fn push(&self, collection: &str, id: &str, data: Value) {
        let mut state = lock(&self.state);
        let documents = state.collections.entry(collection.to_owned()).or_default();
        match documents.iter_mut().find(|document| document.id == id) {
            Some(document) => document.data = data,
            None => documents.push(Document::new(id, data)),
        }
    }

    /// Removes a document from a collection.
    pub fn remove(&self, collection: &str, id: &str) {
        if let Some(documents) = lock(&self.state).collections.get_mut(collection) {
            documents.retain(|document| document.id != id);
        }
    }

    /// Makes every read of `path` fail with `error`.
    pub fn fail_reads(&self, path: &str, error: StoreError) {
        lock(&self.state)
            .read_failures
            .insert(path.to_owned(), error);
    }

    /// Makes every subscription to `path` fail with `error`.
    pub fn fail_subscriptions(&self, path: &str, error: StoreError) {
        lock(&self.state)
            .subscribe_failures
            .insert(path.to_owned(), error);
    }

    /// Makes closing subscriptions fail. They are closed regardless.
    pub fn fail_cancels(&self, error: StoreError) {
        lock(&self.state).cancel_failure = Some(error);
    }

    /// Removes all injected failures.
    pub fn heal(&self) {
        let mut state = lock(&self.state);
        state.read_failures.clear();
        state.subscribe_failures.clear();
        state.cancel_failure = None;
    }

    /// The number of reads of `path`, both document and collection reads.
    pub fn reads(&self, path: &str) -> usize {
        lock(&self.state).reads.get(path).copied().unwrap_or_default()
    }

    /// The number of reads of a project's root record, i.e. how often it was aggregated.
    pub fn project_loads(&self, project_id: &str) -> usize {
        self.reads(&paths::project(project_id))
    }

    /// The paths of all open subscriptions, sorted.
    pub fn subscribed_paths(&self) -> Vec<String> {
        let state = lock(&self.state);
        let mut paths: Vec<_> = state
            .subscriptions
            .values()
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        paths
    }

    pub fn active_subscriptions(&self) -> usize {
        lock(&self.state).subscriptions.len()
    }

    /// The number of subscriptions that were closed so far.
    pub fn cancelled_subscriptions(&self) -> usize {
        lock(&self.state).cancelled
    }

    /// Notifies every subscriber of `path`. Returns the number of notified subscribers.
    pub fn emit_change(&self, path: &str) -> usize {
        let handlers: Vec<_> = lock(&self.state)
            .subscriptions
            .values()
            .filter(|(subscribed, _)| subscribed == path)
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in &handlers {
            handler(ChangeEvent {
                path: path.to_owned(),
            });
        }
        handlers.len()
    }

    /// Counts the read and returns the injected failure and latency for `path`.
    fn begin_read(&self, path: &str) -> (Result<(), StoreError>, Duration) {
        let mut state = lock(&self.state);
        *state.reads.entry(path.to_owned()).or_default() += 1;
        let result = match state.read_failures.get(path) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        };
        (result, state.latency)
    }

    async fn delay(latency: Duration) {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl DocumentSource for InMemoryStore {
    fn get_document<'a>(
        &'a self,
        path: &'a str,
    ) -> BoxFuture<'a, Result<Option<Document>, StoreError>> {
        async move {
            let (result, latency) = self.begin_read(path);
            Self::delay(latency).await;
            result?;

            let state = lock(&self.state);
            let document = state.documents.get(path).map(|data| {
                let id = path.rsplit('/').next().unwrap_or(path);
                Document::new(id, data.clone())
            });
            Ok(document)
        }
        .boxed()
    }

    fn get_collection<'a>(
        &'a self,
        path: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Document>, StoreError>> {
        async move {
            let (result, latency) = self.begin_read(path);
            Self::delay(latency).await;
            result?;

            let state = lock(&self.state);
            Ok(state.collections.get(path).cloned().unwrap_or_default())
        }
        .boxed()
    }

    fn subscribe<'a>(
        &'a self,
        path: &'a str,
        on_change: ChangeHandler,
    ) -> BoxFuture<'a, Result<Box<dyn Subscription>, StoreError>> {
        async move {
            let mut state = lock(&self.state);
            if let Some(error) = state.subscribe_failures.get(path) {
                return Err(error.clone());
            }

            state.next_subscription += 1;
            let id = state.next_subscription;
            state.subscriptions.insert(id, (path.to_owned(), on_change));

            let subscription = InMemorySubscription {
                id,
                state: Arc::downgrade(&self.state),
            };
            Ok(Box::new(subscription) as Box<dyn Subscription>)
        }
        .boxed()
    }
}

struct InMemorySubscription {
    id: u64,
    state: Weak<Mutex<StoreState>>,
}

impl Subscription for InMemorySubscription {
    fn cancel(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>> {
        let result = match self.state.upgrade() {
            Some(state) => {
                let mut state = lock(&state);
                if state.subscriptions.remove(&self.id).is_some() {
                    state.cancelled += 1;
                }
                match &state.cancel_failure {
                    Some(error) => Err(error.clone()),
                    None => Ok(()),
                }
            }
            None => Ok(()),
        };
        futures::future::ready(result).boxed()
    }
}

/// Fills `store` with a small but complete project:
///
/// - the project record, named `Project {project_id}`,
/// - members `m1` (user `u1`, owner) and `m2` (user `u2`), both with a user profile,
/// - backlog `e1` (an epic with stories `s1` and `s2`) followed by `b1` (a bug),
/// - sprints `sp1` (completed) and `sp2` (active),
/// - tasks `t1` (order 2), `t2` (order 1) and `t3` (no order).
pub fn seed_project(store: &InMemoryStore, project_id: &str) {
    store.set_document(
        &paths::project(project_id),
        json!({
            "name": format!("Project {project_id}"),
            "updatedAt": "2024-03-01T12:00:00Z",
            "visibility": "private",
        }),
    );

    let members = paths::collection(project_id, Collection::Members);
    store.push(&members, "m1", json!({"userId": "u1", "role": "owner"}));
    store.push(&members, "m2", json!({"userId": "u2", "role": "member"}));
    seed_user(store, "u1", "Ada");
    seed_user(store, "u2", "Grace");

    let backlog = paths::collection(project_id, Collection::Backlog);
    store.push(&backlog, "e1", json!({"title": "Onboarding", "type": "epic"}));
    store.push(&backlog, "b1", json!({"title": "Crash on login", "type": "bug"}));
    let stories = paths::stories(project_id, "e1");
    store.push(&stories, "s1", json!({"title": "Sign up", "type": "story"}));
    store.push(&stories, "s2", json!({"title": "Welcome mail", "type": "story"}));

    let sprints = paths::collection(project_id, Collection::Sprints);
    store.push(&sprints, "sp1", json!({"name": "Sprint 1", "status": "completed"}));
    store.push(&sprints, "sp2", json!({"name": "Sprint 2", "status": "active"}));

    let tasks = paths::collection(project_id, Collection::Tasks);
    store.push(&tasks, "t1", json!({"title": "Write docs", "order": 2}));
    store.push(&tasks, "t2", json!({"title": "Fix login", "order": 1}));
    store.push(&tasks, "t3", json!({"title": "Triage"}));
}

/// Creates the profile document of a user.
pub fn seed_user(store: &InMemoryStore, user_id: &str, display_name: &str) {
    store.set_document(
        &paths::user_profile(user_id),
        json!({
            "displayName": display_name,
            "email": format!("{}@example.com", display_name.to_lowercase()),
        }),
    );
}
