//! The backing document store, as far as the project cache is concerned.
//!
//! The store is consumed through the [`DocumentSource`] trait: single document reads, collection
//! queries and change subscriptions. Everything is addressed by slash-separated paths, see
//! [`paths`] for the layout of a project.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error returned by the backing store.
///
/// All of these are considered transient from the point of view of the cache, a later read may
/// succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached or failed to answer.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store rejected the read.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The store did not answer in time.
    #[error("store request timed out after {0:?}")]
    Timeout(Duration),
}

/// A single document as returned by the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// The document id, which is the last segment of its path.
    pub id: String,
    /// The raw document fields.
    pub data: serde_json::Value,
}

impl Document {
    pub fn new(id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }
}

/// Notification that something at `path` has changed.
///
/// Carries no guarantee about the kind of change or the new contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: String,
}

/// Callback invoked by a [`DocumentSource`] subscription on every change.
pub type ChangeHandler = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// A live push subscription opened with [`DocumentSource::subscribe`].
pub trait Subscription: Send + Sync {
    /// Closes the subscription. No further change events are delivered once this resolves.
    fn cancel(self: Box<Self>) -> BoxFuture<'static, Result<(), StoreError>>;
}

impl fmt::Debug for dyn Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Subscription")
    }
}

/// Asynchronous read and subscription access to the backing store.
pub trait DocumentSource: Send + Sync + 'static {
    /// Reads a single document, returning `None` if it does not exist.
    fn get_document<'a>(
        &'a self,
        path: &'a str,
    ) -> BoxFuture<'a, Result<Option<Document>, StoreError>>;

    /// Reads all documents of a collection, in the order the store returns them.
    fn get_collection<'a>(
        &'a self,
        path: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Document>, StoreError>>;

    /// Subscribes to changes of the document or collection at `path`.
    fn subscribe<'a>(
        &'a self,
        path: &'a str,
        on_change: ChangeHandler,
    ) -> BoxFuture<'a, Result<Box<dyn Subscription>, StoreError>>;
}

/// Document paths of a project and its related collections.
pub mod paths {
    /// A collection that is part of a project snapshot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Collection {
        Members,
        Backlog,
        Sprints,
        Tasks,
    }

    impl Collection {
        /// Every collection that is loaded into a snapshot and watched for changes.
        pub const ALL: [Collection; 4] = [
            Collection::Members,
            Collection::Backlog,
            Collection::Sprints,
            Collection::Tasks,
        ];

        pub fn as_str(&self) -> &'static str {
            match self {
                Collection::Members => "members",
                Collection::Backlog => "backlog",
                Collection::Sprints => "sprints",
                Collection::Tasks => "tasks",
            }
        }
    }

    /// The root record of a project.
    pub fn project(project_id: &str) -> String {
        format!("projects/{project_id}")
    }

    /// A related collection of a project.
    pub fn collection(project_id: &str, collection: Collection) -> String {
        format!("projects/{project_id}/{}", collection.as_str())
    }

    /// The nested stories of an epic backlog item.
    pub fn stories(project_id: &str, epic_id: &str) -> String {
        format!("projects/{project_id}/backlog/{epic_id}/stories")
    }

    /// The profile of a user, used to enrich project members.
    pub fn user_profile(user_id: &str) -> String {
        format!("users/{user_id}")
    }

    /// Every path a project cache entry depends on directly: the root record and each
    /// [`Collection`].
    pub fn tracked(project_id: &str) -> Vec<String> {
        std::iter::once(project(project_id))
            .chain(
                Collection::ALL
                    .iter()
                    .map(|collection| self::collection(project_id, *collection)),
            )
            .collect()
    }

}
