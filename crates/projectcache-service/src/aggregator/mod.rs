//! Assembling [`ProjectSnapshot`]s from the backing store.
//!
//! A load reads the project record and all related collections concurrently, so it takes about
//! as long as the slowest single read. Members are then enriched with their user profiles, and
//! the stories of every epic are fetched and flattened into the backlog, again concurrently.
//!
//! Enrichment is best effort: a profile or a story list that cannot be read only degrades that
//! single item, the load as a whole still succeeds.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use futures::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;

use crate::caching::{CacheError, Clock, LoadResult, SnapshotLoader};
use crate::source::paths::{self, Collection};
use crate::source::{Document, DocumentSource};
use crate::types::{
    BacklogItem, Member, MemberProfile, ProjectRecord, ProjectSnapshot, Sprint, Task,
};

pub mod fingerprint;

use fingerprint::Shape;

/// Loads complete project snapshots from a [`DocumentSource`].
#[derive(Clone)]
pub struct ProjectAggregator {
    source: Arc<dyn DocumentSource>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ProjectAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectAggregator")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl ProjectAggregator {
    pub fn new(source: Arc<dyn DocumentSource>, clock: Arc<dyn Clock>) -> Self {
        Self { source, clock }
    }

    /// Assembles the snapshot of a project, or `None` if its root record does not exist.
    #[tracing::instrument(skip(self))]
    pub async fn load_project(&self, project_id: &str) -> LoadResult<ProjectSnapshot> {
        let start = Instant::now();

        let root_path = paths::project(project_id);
        let members_path = paths::collection(project_id, Collection::Members);
        let backlog_path = paths::collection(project_id, Collection::Backlog);
        let sprints_path = paths::collection(project_id, Collection::Sprints);
        let tasks_path = paths::collection(project_id, Collection::Tasks);

        let (root, members, backlog, sprints, tasks) = future::try_join5(
            self.source.get_document(&root_path),
            self.source.get_collection(&members_path),
            self.source.get_collection(&backlog_path),
            self.source.get_collection(&sprints_path),
            self.source.get_collection(&tasks_path),
        )
        .await?;

        let Some(root) = root else {
            tracing::debug!("Project does not exist");
            return Ok(None);
        };
        let project: ProjectRecord = decode_with_path(root, |_| root_path.clone())?;

        let members = decode_all(&members_path, members)?;
        let backlog = decode_all(&backlog_path, backlog)?;
        let sprints: Vec<Sprint> = decode_all(&sprints_path, sprints)?;
        let mut tasks: Vec<Task> = decode_all(&tasks_path, tasks)?;

        let (members, backlog) = future::join(
            self.enrich_members(members),
            self.flatten_backlog(project_id, backlog),
        )
        .await;

        sort_tasks(&mut tasks);

        let active_sprint_id = sprints
            .iter()
            .find(|sprint| sprint.is_active())
            .map(|sprint| sprint.id.clone());

        let fingerprint = Shape {
            members: members.len(),
            backlog: backlog.len(),
            sprints: sprints.len(),
            tasks: tasks.len(),
            active_sprint_id: active_sprint_id.as_deref(),
            updated_at: project.updated_at_millis(),
        }
        .fingerprint();

        metric!(timer("aggregator.load") = start.elapsed());
        tracing::trace!(%fingerprint, "Assembled project snapshot");

        Ok(Some(ProjectSnapshot {
            project,
            members,
            backlog,
            sprints,
            tasks,
            active_sprint_id,
            fingerprint,
            loaded_at: self.clock.now(),
        }))
    }

    /// Resolves the user profile of every member concurrently.
    async fn enrich_members(&self, members: Vec<Member>) -> Vec<Member> {
        let futures = members.into_iter().map(|member| self.enrich_member(member));
        future::join_all(futures).await
    }

    async fn enrich_member(&self, mut member: Member) -> Member {
        if member.user_id.is_empty() {
            member.user_id = member.id.clone();
        }

        let path = paths::user_profile(&member.user_id);
        let profile = match self.source.get_document(&path).await {
            Ok(Some(document)) => decode::<MemberProfile>(&path, document),
            Ok(None) => {
                tracing::warn!(user_id = %member.user_id, "Member has no user profile");
                metric!(counter("aggregator.enrichment.degraded") += 1, "reason" => "missing");
                return degraded(member);
            }
            Err(err) => Err(err.into()),
        };

        match profile {
            Ok(mut profile) => {
                if profile.display_name.is_empty() {
                    profile.display_name = member.user_id.clone();
                }
                member.profile = profile;
                member.enriched = true;
                member
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    user_id = %member.user_id,
                    "Failed to enrich project member",
                );
                metric!(
                    counter("aggregator.enrichment.degraded") += 1,
                    "reason" => err.metrics_tag(),
                );
                degraded(member)
            }
        }
    }

    /// Fetches the stories of every epic concurrently and inserts them right after their epic.
    ///
    /// The order of the backlog as returned by the store is preserved.
    async fn flatten_backlog(
        &self,
        project_id: &str,
        backlog: Vec<BacklogItem>,
    ) -> Vec<BacklogItem> {
        let futures = backlog.iter().map(|item| {
            if item.is_epic() {
                self.fetch_stories(project_id, item).boxed()
            } else {
                future::ready(Vec::new()).boxed()
            }
        });
        let stories = future::join_all(futures).await;

        let total = backlog.len() + stories.iter().map(Vec::len).sum::<usize>();
        let mut flattened = Vec::with_capacity(total);
        for (item, stories) in backlog.into_iter().zip(stories) {
            flattened.push(item);
            flattened.extend(stories);
        }
        flattened
    }

    async fn fetch_stories(&self, project_id: &str, epic: &BacklogItem) -> Vec<BacklogItem> {
        let path = paths::stories(project_id, &epic.id);
        let result = match self.source.get_collection(&path).await {
            Ok(documents) => decode_all::<BacklogItem>(&path, documents),
            Err(err) => Err(err.into()),
        };

        match result {
            Ok(mut stories) => {
                for story in &mut stories {
                    story.parent_id = Some(epic.id.clone());
                    story.parent_title = Some(epic.title.clone());
                }
                stories
            }
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    epic_id = %epic.id,
                    "Failed to load stories of epic",
                );
                metric!(
                    counter("aggregator.enrichment.degraded") += 1,
                    "reason" => err.metrics_tag(),
                );
                Vec::new()
            }
        }
    }
}

impl SnapshotLoader for ProjectAggregator {
    fn load<'a>(&'a self, project_id: &'a str) -> BoxFuture<'a, LoadResult<ProjectSnapshot>> {
        self.load_project(project_id).boxed()
    }
}

fn degraded(mut member: Member) -> Member {
    member.profile = MemberProfile::placeholder(&member.user_id);
    member.enriched = false;
    member
}

/// Decodes a document of the collection at `path` into a typed record.
fn decode<T: DeserializeOwned>(path: &str, document: Document) -> Result<T, CacheError> {
    decode_with_path(document, |id| format!("{path}/{id}"))
}

/// Decodes a document into a typed record, reporting errors at the path built from its id.
///
/// The document id is filled in as `id` field unless the document carries one itself.
fn decode_with_path<T, P>(document: Document, path: P) -> Result<T, CacheError>
where
    T: DeserializeOwned,
    P: FnOnce(&str) -> String,
{
    let Document { id, mut data } = document;
    if let Some(fields) = data.as_object_mut() {
        fields
            .entry("id")
            .or_insert_with(|| serde_json::Value::String(id.clone()));
    }
    serde_json::from_value(data).map_err(|err| CacheError::malformed(path(&id), &err))
}

fn decode_all<T: DeserializeOwned>(
    path: &str,
    documents: Vec<Document>,
) -> Result<Vec<T>, CacheError> {
    documents
        .into_iter()
        .map(|document| decode(path, document))
        .collect()
}

/// Sorts tasks by their explicit `order`, keeping the store order for ties.
///
/// Tasks without an `order` go last.
fn sort_tasks(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| match (a.order, b.order) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
}
