use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use projectcache_service::config::Config;
use projectcache_service::service::ProjectDataService;
use projectcache_service::source::paths::{self, Collection};
use projectcache_test::{InMemoryStore, seed_project, seed_user};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// The number of concurrent readers.
    pub concurrency: usize,
    /// The number of distinct projects the readers cycle through.
    #[serde(default = "default_projects")]
    pub projects: usize,
    #[serde(flatten)]
    pub shape: ProjectShape,
    /// Artificial latency of every store read.
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,
    /// If set, a change event is fired for one of the projects at this interval.
    #[serde(default, with = "humantime_serde")]
    pub change_interval: Option<Duration>,
}

fn default_projects() -> usize {
    1
}

/// Additional documents generated for every project, on top of the seeded fixture.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProjectShape {
    pub members: usize,
    pub epics: usize,
    pub stories_per_epic: usize,
    pub tasks: usize,
}

/// A workload with its own store and service, ready to run.
pub struct PreparedWorkload {
    pub concurrency: usize,
    pub service: ProjectDataService,
    pub store: Arc<InMemoryStore>,
    pub project_ids: Vec<String>,
    pub change_interval: Option<Duration>,
    next_project: AtomicUsize,
}

impl PreparedWorkload {
    /// Returns the next project to read, cycling through all projects.
    pub fn next_project(&self) -> &str {
        let index = self.next_project.fetch_add(1, Ordering::Relaxed);
        &self.project_ids[index % self.project_ids.len()]
    }

    /// The number of times any project was actually aggregated.
    pub fn loads(&self) -> usize {
        self.project_ids
            .iter()
            .map(|project_id| self.store.project_loads(project_id))
            .sum()
    }
}

pub fn prepare_workload(index: usize, config: &Config, workload: Workload) -> PreparedWorkload {
    let store = InMemoryStore::new();
    store.set_latency(workload.latency);

    let project_ids: Vec<_> = (0..workload.projects.max(1))
        .map(|project| format!("w{index}-p{project}"))
        .collect();
    for project_id in &project_ids {
        seed_project(&store, project_id);
        generate_documents(&store, project_id, &workload.shape);
    }

    let service = ProjectDataService::new(config, store.clone());

    PreparedWorkload {
        concurrency: workload.concurrency,
        service,
        store,
        project_ids,
        change_interval: workload.change_interval,
        next_project: AtomicUsize::new(0),
    }
}

fn generate_documents(store: &InMemoryStore, project_id: &str, shape: &ProjectShape) {
    let members = paths::collection(project_id, Collection::Members);
    for member in 0..shape.members {
        let user_id = format!("{project_id}-u{member}");
        store.push(&members, &format!("gm{member}"), json!({ "userId": user_id }));
        seed_user(store, &user_id, &format!("User {member}"));
    }

    let backlog = paths::collection(project_id, Collection::Backlog);
    for epic in 0..shape.epics {
        let epic_id = format!("ge{epic}");
        store.push(
            &backlog,
            &epic_id,
            json!({ "title": format!("Epic {epic}"), "type": "epic" }),
        );

        let stories = paths::stories(project_id, &epic_id);
        for story in 0..shape.stories_per_epic {
            store.push(
                &stories,
                &format!("gs{epic}-{story}"),
                json!({ "title": format!("Story {story}"), "type": "story" }),
            );
        }
    }

    let tasks = paths::collection(project_id, Collection::Tasks);
    for task in 0..shape.tasks {
        store.push(
            &tasks,
            &format!("gt{task}"),
            json!({ "title": format!("Task {task}"), "order": shape.tasks - task }),
        );
    }
}

/// Reads the next project of the workload.
pub async fn process_workload(workload: &PreparedWorkload) {
    let project_id = workload.next_project();
    match workload.service.get_project_data(project_id, false).await {
        Ok(Some(_)) => {}
        Ok(None) => panic!("project {project_id} vanished"),
        Err(err) => panic!("failed to load project {project_id}: {err}"),
    }
}
