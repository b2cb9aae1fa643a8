use std::sync::Arc;

use projectcache_service::config::Config;
use projectcache_service::service::ProjectDataService;
use projectcache_test as test;

pub use test::{InMemoryStore, ManualClock, seed_project, seed_user};

/// Setup tests and create a test service.
///
/// Returns the service together with its backing store and clock. The `update_config` closure can
/// modify the default configuration before the service is created.
pub fn setup_service(
    update_config: impl FnOnce(&mut Config),
) -> (ProjectDataService, Arc<InMemoryStore>, Arc<ManualClock>) {
    test::setup();

    let mut config = Config::default();
    update_config(&mut config);

    let store = InMemoryStore::new();
    let clock = ManualClock::new();
    let service = ProjectDataService::with_clock(&config, store.clone(), clock.clone());

    (service, store, clock)
}
