use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

use projectcache_service::config::Config;
use projectcache_service::source::paths;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{PreparedWorkload, WorkloadsConfig, prepare_workload, process_workload};

pub async fn perform_stresstest(
    service_config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // initialize workloads, each with its own store and cache
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| Arc::new(prepare_workload(i, &service_config, workload)))
        .collect();

    // subscribe to all projects, so change events invalidate them
    for workload in &workloads {
        for project_id in &workload.project_ids {
            workload
                .service
                .subscribe_to_project_updates(project_id)
                .await?;
        }
    }

    // warmup: read each project once to make sure caches are warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                for _ in 0..workload.project_ids.len() {
                    process_workload(&workload).await;
                }
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let workload = Arc::clone(workload);
        let loads_before = workload.loads();

        if let Some(interval) = workload.change_interval {
            tokio::spawn(emit_changes(Arc::clone(&workload), interval, deadline));
        }

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            process_workload(&workload).await;

                            transaction.finish();

                            task_durations.lock().unwrap().add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap();
                std::mem::take(&mut task_durations)
            };

            let loads = workload.loads() - loads_before;
            (concurrency, task_durations, loads)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, task_durations, loads) = task?;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
        println!("  project loads: {loads}");

        if ops == 0 {
            continue;
        }
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let p50 = quantile(&task_durations, 0.5);
        let p90 = quantile(&task_durations, 0.9);
        let p99 = quantile(&task_durations, 0.99);
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    for workload in &workloads {
        workload.service.unsubscribe_all().await;
    }

    Ok(())
}

fn quantile(sketch: &DDSketch, q: f64) -> Duration {
    let seconds = sketch.quantile(q).ok().flatten().unwrap_or_default();
    Duration::from_secs_f64(seconds)
}

/// Fires a change event for one project after another until the deadline.
async fn emit_changes(
    workload: Arc<PreparedWorkload>,
    interval: Duration,
    deadline: tokio::time::Instant,
) {
    let mut ticker = tokio::time::interval(interval);
    let mut index = 0;
    while tokio::time::Instant::now() < deadline {
        ticker.tick().await;
        let project_id = &workload.project_ids[index % workload.project_ids.len()];
        workload.store.emit_change(&paths::project(project_id));
        index += 1;
    }
}
