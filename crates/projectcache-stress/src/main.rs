use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use projectcache_service::config::Config as ServiceConfig;
use projectcache_service::logging::{ensure_log_error, init_logging};
use projectcache_service::metrics;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Enable `sentry`, reporting to a local sink.
    #[arg(long)]
    sentry: bool,

    /// Enable `tracing` with JSON output, writing into the void.
    #[arg(long)]
    tracing: bool,

    /// Enable `metrics`, reporting to a local UDP sink.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    if let Err(error) = run() {
        ensure_log_error(&error);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let mut service_config =
        ServiceConfig::get(cli.config.as_deref()).context("failed loading config")?;

    // `--tracing` installs its own subscriber writing into the void
    if !cli.tracing {
        // SAFETY: The runtime is not started yet, so this is still single-threaded.
        unsafe { init_logging(&service_config) };
    }

    // the local sink of `--metrics` takes precedence over a configured statsd host
    if !cli.metrics {
        metrics::init_metrics(&service_config.metrics).context("failed to configure statsd")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(async move {
        let logging_config = logging::Config {
            sentry: cli.sentry,
            tracing: cli.tracing,
            metrics: cli.metrics,
        };
        let mut guard = logging::init(logging_config, &mut service_config)?;
        if let Some(http_sink) = guard.http_sink.take() {
            tokio::spawn(http_sink);
        }
        if let Some(udp_sink) = guard.udp_sink.take() {
            tokio::spawn(udp_sink);
        }

        perform_stresstest(service_config, workloads, cli.duration).await
    })
}
