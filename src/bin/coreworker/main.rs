use anyhow::Context;
use clap::Parser;
use corebroker::client::ControllerClient;
use corebroker::config::WorkerConfig;
use corebroker::core::job::{JobFile, JobPhase, JobVersion};
use corebroker::core::lifecycle::{DriverSettings, LifecycleDriver};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

mod cli;

#[cfg(target_arch = "x86_64")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::CoreWorker::parse();
    let _guard = corebroker::utils::init_tracing("worker", args.verbosity.clone())?;

    let mut config = corebroker::config::load_config(args.config.as_ref())?.worker;
    args.apply(&mut config);

    let jobs = JobFile::load(&args.jobs)?;
    let version = match &args.job_version {
        Some(name) => jobs
            .find(name)
            .with_context(|| format!("No version {name} in {}", args.jobs.display()))?,
        None => jobs
            .choose(&mut rand::rng())
            .context("Job file has no versions")?,
    };

    run(config, version).await
}

async fn run(config: WorkerConfig, version: &JobVersion) -> anyhow::Result<()> {
    let client = ControllerClient::build(&config.controller_url)?.with_timeouts(
        Duration::from_secs(config.request_timeout_secs),
        Duration::from_secs(config.complete_timeout_secs),
    );
    let settings = DriverSettings {
        start_dir: config.start_dir.clone(),
        poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        alloc_wait_timeout: Duration::from_secs(config.alloc_wait_timeout_secs),
        failure_grace: Duration::from_secs(config.failure_grace_secs),
    };
    let driver = Arc::new(LifecycleDriver::new(Arc::new(client), settings));

    tracing::info!(
        "Running version {} with {} jobs against {}",
        version.version,
        version.jobs.len(),
        config.controller_url
    );

    let mut tasks = JoinSet::new();
    for (i, spec) in version.jobs.iter().cloned().enumerate() {
        if i > 0 {
            tokio::time::sleep(Duration::from_millis(config.stagger_ms)).await;
        }
        let driver = Arc::clone(&driver);
        tasks.spawn(async move {
            let name = spec.name.clone();
            (name, driver.drive(&spec).await)
        });
    }

    let mut failed = 0usize;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(outcome))) => {
                if outcome.phase() == JobPhase::Failed {
                    failed += 1;
                }
                tracing::info!(
                    job = %name,
                    pid = outcome.pid,
                    exit_code = ?outcome.exit_code,
                    "Job ended {}",
                    outcome.phase()
                );
            }
            Ok((name, Err(e))) => {
                failed += 1;
                tracing::error!(job = %name, "Job could not be driven: {e:#}");
            }
            Err(e) => {
                failed += 1;
                tracing::error!("Job task panicked: {e}");
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} jobs failed", version.jobs.len());
    }
    Ok(())
}
