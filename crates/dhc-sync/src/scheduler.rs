use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::CollectorConfig;
use crate::{run_sync, SyncOptions};

/// Scheduler running one full sync per `DHC_SYNC_CRON` tick, or `None` when
/// scheduling is disabled. A tick that fires while the previous sync is still
/// running is skipped, so at most one writer touches each label.
pub async fn maybe_build_scheduler(
    config: &CollectorConfig,
    options: SyncOptions,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let config = Arc::new(config.clone());
    let options = Arc::new(options);
    let running = Arc::new(Mutex::new(()));
    let cron = config.sync_cron.clone();
    let job = Job::new_async(&cron, move |_uuid, _l| {
        let config = config.clone();
        let options = options.clone();
        let running = running.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous sync still running; skipping this tick");
                return;
            };
            match run_sync(&config, &options).await {
                Ok(summaries) => {
                    let failed = summaries.iter().filter(|s| !s.is_success()).count();
                    info!(sources = summaries.len(), failed, "scheduled sync finished");
                }
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

/// Run the scheduler until Ctrl-C. Returns `false` when scheduling is disabled.
pub async fn run_scheduled(config: &CollectorConfig, options: SyncOptions) -> Result<bool> {
    let Some(mut sched) = maybe_build_scheduler(config, options).await? else {
        return Ok(false);
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler started");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enabled: bool, cron: &str) -> CollectorConfig {
        let enabled = enabled.to_string();
        let cron = cron.to_string();
        CollectorConfig::from_lookup(move |key| match key {
            "DHC_SCHEDULER_ENABLED" => Some(enabled.clone()),
            "DHC_SYNC_CRON" => Some(cron.clone()),
            _ => None,
        })
    }

    #[tokio::test]
    async fn disabled_scheduling_builds_nothing() {
        let sched = maybe_build_scheduler(&config(false, "0 0 6 * * *"), SyncOptions::default())
            .await
            .unwrap();
        assert!(sched.is_none());
    }

    #[tokio::test]
    async fn enabled_scheduling_registers_the_cron_job() {
        let sched = maybe_build_scheduler(&config(true, "0 0 6 * * *"), SyncOptions::default())
            .await
            .unwrap();
        assert!(sched.is_some());
    }

    #[tokio::test]
    async fn invalid_cron_expressions_are_errors() {
        let err = maybe_build_scheduler(&config(true, "every morning"), SyncOptions::default())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("every morning"));
    }
}
