//! Cron-driven repeated runs of the whole registry.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::{ConfigError, Registry};
use crate::runner::Runner;

/// Builds (but does not start) a scheduler that runs `registry` on `schedule`.
///
/// Runs never overlap: a trigger that fires while the previous run still holds
/// the lock is skipped.
pub async fn build_scheduler(
    schedule: &str,
    runner: Arc<Runner>,
    registry: Arc<Registry>,
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let busy = Arc::new(Mutex::new(()));

    let job = Job::new_async(schedule, move |_uuid, _l| {
        let runner = Arc::clone(&runner);
        let registry = Arc::clone(&registry);
        let busy = Arc::clone(&busy);
        Box::pin(async move {
            let Ok(_guard) = busy.try_lock() else {
                warn!("previous sync run still active; skipping this trigger");
                return;
            };
            info!("scheduled sync run triggered");
            match runner.run(&registry).await {
                Ok(report) if report.success() => {}
                Ok(report) => {
                    let failed: Vec<_> = report.failed().collect();
                    warn!(failed = ?failed, "scheduled run had failing categories");
                }
                Err(err) => error!(error = %err, "scheduled run aborted"),
            }
        })
    })
    .map_err(|err| ConfigError::Schedule {
        schedule: schedule.to_string(),
        reason: err.to_string(),
    })?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
