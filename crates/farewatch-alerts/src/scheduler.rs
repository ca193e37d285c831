//! Fixed-interval trigger for [`AlertJob`].

use std::time::Duration;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::AlertJob;

pub struct AlertScheduler {
    inner: JobScheduler,
    interval: Duration,
}

impl AlertScheduler {
    /// Registers the repeated job and starts ticking. With `run_on_startup`
    /// one guarded run is spawned immediately as well.
    pub async fn start(job: AlertJob, interval: Duration, run_on_startup: bool) -> Result<Self> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;

        let repeated = job.clone();
        let scheduled = Job::new_repeated_async(interval, move |_uuid, _lock| {
            let job = repeated.clone();
            Box::pin(async move {
                job.run_guarded().await;
            })
        })
        .with_context(|| format!("creating alert job repeating every {interval:?}"))?;
        sched.add(scheduled).await.context("adding alert job")?;
        sched.start().await.context("starting scheduler")?;
        info!(interval_secs = interval.as_secs(), run_on_startup, "alert scheduler started");

        if run_on_startup {
            tokio::spawn(async move {
                job.run_guarded().await;
            });
        }

        Ok(Self {
            inner: sched,
            interval,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.inner.shutdown().await.context("stopping scheduler")?;
        info!("alert scheduler stopped");
        Ok(())
    }
}
