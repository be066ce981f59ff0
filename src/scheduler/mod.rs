pub mod tasks;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};
use uuid::Uuid;

use crate::bus::Bus;

/// Periodic maintenance run against the bus
pub type BusTask = fn(&Bus);

/// Cron-driven housekeeping for a running bus. Jobs are tracked by name so
/// they can be listed and torn down on shutdown.
pub struct Scheduler {
    inner: JobScheduler,
    bus: Bus,
    jobs: Vec<(String, Uuid)>,
}

impl Scheduler {
    pub async fn new(bus: Bus) -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self {
            inner,
            bus,
            jobs: Vec::new(),
        })
    }

    /// Run `task` on every tick of `cron_expr` (six fields, with seconds).
    pub async fn every(&mut self, cron_expr: &str, name: &str, task: BusTask) -> Result<Uuid> {
        let bus = self.bus.clone();
        let job_name = name.to_string();
        let job = Job::new(cron_expr, move |_uuid, _lock| {
            debug!("Running scheduled task: {}", job_name);
            task(&bus);
        })
        .with_context(|| format!("Failed to create cron job: {}", name))?;

        let id = self
            .inner
            .add(job)
            .await
            .with_context(|| format!("Failed to add job: {}", name))?;
        self.jobs.push((name.to_string(), id));

        info!("Scheduled task '{}' with cron: {}", name, cron_expr);
        Ok(id)
    }

    /// Names of the registered jobs, in registration order
    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub async fn start(&self) -> Result<()> {
        self.inner
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!("Scheduler started with {} jobs", self.jobs.len());
        Ok(())
    }

    /// Remove every job and stop the scheduler.
    pub async fn shutdown(mut self) -> Result<()> {
        for (name, id) in self.jobs.drain(..) {
            self.inner
                .remove(&id)
                .await
                .with_context(|| format!("Failed to remove job: {}", name))?;
        }
        self.inner
            .shutdown()
            .await
            .context("Failed to shut down scheduler")?;
        info!("Scheduler stopped");
        Ok(())
    }
}
