//! Background jobs: periodic tasks on the Tokio runtime.
//!
//! A [`Scheduler`] owns one spawned task per registered job. Each task ticks on
//! a [`tokio::time::interval`] that first fires one full period after
//! registration and skips ticks missed while a slow run was in progress, so
//! runs of the same job never overlap. Jobs are aborted on
//! [`Scheduler::shutdown`] or when the scheduler is dropped.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info};

struct Job {
    name: String,
    handle: JoinHandle<()>,
}

/// A set of named periodic jobs.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use rttp_cache::background::Scheduler;
///
/// # async fn demo() {
/// let mut scheduler = Scheduler::new();
/// scheduler.every("heartbeat", Duration::from_secs(30), || async {
///     tracing::info!("still alive");
/// });
/// # }
/// ```
#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<Job>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `job` every `period` until the scheduler shuts down.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime or if `period` is zero.
    pub fn every<F, Fut>(&mut self, name: impl Into<String>, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                debug!(job = %task_name, "running background job");
                job().await;
            }
        });
        debug!(job = %name, period_secs = period.as_secs(), "background job registered");
        self.jobs.push(Job { name, handle });
    }

    /// Names of registered jobs in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.jobs.iter().map(|job| job.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Aborts every job. In-flight runs are cancelled at their next `.await`.
    pub fn shutdown(&mut self) {
        if self.jobs.is_empty() {
            return;
        }
        for job in self.jobs.drain(..) {
            job.handle.abort();
        }
        info!("background jobs stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
