//! Cancellable delayed jobs.
//!
//! Expiry timers are first-class values: every scheduled job is owned by a
//! [`ScheduledTask`], and dropping the task cancels the job.

use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::debug;

/// A job run once after a delay.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs after a delay and hands back a cancel handle.
pub trait Scheduler: Send + Sync {
    /// Run `job` once after `delay` unless the returned task is cancelled
    /// or dropped first.
    fn schedule(&self, delay: Duration, job: Job) -> ScheduledTask;
}

/// Owner of one scheduled job.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: Option<AbortHandle>,
}

impl ScheduledTask {
    pub fn armed(handle: AbortHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// A task with nothing behind it; the job will never run.
    pub fn detached() -> Self {
        Self { handle: None }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    /// Cancel the job if it has not run yet.
    pub fn cancel(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Release the job without cancelling it. Used by a job that is already
    /// running and is about to drop its own task.
    pub fn disarm(&mut self) {
        self.handle = None;
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Schedules jobs on the ambient tokio runtime.
///
/// Outside a runtime nothing is scheduled and a detached task is returned;
/// the store then relies on eviction at access time alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, job: Job) -> ScheduledTask {
        match Handle::try_current() {
            Ok(runtime) => {
                let task = runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    job();
                });
                ScheduledTask::armed(task.abort_handle())
            }
            Err(_) => {
                debug!(
                    delay_ms = delay.as_millis() as u64,
                    "No async runtime, job not scheduled"
                );
                ScheduledTask::detached()
            }
        }
    }
}
