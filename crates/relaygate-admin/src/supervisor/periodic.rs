use std::sync::Arc;

use async_trait::async_trait;
use relaygate_core::db::unix_timestamp;
use tracing::{debug, error};

use super::{Schedule, Supervisor};
use crate::error::Result;

/// Body of a timer-driven background job.
#[async_trait]
pub trait PeriodicJob: Send + Sync + 'static {
    /// One complete pass. Errors are logged by the task and retried on the
    /// next tick.
    async fn run(&self) -> Result<()>;
}

/// A [`PeriodicJob`] bound to a [`Schedule`] and supervised.
///
/// A pass in progress always completes; stop is observed between passes.
pub struct PeriodicTask {
    schedule: Schedule,
    job: Arc<dyn PeriodicJob>,
    supervisor: Supervisor,
}

impl PeriodicTask {
    pub fn new(name: &'static str, schedule: Schedule, job: Arc<dyn PeriodicJob>) -> Self {
        Self {
            schedule,
            job,
            supervisor: Supervisor::new(name),
        }
    }

    pub async fn start(&self) -> bool {
        let name = self.supervisor.name();
        let schedule = self.schedule;
        let job = Arc::clone(&self.job);

        self.supervisor
            .start(move |mut stop| async move {
                loop {
                    let delay = schedule.delay_from(unix_timestamp());
                    debug!(task = name, delay_secs = delay.as_secs(), "Next run scheduled");

                    tokio::select! {
                        () = tokio::time::sleep(delay) => {
                            if let Err(e) = job.run().await {
                                error!(task = name, error = %e, "Scheduled run failed");
                            }
                        }
                        () = stop.stopped() => return,
                    }
                }
            })
            .await
    }

    pub async fn stop(&self) -> bool {
        self.supervisor.stop().await
    }

    pub async fn is_running(&self) -> bool {
        self.supervisor.is_running().await
    }
}
