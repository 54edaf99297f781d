//! Start/stop skeleton shared by every long-lived background engine.
//!
//! [`Supervisor`] owns at most one task at a time together with the stop
//! signal that ends it. [`PeriodicTask`] layers a [`Schedule`] on top for
//! timer-driven jobs.

mod periodic;
mod schedule;

pub use periodic::{PeriodicJob, PeriodicTask};
pub use schedule::Schedule;

use std::future::Future;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receiving half of a supervisor's stop signal.
#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Resolves once stop has been requested or the supervisor is gone.
    pub async fn stopped(&mut self) {
        // An Err means the sender was dropped, which also ends the task.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }
}

struct Running {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Idempotent start/stop around a single spawned task.
pub struct Supervisor {
    name: &'static str,
    state: Mutex<Option<Running>>,
}

impl Supervisor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(None),
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Spawn `body` unless a task is already running.
    ///
    /// Returns `false` when the call was a no-op.
    pub async fn start<F, Fut>(&self, body: F) -> bool
    where
        F: FnOnce(StopSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.state.lock().await;
        if state.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!(task = self.name, "Already running");
            return false;
        }

        let (stop_tx, rx) = watch::channel(false);
        let handle = tokio::spawn(body(StopSignal { rx }));
        *state = Some(Running { stop_tx, handle });

        info!(task = self.name, "Background task started");
        true
    }

    /// Signal the task and wait for it to finish.
    ///
    /// The state lock is held until the task has drained, so a concurrent
    /// `start` cannot overlap it. Returns `false` when nothing was running.
    pub async fn stop(&self) -> bool {
        let mut state = self.state.lock().await;
        let Some(running) = state.take() else {
            return false;
        };

        let _ = running.stop_tx.send(true);
        if let Err(e) = running.handle.await {
            warn!(task = self.name, error = %e, "Background task ended abnormally");
        }
        drop(state);

        info!(task = self.name, "Background task stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}
