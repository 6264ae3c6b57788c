use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Simulation;

/// Run bookkeeping for one periodic task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub success_count: u64,
    pub error_count: u64,
}

impl TaskStatus {
    pub(crate) fn record(&mut self, at: DateTime<Utc>, error: Option<String>) {
        self.last_run = Some(at);
        self.run_count += 1;
        match error {
            None => {
                self.last_success = Some(at);
                self.success_count += 1;
                self.last_error = None;
            }
            Some(e) => {
                self.error_count += 1;
                self.last_error = Some(e);
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStats {
    pub step: TaskStatus,
    pub checkpoint: TaskStatus,
}

/// The step and checkpoint loops of one running simulation.
pub(crate) struct Tasks {
    token: CancellationToken,
    step: JoinHandle<()>,
    checkpoint: JoinHandle<()>,
}

impl Tasks {
    pub(crate) fn spawn(sim: Arc<Simulation>) -> Self {
        let token = CancellationToken::new();
        let step_every = sim.config().delta_time();
        let checkpoint_every = sim.config().checkpoint_delta_time();

        let step = tokio::spawn(run_step_loop(sim.clone(), step_every, token.clone()));
        let checkpoint = tokio::spawn(run_checkpoint_loop(sim, checkpoint_every, token.clone()));
        info!(?step_every, ?checkpoint_every, "periodic tasks started");

        Self {
            token,
            step,
            checkpoint,
        }
    }

    /// Cancel both loops and wait for any in-flight run to finish.
    pub(crate) async fn shutdown(self) {
        self.token.cancel();
        for (name, handle) in [("step", self.step), ("checkpoint", self.checkpoint)] {
            if let Err(e) = handle.await {
                warn!(task = name, error = %e, "periodic task ended abnormally");
            }
        }
        debug!("periodic tasks stopped");
    }
}

/// Each run is awaited to completion before the next tick is taken, and
/// cancellation is only observed between runs.
async fn run_step_loop(sim: Arc<Simulation>, every: Duration, token: CancellationToken) {
    let mut interval = interval_at(Instant::now() + every, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        sim.step().await;
    }
}

async fn run_checkpoint_loop(sim: Arc<Simulation>, every: Duration, token: CancellationToken) {
    let mut interval = interval_at(Instant::now() + every, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        sim.checkpoint().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_records_outcomes() {
        let mut status = TaskStatus::default();
        let now = Utc::now();
        status.record(now, None);
        status.record(now, Some("1 of 3 writes failed".into()));

        assert_eq!(status.run_count, 2);
        assert_eq!(status.success_count, 1);
        assert_eq!(status.error_count, 1);
        assert_eq!(status.last_success, Some(now));
        assert_eq!(status.last_error.as_deref(), Some("1 of 3 writes failed"));
    }
}
