pub mod registry;
pub mod scheduler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use strum::{Display, EnumString};
use tokio::sync::{MappedMutexGuard, Mutex as AsyncMutex, MutexGuard};
use tracing::{info, warn};

use crate::config::SimulationConfig;
use crate::error::{SimError, SimResult};
use crate::repo::Repositories;
use crate::simulation::{CheckpointReport, SimClock, SimulationState, Tick};

pub use registry::SimulationRegistry;
pub use scheduler::{TaskStats, TaskStatus};

/// Lifecycle of a [`Simulation`]. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SimulationStatus {
    Idle,
    /// State is being generated or restored; `stop()` is rejected.
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Time controller: owns the simulated clock and the state, and drives the
/// step and checkpoint tasks.
pub struct Simulation {
    config: SimulationConfig,
    repos: Repositories,
    status: Mutex<SimulationStatus>,
    clock: Mutex<SimClock>,
    state: AsyncMutex<Option<SimulationState>>,
    tasks: AsyncMutex<Option<scheduler::Tasks>>,
    stats: Mutex<TaskStats>,
    expiry_logged: AtomicBool,
}

impl Simulation {
    pub fn new(config: SimulationConfig, repos: Repositories) -> Arc<Self> {
        let start = config.start_time.unwrap_or_else(Utc::now);
        let delta = chrono::Duration::from_std(config.delta_time())
            .unwrap_or_else(|_| chrono::Duration::seconds(1));
        let clock = SimClock::new(start, delta, config.real_time, config.lifetime());
        Arc::new(Self {
            config,
            repos,
            status: Mutex::new(SimulationStatus::Idle),
            clock: Mutex::new(clock),
            state: AsyncMutex::new(None),
            tasks: AsyncMutex::new(None),
            stats: Mutex::new(TaskStats::default()),
            expiry_logged: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn repos(&self) -> &Repositories {
        &self.repos
    }

    pub fn status(&self) -> SimulationStatus {
        *self.status.lock()
    }

    pub fn is_running(&self) -> bool {
        self.status() == SimulationStatus::Running
    }

    /// Current simulated time.
    pub fn time(&self) -> DateTime<Utc> {
        self.clock.lock().time()
    }

    pub fn stats(&self) -> TaskStats {
        self.stats.lock().clone()
    }

    fn rng(&self) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Claim the transition out of `Idle`.
    fn begin(&self) -> SimResult<()> {
        let mut status = self.status.lock();
        match *status {
            SimulationStatus::Idle => {
                *status = SimulationStatus::Starting;
                Ok(())
            }
            SimulationStatus::Starting | SimulationStatus::Running => Err(SimError::AlreadyRunning),
            SimulationStatus::Stopping | SimulationStatus::Stopped => Err(SimError::AlreadyStopped),
        }
    }

    /// Hand a failed start back to `Idle`, unless the status moved on.
    fn abort_start(&self) {
        let mut status = self.status.lock();
        if *status == SimulationStatus::Starting {
            *status = SimulationStatus::Idle;
        }
    }

    async fn install(self: &Arc<Self>, state: SimulationState) -> SimResult<()> {
        *self.state.lock().await = Some(state);
        let mut tasks = self.tasks.lock().await;
        {
            let mut status = self.status.lock();
            if *status != SimulationStatus::Starting {
                return Err(SimError::AlreadyStopped);
            }
            *status = SimulationStatus::Running;
        }
        *tasks = Some(scheduler::Tasks::spawn(self.clone()));
        drop(tasks);
        info!(
            time = %self.time(),
            delta_time_ms = self.config.delta_time_ms,
            checkpoint_delta_time_ms = self.config.checkpoint_delta_time_ms,
            real_time = self.config.real_time,
            "simulation started"
        );
        Ok(())
    }

    /// Start from freshly generated state.
    pub async fn start(self: &Arc<Self>) -> SimResult<()> {
        self.begin()?;
        let state = match SimulationState::generate(self.repos.clone(), self.time(), self.rng()).await {
            Ok(state) => state,
            Err(e) => {
                self.abort_start();
                return Err(e);
            }
        };
        self.install(state).await
    }

    /// Start from the last checkpoint, falling back to fresh state when
    /// nothing can be restored.
    pub async fn restore(self: &Arc<Self>) -> SimResult<()> {
        self.begin()?;
        let state = match SimulationState::restore(self.repos.clone(), self.rng()).await {
            Ok(state) => {
                if !self.config.real_time {
                    self.clock.lock().resume_at(state.time());
                }
                state
            }
            Err(e) => {
                warn!(error = %e, "restore failed, generating fresh state");
                match SimulationState::generate(self.repos.clone(), self.time(), self.rng()).await {
                    Ok(state) => state,
                    Err(e) => {
                        self.abort_start();
                        return Err(e);
                    }
                }
            }
        };
        self.install(state).await
    }

    /// Locked view of the state. Fails with `NoState` before the first
    /// start or restore.
    pub async fn state(&self) -> SimResult<MappedMutexGuard<'_, SimulationState>> {
        let guard = self.state.lock().await;
        MutexGuard::try_map(guard, Option::as_mut).map_err(|_| SimError::NoState)
    }

    /// Advance the clock and update the state once. Returns `None` once the
    /// lifetime is spent.
    pub async fn step(&self) -> Option<Tick> {
        let tick = self.clock.lock().advance(Utc::now());
        let Some(tick) = tick else {
            if !self.expiry_logged.swap(true, Ordering::SeqCst) {
                info!(time = %self.time(), "simulation lifetime expired, steps are now no-ops");
            }
            return None;
        };

        if let Some(state) = self.state.lock().await.as_mut() {
            state.update(&tick).await;
        }
        self.stats.lock().step.record(tick.time, None);
        Some(tick)
    }

    /// Snapshot under the state lock, then write after releasing it.
    pub async fn checkpoint(&self) -> Option<CheckpointReport> {
        let snapshot = self.state.lock().await.as_ref().map(SimulationState::snapshot)?;
        let report = snapshot.write().await;

        let error = (!report.is_complete())
            .then(|| format!("{} of {} writes failed", report.failed, report.written + report.failed));
        self.stats.lock().checkpoint.record(Utc::now(), error);
        if report.is_complete() {
            info!(written = report.written, "checkpoint stored");
        } else {
            warn!(written = report.written, failed = report.failed, "checkpoint partially failed");
        }
        Some(report)
    }

    /// Cancel both tasks, write a final checkpoint and release storage.
    /// Only a `Running` simulation can be stopped; a start still in progress
    /// is rejected with `NoRunningSimulation`.
    pub async fn stop(&self) -> SimResult<()> {
        {
            let mut status = self.status.lock();
            if *status != SimulationStatus::Running {
                return Err(SimError::NoRunningSimulation);
            }
            *status = SimulationStatus::Stopping;
        }

        if let Some(tasks) = self.tasks.lock().await.take() {
            tasks.shutdown().await;
        }
        let report = self.checkpoint().await;
        self.repos.close().await;

        *self.status.lock() = SimulationStatus::Stopped;
        info!(time = %self.time(), final_checkpoint = ?report, "simulation stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::TimeZone;

    use crate::repo::{Condition, MemoryStorage, Row, Select, Storage, StorageError};

    /// Memory storage whose inserts take a while, so a start can be
    /// observed half-way.
    struct SlowStorage {
        inner: MemoryStorage,
        delay: Duration,
    }

    impl SlowStorage {
        fn new(schema: &'static str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStorage::new(schema),
                delay,
            })
        }
    }

    #[async_trait]
    impl Storage for SlowStorage {
        async fn insert(&self, table: &str, row: Row) -> Result<i64, StorageError> {
            tokio::time::sleep(self.delay).await;
            self.inner.insert(table, row).await
        }

        async fn insert_or_update(&self, table: &str, row: Row, conflict_keys: &[&str]) -> Result<(), StorageError> {
            self.inner.insert_or_update(table, row, conflict_keys).await
        }

        async fn select(&self, table: &str, query: &Select) -> Result<Vec<Row>, StorageError> {
            self.inner.select(table, query).await
        }

        async fn remove(&self, table: &str, conditions: &[Condition]) -> Result<u64, StorageError> {
            self.inner.remove(table, conditions).await
        }

        async fn close(&self) -> Result<(), StorageError> {
            self.inner.close().await
        }
    }

    fn config() -> SimulationConfig {
        SimulationConfig {
            start_time: Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()),
            seed: Some(42),
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn test_status_names() {
        assert_eq!(SimulationStatus::Running.to_string(), "running");
        assert_eq!("stopped".parse::<SimulationStatus>().unwrap(), SimulationStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_before_start_is_no_state() {
        let sim = Simulation::new(config(), Repositories::in_memory());
        assert!(matches!(sim.state().await, Err(SimError::NoState)));
        assert!(matches!(sim.stop().await, Err(SimError::NoRunningSimulation)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_transitions() {
        let sim = Simulation::new(config(), Repositories::in_memory());
        assert_eq!(sim.status(), SimulationStatus::Idle);

        sim.start().await.unwrap();
        assert!(sim.is_running());
        assert!(matches!(sim.start().await, Err(SimError::AlreadyRunning)));
        assert!(matches!(sim.restore().await, Err(SimError::AlreadyRunning)));

        sim.stop().await.unwrap();
        assert_eq!(sim.status(), SimulationStatus::Stopped);
        assert!(matches!(sim.start().await, Err(SimError::AlreadyStopped)));
        assert!(matches!(sim.stop().await, Err(SimError::NoRunningSimulation)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_step_advances_by_delta() {
        let sim = Simulation::new(config(), Repositories::in_memory());
        sim.start().await.unwrap();
        let before = sim.time();

        let tick = sim.step().await.unwrap();
        assert_eq!(tick.time, before + chrono::Duration::seconds(1));
        assert_eq!(sim.state().await.unwrap().time(), tick.time);
        sim.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifetime_expiry_makes_steps_noops() {
        let cfg = SimulationConfig {
            lifetime_ms: Some(2_000),
            ..config()
        };
        let sim = Simulation::new(cfg, Repositories::in_memory());
        sim.start().await.unwrap();

        assert!(sim.step().await.is_some());
        assert!(sim.step().await.is_some());
        let expired_at = sim.time();
        assert!(sim.step().await.is_none());
        assert!(sim.step().await.is_none());
        assert_eq!(sim.time(), expired_at);
        sim.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_start_is_rejected() {
        let delay = Duration::from_millis(10);
        let repos = Repositories::new(SlowStorage::new("climate", delay), SlowStorage::new("grid", delay));
        let sim = Simulation::new(config(), repos);

        let starting = tokio::spawn({
            let sim = sim.clone();
            async move { sim.start().await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(sim.status(), SimulationStatus::Starting);
        assert!(matches!(sim.stop().await, Err(SimError::NoRunningSimulation)));
        assert!(matches!(sim.start().await, Err(SimError::AlreadyRunning)));

        starting.await.unwrap().unwrap();
        assert_eq!(sim.status(), SimulationStatus::Running);
        assert!(sim.state().await.is_ok());

        sim.stop().await.unwrap();
        assert_eq!(sim.status(), SimulationStatus::Stopped);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sim.status(), SimulationStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_returns_to_idle() {
        let repos = Repositories::in_memory();
        repos.close().await;
        let sim = Simulation::new(config(), repos);

        assert!(matches!(sim.start().await, Err(SimError::Storage(_))));
        assert_eq!(sim.status(), SimulationStatus::Idle);
        assert!(matches!(sim.state().await, Err(SimError::NoState)));
    }
}
