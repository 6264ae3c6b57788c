use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use super::{Simulation, SimulationStatus};
use crate::config::SimulationConfig;
use crate::error::{SimError, SimResult};
use crate::repo::Repositories;

/// Holds the single running [`Simulation`] of the process. Built once and
/// handed to whoever needs the running instance.
#[derive(Default)]
pub struct SimulationRegistry {
    current: Mutex<Option<Arc<Simulation>>>,
}

enum Mode {
    Start,
    Restore,
}

impl SimulationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the slot for a new simulation. A previous one that has been
    /// stopped is replaced.
    fn claim(&self, config: SimulationConfig, repos: Repositories) -> SimResult<Arc<Simulation>> {
        let mut current = self.current.lock();
        if let Some(sim) = current.as_ref() {
            if sim.status() != SimulationStatus::Stopped {
                return Err(SimError::AlreadyRunning);
            }
        }
        let sim = Simulation::new(config, repos);
        *current = Some(sim.clone());
        Ok(sim)
    }

    async fn launch(&self, config: SimulationConfig, repos: Repositories, mode: Mode) -> SimResult<Arc<Simulation>> {
        let sim = self.claim(config, repos)?;
        let started = match mode {
            Mode::Start => sim.start().await,
            Mode::Restore => sim.restore().await,
        };
        if let Err(e) = started {
            let mut current = self.current.lock();
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &sim)) {
                *current = None;
            }
            return Err(e);
        }
        Ok(sim)
    }

    pub async fn start(&self, config: SimulationConfig, repos: Repositories) -> SimResult<Arc<Simulation>> {
        self.launch(config, repos, Mode::Start).await
    }

    pub async fn restore(&self, config: SimulationConfig, repos: Repositories) -> SimResult<Arc<Simulation>> {
        self.launch(config, repos, Mode::Restore).await
    }

    /// The running simulation.
    pub fn instance(&self) -> SimResult<Arc<Simulation>> {
        self.current
            .lock()
            .as_ref()
            .filter(|sim| sim.is_running())
            .cloned()
            .ok_or(SimError::NoRunningSimulation)
    }

    pub async fn stop(&self) -> SimResult<()> {
        let sim = self.instance()?;
        sim.stop().await?;
        info!("registry released simulation");
        Ok(())
    }
}
