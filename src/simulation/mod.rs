//! # Micro-grid Simulation Model
//!
//! The entities advanced on every tick of the simulated timeline.
//!
//! ## Components
//!
//! - **Wind**: seasonal and diurnal wind series, persisted hourly and interpolated
//! - **WindTurbine**: wind speed to power, with random break-downs and repairs
//! - **Battery**: bounded reservoir behind each house
//! - **House**: prosumer combining turbine, battery and an optional plant link
//! - **PowerPlant** / **Market**: deterministic production sold into a per-tick ledger
//! - **SimulationState**: the aggregate, its tick order and its checkpoints
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chrono::{Duration, Utc};
//! use rand::{rngs::StdRng, SeedableRng};
//! use microgrid_sim::repo::Repositories;
//! use microgrid_sim::simulation::{SimulationState, Tick};
//!
//! # async fn run() -> microgrid_sim::error::SimResult<()> {
//! let repos = Repositories::in_memory();
//! let start = Utc::now();
//! let mut state = SimulationState::generate(repos, start, StdRng::seed_from_u64(7)).await?;
//! state.register_power_plant(1).await?;
//! state.register_house(2).await?;
//!
//! state.update(&Tick::new(start + Duration::hours(1), Duration::hours(1))).await;
//! let report = state.store().await;
//! assert!(report.is_complete());
//! # Ok(())
//! # }
//! ```

pub mod battery;
pub mod clock;
pub mod house;
pub mod market;
pub mod power_plant;
pub mod profile;
pub mod state;
pub mod turbine;
pub mod wind;

pub use battery::{Battery, Chargeable};
pub use clock::{SimClock, Tick};
pub use house::House;
pub use market::{Market, Sellable};
pub use power_plant::PowerPlant;
pub use state::{CheckpointReport, GridSummary, SimulationState, Snapshot};
pub use turbine::{TurbineStatus, WindTurbine};
pub use wind::{Wind, WindSample};
