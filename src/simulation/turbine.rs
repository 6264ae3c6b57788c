//! # Wind Turbine
//!
//! Converts the ambient wind speed into power output, with a random
//! break-down / repair cycle.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::clock::Tick;
use crate::error::{SimError, SimResult};
use crate::repo::{tables, Condition, Row, Select, Storage, StorageError};

/// Repair durations are drawn from this range, in hours.
pub const REPAIR_HOURS: std::ops::Range<f64> = 0.1..24.0;

/// Operating status of a turbine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurbineStatus {
    Operating,
    Broken,
}

/// Invariants: `0 <= current_power <= max_power`, and a broken turbine
/// produces nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindTurbine {
    pub id: Option<i64>,
    pub owner: i64,
    current_power: f64,
    /// Remaining repair time in hours; zero while operating.
    repair_time: f64,
    max_power: f64,
    production_ratio: f64,
    break_down_freq: f64,
    broken: bool,
}

impl WindTurbine {
    pub fn new(owner: i64, max_power: f64, production_ratio: f64, break_down_freq: f64) -> Self {
        Self {
            id: None,
            owner,
            current_power: 0.0,
            repair_time: 0.0,
            max_power: max_power.max(0.0),
            production_ratio: production_ratio.max(0.0),
            break_down_freq: break_down_freq.clamp(0.0, 1.0),
            broken: false,
        }
    }

    /// Fresh turbine with random parameters.
    pub fn generate<R: Rng + ?Sized>(owner: i64, rng: &mut R) -> Self {
        Self::new(
            owner,
            rng.gen_range(2.0..6.0),
            rng.gen_range(0.2..0.5),
            rng.gen_range(0.0..0.0005),
        )
    }

    pub fn current_power(&self) -> f64 {
        self.current_power
    }

    pub fn max_power(&self) -> f64 {
        self.max_power
    }

    pub fn repair_time(&self) -> f64 {
        self.repair_time
    }

    pub fn break_down_freq(&self) -> f64 {
        self.break_down_freq
    }

    pub fn production_ratio(&self) -> f64 {
        self.production_ratio
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn status(&self) -> TurbineStatus {
        if self.broken {
            TurbineStatus::Broken
        } else {
            TurbineStatus::Operating
        }
    }

    /// Advance one tick at the given wind speed.
    pub fn update<R: Rng + ?Sized>(&mut self, tick: &Tick, wind_speed: f64, rng: &mut R) {
        if !self.broken {
            if rng.gen::<f64>() < self.break_down_freq {
                self.broken = true;
                self.repair_time = rng.gen_range(REPAIR_HOURS);
                self.current_power = 0.0;
                info!(owner = self.owner, repair_hours = self.repair_time, "wind turbine broke down");
                return;
            }
            self.current_power = (wind_speed * self.production_ratio)
                .max(0.0)
                .min(self.max_power);
            return;
        }

        self.current_power = 0.0;
        self.repair_time -= tick.delta_hours();
        if self.repair_time <= 0.0 {
            self.repair_time = 0.0;
            self.broken = false;
            debug!(owner = self.owner, "wind turbine repaired");
        }
    }

    pub fn to_row(&self) -> Row {
        let mut row = Row::new()
            .with("owner", self.owner)
            .with("current_power", self.current_power)
            .with("repair_time", self.repair_time)
            .with("max_power", self.max_power)
            .with("production_ratio", self.production_ratio)
            .with("break_down_freq", self.break_down_freq)
            .with("broken", self.broken);
        if let Some(id) = self.id {
            row.set("id", id);
        }
        row
    }

    pub fn from_row(row: &Row) -> Result<Self, StorageError> {
        let max_power = row.f64("max_power")?.max(0.0);
        let broken = row.bool("broken")?;
        let current_power = if broken {
            0.0
        } else {
            row.f64("current_power")?.max(0.0).min(max_power)
        };
        Ok(Self {
            id: row.opt_i64("id")?,
            owner: row.i64("owner")?,
            current_power,
            repair_time: row.f64("repair_time")?.max(0.0),
            max_power,
            production_ratio: row.f64("production_ratio")?,
            break_down_freq: row.f64("break_down_freq")?.clamp(0.0, 1.0),
            broken,
        })
    }

    /// Insert as a new row and take the generated id.
    pub async fn insert(&mut self, grid: &dyn Storage) -> SimResult<()> {
        self.id = Some(grid.insert(tables::WIND_TURBINE, self.to_row()).await?);
        Ok(())
    }

    pub async fn store(&self, grid: &dyn Storage) -> Result<(), StorageError> {
        grid.insert_or_update(tables::WIND_TURBINE, self.to_row(), &["owner"])
            .await
    }

    pub async fn load(grid: &dyn Storage, owner: i64) -> SimResult<Self> {
        let rows = grid
            .select(
                tables::WIND_TURBINE,
                &Select::all().filter(Condition::eq("owner", owner)).limit(1),
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| SimError::not_found("wind turbine", owner))?;
        Ok(Self::from_row(row)?)
    }
}
