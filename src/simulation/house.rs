//! # Prosumer House
//!
//! A household with an optional wind turbine, an optional battery and an
//! optional link to the power plant it trades with.
//!
//! ## Per-tick order
//!
//! 1. turbine update, giving this tick's production
//! 2. consumption from a bell curve centred on noon
//! 3. the battery absorbs surplus or covers deficit
//!
//! Whatever the battery cannot absorb or cover is left in [`House::net`].

use chrono::{DateTime, Timelike, Utc};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::battery::{Battery, Chargeable};
use super::clock::Tick;
use super::profile::gaussian;
use super::turbine::WindTurbine;
use crate::error::{SimError, SimResult};
use crate::repo::{tables, Condition, Order, Row, Select, Storage, StorageError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct House {
    pub id: Option<i64>,
    pub owner: i64,
    charge_ratio: f64,
    consume_ratio: f64,
    consumption_max: f64,
    consumption_stdev: f64,
    battery: Option<Battery>,
    turbine: Option<WindTurbine>,
    /// Id of the linked power plant row.
    power_plant: Option<i64>,
    production: f64,
    consumption: f64,
    net: f64,
}

/// Fractional hour of the day, e.g. 13.5 for 13:30.
fn hour_of_day(t: DateTime<Utc>) -> f64 {
    f64::from(t.num_seconds_from_midnight()) / 3600.0
}

impl House {
    pub fn new(owner: i64, consumption_max: f64, consumption_stdev: f64) -> Self {
        Self {
            id: None,
            owner,
            charge_ratio: 1.0,
            consume_ratio: 1.0,
            consumption_max: consumption_max.max(0.0),
            consumption_stdev: consumption_stdev.max(0.0),
            battery: None,
            turbine: None,
            power_plant: None,
            production: 0.0,
            consumption: 0.0,
            net: 0.0,
        }
    }

    pub fn with_battery(mut self, battery: Battery) -> Self {
        self.battery = Some(battery);
        self
    }

    pub fn with_turbine(mut self, turbine: WindTurbine) -> Self {
        self.turbine = Some(turbine);
        self
    }

    pub fn with_power_plant(mut self, power_plant: Option<i64>) -> Self {
        self.power_plant = power_plant;
        self
    }

    /// Random household with a turbine and a half-charged battery.
    pub fn generate<R: Rng + ?Sized>(owner: i64, rng: &mut R) -> Self {
        let consumption_max = Normal::new(3.0_f64, 0.75)
            .map(|n| n.sample(rng))
            .unwrap_or(3.0)
            .max(0.5);
        let consumption_stdev = rng.gen_range(2.0..5.0);
        let capacity = rng.gen_range(5.0..15.0);

        let mut house = Self::new(owner, consumption_max, consumption_stdev)
            .with_battery(Battery::new(owner, capacity, capacity * 0.5))
            .with_turbine(WindTurbine::generate(owner, rng));
        house.set_ratios(rng.gen_range(0.3..=1.0), rng.gen_range(0.3..=1.0));
        house
    }

    pub fn charge_ratio(&self) -> f64 {
        self.charge_ratio
    }

    pub fn consume_ratio(&self) -> f64 {
        self.consume_ratio
    }

    pub fn consumption_max(&self) -> f64 {
        self.consumption_max
    }

    pub fn consumption_stdev(&self) -> f64 {
        self.consumption_stdev
    }

    pub fn battery(&self) -> Option<&Battery> {
        self.battery.as_ref()
    }

    pub fn turbine(&self) -> Option<&WindTurbine> {
        self.turbine.as_ref()
    }

    pub fn power_plant(&self) -> Option<i64> {
        self.power_plant
    }

    pub fn link_power_plant(&mut self, power_plant: Option<i64>) {
        self.power_plant = power_plant;
    }

    /// Production of the last tick.
    pub fn production(&self) -> f64 {
        self.production
    }

    /// Consumption of the last tick.
    pub fn consumption(&self) -> f64 {
        self.consumption
    }

    /// Residual of the last tick after the battery: positive is an unmet
    /// deficit, negative a surplus the battery could not take.
    pub fn net(&self) -> f64 {
        self.net
    }

    /// Prosumer settings. Both ratios are clamped to `[0, 1]`.
    pub fn set_ratios(&mut self, charge: f64, consume: f64) {
        self.charge_ratio = charge.clamp(0.0, 1.0);
        self.consume_ratio = consume.clamp(0.0, 1.0);
    }

    /// Consumption at `t`, independent of the wind.
    pub fn consumption_at(&self, t: DateTime<Utc>) -> f64 {
        gaussian(
            hour_of_day(t) - 12.0,
            self.consumption_max,
            0.0,
            self.consumption_stdev,
        )
    }

    pub fn update<R: Rng + ?Sized>(&mut self, tick: &Tick, wind_speed: f64, rng: &mut R) {
        self.production = match self.turbine.as_mut() {
            Some(turbine) => {
                turbine.update(tick, wind_speed, rng);
                turbine.current_power()
            }
            None => 0.0,
        };
        self.consumption = self.consumption_at(tick.time);

        let balance = self.production - self.consumption;
        // TODO: sell the surplus to / buy the deficit from the linked plant's market.
        self.net = match self.battery.as_mut() {
            Some(battery) if balance > 0.0 => -battery.charge(balance, self.charge_ratio),
            Some(battery) if balance < 0.0 => battery.consume(-balance, self.consume_ratio),
            _ => -balance,
        };
        trace!(
            owner = self.owner,
            production = self.production,
            consumption = self.consumption,
            net = self.net,
            "house updated"
        );
    }

    pub fn to_row(&self) -> Row {
        let mut row = Row::new()
            .with("owner", self.owner)
            .with("charge_ratio", self.charge_ratio)
            .with("consume_ratio", self.consume_ratio)
            .with("consumption_max", self.consumption_max)
            .with("consumption_stdev", self.consumption_stdev)
            .with("battery_capacity", self.battery.as_ref().map(Battery::capacity))
            .with("battery_value", self.battery.as_ref().map(Battery::value))
            .with("power_plant", self.power_plant);
        if let Some(id) = self.id {
            row.set("id", id);
        }
        row
    }

    /// Rebuild the house itself; the turbine is attached by [`House::load`].
    pub fn from_row(row: &Row) -> Result<Self, StorageError> {
        let owner = row.i64("owner")?;
        let battery = match row.opt_f64("battery_capacity")? {
            Some(capacity) => Some(Battery::new(
                owner,
                capacity,
                row.opt_f64("battery_value")?.unwrap_or(0.0),
            )),
            None => None,
        };
        let mut house = Self::new(owner, row.f64("consumption_max")?, row.f64("consumption_stdev")?)
            .with_power_plant(row.opt_i64("power_plant")?);
        house.id = row.opt_i64("id")?;
        house.battery = battery;
        house.set_ratios(row.f64("charge_ratio")?, row.f64("consume_ratio")?);
        Ok(house)
    }

    /// Attach the owner's turbine if one is stored.
    async fn attach_turbine(&mut self, grid: &dyn Storage) -> SimResult<()> {
        match WindTurbine::load(grid, self.owner).await {
            Ok(turbine) => self.turbine = Some(turbine),
            Err(SimError::NotFound { .. }) => {
                debug!(owner = self.owner, "house has no wind turbine");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    pub async fn load(grid: &dyn Storage, owner: i64) -> SimResult<Self> {
        let rows = grid
            .select(
                tables::HOUSE,
                &Select::all().filter(Condition::eq("owner", owner)).limit(1),
            )
            .await?;
        let row = rows.first().ok_or_else(|| SimError::not_found("house", owner))?;
        let mut house = Self::from_row(row)?;
        house.attach_turbine(grid).await?;
        Ok(house)
    }

    pub async fn load_all(grid: &dyn Storage) -> SimResult<Vec<Self>> {
        let rows = grid
            .select(tables::HOUSE, &Select::all().order_by("id", Order::Asc))
            .await?;
        let mut houses = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut house = Self::from_row(row)?;
            house.attach_turbine(grid).await?;
            houses.push(house);
        }
        Ok(houses)
    }

    /// Insert the house and its turbine as new rows.
    pub async fn insert(&mut self, grid: &dyn Storage) -> SimResult<()> {
        self.id = Some(grid.insert(tables::HOUSE, self.to_row()).await?);
        if let Some(turbine) = self.turbine.as_mut() {
            turbine.insert(grid).await?;
        }
        Ok(())
    }

    pub async fn store(&self, grid: &dyn Storage) -> Result<(), StorageError> {
        grid.insert_or_update(tables::HOUSE, self.to_row(), &["owner"])
            .await?;
        if let Some(turbine) = &self.turbine {
            turbine.store(grid).await?;
        }
        Ok(())
    }
}
