//! # Power Plant
//!
//! Deterministic producer feeding its own [`Market`]. Output oscillates
//! around a base level with a sinusoid of simulated hours.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::clock::Tick;
use super::market::{Market, Sellable};
use crate::error::{SimError, SimResult};
use crate::repo::{tables, Condition, Order, Row, Select, Storage, StorageError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerPlant {
    pub id: Option<i64>,
    pub owner: i64,
    production_level: f64,
    max_production: f64,
    production_variant: f64,
    /// Share of the production routed to the market.
    production_ratio: f64,
    market: Market,
    time: DateTime<Utc>,
}

/// Simulated hours since the Unix epoch.
fn epoch_hours(t: DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 3_600_000.0
}

impl PowerPlant {
    pub fn new(
        owner: i64,
        production_level: f64,
        max_production: f64,
        production_variant: f64,
        production_ratio: f64,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            owner,
            production_level,
            max_production,
            production_variant,
            production_ratio: production_ratio.clamp(0.0, 1.0),
            market: Market::default(),
            time,
        }
    }

    /// Random parameters with `level ± variant` kept inside `[0, max]`.
    pub fn generate<R: Rng + ?Sized>(owner: i64, time: DateTime<Utc>, rng: &mut R) -> Self {
        let max_production = rng.gen_range(500.0..1000.0);
        let production_level = rng.gen_range(0.5..0.8) * max_production;
        let production_variant = rng.gen_range(0.05..0.15) * max_production;
        let production_ratio = rng.gen_range(0.5..=1.0);
        Self::new(
            owner,
            production_level,
            max_production,
            production_variant,
            production_ratio,
            time,
        )
    }

    pub fn production_level(&self) -> f64 {
        self.production_level
    }

    pub fn max_production(&self) -> f64 {
        self.max_production
    }

    pub fn production_variant(&self) -> f64 {
        self.production_variant
    }

    pub fn production_ratio(&self) -> f64 {
        self.production_ratio
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn market(&self) -> &Market {
        &self.market
    }

    pub fn market_mut(&mut self) -> &mut Market {
        &mut self.market
    }

    pub fn sim_production(&self, t: DateTime<Utc>) -> f64 {
        self.production_level + epoch_hours(t).sin() * self.production_variant
    }

    /// Amount routed to the market at `t`.
    pub fn production(&self, t: DateTime<Utc>) -> f64 {
        self.sim_production(t) * self.production_ratio
    }

    /// Undiscounted output at `t`.
    pub fn total_production(&self, t: DateTime<Utc>) -> f64 {
        self.sim_production(t)
    }

    pub fn update(&mut self, tick: &Tick) {
        self.time = tick.time;
        let produced = self.production(tick.time);
        self.market.sell(produced);
        trace!(owner = self.owner, produced, "power plant sold production");
    }

    pub fn to_row(&self) -> Row {
        let mut row = Row::new()
            .with("owner", self.owner)
            .with("production_level", self.production_level)
            .with("max_production", self.max_production)
            .with("production_variant", self.production_variant)
            .with("production_ratio", self.production_ratio)
            .with("price", self.market.price())
            .with("suggested_price", self.market.suggested_price())
            .with("time", self.time);
        if let Some(id) = self.id {
            row.set("id", id);
        }
        row
    }

    pub fn from_row(row: &Row) -> Result<Self, StorageError> {
        let market = Market::new(row.f64("price")?)
            .with_suggested_price(row.f64("suggested_price")?);
        Ok(Self {
            id: row.opt_i64("id")?,
            owner: row.i64("owner")?,
            production_level: row.f64("production_level")?,
            max_production: row.f64("max_production")?,
            production_variant: row.f64("production_variant")?,
            production_ratio: row.f64("production_ratio")?.clamp(0.0, 1.0),
            market,
            time: row.time("time")?,
        })
    }

    /// Insert as a new row and take the generated id.
    pub async fn insert(&mut self, grid: &dyn Storage) -> SimResult<()> {
        self.id = Some(grid.insert(tables::POWER_PLANT, self.to_row()).await?);
        Ok(())
    }

    pub async fn store(&self, grid: &dyn Storage) -> Result<(), StorageError> {
        grid.insert_or_update(tables::POWER_PLANT, self.to_row(), &["owner"])
            .await
    }

    pub async fn load(grid: &dyn Storage, owner: i64) -> SimResult<Self> {
        Self::load_one(grid, Condition::eq("owner", owner), owner).await
    }

    pub async fn load_by_id(grid: &dyn Storage, id: i64) -> SimResult<Self> {
        Self::load_one(grid, Condition::eq("id", id), id).await
    }

    async fn load_one(grid: &dyn Storage, condition: Condition, key: i64) -> SimResult<Self> {
        let rows = grid
            .select(tables::POWER_PLANT, &Select::all().filter(condition).limit(1))
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| SimError::not_found("power plant", key))?;
        Ok(Self::from_row(row)?)
    }

    pub async fn load_all(grid: &dyn Storage) -> Result<Vec<Self>, StorageError> {
        grid.select(tables::POWER_PLANT, &Select::all().order_by("id", Order::Asc))
            .await?
            .iter()
            .map(Self::from_row)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::MemoryStorage;
    use chrono::{Duration, TimeZone};
    use rand::{rngs::StdRng, SeedableRng};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn plant() -> PowerPlant {
        PowerPlant::new(1, 600.0, 1000.0, 100.0, 0.5, t0())
    }

    #[test]
    fn test_production_follows_sinusoid() {
        let plant = plant();
        let t = t0();
        let expected = 600.0 + epoch_hours(t).sin() * 100.0;
        assert!((plant.sim_production(t) - expected).abs() < 1e-9);
        assert!((plant.total_production(t) - expected).abs() < 1e-9);
        assert!((plant.production(t) - expected * 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_generated_output_stays_within_capacity() {
        let mut rng = StdRng::seed_from_u64(21);
        for owner in 0..50 {
            let plant = PowerPlant::generate(owner, t0(), &mut rng);
            for h in 0..48 {
                let p = plant.sim_production(t0() + Duration::hours(h));
                assert!(p >= 0.0 && p <= plant.max_production());
            }
            assert!((0.5..=1.0).contains(&plant.production_ratio()));
        }
    }

    #[test]
    fn test_update_sells_into_market() {
        let mut plant = plant();
        let tick = Tick::new(t0() + Duration::hours(1), Duration::hours(1));
        plant.update(&tick);
        assert_eq!(plant.time(), tick.time);
        assert!((plant.market().power() - plant.production(tick.time)).abs() < 1e-9);
        assert_eq!(plant.market().actor_count(), 1);
    }

    #[tokio::test]
    async fn test_store_and_load_keeps_prices() {
        let grid = MemoryStorage::new("grid");
        let mut plant = plant();
        plant.insert(&grid).await.unwrap();
        plant.market_mut().set_price(55.0);
        plant.store(&grid).await.unwrap();

        let by_owner = PowerPlant::load(&grid, 1).await.unwrap();
        let by_id = PowerPlant::load_by_id(&grid, plant.id.unwrap()).await.unwrap();
        assert_eq!(by_owner, plant);
        assert_eq!(by_id, plant);
        assert_eq!(by_owner.market().price(), 55.0);
        assert_eq!(PowerPlant::load_all(&grid).await.unwrap().len(), 1);
        assert!(matches!(
            PowerPlant::load(&grid, 2).await,
            Err(SimError::NotFound { .. })
        ));
    }
}
