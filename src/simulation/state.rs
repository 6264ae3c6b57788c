//! Aggregate simulation state: one wind model plus every house and power
//! plant, advanced together once per tick and checkpointed as a whole.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, FutureExt};
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::clock::Tick;
use super::house::House;
use super::power_plant::PowerPlant;
use super::wind::{Wind, WindSample};
use crate::error::{SimError, SimResult};
use crate::repo::{Repositories, StorageError};

pub struct SimulationState {
    repos: Repositories,
    wind: Wind,
    /// Keyed by owner. Ordered maps keep iteration, and with it every
    /// seeded draw, the same from run to run.
    houses: BTreeMap<i64, House>,
    power_plants: BTreeMap<i64, PowerPlant>,
    rng: StdRng,
    time: DateTime<Utc>,
}

/// Outcome of one checkpoint pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckpointReport {
    pub written: usize,
    pub failed: usize,
}

impl CheckpointReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Entity state cloned under the state lock, written after it is released.
pub struct Snapshot {
    repos: Repositories,
    wind: Wind,
    houses: Vec<House>,
    power_plants: Vec<PowerPlant>,
}

impl Snapshot {
    /// Write every entity concurrently. Failures are logged and counted.
    pub async fn write(self) -> CheckpointReport {
        let Snapshot {
            repos,
            wind,
            houses,
            power_plants,
        } = self;
        let climate = repos.climate.as_ref();
        let grid = repos.grid.as_ref();

        let mut writes: Vec<(String, BoxFuture<'_, Result<(), StorageError>>)> =
            Vec::with_capacity(1 + houses.len() + power_plants.len());
        writes.push(("wind".to_string(), wind.store(climate).boxed()));
        for plant in &power_plants {
            writes.push((format!("power_plant:{}", plant.owner), plant.store(grid).boxed()));
        }
        for house in &houses {
            writes.push((format!("house:{}", house.owner), house.store(grid).boxed()));
        }

        let (entities, futures): (Vec<_>, Vec<_>) = writes.into_iter().unzip();
        let results = join_all(futures).await;

        let mut report = CheckpointReport::default();
        for (entity, result) in entities.iter().zip(results) {
            match result {
                Ok(()) => report.written += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(entity = %entity, error = %e, "checkpoint write failed");
                }
            }
        }
        report
    }
}

/// Totals at the current simulated time, for dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GridSummary {
    pub time: DateTime<Utc>,
    pub houses: usize,
    pub power_plants: usize,
    pub house_production: f64,
    pub plant_production: f64,
    pub consumption: f64,
    pub battery_charge: f64,
    pub battery_capacity: f64,
}

impl SimulationState {
    /// Fresh wind model and no houses or plants.
    pub async fn generate(repos: Repositories, time: DateTime<Utc>, mut rng: StdRng) -> SimResult<Self> {
        let wind = Wind::generate(repos.climate.as_ref(), time, &mut rng).await?;
        info!(%time, "generated simulation state");
        Ok(Self {
            repos,
            wind,
            houses: BTreeMap::new(),
            power_plants: BTreeMap::new(),
            rng,
            time,
        })
    }

    /// Rebuild from the last checkpoint. Simulated time resumes at the wind
    /// model's time, which is the tick time of the last checkpoint.
    pub async fn restore(repos: Repositories, mut rng: StdRng) -> SimResult<Self> {
        let wind = Wind::restore(repos.climate.as_ref(), &mut rng).await?;
        let grid = repos.grid.as_ref();

        let power_plants: BTreeMap<i64, PowerPlant> = PowerPlant::load_all(grid)
            .await?
            .into_iter()
            .map(|p| (p.owner, p))
            .collect();
        let plant_ids: HashSet<i64> = power_plants.values().filter_map(|p| p.id).collect();

        let mut houses = BTreeMap::new();
        for house in House::load_all(grid).await? {
            if let Some(link) = house.power_plant() {
                if !plant_ids.contains(&link) {
                    warn!(owner = house.owner, power_plant = link, "house links to a missing power plant");
                }
            }
            houses.insert(house.owner, house);
        }

        let time = wind.time();
        info!(
            %time,
            houses = houses.len(),
            power_plants = power_plants.len(),
            "restored simulation state"
        );
        Ok(Self {
            repos,
            wind,
            houses,
            power_plants,
            rng,
            time,
        })
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn repos(&self) -> &Repositories {
        &self.repos
    }

    pub fn wind(&self) -> &Wind {
        &self.wind
    }

    pub fn houses(&self) -> impl Iterator<Item = &House> {
        self.houses.values()
    }

    pub fn power_plants(&self) -> impl Iterator<Item = &PowerPlant> {
        self.power_plants.values()
    }

    /// One tick: wind, then plants, then houses, then markets.
    ///
    /// Storage failures are logged and the tick carries on.
    pub async fn update(&mut self, tick: &Tick) {
        let climate = self.repos.climate.as_ref();
        if let Err(e) = self.wind.update(climate, tick, &mut self.rng).await {
            warn!(error = %e, time = %tick.time, "wind update failed");
        }

        let wind_speed = match self.wind.speed_at(climate, tick.time).await {
            Ok(speed) => speed,
            Err(SimError::NotRecorded { .. }) => {
                debug!(time = %tick.time, "no wind recorded, assuming calm");
                0.0
            }
            Err(e) => {
                warn!(error = %e, time = %tick.time, "wind speed lookup failed");
                0.0
            }
        };

        for plant in self.power_plants.values_mut() {
            plant.update(tick);
        }
        for house in self.houses.values_mut() {
            house.update(tick, wind_speed, &mut self.rng);
        }
        for plant in self.power_plants.values_mut() {
            plant.market_mut().update();
        }
        self.time = tick.time;
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            repos: self.repos.clone(),
            wind: self.wind.clone(),
            houses: self.houses.values().cloned().collect(),
            power_plants: self.power_plants.values().cloned().collect(),
        }
    }

    pub async fn store(&self) -> CheckpointReport {
        self.snapshot().write().await
    }

    /// Cached house of `owner`, loaded from storage on a miss.
    pub async fn house(&mut self, owner: i64) -> SimResult<&mut House> {
        if !self.houses.contains_key(&owner) {
            let house = House::load(self.repos.grid.as_ref(), owner).await?;
            self.houses.insert(owner, house);
        }
        self.houses
            .get_mut(&owner)
            .ok_or_else(|| SimError::not_found("house", owner))
    }

    /// Cached power plant of `owner`, loaded from storage on a miss.
    pub async fn power_plant(&mut self, owner: i64) -> SimResult<&mut PowerPlant> {
        if !self.power_plants.contains_key(&owner) {
            let plant = PowerPlant::load(self.repos.grid.as_ref(), owner).await?;
            self.power_plants.insert(owner, plant);
        }
        self.power_plants
            .get_mut(&owner)
            .ok_or_else(|| SimError::not_found("power plant", owner))
    }

    /// A uniformly random plant, if any.
    pub fn nearest_power_plant(&mut self) -> Option<&PowerPlant> {
        self.power_plants.values().choose(&mut self.rng)
    }

    /// Existing house of `owner`, or a new one linked to a random plant.
    pub async fn register_house(&mut self, owner: i64) -> SimResult<&mut House> {
        match self.house(owner).await {
            Ok(_) => {}
            Err(SimError::NotFound { .. }) => {
                let link = self.nearest_power_plant().and_then(|p| p.id);
                let mut house = House::generate(owner, &mut self.rng).with_power_plant(link);
                house.insert(self.repos.grid.as_ref()).await?;
                info!(owner, id = ?house.id, power_plant = ?link, "registered house");
                self.houses.insert(owner, house);
            }
            Err(e) => return Err(e),
        }
        self.house(owner).await
    }

    /// Existing power plant of `owner`, or a new one.
    pub async fn register_power_plant(&mut self, owner: i64) -> SimResult<&mut PowerPlant> {
        match self.power_plant(owner).await {
            Ok(_) => {}
            Err(SimError::NotFound { .. }) => {
                let mut plant = PowerPlant::generate(owner, self.time, &mut self.rng);
                plant.insert(self.repos.grid.as_ref()).await?;
                info!(owner, id = ?plant.id, "registered power plant");
                self.power_plants.insert(owner, plant);
            }
            Err(e) => return Err(e),
        }
        self.power_plant(owner).await
    }

    pub async fn wind_speed(&self, t: DateTime<Utc>) -> SimResult<f64> {
        self.wind.speed_at(self.repos.climate.as_ref(), t).await
    }

    pub async fn wind_history(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> SimResult<Vec<WindSample>> {
        Ok(self.wind.history(self.repos.climate.as_ref(), from, to).await?)
    }

    pub fn summary(&self) -> GridSummary {
        let mut summary = GridSummary {
            time: self.time,
            houses: self.houses.len(),
            power_plants: self.power_plants.len(),
            house_production: 0.0,
            plant_production: 0.0,
            consumption: 0.0,
            battery_charge: 0.0,
            battery_capacity: 0.0,
        };
        for house in self.houses.values() {
            summary.house_production += house.production();
            summary.consumption += house.consumption();
            if let Some(battery) = house.battery() {
                summary.battery_charge += battery.value();
                summary.battery_capacity += battery.capacity();
            }
        }
        summary.plant_production = self
            .power_plants
            .values()
            .map(|p| p.total_production(self.time))
            .sum();
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{tables, MemoryStorage, Storage};
    use chrono::{Duration, TimeZone};
    use rand::SeedableRng;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 2, 6, 0, 0).unwrap()
    }

    fn repos() -> (Arc<MemoryStorage>, Arc<MemoryStorage>, Repositories) {
        let climate = Arc::new(MemoryStorage::new("climate"));
        let grid = Arc::new(MemoryStorage::new("grid"));
        let repos = Repositories::new(climate.clone(), grid.clone());
        (climate, grid, repos)
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let (_, grid, repos) = repos();
        let mut state = SimulationState::generate(repos, t0(), StdRng::seed_from_u64(1))
            .await
            .unwrap();
        assert!(state.nearest_power_plant().is_none());

        let plant_id = state.register_power_plant(100).await.unwrap().id;
        let house = state.register_house(1).await.unwrap();
        assert_eq!(house.power_plant(), plant_id);
        assert_eq!(grid.row_count(tables::HOUSE), 1);
        assert_eq!(grid.row_count(tables::WIND_TURBINE), 1);

        // Registering again returns the same house.
        let again = state.register_house(1).await.unwrap().id;
        assert_eq!(grid.row_count(tables::HOUSE), 1);
        assert!(again.is_some());

        assert!(matches!(
            state.house(42).await,
            Err(SimError::NotFound { .. })
        ));
        assert!(state.nearest_power_plant().is_some());
    }

    #[tokio::test]
    async fn test_update_advances_every_entity() {
        let (_, _, repos) = repos();
        let mut state = SimulationState::generate(repos, t0(), StdRng::seed_from_u64(2))
            .await
            .unwrap();
        state.register_power_plant(100).await.unwrap();
        state.register_house(1).await.unwrap();

        let tick = Tick::new(t0() + Duration::hours(6), Duration::hours(6));
        state.update(&tick).await;

        assert_eq!(state.time(), tick.time);
        let plant = state.power_plant(100).await.unwrap();
        assert_eq!(plant.time(), tick.time);
        // Ledger is cleared once the tick closes.
        assert_eq!(plant.market().actor_count(), 0);
        let summary = state.summary();
        assert_eq!(summary.houses, 1);
        assert!(summary.consumption > 0.0);
        assert!(summary.plant_production > 0.0);
    }

    #[tokio::test]
    async fn test_checkpoint_then_restore() {
        let (climate, grid, repos) = repos();
        let mut state = SimulationState::generate(repos.clone(), t0(), StdRng::seed_from_u64(3))
            .await
            .unwrap();
        state.register_power_plant(100).await.unwrap();
        state.register_house(1).await.unwrap();
        state.register_house(2).await.unwrap();
        state
            .update(&Tick::new(t0() + Duration::hours(2), Duration::hours(2)))
            .await;

        let report = state.store().await;
        assert_eq!(report, CheckpointReport { written: 4, failed: 0 });
        assert_eq!(climate.row_count(tables::WIND), 1);
        assert_eq!(grid.row_count(tables::HOUSE), 2);

        let mut restored = SimulationState::restore(repos, StdRng::seed_from_u64(4))
            .await
            .unwrap();
        assert_eq!(restored.time(), state.wind().time());
        assert_eq!(restored.houses().count(), 2);
        for owner in [1, 2] {
            let before = state.house(owner).await.unwrap().clone();
            let after = restored.house(owner).await.unwrap();
            assert_eq!(after.battery(), before.battery());
            assert_eq!(after.turbine(), before.turbine());
            assert_eq!(after.power_plant(), before.power_plant());
        }
        let plant = restored.power_plant(100).await.unwrap().clone();
        assert_eq!(plant, state.power_plant(100).await.unwrap().clone());
    }

    #[tokio::test]
    async fn test_checkpoint_counts_failures() {
        let (_, grid, repos) = repos();
        let mut state = SimulationState::generate(repos, t0(), StdRng::seed_from_u64(5))
            .await
            .unwrap();
        state.register_house(1).await.unwrap();
        grid.close().await.unwrap();

        let report = state.store().await;
        assert_eq!(report, CheckpointReport { written: 1, failed: 1 });
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn test_same_seed_same_run() {
        async fn run(seed: u64) -> (Vec<i64>, Vec<House>, Vec<PowerPlant>) {
            let mut state = SimulationState::generate(Repositories::in_memory(), t0(), StdRng::seed_from_u64(seed))
                .await
                .unwrap();
            for owner in 0..20 {
                state.register_power_plant(100 + owner).await.unwrap();
            }
            for owner in 1..=5 {
                state.register_house(owner).await.unwrap();
            }
            for minutes in 1..=30 {
                let tick = Tick::new(t0() + Duration::minutes(10 * minutes), Duration::minutes(10));
                state.update(&tick).await;
            }
            let picks = (0..50)
                .filter_map(|_| state.nearest_power_plant().map(|p| p.owner))
                .collect();
            (picks, state.houses().cloned().collect(), state.power_plants().cloned().collect())
        }

        let (picks_a, houses_a, plants_a) = run(7).await;
        let (picks_b, houses_b, plants_b) = run(7).await;
        assert_eq!(picks_a.len(), 50);
        assert_eq!(picks_a, picks_b);
        assert_eq!(houses_a, houses_b);
        assert_eq!(plants_a, plants_b);
    }

    #[tokio::test]
    async fn test_update_carries_on_without_climate_storage() {
        let (climate, _, repos) = repos();
        let mut state = SimulationState::generate(repos, t0(), StdRng::seed_from_u64(6))
            .await
            .unwrap();
        state.register_power_plant(100).await.unwrap();
        state.register_house(1).await.unwrap();
        climate.close().await.unwrap();

        let tick = Tick::new(t0() + Duration::hours(6), Duration::hours(6));
        state.update(&tick).await;

        assert_eq!(state.time(), tick.time);
        // Wind is unreadable, so the tick runs calm.
        assert!(state.wind_speed(tick.time).await.is_err());
        let house = state.house(1).await.unwrap();
        assert_eq!(house.production(), 0.0);
        assert!(house.consumption() > 0.0);
        let plant = state.power_plant(100).await.unwrap();
        assert_eq!(plant.time(), tick.time);
        assert_eq!(plant.market().actor_count(), 0);
    }

    #[tokio::test]
    async fn test_restore_resumes_mid_hour() {
        let (_, _, repos) = repos();
        let mut state = SimulationState::generate(repos.clone(), t0(), StdRng::seed_from_u64(8))
            .await
            .unwrap();
        let tick = Tick::new(t0() + Duration::minutes(90), Duration::minutes(90));
        state.update(&tick).await;
        assert!(state.store().await.is_complete());

        let restored = SimulationState::restore(repos, StdRng::seed_from_u64(9))
            .await
            .unwrap();
        assert_eq!(restored.time(), tick.time);
    }
}
