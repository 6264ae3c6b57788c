use anyhow::Result;
use chrono::{DateTime, Utc};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::time::Duration;
use strum::Display;
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub simulation: SimulationConfig,
    #[validate(nested)]
    pub storage: StorageConfig,
}

/// Timing of the step and checkpoint tasks and of the simulated clock.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct SimulationConfig {
    /// Interval between steps.
    #[validate(range(min = 1))]
    pub delta_time_ms: u64,
    /// Interval between checkpoints, independent of stepping.
    #[validate(range(min = 1))]
    pub checkpoint_delta_time_ms: u64,
    /// Mirror wall-clock time instead of adding `delta_time_ms` per step.
    pub real_time: bool,
    /// Simulated start time; defaults to now.
    pub start_time: Option<DateTime<Utc>>,
    /// Optional bound on simulated lifetime.
    pub lifetime_ms: Option<u64>,
    /// Seed for every random draw; entropy when absent.
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            delta_time_ms: 1_000,
            checkpoint_delta_time_ms: 600_000,
            real_time: false,
            start_time: None,
            lifetime_ms: None,
            seed: None,
        }
    }
}

impl SimulationConfig {
    pub fn delta_time(&self) -> Duration {
        Duration::from_millis(self.delta_time_ms.max(1))
    }

    pub fn checkpoint_delta_time(&self) -> Duration {
        Duration::from_millis(self.checkpoint_delta_time_ms.max(1))
    }

    pub fn lifetime(&self) -> Option<chrono::Duration> {
        self.lifetime_ms
            .and_then(|ms| i64::try_from(ms).ok())
            .map(chrono::Duration::milliseconds)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_storage"))]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub climate_url: String,
    pub grid_url: String,
    #[validate(range(min = 1))]
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            climate_url: String::new(),
            grid_url: String::new(),
            max_connections: 10,
        }
    }
}

fn validate_storage(cfg: &StorageConfig) -> Result<(), ValidationError> {
    if cfg.backend == StorageBackend::Postgres
        && (cfg.climate_url.is_empty() || cfg.grid_url.is_empty())
    {
        return Err(ValidationError::new("postgres_urls_required"));
    }
    Ok(())
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("GRID__").split("__"));
        let cfg: Config = figment.extract()?;
        cfg.validate()?;
        Ok(cfg)
    }
}
