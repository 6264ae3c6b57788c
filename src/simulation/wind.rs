//! # Wind Model
//!
//! Two-level generative wind series shared by every turbine:
//!
//! - a **seasonal envelope** of per-day maxima, regenerated each year
//! - a **diurnal profile** of 24 hourly speeds, regenerated each day and
//!   persisted to `climate.wind_data`
//!
//! Speeds between recorded samples are linearly interpolated.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use futures::future::try_join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::clock::Tick;
use super::profile::{day_index, days_in_year, diurnal_profile, seasonal_envelope, HOURS_PER_DAY};
use crate::error::{SimError, SimResult};
use crate::repo::{tables, Condition, Order, Row, Select, Storage, StorageError};

/// Older gaps are dropped when the model falls further behind than this.
pub const MAX_BACKFILL_HOURS: i64 = 72;

pub const DEFAULT_UNIT: &str = "m/s";

/// One recorded hourly speed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindSample {
    pub time: DateTime<Utc>,
    pub speed: f64,
}

impl WindSample {
    fn from_row(row: &Row) -> Result<Self, StorageError> {
        Ok(Self {
            time: row.time("time")?,
            speed: row.f64("speed")?,
        })
    }
}

/// Linear interpolation between two samples. `t` outside `[a, b]` is
/// clamped to the nearest end.
pub fn interpolate(a: &WindSample, b: &WindSample, t: DateTime<Utc>) -> f64 {
    let span = (b.time - a.time).num_milliseconds() as f64;
    if span <= 0.0 {
        return a.speed;
    }
    let offset = ((t - a.time).num_milliseconds() as f64 / span).clamp(0.0, 1.0);
    a.speed + (b.speed - a.speed) * offset
}

fn midnight(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

/// Width of the diurnal bell in hours, scaled from the seasonal width in days.
fn diurnal_width(stdev: f64, year: i32) -> f64 {
    stdev * HOURS_PER_DAY as f64 / days_in_year(year) as f64
}

fn day_profile<R: Rng + ?Sized>(maxima: &[f64], stdev: f64, day: NaiveDate, rng: &mut R) -> Vec<f64> {
    let day_max = maxima.get(day_index(day)).copied().unwrap_or(0.0);
    diurnal_profile(day_max, diurnal_width(stdev, day.year()), rng)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wind {
    pub id: Option<i64>,
    max: f64,
    stdev: f64,
    unit: String,
    /// Tick time the model has been advanced to.
    time: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    daily_maxima: Vec<f64>,
    hourly_speeds: Vec<f64>,
}

impl Wind {
    /// Fresh model with random parameters, inserted into `climate` together
    /// with the current day's samples.
    pub async fn generate<R: Rng + Send + ?Sized>(
        climate: &dyn Storage,
        time: DateTime<Utc>,
        rng: &mut R,
    ) -> SimResult<Self> {
        let max = rng.gen_range(5.0..15.0);
        let stdev = rng.gen_range(60.0..150.0);
        let mut wind = Self::with_params(max, stdev, time, rng);

        wind.id = Some(climate.insert(tables::WIND, wind.to_row()).await?);
        wind.persist_day(climate, time.date_naive(), &wind.hourly_speeds)
            .await?;
        info!(id = ?wind.id, max, stdev, %time, "generated wind model");
        Ok(wind)
    }

    /// Unpersisted model built from explicit parameters.
    pub fn with_params<R: Rng + ?Sized>(max: f64, stdev: f64, time: DateTime<Utc>, rng: &mut R) -> Self {
        let year = time.year();
        let daily_maxima = seasonal_envelope(year, max, stdev, rng);
        let day_max = daily_maxima
            .get(day_index(time.date_naive()))
            .copied()
            .unwrap_or(0.0);
        let hourly_speeds = diurnal_profile(day_max, diurnal_width(stdev, year), rng);
        let now = Utc::now();
        Self {
            id: None,
            max,
            stdev,
            unit: DEFAULT_UNIT.to_string(),
            time,
            created_at: now,
            updated_at: now,
            daily_maxima,
            hourly_speeds,
        }
    }

    /// Rebuild the newest persisted model. Fails with `NotFound` on an empty
    /// schema.
    pub async fn restore<R: Rng + Send + ?Sized>(climate: &dyn Storage, rng: &mut R) -> SimResult<Self> {
        let rows = climate
            .select(tables::WIND, &Select::all().order_by("id", Order::Desc).limit(1))
            .await?;
        let row = rows.first().ok_or_else(|| SimError::not_found("wind", "latest"))?;
        let mut wind = Self::from_row(row)?;

        let year = wind.time.year();
        if wind.daily_maxima.len() != days_in_year(year) {
            warn!(
                id = ?wind.id,
                stored = wind.daily_maxima.len(),
                year,
                "persisted daily maxima do not match the year, regenerating"
            );
            wind.daily_maxima = seasonal_envelope(year, wind.max, wind.stdev, rng);
        }

        let day = wind.time.date_naive();
        let samples = wind.day_samples(climate, day).await?;
        if samples.len() == HOURS_PER_DAY {
            wind.hourly_speeds = samples.iter().map(|s| s.speed).collect();
        } else {
            debug!(id = ?wind.id, found = samples.len(), %day, "incomplete day, regenerating");
            let speeds = wind.day_profile(day, rng);
            wind.persist_day(climate, day, &speeds).await?;
            wind.hourly_speeds = speeds;
        }

        info!(id = ?wind.id, time = %wind.time, "restored wind model");
        Ok(wind)
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn stdev(&self) -> f64 {
        self.stdev
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn daily_maxima(&self) -> &[f64] {
        &self.daily_maxima
    }

    /// The current day's 24 hourly speeds.
    pub fn hourly_speeds(&self) -> &[f64] {
        &self.hourly_speeds
    }

    fn day_profile<R: Rng + ?Sized>(&self, day: NaiveDate, rng: &mut R) -> Vec<f64> {
        day_profile(&self.daily_maxima, self.stdev, day, rng)
    }

    /// Advance to the tick time, generating and persisting every day
    /// boundary crossed. Nothing changes unless every new day is stored, so
    /// a failed write is retried on the next tick.
    pub async fn update<R: Rng + Send + ?Sized>(
        &mut self,
        climate: &dyn Storage,
        tick: &Tick,
        rng: &mut R,
    ) -> SimResult<()> {
        if tick.time <= self.time {
            return Ok(());
        }
        let target = tick.time;
        let hours = (target - self.time).num_hours();
        let mut from = self.time;
        if hours > MAX_BACKFILL_HOURS {
            warn!(
                behind_hours = hours,
                kept_hours = MAX_BACKFILL_HOURS,
                "wind model fell behind, dropping older gap"
            );
            from = target - Duration::hours(MAX_BACKFILL_HOURS);
        }

        let current = self.time.date_naive();
        let mut envelope_year = current.year();
        let mut envelope: Option<Vec<f64>> = None;
        let mut day = from.date_naive().max(current.succ_opt().unwrap_or(current));
        let mut generated = Vec::new();
        while day <= target.date_naive() && day > current {
            if day.year() != envelope_year {
                envelope_year = day.year();
                envelope = Some(seasonal_envelope(envelope_year, self.max, self.stdev, rng));
                info!(year = envelope_year, "regenerated seasonal envelope");
            }
            let maxima = envelope.as_deref().unwrap_or(&self.daily_maxima);
            generated.push((day, day_profile(maxima, self.stdev, day, rng)));
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }

        for (day, speeds) in &generated {
            self.persist_day(climate, *day, speeds).await?;
        }

        self.time = target;
        self.updated_at = Utc::now();
        if let Some(maxima) = envelope {
            self.daily_maxima = maxima;
        }
        if let Some((_, speeds)) = generated.pop() {
            debug!(days = generated.len() + 1, time = %self.time, "wind days generated");
            self.hourly_speeds = speeds;
        }
        Ok(())
    }

    async fn persist_day(
        &self,
        climate: &dyn Storage,
        day: NaiveDate,
        speeds: &[f64],
    ) -> Result<(), StorageError> {
        let Some(wind_id) = self.id else {
            return Ok(());
        };
        let start = midnight(day);
        try_join_all(speeds.iter().enumerate().map(|(hour, speed)| {
            let row = Row::new()
                .with("wind_id", wind_id)
                .with("time", start + Duration::hours(hour as i64))
                .with("speed", *speed);
            climate.insert_or_update(tables::WIND_DATA, row, &["wind_id", "time"])
        }))
        .await?;
        Ok(())
    }

    async fn day_samples(&self, climate: &dyn Storage, day: NaiveDate) -> Result<Vec<WindSample>, StorageError> {
        let start = midnight(day);
        self.history(climate, start, start + Duration::hours(HOURS_PER_DAY as i64 - 1))
            .await
    }

    /// Recorded samples in `[from, to]`, oldest first.
    pub async fn history(
        &self,
        climate: &dyn Storage,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<WindSample>, StorageError> {
        let Some(wind_id) = self.id else {
            return Ok(Vec::new());
        };
        let query = Select::all()
            .columns(&["time", "speed"])
            .filter(Condition::eq("wind_id", wind_id))
            .filter(Condition::ge("time", from))
            .filter(Condition::le("time", to))
            .order_by("time", Order::Asc);
        climate
            .select(tables::WIND_DATA, &query)
            .await?
            .iter()
            .map(WindSample::from_row)
            .collect()
    }

    /// Speed at `t` from the nearest samples on either side.
    pub async fn speed_at(&self, climate: &dyn Storage, t: DateTime<Utc>) -> SimResult<f64> {
        let Some(wind_id) = self.id else {
            return Err(SimError::NotRecorded { time: t });
        };
        let nearest = |condition: Condition, order: Order| {
            Select::all()
                .columns(&["time", "speed"])
                .filter(Condition::eq("wind_id", wind_id))
                .filter(condition)
                .order_by("time", order)
                .limit(1)
        };
        let before = climate
            .select(tables::WIND_DATA, &nearest(Condition::le("time", t), Order::Desc))
            .await?;
        let after = climate
            .select(tables::WIND_DATA, &nearest(Condition::gt("time", t), Order::Asc))
            .await?;

        let before = before.first().map(WindSample::from_row).transpose()?;
        let after = after.first().map(WindSample::from_row).transpose()?;
        match (before, after) {
            (Some(a), Some(b)) => Ok(interpolate(&a, &b, t)),
            (Some(only), None) | (None, Some(only)) => Ok(only.speed),
            (None, None) => Err(SimError::NotRecorded { time: t }),
        }
    }

    pub fn to_row(&self) -> Row {
        let mut row = Row::new()
            .with("max", self.max)
            .with("stdev", self.stdev)
            .with("unit", self.unit.as_str())
            .with("time", self.time)
            .with("daily_maxima", serde_json::Value::from(self.daily_maxima.clone()))
            .with("created_at", self.created_at)
            .with("updated_at", self.updated_at);
        if let Some(id) = self.id {
            row.set("id", id);
        }
        row
    }

    /// The hourly speeds are not part of the row; see [`Wind::restore`].
    pub fn from_row(row: &Row) -> Result<Self, StorageError> {
        let daily_maxima = match row.json("daily_maxima")? {
            Some(doc) => serde_json::from_value(doc).map_err(|_| StorageError::ColumnType {
                column: "daily_maxima".to_string(),
                expected: "array of numbers",
            })?,
            None => Vec::new(),
        };
        Ok(Self {
            id: row.opt_i64("id")?,
            max: row.f64("max")?,
            stdev: row.f64("stdev")?,
            unit: row.text("unit").unwrap_or_else(|_| DEFAULT_UNIT.to_string()),
            time: row.time("time")?,
            created_at: row.time("created_at")?,
            updated_at: row.time("updated_at")?,
            daily_maxima,
            hourly_speeds: Vec::new(),
        })
    }

    pub async fn store(&self, climate: &dyn Storage) -> Result<(), StorageError> {
        match self.id {
            Some(_) => climate.insert_or_update(tables::WIND, self.to_row(), &["id"]).await,
            None => climate.insert(tables::WIND, self.to_row()).await.map(|_| ()),
        }
    }
}
