//! Simulated time bookkeeping.

use chrono::{DateTime, Duration, Utc};

/// One discrete advance of simulated time, handed to every entity update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Simulated time after the advance.
    pub time: DateTime<Utc>,
    /// Simulated time covered by this tick.
    pub delta: Duration,
}

impl Tick {
    pub fn new(time: DateTime<Utc>, delta: Duration) -> Self {
        Self { time, delta }
    }

    pub fn delta_hours(&self) -> f64 {
        self.delta.num_milliseconds() as f64 / 3_600_000.0
    }
}

/// Simulated clock owned by the time controller.
#[derive(Debug, Clone)]
pub struct SimClock {
    started_at: DateTime<Utc>,
    time: DateTime<Utc>,
    delta: Duration,
    real_time: bool,
    lifetime: Option<Duration>,
}

impl SimClock {
    pub fn new(
        start: DateTime<Utc>,
        delta: Duration,
        real_time: bool,
        lifetime: Option<Duration>,
    ) -> Self {
        Self {
            started_at: start,
            time: start,
            delta,
            real_time,
            lifetime,
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Jump to `time`, e.g. when resuming from a checkpoint.
    pub fn resume_at(&mut self, time: DateTime<Utc>) {
        self.started_at = time;
        self.time = time;
    }

    pub fn is_real_time(&self) -> bool {
        self.real_time
    }

    pub fn is_expired(&self) -> bool {
        self.lifetime
            .is_some_and(|lifetime| self.time - self.started_at >= lifetime)
    }

    /// Advance by one step. Returns `None` once the lifetime is spent; the
    /// clock does not move past expiry.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Option<Tick> {
        if self.is_expired() {
            return None;
        }
        let next = if self.real_time { now } else { self.time + self.delta };
        let delta = (next - self.time).max(Duration::zero());
        self.time = next;
        Some(Tick::new(next, delta))
    }
}
