//! # Battery
//!
//! Bounded energy reservoir attached to a house. Pure computation; the
//! owning house persists it.

use serde::{Deserialize, Serialize};

/// Something that can absorb surplus energy and release it on demand.
pub trait Chargeable {
    /// Store up to `excess·ratio`. Returns the part of `excess` not stored.
    fn charge(&mut self, excess: f64, ratio: f64) -> f64;

    /// Release up to `demand·ratio`. Returns the part of `demand` still unmet.
    fn consume(&mut self, demand: f64, ratio: f64) -> f64;
}

/// Invariant: `0 <= value <= capacity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    pub owner: i64,
    capacity: f64,
    value: f64,
}

impl Battery {
    /// Capacity is floored at zero and `value` clamped into range.
    pub fn new(owner: i64, capacity: f64, value: f64) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            owner,
            capacity,
            value: value.max(0.0).min(capacity),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn headroom(&self) -> f64 {
        self.capacity - self.value
    }

    /// Fill level as a fraction of capacity; an empty-capacity battery reads 0.
    pub fn level(&self) -> f64 {
        if self.capacity > 0.0 {
            self.value / self.capacity
        } else {
            0.0
        }
    }
}

impl Chargeable for Battery {
    fn charge(&mut self, excess: f64, ratio: f64) -> f64 {
        if excess <= 0.0 {
            return excess;
        }
        let moved = self.headroom().min(excess * ratio.clamp(0.0, 1.0)).max(0.0);
        self.value = (self.value + moved).min(self.capacity);
        excess - moved
    }

    fn consume(&mut self, demand: f64, ratio: f64) -> f64 {
        if demand <= 0.0 {
            return demand;
        }
        let moved = self.value.min(demand * ratio.clamp(0.0, 1.0)).max(0.0);
        self.value = (self.value - moved).max(0.0);
        demand - moved
    }
}
