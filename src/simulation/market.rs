use serde::{Deserialize, Serialize};
use tracing::trace;

/// Floor for the suggested price.
pub const MIN_PRICE: f64 = 15.0;
/// Suggested price of a tick with no demand.
pub const BASE_PRICE: f64 = 30.0;

/// Something power can be sold into and bought from.
pub trait Sellable {
    /// Offer `power` to the pool.
    fn sell(&mut self, power: f64);

    /// Request `power` from the pool. Returns the part that could not be
    /// covered.
    fn buy(&mut self, power: f64) -> f64;
}

/// Per-tick clearing ledger of one power plant.
///
/// `power`, `demand` and `actor_count` accumulate during a tick and are
/// reset by [`Market::update`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    suggested_price: f64,
    price: f64,
    power: f64,
    demand: f64,
    actor_count: u32,
}

impl Default for Market {
    fn default() -> Self {
        Self::new(BASE_PRICE)
    }
}

impl Market {
    pub fn new(price: f64) -> Self {
        Self {
            suggested_price: BASE_PRICE,
            price,
            power: 0.0,
            demand: 0.0,
            actor_count: 0,
        }
    }

    pub fn with_suggested_price(mut self, suggested_price: f64) -> Self {
        self.suggested_price = suggested_price;
        self
    }

    pub fn suggested_price(&self) -> f64 {
        self.suggested_price
    }

    pub fn price(&self) -> f64 {
        self.price
    }

    /// Manager override of the published price.
    pub fn set_price(&mut self, price: f64) {
        self.price = price.max(0.0);
    }

    pub fn power(&self) -> f64 {
        self.power
    }

    pub fn demand(&self) -> f64 {
        self.demand
    }

    pub fn actor_count(&self) -> u32 {
        self.actor_count
    }

    /// Close the tick: derive the suggested price from the average demand
    /// per actor, then clear the ledger.
    pub fn update(&mut self) {
        let average_demand = if self.actor_count >= 1 {
            self.demand / f64::from(self.actor_count)
        } else {
            0.0
        };
        self.suggested_price = (BASE_PRICE + average_demand).max(MIN_PRICE);
        trace!(
            average_demand,
            suggested_price = self.suggested_price,
            unsold = self.power,
            "market cleared"
        );
        self.power = 0.0;
        self.demand = 0.0;
        self.actor_count = 0;
    }
}

impl Sellable for Market {
    fn sell(&mut self, power: f64) {
        self.power += power.max(0.0);
        self.actor_count += 1;
    }

    fn buy(&mut self, power: f64) -> f64 {
        let power = power.max(0.0);
        self.demand += power;
        self.actor_count += 1;
        if self.power >= power {
            self.power -= power;
            0.0
        } else {
            let unmet = power - self.power;
            self.power = 0.0;
            unmet
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_tick_suggests_base_price() {
        let mut market = Market::default();
        market.update();
        assert_eq!(market.suggested_price(), 30.0);
    }

    #[test]
    fn test_two_buys_raise_suggested_price() {
        let mut market = Market::default();
        market.buy(10.0);
        market.buy(10.0);
        market.update();
        assert_eq!(market.suggested_price(), 40.0);
    }

    #[test]
    fn test_buy_draws_from_pool() {
        let mut market = Market::default();
        market.sell(25.0);
        assert_eq!(market.buy(10.0), 0.0);
        assert_eq!(market.power(), 15.0);
        assert_eq!(market.buy(20.0), 5.0);
        assert_eq!(market.power(), 0.0);
        assert_eq!(market.demand(), 30.0);
        assert_eq!(market.actor_count(), 3);
    }

    #[test]
    fn test_update_resets_ledger() {
        let mut market = Market::default();
        market.sell(100.0);
        market.buy(30.0);
        market.update();
        assert_eq!(market.power(), 0.0);
        assert_eq!(market.demand(), 0.0);
        assert_eq!(market.actor_count(), 0);
        // One seller and one buyer of 30: average demand 15.
        assert_eq!(market.suggested_price(), 45.0);
    }

    #[test]
    fn test_set_price_is_independent_of_suggestion() {
        let mut market = Market::new(50.0);
        market.set_price(42.0);
        market.update();
        assert_eq!(market.price(), 42.0);
        assert_eq!(market.suggested_price(), 30.0);
    }
}
