//! Shaping helpers shared by the wind and consumption models.

use chrono::NaiveDate;
use rand::seq::SliceRandom;
use rand::Rng;

pub const HOURS_PER_DAY: usize = 24;

/// Gaussian shaping function `a·e^{-(x-b)²/(2c²)}`.
///
/// A non-positive width collapses to a spike of height `a` at `x == b`.
pub fn gaussian(x: f64, a: f64, b: f64, c: f64) -> f64 {
    if c <= 0.0 {
        return if x == b { a } else { 0.0 };
    }
    a * (-(x - b).powi(2) / (2.0 * c * c)).exp()
}

pub fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

pub fn days_in_year(year: i32) -> usize {
    if is_leap_year(year) {
        366
    } else {
        365
    }
}

/// Zero-based day index within the year.
pub fn day_index(date: NaiveDate) -> usize {
    use chrono::Datelike;
    date.ordinal0() as usize
}

/// Per-day maximum wind speeds for `year`: a bell curve centred on mid-year,
/// then shuffled across the days.
///
/// The shuffle discards the seasonal ordering the curve describes; only the
/// yearly distribution of maxima survives.
pub fn seasonal_envelope<R: Rng + ?Sized>(year: i32, max: f64, stdev: f64, rng: &mut R) -> Vec<f64> {
    let days = days_in_year(year);
    let mid = (days as f64 - 1.0) / 2.0;
    let mut maxima: Vec<f64> = (0..days)
        .map(|day| gaussian(day as f64 - mid, max, 0.0, stdev))
        .collect();
    maxima.shuffle(rng);
    maxima
}

/// 24 hourly speeds for one day, bell-shaped around noon and scaled by the
/// day's maximum, then shuffled like the seasonal envelope.
pub fn diurnal_profile<R: Rng + ?Sized>(day_max: f64, stdev_hours: f64, rng: &mut R) -> Vec<f64> {
    let mut hours: Vec<f64> = (0..HOURS_PER_DAY)
        .map(|hour| gaussian(hour as f64 - 12.0, day_max, 0.0, stdev_hours))
        .collect();
    hours.shuffle(rng);
    hours
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use rstest::rstest;

    #[rstest]
    #[case(2000, 366)]
    #[case(1900, 365)]
    #[case(2024, 366)]
    #[case(2023, 365)]
    fn test_days_in_year(#[case] year: i32, #[case] days: usize) {
        assert_eq!(days_in_year(year), days);
    }

    #[rstest]
    #[case(2000)]
    #[case(1900)]
    #[case(2024)]
    #[case(2023)]
    fn test_envelope_length_matches_year(#[case] year: i32) {
        let mut rng = StdRng::seed_from_u64(1);
        let envelope = seasonal_envelope(year, 10.0, 90.0, &mut rng);
        assert_eq!(envelope.len(), days_in_year(year));
    }

    #[test]
    fn test_gaussian_peak_and_symmetry() {
        assert_eq!(gaussian(0.0, 8.0, 0.0, 3.0), 8.0);
        let left = gaussian(-2.0, 8.0, 0.0, 3.0);
        let right = gaussian(2.0, 8.0, 0.0, 3.0);
        assert!((left - right).abs() < 1e-12);
        assert!(left < 8.0 && left > 0.0);
        assert_eq!(gaussian(1.0, 8.0, 0.0, 0.0), 0.0);
    }

    #[test]
    fn test_envelope_is_permutation_of_curve() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut shuffled = seasonal_envelope(2023, 12.0, 80.0, &mut rng);
        let mid = 182.0;
        let mut curve: Vec<f64> = (0..365)
            .map(|d| gaussian(d as f64 - mid, 12.0, 0.0, 80.0))
            .collect();

        shuffled.sort_by(|a, b| a.total_cmp(b));
        curve.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(shuffled, curve);
    }

    #[test]
    fn test_diurnal_profile_bounds() {
        let mut rng = StdRng::seed_from_u64(3);
        let hours = diurnal_profile(9.0, 6.0, &mut rng);
        assert_eq!(hours.len(), HOURS_PER_DAY);
        assert!(hours.iter().all(|v| (0.0..=9.0).contains(v)));
        assert!(hours.iter().any(|v| (*v - 9.0).abs() < 1e-12));
    }
}
