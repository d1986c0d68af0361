//! Coarse historical series for monthly and annual charts
//!
//! Purely presentational history derived from the device rating. Nothing
//! links these totals to the day profile.

use rand::Rng;

use crate::models::Device;

/// Southern-hemisphere seasonal factors, January first
pub const SEASONAL_FACTORS: [f64; 12] = [
    0.90, // Jan - summer
    0.85, // Feb
    0.80, // Mar
    0.70, // Apr - autumn
    0.60, // May
    0.55, // Jun - winter
    0.60, // Jul
    0.65, // Aug
    0.75, // Sep - spring
    0.85, // Oct
    0.90, // Nov
    0.95, // Dec - summer
];

/// Reference year for the yearly improvement factor
const BASE_YEAR: i32 = 2023;

/// Days per month in the daily series
pub const DAYS_PER_MONTH: usize = 30;

/// Weekend production factor
const WEEKEND_FACTOR: f64 = 0.7;

/// Small year-over-year improvement, 2% per year from 2023
pub fn yearly_factor(year: i32) -> f64 {
    1.0 + (f64::from(year) - f64::from(BASE_YEAR)) * 0.02
}

/// Daily totals for one month (`month` is 0-based).
pub fn generate_monthly<R: Rng + ?Sized>(
    device: &Device,
    year: i32,
    month: usize,
    rng: &mut R,
) -> [u64; DAYS_PER_MONTH] {
    let base = device.base_load_kw * 1000.0;
    let seasonal = SEASONAL_FACTORS[month % 12];
    let yearly = yearly_factor(year);

    let mut days = [0u64; DAYS_PER_MONTH];
    for (i, day) in days.iter_mut().enumerate() {
        let weekday = i % 7;
        let day_factor = if weekday == 0 || weekday == 6 { WEEKEND_FACTOR } else { 1.0 };
        let noise = rng.gen_range(0.8..=1.2);
        *day = (base * seasonal * yearly * day_factor * noise).round().max(0.0) as u64;
    }
    days
}

/// Monthly totals for one year (30-day months).
pub fn generate_annual<R: Rng + ?Sized>(device: &Device, year: i32, rng: &mut R) -> [u64; 12] {
    let base = device.base_load_kw * 1000.0;
    let yearly = yearly_factor(year);

    let mut months = [0u64; 12];
    for (month, total) in months.iter_mut().enumerate() {
        let noise = rng.gen_range(0.9..=1.1);
        let value = base * SEASONAL_FACTORS[month] * yearly * noise * DAYS_PER_MONTH as f64;
        *total = value.round().max(0.0) as u64;
    }
    months
}
