//! Synthetic Day Profile Generator
//!
//! Produces one internally consistent 24-hour telemetry profile per device.
//! The curves are statistically plausible, not a physical battery or
//! inverter model:
//!
//! - Load: base rating with morning (08h) and evening (20h) peaks
//! - Solar: bell curve centered on 13h, width 3h
//! - Panel voltage and inverter temperature follow the solar fraction
//! - 16 cell voltages drift together with small independent noise
//! - Grid import/export from the hourly solar/load balance
//! - SOC from a simple energy-balance integrator clamped to the SOC policy

use chrono::Utc;
use rand::Rng;
use std::f64::consts::PI;
use tracing::debug;

use crate::models::{DayProfile, Device, HourSample, SocPolicy, CELL_COUNT, HOURS_PER_DAY};

/// Floor for hourly load (W)
const MIN_LOAD_W: f64 = 50.0;

/// Nominal LiFePO4 cell voltage (V)
const CELL_NOMINAL_V: f64 = 3.33;

/// W per SOC percentage point per hour in the integrator
pub const SOC_ENERGY_DIVISOR: f64 = 5000.0;

/// Gaussian bell used for solar and load shapes
pub fn gauss(hour: f64, peak_hour: f64, width: f64) -> f64 {
    let a = hour - peak_hour;
    (-(a * a) / (2.0 * width * width)).exp()
}

/// Round to a fixed number of decimals
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Generate a fresh profile for an active device.
///
/// The seasonal multiplier is drawn once and applied to every hour so the
/// whole day is coherent.
pub fn generate_day_profile<R: Rng + ?Sized>(
    device: &Device,
    policy: &SocPolicy,
    rng: &mut R,
) -> DayProfile {
    let base_w = device.base_load_kw * 1000.0;
    let seasonal = 1.0 + (rng.gen_range(0.0..2.0 * PI)).sin() * 0.12;

    let mut load = [0.0; HOURS_PER_DAY];
    let mut solar = [0.0; HOURS_PER_DAY];
    let mut panel = [0.0; HOURS_PER_DAY];
    let mut temp = [0.0; HOURS_PER_DAY];
    let mut cells = [[0.0; CELL_COUNT]; HOURS_PER_DAY];

    for h in 0..HOURS_PER_DAY {
        let hf = h as f64;
        let morning_peak = (-(hf - 8.0).powi(2) / 18.0).exp();
        let evening_peak = (-(hf - 20.0).powi(2) / 8.0).exp();
        let shape = 0.6 + morning_peak * 0.9 + evening_peak * 1.1 + rng.gen_range(0.0..0.25);
        load[h] = (base_w * shape * seasonal).round().max(MIN_LOAD_W);

        let ceiling = (base_w * (0.9 + rng.gen::<f64>() * 0.6) * seasonal).round();
        solar[h] = (ceiling * gauss(hf, 13.0, 3.0) * (0.6 + rng.gen::<f64>() * 0.8)).round();

        let fraction = if ceiling > 0.0 { solar[h] / ceiling } else { 0.0 };
        panel[h] = round_to(30.0 + fraction * 20.0 + rng.gen_range(-1.2..1.2), 2);
        temp[h] = round_to(25.0 + solar[h] / 300.0 + rng.gen_range(-1.0..2.0), 1);

        for (c, cell) in cells[h].iter_mut().enumerate() {
            let drift = ((hf + c as f64) / 12.0).sin() * 0.06;
            *cell = round_to(CELL_NOMINAL_V + drift + rng.gen_range(-0.01..0.015), 3);
        }
    }

    let mut soc = (policy.soc_max_pct() - 5.0 + rng.gen::<f64>() * 8.0)
        .min(policy.soc_max_pct())
        .max(policy.dod_pct() + 2.0);

    let mut hours = Vec::with_capacity(HOURS_PER_DAY);
    for h in 0..HOURS_PER_DAY {
        let self_consumption_w = load[h].min((solar[h] * (0.55 + rng.gen::<f64>() * 0.3)).round());

        let balance = solar[h] - load[h];
        let (grid_import_w, grid_export_w) = if balance >= 0.0 {
            (0.0, (balance * (0.6 + rng.gen::<f64>() * 0.3)).round())
        } else {
            ((-balance * (0.8 + rng.gen::<f64>() * 0.2)).round(), 0.0)
        };

        soc += balance / SOC_ENERGY_DIVISOR;
        soc += rng.gen_range(-0.3..0.3);
        soc = policy.clamp(soc);

        hours.push(HourSample {
            load_w: load[h],
            solar_w: solar[h],
            panel_voltage_v: panel[h],
            inverter_temp_c: temp[h],
            cell_voltages_v: cells[h],
            self_consumption_w,
            grid_import_w,
            grid_export_w,
            soc_pct: policy.clamp(round_to(soc, 1)),
            pack_voltage_v: cells[h].iter().sum(),
        });
    }

    debug!(
        device = %device.name,
        seasonal = seasonal,
        soc_max = policy.soc_max,
        dod = policy.dod,
        "Generated synthetic day profile"
    );

    DayProfile {
        device: device.name.clone(),
        generated_at: Utc::now(),
        policy: *policy,
        hours,
    }
}

/// Energy totals for one profile
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct DaySummary {
    pub device: String,
    pub consumed_kwh: f64,
    pub solar_kwh: f64,
    pub imported_kwh: f64,
    pub exported_kwh: f64,
    pub self_consumed_kwh: f64,
    /// Share of solar production used on site (%)
    pub self_consumption_pct: f64,
    /// Share of load not covered by the grid (%)
    pub self_sufficiency_pct: f64,
}

impl DaySummary {
    pub fn from_profile(profile: &DayProfile) -> Self {
        let total = |f: fn(&HourSample) -> f64| profile.hours.iter().map(f).sum::<f64>() / 1000.0;

        let consumed = total(|h| h.load_w);
        let solar = total(|h| h.solar_w);
        let imported = total(|h| h.grid_import_w);
        let exported = total(|h| h.grid_export_w);
        let self_consumed = total(|h| h.self_consumption_w);

        let self_consumption_pct = if solar > 0.0 {
            round_to(self_consumed / solar * 100.0, 1)
        } else {
            0.0
        };
        let self_sufficiency_pct = if consumed > 0.0 {
            round_to((1.0 - imported / consumed) * 100.0, 1)
        } else {
            0.0
        };

        Self {
            device: profile.device.clone(),
            consumed_kwh: round_to(consumed, 2),
            solar_kwh: round_to(solar, 2),
            imported_kwh: round_to(imported, 2),
            exported_kwh: round_to(exported, 2),
            self_consumed_kwh: round_to(self_consumed, 2),
            self_consumption_pct,
            self_sufficiency_pct,
        }
    }
}
