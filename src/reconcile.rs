//! Per-tick telemetry reconciliation
//!
//! Turns either a cached profile slot or a fresh live sample into the
//! [`Telemetry`] handed to the alert evaluator and the dashboard.

use rand::Rng;

use crate::models::{DayProfile, LiveComplement, LiveSample, SocPolicy, Telemetry};
use crate::profile::{round_to, SOC_ENERGY_DIVISOR};

/// Share of surplus solar the battery absorbs
const CHARGE_EFFICIENCY: f64 = 0.9;
/// Share of the deficit the battery covers
const DISCHARGE_EFFICIENCY: f64 = 0.85;
/// Charge headroom, W per SOC point below the ceiling
const CHARGE_HEADROOM_W: f64 = 50.0;
/// Discharge headroom, W per SOC point above the floor
const DISCHARGE_HEADROOM_W: f64 = 40.0;

/// Reference demand used for live complements, W per kW of base load
const LIVE_DEMAND_FACTOR: f64 = 500.0;

/// Synthetic telemetry for `hour`: the profile slot with battery buffering applied.
pub fn synthetic_telemetry(profile: &DayProfile, hour: u8, policy: &SocPolicy) -> Telemetry {
    let mut slot = profile.slot(hour as usize).clone();
    let net = slot.solar_w - slot.load_w;
    let soc = slot.soc_pct;

    let mut battery_power_w = 0.0;
    if net > 0.0 && soc < policy.soc_max_pct() {
        let charge = (net * CHARGE_EFFICIENCY).min((policy.soc_max_pct() - soc) * CHARGE_HEADROOM_W);
        slot.grid_export_w = (slot.grid_export_w - charge.round()).max(0.0);
        battery_power_w = charge;
    } else if net < 0.0 && soc > policy.dod_pct() {
        let discharge =
            (net.abs() * DISCHARGE_EFFICIENCY).min((soc - policy.dod_pct()) * DISCHARGE_HEADROOM_W);
        slot.grid_import_w = (slot.grid_import_w - discharge.round()).max(0.0);
        battery_power_w = -discharge;
    }

    slot.soc_pct = policy.clamp(round_to(soc + battery_power_w / SOC_ENERGY_DIVISOR, 1));

    Telemetry::Synthetic {
        hour,
        slot,
        battery_power_w: battery_power_w.round(),
        daytime_peak_solar_w: profile.daytime_peak_solar_w(),
    }
}

/// Live telemetry with synthetic complements for the channels the bridge does not report.
pub fn live_telemetry<R: Rng + ?Sized>(
    sample: &LiveSample,
    base_load_kw: f64,
    hour: u8,
    rng: &mut R,
) -> Telemetry {
    let solar = sample.solar_w;
    let demand = base_load_kw * LIVE_DEMAND_FACTOR;

    let complement = LiveComplement {
        self_consumption_w: (solar * rng.gen_range(0.6..=0.9)).round(),
        grid_import_w: if solar < demand {
            ((demand - solar) * 0.8).round()
        } else {
            0.0
        },
        grid_export_w: if solar > demand {
            ((solar - demand) * 0.6).round()
        } else {
            0.0
        },
        inverter_temp_c: round_to(25.0 + solar / 500.0 + rng.gen_range(-1.0..3.0), 1),
    };

    Telemetry::Live {
        hour,
        sample: sample.clone(),
        complement,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HourSample, CELL_COUNT};
    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn slot(load_w: f64, solar_w: f64, soc_pct: f64) -> HourSample {
        let balance = solar_w - load_w;
        HourSample {
            load_w,
            solar_w,
            panel_voltage_v: 40.0,
            inverter_temp_c: 30.0,
            cell_voltages_v: [3.33; CELL_COUNT],
            self_consumption_w: load_w.min(solar_w),
            grid_import_w: if balance < 0.0 { -balance } else { 0.0 },
            grid_export_w: if balance > 0.0 { balance } else { 0.0 },
            soc_pct,
            pack_voltage_v: 3.33 * CELL_COUNT as f64,
        }
    }

    fn profile_with(hour: usize, sample: HourSample) -> DayProfile {
        let mut hours = vec![slot(1000.0, 0.0, 60.0); 24];
        hours[hour] = sample;
        DayProfile {
            device: "Equipo 1".into(),
            generated_at: Utc::now(),
            policy: SocPolicy::default(),
            hours,
        }
    }

    #[test]
    fn test_surplus_charges_battery_and_reduces_export() {
        let policy = SocPolicy { soc_max: 90, dod: 20 };
        let profile = profile_with(12, slot(2000.0, 6000.0, 60.0));

        match synthetic_telemetry(&profile, 12, &policy) {
            Telemetry::Synthetic { slot, battery_power_w, .. } => {
                // min(4000 * 0.9, 30 * 50) = 1500
                assert_eq!(battery_power_w, 1500.0);
                assert_eq!(slot.grid_export_w, 2500.0);
                assert_eq!(slot.soc_pct, 60.3);
            }
            other => panic!("unexpected telemetry {:?}", other),
        }
    }

    #[test]
    fn test_grid_flows_stay_in_whole_watts() {
        let policy = SocPolicy { soc_max: 90, dod: 20 };

        // charge = min(1001 * 0.9, 40 * 50) = 900.9
        let surplus = profile_with(12, slot(0.0, 1001.0, 50.0));
        match synthetic_telemetry(&surplus, 12, &policy) {
            Telemetry::Synthetic { slot, .. } => {
                assert_eq!(slot.grid_export_w, slot.grid_export_w.round());
                assert_eq!(slot.grid_export_w, 100.0);
            }
            other => panic!("unexpected telemetry {:?}", other),
        }

        // discharge = min(1001 * 0.85, 30 * 40) = 850.85
        let deficit = profile_with(21, slot(1001.0, 0.0, 50.0));
        match synthetic_telemetry(&deficit, 21, &policy) {
            Telemetry::Synthetic { slot, .. } => {
                assert_eq!(slot.grid_import_w, slot.grid_import_w.round());
                assert_eq!(slot.grid_import_w, 150.0);
            }
            other => panic!("unexpected telemetry {:?}", other),
        }
    }

    #[test]
    fn test_deficit_discharges_battery_and_reduces_import() {
        let policy = SocPolicy { soc_max: 100, dod: 20 };
        let profile = profile_with(21, slot(3000.0, 0.0, 50.0));

        match synthetic_telemetry(&profile, 21, &policy) {
            Telemetry::Synthetic { slot, battery_power_w, .. } => {
                // min(3000 * 0.85, 30 * 40) = 1200
                assert_eq!(battery_power_w, -1200.0);
                assert_eq!(slot.grid_import_w, 1800.0);
                assert_eq!(slot.soc_pct, 49.8);
            }
            other => panic!("unexpected telemetry {:?}", other),
        }
    }

    #[test]
    fn test_battery_idle_at_limits() {
        let policy = SocPolicy { soc_max: 90, dod: 20 };

        let full = profile_with(12, slot(1000.0, 5000.0, 90.0));
        let empty = profile_with(22, slot(3000.0, 0.0, 20.0));

        for (profile, hour) in [(full, 12u8), (empty, 22u8)] {
            match synthetic_telemetry(&profile, hour, &policy) {
                Telemetry::Synthetic { battery_power_w, slot, .. } => {
                    assert_eq!(battery_power_w, 0.0);
                    assert!(slot.soc_pct >= 20.0 && slot.soc_pct <= 90.0);
                }
                other => panic!("unexpected telemetry {:?}", other),
            }
        }
    }

    #[test]
    fn test_synthetic_carries_daytime_peak() {
        let profile = profile_with(13, slot(1000.0, 4200.0, 60.0));
        match synthetic_telemetry(&profile, 3, &SocPolicy::default()) {
            Telemetry::Synthetic { hour, daytime_peak_solar_w, .. } => {
                assert_eq!(hour, 3);
                assert_eq!(daytime_peak_solar_w, 4200.0);
            }
            other => panic!("unexpected telemetry {:?}", other),
        }
    }

    fn sample(solar_w: f64) -> LiveSample {
        LiveSample {
            pack_voltage_v: 52.0,
            soc_pct: 75.0,
            solar_w,
            panel_voltage_v: 40.0,
            net_power_w: 0.0,
            inverter_state: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_live_complements_below_demand() {
        let mut rng = StdRng::seed_from_u64(1);
        // base 8 kW -> reference demand 4000 W
        match live_telemetry(&sample(1000.0), 8.0, 14, &mut rng) {
            Telemetry::Live { complement, sample, .. } => {
                assert_eq!(complement.grid_import_w, 2400.0);
                assert_eq!(complement.grid_export_w, 0.0);
                assert!(complement.self_consumption_w >= 600.0);
                assert!(complement.self_consumption_w <= 900.0);
                assert!(complement.inverter_temp_c >= 26.0 && complement.inverter_temp_c <= 30.0);
                assert_eq!(sample.solar_w, 1000.0);
            }
            other => panic!("unexpected telemetry {:?}", other),
        }
    }

    #[test]
    fn test_live_complements_above_demand() {
        let mut rng = StdRng::seed_from_u64(2);
        match live_telemetry(&sample(6000.0), 8.0, 12, &mut rng) {
            Telemetry::Live { complement, .. } => {
                assert_eq!(complement.grid_import_w, 0.0);
                assert_eq!(complement.grid_export_w, 1200.0);
            }
            other => panic!("unexpected telemetry {:?}", other),
        }
    }
}
