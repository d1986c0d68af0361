//! Data models for devices, telemetry and dashboard updates
//!
//! Defines the core data structures shared by the generators, the alert
//! evaluator, the reconciliation controller and the HTTP/WebSocket surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::alerts::AlertClassification;
use crate::live::ConnectionView;

/// Number of series-connected LiFePO4 cells in a pack
pub const CELL_COUNT: usize = 16;

/// Hourly slots in a simulated day
pub const HOURS_PER_DAY: usize = 24;

/// Installation size class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemClass {
    #[serde(alias = "residencial")]
    Residential,
    #[serde(alias = "comercial")]
    Commercial,
    Industrial,
}

impl SystemClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemClass::Residential => "residential",
            SystemClass::Commercial => "commercial",
            SystemClass::Industrial => "industrial",
        }
    }
}

/// Customer record attached to a device. Never interpreted by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Customer {
    pub number: String,
    pub name: String,
    pub tax_id: String,
    pub email: String,
    pub phone: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lng: Option<String>,
}

/// A monitored solar+battery installation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Device {
    /// Unique, immutable identity
    #[validate(length(min = 1, max = 64, message = "Device name must be 1-64 characters"))]
    pub name: String,

    pub active: bool,

    /// Prepaid service days remaining
    #[serde(default)]
    pub credit_days: u32,

    /// Base-load rating (kW), scales every generated curve
    #[validate(range(min = 0.1, max = 1000.0, message = "Base load must be between 0.1 and 1000 kW"))]
    pub base_load_kw: f64,

    pub system_class: SystemClass,

    /// Battery capacity (kWh)
    #[validate(range(min = 0.1, max = 10000.0, message = "Battery capacity must be between 0.1 and 10000 kWh"))]
    pub battery_capacity_kwh: f64,

    #[serde(default)]
    pub customer: Customer,
}

/// Input DTO for creating or editing a device; the name comes from the path
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DeviceInput {
    pub active: bool,

    #[serde(default)]
    pub credit_days: u32,

    #[validate(range(min = 0.1, max = 1000.0))]
    pub base_load_kw: f64,

    pub system_class: SystemClass,

    #[validate(range(min = 0.1, max = 10000.0))]
    pub battery_capacity_kwh: f64,

    #[serde(default)]
    pub customer: Customer,
}

impl DeviceInput {
    pub fn into_device(self, name: impl Into<String>) -> Device {
        Device {
            name: name.into(),
            active: self.active,
            credit_days: self.credit_days,
            base_load_kw: self.base_load_kw,
            system_class: self.system_class,
            battery_capacity_kwh: self.battery_capacity_kwh,
            customer: self.customer,
        }
    }
}

/// Battery state-of-charge window shared by every device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct SocPolicy {
    /// Upper charge limit (%)
    #[validate(range(min = 50, max = 100, message = "SOC max must be between 50 and 100%"))]
    pub soc_max: u8,

    /// Depth-of-discharge floor (%), always below `soc_max`
    #[validate(range(min = 5, max = 99, message = "DOD must be between 5 and 99%"))]
    pub dod: u8,
}

impl SocPolicy {
    pub fn soc_max_pct(&self) -> f64 {
        f64::from(self.soc_max)
    }

    pub fn dod_pct(&self) -> f64 {
        f64::from(self.dod)
    }

    /// Clamp a SOC value into `[dod, soc_max]`
    pub fn clamp(&self, soc: f64) -> f64 {
        soc.clamp(self.dod_pct(), self.soc_max_pct())
    }
}

impl Default for SocPolicy {
    fn default() -> Self {
        Self { soc_max: 100, dod: 20 }
    }
}

/// One hour of synthetic telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourSample {
    pub load_w: f64,
    pub solar_w: f64,
    pub panel_voltage_v: f64,
    pub inverter_temp_c: f64,
    pub cell_voltages_v: [f64; CELL_COUNT],
    pub self_consumption_w: f64,
    pub grid_import_w: f64,
    pub grid_export_w: f64,
    pub soc_pct: f64,
    /// Sum of `cell_voltages_v`
    pub pack_voltage_v: f64,
}

/// Synthetic 24-hour telemetry for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayProfile {
    pub device: String,
    pub generated_at: DateTime<Utc>,
    /// Policy the SOC trajectory was clamped to
    pub policy: SocPolicy,
    /// Exactly [`HOURS_PER_DAY`] slots, index = hour
    pub hours: Vec<HourSample>,
}

impl DayProfile {
    /// Slot for an hour; wraps past midnight
    pub fn slot(&self, hour: usize) -> &HourSample {
        &self.hours[hour % self.hours.len()]
    }

    /// Highest solar output between 10:00 and 17:00 inclusive
    pub fn daytime_peak_solar_w(&self) -> f64 {
        self.hours
            .iter()
            .skip(10)
            .take(8)
            .map(|h| h.solar_w)
            .fold(0.0, f64::max)
    }
}

/// Live reading as served by the sensor bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveWireReading {
    #[serde(rename = "Vbat")]
    pub vbat: f64,
    #[serde(rename = "SOC")]
    pub soc: f64,
    #[serde(rename = "Ppv")]
    pub ppv: f64,
    #[serde(rename = "Vpv")]
    pub vpv: f64,
    #[serde(rename = "Pconsumo", default)]
    pub pconsumo: Option<f64>,
    #[serde(rename = "Ibat", default)]
    pub ibat: Option<f64>,
    #[serde(rename = "Estado", default)]
    pub estado: Option<String>,
}

/// One fetched live reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSample {
    pub pack_voltage_v: f64,
    pub soc_pct: f64,
    pub solar_w: f64,
    pub panel_voltage_v: f64,
    pub net_power_w: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inverter_state: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LiveWireReading {
    /// Attach a fetch timestamp. `Pconsumo` wins over `Ibat` when both are present
    /// and a non-zero consumption is reported.
    pub fn into_sample(self, timestamp: DateTime<Utc>) -> LiveSample {
        let net_power_w = match (self.pconsumo, self.ibat) {
            (Some(p), _) if p != 0.0 => p,
            (_, Some(i)) => i,
            (Some(p), None) => p,
            (None, None) => 0.0,
        };

        LiveSample {
            pack_voltage_v: self.vbat,
            soc_pct: self.soc,
            solar_w: self.ppv,
            panel_voltage_v: self.vpv,
            net_power_w,
            inverter_state: self.estado,
            timestamp,
        }
    }
}

/// Synthetic values for the channels live telemetry does not report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveComplement {
    pub self_consumption_w: f64,
    pub grid_import_w: f64,
    pub grid_export_w: f64,
    pub inverter_temp_c: f64,
}

/// Telemetry for one tick, tagged by where it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Telemetry {
    Synthetic {
        hour: u8,
        /// Profile slot after battery buffering
        slot: HourSample,
        /// Positive while charging, negative while discharging
        battery_power_w: f64,
        /// Peak solar of the profile between 10:00 and 17:00
        daytime_peak_solar_w: f64,
    },
    Live {
        hour: u8,
        sample: LiveSample,
        complement: LiveComplement,
    },
}

impl Telemetry {
    pub fn hour(&self) -> u8 {
        match self {
            Telemetry::Synthetic { hour, .. } | Telemetry::Live { hour, .. } => *hour,
        }
    }

    pub fn soc_pct(&self) -> f64 {
        match self {
            Telemetry::Synthetic { slot, .. } => slot.soc_pct,
            Telemetry::Live { sample, .. } => sample.soc_pct,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Telemetry::Live { .. })
    }
}

/// Payload published to the presentation layer after every tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardUpdate {
    pub id: Uuid,
    pub device: String,
    pub published_at: DateTime<Utc>,
    /// Dashboard status label: INACTIVO, NORMAL, ADVERTENCIA or CRÍTICO
    pub status: String,
    /// `None` for inactive devices
    pub telemetry: Option<Telemetry>,
    pub alerts: Option<AlertClassification>,
    pub connection: ConnectionView,
}

/// WebSocket message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WsMessage {
    /// New dashboard state for the selected device
    DashboardUpdate(Box<DashboardUpdate>),
    /// Connection acknowledgment
    Connected { client_id: String },
    /// Error message
    Error { message: String },
    /// Heartbeat/ping
    Ping,
    /// Heartbeat/pong response
    Pong,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub selected_device: Option<String>,
}
