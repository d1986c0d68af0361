//! Threshold-based alert evaluation
//!
//! Classifies device health from one tick of telemetry. Every channel is
//! checked on its own and the worst level wins. Synthetic telemetry carries
//! per-cell voltages and inverter temperature; live telemetry only reports
//! the pack, so the pack-voltage window replaces the cell checks and the
//! temperature channel is left out rather than reported as OK.

use serde::{Deserialize, Serialize};

use crate::models::{DayProfile, Device, LiveSample, SocPolicy, Telemetry};

/// Cell voltage limits (V)
pub mod cell_limits {
    pub const CRIT_LOW: f64 = 3.0;
    pub const CRIT_HIGH: f64 = 3.65;
    pub const WARN_LOW: f64 = 3.1;
    pub const WARN_HIGH: f64 = 3.6;
}

/// Pack voltage limits for a nominal 48 V pack (V)
pub mod pack_limits {
    pub const CRIT_LOW: f64 = 42.0;
    pub const CRIT_HIGH: f64 = 58.0;
    pub const WARN_LOW: f64 = 46.0;
    pub const WARN_HIGH: f64 = 56.0;
}

/// Inverter temperature limits (°C)
pub mod temp_limits {
    pub const WARN: f64 = 45.0;
    pub const CRIT: f64 = 55.0;
}

/// SOC margins above the DOD floor (percentage points)
const SOC_CRIT_MARGIN: f64 = 2.0;
const SOC_WARN_MARGIN: f64 = 8.0;

/// Minimum solar output expected during the day window (W)
const SOLAR_MIN_W: f64 = 10.0;

/// Hours (inclusive) in which missing solar is reported
const SOLAR_WINDOW: std::ops::RangeInclusive<u8> = 10..=17;

pub const NORMAL_DETAIL: &str = "Sistema operando normalmente";

/// Severity, ordered so that `max` picks the worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertLevel {
    Ok,
    Warn,
    Crit,
}

impl AlertLevel {
    /// Status label shown on the dashboard
    pub fn label(&self) -> &'static str {
        match self {
            AlertLevel::Ok => "NORMAL",
            AlertLevel::Warn => "ADVERTENCIA",
            AlertLevel::Crit => "CRÍTICO",
        }
    }
}

/// Monitored signal category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Cell,
    PackVoltage,
    Temperature,
    Soc,
    Solar,
}

/// Shape of the telemetry the classification was computed from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceShape {
    Synthetic,
    Live,
}

impl SourceShape {
    /// Channels this source cannot report
    pub fn unavailable_channels(&self) -> &'static [Channel] {
        match self {
            SourceShape::Synthetic => &[Channel::PackVoltage],
            SourceShape::Live => &[Channel::Cell, Channel::Temperature],
        }
    }
}

/// Result for one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub channel: Channel,
    pub level: AlertLevel,
    pub summary: String,
}

/// Full classification for one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertClassification {
    pub source: SourceShape,
    pub level: AlertLevel,
    pub status: String,
    /// Only channels the source can report
    pub channels: Vec<ChannelStatus>,
    /// One line per finding, or the normal-operation line
    pub details: Vec<String>,
}

impl AlertClassification {
    pub fn channel(&self, channel: Channel) -> Option<&ChannelStatus> {
        self.channels.iter().find(|c| c.channel == channel)
    }

    pub fn unavailable_channels(&self) -> &'static [Channel] {
        self.source.unavailable_channels()
    }
}

#[derive(Default)]
struct Findings {
    details: Vec<String>,
    channels: Vec<ChannelStatus>,
}

impl Findings {
    fn push(&mut self, channel: Channel, level: AlertLevel, summaries: [&str; 3]) {
        let summary = match level {
            AlertLevel::Ok => summaries[0],
            AlertLevel::Warn => summaries[1],
            AlertLevel::Crit => summaries[2],
        };
        self.channels.push(ChannelStatus {
            channel,
            level,
            summary: summary.to_string(),
        });
    }

    fn finish(mut self, source: SourceShape) -> AlertClassification {
        let level = self
            .channels
            .iter()
            .map(|c| c.level)
            .max()
            .unwrap_or(AlertLevel::Ok);

        if self.details.is_empty() {
            self.details.push(NORMAL_DETAIL.to_string());
        }

        AlertClassification {
            source,
            level,
            status: level.label().to_string(),
            channels: self.channels,
            details: self.details,
        }
    }
}

/// Classify one tick of telemetry. Total and side-effect free.
pub fn evaluate(telemetry: &Telemetry, policy: &SocPolicy) -> AlertClassification {
    let mut findings = Findings::default();

    match telemetry {
        Telemetry::Synthetic {
            hour,
            slot,
            daytime_peak_solar_w,
            ..
        } => {
            check_cells(&slot.cell_voltages_v, &mut findings);
            check_temperature(slot.inverter_temp_c, &mut findings);
            check_soc(slot.soc_pct, policy, &mut findings);

            let missing = SOLAR_WINDOW.contains(hour) && *daytime_peak_solar_w <= SOLAR_MIN_W;
            if missing {
                findings.details.push("Sin producción solar durante el día".to_string());
            }
            findings.push(Channel::Solar, warn_if(missing), SOLAR_SUMMARIES);
            findings.finish(SourceShape::Synthetic)
        }
        Telemetry::Live { hour, sample, .. } => {
            check_pack(sample, &mut findings);
            check_soc(sample.soc_pct, policy, &mut findings);

            let low = SOLAR_WINDOW.contains(hour) && sample.solar_w < SOLAR_MIN_W;
            if low {
                findings
                    .details
                    .push(format!("Poca producción solar ({:.1} W)", sample.solar_w));
            }
            findings.push(Channel::Solar, warn_if(low), SOLAR_SUMMARIES);
            findings.finish(SourceShape::Live)
        }
    }
}

const SOLAR_SUMMARIES: [&str; 3] = ["Solar OK", "Poca producción", "Sin producción"];

fn warn_if(condition: bool) -> AlertLevel {
    if condition {
        AlertLevel::Warn
    } else {
        AlertLevel::Ok
    }
}

fn check_cells(cells: &[f64], findings: &mut Findings) {
    let mut level = AlertLevel::Ok;
    for (index, &v) in cells.iter().enumerate() {
        if !(cell_limits::CRIT_LOW..=cell_limits::CRIT_HIGH).contains(&v) {
            findings
                .details
                .push(format!("Celda {} fuera de rango ({:.3}V)", index + 1, v));
            level = AlertLevel::Crit;
        } else if !(cell_limits::WARN_LOW..=cell_limits::WARN_HIGH).contains(&v) {
            findings
                .details
                .push(format!("Celda {} en límite ({:.3}V)", index + 1, v));
            level = level.max(AlertLevel::Warn);
        }
    }
    findings.push(
        Channel::Cell,
        level,
        ["Celdas OK", "Celdas desbalanceadas", "Celdas FUERA RANGO"],
    );
}

fn check_pack(sample: &LiveSample, findings: &mut Findings) {
    let v = sample.pack_voltage_v;
    let level = if !(pack_limits::CRIT_LOW..=pack_limits::CRIT_HIGH).contains(&v) {
        findings
            .details
            .push(format!("Voltaje de batería fuera de rango ({:.2}V)", v));
        AlertLevel::Crit
    } else if !(pack_limits::WARN_LOW..=pack_limits::WARN_HIGH).contains(&v) {
        findings
            .details
            .push(format!("Voltaje de batería en límite ({:.2}V)", v));
        AlertLevel::Warn
    } else {
        AlertLevel::Ok
    };
    findings.push(
        Channel::PackVoltage,
        level,
        ["Voltaje OK", "Voltaje en límite", "Voltaje FUERA RANGO"],
    );
}

fn check_temperature(t: f64, findings: &mut Findings) {
    let level = if t > temp_limits::CRIT {
        findings.details.push(format!("Temperatura crítica ({:.1}°C)", t));
        AlertLevel::Crit
    } else if t > temp_limits::WARN {
        findings.details.push(format!("Temperatura alta ({:.1}°C)", t));
        AlertLevel::Warn
    } else {
        AlertLevel::Ok
    };
    findings.push(
        Channel::Temperature,
        level,
        ["Temp OK", "Temp alta", "Temp crítica"],
    );
}

fn check_soc(soc: f64, policy: &SocPolicy, findings: &mut Findings) {
    let dod = policy.dod_pct();
    let level = if soc < dod + SOC_CRIT_MARGIN {
        findings.details.push(format!("SOC crítico ({:.1}%)", soc));
        AlertLevel::Crit
    } else if soc < dod + SOC_WARN_MARGIN {
        findings.details.push(format!("SOC bajo ({:.1}%)", soc));
        AlertLevel::Warn
    } else {
        AlertLevel::Ok
    };
    findings.push(Channel::Soc, level, ["SOC OK", "SOC bajo", "SOC crítico"]);
}

/// Fleet-level health of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceHealth {
    Inactive,
    Normal,
    Warning,
    Critical,
}

impl DeviceHealth {
    pub fn label(&self) -> &'static str {
        match self {
            DeviceHealth::Inactive => "INACTIVO",
            DeviceHealth::Normal => AlertLevel::Ok.label(),
            DeviceHealth::Warning => AlertLevel::Warn.label(),
            DeviceHealth::Critical => AlertLevel::Crit.label(),
        }
    }
}

impl From<AlertLevel> for DeviceHealth {
    fn from(level: AlertLevel) -> Self {
        match level {
            AlertLevel::Ok => DeviceHealth::Normal,
            AlertLevel::Warn => DeviceHealth::Warning,
            AlertLevel::Crit => DeviceHealth::Critical,
        }
    }
}

/// Entry of the fleet alert panel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device: String,
    pub health: DeviceHealth,
    pub label: String,
    pub details: Vec<String>,
}

impl DeviceStatus {
    pub fn inactive(device: &Device) -> Self {
        Self {
            device: device.name.clone(),
            health: DeviceHealth::Inactive,
            label: DeviceHealth::Inactive.label().to_string(),
            details: vec!["Equipo desactivado".to_string()],
        }
    }

    /// Status of an active device at a simulated hour, read straight from its profile
    pub fn from_profile(device: &Device, profile: &DayProfile, hour: u8, policy: &SocPolicy) -> Self {
        let telemetry = Telemetry::Synthetic {
            hour,
            slot: profile.slot(hour as usize).clone(),
            battery_power_w: 0.0,
            daytime_peak_solar_w: profile.daytime_peak_solar_w(),
        };
        let classification = evaluate(&telemetry, policy);
        let health = DeviceHealth::from(classification.level);

        Self {
            device: device.name.clone(),
            health,
            label: health.label().to_string(),
            details: classification.details,
        }
    }

    pub fn needs_attention(&self) -> bool {
        self.health != DeviceHealth::Normal
    }
}
