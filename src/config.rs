//! Configuration management module
//!
//! Loads and validates environment-based configuration, plus the optional
//! device fleet file.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::models::{Device, SocPolicy};
use crate::validation::{validate_device, validate_soc_policy};

/// Configuration errors
#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("Invalid number format in environment variable {0}")]
    ParseError(&'static str),

    #[error("Inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Server configuration settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Simulated clock settings
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationSettings {
    /// Milliseconds between simulated hours
    pub tick_ms: u64,
    /// Simulated hour every selection starts at
    pub start_hour: u8,
}

/// Live sensor bridge settings
#[derive(Debug, Clone, Deserialize)]
pub struct LiveSettings {
    /// Bridge URL; polling is disabled when unset
    pub endpoint_url: Option<String>,
    /// Name of the live-eligible device
    pub device: String,
    pub poll_interval_ms: u64,
    /// Per-fetch timeout, strictly below the poll interval
    pub timeout_ms: u64,
    /// Consecutive failures before the connectivity alert
    pub failure_threshold: u32,
    /// Lifetime of the "restored" notice
    pub restored_notice_ms: u64,
}

impl LiveSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn restored_notice(&self) -> Duration {
        Duration::from_millis(self.restored_notice_ms)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub simulation: SimulationSettings,
    pub live: LiveSettings,
    /// Device fleet file (JSON, TOML or YAML); built-in fleet when unset
    pub devices_file: Option<String>,
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: &str,
) -> Result<T, SettingsError> {
    lookup(key)
        .unwrap_or_else(|| default.to_string())
        .trim()
        .parse()
        .map_err(|_| SettingsError::ParseError(key))
}

impl Settings {
    /// Load settings from environment variables
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load settings from any key/value source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let settings = Self {
            server: ServerSettings {
                host: lookup("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".into()),
                port: parse(&lookup, "SERVER_PORT", "8080")?,
            },
            simulation: SimulationSettings {
                tick_ms: parse(&lookup, "SIM_TICK_MS", "2000")?,
                start_hour: parse(&lookup, "SIM_START_HOUR", "6")?,
            },
            live: LiveSettings {
                endpoint_url: lookup("LIVE_ENDPOINT_URL").filter(|url| !url.trim().is_empty()),
                device: lookup("LIVE_DEVICE").unwrap_or_else(|| "Equipo 1".into()),
                poll_interval_ms: parse(&lookup, "LIVE_POLL_INTERVAL_MS", "3000")?,
                timeout_ms: parse(&lookup, "LIVE_TIMEOUT_MS", "2500")?,
                failure_threshold: parse(&lookup, "LIVE_FAILURE_THRESHOLD", "3")?,
                restored_notice_ms: parse(&lookup, "LIVE_RESTORED_NOTICE_MS", "5000")?,
            },
            devices_file: lookup("DEVICES_FILE").filter(|path| !path.trim().is_empty()),
        };

        settings.check()?;
        Ok(settings)
    }

    fn check(&self) -> Result<(), SettingsError> {
        if self.simulation.tick_ms == 0 || self.live.poll_interval_ms == 0 {
            return Err(SettingsError::Inconsistent(
                "timer periods must be greater than zero".into(),
            ));
        }
        if self.simulation.start_hour >= 24 {
            return Err(SettingsError::Inconsistent(format!(
                "SIM_START_HOUR {} is not an hour of the day",
                self.simulation.start_hour
            )));
        }
        if self.live.timeout_ms >= self.live.poll_interval_ms {
            return Err(SettingsError::Inconsistent(format!(
                "LIVE_TIMEOUT_MS ({}) must be below LIVE_POLL_INTERVAL_MS ({})",
                self.live.timeout_ms, self.live.poll_interval_ms
            )));
        }
        if self.live.failure_threshold == 0 {
            return Err(SettingsError::Inconsistent(
                "LIVE_FAILURE_THRESHOLD must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Contents of the device fleet file
#[derive(Debug, Clone, Deserialize)]
pub struct FleetFile {
    #[serde(default)]
    pub soc_policy: SocPolicy,
    pub devices: Vec<Device>,
}

/// Read and validate a fleet file; the format follows the extension
pub fn load_fleet(path: impl AsRef<Path>) -> anyhow::Result<FleetFile> {
    let path = path.as_ref();

    let fleet: FleetFile = config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .with_context(|| format!("Failed to read device file {}", path.display()))?
        .try_deserialize()
        .with_context(|| format!("Malformed device file {}", path.display()))?;

    validate_soc_policy(&fleet.soc_policy).context("Invalid SOC policy in device file")?;

    let mut seen = HashSet::new();
    for device in &fleet.devices {
        validate_device(device).with_context(|| format!("Invalid device '{}'", device.name))?;
        if !seen.insert(device.name.as_str()) {
            bail!("Duplicate device '{}' in {}", device.name, path.display());
        }
    }

    info!(
        path = %path.display(),
        devices = fleet.devices.len(),
        "Loaded device fleet"
    );
    Ok(fleet)
}
