//! Session state management
//!
//! Central state container for the monitor: the device fleet, the shared
//! SOC policy and the per-device caches of generated profiles and history.
//! Owned by the controller task, which is the only writer.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::aggregate::{self, DAYS_PER_MONTH};
use crate::alerts::DeviceStatus;
use crate::error::{AppError, AppResult};
use crate::models::{Customer, DayProfile, Device, SocPolicy, SystemClass};
use crate::profile::generate_day_profile;

/// Direction of a credit adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreditAction {
    Add,
    Remove,
}

/// Fleet alert panel
#[derive(Debug, Clone, Serialize)]
pub struct FleetOverview {
    /// Simulated hour the statuses were evaluated at
    pub hour: u8,
    /// Devices not in NORMAL state, inactive ones included
    pub alert_count: usize,
    pub devices: Vec<DeviceStatus>,
}

/// Central session state
#[derive(Debug)]
pub struct SessionState {
    devices: BTreeMap<String, Device>,
    policy: SocPolicy,
    profiles: HashMap<String, DayProfile>,
    annual: HashMap<(String, i32), [u64; 12]>,
    monthly: HashMap<(String, i32, usize), [u64; DAYS_PER_MONTH]>,
    rng: StdRng,
    /// Application start time
    start_time: DateTime<Utc>,
}

impl SessionState {
    /// Create state from a validated fleet and policy
    pub fn new(devices: Vec<Device>, policy: SocPolicy) -> Self {
        Self::with_rng(devices, policy, StdRng::from_entropy())
    }

    /// Create state with a fixed random source
    pub fn with_rng(devices: Vec<Device>, policy: SocPolicy, rng: StdRng) -> Self {
        info!(
            devices = devices.len(),
            soc_max = policy.soc_max,
            dod = policy.dod,
            "Initializing session state"
        );
        Self {
            devices: devices.into_iter().map(|d| (d.name.clone(), d)).collect(),
            policy,
            profiles: HashMap::new(),
            annual: HashMap::new(),
            monthly: HashMap::new(),
            rng,
            start_time: Utc::now(),
        }
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn device(&self, name: &str) -> AppResult<&Device> {
        self.devices
            .get(name)
            .ok_or_else(|| AppError::device_not_found(name))
    }

    /// Case-insensitive search over name, class and customer fields
    pub fn search(&self, query: &str) -> Vec<&Device> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.devices().collect();
        }

        self.devices()
            .filter(|d| {
                [
                    d.name.as_str(),
                    d.system_class.as_str(),
                    d.customer.name.as_str(),
                    d.customer.tax_id.as_str(),
                    d.customer.address.as_str(),
                    d.customer.number.as_str(),
                ]
                .iter()
                .any(|field| field.to_lowercase().contains(&needle))
            })
            .collect()
    }

    /// Insert or replace a device. Returns `true` when it is new.
    pub fn upsert(&mut self, device: Device) -> bool {
        let name = device.name.clone();
        self.invalidate(&name);
        let created = self.devices.insert(name.clone(), device).is_none();
        info!(device = %name, created, "Device stored");
        created
    }

    /// Remove a device and everything cached for it
    pub fn remove(&mut self, name: &str) -> AppResult<Device> {
        let device = self
            .devices
            .remove(name)
            .ok_or_else(|| AppError::device_not_found(name))?;
        self.invalidate(name);
        info!(device = %name, "Device removed");
        Ok(device)
    }

    fn invalidate(&mut self, name: &str) {
        self.profiles.remove(name);
        self.annual.retain(|(device, _), _| device != name);
        self.monthly.retain(|(device, _, _), _| device != name);
    }

    pub fn policy(&self) -> SocPolicy {
        self.policy
    }

    /// Replace the policy and regenerate every cached profile against it
    pub fn set_policy(&mut self, policy: SocPolicy) {
        self.policy = policy;

        let cached: Vec<String> = self.profiles.keys().cloned().collect();
        let mut regenerated = HashMap::with_capacity(cached.len());
        for name in cached {
            if let Some(device) = self.devices.get(&name) {
                regenerated.insert(name, generate_day_profile(device, &policy, &mut self.rng));
            }
        }
        self.profiles = regenerated;

        info!(
            soc_max = policy.soc_max,
            dod = policy.dod,
            regenerated = self.profiles.len(),
            "SOC policy updated"
        );
    }

    /// Day profile for an active device, generated on first use
    pub fn profile(&mut self, name: &str) -> AppResult<&DayProfile> {
        let device = self
            .devices
            .get(name)
            .ok_or_else(|| AppError::device_not_found(name))?;

        if !device.active {
            return Err(AppError::Conflict(format!(
                "Device '{}' is inactive and has no profile",
                name
            )));
        }

        if !self.profiles.contains_key(name) {
            let profile = generate_day_profile(device, &self.policy, &mut self.rng);
            self.profiles.insert(name.to_string(), profile);
        }

        self.profiles
            .get(name)
            .ok_or_else(|| AppError::InternalError(format!("profile for '{}' missing", name)))
    }

    /// Monthly totals for a year, cached per device and year
    pub fn annual(&mut self, name: &str, year: i32) -> AppResult<[u64; 12]> {
        let device = self
            .devices
            .get(name)
            .ok_or_else(|| AppError::device_not_found(name))?;

        let key = (name.to_string(), year);
        if let Some(series) = self.annual.get(&key) {
            return Ok(*series);
        }

        let series = aggregate::generate_annual(device, year, &mut self.rng);
        debug!(device = %name, year, "Generated annual history");
        self.annual.insert(key, series);
        Ok(series)
    }

    /// Daily totals for one month (0-based), cached per device, year and month
    pub fn monthly(&mut self, name: &str, year: i32, month: usize) -> AppResult<[u64; DAYS_PER_MONTH]> {
        let device = self
            .devices
            .get(name)
            .ok_or_else(|| AppError::device_not_found(name))?;

        let key = (name.to_string(), year, month);
        if let Some(series) = self.monthly.get(&key) {
            return Ok(*series);
        }

        let series = aggregate::generate_monthly(device, year, month, &mut self.rng);
        debug!(device = %name, year, month, "Generated monthly history");
        self.monthly.insert(key, series);
        Ok(series)
    }

    /// Add or remove prepaid days. Removal needs a balance above one day.
    pub fn adjust_credit(&mut self, name: &str, days: u32, action: CreditAction) -> AppResult<u32> {
        let device = self
            .devices
            .get_mut(name)
            .ok_or_else(|| AppError::device_not_found(name))?;

        device.credit_days = match action {
            CreditAction::Add => device.credit_days.saturating_add(days),
            CreditAction::Remove => {
                if device.credit_days <= 1 {
                    return Err(AppError::Conflict(format!(
                        "Device '{}' has {} credit days left, nothing to remove",
                        name, device.credit_days
                    )));
                }
                device.credit_days.saturating_sub(days)
            }
        };

        info!(device = %name, ?action, days, balance = device.credit_days, "Credit adjusted");
        Ok(device.credit_days)
    }

    /// Fleet alert panel at a simulated hour
    pub fn fleet_overview(&mut self, hour: u8) -> FleetOverview {
        let active: Vec<String> = self
            .devices
            .values()
            .filter(|d| d.active && !self.profiles.contains_key(&d.name))
            .map(|d| d.name.clone())
            .collect();
        for name in active {
            if let Some(device) = self.devices.get(&name) {
                let profile = generate_day_profile(device, &self.policy, &mut self.rng);
                self.profiles.insert(name, profile);
            }
        }

        let devices: Vec<DeviceStatus> = self
            .devices
            .values()
            .map(|device| match self.profiles.get(&device.name) {
                Some(profile) if device.active => {
                    DeviceStatus::from_profile(device, profile, hour, &self.policy)
                }
                _ => DeviceStatus::inactive(device),
            })
            .collect();

        FleetOverview {
            hour,
            alert_count: devices.iter().filter(|s| s.needs_attention()).count(),
            devices,
        }
    }

    /// Session random source, shared by every generator
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.start_time).num_seconds().max(0) as u64
    }
}

/// Built-in fleet used when no device file is configured
pub fn default_devices() -> Vec<Device> {
    vec![
        Device {
            name: "Equipo 1".to_string(),
            active: true,
            credit_days: 30,
            base_load_kw: 8.0,
            system_class: SystemClass::Residential,
            battery_capacity_kwh: 10.0,
            customer: Customer {
                number: "C-001".to_string(),
                name: "Juan Pérez".to_string(),
                tax_id: "20-12345678-9".to_string(),
                email: "juan.perez@example.com".to_string(),
                phone: "+54 11 5555-0001".to_string(),
                address: "Av. Siempre Viva 742".to_string(),
                lat: None,
                lng: None,
            },
        },
        Device {
            name: "Equipo 2".to_string(),
            active: false,
            credit_days: 15,
            base_load_kw: 5.0,
            system_class: SystemClass::Commercial,
            battery_capacity_kwh: 15.0,
            customer: Customer {
                number: "C-002".to_string(),
                name: "Comercial del Sur SA".to_string(),
                tax_id: "30-98765432-1".to_string(),
                email: "contacto@comercialdelsur.example.com".to_string(),
                phone: "+54 11 5555-0002".to_string(),
                address: "Calle Falsa 123".to_string(),
                lat: None,
                lng: None,
            },
        },
        Device {
            name: "Equipo 3".to_string(),
            active: true,
            credit_days: 3,
            base_load_kw: 12.0,
            system_class: SystemClass::Industrial,
            battery_capacity_kwh: 25.0,
            customer: Customer {
                number: "C-003".to_string(),
                name: "Metalúrgica Norte".to_string(),
                tax_id: "30-55555555-5".to_string(),
                email: "planta@metalurgicanorte.example.com".to_string(),
                phone: "+54 11 5555-0003".to_string(),
                address: "Parque Industrial, Lote 9".to_string(),
                lat: None,
                lng: None,
            },
        },
    ]
}
