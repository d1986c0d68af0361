//! Input validation module
//!
//! Boundary checks for SOC policies, device configuration and API inputs.
//! Derived `validator` rules run first, then semantic checks the derive
//! cannot express.

use crate::error::{AppError, AppResult};
use crate::models::{Device, DeviceInput, SocPolicy};
use tracing::{debug, warn};
use validator::{Validate, ValidationErrors};

/// Credit adjustment limits (days)
pub struct CreditConstraints;

impl CreditConstraints {
    pub const DAYS_MIN: u32 = 1;
    pub const DAYS_MAX: u32 = 3650;
}

/// Years served by the history endpoints
pub struct YearConstraints;

impl YearConstraints {
    pub const YEAR_MIN: i32 = 1970;
    pub const YEAR_MAX: i32 = 2100;
}

/// Flatten `validator` field errors into one message
fn describe(errors: &ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .map(|(field, errors)| {
            let msgs: Vec<String> = errors
                .iter()
                .map(|e| {
                    e.message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| e.code.to_string())
                })
                .collect();
            format!("{}: {}", field, msgs.join(", "))
        })
        .collect();
    messages.sort();
    messages.join("; ")
}

/// Validate a SOC policy; `dod` must sit strictly below `soc_max`
pub fn validate_soc_policy(policy: &SocPolicy) -> AppResult<()> {
    if let Err(errors) = policy.validate() {
        let message = describe(&errors);
        warn!(errors = %message, "SOC policy validation failed");
        return Err(AppError::Configuration(message));
    }

    if policy.dod >= policy.soc_max {
        warn!(soc_max = policy.soc_max, dod = policy.dod, "DOD not below SOC max");
        return Err(AppError::Configuration(format!(
            "DOD ({}%) must be below SOC max ({}%)",
            policy.dod, policy.soc_max
        )));
    }

    debug!("SOC policy validation passed");
    Ok(())
}

/// Validate a device coming from configuration
pub fn validate_device(device: &Device) -> AppResult<()> {
    if let Err(errors) = device.validate() {
        let message = describe(&errors);
        warn!(device = %device.name, errors = %message, "Device validation failed");
        return Err(AppError::Configuration(message));
    }

    validate_name(&device.name).map_err(|e| AppError::Configuration(e.to_string()))?;
    validate_rating("base_load_kw", device.base_load_kw).map_err(|e| AppError::Configuration(e.to_string()))?;
    validate_rating("battery_capacity_kwh", device.battery_capacity_kwh)
        .map_err(|e| AppError::Configuration(e.to_string()))?;

    Ok(())
}

/// Validate a device create/edit request
pub fn validate_device_input(name: &str, input: &DeviceInput) -> AppResult<()> {
    validate_name(name)?;

    if let Err(errors) = input.validate() {
        let message = describe(&errors);
        warn!(device = %name, errors = %message, "Device input validation failed");
        return Err(AppError::ValidationError(message));
    }

    validate_rating("base_load_kw", input.base_load_kw)?;
    validate_rating("battery_capacity_kwh", input.battery_capacity_kwh)?;

    debug!(device = %name, "Device input validation passed");
    Ok(())
}

/// Validate the number of days in a credit adjustment
pub fn validate_credit_days(days: u32) -> AppResult<()> {
    if !(CreditConstraints::DAYS_MIN..=CreditConstraints::DAYS_MAX).contains(&days) {
        return Err(AppError::ValidationError(format!(
            "Credit days {} out of valid range [{}, {}]",
            days,
            CreditConstraints::DAYS_MIN,
            CreditConstraints::DAYS_MAX
        )));
    }
    Ok(())
}

/// Validate a 0-based month index for monthly history
pub fn validate_month(month: usize) -> AppResult<()> {
    if month > 11 {
        return Err(AppError::BadRequest(format!(
            "Month {} out of valid range [0, 11]",
            month
        )));
    }
    Ok(())
}

/// Validate the year of a history request
pub fn validate_year(year: i32) -> AppResult<()> {
    if !(YearConstraints::YEAR_MIN..=YearConstraints::YEAR_MAX).contains(&year) {
        return Err(AppError::BadRequest(format!(
            "Year {} out of valid range [{}, {}]",
            year,
            YearConstraints::YEAR_MIN,
            YearConstraints::YEAR_MAX
        )));
    }
    Ok(())
}

fn validate_name(name: &str) -> AppResult<()> {
    if name.trim().is_empty() {
        return Err(AppError::ValidationError(
            "Device name must not be blank".to_string(),
        ));
    }
    if name.chars().count() > 64 {
        return Err(AppError::ValidationError(
            "Device name must be 1-64 characters".to_string(),
        ));
    }
    Ok(())
}

fn validate_rating(field: &str, value: f64) -> AppResult<()> {
    if !value.is_finite() {
        return Err(AppError::ValidationError(format!(
            "{} must be a finite number",
            field
        )));
    }
    Ok(())
}
