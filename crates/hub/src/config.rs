//! TOML config file loading and validation for the device, the push listener,
//! the weather-driven schedule, and accessory identification.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub name: String,
    pub device: DeviceConfig,
    pub listener: ListenerConfig,
    pub schedule: ScheduleConfig,
    pub info: InfoConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Base URL of the sprinkler device, e.g. `http://192.168.1.40`.
    pub url: String,
    pub zones: usize,
    pub poll_interval_secs: u64,
    pub timeout_ms: u64,
    pub http_method: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Accept pushed zone state on `/{zone}/state/{value}`.
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub adaptive: bool,
    pub synchronous: bool,

    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub api_key: Option<String>,
    pub forecast_url: String,

    /// Days of week (0 = Sunday) on which watering never starts.
    pub restricted_days: Vec<u32>,
    /// Months (0 = January) in which watering never starts.
    pub restricted_months: Vec<u32>,
    /// Rain probability in percent at or above which watering is skipped.
    pub rain_threshold: i64,
    /// Minutes between watering finish and sunrise. May be negative.
    pub sunrise_offset_min: f64,
    /// Degrees Celsius that tomorrow's minimum must exceed.
    pub min_temperature: f64,

    pub default_duration_min: f64,
    pub cycles: u32,
    pub max_duration_min: f64,
    /// One share per zone, in percent. Defaults to 100 for every zone.
    pub zone_percentages: Option<Vec<f64>>,

    pub retry_interval_secs: u64,
    /// Consecutive failed forecast fetches before the planner halts.
    /// Unset means retry forever.
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InfoConfig {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub firmware: Option<String>,
}

/// Identification metadata with defaults resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Identity {
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "Sprinklers".into(),
            device: DeviceConfig::default(),
            listener: ListenerConfig::default(),
            schedule: ScheduleConfig::default(),
            info: InfoConfig::default(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            zones: 6,
            poll_interval_secs: 300,
            timeout_ms: 3000,
            http_method: "GET".into(),
            username: None,
            password: None,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 2000,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            adaptive: true,
            synchronous: false,
            latitude: None,
            longitude: None,
            api_key: None,
            forecast_url: "https://api.darksky.net/forecast".into(),
            restricted_days: Vec::new(),
            restricted_months: Vec::new(),
            rain_threshold: 40,
            sunrise_offset_min: 0.0,
            min_temperature: 10.0,
            default_duration_min: 5.0,
            cycles: 2,
            max_duration_min: 30.0,
            zone_percentages: None,
            retry_interval_secs: 60,
            max_retries: None,
        }
    }
}

const HTTP_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH"];

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl Config {
    /// Per-zone percentage shares, one per configured zone.
    pub fn zone_percentages(&self) -> Vec<f64> {
        match &self.schedule.zone_percentages {
            Some(p) => p.clone(),
            None => vec![100.0; self.device.zones],
        }
    }

    pub fn identity(&self) -> Identity {
        Identity {
            name: self.name.clone(),
            manufacturer: self
                .info
                .manufacturer
                .clone()
                .unwrap_or_else(|| "Sprinkler Hub".into()),
            model: self
                .info
                .model
                .clone()
                .unwrap_or_else(|| env!("CARGO_PKG_NAME").into()),
            serial: self
                .info
                .serial
                .clone()
                .unwrap_or_else(|| self.device.url.clone()),
            firmware: self
                .info
                .firmware
                .clone()
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all settings. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_device(&mut errors);
        self.validate_schedule(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_device(&self, errors: &mut Vec<String>) {
        let d = &self.device;

        if d.url.trim().is_empty() {
            errors.push("device.url is empty".into());
        } else if !(d.url.starts_with("http://") || d.url.starts_with("https://")) {
            errors.push(format!("device.url '{}' must start with http:// or https://", d.url));
        }
        if d.zones == 0 {
            errors.push("device.zones must be at least 1".into());
        }
        if d.poll_interval_secs == 0 {
            errors.push("device.poll_interval_secs must be positive".into());
        }
        if d.timeout_ms == 0 {
            errors.push("device.timeout_ms must be positive".into());
        }
        if !HTTP_METHODS.contains(&d.http_method.to_uppercase().as_str()) {
            errors.push(format!(
                "device.http_method '{}' is not one of {}",
                d.http_method,
                HTTP_METHODS.join(", ")
            ));
        }
        if d.username.is_some() != d.password.is_some() {
            errors.push("device.username and device.password must be set together".into());
        }
    }

    fn validate_schedule(&self, errors: &mut Vec<String>) {
        let s = &self.schedule;

        // ── Zone shares ─────────────────────────────────────────
        if let Some(p) = &s.zone_percentages {
            if p.len() != self.device.zones {
                errors.push(format!(
                    "schedule.zone_percentages has {} entries but device.zones is {}",
                    p.len(),
                    self.device.zones
                ));
            }
            for (i, share) in p.iter().enumerate() {
                if !share.is_finite() || *share < 0.0 {
                    errors.push(format!(
                        "schedule.zone_percentages[{i}] must be a non-negative number, got {share}"
                    ));
                }
            }
        }

        // ── Durations ───────────────────────────────────────────
        if s.cycles == 0 {
            errors.push("schedule.cycles must be at least 1".into());
        }
        check_range(
            errors,
            "schedule.default_duration_min",
            s.default_duration_min,
            0.0..=MINUTES_PER_DAY,
        );
        check_range(
            errors,
            "schedule.max_duration_min",
            s.max_duration_min,
            0.0..=MINUTES_PER_DAY,
        );
        check_range(
            errors,
            "schedule.sunrise_offset_min",
            s.sunrise_offset_min,
            -MINUTES_PER_DAY..=MINUTES_PER_DAY,
        );
        check_range(
            errors,
            "schedule.min_temperature",
            s.min_temperature,
            -100.0..=100.0,
        );
        if s.retry_interval_secs == 0 {
            errors.push("schedule.retry_interval_secs must be positive".into());
        }

        // ── Calendar and weather thresholds ─────────────────────
        if !(0..=100).contains(&s.rain_threshold) {
            errors.push(format!(
                "schedule.rain_threshold {} out of range [0, 100]",
                s.rain_threshold
            ));
        }
        for day in &s.restricted_days {
            if *day > 6 {
                errors.push(format!(
                    "schedule.restricted_days: {day} out of range [0, 6]"
                ));
            }
        }
        for month in &s.restricted_months {
            if *month > 11 {
                errors.push(format!(
                    "schedule.restricted_months: {month} out of range [0, 11]"
                ));
            }
        }

        // ── Forecast access (only needed when scheduling) ───────
        if !s.enabled {
            return;
        }
        match &s.api_key {
            Some(k) if !k.trim().is_empty() => {}
            _ => errors.push("schedule.api_key is required when scheduling is enabled".into()),
        }
        match s.latitude {
            None => errors.push("schedule.latitude is required when scheduling is enabled".into()),
            Some(lat) if !(-90.0..=90.0).contains(&lat) => {
                errors.push(format!("schedule.latitude {lat} out of range [-90, 90]"))
            }
            Some(_) => {}
        }
        match s.longitude {
            None => {
                errors.push("schedule.longitude is required when scheduling is enabled".into())
            }
            Some(lon) if !(-180.0..=180.0).contains(&lon) => {
                errors.push(format!("schedule.longitude {lon} out of range [-180, 180]"))
            }
            Some(_) => {}
        }
        if s.forecast_url.trim().is_empty() {
            errors.push("schedule.forecast_url is empty".into());
        }
    }
}

const MINUTES_PER_DAY: f64 = 1440.0;

/// Rejects non-finite values as well as those outside `range`.
fn check_range(
    errors: &mut Vec<String>,
    name: &str,
    value: f64,
    range: std::ops::RangeInclusive<f64>,
) {
    if !value.is_finite() || !range.contains(&value) {
        errors.push(format!(
            "{name} {value} out of range [{}, {}]",
            range.start(),
            range.end()
        ));
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
