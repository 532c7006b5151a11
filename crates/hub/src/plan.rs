//! Weather-driven schedule computation.
//!
//! Everything here is pure: given the schedule settings, the zone shares, a
//! two-day forecast and the current instant, [`decide`] produces the
//! [`ScheduleDecision`] the planner acts on.
//!
//! Durations are minutes, as `f64`. Watering ends `sunrise_offset_min`
//! minutes before sunrise, so it starts `total + offset` minutes before it.
//! When that instant has already passed today, tomorrow's sunrise is used.

use std::fmt;

use chrono::{DateTime, Datelike, TimeDelta, TimeZone, Utc};
use serde::Serialize;

use crate::config::ScheduleConfig;
use crate::forecast::{DailyForecast, Forecast};

/// Why a planning pass decided not to water.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    RestrictedDay { day: u32 },
    RestrictedMonth { month: u32 },
    RainToday { percent: i64 },
    RainTomorrow { percent: i64 },
    TooCold { temperature_min: f64 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RestrictedDay { day } => write!(f, "day {day} is restricted"),
            Self::RestrictedMonth { month } => write!(f, "month {month} is restricted"),
            Self::RainToday { percent } => write!(f, "{percent}% rain today"),
            Self::RainTomorrow { percent } => write!(f, "{percent}% rain tomorrow"),
            Self::TooCold { temperature_min } => {
                write!(f, "tomorrow's minimum {temperature_min}° is too cold")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleDecision {
    pub should_water: bool,
    pub start: DateTime<Utc>,
    pub finish: DateTime<Utc>,
    /// Watering budget per zone before the cycle split and zone share.
    pub max_duration_min: f64,
    /// Per-cycle run time, index 0 = zone 1.
    pub zone_durations_min: Vec<f64>,
    pub total_duration_min: f64,
    pub skipped: Vec<SkipReason>,
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

/// Watering budget for tomorrow. Adaptive mode scales with how far tomorrow's
/// maximum exceeds the minimum temperature, capped at `max_duration_min` and
/// floored at zero.
pub fn max_duration(cfg: &ScheduleConfig, tomorrow: &DailyForecast) -> f64 {
    if cfg.adaptive && tomorrow.temperature_min > cfg.min_temperature {
        (tomorrow.temperature_max - cfg.min_temperature)
            .min(cfg.max_duration_min)
            .max(0.0)
    } else {
        cfg.default_duration_min
    }
}

/// Per-cycle duration of every zone: `max / cycles / 100 * share`.
pub fn zone_durations(max_duration: f64, cycles: u32, percentages: &[f64]) -> Vec<f64> {
    let cycles = f64::from(cycles.max(1));
    percentages
        .iter()
        .map(|share| (max_duration / cycles / 100.0) * share)
        .collect()
}

/// Wall-clock length of a full run. Synchronous zones overlap, so the longest
/// zone bounds the run; asynchronous zones run back to back every cycle.
pub fn total_duration(durations: &[f64], cycles: u32, synchronous: bool) -> f64 {
    if synchronous {
        durations.iter().copied().fold(0.0, f64::max)
    } else {
        durations.iter().sum::<f64>() * f64::from(cycles)
    }
}

/// `None` when `m` is not finite or does not fit a `TimeDelta`.
pub fn minutes(m: f64) -> Option<TimeDelta> {
    let ms = (m * 60_000.0).round();
    if !ms.is_finite() || ms.abs() >= i64::MAX as f64 {
        return None;
    }
    TimeDelta::try_milliseconds(ms as i64)
}

// ---------------------------------------------------------------------------
// Timing
// ---------------------------------------------------------------------------

/// Start instant: `lead` minutes before today's sunrise, or before tomorrow's
/// when today's is already past. `None` when the lead leaves the calendar.
pub fn start_time(
    today_sunrise: DateTime<Utc>,
    tomorrow_sunrise: DateTime<Utc>,
    lead_min: f64,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let lead = minutes(lead_min)?;
    let start = today_sunrise.checked_sub_signed(lead)?;
    if start < now {
        tomorrow_sunrise.checked_sub_signed(lead)
    } else {
        Some(start)
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Compute one planning pass. Calendar restrictions are evaluated in the time
/// zone of `now`. Returns `None` when the run cannot be placed on the
/// calendar at all.
pub fn decide<Tz: TimeZone>(
    cfg: &ScheduleConfig,
    percentages: &[f64],
    forecast: &Forecast,
    now: &DateTime<Tz>,
) -> Option<ScheduleDecision> {
    let max = max_duration(cfg, &forecast.tomorrow);
    let durations = zone_durations(max, cfg.cycles, percentages);
    let total = total_duration(&durations, cfg.cycles, cfg.synchronous);

    let start = start_time(
        forecast.today.sunrise,
        forecast.tomorrow.sunrise,
        total + cfg.sunrise_offset_min,
        now.with_timezone(&Utc),
    )?;
    let finish = start.checked_add_signed(minutes(total)?)?;

    let local_start = start.with_timezone(&now.timezone());
    let day = local_start.weekday().num_days_from_sunday();
    let month = local_start.month0();
    let today_rain = forecast.today.rain_percent();
    let tomorrow_rain = forecast.tomorrow.rain_percent();

    let mut skipped = Vec::new();
    if cfg.restricted_days.contains(&day) {
        skipped.push(SkipReason::RestrictedDay { day });
    }
    if cfg.restricted_months.contains(&month) {
        skipped.push(SkipReason::RestrictedMonth { month });
    }
    if today_rain >= cfg.rain_threshold {
        skipped.push(SkipReason::RainToday { percent: today_rain });
    }
    if tomorrow_rain >= cfg.rain_threshold {
        skipped.push(SkipReason::RainTomorrow {
            percent: tomorrow_rain,
        });
    }
    if forecast.tomorrow.temperature_min <= cfg.min_temperature {
        skipped.push(SkipReason::TooCold {
            temperature_min: forecast.tomorrow.temperature_min,
        });
    }

    Some(ScheduleDecision {
        should_water: skipped.is_empty(),
        start,
        finish,
        max_duration_min: max,
        zone_durations_min: durations,
        total_duration_min: total,
        skipped,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
