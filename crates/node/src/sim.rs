//! Simulated sprinkler valve controller for local development.
//!
//! Models the remote device the hub talks to:
//! - One valve per zone, all closed at power-on
//! - Accumulated open time per zone
//! - Random request failures at a configurable rate (flaky Wi-Fi, busy MCU)

use std::time::{Duration, Instant};

use serde::Serialize;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SimError {
    /// Zone outside `1..=zones`.
    #[error("zone {0} does not exist")]
    UnknownZone(usize),
}

// ---------------------------------------------------------------------------
// Status payload
// ---------------------------------------------------------------------------

/// One entry of the `/status` array. `state` is 0 or 1.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneStatus {
    pub zone: usize,
    pub state: u8,
    pub seconds_open: u64,
}

// ---------------------------------------------------------------------------
// Per-valve state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Valve {
    /// Set while open.
    opened_at: Option<Instant>,
    /// Open time from previous runs.
    total: Duration,
}

impl Valve {
    fn is_open(&self) -> bool {
        self.opened_at.is_some()
    }

    fn open_time(&self, now: Instant) -> Duration {
        self.total + self.opened_at.map_or(Duration::ZERO, |t| now - t)
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct SprinklerSim {
    valves: Vec<Valve>,
    fail_rate: f64,
}

impl SprinklerSim {
    /// `fail_rate` is the probability (clamped to 0.0–1.0) that a request is
    /// answered with an error.
    pub fn new(zones: usize, fail_rate: f64) -> Self {
        let fail_rate = if fail_rate.is_finite() {
            fail_rate.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            valves: (0..zones).map(|_| Valve::default()).collect(),
            fail_rate,
        }
    }

    pub fn zones(&self) -> usize {
        self.valves.len()
    }

    pub fn fail_rate(&self) -> f64 {
        self.fail_rate
    }

    /// Roll the dice for an injected failure.
    pub fn should_fail(&self) -> bool {
        self.fail_rate > 0.0 && fastrand::f64() < self.fail_rate
    }

    pub fn status(&self) -> Vec<ZoneStatus> {
        let now = Instant::now();
        self.valves
            .iter()
            .enumerate()
            .map(|(i, v)| ZoneStatus {
                zone: i + 1,
                state: u8::from(v.is_open()),
                seconds_open: v.open_time(now).as_secs(),
            })
            .collect()
    }

    /// Open or close a valve. Returns whether the valve changed.
    pub fn set(&mut self, zone: usize, on: bool) -> Result<bool, SimError> {
        let valve = zone
            .checked_sub(1)
            .and_then(|i| self.valves.get_mut(i))
            .ok_or(SimError::UnknownZone(zone))?;

        match (valve.opened_at, on) {
            (None, true) => {
                valve.opened_at = Some(Instant::now());
                Ok(true)
            }
            (Some(since), false) => {
                valve.total += since.elapsed();
                valve.opened_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Close every valve. Returns the zones that were open.
    pub fn close_all(&mut self) -> Vec<usize> {
        let open: Vec<usize> = (1..=self.zones())
            .filter(|&z| self.valves[z - 1].is_open())
            .collect();
        for &zone in &open {
            // Zones come from the valve list, so they exist.
            let _ = self.set(zone, false);
        }
        open
    }
}

// ===========================================================================
// Tests
// ===========================================================================
