use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};

use crate::error::{HubError, Result};
use crate::plan::ScheduleDecision;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

/// Buffered zone change notifications per subscriber.
const CHANGE_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    /// Outcome of the last status poll; `None` until the first one.
    pub device_reachable: Option<bool>,
    pub program_mode: ProgramMode,
    pub planner: PlannerPhase,
    pub decision: Option<ScheduleDecision>,
    pub zones: Vec<ZoneState>,
    pub events: VecDeque<SystemEvent>,
    changes: broadcast::Sender<ZoneChange>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ZoneState {
    pub zone: usize,
    /// Valve commanded open.
    pub active: bool,
    /// Valve reported flowing.
    pub in_use: bool,
    pub last_changed: Option<DateTime<Utc>>,
}

/// Emitted whenever a zone's flags actually change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZoneChange {
    pub zone: usize,
    pub active: bool,
    pub in_use: bool,
}

/// Whether a watering schedule is currently armed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(into = "u8")]
pub enum ProgramMode {
    #[default]
    Idle,
    Scheduled,
}

impl From<ProgramMode> for u8 {
    fn from(m: ProgramMode) -> u8 {
        match m {
            ProgramMode::Idle => 0,
            ProgramMode::Scheduled => 1,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum PlannerPhase {
    #[default]
    Idle,
    Disabled,
    Fetching,
    Scheduled {
        at: DateTime<Utc>,
        water: bool,
    },
    Retrying {
        attempt: u32,
        at: DateTime<Utc>,
    },
    Watering,
    Halted,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Valve,
    Poll,
    Schedule,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub device_reachable: Option<bool>,
    pub program_mode: ProgramMode,
    pub planner: PlannerPhase,
    pub decision: Option<ScheduleDecision>,
    pub zones: Vec<ZoneState>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(zone_count: usize) -> Self {
        let zones = (1..=zone_count)
            .map(|zone| ZoneState {
                zone,
                active: false,
                in_use: false,
                last_changed: None,
            })
            .collect();
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);

        Self {
            started_at: Instant::now(),
            device_reachable: None,
            program_mode: ProgramMode::Idle,
            planner: PlannerPhase::Idle,
            decision: None,
            zones,
            events: VecDeque::with_capacity(MAX_EVENTS),
            changes,
        }
    }

    pub fn shared(zone_count: usize) -> SharedState {
        Arc::new(RwLock::new(Self::new(zone_count)))
    }

    /// Receive a notification for every zone change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ZoneChange> {
        self.changes.subscribe()
    }

    pub fn zone(&self, zone: usize) -> Option<&ZoneState> {
        zone.checked_sub(1).and_then(|i| self.zones.get(i))
    }

    /// The single write path for zone flags. `None` leaves a flag untouched.
    /// Returns whether anything changed; a change is logged and broadcast.
    pub fn update_zone(
        &mut self,
        zone: usize,
        active: Option<bool>,
        in_use: Option<bool>,
    ) -> Result<bool> {
        let z = zone
            .checked_sub(1)
            .and_then(|i| self.zones.get_mut(i))
            .ok_or(HubError::UnknownZone(zone))?;

        let next_active = active.unwrap_or(z.active);
        let next_in_use = in_use.unwrap_or(z.in_use);
        if next_active == z.active && next_in_use == z.in_use {
            return Ok(false);
        }

        z.active = next_active;
        z.in_use = next_in_use;
        z.last_changed = Some(Utc::now());

        // No subscribers is fine.
        let _ = self.changes.send(ZoneChange {
            zone,
            active: next_active,
            in_use: next_in_use,
        });
        self.push_event(
            EventKind::Valve,
            format!(
                "zone {zone}: active={} in_use={}",
                on_off(next_active),
                on_off(next_in_use)
            ),
        );
        Ok(true)
    }

    /// Record the outcome of a status poll.
    pub fn record_poll(&mut self, reachable: bool) {
        if self.device_reachable != Some(reachable) {
            let detail = if reachable {
                "device reachable"
            } else {
                "device unreachable"
            };
            self.push_event(EventKind::Poll, detail.to_string());
        }
        self.device_reachable = Some(reachable);
    }

    pub fn set_planner(&mut self, phase: PlannerPhase) {
        self.planner = phase;
    }

    /// Store a fresh decision; the program mode is its projection.
    pub fn record_decision(&mut self, decision: ScheduleDecision) {
        self.program_mode = if decision.should_water {
            ProgramMode::Scheduled
        } else {
            ProgramMode::Idle
        };
        let detail = if decision.should_water {
            format!("watering scheduled for {}", decision.start.to_rfc3339())
        } else {
            format!("no watering, recalculating at {}", decision.start.to_rfc3339())
        };
        self.decision = Some(decision);
        self.push_event(EventKind::Schedule, detail);
    }

    pub fn clear_program(&mut self) {
        self.program_mode = ProgramMode::Idle;
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            device_reachable: self.device_reachable,
            program_mode: self.program_mode,
            planner: self.planner.clone(),
            decision: self.decision.clone(),
            zones: self.zones.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

fn on_off(v: bool) -> &'static str {
    if v {
        "on"
    } else {
        "off"
    }
}

// ===========================================================================
// Tests
// ===========================================================================
