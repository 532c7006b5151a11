//! Weather-driven planner: fetches the forecast, decides whether and when to
//! water, and owns the single timer that fires the next action.
//!
//! ## State machine
//!
//! ```text
//!            ┌────────[fetch failed / start already past]────────┐
//!            ▼                                                    │
//! Idle ──▶ Fetching ──[water]──▶ Scheduled ──[start]──▶ Watering ─┤
//!            ▲   │                                                │
//!            │   └──[skip]──▶ Scheduled ──[start]─────────────────┤
//!            │                                                    ▼
//!            └──────────[retry interval]──── Retrying ◀───────────┘
//!                                               │
//!                                   [ceiling hit]──▶ Halted
//! ```
//!
//! A skipped day re-evaluates at the time watering would have started. Only
//! one timer is ever armed; a recalculation request cancels it and re-enters
//! `Fetching` immediately, which is also the only way out of `Halted`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, TimeDelta, TimeZone, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ScheduleConfig;
use crate::forecast::{Forecast, ForecastSource};
use crate::plan::{self, ScheduleDecision};
use crate::state::{PlannerPhase, SharedState};
use crate::valve::Valves;
use crate::watering;

/// What the planner does after a planning pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Arm the timer for `decision.start` and water when it fires.
    Water(ScheduleDecision),
    /// Conditions said no; look again at this instant.
    Recheck(DateTime<Utc>),
    /// The pass failed; try again after the delay.
    Retry { attempt: u32, after: Duration },
    /// Too many consecutive failures; wait for a recalculation request.
    Halt,
}

pub struct Planner {
    cfg: ScheduleConfig,
    percentages: Vec<f64>,
    forecast: Arc<dyn ForecastSource>,
    valves: Valves,
    shared: SharedState,
    replan: Arc<Notify>,
    failures: u32,
}

impl Planner {
    pub fn new(
        cfg: ScheduleConfig,
        percentages: Vec<f64>,
        forecast: Arc<dyn ForecastSource>,
        valves: Valves,
        shared: SharedState,
        replan: Arc<Notify>,
    ) -> Self {
        Self {
            cfg,
            percentages,
            forecast,
            valves,
            shared,
            replan,
            failures: 0,
        }
    }

    /// Run the planner loop forever. Intended to be `tokio::spawn`-ed from
    /// main, and only when scheduling is enabled.
    pub async fn run(mut self) {
        info!(
            synchronous = self.cfg.synchronous,
            adaptive = self.cfg.adaptive,
            cycles = self.cfg.cycles,
            "planner started"
        );

        loop {
            self.shared.write().await.set_planner(PlannerPhase::Fetching);

            let step = self.plan(&Local::now()).await;
            // Requests made while watering or fetching are answered by this pass.
            self.discard_pending_request().await;

            match step {
                Step::Water(decision) => {
                    self.shared.write().await.set_planner(PlannerPhase::Scheduled {
                        at: decision.start,
                        water: true,
                    });
                    if self.wait_until(decision.start).await {
                        self.water(&decision).await;
                    } else {
                        self.shared.write().await.clear_program();
                    }
                }
                Step::Recheck(at) => {
                    self.shared
                        .write()
                        .await
                        .set_planner(PlannerPhase::Scheduled { at, water: false });
                    self.wait_until(at).await;
                }
                Step::Retry { attempt, after } => {
                    let at = TimeDelta::from_std(after)
                        .ok()
                        .and_then(|d| Utc::now().checked_add_signed(d))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    self.shared
                        .write()
                        .await
                        .set_planner(PlannerPhase::Retrying { attempt, at });
                    self.wait_until(at).await;
                }
                Step::Halt => {
                    self.shared.write().await.set_planner(PlannerPhase::Halted);
                    self.replan.notified().await;
                    info!("recalculation requested, leaving halted state");
                    self.failures = 0;
                }
            }
        }
    }

    /// One planning pass: fetch, decide, and pick the next step.
    pub async fn plan<Tz: TimeZone>(&mut self, now: &DateTime<Tz>) -> Step {
        let forecast = match self.forecast.fetch().await {
            Ok(f) => f,
            Err(e) => {
                warn!("error fetching forecast: {e}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("forecast: {e}"));
                return self.failed();
            }
        };
        log_forecast(&forecast);

        let Some(decision) = plan::decide(&self.cfg, &self.percentages, &forecast, now) else {
            warn!("watering run does not fit the calendar");
            self.shared
                .write()
                .await
                .record_error("watering run does not fit the calendar".to_string());
            return self.failed();
        };
        if decision.start <= now.with_timezone(&Utc) {
            warn!(start = %decision.start, "computed start is not in the future");
            self.shared
                .write()
                .await
                .record_error(format!("start {} already passed", decision.start.to_rfc3339()));
            return self.failed();
        }

        self.failures = 0;
        self.log_decision(&decision);
        self.shared.write().await.record_decision(decision.clone());

        if decision.should_water {
            Step::Water(decision)
        } else {
            Step::Recheck(decision.start)
        }
    }

    fn failed(&mut self) -> Step {
        self.failures += 1;
        match self.cfg.max_retries {
            Some(max) if self.failures >= max => {
                error!(
                    failures = self.failures,
                    "giving up until a recalculation is requested"
                );
                Step::Halt
            }
            _ => {
                let after = Duration::from_secs(self.cfg.retry_interval_secs);
                info!(
                    attempt = self.failures,
                    "retrying in {} seconds",
                    after.as_secs()
                );
                Step::Retry {
                    attempt: self.failures,
                    after,
                }
            }
        }
    }

    /// Wait until `at` unless a recalculation request cancels the timer.
    /// Returns whether the timer fired.
    ///
    /// The monotonic clock stops while the host is suspended, so the wait is
    /// sliced and fires as soon as either the monotonic deadline or the wall
    /// clock reaches `at`.
    async fn wait_until(&self, at: DateTime<Utc>) -> bool {
        let deadline = Instant::now().checked_add(until(at));
        loop {
            let monotonic_left =
                deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()));
            let left = next_slice(until(at), monotonic_left);
            if left.is_zero() {
                return true;
            }
            tokio::select! {
                _ = tokio::time::sleep(left) => {}
                _ = self.replan.notified() => {
                    info!("recalculation requested, cancelling pending timer");
                    return false;
                }
            }
        }
    }

    /// Drop a recalculation request that arrived before the latest pass.
    async fn discard_pending_request(&self) {
        tokio::select! {
            biased;
            _ = self.replan.notified() => {
                debug!("recalculation request already covered by this pass");
            }
            _ = std::future::ready(()) => {}
        }
    }

    async fn water(&self, decision: &ScheduleDecision) {
        info!(
            mode = mode(self.cfg.synchronous),
            finish = %decision.finish.with_timezone(&Local),
            "starting watering"
        );
        {
            let mut st = self.shared.write().await;
            st.set_planner(PlannerPhase::Watering);
            st.record_system(format!(
                "{} watering started",
                mode(self.cfg.synchronous)
            ));
        }

        watering::run(
            &self.valves,
            &decision.zone_durations_min,
            self.cfg.cycles,
            self.cfg.synchronous,
        )
        .await;

        let mut st = self.shared.write().await;
        st.clear_program();
        st.record_system("watering finished".to_string());
    }

    fn log_decision(&self, decision: &ScheduleDecision) {
        info!(
            "watering mode: {}, {} minutes max",
            mode(self.cfg.synchronous),
            round2(decision.max_duration_min)
        );
        for (i, minutes) in decision.zone_durations_min.iter().enumerate() {
            info!(
                "Zone {} | {}x {} minute cycles",
                i + 1,
                self.cfg.cycles,
                round2(*minutes)
            );
        }
        info!(
            "total watering time: {} minutes",
            round2(decision.total_duration_min)
        );

        let start = decision.start.with_timezone(&Local);
        let finish = decision.finish.with_timezone(&Local);
        if decision.should_water {
            info!("watering starts at {start}, finishes at {finish}");
        } else {
            let reasons: Vec<String> = decision.skipped.iter().map(ToString::to_string).collect();
            info!(
                "no watering today ({}), recalculating at {start}",
                reasons.join(", ")
            );
        }
    }
}

fn log_forecast(forecast: &Forecast) {
    let today = &forecast.today;
    let tomorrow = &forecast.tomorrow;
    info!(
        "today: {} sunrise {}, {}% chance of rain",
        today.summary,
        today.sunrise.with_timezone(&Local),
        today.rain_percent()
    );
    info!(
        "tomorrow: {} sunrise {}, {}% chance of rain, {}° to {}°",
        tomorrow.summary,
        tomorrow.sunrise.with_timezone(&Local),
        tomorrow.rain_percent(),
        tomorrow.temperature_min,
        tomorrow.temperature_max
    );
}

fn until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

/// Longest single sleep before the wall clock is consulted again.
const MAX_SLICE: Duration = Duration::from_secs(60);

fn next_slice(wall_left: Duration, monotonic_left: Duration) -> Duration {
    wall_left.min(monotonic_left).min(MAX_SLICE)
}

fn mode(synchronous: bool) -> &'static str {
    if synchronous {
        "synchronous"
    } else {
        "asynchronous"
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ===========================================================================
// Tests
// ===========================================================================
