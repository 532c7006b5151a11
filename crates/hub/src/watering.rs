//! Watering run execution.
//!
//! Asynchronous mode waters one zone at a time in ascending order, cycle after
//! cycle. Synchronous mode opens every zone at once and lets each zone repeat
//! its own cycles on its own timer, independent of the others.
//!
//! A run always finishes: command failures are logged by [`Valves::set`] and
//! the sequence carries on, and zero-length zones close immediately.

use std::time::Duration;

use tokio::task::JoinSet;

use crate::valve::Valves;

/// Timer length for a zone run; non-positive and non-finite values fire at once.
pub fn run_time(minutes: f64) -> Duration {
    if minutes.is_finite() && minutes > 0.0 {
        Duration::from_secs_f64(minutes * 60.0)
    } else {
        Duration::ZERO
    }
}

pub async fn run(valves: &Valves, durations: &[f64], cycles: u32, synchronous: bool) {
    if synchronous {
        run_synchronous(valves, durations, cycles).await;
    } else {
        run_asynchronous(valves, durations, cycles).await;
    }
}

pub async fn run_asynchronous(valves: &Valves, durations: &[f64], cycles: u32) {
    for cycle in 1..=cycles {
        tracing::info!("starting watering cycle {cycle}/{cycles}");
        for (i, minutes) in durations.iter().enumerate() {
            water_zone(valves, i + 1, *minutes).await;
        }
    }
    tracing::info!("watering finished");
}

pub async fn run_synchronous(valves: &Valves, durations: &[f64], cycles: u32) {
    let mut zones = JoinSet::new();

    for (i, minutes) in durations.iter().copied().enumerate() {
        let zone = i + 1;
        let valves = valves.clone();
        zones.spawn(async move {
            for cycle in 1..=cycles {
                tracing::info!(zone, "starting watering cycle {cycle}/{cycles}");
                water_zone(&valves, zone, minutes).await;
            }
            tracing::info!(zone, "watering finished");
        });
    }

    while let Some(joined) = zones.join_next().await {
        if let Err(e) = joined {
            tracing::error!("zone watering task failed: {e}");
        }
    }
}

async fn water_zone(valves: &Valves, zone: usize, minutes: f64) {
    // Failures are already logged and recorded; the run keeps its timing.
    let _ = valves.set(zone, true).await;
    tokio::time::sleep(run_time(minutes)).await;
    let _ = valves.set(zone, false).await;
}

// ===========================================================================
// Tests
// ===========================================================================
