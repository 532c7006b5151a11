//! Periodic device status polling.
//!
//! Every tick asks the device for its zone states and reconciles them into
//! the shared zone store. A failed poll leaves the zones as they were until
//! the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::gateway::DeviceGateway;
use crate::state::SharedState;

/// Poll forever. The first poll happens immediately.
pub async fn run(gateway: Arc<dyn DeviceGateway>, shared: SharedState, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(interval_sec = interval.as_secs(), "status poller started");

    loop {
        ticker.tick().await;
        poll_once(gateway.as_ref(), &shared).await;
    }
}

/// One poll. Returns whether the device answered.
pub async fn poll_once(gateway: &dyn DeviceGateway, shared: &SharedState) -> bool {
    match gateway.status().await {
        Ok(states) => {
            let mut st = shared.write().await;
            st.record_poll(true);
            for (i, on) in states.into_iter().enumerate() {
                let zone = i + 1;
                match st.update_zone(zone, Some(on), Some(on)) {
                    Ok(true) => tracing::info!(zone, state = u8::from(on), "updated state"),
                    Ok(false) => tracing::debug!(zone, state = u8::from(on), "state unchanged"),
                    Err(e) => tracing::warn!(zone, "ignoring reported state: {e}"),
                }
            }
            true
        }
        Err(e) => {
            tracing::warn!("error getting status: {e}");
            shared.write().await.record_poll(false);
            false
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
