//! Valve control through the device gateway.
//!
//! `Valves::set` is the host "set active" action: it marks the zone as
//! commanded, sends the command, and marks it in use once the device
//! acknowledges. Commands to the same zone are serialized so a command and
//! its state update never interleave with another command for that zone.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{HubError, Result};
use crate::gateway::DeviceGateway;
use crate::state::SharedState;

#[derive(Clone)]
pub struct Valves {
    gateway: Arc<dyn DeviceGateway>,
    shared: SharedState,
    locks: Arc<Vec<Mutex<()>>>, // index = zone - 1
}

impl Valves {
    pub fn new(gateway: Arc<dyn DeviceGateway>, shared: SharedState, zones: usize) -> Self {
        let locks = (0..zones).map(|_| Mutex::new(())).collect();
        Self {
            gateway,
            shared,
            locks: Arc::new(locks),
        }
    }

    pub fn zones(&self) -> usize {
        self.locks.len()
    }

    pub async fn set(&self, zone: usize, on: bool) -> Result<()> {
        let lock = zone
            .checked_sub(1)
            .and_then(|i| self.locks.get(i))
            .ok_or(HubError::UnknownZone(zone))?;
        let _guard = lock.lock().await;

        self.shared.write().await.update_zone(zone, Some(on), None)?;

        match self.gateway.set_zone_state(zone, on).await {
            Ok(()) => {
                tracing::info!(zone, state = u8::from(on), "set state");
                self.shared.write().await.update_zone(zone, None, Some(on))?;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(zone, "error setting state: {e}");
                self.shared
                    .write()
                    .await
                    .record_error(format!("zone {zone}: {e}"));
                Err(e)
            }
        }
    }

    /// Best-effort fail-safe: command every zone off.
    pub async fn all_off(&self) {
        for zone in 1..=self.zones() {
            if let Err(e) = self.set(zone, false).await {
                tracing::error!(zone, "all-off failed: {e}");
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
