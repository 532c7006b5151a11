//! Fakes and builders shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

use crate::config::Config;
use crate::error::{HubError, Result};
use crate::forecast::{DailyForecast, Forecast, ForecastSource};
use crate::gateway::DeviceGateway;

/// A valid config for `zones` zones with scheduling enabled.
pub fn test_config(zones: usize) -> Config {
    let mut cfg = Config::default();
    cfg.device.url = "http://sprinkler.test".into();
    cfg.device.zones = zones;
    cfg.schedule.api_key = Some("test-key".into());
    cfg.schedule.latitude = Some(51.5);
    cfg.schedule.longitude = Some(-0.12);
    cfg.schedule.zone_percentages = Some(vec![100.0; zones]);
    cfg
}

/// Dry, warm forecast with sunrise at `today_sunrise` and 24h later.
pub fn sample_forecast(today_sunrise: DateTime<Utc>) -> Forecast {
    Forecast {
        today: DailyForecast {
            sunrise: today_sunrise,
            summary: "Clear throughout the day.".into(),
            rain_probability: 0.05,
            temperature_min: 14.0,
            temperature_max: 24.0,
        },
        tomorrow: DailyForecast {
            sunrise: today_sunrise + TimeDelta::hours(24),
            summary: "Partly cloudy.".into(),
            rain_probability: 0.1,
            temperature_min: 15.0,
            temperature_max: 25.0,
        },
    }
}

fn unavailable(endpoint: &str) -> HubError {
    HubError::Status {
        endpoint: endpoint.into(),
        status: 503,
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetCall {
    pub zone: usize,
    pub on: bool,
    pub at: Instant,
}

/// Records every command; answers status from a settable snapshot.
pub struct FakeGateway {
    pub calls: Mutex<Vec<SetCall>>,
    /// `None` makes `status` fail.
    pub status: Mutex<Option<Vec<bool>>>,
    pub status_calls: AtomicUsize,
    pub fail_set: AtomicBool,
}

impl FakeGateway {
    pub fn new(zones: usize) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            status: Mutex::new(Some(vec![false; zones])),
            status_calls: AtomicUsize::new(0),
            fail_set: AtomicBool::new(false),
        }
    }

    pub fn pairs(&self) -> Vec<(usize, bool)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| (c.zone, c.on))
            .collect()
    }

    pub fn set_status(&self, status: Option<Vec<bool>>) {
        *self.status.lock().unwrap() = status;
    }
}

#[async_trait]
impl DeviceGateway for FakeGateway {
    async fn status(&self) -> Result<Vec<bool>> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.status
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| unavailable("fake://status"))
    }

    async fn set_zone_state(&self, zone: usize, on: bool) -> Result<()> {
        self.calls.lock().unwrap().push(SetCall {
            zone,
            on,
            at: Instant::now(),
        });
        if self.fail_set.load(Ordering::SeqCst) {
            return Err(unavailable("fake://setState"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Forecast
// ---------------------------------------------------------------------------

/// Replays queued forecasts; `None` entries (or an empty queue) fail.
pub struct FakeForecast {
    pub queue: Mutex<VecDeque<Option<Forecast>>>,
    pub fetches: AtomicUsize,
}

impl FakeForecast {
    pub fn new(responses: Vec<Option<Forecast>>) -> Self {
        Self {
            queue: Mutex::new(responses.into()),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ForecastSource for FakeForecast {
    async fn fetch(&self) -> Result<Forecast> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .flatten()
            .ok_or_else(|| unavailable("fake://forecast"))
    }
}
