//! Two-day weather forecast client.
//!
//! Requests daily-aggregated data only, in metric units, and extracts what the
//! planner needs from today and tomorrow. No caching and no internal retry:
//! every call is one round trip and the planner owns the retry policy.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ScheduleConfig;
use crate::error::{HubError, Result};

/// Sub-daily blocks the provider should leave out of the response.
const EXCLUDE: &str = "currently,minutely,hourly,alerts,flags";

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyForecast {
    pub sunrise: DateTime<Utc>,
    pub summary: String,
    /// 0.0..=1.0
    pub rain_probability: f64,
    pub temperature_min: f64,
    pub temperature_max: f64,
}

impl DailyForecast {
    /// Rain probability rounded to a whole percent.
    pub fn rain_percent(&self) -> i64 {
        (self.rain_probability * 100.0).round() as i64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Forecast {
    pub today: DailyForecast,
    pub tomorrow: DailyForecast,
}

#[async_trait]
pub trait ForecastSource: Send + Sync {
    async fn fetch(&self) -> Result<Forecast>;
}

// ---------------------------------------------------------------------------
// Provider wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireResponse {
    daily: WireDaily,
}

#[derive(Debug, Deserialize)]
struct WireDaily {
    data: Vec<WireDay>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDay {
    sunrise_time: i64,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    precip_probability: f64,
    temperature_min: f64,
    temperature_max: f64,
}

impl WireDay {
    fn into_daily(self, endpoint: &str) -> Result<DailyForecast> {
        let sunrise = DateTime::from_timestamp(self.sunrise_time, 0).ok_or_else(|| {
            HubError::parse(endpoint, format!("sunriseTime {} out of range", self.sunrise_time))
        })?;
        Ok(DailyForecast {
            sunrise,
            summary: self.summary,
            rain_probability: self.precip_probability,
            temperature_min: self.temperature_min,
            temperature_max: self.temperature_max,
        })
    }
}

/// Parse a provider response body into today's and tomorrow's forecast.
pub fn parse_forecast(endpoint: &str, body: &str) -> Result<Forecast> {
    let wire: WireResponse =
        serde_json::from_str(body).map_err(|e| HubError::parse(endpoint, e))?;

    let mut days = wire.daily.data.into_iter();
    let (Some(today), Some(tomorrow)) = (days.next(), days.next()) else {
        return Err(HubError::parse(endpoint, "expected at least two daily entries"));
    };

    Ok(Forecast {
        today: today.into_daily(endpoint)?,
        tomorrow: tomorrow.into_daily(endpoint)?,
    })
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

pub struct ForecastClient {
    http: reqwest::Client,
    url: String,
    /// `url` with the API key masked, for logs and errors.
    endpoint: String,
}

impl ForecastClient {
    pub fn new(cfg: &ScheduleConfig, timeout: Duration) -> anyhow::Result<Self> {
        let key = cfg.api_key.as_deref().context("schedule.api_key is not set")?;
        let lat = cfg.latitude.context("schedule.latitude is not set")?;
        let lon = cfg.longitude.context("schedule.longitude is not set")?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("sprinkler-hub/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build forecast http client")?;

        Ok(Self {
            http,
            url: forecast_url(&cfg.forecast_url, key, lat, lon),
            endpoint: forecast_url(&cfg.forecast_url, "****", lat, lon),
        })
    }
}

fn forecast_url(base: &str, key: &str, lat: f64, lon: f64) -> String {
    format!(
        "{}/{key}/{lat},{lon}?exclude={EXCLUDE}&units=si",
        base.trim_end_matches('/')
    )
}

#[async_trait]
impl ForecastSource for ForecastClient {
    async fn fetch(&self) -> Result<Forecast> {
        tracing::debug!(url = %self.endpoint, "retrieving weather data");

        let transport = |source: reqwest::Error| HubError::Transport {
            endpoint: self.endpoint.clone(),
            source: source.without_url(),
        };

        let response = self.http.get(&self.url).send().await.map_err(transport)?;
        if !response.status().is_success() {
            return Err(HubError::Status {
                endpoint: self.endpoint.clone(),
                status: response.status().as_u16(),
            });
        }
        let body = response.text().await.map_err(transport)?;
        tracing::debug!(body = %body, "weather data");

        parse_forecast(&self.endpoint, &body)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_config;

    const SAMPLE: &str = r#"{
        "latitude": 51.5,
        "longitude": -0.12,
        "daily": {
            "summary": "Light rain on Thursday.",
            "data": [
                {
                    "time": 1718406000,
                    "summary": "Clear throughout the day.",
                    "sunriseTime": 1718423040,
                    "precipProbability": 0.054,
                    "temperatureMin": 11.2,
                    "temperatureMax": 24.9
                },
                {
                    "time": 1718492400,
                    "summary": "Partly cloudy.",
                    "sunriseTime": 1718509445,
                    "precipProbability": 0.125,
                    "temperatureMin": 13.4,
                    "temperatureMax": 26.1
                },
                {
                    "time": 1718578800,
                    "summary": "Rain.",
                    "sunriseTime": 1718595850,
                    "precipProbability": 0.9,
                    "temperatureMin": 12.0,
                    "temperatureMax": 18.0
                }
            ]
        }
    }"#;

    // -- parse_forecast -----------------------------------------------------

    #[test]
    fn parses_today_and_tomorrow() {
        let f = parse_forecast("test", SAMPLE).unwrap();
        assert_eq!(f.today.sunrise.timestamp(), 1718423040);
        assert_eq!(f.today.summary, "Clear throughout the day.");
        assert_eq!(f.tomorrow.sunrise.timestamp(), 1718509445);
        assert_eq!(f.tomorrow.temperature_min, 13.4);
        assert_eq!(f.tomorrow.temperature_max, 26.1);
    }

    #[test]
    fn rain_percent_rounds() {
        let f = parse_forecast("test", SAMPLE).unwrap();
        assert_eq!(f.today.rain_percent(), 5);
        assert_eq!(f.tomorrow.rain_percent(), 13);
    }

    #[test]
    fn missing_summary_and_precip_default() {
        let body = r#"{"daily":{"data":[
            {"sunriseTime":1718423040,"temperatureMin":1,"temperatureMax":2},
            {"sunriseTime":1718509445,"temperatureMin":3,"temperatureMax":4}
        ]}}"#;
        let f = parse_forecast("test", body).unwrap();
        assert_eq!(f.today.summary, "");
        assert_eq!(f.today.rain_percent(), 0);
    }

    #[test]
    fn single_day_is_parse_error() {
        let body = r#"{"daily":{"data":[
            {"sunriseTime":1718423040,"temperatureMin":1,"temperatureMax":2}
        ]}}"#;
        let err = parse_forecast("test", body).unwrap_err();
        assert!(matches!(err, HubError::Parse { .. }));
        assert!(err.to_string().contains("at least two daily entries"));
    }

    #[test]
    fn invalid_json_is_parse_error() {
        let err = parse_forecast("test", "<html>502 Bad Gateway</html>").unwrap_err();
        assert!(matches!(err, HubError::Parse { .. }));
    }

    #[test]
    fn missing_daily_block_is_parse_error() {
        let err = parse_forecast("test", r#"{"currently":{}}"#).unwrap_err();
        assert!(matches!(err, HubError::Parse { .. }));
    }

    // -- URL ----------------------------------------------------------------

    #[test]
    fn url_requests_daily_metric_data() {
        let url = forecast_url("https://api.example.com/forecast/", "KEY", 51.5, -0.12);
        assert_eq!(
            url,
            "https://api.example.com/forecast/KEY/51.5,-0.12?exclude=currently,minutely,hourly,alerts,flags&units=si"
        );
    }

    #[test]
    fn client_endpoint_masks_api_key() {
        let cfg = test_config(2);
        let client = ForecastClient::new(&cfg.schedule, Duration::from_secs(3)).unwrap();
        assert!(client.url.contains("test-key"));
        assert!(!client.endpoint.contains("test-key"));
        assert!(client.endpoint.contains("****"));
    }

    #[tokio::test]
    async fn transport_error_never_shows_api_key() {
        let mut cfg = test_config(2).schedule;
        // Nothing listens on the discard port.
        cfg.forecast_url = "http://127.0.0.1:9/forecast".into();
        let client = ForecastClient::new(&cfg, Duration::from_secs(3)).unwrap();

        let err = client.fetch().await.unwrap_err();

        assert!(matches!(err, HubError::Transport { .. }));
        let msg = format!("{err} {:?}", std::error::Error::source(&err));
        assert!(!msg.contains("test-key"), "key leaked: {msg}");
        assert!(msg.contains("****"));
    }

    #[test]
    fn client_requires_api_key() {
        let mut cfg = test_config(2);
        cfg.schedule.api_key = None;
        assert!(ForecastClient::new(&cfg.schedule, Duration::from_secs(3)).is_err());
    }
}
