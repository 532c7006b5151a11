//! HTTP gateway to the remote sprinkler device.
//!
//! The device exposes `GET {base}/status`, a JSON array with one `{"state": …}`
//! entry per zone (index = zone - 1), and `{method} {base}/{zone}/setState/{0|1}`.
//! Certificate validation is off so self-signed devices on the LAN work.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;

use crate::config::DeviceConfig;
use crate::error::{HubError, Result};

#[async_trait]
pub trait DeviceGateway: Send + Sync {
    /// Reported state of every zone, index 0 = zone 1.
    async fn status(&self) -> Result<Vec<bool>>;

    /// Command one zone (1-based) open or closed.
    async fn set_zone_state(&self, zone: usize, on: bool) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Status payload
// ---------------------------------------------------------------------------

/// Devices report `state` as either a JSON bool or 0/1.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Int(i64),
}

impl From<Flag> for bool {
    fn from(f: Flag) -> bool {
        match f {
            Flag::Bool(b) => b,
            Flag::Int(i) => i != 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ZoneReport {
    state: Flag,
}

/// Parse a status body, requiring at least one entry per configured zone.
/// Extra trailing entries are ignored.
pub fn parse_status(endpoint: &str, body: &str, zones: usize) -> Result<Vec<bool>> {
    let reports: Vec<ZoneReport> =
        serde_json::from_str(body).map_err(|e| HubError::parse(endpoint, e))?;
    if reports.len() < zones {
        return Err(HubError::parse(
            endpoint,
            format!("expected {zones} zones, got {}", reports.len()),
        ));
    }
    Ok(reports
        .into_iter()
        .take(zones)
        .map(|r| r.state.into())
        .collect())
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpGateway {
    http: reqwest::Client,
    base: String,
    method: Method,
    auth: Option<(String, String)>,
    zones: usize,
}

impl HttpGateway {
    pub fn new(cfg: &DeviceConfig) -> anyhow::Result<Self> {
        let method = Method::from_bytes(cfg.http_method.to_uppercase().as_bytes())
            .with_context(|| format!("invalid http method: {}", cfg.http_method))?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .danger_accept_invalid_certs(true)
            .build()
            .context("failed to build device http client")?;

        let auth = match (&cfg.username, &cfg.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        };

        Ok(Self {
            http,
            base: cfg.url.trim_end_matches('/').to_string(),
            method,
            auth,
            zones: cfg.zones,
        })
    }

    fn status_url(&self) -> String {
        format!("{}/status", self.base)
    }

    fn set_url(&self, zone: usize, on: bool) -> String {
        format!("{}/{zone}/setState/{}", self.base, u8::from(on))
    }

    /// Send one request and return the body of a successful response.
    async fn send(&self, method: Method, url: &str) -> Result<String> {
        let mut request = self.http.request(method, url);
        if let Some((user, pass)) = &self.auth {
            request = request.basic_auth(user, Some(pass));
        }

        let transport = |source: reqwest::Error| HubError::Transport {
            endpoint: url.to_string(),
            source: source.without_url(),
        };

        let response = request.send().await.map_err(transport)?;
        if !response.status().is_success() {
            return Err(HubError::Status {
                endpoint: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        response.text().await.map_err(transport)
    }
}

#[async_trait]
impl DeviceGateway for HttpGateway {
    async fn status(&self) -> Result<Vec<bool>> {
        let url = self.status_url();
        tracing::debug!(url = %url, "getting status");
        let body = self.send(Method::GET, &url).await?;
        tracing::debug!(body = %body, "device response");
        parse_status(&url, &body, self.zones)
    }

    async fn set_zone_state(&self, zone: usize, on: bool) -> Result<()> {
        if zone == 0 || zone > self.zones {
            return Err(HubError::UnknownZone(zone));
        }
        let url = self.set_url(zone, on);
        tracing::debug!(zone, url = %url, "setting state");
        self.send(self.method.clone(), &url).await?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
