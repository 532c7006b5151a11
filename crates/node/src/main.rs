mod sim;

use std::{env, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sim::{SimError, SprinklerSim};

#[derive(Clone)]
struct NodeState {
    sim: Arc<Mutex<SprinklerSim>>,
    push: Option<Pusher>,
}

/// Reports valve changes back to the hub's listener.
#[derive(Clone)]
struct Pusher {
    http: reqwest::Client,
    base: String,
}

impl Pusher {
    fn new(base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(3))
            .build()
            .context("failed to build push client")?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, zone: usize, on: bool) -> String {
        format!("{}/{zone}/state/{}", self.base, u8::from(on))
    }

    async fn push(&self, zone: usize, on: bool) {
        let url = self.url(zone, on);
        match self.http.get(&url).send().await {
            Ok(res) if res.status().is_success() => tracing::debug!(%url, "pushed state"),
            Ok(res) => tracing::warn!(%url, status = res.status().as_u16(), "push rejected"),
            Err(e) => tracing::warn!(%url, "push failed: {e}"),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sprinkler_node=debug,info".into()),
        )
        .init();

    // Env config
    let zones: usize = env_or("ZONES", 6);
    let port: u16 = env_or("PORT", 8081);
    let fail_rate: f64 = env_or("FAIL_RATE", 0.0);
    let push = match env::var("PUSH_URL") {
        Ok(url) if !url.trim().is_empty() => Some(Pusher::new(&url)?),
        _ => None,
    };

    let sim = SprinklerSim::new(zones, fail_rate);
    tracing::info!(
        zones,
        fail_rate = sim.fail_rate(),
        push = push.as_ref().map(|p| p.base.as_str()),
        "simulated sprinkler ready"
    );

    let state = NodeState {
        sim: Arc::new(Mutex::new(sim)),
        push,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on http://{addr}");

    let sim = state.sim.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server error")?;

    let closed = sim.lock().await.close_all();
    tracing::info!(?closed, "shut down, all valves closed");
    Ok(())
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

fn router(state: NodeState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/{zone}/setState/{value}", any(set_state))
        .with_state(state)
}

fn unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "simulated failure").into_response()
}

async fn status(State(state): State<NodeState>) -> Response {
    let sim = state.sim.lock().await;
    if sim.should_fail() {
        tracing::warn!("injecting status failure");
        return unavailable();
    }
    Json(sim.status()).into_response()
}

async fn set_state(
    State(state): State<NodeState>,
    Path((zone, value)): Path<(usize, String)>,
) -> Response {
    let on = match value.as_str() {
        "0" => false,
        "1" => true,
        _ => return (StatusCode::BAD_REQUEST, "value must be 0 or 1").into_response(),
    };

    let changed = {
        let mut sim = state.sim.lock().await;
        if sim.should_fail() {
            tracing::warn!(zone, "injecting setState failure");
            return unavailable();
        }
        match sim.set(zone, on) {
            Ok(changed) => changed,
            Err(e @ SimError::UnknownZone(_)) => {
                return (StatusCode::NOT_FOUND, e.to_string()).into_response();
            }
        }
    };

    tracing::info!(zone, state = u8::from(on), changed, "valve set");
    if changed {
        if let Some(push) = state.push.clone() {
            tokio::spawn(async move { push.push(zone, on).await });
        }
    }
    (StatusCode::OK, "OK").into_response()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn node(zones: usize, fail_rate: f64) -> NodeState {
        NodeState {
            sim: Arc::new(Mutex::new(SprinklerSim::new(zones, fail_rate))),
            push: None,
        }
    }

    async fn send(state: &NodeState, method: Method, uri: &str) -> (StatusCode, String) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let res = router(state.clone()).oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn status_lists_every_zone() {
        let state = node(3, 0.0);
        let (status, body) = send(&state, Method::GET, "/status").await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 3);
        assert_eq!(json[2]["state"], 0);
    }

    #[tokio::test]
    async fn set_state_opens_valve_with_any_method() {
        let state = node(2, 0.0);
        let (status, _) = send(&state, Method::GET, "/2/setState/1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.sim.lock().await.status()[1].state, 1);

        let (status, _) = send(&state, Method::POST, "/2/setState/0").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.sim.lock().await.status()[1].state, 0);
    }

    #[tokio::test]
    async fn set_state_validates_input() {
        let state = node(2, 0.0);

        let (status, _) = send(&state, Method::GET, "/1/setState/on").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&state, Method::GET, "/5/setState/1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "zone 5 does not exist");
    }

    #[tokio::test]
    async fn injected_failures_answer_503() {
        let state = node(2, 1.0);

        let (status, _) = send(&state, Method::GET, "/status").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (status, _) = send(&state, Method::GET, "/1/setState/1").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.sim.lock().await.status()[0].state, 0);
    }

    #[test]
    fn push_url_targets_hub_listener() {
        let pusher = Pusher::new("http://hub.local:2000/").unwrap();
        assert_eq!(pusher.url(3, true), "http://hub.local:2000/3/state/1");
        assert_eq!(pusher.url(1, false), "http://hub.local:2000/1/state/0");
    }
}
