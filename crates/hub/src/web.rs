use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::config::Identity;
use crate::error::HubError;
use crate::state::{PlannerPhase, SharedState};
use crate::valve::Valves;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub valves: Valves,
    pub identity: Arc<Identity>,
    pub replan: Arc<Notify>,
    /// Accept state pushes from the device.
    pub push_enabled: bool,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/api/status", get(api_status))
        .route("/api/info", get(api_info))
        .route("/api/zones/{zone}/{value}", post(api_set_zone))
        .route("/api/recalculate", post(api_recalculate));

    if state.push_enabled {
        app = app.route("/{zone}/{characteristic}/{value}", get(push_update));
    }

    app.with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn api_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.identity.as_ref().clone())
}

async fn api_set_zone(
    State(state): State<AppState>,
    Path((zone, value)): Path<(usize, String)>,
) -> Response {
    let Some(on) = parse_flag(&value) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("invalid value {value:?}, expected 0 or 1") })),
        )
            .into_response();
    };

    match state.valves.set(zone, on).await {
        Ok(()) => {
            let st = state.shared.read().await;
            Json(st.zone(zone).cloned()).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn api_recalculate(State(state): State<AppState>) -> Response {
    if state.shared.read().await.planner == PlannerPhase::Disabled {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "scheduling is disabled" })),
        )
            .into_response();
    }
    state.replan.notify_one();
    tracing::info!("recalculation requested over http");
    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "recalculating" })),
    )
        .into_response()
}

/// Device push: `/{zone}/state/{0|1}`.
async fn push_update(
    State(state): State<AppState>,
    Path((zone, characteristic, value)): Path<(String, String, String)>,
    uri: Uri,
) -> Response {
    let update = match (zone.parse::<usize>(), characteristic.as_str(), parse_flag(&value)) {
        (Ok(zone), "state", Some(on)) => state
            .shared
            .write()
            .await
            .update_zone(zone, Some(on), Some(on))
            .map(|_| (zone, on)),
        _ => Err(HubError::parse(uri.path(), "expected /{zone}/state/{0|1}")),
    };

    match update {
        Ok((zone, on)) => {
            tracing::info!(zone, state = u8::from(on), "handling request: {uri}");
            (StatusCode::OK, "Handling request").into_response()
        }
        Err(e) => {
            tracing::warn!("invalid request: {uri} ({e})");
            (StatusCode::BAD_REQUEST, "Invalid request").into_response()
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "0" => Some(false),
        "1" => Some(true),
        _ => None,
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = match self {
            HubError::UnknownZone(_) => StatusCode::NOT_FOUND,
            HubError::Parse { .. } => StatusCode::BAD_REQUEST,
            HubError::Transport { .. } | HubError::Status { .. } => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(push = state.push_enabled, "listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SystemState;
    use crate::test_utils::{test_config, FakeGateway};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use std::sync::atomic::Ordering;
    use tower::ServiceExt;

    struct Rig {
        state: AppState,
        gateway: Arc<FakeGateway>,
    }

    fn rig(push_enabled: bool) -> Rig {
        let gateway = Arc::new(FakeGateway::new(2));
        let shared = SystemState::shared(2);
        let valves = Valves::new(gateway.clone(), shared.clone(), 2);
        let state = AppState {
            shared,
            valves,
            identity: Arc::new(test_config(2).identity()),
            replan: Arc::new(Notify::new()),
            push_enabled,
        };
        Rig { state, gateway }
    }

    async fn send(state: &AppState, method: Method, uri: &str) -> (StatusCode, String) {
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

    async fn send_json(state: &AppState, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
        let (status, body) = send(state, method, uri).await;
        (status, serde_json::from_str(&body).unwrap())
    }

    // -- Status & info ------------------------------------------------------

    #[tokio::test]
    async fn status_reports_zones_and_program_mode() {
        let r = rig(false);
        let (status, body) = send_json(&r.state, Method::GET, "/api/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["program_mode"], 0);
        assert_eq!(body["planner"]["phase"], "idle");
        assert_eq!(body["zones"].as_array().unwrap().len(), 2);
        assert_eq!(body["zones"][0]["zone"], 1);
    }

    #[tokio::test]
    async fn info_returns_identity() {
        let r = rig(false);
        let (status, body) = send_json(&r.state, Method::GET, "/api/info").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["serial"], "http://sprinkler.test");
        assert_eq!(body["firmware"], env!("CARGO_PKG_VERSION"));
    }

    // -- Zone control -------------------------------------------------------

    #[tokio::test]
    async fn set_zone_commands_device() {
        let r = rig(false);
        let (status, body) = send_json(&r.state, Method::POST, "/api/zones/2/1").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active"], true);
        assert_eq!(body["in_use"], true);
        assert_eq!(r.gateway.pairs(), vec![(2, true)]);
    }

    #[tokio::test]
    async fn set_zone_rejects_bad_value() {
        let r = rig(false);
        let (status, _) = send(&r.state, Method::POST, "/api/zones/1/on").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(r.gateway.pairs().is_empty());
    }

    #[tokio::test]
    async fn set_zone_unknown_is_not_found() {
        let r = rig(false);
        let (status, body) = send_json(&r.state, Method::POST, "/api/zones/9/1").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "zone 9 is not configured");
    }

    #[tokio::test]
    async fn set_zone_device_failure_is_bad_gateway() {
        let r = rig(false);
        r.gateway.fail_set.store(true, Ordering::SeqCst);
        let (status, _) = send(&r.state, Method::POST, "/api/zones/1/1").await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    // -- Recalculation ------------------------------------------------------

    #[tokio::test]
    async fn recalculate_wakes_planner() {
        let r = rig(false);
        let (status, _) = send(&r.state, Method::POST, "/api/recalculate").await;

        assert_eq!(status, StatusCode::ACCEPTED);
        // The stored permit completes immediately.
        tokio::time::timeout(
            std::time::Duration::from_millis(50),
            r.state.replan.notified(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn recalculate_refused_when_disabled() {
        let r = rig(false);
        r.state
            .shared
            .write()
            .await
            .set_planner(PlannerPhase::Disabled);
        let (status, _) = send(&r.state, Method::POST, "/api/recalculate").await;

        assert_eq!(status, StatusCode::CONFLICT);
    }

    // -- Device push --------------------------------------------------------

    #[tokio::test]
    async fn push_updates_zone_state() {
        let r = rig(true);
        let mut changes = r.state.shared.read().await.subscribe();
        let (status, body) = send(&r.state, Method::GET, "/2/state/1").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Handling request");
        let st = r.state.shared.read().await;
        assert!(st.zone(2).unwrap().active);
        assert!(st.zone(2).unwrap().in_use);
        assert_eq!(changes.try_recv().unwrap().zone, 2);
        // Pushes are reflected, never sent back to the device.
        assert!(r.gateway.pairs().is_empty());
    }

    #[tokio::test]
    async fn push_rejects_malformed_requests() {
        let r = rig(true);
        for uri in ["/1/brightness/1", "/1/state/10", "/1/state/x", "/7/state/1", "/a/state/1"] {
            let (status, body) = send(&r.state, Method::GET, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body, "Invalid request", "{uri}");
        }
        assert!(r.state.shared.read().await.zones.iter().all(|z| !z.active));
    }

    #[tokio::test]
    async fn push_route_absent_when_listener_disabled() {
        let r = rig(false);
        let (status, _) = send(&r.state, Method::GET, "/1/state/1").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
