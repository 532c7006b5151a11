mod config;
mod error;
mod forecast;
mod gateway;
mod plan;
mod poller;
mod scheduler;
mod state;
mod valve;
mod watering;
mod web;

#[cfg(test)]
mod test_utils;

use anyhow::Result;
use std::{env, sync::Arc, time::Duration};
use tokio::sync::Notify;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use forecast::ForecastClient;
use gateway::HttpGateway;
use scheduler::Planner;
use state::{PlannerPhase, SystemState};
use valve::Valves;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sprinkler_hub=debug,info".into()),
        )
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let zones = cfg.device.zones;

    tracing::info!(
        name = %cfg.name,
        device = %cfg.device.url,
        zones,
        "config loaded from {config_path}"
    );

    // ── Shared state & device ───────────────────────────────────────
    let shared = SystemState::shared(zones);
    shared
        .write()
        .await
        .record_system("hub started".to_string());

    let gateway = Arc::new(HttpGateway::new(&cfg.device)?);
    let valves = Valves::new(gateway.clone(), shared.clone(), zones);
    let replan = Arc::new(Notify::new());

    // ── Zone change log ─────────────────────────────────────────────
    let mut changes = shared.read().await.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(c) => tracing::info!(
                    zone = c.zone,
                    active = u8::from(c.active),
                    in_use = u8::from(c.in_use),
                    "zone changed"
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("zone change log lagged by {n} updates");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // ── Status poller ───────────────────────────────────────────────
    tokio::spawn(poller::run(
        gateway.clone(),
        shared.clone(),
        Duration::from_secs(cfg.device.poll_interval_secs),
    ));

    // ── Planner ─────────────────────────────────────────────────────
    if cfg.schedule.enabled {
        let forecast = Arc::new(ForecastClient::new(
            &cfg.schedule,
            Duration::from_millis(cfg.device.timeout_ms),
        )?);
        let planner = Planner::new(
            cfg.schedule.clone(),
            cfg.zone_percentages(),
            forecast,
            valves.clone(),
            shared.clone(),
            replan.clone(),
        );
        tokio::spawn(planner.run());
    } else {
        tracing::info!("scheduling disabled");
        let mut st = shared.write().await;
        st.set_planner(PlannerPhase::Disabled);
        st.record_system("scheduling disabled".to_string());
    }

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        shared: shared.clone(),
        valves: valves.clone(),
        identity: Arc::new(cfg.identity()),
        replan,
        push_enabled: cfg.listener.enabled,
    };
    let port = cfg.listener.port;
    let server = tokio::spawn(web::serve(web_state, port));

    // ── Shutdown ────────────────────────────────────────────────────
    tokio::select! {
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => tracing::info!("shutting down, turning all zones off"),
            Err(e) => tracing::error!("signal handler failed, turning all zones off: {e}"),
        },
        res = server => {
            tracing::error!("web server stopped, turning all zones off");
            valves.all_off().await;
            return res?;
        }
    }

    valves.all_off().await;
    Ok(())
}
