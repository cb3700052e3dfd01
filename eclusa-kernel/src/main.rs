/**
 * ECLUSA KERNEL - Point d'entrée du serveur de télémétrie de l'écluse
 *
 * RÔLE : Orchestration de tous les modules : config, catalogue, lien automate,
 * polling, hub WebSocket, HTTP, health. Composants construits une fois ici et
 * passés explicitement à qui en a besoin.
 *
 * ARCHITECTURE : automate S7 -> poll loop -> cache -> codec -> hub -> N clients WebSocket,
 * plus une API REST d'administration.
 * ARRÊT (Ctrl-C) : signal stop, fermeture du hub, arrêt HTTP propre, déconnexion automate.
 */

mod cache;
mod catalog;
mod codec;
mod config;
mod device;
mod health;
mod http;
mod hub;
mod models;
mod poller;
mod publisher;
mod state;
mod telemetry;

use crate::catalog::Catalog;
use crate::config::load_config;
use crate::device::s7::S7Connector;
use crate::device::{DeviceLink, LinkSettings};
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::hub::{Hub, HubSettings};
use crate::telemetry::Telemetry;

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;

    // catalogue de tags (fichiers configurés, sinon catalogue intégré)
    let catalog = Arc::new(Catalog::load_or_default(&cfg.catalog.paths).await);

    // lien automate
    let link = Arc::new(DeviceLink::new(
        catalog.target().clone(),
        Arc::new(S7Connector::new(cfg.device.port)),
        LinkSettings {
            connect_timeout: cfg.device.connect_timeout(),
            read_timeout: cfg.device.read_timeout(),
        },
    ));

    // hub + pipeline
    let (hub, dispatcher) = Hub::new(HubSettings::from(&cfg.hub));
    let telemetry = Telemetry::new(catalog.clone(), link.clone(), hub);
    let (stop_tx, stop_rx) = watch::channel(false);

    let dispatcher_task = dispatcher.spawn(telemetry.snapshot_fn(), stop_rx.clone());
    telemetry.publisher().spawn_retry(stop_rx.clone());
    poller::spawn_reconnect_supervisor(link.clone(), cfg.device.reconnect_interval(), stop_rx.clone());
    poller::spawn_poll_loop(telemetry.clone(), cfg.poll.interval(), stop_rx.clone());

    // health périodique dans les logs
    let health_tracker = HealthTracker::new();
    health_tracker.spawn_health_reporter(telemetry.clone(), Duration::from_secs(30), stop_rx.clone());

    let api_key = AppState::api_key_from_env();
    if api_key.is_none() {
        warn!("[kernel] ECLUSA_API_KEY not set, write routes disabled");
    }
    let app_state = AppState { telemetry, health_tracker, api_key };

    // HTTP
    let app = http::build_router(app_state);
    let addr: SocketAddr = cfg
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid server.bind '{}'", cfg.server.bind))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!("[kernel] listening on http://{addr} (ws: /ws)");

    let mut http_stop = stop_rx.clone();
    let shutdown = async move {
        let _ = http_stop.changed().await;
    };
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await
    });

    tokio::signal::ctrl_c().await.context("cannot listen for Ctrl-C")?;
    info!("[kernel] shutting down");

    // stop -> hub fermé (Close envoyé à chaque client) -> HTTP arrêté -> automate déconnecté
    let _ = stop_tx.send(true);
    let _ = dispatcher_task.await;
    match tokio::time::timeout(Duration::from_secs(5), server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!("[kernel] http server error: {}", e),
        Ok(Err(e)) => warn!("[kernel] http task failed: {}", e),
        Err(_) => warn!("[kernel] http server did not stop within 5s"),
    }
    link.disconnect().await;
    info!("[kernel] bye");
    Ok(())
}
