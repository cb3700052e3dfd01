/**
 * API HTTP ECLUSA - Surface d'administration et point d'abonnement WebSocket
 *
 * RÔLE :
 * Expose le pipeline de télémétrie aux outils humains (dashboard, scripts, supervision)
 * et le point d'upgrade /ws des clients temps réel.
 *
 * ROUTES :
 * - /health, /system/health : vivacité et état du kernel
 * - /ws : abonnement aux payloads (snapshot puis broadcasts)
 * - /api/tags, /api/tags/snapshot, /api/tags/stats, /api/plc/status : lecture seule
 * - POST /api/tags/{name}/value : injection d'une valeur externe
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur les routes d'écriture
 * - ECLUSA_API_KEY absente -> écriture refusée, jamais ouverte par défaut
 */

use crate::codec::TelemetryPayload;
use crate::device::LinkStatus;
use crate::health::{HealthTracker, KernelHealth};
use crate::hub::session::serve_socket;
use crate::telemetry::{PushError, TagView, Telemetry, TelemetryStats};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub telemetry: Arc<Telemetry>,
    pub health_tracker: HealthTracker,
    pub api_key: Option<Arc<str>>,
}

impl AppState {
    /// Clé lue dans ECLUSA_API_KEY ; vide = absente
    pub fn api_key_from_env() -> Option<Arc<str>> {
        std::env::var("ECLUSA_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .map(Arc::from)
    }
}

async fn require_api_key(
    State(app): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = app.api_key.as_deref() else {
        warn!("SECURITY: ECLUSA_API_KEY not set - write access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!("[http] rejected {} {}: missing or wrong api key", req.method(), req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    let writes = Router::new()
        .route("/api/tags/{name}/value", post(push_tag_value))
        .route_layer(middleware::from_fn_with_state(app_state.clone(), require_api_key));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/ws", get(ws_upgrade))
        .route("/api/tags", get(list_tags))
        .route("/api/tags/snapshot", get(get_snapshot))
        .route("/api/tags/stats", get(get_stats))
        .route("/api/plc/status", get(get_plc_status))
        .merge(writes)
        .with_state(app_state)
}

// GET /ws (upgrade)
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(app): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
) -> Response {
    let hub = app.telemetry.hub().clone();
    ws.on_upgrade(move |socket| serve_socket(socket, hub, remote))
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(&app.telemetry))
}

// GET /api/tags (catalogue + valeurs en cache)
async fn list_tags(State(app): State<AppState>) -> Json<Vec<TagView>> {
    Json(app.telemetry.tag_views())
}

// GET /api/tags/snapshot (payload tel qu'envoyé aux abonnés)
async fn get_snapshot(State(app): State<AppState>) -> Json<TelemetryPayload> {
    Json(app.telemetry.current_payload())
}

async fn get_stats(State(app): State<AppState>) -> Json<TelemetryStats> {
    Json(app.telemetry.stats())
}

async fn get_plc_status(State(app): State<AppState>) -> Json<LinkStatus> {
    Json(app.telemetry.link().status())
}

#[derive(Debug, Deserialize)]
struct PushBody {
    value: f64,
}

// POST /api/tags/{name}/value
async fn push_tag_value(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<PushBody>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    match app.telemetry.push_value(&name, body.value) {
        Ok(value) => Ok(Json(serde_json::json!({ "tag": name, "value": value }))),
        Err(e) => {
            let code = match e {
                PushError::UnknownTag(_) => StatusCode::NOT_FOUND,
                PushError::NotWritable(..) | PushError::Unreadable(..) => StatusCode::UNPROCESSABLE_ENTITY,
            };
            Err((code, Json(serde_json::json!({ "error": e.to_string() }))))
        }
    }
}
