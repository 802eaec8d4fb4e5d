//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use super::AppState;

/// `GET /api/health`: liveness probe.
///
/// Returns status, uptime, version and a compact tunnel section. No
/// authentication required, suitable for process supervisors.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let tunnel = state.tunnel.read().await.status();

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "tunnel": {
            "enabled": tunnel.enabled,
            "running": tunnel.running,
            "connected": tunnel.connected,
            "phase": tunnel.phase,
            "reconnects": tunnel.reconnects,
            "last_rtt_ms": tunnel.last_rtt_ms,
        },
    }))
}
