//! Tunnel status and controls.
//!
//! These routes sit under the forwarder's blocked prefix, so they are only
//! reachable from the device itself, never through the tunnel.

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::AppState;
use crate::config::{normalize_server_url, ConfigError, TunnelConfig};
use crate::tunnel::TunnelStatus;

/// `GET /api/v1/relay/status`: current snapshot.
pub async fn status(State(state): State<AppState>) -> Json<TunnelStatus> {
    Json(state.tunnel.read().await.status())
}

/// `POST /api/v1/relay/connect`: (re)establish the connection now.
///
/// Clears a previous disconnect and restarts a stopped supervisor. Returns the
/// snapshot taken right after the request was handed to the tunnel, so
/// `connected` usually still reflects the old connection.
pub async fn connect(State(state): State<AppState>) -> Json<TunnelStatus> {
    info!("Control: reconnect requested");
    let tunnel = state.tunnel.read().await;
    tunnel.reconnect();
    Json(tunnel.status())
}

/// `POST /api/v1/relay/disconnect`: close the connection and stay offline.
pub async fn disconnect(State(state): State<AppState>) -> Json<TunnelStatus> {
    info!("Control: disconnect requested");
    let tunnel = state.tunnel.read().await;
    tunnel.disconnect();
    Json(tunnel.status())
}

/// Body of `PUT /api/v1/relay/settings`. Omitted fields keep their value.
#[derive(Debug, Default, Deserialize)]
pub struct SettingsUpdate {
    pub enabled: Option<bool>,
    /// Normalized like the config file value; `""` unsets the relay.
    pub server_url: Option<String>,
    #[serde(alias = "card_key")]
    pub license_key: Option<String>,
    /// Wins over `license_key`.
    #[serde(default, alias = "clear_card_key")]
    pub clear_license_key: bool,
    pub client_name: Option<String>,
    pub auto_reconnect: Option<bool>,
}

impl SettingsUpdate {
    fn is_empty(&self) -> bool {
        self.enabled.is_none()
            && self.server_url.is_none()
            && self.license_key.is_none()
            && !self.clear_license_key
            && self.client_name.is_none()
            && self.auto_reconnect.is_none()
    }

    fn apply(&self, config: &mut TunnelConfig) -> Result<(), ConfigError> {
        if let Some(url) = &self.server_url {
            config.server_url = normalize_server_url(url)?;
        }
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if self.clear_license_key {
            config.license_key.clear();
        } else if let Some(key) = &self.license_key {
            config.license_key = key.trim().to_string();
        }
        if let Some(name) = self.client_name.as_deref().map(str::trim) {
            if !name.is_empty() {
                config.client_name = name.to_string();
            }
        }
        if let Some(auto_reconnect) = self.auto_reconnect {
            config.auto_reconnect = auto_reconnect;
        }
        Ok(())
    }
}

/// `PUT /api/v1/relay/settings`: change the relay target or identity.
///
/// The running tunnel is stopped and replaced by one built from the updated
/// settings; it starts again when enabled. Settings live in memory only, the
/// config file is left untouched.
pub async fn settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<TunnelStatus>, (StatusCode, Json<Value>)> {
    let mut tunnel = state.tunnel.write().await;
    if update.is_empty() {
        return Ok(Json(tunnel.status()));
    }

    let mut config = tunnel.config().clone();
    update
        .apply(&mut config)
        .map_err(|e| (StatusCode::BAD_REQUEST, Json(json!({"detail": e.to_string()}))))?;

    info!(
        enabled = config.enabled,
        server_url = %config.server_url,
        client_name = %config.client_name,
        "Control: relay settings updated, restarting tunnel"
    );
    *tunnel = tunnel.reconfigure(config).await;
    Ok(Json(tunnel.status()))
}
