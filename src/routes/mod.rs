//! Control API.
//!
//! | Method | Path                        | Auth | Description                    |
//! |--------|-----------------------------|------|--------------------------------|
//! | GET    | `/api/health`               | No   | Liveness probe                 |
//! | GET    | `/api/v1/relay/status`      | Yes  | Tunnel status snapshot         |
//! | POST   | `/api/v1/relay/connect`     | Yes  | Reconnect now                  |
//! | POST   | `/api/v1/relay/disconnect`  | Yes  | Disconnect until reconnected   |
//! | PUT    | `/api/v1/relay/settings`    | Yes  | Change settings and restart    |
//!
//! "Yes" means `Authorization: Bearer <local token>` when a local token is
//! configured; see [`crate::auth`].

pub mod health;
pub mod relay;

use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware,
    routing::{get, post, put},
    Extension, Router,
};
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

use crate::auth::{self, ControlToken};
use crate::tunnel::TunnelHandle;

/// State shared by the control handlers.
#[derive(Clone)]
pub struct AppState {
    /// Replaced wholesale when the relay settings change.
    pub tunnel: Arc<RwLock<TunnelHandle>>,
    /// When the process started (for uptime).
    pub start_time: Instant,
}

/// Build the control router.
pub fn router(state: AppState, token: Option<String>) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let authed_routes = Router::new()
        .route("/api/v1/relay/status", get(relay::status))
        .route("/api/v1/relay/connect", post(relay::connect))
        .route("/api/v1/relay/disconnect", post(relay::disconnect))
        .route("/api/v1/relay/settings", put(relay::settings))
        .layer(middleware::from_fn(auth::require_control_token));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(Extension(ControlToken(token)))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::testutil::tunnel_config;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tokio::runtime::Handle;
    use tower::ServiceExt;

    fn app(token: Option<&str>) -> (Router, Arc<RwLock<TunnelHandle>>) {
        let tunnel = Arc::new(RwLock::new(TunnelHandle::new(
            tunnel_config("ws://127.0.0.1:1/tunnel", "http://127.0.0.1:1"),
            Handle::current(),
        )));
        let state = AppState {
            tunnel: tunnel.clone(),
            start_time: Instant::now(),
        };
        (router(state, token.map(str::to_string)), tunnel)
    }

    async fn call(app: &Router, method: &str, uri: &str, auth: Option<&str>) -> (StatusCode, Value) {
        send(app, method, uri, auth, None).await
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        auth: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(auth) = auth {
            req = req.header("authorization", auth);
        }
        let body = match body {
            Some(json) => {
                req = req.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let (app, _tunnel) = app(Some("secret"));
        let (status, body) = call(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["tunnel"]["connected"], false);
        assert_eq!(body["tunnel"]["phase"], "idle");
    }

    #[tokio::test]
    async fn test_relay_routes_require_token() {
        let (app, _tunnel) = app(Some("secret"));
        let (status, _) = call(&app, "GET", "/api/v1/relay/status", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(&app, "GET", "/api/v1/relay/status", Some("Bearer nope")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, body) =
            call(&app, "GET", "/api/v1/relay/status", Some("Bearer secret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["client_name"], "test-device");
        assert_eq!(body["license_key_set"], true);
        assert_eq!(body["last_error"], Value::Null);
    }

    #[tokio::test]
    async fn test_no_token_leaves_api_open() {
        let (app, _tunnel) = app(None);
        let (status, body) = call(&app, "GET", "/api/v1/relay/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], false);
    }

    #[tokio::test]
    async fn test_disconnect_and_connect_controls() {
        let (app, tunnel) = app(None);

        let (status, body) = call(&app, "POST", "/api/v1/relay/disconnect", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user_disconnected"], true);
        assert!(tunnel.read().await.status().user_disconnected);

        let (status, body) = call(&app, "POST", "/api/v1/relay/connect", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user_disconnected"], false);
        assert_eq!(body["running"], true);
        let tunnel = tunnel.read().await;
        tunnel.stop().await;
        assert!(!tunnel.status().running);
    }

    #[tokio::test]
    async fn test_settings_restart_tunnel_with_new_values() {
        let (app, tunnel) = app(Some("secret"));
        let update = json!({
            "enabled": false,
            "server_url": "https://relay.example.com/t/",
            "card_key": "  NEW-KEY  ",
            "client_name": "kitchen-pc",
        });

        let (status, _) =
            send(&app, "PUT", "/api/v1/relay/settings", None, Some(update.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) =
            send(&app, "PUT", "/api/v1/relay/settings", Some("Bearer secret"), Some(update)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["server_url"], "wss://relay.example.com/t");
        assert_eq!(body["client_name"], "kitchen-pc");
        assert_eq!(body["enabled"], false);
        assert_eq!(body["running"], false);
        let config = tunnel.read().await.config().clone();
        assert_eq!(config.license_key, "NEW-KEY");

        let (status, body) = send(
            &app,
            "PUT",
            "/api/v1/relay/settings",
            Some("Bearer secret"),
            Some(json!({"clear_card_key": true, "card_key": "ignored"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["license_key_set"], false);
        assert_eq!(body["server_url"], "wss://relay.example.com/t");
    }

    #[tokio::test]
    async fn test_settings_enable_starts_and_bad_url_is_rejected() {
        let (app, tunnel) = app(None);

        let (status, body) = send(
            &app,
            "PUT",
            "/api/v1/relay/settings",
            None,
            Some(json!({"server_url": "ftp://relay.example.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("ftp://relay.example.com"));
        assert_eq!(tunnel.read().await.config().server_url, "ws://127.0.0.1:1/tunnel");

        let (status, body) = send(
            &app,
            "PUT",
            "/api/v1/relay/settings",
            None,
            Some(json!({"enabled": true, "auto_reconnect": false})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], true);
        let tunnel = tunnel.read().await;
        assert!(!tunnel.config().auto_reconnect);
        tunnel.stop().await;
    }
}
