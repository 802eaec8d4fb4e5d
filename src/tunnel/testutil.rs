//! Loopback collaborators for tunnel tests: a scripted relay and a local
//! HTTP server.

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, Uri};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as WsRequest, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::config::{ForwardPolicy, TunnelConfig};

const WAIT: Duration = Duration::from_secs(5);

pub(crate) fn forward_policy(base_url: &str) -> ForwardPolicy {
    ForwardPolicy {
        base_url: base_url.trim_end_matches('/').to_string(),
        token: None,
        request_timeout: Duration::from_secs(5),
        allowed_prefixes: vec!["/api/v1/".to_string()],
        allowed_paths: vec!["/".to_string()],
        blocked_prefixes: vec!["/api/v1/relay/".to_string()],
    }
}

pub(crate) fn tunnel_config(server_url: &str, local_base: &str) -> TunnelConfig {
    TunnelConfig {
        enabled: true,
        server_url: server_url.to_string(),
        license_key: "TEST-KEY".to_string(),
        client_name: "test-device".to_string(),
        auto_reconnect: true,
        reconnect_interval: Duration::from_millis(100),
        reconnect_max_delay: Duration::from_millis(400),
        heartbeat_interval: Duration::from_secs(30),
        handshake_timeout: Duration::from_secs(2),
        local: forward_policy(local_base),
    }
}

/// `http://127.0.0.1:<port>` with nothing listening.
pub(crate) async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

pub(crate) struct LocalServer {
    pub base_url: String,
    pub hits: Arc<AtomicUsize>,
}

/// Local API with echo, slow, fast and event-stream endpoints.
pub(crate) async fn spawn_local_server() -> LocalServer {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/api/v1/echo", any(echo))
        .route("/api/v1/slow", get(slow))
        .route("/api/v1/fast", get(|| async { "fast" }))
        .route("/api/v1/events", get(events))
        .route("/api/v1/broken-events", get(broken_events))
        .layer(middleware::from_fn_with_state(hits.clone(), count_hits));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    LocalServer {
        base_url: format!("http://{addr}"),
        hits,
    }
}

async fn count_hits(State(hits): State<Arc<AtomicUsize>>, req: Request, next: Next) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);
    next.run(req).await
}

async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    let field = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map_or(Value::Null, |v| Value::String(v.to_string()))
    };
    let reply = json!({
        "method": method.as_str(),
        "query": uri.query().unwrap_or(""),
        "body": String::from_utf8_lossy(&body),
        "authorization": field("authorization"),
        "accept": field("accept"),
        "content_type": field("content-type"),
        "x_custom": field("x-custom"),
    });
    (
        [(header::ETAG, "\"v1\""), (header::HeaderName::from_static("x-internal"), "secret")],
        Json(reply),
    )
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_millis(1500)).await;
    "slow"
}

async fn events() -> impl IntoResponse {
    let stream = futures_util::stream::iter(["one", "two", "three"])
        .map(|d| Ok::<_, Infallible>(Event::default().data(d)));
    Sse::new(stream)
}

async fn broken_events() -> impl IntoResponse {
    let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
        Ok(Bytes::from_static(b"data: first\n\n")),
        Err(std::io::Error::other("source went away")),
    ];
    let stream = futures_util::stream::iter(chunks).then(|chunk| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        chunk
    });
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(stream),
    )
}

/// Scripted relay. Each accepted WebSocket is handed to the test in order.
pub(crate) struct FakeRelay {
    pub url: String,
    pub accepted: Arc<AtomicUsize>,
    conns: mpsc::UnboundedReceiver<RelayConn>,
}

pub(crate) struct RelayConn {
    ws: WebSocketStream<TcpStream>,
    /// Query string the client connected with.
    pub query: String,
}

impl FakeRelay {
    pub(crate) async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (tx, conns) = mpsc::unbounded_channel();
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let query = Arc::new(Mutex::new(String::new()));
                let seen = query.clone();
                let callback = move |req: &WsRequest, resp: WsResponse| -> Result<WsResponse, ErrorResponse> {
                    *seen.lock().unwrap() = req.uri().query().unwrap_or("").to_string();
                    Ok(resp)
                };
                let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    continue;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let query = query.lock().unwrap().clone();
                if tx.send(RelayConn { ws, query }).is_err() {
                    break;
                }
            }
        });
        Self {
            url: format!("ws://{addr}/tunnel"),
            accepted,
            conns,
        }
    }

    /// Next client connection.
    pub(crate) async fn next_conn(&mut self) -> RelayConn {
        tokio::time::timeout(WAIT, self.conns.recv())
            .await
            .expect("no connection from the tunnel client")
            .expect("relay listener stopped")
    }

    /// Whether another connection shows up within `window`.
    pub(crate) async fn connects_within(&mut self, window: Duration) -> bool {
        matches!(tokio::time::timeout(window, self.conns.recv()).await, Ok(Some(_)))
    }
}

impl RelayConn {
    pub(crate) async fn send(&mut self, frame: Value) {
        self.ws
            .send(Message::Text(frame.to_string().into()))
            .await
            .unwrap();
    }

    pub(crate) async fn welcome(&mut self, client_id: &str) {
        self.send(json!({"type": "welcome", "client_id": client_id})).await;
    }

    /// Next JSON frame from the client, heartbeat pings included.
    /// `None` once the client has closed the connection.
    pub(crate) async fn recv_any(&mut self) -> Option<Value> {
        loop {
            let frame = tokio::time::timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for a client frame");
            match frame {
                Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
                Some(Ok(Message::Close(_)) | Err(_)) | None => return None,
                Some(Ok(_)) => {}
            }
        }
    }

    /// Next JSON frame from the client, skipping heartbeat pings.
    pub(crate) async fn recv(&mut self) -> Option<Value> {
        loop {
            let value = self.recv_any().await?;
            if value["type"] != "ping" {
                return Some(value);
            }
        }
    }

    /// Frames until the client closes.
    pub(crate) async fn wait_closed(&mut self) {
        while self.recv().await.is_some() {}
    }

    pub(crate) async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Poll `cond` until it holds, failing the test after a few seconds.
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
