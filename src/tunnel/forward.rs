//! Local forwarder: turns one relay `request` into a call against the
//! loopback server and reports the outcome back through the writer.
//!
//! Every request ends in exactly one terminal outcome: a single `response`
//! frame, or for `text/event-stream` replies a run of `sse_event` frames closed
//! by one `sse_end`. Failures never escape this module; they become `4xx`/`502`
//! responses. The only silent case is a tunnel that died underneath us, where
//! there is nobody left to answer.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::Method;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use super::protocol::{ClientMessage, CodecError, InboundRequest, Response};
use super::sse::{is_event_stream, LineDecoder};
use super::writer::{Outbound, Undeliverable};
use crate::config::ForwardPolicy;

/// Request headers copied from the relay to the local call.
const FORWARDED_REQUEST_HEADERS: &[&str] = &[
    "content-type",
    "accept",
    "if-none-match",
    "if-modified-since",
    "range",
    "last-event-id",
];

/// Response headers copied back to the relay.
const RETURNED_RESPONSE_HEADERS: &[&str] =
    &["content-type", "cache-control", "etag", "last-modified"];

const ALLOWED_METHODS: &[&str] = &["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"];

/// Why a forwarded request did not produce the local server's own reply.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("path not allowed")]
    PathNotAllowed,
    #[error("unsupported method {0:?}")]
    UnsupportedMethod(String),
    #[error("invalid request body: {0}")]
    InvalidBody(#[source] CodecError),
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("local request timed out after {0:?}")]
    Timeout(Duration),
    #[error("local request failed: {0}")]
    Local(#[from] hyper_util::client::legacy::Error),
    #[error("local response body failed: {0}")]
    Body(#[from] hyper::Error),
    #[error(transparent)]
    Detached(#[from] Undeliverable),
}

impl ForwardError {
    /// Status of the synthesized response, `None` when nothing can be sent.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::PathNotAllowed => Some(403),
            Self::UnsupportedMethod(_) | Self::InvalidBody(_) | Self::InvalidTarget(_) => Some(400),
            Self::Timeout(_) | Self::Local(_) | Self::Body(_) => Some(502),
            Self::Detached(_) => None,
        }
    }

    /// Client-facing `detail`. Local failure specifics stay in our logs.
    fn detail(&self) -> &'static str {
        match self {
            Self::PathNotAllowed => "path not allowed",
            Self::UnsupportedMethod(_) => "unsupported method",
            Self::InvalidBody(_) => "invalid request body",
            Self::InvalidTarget(_) => "invalid request path",
            Self::Timeout(_) => "local request timed out",
            Self::Local(_) | Self::Body(_) | Self::Detached(_) => "local request failed",
        }
    }
}

/// How a request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Single { status: u16 },
    Stream { events: usize },
}

/// Shared by every forwarder task of a tunnel instance.
pub struct LocalForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    policy: ForwardPolicy,
    /// Path component of `policy.base_url`, without trailing slash.
    base_path: String,
}

impl LocalForwarder {
    pub fn new(policy: ForwardPolicy) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        let base_path = url::Url::parse(&policy.base_url)
            .map(|u| u.path().trim_end_matches('/').to_string())
            .unwrap_or_default();
        Self {
            client,
            policy,
            base_path,
        }
    }

    /// Handle one relay request to completion.
    pub async fn forward(&self, request: InboundRequest, out: &Outbound) {
        if request.id.trim().is_empty() {
            warn!(path = %request.path, "Dropping tunnel request without id");
            return;
        }
        let started = Instant::now();
        let result = self.execute(&request, out).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match result {
            Ok(Delivery::Single { status }) => debug!(
                request_id = %request.id,
                method = %request.method,
                path = %request.path,
                status,
                elapsed_ms,
                "Forwarded request"
            ),
            Ok(Delivery::Stream { events }) => debug!(
                request_id = %request.id,
                path = %request.path,
                events,
                elapsed_ms,
                "Forwarded event stream"
            ),
            Err(e) => {
                let Some(status) = e.status() else {
                    debug!(request_id = %request.id, "Tunnel closed before the reply was sent");
                    return;
                };
                warn!(
                    request_id = %request.id,
                    method = %request.method,
                    path = %request.path,
                    status,
                    "Forward failed: {e}"
                );
                let reply = Response::error(&request.id, status, e.detail());
                if out.send(ClientMessage::Response(reply)).await.is_err() {
                    debug!(request_id = %request.id, "Tunnel closed before the error was sent");
                }
            }
        }
    }

    async fn execute(
        &self,
        request: &InboundRequest,
        out: &Outbound,
    ) -> Result<Delivery, ForwardError> {
        if !self.policy.allows(&request.path) {
            return Err(ForwardError::PathNotAllowed);
        }
        let target = self.target_url(request)?;
        // The parser resolves dot segments and re-encodes; only the path that
        // was checked may reach the local server.
        if target.path().strip_prefix(self.base_path.as_str()) != Some(request.path.as_str()) {
            return Err(ForwardError::PathNotAllowed);
        }
        let method = parse_method(&request.method)?;
        let body = request.body_bytes().map_err(ForwardError::InvalidBody)?;

        let mut builder = hyper::Request::builder().method(method).uri(target.as_str());
        for (name, value) in &request.headers {
            let lower = name.to_ascii_lowercase();
            if !FORWARDED_REQUEST_HEADERS.contains(&lower.as_str()) {
                continue;
            }
            match HeaderValue::from_str(value) {
                Ok(value) => builder = builder.header(lower, value),
                Err(_) => debug!(
                    request_id = %request.id,
                    header = %lower,
                    "Skipping invalid header value"
                ),
            }
        }
        if let Some(token) = &self.policy.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let local_request = builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| ForwardError::InvalidTarget(e.to_string()))?;

        let timeout = self.policy.request_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let reply = tokio::time::timeout_at(deadline, self.client.request(local_request))
            .await
            .map_err(|_| ForwardError::Timeout(timeout))??;

        let status = reply.status().as_u16();
        let headers = returned_headers(reply.headers());
        let streaming = headers
            .get("content-type")
            .is_some_and(|ct| is_event_stream(ct));

        if streaming {
            let events = self.relay_events(&request.id, reply.into_body(), out).await?;
            return Ok(Delivery::Stream { events });
        }

        let bytes = tokio::time::timeout_at(deadline, reply.into_body().collect())
            .await
            .map_err(|_| ForwardError::Timeout(timeout))??
            .to_bytes();
        out.send(ClientMessage::Response(Response::new(
            &request.id,
            status,
            headers,
            &bytes,
        )))
        .await?;
        Ok(Delivery::Single { status })
    }

    /// Stream event lines, then close with `sse_end` whatever happened.
    async fn relay_events(
        &self,
        id: &str,
        mut body: Incoming,
        out: &Outbound,
    ) -> Result<usize, ForwardError> {
        let mut events = 0;
        let pumped = self.pump_events(id, &mut body, out, &mut events).await;
        if let Err(ForwardError::Detached(gone)) = pumped {
            return Err(gone.into());
        }
        out.send(ClientMessage::SseEnd { id: id.to_string() }).await?;
        if let Err(e) = pumped {
            warn!(request_id = %id, events, "Event stream ended early: {e}");
        }
        Ok(events)
    }

    async fn pump_events(
        &self,
        id: &str,
        body: &mut Incoming,
        out: &Outbound,
        events: &mut usize,
    ) -> Result<(), ForwardError> {
        let idle = self.policy.request_timeout;
        let mut decoder = LineDecoder::new();
        loop {
            let frame = match tokio::time::timeout(idle, body.frame()).await {
                Err(_) => return Err(ForwardError::Timeout(idle)),
                Ok(None) => break,
                Ok(Some(frame)) => frame?,
            };
            let Ok(chunk) = frame.into_data() else {
                continue;
            };
            for line in decoder.push(&chunk) {
                send_event(id, line, out).await?;
                *events += 1;
            }
        }
        if let Some(tail) = decoder.finish() {
            send_event(id, tail, out).await?;
            *events += 1;
        }
        Ok(())
    }

    /// `base_url + path`, with the query parameters appended in key order.
    fn target_url(&self, request: &InboundRequest) -> Result<url::Url, ForwardError> {
        let raw = format!("{}{}", self.policy.base_url, request.path);
        let mut target =
            url::Url::parse(&raw).map_err(|e| ForwardError::InvalidTarget(e.to_string()))?;
        if !request.query.is_empty() {
            let mut params: Vec<_> = request.query.iter().collect();
            params.sort();
            target.query_pairs_mut().extend_pairs(params);
        }
        Ok(target)
    }
}

async fn send_event(id: &str, data: String, out: &Outbound) -> Result<(), Undeliverable> {
    out.send(ClientMessage::SseEvent {
        id: id.to_string(),
        data,
    })
    .await
}

fn parse_method(raw: &str) -> Result<Method, ForwardError> {
    let upper = raw.trim().to_ascii_uppercase();
    if !ALLOWED_METHODS.contains(&upper.as_str()) {
        return Err(ForwardError::UnsupportedMethod(raw.to_string()));
    }
    Method::from_bytes(upper.as_bytes()).map_err(|_| ForwardError::UnsupportedMethod(upper))
}

fn returned_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = RETURNED_RESPONSE_HEADERS
        .iter()
        .filter_map(|name| {
            let value = headers.get(*name)?.to_str().ok()?;
            Some(((*name).to_string(), value.to_string()))
        })
        .collect();
    out.entry(CONTENT_TYPE.as_str().to_string())
        .or_insert_with(|| "application/octet-stream".to_string());
    out
}
