//! Connection manager: outbound WebSocket to the relay.
//!
//! The supervisor keeps one connection alive at a time. Each attempt walks
//! `Connecting → Authenticating → Connected`; when the connection ends the
//! supervisor backs off and tries again, idles while the user has
//! disconnected, or exits on an auth rejection or `stop()`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::backoff::Backoff;
use super::forward::LocalForwarder;
use super::heartbeat;
use super::protocol::{self, ClientMessage, CodecError, RelayMessage, Welcome};
use super::status::{Phase, TunnelShared};
use super::writer::{run_writer, Outbound, WriteError, OUTBOUND_CAPACITY};
use crate::config::TunnelConfig;

/// How long a closing writer gets to flush before it is aborted.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

/// Why a connection attempt failed. All of these are transient.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("relay server url is not configured")]
    NotConfigured,
    #[error("invalid relay url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("connect failed: {0}")]
    Connect(#[source] tungstenite::Error),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("transport error: {0}")]
    Transport(#[source] tungstenite::Error),
    #[error(transparent)]
    Write(#[from] WriteError),
}

/// How a connection ended without a transport error.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionEnd {
    /// `welcome` carried an error. Not retried.
    Rejected(String),
    /// The relay closed the connection.
    Closed,
    /// Closed from our side by a control or by shutdown.
    Local,
}

/// Supervisor loop. Runs until `cancel` fires or the relay rejects us.
pub(crate) async fn supervise(shared: Arc<TunnelShared>, cancel: CancellationToken) {
    let config = &shared.config;
    let forwarder = Arc::new(LocalForwarder::new(config.local.clone()));
    let mut backoff = Backoff::new(config.reconnect_interval, config.reconnect_max_delay);
    let mut attempts: u64 = 0;

    shared.mark_running();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        if shared.is_user_disconnected() {
            shared.set_phase(Phase::Idle);
            tokio::select! {
                () = cancel.cancelled() => break,
                () = shared.control_changed() => continue,
            }
        }
        if config.server_url.is_empty() {
            warn!("Tunnel: no relay server url configured, supervisor exiting");
            shared.mark_disconnected(Some(TunnelError::NotConfigured.to_string()));
            if shared.stop_unless_woken() {
                debug!("Tunnel supervisor exited");
                return;
            }
            continue;
        }

        shared.clear_control();
        let conn_cancel = cancel.child_token();
        shared.set_active(Some(conn_cancel.clone()));
        if shared.is_user_disconnected() {
            shared.set_active(None);
            continue;
        }
        if attempts > 0 {
            shared.stats.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        attempts += 1;

        let span = info_span!("tunnel", conn = %uuid::Uuid::new_v4());
        let result = run_session(&shared, &forwarder, &conn_cancel, &mut backoff)
            .instrument(span)
            .await;
        shared.set_active(None);

        match result {
            Ok(SessionEnd::Rejected(reason)) => {
                warn!("Tunnel: relay rejected the connection: {reason}");
                shared.mark_disconnected(Some(reason));
                if shared.stop_unless_woken() {
                    debug!("Tunnel supervisor exited");
                    return;
                }
                info!("Tunnel: reconnect requested after rejection, retrying");
                continue;
            }
            Ok(SessionEnd::Local) => {
                shared.mark_disconnected(None);
                backoff.reset();
                continue;
            }
            Ok(SessionEnd::Closed) => {
                info!("Tunnel: relay closed the connection");
                shared.mark_disconnected(Some("relay closed the connection".to_string()));
            }
            Err(e) => {
                warn!("Tunnel: {e}");
                shared.mark_disconnected(Some(e.to_string()));
            }
        }

        if cancel.is_cancelled() {
            break;
        }
        if !config.auto_reconnect {
            info!("Tunnel: auto-reconnect disabled, waiting for a manual reconnect");
            shared.set_phase(Phase::Idle);
            tokio::select! {
                () = cancel.cancelled() => break,
                () = shared.control_changed() => continue,
            }
        }

        let delay = backoff.next_delay();
        shared.set_phase(Phase::Reconnecting);
        info!("Tunnel: reconnecting in {}ms", delay.as_millis());
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
            () = shared.control_changed() => {}
        }
    }

    shared.mark_stopped();
    debug!("Tunnel supervisor exited");
}

/// One connection: connect, authenticate, then serve until it ends.
async fn run_session(
    shared: &Arc<TunnelShared>,
    forwarder: &Arc<LocalForwarder>,
    conn_cancel: &CancellationToken,
    backoff: &mut Backoff,
) -> Result<SessionEnd, TunnelError> {
    let config = &shared.config;
    let url = connect_url(config)?;
    shared.set_phase(Phase::Connecting);
    info!("Tunnel: connecting to {}", redacted(&url));

    let connect = tokio::time::timeout(
        config.handshake_timeout,
        tokio_tungstenite::connect_async(url.as_str()),
    );
    let (ws, _response) = tokio::select! {
        () = conn_cancel.cancelled() => return Ok(SessionEnd::Local),
        result = connect => result
            .map_err(|_| TunnelError::HandshakeTimeout)?
            .map_err(TunnelError::Connect)?,
    };
    let (sink, mut stream) = ws.split();

    shared.set_phase(Phase::Authenticating);
    let welcome = tokio::select! {
        () = conn_cancel.cancelled() => return Ok(SessionEnd::Local),
        result = tokio::time::timeout(config.handshake_timeout, read_welcome(&mut stream)) => {
            result.map_err(|_| TunnelError::HandshakeTimeout)??
        }
    };
    let client_id = match welcome {
        Welcome { error: Some(reason), .. } => {
            let reason = if reason.trim().is_empty() {
                "authentication rejected".to_string()
            } else {
                reason
            };
            return Ok(SessionEnd::Rejected(reason));
        }
        Welcome { client_id: Some(id), .. } => id,
        Welcome { .. } => {
            return Err(TunnelError::Handshake(
                "welcome carried neither client_id nor error".to_string(),
            ))
        }
    };

    shared.mark_connected(&client_id);
    backoff.reset();
    info!(client_id = %client_id, "Tunnel: connected to relay");

    let (outbound, rx) = Outbound::channel(OUTBOUND_CAPACITY);
    let mut writer = tokio::spawn(run_writer(
        sink,
        rx,
        conn_cancel.clone(),
        Arc::clone(&shared.stats),
    ));
    let heartbeat = heartbeat::spawn(
        outbound.clone(),
        config.heartbeat_interval,
        conn_cancel.clone(),
    );

    let mut writer_done = false;
    let result = loop {
        tokio::select! {
            () = conn_cancel.cancelled() => break Ok(SessionEnd::Local),
            joined = &mut writer => {
                writer_done = true;
                break match joined {
                    Ok(Ok(())) => Ok(SessionEnd::Local),
                    Ok(Err(e)) => Err(e.into()),
                    Err(e) => Err(WriteError(e.to_string()).into()),
                };
            }
            frame = stream.next() => match frame {
                None => break Ok(SessionEnd::Closed),
                Some(Err(e)) => break Err(TunnelError::Transport(e)),
                Some(Ok(Message::Text(text))) => {
                    shared.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    dispatch(shared, forwarder, &outbound, &text);
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Tunnel: close frame received");
                    break Ok(SessionEnd::Closed);
                }
                Some(Ok(_)) => {}
            },
        }
    };

    shared.set_phase(Phase::Closing);
    conn_cancel.cancel();
    shutdown_task(heartbeat).await;
    if !writer_done {
        shutdown_task(writer).await;
    }
    result
}

/// Handle one inbound text frame without waiting on anything slow.
fn dispatch(shared: &Arc<TunnelShared>, forwarder: &Arc<LocalForwarder>, out: &Outbound, text: &str) {
    match protocol::decode(text) {
        Ok(RelayMessage::Ping(hb)) => {
            if out.try_send(ClientMessage::Pong(hb)).is_err() {
                debug!("Tunnel: pong dropped, outbound queue full");
            }
        }
        Ok(RelayMessage::Pong(hb)) => {
            if let Some(ts) = hb.ts {
                shared
                    .stats
                    .record_rtt(protocol::unix_millis().saturating_sub(ts));
            }
        }
        Ok(RelayMessage::Request(request)) => {
            debug!(
                request_id = %request.id,
                method = %request.method,
                path = %request.path,
                "Tunnel: request"
            );
            let in_flight = shared.stats.begin_request();
            let forwarder = Arc::clone(forwarder);
            let out = out.clone();
            tokio::spawn(
                async move {
                    forwarder.forward(request, &out).await;
                    drop(in_flight);
                }
                .in_current_span(),
            );
        }
        Ok(RelayMessage::Welcome(_)) => debug!("Tunnel: ignoring repeated welcome"),
        Ok(RelayMessage::Unknown) => warn!("Tunnel: ignoring unknown message kind"),
        Err(CodecError::UnknownKind(kind)) => {
            warn!(msg_type = %kind, "Tunnel: ignoring unknown message kind");
        }
        Err(e) => warn!("Tunnel: ignoring malformed frame: {e}"),
    }
}

/// Read frames until `welcome` arrives.
async fn read_welcome<S>(stream: &mut S) -> Result<Welcome, TunnelError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame.map_err(TunnelError::Transport)? {
            Message::Text(text) => match protocol::decode(&text) {
                Ok(RelayMessage::Welcome(welcome)) => return Ok(welcome),
                Ok(other) => debug!(?other, "Tunnel: frame before welcome ignored"),
                Err(e) => warn!("Tunnel: ignoring malformed frame before welcome: {e}"),
            },
            Message::Close(_) => {
                return Err(TunnelError::Handshake(
                    "relay closed the connection before welcome".to_string(),
                ))
            }
            _ => {}
        }
    }
    Err(TunnelError::Handshake(
        "connection ended before welcome".to_string(),
    ))
}

/// Relay URL with the license key and display name as query parameters.
fn connect_url(config: &TunnelConfig) -> Result<url::Url, TunnelError> {
    if config.server_url.is_empty() {
        return Err(TunnelError::NotConfigured);
    }
    let mut url = url::Url::parse(&config.server_url)?;
    url.query_pairs_mut()
        .append_pair("key", &config.license_key)
        .append_pair("name", &config.client_name);
    Ok(url)
}

/// Connect URL with the license key masked, for logs and `check`.
pub fn redacted(url: &url::Url) -> String {
    let mut shown = url.clone();
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let v = if k == "key" && !v.is_empty() {
                "***".to_string()
            } else {
                v.into_owned()
            };
            (k.into_owned(), v)
        })
        .collect();
    shown.query_pairs_mut().clear().extend_pairs(pairs);
    shown.to_string()
}

/// The URL the tunnel would connect to, with the key masked.
pub fn display_target(config: &TunnelConfig) -> Result<String, TunnelError> {
    connect_url(config).map(|url| redacted(&url))
}

async fn shutdown_task<T>(mut task: JoinHandle<T>) {
    if tokio::time::timeout(WRITER_DRAIN, &mut task).await.is_err() {
        task.abort();
    }
}
