//! Single writer for the tunnel connection.
//!
//! The WebSocket sink is owned by one task. The receive loop, the heartbeat
//! and every forwarder queue frames through a cloned [`Outbound`]; nothing
//! else touches the sink, so writes never interleave.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::protocol::{encode, ClientMessage};
use super::status::TunnelStats;

/// Outbound queue depth. A full queue makes forwarders wait, which in turn
/// stops them reading from the local server.
pub const OUTBOUND_CAPACITY: usize = 256;

/// The connection this frame was meant for is gone; the frame was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("tunnel connection is closed")]
pub struct Undeliverable;

/// Cloneable handle for queuing frames to the connection writer.
#[derive(Clone, Debug)]
pub struct Outbound {
    tx: mpsc::Sender<ClientMessage>,
}

impl Outbound {
    /// Create a handle and the receiver the writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ClientMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a frame, waiting for room if the writer is behind.
    pub async fn send(&self, message: ClientMessage) -> Result<(), Undeliverable> {
        self.tx.send(message).await.map_err(|_| Undeliverable)
    }

    /// Queue a frame only if there is room right now.
    pub fn try_send(&self, message: ClientMessage) -> Result<(), Undeliverable> {
        self.tx.try_send(message).map_err(|_| Undeliverable)
    }

    /// Whether the writer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Why the writer stopped on its own.
#[derive(Debug, thiserror::Error)]
#[error("tunnel write failed: {0}")]
pub struct WriteError(pub String);

/// Drain queued frames into `sink` until `cancel` fires or a write fails.
///
/// On cancellation a close frame is sent on a best-effort basis. Frames still
/// queued at that point are dropped.
pub async fn run_writer<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<ClientMessage>,
    cancel: CancellationToken,
    stats: Arc<TunnelStats>,
) -> Result<(), WriteError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(m) => m,
                None => break,
            },
        };
        let text = match encode(&message) {
            Ok(t) => t,
            Err(e) => {
                warn!(request_id = ?message.request_id(), "Dropping unencodable frame: {e}");
                continue;
            }
        };
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| WriteError(e.to_string()))?;
        stats.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    rx.close();
    if let Err(e) = sink.send(Message::Close(None)).await {
        debug!("Close frame not sent: {e}");
    }
    Ok(())
}
