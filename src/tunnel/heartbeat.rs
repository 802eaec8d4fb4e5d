//! Periodic `ping` while a connection is up.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::protocol::ClientMessage;
use super::writer::Outbound;

/// Send a timestamped ping every `every` until `cancel` fires.
///
/// The first ping goes out one interval after the connection is established.
/// If the writer is gone the task ends; the receive loop sees the same failure
/// and tears the connection down.
pub fn spawn(outbound: Outbound, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if outbound.send(ClientMessage::ping_now()).await.is_err() {
                debug!("Heartbeat stopped: tunnel writer is gone");
                break;
            }
        }
    })
}
