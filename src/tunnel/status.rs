//! Status and control surface.
//!
//! [`TunnelHandle`] is the only way the embedding application touches the
//! tunnel. Reads take a short synchronous lock and never wait on the tunnel
//! loop, so they are safe from any thread or runtime. Controls flip flags,
//! close the live connection and wake the supervisor; the supervisor does the
//! rest on its own runtime.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::client;
use super::protocol::unix_millis;
use crate::config::TunnelConfig;

/// Where the connection manager currently is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting,
    Closing,
}

/// Connection state owned by the supervisor.
///
/// Only mutated through [`TunnelShared`], which keeps `connected ⇒ running`
/// and `connected_since.is_some() == connected`.
#[derive(Debug, Clone, Default)]
struct ConnectionState {
    running: bool,
    connected: bool,
    phase: Phase,
    last_error: Option<String>,
    connected_since: Option<u64>,
    client_id: Option<String>,
}

/// Lock-free tunnel counters.
#[derive(Debug)]
pub struct TunnelStats {
    pub reconnects: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub requests_total: AtomicU64,
    pub requests_in_flight: AtomicU64,
    /// Last heartbeat round trip, `u64::MAX` until the first pong.
    last_rtt_ms: AtomicU64,
}

impl TunnelStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            reconnects: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            requests_total: AtomicU64::new(0),
            requests_in_flight: AtomicU64::new(0),
            last_rtt_ms: AtomicU64::new(u64::MAX),
        }
    }

    pub fn record_rtt(&self, rtt_ms: u64) {
        self.last_rtt_ms.store(rtt_ms.min(u64::MAX - 1), Ordering::Relaxed);
    }

    pub fn last_rtt_ms(&self) -> Option<u64> {
        match self.last_rtt_ms.load(Ordering::Relaxed) {
            u64::MAX => None,
            v => Some(v),
        }
    }

    /// Count a request as started; the guard counts it as finished on drop.
    pub fn begin_request(self: &Arc<Self>) -> InFlight {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.requests_in_flight.fetch_add(1, Ordering::Relaxed);
        InFlight(Arc::clone(self))
    }
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements `requests_in_flight` when a forwarder task ends, however it ends.
pub struct InFlight(Arc<TunnelStats>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.requests_in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of the tunnel, as served by the control API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelStatus {
    pub enabled: bool,
    pub running: bool,
    pub connected: bool,
    pub phase: Phase,
    pub server_url: String,
    pub client_name: String,
    pub license_key_set: bool,
    pub client_id: Option<String>,
    pub last_error: Option<String>,
    /// Milliseconds since the UNIX epoch.
    pub connected_since: Option<u64>,
    pub user_disconnected: bool,
    pub reconnects: u64,
    pub requests_in_flight: u64,
    pub requests_total: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub last_rtt_ms: Option<u64>,
}

/// State shared between the handle and the supervisor task.
pub(crate) struct TunnelShared {
    pub(crate) config: TunnelConfig,
    pub(crate) stats: Arc<TunnelStats>,
    state: Mutex<ConnectionState>,
    user_disconnected: AtomicBool,
    /// Wakes the supervisor when a control changes what it should be doing.
    control: Notify,
    /// Cancels the live connection (or the attempt in progress).
    active: Mutex<Option<CancellationToken>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TunnelShared {
    fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            stats: Arc::new(TunnelStats::new()),
            state: Mutex::new(ConnectionState::default()),
            user_disconnected: AtomicBool::new(false),
            control: Notify::new(),
            active: Mutex::new(None),
        }
    }

    pub(crate) fn is_user_disconnected(&self) -> bool {
        self.user_disconnected.load(Ordering::SeqCst)
    }

    /// Resolves once a control has been used since the last wait.
    pub(crate) async fn control_changed(&self) {
        self.control.notified().await;
    }

    /// Discard a wake-up left over from a control already acted on.
    pub(crate) fn clear_control(&self) {
        let _ = self.control.notified().now_or_never();
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        lock(&self.state).phase = phase;
    }

    fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    pub(crate) fn mark_running(&self) {
        let mut state = lock(&self.state);
        state.running = true;
    }

    pub(crate) fn mark_connected(&self, client_id: &str) {
        let mut state = lock(&self.state);
        state.running = true;
        state.connected = true;
        state.phase = Phase::Connected;
        state.connected_since = Some(unix_millis());
        state.client_id = Some(client_id.to_string());
        state.last_error = None;
    }

    /// Leave `Connected`. `error` replaces `last_error` when given.
    pub(crate) fn mark_disconnected(&self, error: Option<String>) {
        let mut state = lock(&self.state);
        state.connected = false;
        state.connected_since = None;
        if error.is_some() {
            state.last_error = error;
        }
    }

    /// The supervisor is gone.
    pub(crate) fn mark_stopped(&self) {
        let mut state = lock(&self.state);
        state.connected = false;
        state.connected_since = None;
        state.running = false;
        state.phase = Phase::Idle;
    }

    /// Mark the supervisor stopped unless a control woke it since the attempt
    /// began. Returns `false` when the supervisor should keep going.
    ///
    /// Runs under the state lock so that [`TunnelHandle::start`] either sees
    /// the supervisor still running (and its wake-up is honoured here) or
    /// sees it stopped and spawns a new one.
    pub(crate) fn stop_unless_woken(&self) -> bool {
        let mut state = lock(&self.state);
        let woken = self.control.notified().now_or_never().is_some();
        if woken && !self.is_user_disconnected() {
            return false;
        }
        state.connected = false;
        state.connected_since = None;
        state.running = false;
        state.phase = Phase::Idle;
        true
    }

    /// Register the token for the connection about to be attempted.
    pub(crate) fn set_active(&self, token: Option<CancellationToken>) {
        *lock(&self.active) = token;
    }

    fn close_active(&self) {
        if let Some(token) = lock(&self.active).as_ref() {
            token.cancel();
        }
    }

    fn snapshot(&self) -> TunnelStatus {
        let state = lock(&self.state).clone();
        let stats = &self.stats;
        TunnelStatus {
            enabled: self.config.enabled,
            running: state.running,
            connected: state.connected,
            phase: state.phase,
            server_url: self.config.server_url.clone(),
            client_name: self.config.client_name.clone(),
            license_key_set: !self.config.license_key.is_empty(),
            client_id: state.client_id,
            last_error: state.last_error,
            connected_since: state.connected_since,
            user_disconnected: self.is_user_disconnected(),
            reconnects: stats.reconnects.load(Ordering::Relaxed),
            requests_in_flight: stats.requests_in_flight.load(Ordering::Relaxed),
            requests_total: stats.requests_total.load(Ordering::Relaxed),
            messages_sent: stats.messages_sent.load(Ordering::Relaxed),
            messages_received: stats.messages_received.load(Ordering::Relaxed),
            last_rtt_ms: stats.last_rtt_ms(),
        }
    }
}

struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Cloneable handle to one tunnel instance.
///
/// The tunnel runs on the runtime passed to [`TunnelHandle::new`]; every
/// method here can be called from any thread.
#[derive(Clone)]
pub struct TunnelHandle {
    shared: Arc<TunnelShared>,
    supervisor: Arc<Mutex<Option<Supervisor>>>,
    runtime: Handle,
}

impl TunnelHandle {
    pub fn new(config: TunnelConfig, runtime: Handle) -> Self {
        Self {
            shared: Arc::new(TunnelShared::new(config)),
            supervisor: Arc::new(Mutex::new(None)),
            runtime,
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.shared.config
    }

    /// Current snapshot. Never fails and never waits on the tunnel.
    pub fn status(&self) -> TunnelStatus {
        self.shared.snapshot()
    }

    /// Launch the supervisor unless one is already running.
    pub fn start(&self) {
        let mut slot = lock(&self.supervisor);
        let alive = slot.as_ref().is_some_and(|s| !s.task.is_finished());
        if alive && self.shared.is_running() {
            return;
        }
        let cancel = CancellationToken::new();
        self.shared.mark_running();
        let task = self
            .runtime
            .spawn(client::supervise(Arc::clone(&self.shared), cancel.clone()));
        *slot = Some(Supervisor { cancel, task });
        info!(server_url = %self.shared.config.server_url, "Tunnel supervisor started");
    }

    /// Terminate the supervisor and wait for it. Calling it again is a no-op.
    pub async fn stop(&self) {
        let supervisor = lock(&self.supervisor).take();
        if let Some(Supervisor { cancel, task }) = supervisor {
            self.shared.set_phase(Phase::Closing);
            cancel.cancel();
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!("Tunnel supervisor panicked: {e}");
                }
            }
            info!("Tunnel supervisor stopped");
        }
        self.shared.mark_stopped();
    }

    /// Stop this tunnel and return a new one built from `config`, on the same
    /// runtime. The new tunnel starts right away when `config.enabled`.
    ///
    /// Counters and the disconnect flag start fresh.
    pub async fn reconfigure(&self, config: TunnelConfig) -> TunnelHandle {
        self.stop().await;
        let next = TunnelHandle::new(config, self.runtime.clone());
        if next.config().enabled {
            next.start();
        }
        next
    }

    /// Close the connection and stay offline until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.shared.user_disconnected.store(true, Ordering::SeqCst);
        self.shared.close_active();
        self.shared.control.notify_one();
        info!("Tunnel disconnected by user");
    }

    /// Drop the current connection and establish a fresh one right away.
    ///
    /// Also clears a previous [`disconnect`](Self::disconnect) and restarts a
    /// supervisor that has exited (for instance after an auth rejection).
    pub fn reconnect(&self) {
        self.shared.user_disconnected.store(false, Ordering::SeqCst);
        self.shared.close_active();
        self.shared.control.notify_one();
        self.start();
        info!("Tunnel reconnect requested");
    }
}
