//! Outbound relay tunnel.
//!
//! The device dials out to a public relay over a WebSocket and keeps that
//! connection up. The relay pushes HTTP requests down the connection; each one
//! is replayed against the loopback server and answered on the same
//! connection, either as a single response or as a stream of event lines.
//!
//! - [`protocol`]: frame types and the JSON codec.
//! - [`client`]: supervisor and per-connection loop.
//! - [`forward`]: replays one request against the local server.
//! - [`status`]: [`TunnelHandle`], the status snapshot and the controls.

pub mod backoff;
pub mod client;
pub mod forward;
pub mod heartbeat;
pub mod protocol;
pub mod sse;
pub mod status;
pub mod writer;

#[cfg(test)]
pub(crate) mod testutil;

pub use status::{Phase, TunnelHandle, TunnelStatus};
