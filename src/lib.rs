#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! relaylink library: the tunnel and its control surface, for embedding in a
//! larger device service.
//!
//! - `tunnel`: outbound relay connection, request forwarding, status handle
//! - `config`: configuration loading
//! - `auth`: bearer token middleware for the control API
//! - `routes`: control API route handlers

pub mod auth;
pub mod config;
pub mod routes;
pub mod tunnel;

pub use config::{Config, ConfigError, ForwardPolicy, TunnelConfig};
pub use tunnel::{Phase, TunnelHandle, TunnelStatus};
