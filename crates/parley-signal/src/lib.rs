//! Parley signaling server.
//!
//! Peers join under a name over a WebSocket, see who else is online, place
//! and end calls, and exchange opaque offer/answer/candidate payloads. Media
//! never passes through here.

#![forbid(unsafe_code)]

pub mod app;
pub mod broadcast;
pub mod config;
pub mod registry;
pub mod router;
pub mod signal;

pub use app::{build_router, serve, AppState};
pub use config::Config;
pub use registry::{ConnectionId, Registry, Rejection};
pub use router::{Flow, MessageRouter, RouterOptions};
pub use signal::{Gateway, GatewayLimits, Signaler};
