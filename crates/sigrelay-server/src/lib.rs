//! # sigrelay-server
//!
//! WebRTC signaling relay over axum WebSockets.
//!
//! - Room registry: room membership and live peer connections kept in lockstep
//! - Fan-out: best-effort, non-blocking delivery over bounded per-peer queues
//! - Sessions: one task per socket, with transport heartbeat and exactly-once cleanup
//! - Status endpoints: `/`, `/health`, `/rooms`, `/metrics`
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod status;
pub mod websocket;

pub use config::ServerConfig;
pub use errors::{DeliveryError, ServerError};
pub use registry::{BroadcastReport, RegistrySnapshot, RoomRegistry};
pub use server::{AppState, ServerHandle, SignalServer};
pub use shutdown::ShutdownCoordinator;
