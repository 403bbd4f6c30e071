//! WebSocket peer connections, liveness monitoring, and per-connection sessions.

pub mod connection;
pub mod heartbeat;
pub mod session;
