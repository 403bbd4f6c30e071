//! Read-only status documents served over HTTP.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;

use crate::registry::RegistrySnapshot;

/// Human-readable service name reported at `/`.
pub const SERVICE_NAME: &str = "WebRTC Signaling Server";

/// Route table advertised at `/`.
#[derive(Debug, Clone, Serialize)]
pub struct Endpoints {
    /// WebSocket upgrade route.
    pub websocket: &'static str,
    /// Liveness route.
    pub health: &'static str,
    /// Room listing route.
    pub rooms: &'static str,
}

/// `GET /` body.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    /// Always `"active"`.
    pub status: &'static str,
    /// Service name.
    pub service: &'static str,
    /// Available routes.
    pub endpoints: Endpoints,
}

/// `GET /health` body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"healthy"` while the server is running.
    pub status: &'static str,
    /// Registered connections.
    pub connections: usize,
    /// Seconds since the server started.
    pub uptime_secs: u64,
}

/// `GET /rooms` body.
#[derive(Debug, Clone, Serialize)]
pub struct RoomsResponse {
    /// Number of non-empty rooms.
    pub active_rooms: usize,
    /// Room id → sorted member user ids.
    pub rooms: BTreeMap<String, Vec<String>>,
}

/// Build the `/` document.
pub fn service_info() -> ServiceInfo {
    ServiceInfo {
        status: "active",
        service: SERVICE_NAME,
        endpoints: Endpoints {
            websocket: "/ws/{room_id}/{user_id}",
            health: "/health",
            rooms: "/rooms",
        },
    }
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize) -> HealthResponse {
    HealthResponse {
        status: "healthy",
        connections,
        uptime_secs: start_time.elapsed().as_secs(),
    }
}

/// Build the `/rooms` document from a registry snapshot.
pub fn rooms(snapshot: RegistrySnapshot) -> RoomsResponse {
    RoomsResponse {
        active_rooms: snapshot.room_count(),
        rooms: snapshot.rooms,
    }
}
