//! Room membership registry and best-effort fan-out.
//!
//! The registry owns two maps that must agree at all times:
//!
//! - connection key (`room_id:user_id`) → live [`PeerConnection`]
//! - room id → set of member user ids
//!
//! Both live behind one [`RwLock`], so every join and leave is applied to
//! the pair atomically and no reader can observe one map updated without
//! the other. A room exists only while it has members.
//!
//! Sending never happens under the lock. Fan-out takes a snapshot of the
//! recipients, releases the lock, then enqueues into each peer's bounded
//! queue with `try_send`. A failed delivery is logged and counted but never
//! aborts the loop; a peer whose writer is gone, or that keeps overflowing
//! its queue, is evicted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::DeliveryError;
use crate::metrics::{
    SIGNAL_BROADCAST_RECIPIENTS_TOTAL, SIGNAL_DELIVERY_FAILURES_TOTAL, SIGNAL_EVICTIONS_TOTAL,
    SIGNAL_ROOMS_ACTIVE, WS_CONNECTIONS_ACTIVE,
};
use crate::protocol::ServerMessage;
use crate::websocket::connection::{ConnectionId, ConnectionKey, PeerConnection};

/// Default number of dropped frames before a slow peer is evicted.
pub const DEFAULT_MAX_DROPPED_MESSAGES: u64 = 64;

/// Point-in-time view of the registry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    /// Number of registered connections.
    pub connection_count: usize,
    /// Room id → sorted member user ids.
    pub rooms: BTreeMap<String, Vec<String>>,
}

impl RegistrySnapshot {
    /// Number of non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

/// Outcome of one fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Members targeted (room size minus the excluded sender).
    pub recipients: usize,
    /// Frames enqueued successfully.
    pub delivered: usize,
    /// Frames that could not be enqueued.
    pub failed: usize,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionKey, Arc<PeerConnection>>,
    rooms: HashMap<String, HashSet<String>>,
}

impl RegistryState {
    fn insert(&mut self, connection: Arc<PeerConnection>) -> Option<Arc<PeerConnection>> {
        let key = connection.key.clone();
        let _ = self
            .rooms
            .entry(key.room_id.clone())
            .or_default()
            .insert(key.user_id.clone());
        self.connections.insert(key, connection)
    }

    /// Remove `key`, only if it is held by `expected` when one is given.
    fn remove(
        &mut self,
        key: &ConnectionKey,
        expected: Option<&ConnectionId>,
    ) -> Option<Arc<PeerConnection>> {
        let current = self.connections.get(key)?;
        if expected.is_some_and(|id| *id != current.id) {
            return None;
        }
        let removed = self.connections.remove(key)?;
        if let Some(members) = self.rooms.get_mut(&key.room_id) {
            let _ = members.remove(&key.user_id);
            if members.is_empty() {
                let _ = self.rooms.remove(&key.room_id);
            }
        }
        Some(removed)
    }

    fn members_except(&self, room_id: &str, exclude: Option<&str>) -> Vec<Arc<PeerConnection>> {
        let Some(members) = self.rooms.get(room_id) else {
            return Vec::new();
        };
        members
            .iter()
            .filter(|user_id| exclude != Some(user_id.as_str()))
            .filter_map(|user_id| {
                self.connections
                    .get(&ConnectionKey::new(room_id, user_id.as_str()))
                    .cloned()
            })
            .collect()
    }

    fn publish_gauges(&self) {
        gauge!(WS_CONNECTIONS_ACTIVE).set(self.connections.len() as f64);
        gauge!(SIGNAL_ROOMS_ACTIVE).set(self.rooms.len() as f64);
    }
}

/// Process-wide registry of rooms and their live connections.
pub struct RoomRegistry {
    state: RwLock<RegistryState>,
    max_dropped_messages: u64,
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::with_max_dropped_messages(DEFAULT_MAX_DROPPED_MESSAGES)
    }

    /// Create an empty registry that evicts peers after `max_dropped`
    /// overflowed frames.
    pub fn with_max_dropped_messages(max_dropped: u64) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            max_dropped_messages: max_dropped.max(1),
        }
    }

    /// Register `connection` under its key and announce it to the room.
    ///
    /// The registration is visible to every other operation before any
    /// `peer-joined` notice is sent. An existing holder of the same key is
    /// replaced and returned; it is not notified.
    pub fn join(&self, connection: Arc<PeerConnection>) -> Option<Arc<PeerConnection>> {
        let (replaced, peers) = {
            let mut state = self.state.write();
            let replaced = state.insert(Arc::clone(&connection));
            let peers = state.members_except(connection.room_id(), Some(connection.user_id()));
            state.publish_gauges();
            (replaced, peers)
        };

        if let Some(old) = &replaced {
            info!(
                key = %connection.key,
                old_conn_id = %old.id,
                conn_id = %connection.id,
                "connection replaced by reconnect"
            );
        } else {
            info!(
                room_id = connection.room_id(),
                user_id = connection.user_id(),
                conn_id = %connection.id,
                "peer joined room"
            );
        }

        let notice = ServerMessage::PeerJoined {
            user_id: connection.user_id().to_owned(),
        };
        let _ = self.fan_out(&peers, &notice);
        replaced
    }

    /// Remove `(room_id, user_id)` whatever connection holds it.
    ///
    /// Returns `false` when the pair was not registered; calling this
    /// repeatedly is harmless.
    pub fn leave(&self, room_id: &str, user_id: &str) -> bool {
        self.remove(&ConnectionKey::new(room_id, user_id), None)
            .is_some()
    }

    /// Remove `connection`, only if its key is still held by it.
    ///
    /// A session superseded by a reconnect calls this on exit without
    /// disturbing its replacement.
    pub fn leave_connection(&self, connection: &PeerConnection) -> bool {
        self.remove(&connection.key, Some(&connection.id)).is_some()
    }

    fn remove(
        &self,
        key: &ConnectionKey,
        expected: Option<&ConnectionId>,
    ) -> Option<Arc<PeerConnection>> {
        let removed = {
            let mut state = self.state.write();
            let removed = state.remove(key, expected);
            if removed.is_some() {
                state.publish_gauges();
            }
            removed
        };
        if let Some(conn) = &removed {
            info!(
                room_id = %key.room_id,
                user_id = %key.user_id,
                conn_id = %conn.id,
                "peer left room"
            );
        }
        removed
    }

    /// Best-effort delivery of one message to one peer.
    pub fn unicast(
        &self,
        connection: &PeerConnection,
        message: &ServerMessage,
    ) -> Result<(), DeliveryError> {
        let frame = encode(message)?;
        self.deliver(connection, frame)
    }

    /// Deliver `message` to every member of `room_id` except
    /// `exclude_user_id`.
    ///
    /// A missing room is a no-op. Failures are per recipient and never stop
    /// the remaining deliveries.
    pub fn broadcast(
        &self,
        room_id: &str,
        message: &ServerMessage,
        exclude_user_id: Option<&str>,
    ) -> BroadcastReport {
        let recipients = self.state.read().members_except(room_id, exclude_user_id);
        let report = self.fan_out(&recipients, message);
        debug!(
            room_id,
            message_type = message.kind(),
            recipients = report.recipients,
            failed = report.failed,
            "broadcast"
        );
        report
    }

    fn fan_out(
        &self,
        recipients: &[Arc<PeerConnection>],
        message: &ServerMessage,
    ) -> BroadcastReport {
        let mut report = BroadcastReport {
            recipients: recipients.len(),
            ..BroadcastReport::default()
        };
        if recipients.is_empty() {
            return report;
        }
        let Ok(frame) = encode(message) else {
            report.failed = recipients.len();
            return report;
        };
        for conn in recipients {
            match self.deliver(conn, Arc::clone(&frame)) {
                Ok(()) => report.delivered += 1,
                Err(_) => report.failed += 1,
            }
        }
        counter!(SIGNAL_BROADCAST_RECIPIENTS_TOTAL).increment(report.delivered as u64);
        report
    }

    fn deliver(&self, connection: &PeerConnection, frame: Arc<str>) -> Result<(), DeliveryError> {
        let Err(err) = connection.send(frame) else {
            return Ok(());
        };
        counter!(SIGNAL_DELIVERY_FAILURES_TOTAL, "reason" => err.as_label()).increment(1);
        let drops = connection.drop_count();
        warn!(
            key = %connection.key,
            conn_id = %connection.id,
            error = %err,
            total_drops = drops,
            "failed to deliver message"
        );
        let evict = match err {
            DeliveryError::Closed => true,
            DeliveryError::Full => drops >= self.max_dropped_messages,
            DeliveryError::Encode => false,
        };
        if evict {
            self.evict(connection);
        }
        Err(err)
    }

    fn evict(&self, connection: &PeerConnection) {
        connection.close();
        if self.leave_connection(connection) {
            counter!(SIGNAL_EVICTIONS_TOTAL).increment(1);
            warn!(key = %connection.key, conn_id = %connection.id, "evicted unreachable peer");
        }
    }

    /// Coherent view of all rooms, taken under one read lock.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.read();
        let rooms = state
            .rooms
            .iter()
            .map(|(room_id, members)| {
                let mut members: Vec<String> = members.iter().cloned().collect();
                members.sort();
                (room_id.clone(), members)
            })
            .collect();
        RegistrySnapshot {
            connection_count: state.connections.len(),
            rooms,
        }
    }

    /// The connection currently holding `(room_id, user_id)`.
    pub fn connection(&self, room_id: &str, user_id: &str) -> Option<Arc<PeerConnection>> {
        self.state
            .read()
            .connections
            .get(&ConnectionKey::new(room_id, user_id))
            .cloned()
    }

    /// Sorted members of `room_id` (empty if the room does not exist).
    pub fn members(&self, room_id: &str) -> Vec<String> {
        let state = self.state.read();
        let mut members: Vec<String> = state
            .rooms
            .get(room_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.state.read().connections.len()
    }

    /// Number of non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.state.read().rooms.len()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let state = self.state.read();
        for key in state.connections.keys() {
            let members = state
                .rooms
                .get(&key.room_id)
                .unwrap_or_else(|| panic!("{key} has no room entry"));
            assert!(members.contains(&key.user_id), "{key} missing from room set");
        }
        let member_total: usize = state.rooms.values().map(HashSet::len).sum();
        assert_eq!(member_total, state.connections.len());
        assert!(state.rooms.values().all(|m| !m.is_empty()), "empty room kept");
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(message: &ServerMessage) -> Result<Arc<str>, DeliveryError> {
    message.to_frame().map_err(|e| {
        warn!(message_type = message.kind(), error = %e, "failed to serialize message");
        DeliveryError::Encode
    })
}
