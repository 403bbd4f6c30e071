//! A peer's live WebSocket channel.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::DeliveryError;

/// Process-unique identity of one connection, distinct across reconnects
/// with the same room and user.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Allocate a fresh id.
    pub fn new() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The `(room_id, user_id)` pair addressing a slot in the registry.
///
/// Displays as `room_id:user_id`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    /// Room the peer joined.
    pub room_id: String,
    /// Peer identity within the room.
    pub user_id: String,
}

impl ConnectionKey {
    /// Build a key.
    pub fn new(room_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            user_id: user_id.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.room_id, self.user_id)
    }
}

/// One connected peer.
///
/// Outbound frames go through a bounded queue drained by the socket writer
/// task, so sending never blocks the caller.
pub struct PeerConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Registry slot this connection occupies.
    pub key: ConnectionKey,
    tx: mpsc::Sender<Arc<str>>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the peer has shown activity since the last heartbeat check.
    pub is_alive: AtomicBool,
    dropped_messages: AtomicU64,
    close: CancellationToken,
}

impl PeerConnection {
    /// Create a connection feeding `tx`.
    pub fn new(key: ConnectionKey, tx: mpsc::Sender<Arc<str>>) -> Self {
        Self {
            id: ConnectionId::new(),
            key,
            tx,
            connected_at: Instant::now(),
            is_alive: AtomicBool::new(true),
            dropped_messages: AtomicU64::new(0),
            close: CancellationToken::new(),
        }
    }

    /// Create a connection together with the receiving end of its queue.
    pub fn channel(key: ConnectionKey, capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(key, tx), rx)
    }

    /// Room this connection belongs to.
    pub fn room_id(&self) -> &str {
        &self.key.room_id
    }

    /// Peer identity.
    pub fn user_id(&self) -> &str {
        &self.key.user_id
    }

    /// Enqueue a frame without waiting.
    ///
    /// A full queue increments the drop counter.
    pub fn send(&self, frame: Arc<str>) -> Result<(), DeliveryError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(DeliveryError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    /// Total frames dropped because the queue was full.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record inbound activity.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the peer was active since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Ask the owning session to end.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.close.cancelled().await;
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("dropped_messages", &self.drop_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_connection(capacity: usize) -> (PeerConnection, mpsc::Receiver<Arc<str>>) {
        PeerConnection::channel(ConnectionKey::new("r1", "alice"), capacity)
    }

    #[test]
    fn key_display_joins_room_and_user() {
        let key = ConnectionKey::new("r1", "alice");
        assert_eq!(key.to_string(), "r1:alice");
    }

    #[test]
    fn connection_ids_unique() {
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("conn_"));
    }

    #[test]
    fn accessors() {
        let (conn, _rx) = make_connection(4);
        assert_eq!(conn.room_id(), "r1");
        assert_eq!(conn.user_id(), "alice");
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn send_message_success() {
        let (conn, mut rx) = make_connection(4);
        assert!(conn.send(Arc::from("hello")).is_ok());
        let msg = rx.recv().await.unwrap();
        assert_eq!(&*msg, "hello");
    }

    #[test]
    fn send_to_closed_channel() {
        let (conn, rx) = make_connection(4);
        drop(rx);
        assert_eq!(conn.send(Arc::from("x")), Err(DeliveryError::Closed));
        assert_eq!(conn.drop_count(), 0);
    }

    #[test]
    fn send_to_full_channel_counts_drop() {
        let (conn, _rx) = make_connection(1);
        assert!(conn.send(Arc::from("one")).is_ok());
        assert_eq!(conn.send(Arc::from("two")), Err(DeliveryError::Full));
        assert_eq!(conn.send(Arc::from("three")), Err(DeliveryError::Full));
        assert_eq!(conn.drop_count(), 2);
    }

    #[test]
    fn mark_alive_and_check() {
        let (conn, _rx) = make_connection(1);
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
    }

    #[test]
    fn mark_alive_shared_across_threads() {
        let (conn, _rx) = make_connection(1);
        let conn = Arc::new(conn);
        let _ = conn.check_alive();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let conn = Arc::clone(&conn);
                std::thread::spawn(move || conn.mark_alive())
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
    }

    #[tokio::test]
    async fn close_resolves_closed_future() {
        let (conn, _rx) = make_connection(1);
        let conn = Arc::new(conn);
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.closed().await })
        };
        conn.close();
        waiter.await.unwrap();
        assert!(conn.is_closed());
    }

    #[test]
    fn age_increases() {
        let (conn, _rx) = make_connection(1);
        let first = conn.age();
        std::thread::sleep(Duration::from_millis(5));
        assert!(conn.age() > first);
    }
}
