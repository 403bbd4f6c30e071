//! Per-connection session: registration, inbound dispatch, teardown.
//!
//! A session moves `Connecting → Open → Closed`. It joins the registry once
//! the upgrade completes, then reads frames until the transport closes, the
//! peer goes silent, the registry evicts it, the server shuts down, or (under
//! the `close` policy) the peer sends something unparseable. Whatever the
//! reason, dropping the [`Session`] removes its registry slot exactly once.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use sigrelay_settings::MalformedPolicy;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::connection::{ConnectionKey, PeerConnection};
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::config::ServerConfig;
use crate::metrics::{
    SIGNAL_MALFORMED_TOTAL, SIGNAL_MESSAGES_TOTAL, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL,
};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::registry::RoomRegistry;

/// How long the writer gets to flush a close frame after the session ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Upgrade accepted, not yet registered.
    Connecting,
    /// Registered and relaying.
    Open,
    /// Finished; the registry slot has been released.
    Closed,
}

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed the socket.
    TransportClosed,
    /// The socket failed (reset, oversized frame, write error).
    TransportError,
    /// The peer sent an unparseable message under the `close` policy.
    Malformed,
    /// The peer stopped answering heartbeats.
    HeartbeatTimeout,
    /// The registry gave up delivering to this peer.
    Evicted,
    /// The server is shutting down.
    ServerShutdown,
}

impl SessionEnd {
    /// Metric label.
    pub fn as_label(self) -> &'static str {
        match self {
            Self::TransportClosed => "transport_closed",
            Self::TransportError => "transport_error",
            Self::Malformed => "malformed",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Evicted => "evicted",
            Self::ServerShutdown => "server_shutdown",
        }
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// What the read loop should do after one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// Stop with the given reason.
    End(SessionEnd),
}

/// One peer's registration plus its inbound dispatch rules.
///
/// Dropping a session releases its registry slot (only if it still owns it)
/// and cancels the connection's close token, which stops the writer.
pub struct Session {
    registry: Arc<RoomRegistry>,
    connection: Arc<PeerConnection>,
    policy: MalformedPolicy,
    state: SessionState,
}

impl Session {
    /// Prepare a session for `key`. Nothing is registered until [`open`](Self::open).
    pub fn connect(
        registry: Arc<RoomRegistry>,
        key: ConnectionKey,
        config: &ServerConfig,
    ) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (connection, rx) = PeerConnection::channel(key, config.send_queue_capacity.max(1));
        let session = Self {
            registry,
            connection: Arc::new(connection),
            policy: config.malformed_policy,
            state: SessionState::Connecting,
        };
        (session, rx)
    }

    /// Join the room and announce this peer to its members.
    pub fn open(&mut self) {
        if self.state != SessionState::Connecting {
            return;
        }
        let _ = self.registry.join(Arc::clone(&self.connection));
        self.state = SessionState::Open;
        counter!(WS_CONNECTIONS_TOTAL).increment(1);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The connection this session owns.
    pub fn connection(&self) -> &Arc<PeerConnection> {
        &self.connection
    }

    /// Handle one inbound WebSocket frame.
    pub fn handle_frame(&self, frame: Message) -> Flow {
        self.connection.mark_alive();
        match frame {
            Message::Text(text) => self.handle_text(text.as_str()),
            Message::Binary(_) => self.reject(&ProtocolError::Binary),
            Message::Ping(_) | Message::Pong(_) => Flow::Continue,
            Message::Close(_) => Flow::End(SessionEnd::TransportClosed),
        }
    }

    /// Parse and dispatch one text frame.
    pub fn handle_text(&self, text: &str) -> Flow {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(err) => return self.reject(&err),
        };
        counter!(SIGNAL_MESSAGES_TOTAL, "type" => message.metric_label()).increment(1);

        match message {
            ClientMessage::Ping => {
                let _ = self.registry.unicast(&self.connection, &ServerMessage::Pong);
            }
            ClientMessage::Unknown(kind) => {
                debug!(message_type = %kind, "ignoring unrecognized message type");
            }
            relayed => {
                let kind = relayed.metric_label();
                if let Some(outbound) = relayed.into_relay(self.connection.user_id()) {
                    let report = self.registry.broadcast(
                        self.connection.room_id(),
                        &outbound,
                        Some(self.connection.user_id()),
                    );
                    trace!(message_type = kind, delivered = report.delivered, "relayed");
                }
            }
        }
        Flow::Continue
    }

    fn reject(&self, err: &ProtocolError) -> Flow {
        counter!(SIGNAL_MALFORMED_TOTAL).increment(1);
        match self.policy {
            MalformedPolicy::Close => {
                warn!(conn_id = %self.connection.id, error = %err, "malformed message, closing session");
                Flow::End(SessionEnd::Malformed)
            }
            MalformedPolicy::Ignore => {
                debug!(conn_id = %self.connection.id, error = %err, "dropping malformed message");
                Flow::Continue
            }
        }
    }

    /// Finish the session, recording why.
    pub fn close(mut self, reason: SessionEnd) {
        self.release();
        counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_label()).increment(1);
        info!(
            conn_id = %self.connection.id,
            reason = %reason,
            duration_secs = self.connection.age().as_secs(),
            "session ended"
        );
    }

    fn release(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.connection.close();
        let _ = self.registry.leave_connection(&self.connection);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

/// Drive one upgraded socket until the session ends.
#[instrument(skip_all, fields(room_id = %key.room_id, user_id = %key.user_id))]
pub async fn run_session(
    socket: WebSocket,
    key: ConnectionKey,
    registry: Arc<RoomRegistry>,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
) -> SessionEnd {
    let (mut session, rx) = Session::connect(registry, key, &config);
    let connection = Arc::clone(session.connection());
    let (sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(write_loop(
        sink,
        rx,
        Arc::clone(&connection),
        config.heartbeat_interval(),
    ));
    let mut writer_done = false;

    session.open();

    let heartbeat = run_heartbeat(
        Arc::clone(&connection),
        config.heartbeat_interval(),
        config.heartbeat_timeout(),
        shutdown.child_token(),
    );
    tokio::pin!(heartbeat);

    let reason = loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break SessionEnd::ServerShutdown,
            () = connection.closed() => break SessionEnd::Evicted,
            result = &mut heartbeat => break match result {
                HeartbeatResult::TimedOut => SessionEnd::HeartbeatTimeout,
                HeartbeatResult::Cancelled => SessionEnd::ServerShutdown,
            },
            _ = &mut writer => {
                writer_done = true;
                break SessionEnd::TransportError;
            }
            frame = stream.next() => match frame {
                Some(Ok(frame)) => {
                    if let Flow::End(reason) = session.handle_frame(frame) {
                        break reason;
                    }
                }
                Some(Err(err)) => {
                    debug!(error = %err, "websocket read failed");
                    break SessionEnd::TransportError;
                }
                None => break SessionEnd::TransportClosed,
            },
        }
    };

    session.close(reason);

    if !writer_done {
        let abort = writer.abort_handle();
        if time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
            abort.abort();
        }
    }
    reason
}

/// Forward queued frames to the socket and ping on every heartbeat interval.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Arc<str>>,
    connection: Arc<PeerConnection>,
    ping_every: Duration,
) {
    let mut ping = time::interval_at(time::Instant::now() + ping_every, ping_every);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(err) = sink.send(Message::Text(frame.to_string().into())).await {
                    debug!(conn_id = %connection.id, error = %err, "websocket write failed");
                    return;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    return;
                }
                trace!(conn_id = %connection.id, "sent ping");
            }
            () = connection.closed() => break,
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn config(policy: MalformedPolicy) -> ServerConfig {
        ServerConfig {
            malformed_policy: policy,
            ..ServerConfig::default()
        }
    }

    fn open_session(
        registry: &Arc<RoomRegistry>,
        room: &str,
        user: &str,
    ) -> (Session, mpsc::Receiver<Arc<str>>) {
        open_with(registry, room, user, MalformedPolicy::Close)
    }

    fn open_with(
        registry: &Arc<RoomRegistry>,
        room: &str,
        user: &str,
        policy: MalformedPolicy,
    ) -> (Session, mpsc::Receiver<Arc<str>>) {
        let (mut session, rx) = Session::connect(
            Arc::clone(registry),
            ConnectionKey::new(room, user),
            &config(policy),
        );
        session.open();
        (session, rx)
    }

    fn next_json(rx: &mut mpsc::Receiver<Arc<str>>) -> Value {
        serde_json::from_str(&rx.try_recv().expect("expected a frame")).unwrap()
    }

    #[test]
    fn lifecycle_states() {
        let registry = Arc::new(RoomRegistry::new());
        let (mut session, _rx) = Session::connect(
            Arc::clone(&registry),
            ConnectionKey::new("r1", "A"),
            &ServerConfig::default(),
        );
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(registry.connection_count(), 0);

        session.open();
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(registry.members("r1"), vec!["A"]);

        let connection = Arc::clone(session.connection());
        session.close(SessionEnd::TransportClosed);
        assert_eq!(registry.connection_count(), 0);
        assert!(connection.is_closed());
    }

    #[test]
    fn dropping_session_releases_slot() {
        let registry = Arc::new(RoomRegistry::new());
        let (session, _rx) = open_session(&registry, "r1", "A");
        drop(session);
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn stale_session_does_not_evict_reconnect() {
        let registry = Arc::new(RoomRegistry::new());
        let (old, _rx_old) = open_session(&registry, "r1", "A");
        let (new, _rx_new) = open_session(&registry, "r1", "A");

        old.close(SessionEnd::TransportClosed);
        let holder = registry.connection("r1", "A").unwrap();
        assert_eq!(holder.id, new.connection().id);
    }

    #[test]
    fn offer_relayed_to_room_excluding_sender() {
        let registry = Arc::new(RoomRegistry::new());
        let (_a, mut rx_a) = open_session(&registry, "r1", "A");
        let (b, mut rx_b) = open_session(&registry, "r1", "B");
        assert_eq!(next_json(&mut rx_a), json!({"type": "peer-joined", "userId": "B"}));

        let flow = b.handle_text(r#"{"type":"offer","sdp":"X"}"#);
        assert_eq!(flow, Flow::Continue);
        assert_eq!(next_json(&mut rx_a), json!({"type": "offer", "from": "B", "sdp": "X"}));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn answer_and_candidate_relayed() {
        let registry = Arc::new(RoomRegistry::new());
        let (a, mut rx_a) = open_session(&registry, "r1", "A");
        let (_b, mut rx_b) = open_session(&registry, "r1", "B");
        let _ = rx_a.try_recv();

        let _ = a.handle_text(r#"{"type":"answer","sdp":{"sdp":"v=0"}}"#);
        let _ = a.handle_text(r#"{"type":"ice-candidate","candidate":{"candidate":"c1"}}"#);
        assert_eq!(
            next_json(&mut rx_b),
            json!({"type": "answer", "from": "A", "sdp": {"sdp": "v=0"}})
        );
        assert_eq!(
            next_json(&mut rx_b),
            json!({"type": "ice-candidate", "from": "A", "candidate": {"candidate": "c1"}})
        );
    }

    #[test]
    fn ping_answered_only_to_sender() {
        let registry = Arc::new(RoomRegistry::new());
        let (a, mut rx_a) = open_session(&registry, "r1", "A");
        let (_b, mut rx_b) = open_session(&registry, "r1", "B");
        let _ = rx_a.try_recv();

        assert_eq!(a.handle_text(r#"{"type":"ping"}"#), Flow::Continue);
        assert_eq!(next_json(&mut rx_a), json!({"type": "pong"}));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn unknown_type_ignored() {
        let registry = Arc::new(RoomRegistry::new());
        let (a, _rx_a) = open_session(&registry, "r1", "A");
        let (_b, mut rx_b) = open_session(&registry, "r1", "B");

        assert_eq!(a.handle_text(r#"{"type":"bye"}"#), Flow::Continue);
        assert!(rx_b.try_recv().is_err());
        assert_eq!(a.state(), SessionState::Open);
    }

    #[test]
    fn non_string_type_keeps_session_open() {
        let registry = Arc::new(RoomRegistry::new());
        let (a, _rx_a) = open_session(&registry, "r1", "A");
        let (_b, mut rx_b) = open_session(&registry, "r1", "B");

        for odd in [r#"{"type":7}"#, r#"{"type":null,"sdp":"x"}"#] {
            assert_eq!(a.handle_text(odd), Flow::Continue, "{odd}");
        }
        assert!(rx_b.try_recv().is_err());
        assert_eq!(a.state(), SessionState::Open);
        assert_eq!(registry.members("r1"), vec!["A", "B"]);
    }

    #[test]
    fn malformed_closes_under_close_policy() {
        let registry = Arc::new(RoomRegistry::new());
        let (a, _rx) = open_session(&registry, "r1", "A");
        for bad in ["not json", "42", r#"{"sdp":"x"}"#, r#"{"type":"offer"}"#] {
            assert_eq!(a.handle_text(bad), Flow::End(SessionEnd::Malformed), "{bad}");
        }
    }

    #[test]
    fn malformed_skipped_under_ignore_policy() {
        let registry = Arc::new(RoomRegistry::new());
        let (a, _rx_a) = open_with(&registry, "r1", "A", MalformedPolicy::Ignore);
        let (_b, mut rx_b) = open_session(&registry, "r1", "B");

        assert_eq!(a.handle_text("{broken"), Flow::Continue);
        assert_eq!(a.handle_text(r#"{"type":"offer","sdp":"ok"}"#), Flow::Continue);
        assert_eq!(next_json(&mut rx_b)["sdp"], "ok");
    }

    #[test]
    fn frame_kinds() {
        let registry = Arc::new(RoomRegistry::new());
        let (a, _rx) = open_session(&registry, "r1", "A");

        assert_eq!(a.handle_frame(Message::Ping(Bytes::new())), Flow::Continue);
        assert_eq!(a.handle_frame(Message::Pong(Bytes::new())), Flow::Continue);
        assert_eq!(
            a.handle_frame(Message::Binary(Bytes::from_static(b"\x00\x01"))),
            Flow::End(SessionEnd::Malformed)
        );
        assert_eq!(
            a.handle_frame(Message::Close(None)),
            Flow::End(SessionEnd::TransportClosed)
        );
    }

    #[test]
    fn inbound_frame_marks_alive() {
        let registry = Arc::new(RoomRegistry::new());
        let (a, _rx) = open_session(&registry, "r1", "A");
        let _ = a.connection().check_alive();
        assert!(!a.connection().check_alive());

        let _ = a.handle_frame(Message::Pong(Bytes::new()));
        assert!(a.connection().check_alive());
    }

    #[test]
    fn end_reason_labels() {
        assert_eq!(SessionEnd::HeartbeatTimeout.as_label(), "heartbeat_timeout");
        assert_eq!(SessionEnd::ServerShutdown.to_string(), "server_shutdown");
    }
}
