//! Liveness monitoring for a peer connection.
//!
//! The socket writer sends a transport `Ping` every interval; anything the
//! peer sends back, `Pong` included, marks the connection alive. This monitor
//! only watches the flag.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

use super::connection::PeerConnection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The peer stayed silent for the whole timeout window.
    TimedOut,
    /// The monitor was stopped externally.
    Cancelled,
}

/// Consecutive silent intervals tolerated before a timeout (at least 1).
pub fn max_missed(interval: Duration, timeout: Duration) -> u32 {
    let interval_ms = interval.as_millis().max(1);
    let ratio = (timeout.as_millis() / interval_ms).max(1);
    u32::try_from(ratio).unwrap_or(u32::MAX)
}

/// Watch `connection` until it goes silent or `cancel` fires.
///
/// Each tick consumes the alive flag. A tick that finds it unset counts as a
/// miss; [`max_missed`] consecutive misses end the loop with
/// [`HeartbeatResult::TimedOut`].
pub async fn run_heartbeat(
    connection: Arc<PeerConnection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let limit = max_missed(interval, timeout);
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if connection.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= limit {
                        return HeartbeatResult::TimedOut;
                    }
                }
            }
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }
    }
}
