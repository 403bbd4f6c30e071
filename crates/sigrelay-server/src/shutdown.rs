//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Default time allowed for sessions and server tasks to finish.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Signals shutdown to the listener and every open session, then waits for
/// them to drain.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    sessions: TaskTracker,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            sessions: TaskTracker::new(),
        }
    }

    /// A clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Tracker that session tasks register with so shutdown can wait on them.
    pub fn sessions(&self) -> &TaskTracker {
        &self.sessions
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel everything and wait up to `timeout` for `handles` and all
    /// tracked sessions to finish.
    pub async fn graceful_shutdown(&self, handles: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        let _ = self.sessions.close();
        info!(
            task_count = handles.len(),
            open_sessions = self.sessions.len(),
            timeout_secs = timeout.as_secs(),
            "waiting for tasks to complete"
        );

        let drain = async {
            let _ = futures::future::join_all(handles).await;
            self.sessions.wait().await;
        };

        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!(
                open_sessions = self.sessions.len(),
                "shutdown timed out after {timeout:?}, some tasks may still be running"
            );
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
