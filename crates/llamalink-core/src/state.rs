//! Process-wide service state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of the embedded proxy server.
///
/// Exactly one instance exists per process, owned by the supervisor and
/// published over a watch channel. Transitions are serialized — the
/// supervisor never runs two at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// No server task exists.
    Stopped,
    /// A start command is binding the listener.
    Starting,
    /// The server is listening and handling requests.
    Running,
    /// A stop command is draining in-flight requests.
    Stopping,
    /// The last start attempt failed (e.g. port in use) or the server task
    /// exited without being cancelled. Requires a manual `start` retry.
    Failed,
}

impl ServiceState {
    /// Stable lowercase name, used in health payloads and status output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        }
    }

    /// Whether the server is accepting requests.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
