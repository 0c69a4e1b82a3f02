//! Error types surfaced synchronously to callers.
//!
//! Process-level failures never show up here; they arrive as `Failure`
//! signal records on the owning handle.

use std::time::Duration;

/// Local contract violation, reported at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    #[error("process was already started")]
    AlreadyStarted,
    #[error("process was canceled")]
    Canceled,
    #[error("process is not running")]
    NotRunning,
    #[error("process was not opened for writing")]
    NotWriter,
    #[error("cannot block the launcher thread")]
    WorkerThread,
    #[error("another wait is already in progress on this handle")]
    ConcurrentWait,
    #[error("cannot wait for an empty signal")]
    NoSignal,
}

/// Bringing up the helper connection failed.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn helper: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("helper did not connect within {0:?}")]
    Timeout(Duration),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Constructing the launcher failed.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to build launcher runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("failed to spawn launcher thread: {0}")]
    Thread(#[source] std::io::Error),
}
