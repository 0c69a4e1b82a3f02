//! Strategies for bringing up the helper connection.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};

use crate::bridge::transport::HelperListener;
use crate::error::SpawnError;

pub const HELPER_BINARY: &str = "proclaunch-helper";

/// A connected helper. `child` is set when we own the helper process.
pub struct HelperConnection {
    pub stream: UnixStream,
    pub child: Option<Child>,
}

/// Extension point for different helper spawn strategies.
///
/// `connect` runs on the launcher thread's runtime, so anything it spawns
/// lives there too.
#[async_trait]
pub trait HelperSpawner: Send + Sync {
    async fn connect(&self) -> Result<HelperConnection, SpawnError>;
}

/// Runs the helper binary as a child process.
pub struct ProcessSpawner {
    program: PathBuf,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// The helper binary installed next to the current executable, falling
    /// back to a `PATH` lookup.
    pub fn sibling() -> Self {
        let program = std::env::current_exe()
            .ok()
            .map(|exe| exe.with_file_name(HELPER_BINARY))
            .filter(|path| path.exists())
            .unwrap_or_else(|| PathBuf::from(HELPER_BINARY));
        Self::new(program)
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

#[async_trait]
impl HelperSpawner for ProcessSpawner {
    async fn connect(&self) -> Result<HelperConnection, SpawnError> {
        let listener = HelperListener::bind()?;

        tracing::info!(program = %self.program.display(), address = %listener.address(), "Spawning helper process");
        let mut child = Command::new(&self.program)
            .arg(listener.address().to_arg())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::info!(target: "proclaunch::helper", "{}", line);
                }
            });
        }

        let stream = tokio::select! {
            accepted = listener.accept() => accepted?,
            status = child.wait() => {
                return Err(SpawnError::Other(match status {
                    Ok(status) => format!("helper exited before connecting: {status}"),
                    Err(e) => format!("helper exited before connecting: {e}"),
                }));
            }
        };

        tracing::debug!(pid = ?child.id(), "Helper connected");
        Ok(HelperConnection {
            stream,
            child: Some(child),
        })
    }
}

/// Serves the helper protocol on the launcher's own runtime over a socket
/// pair. Child processes are still real.
pub struct InProcessSpawner;

#[async_trait]
impl HelperSpawner for InProcessSpawner {
    async fn connect(&self) -> Result<HelperConnection, SpawnError> {
        let (ours, theirs) = UnixStream::pair()?;
        tokio::spawn(async move {
            if let Err(e) = crate::helper::serve(theirs).await {
                tracing::warn!(error = %e, "In-process helper exited with error");
            }
        });
        Ok(HelperConnection {
            stream: ours,
            child: None,
        })
    }
}
