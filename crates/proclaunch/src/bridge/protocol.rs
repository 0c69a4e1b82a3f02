//! Wire protocol types for launcher-helper communication.
//!
//! One connection carries every process: each message names the token of the
//! process it belongs to.
//! - **Requests** (launcher → helper): StartProcess, WriteStdin, StopProcess, Shutdown
//! - **Responses** (helper → launcher): ErrorAck, StartedAck, StdoutChunk, StderrChunk, ExitNotice

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Routing key for one logical process instance.
///
/// Allocated from a process-wide counter so a token is never handed out twice
/// within one launcher process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(u64);

impl Token {
    pub fn next() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the child's standard input is handled after start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessMode {
    /// Stdin is closed right after the initial payload is written.
    #[default]
    Reader,
    /// Stdin stays open for streamed writes.
    Writer,
}

/// Everything the helper needs to start one process.
///
/// The program path must already be resolved; environment and working
/// directory are passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    pub program: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Full environment for the child. `None` inherits the helper's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub mode: ProcessMode,
    /// Written to stdin right after start.
    #[serde(default, with = "base64_bytes")]
    pub write_data: Vec<u8>,
    /// Connect stdin to this file instead of a pipe. Writes and the initial
    /// payload are then ignored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standard_input_file: Option<PathBuf>,
    /// Report stderr output as stdout.
    #[serde(default)]
    pub merge_channels: bool,
}

impl StartRequest {
    pub fn new<I, S>(program: impl Into<String>, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            arguments: arguments.into_iter().map(Into::into).collect(),
            environment: None,
            working_directory: None,
            mode: ProcessMode::default(),
            write_data: Vec::new(),
            standard_input_file: None,
            merge_channels: false,
        }
    }

    pub fn with_mode(mut self, mode: ProcessMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_write_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.write_data = data.into();
        self
    }

    pub fn with_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_standard_input_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.standard_input_file = Some(path.into());
        self
    }

    pub fn with_merged_channels(mut self, merge: bool) -> Self {
        self.merge_channels = merge;
        self
    }
}

/// Messages from launcher to helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperRequest {
    StartProcess {
        token: Token,
        request: StartRequest,
    },

    WriteStdin {
        token: Token,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// Kill the process; the helper answers with an ExitNotice if it was alive.
    StopProcess {
        token: Token,
    },

    /// Kill everything and close the connection.
    Shutdown,
}

impl HelperRequest {
    pub fn token(&self) -> Option<Token> {
        match self {
            Self::StartProcess { token, .. }
            | Self::WriteStdin { token, .. }
            | Self::StopProcess { token } => Some(*token),
            Self::Shutdown => None,
        }
    }
}

/// Messages from helper to launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperResponse {
    /// The process could not be started or failed at runtime.
    ErrorAck {
        token: Token,
        error: ProcessFault,
        message: String,
    },

    StartedAck {
        token: Token,
        pid: u32,
    },

    StdoutChunk {
        token: Token,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    StderrChunk {
        token: Token,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// Sent once, after all output of the process has been forwarded.
    ExitNotice {
        token: Token,
        exit_code: i32,
        exit_status: ExitStatus,
    },
}

impl HelperResponse {
    pub fn token(&self) -> Token {
        match self {
            Self::ErrorAck { token, .. }
            | Self::StartedAck { token, .. }
            | Self::StdoutChunk { token, .. }
            | Self::StderrChunk { token, .. }
            | Self::ExitNotice { token, .. } => *token,
        }
    }
}

/// Process-level error reported by the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessFault {
    FailedToStart,
    /// Waiting on the child failed after a successful start.
    Crashed,
    /// Reading the child's output failed; the child is killed.
    ReadFailed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    #[default]
    Normal,
    /// Killed by a signal or stopped on request.
    Crashed,
}

/// Byte payloads travel as base64 strings inside the JSON body.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
