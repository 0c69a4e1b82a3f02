//! Per-token state shared between an owner handle and its worker handle.
//!
//! Everything that crosses the thread boundary for one process lives behind a
//! single mutex. The worker side appends records and wakes the condvar; the
//! owner side reads, drains and parks on it.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::bridge::protocol::{ExitStatus, Token};
use crate::worker_handle::wake_for;

/// Exit code reported when a process never got to run.
pub const FAILED_TO_START_EXIT_CODE: i32 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Sentinel; never queued.
    None,
    Failure,
    Started,
    DataAvailable,
    Completed,
}

impl SignalKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failure | Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The helper is unreachable or the connection was lost.
    Transport,
    /// A malformed or unrecognized message arrived.
    Protocol,
    StartFailure,
    Runtime,
}

/// One received event, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalRecord {
    Failure { kind: FailureKind, error: String },
    Started { pid: u32 },
    DataAvailable { stdout: Vec<u8>, stderr: Vec<u8> },
    Completed { exit_code: i32, exit_status: ExitStatus },
}

impl SignalRecord {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Failure { .. } => SignalKind::Failure,
            Self::Started { .. } => SignalKind::Started,
            Self::DataAvailable { .. } => SignalKind::DataAvailable,
            Self::Completed { .. } => SignalKind::Completed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProcessState {
    #[default]
    NotRunning,
    Starting,
    Running,
    Canceling,
}

/// Owner-visible cached state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub exit_code: i32,
    pub exit_status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub terminal: bool,
}

impl ProcessSnapshot {
    pub(crate) fn apply(&mut self, record: &SignalRecord) {
        match record {
            SignalRecord::Started { pid } => {
                self.pid = Some(*pid);
                if self.state != ProcessState::Canceling {
                    self.state = ProcessState::Running;
                }
            }
            SignalRecord::DataAvailable { stdout, stderr } => {
                self.stdout.extend_from_slice(stdout);
                self.stderr.extend_from_slice(stderr);
            }
            SignalRecord::Completed {
                exit_code,
                exit_status,
            } => {
                self.exit_code = *exit_code;
                self.exit_status = *exit_status;
                self.finish();
            }
            SignalRecord::Failure { kind, error } => {
                if *kind == FailureKind::StartFailure {
                    self.exit_code = FAILED_TO_START_EXIT_CODE;
                }
                self.error = Some(error.clone());
                self.failure_kind = Some(*kind);
                self.finish();
            }
        }
    }

    fn finish(&mut self) {
        self.state = ProcessState::NotRunning;
        self.terminal = true;
    }
}

pub(crate) struct CellState {
    pub queue: VecDeque<SignalRecord>,
    pub snapshot: ProcessSnapshot,
    /// Kind a blocked `wait_for` is parked on, `None` when nobody waits.
    pub waiting_for: SignalKind,
    pub canceled: bool,
    pub start_requested: bool,
    /// Set when the owner handle is dropped; nothing is delivered afterwards.
    pub detached: bool,
}

impl CellState {
    fn push(&mut self, record: SignalRecord) {
        if let SignalRecord::DataAvailable { stdout, stderr } = &record
            && let Some(SignalRecord::DataAvailable {
                stdout: queued_out,
                stderr: queued_err,
            }) = self.queue.back_mut()
        {
            queued_out.extend_from_slice(stdout);
            queued_err.extend_from_slice(stderr);
            return;
        }
        self.queue.push_back(record);
    }

    /// Whether a queued record (or the terminal snapshot) satisfies a wait.
    pub fn satisfies(&self, kind: SignalKind) -> bool {
        if self.snapshot.terminal {
            return true;
        }
        if kind == SignalKind::Started && self.snapshot.pid.is_some() {
            return true;
        }
        self.queue.iter().any(|r| r.kind() == kind)
    }
}

pub(crate) struct TokenCell {
    token: Token,
    state: Mutex<CellState>,
    wake: Condvar,
    signals: Arc<Notify>,
}

impl TokenCell {
    pub fn new(token: Token) -> Arc<Self> {
        Arc::new(Self {
            token,
            state: Mutex::new(CellState {
                queue: VecDeque::new(),
                snapshot: ProcessSnapshot::default(),
                waiting_for: SignalKind::None,
                canceled: false,
                start_requested: false,
                detached: false,
            }),
            wake: Condvar::new(),
            signals: Arc::new(Notify::new()),
        })
    }

    /// Lock the shared state. A poisoned lock is recovered: the data is plain
    /// bookkeeping and stays consistent between statements.
    pub fn lock(&self) -> MutexGuard<'_, CellState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(token = %self.token, "Token cell mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn condvar(&self) -> &Condvar {
        &self.wake
    }

    pub fn signals(&self) -> Arc<Notify> {
        Arc::clone(&self.signals)
    }

    /// Append a record and wake the owner if its wait is satisfied.
    ///
    /// Returns false when the record was discarded because the owner is gone
    /// or a terminal record was already delivered.
    pub fn deliver(&self, record: SignalRecord) -> bool {
        let kind = record.kind();
        let wake = {
            let mut state = self.lock();
            if state.detached {
                tracing::trace!(token = %self.token, ?kind, "Discarding record for detached owner");
                return false;
            }
            if state.snapshot.terminal {
                tracing::debug!(token = %self.token, ?kind, "Discarding record after terminal");
                return false;
            }
            state.snapshot.apply(&record);
            state.push(record);
            state.waiting_for != SignalKind::None && wake_for(state.waiting_for, kind)
        };

        if wake {
            self.wake.notify_all();
        }
        self.signals.notify_one();
        true
    }

    /// Mark the owner gone. Returns whether it was attached.
    pub fn detach(&self) -> bool {
        let mut state = self.lock();
        !std::mem::replace(&mut state.detached, true)
    }
}
