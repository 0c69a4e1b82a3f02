//! Owner-side proxy for one process instance.
//!
//! Every method takes `&self` and never blocks, except `wait_for`. Outcomes
//! of `start`, `write` and `cancel` are observed through signal records and
//! the cached snapshot.

use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use tokio::sync::{Notify, mpsc};

use crate::bridge::protocol::{ExitStatus, ProcessMode, StartRequest, Token};
use crate::cell::{
    FailureKind, ProcessSnapshot, ProcessState, SignalKind, SignalRecord, TokenCell,
};
use crate::dispatcher::Command;
use crate::error::UsageError;

pub const LAUNCHER_NOT_RUNNING: &str = "Process launcher is not running.";

pub struct OwnerHandle {
    token: Token,
    mode: ProcessMode,
    cell: Arc<TokenCell>,
    commands: mpsc::UnboundedSender<Command>,
    worker_thread: ThreadId,
}

impl OwnerHandle {
    pub(crate) fn new(
        token: Token,
        mode: ProcessMode,
        cell: Arc<TokenCell>,
        commands: mpsc::UnboundedSender<Command>,
        worker_thread: ThreadId,
    ) -> Self {
        Self {
            token,
            mode,
            cell,
            commands,
            worker_thread,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn mode(&self) -> ProcessMode {
        self.mode
    }

    /// Start `program` with `arguments`, writing `stdin_payload` right after.
    pub fn start<I, S>(
        &self,
        program: impl Into<String>,
        arguments: I,
        stdin_payload: &[u8],
    ) -> Result<(), UsageError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.start_with(StartRequest::new(program, arguments).with_write_data(stdin_payload))
    }

    /// Start from a full request. The handle's mode overrides the request's.
    pub fn start_with(&self, mut request: StartRequest) -> Result<(), UsageError> {
        request.mode = self.mode;
        // Start is queued under the cell lock so a concurrent cancel that
        // observes Starting always queues its Stop behind it.
        let sent = {
            let mut state = self.cell.lock();
            if state.canceled {
                return Err(UsageError::Canceled);
            }
            if state.start_requested || state.snapshot.state != ProcessState::NotRunning {
                return Err(UsageError::AlreadyStarted);
            }
            state.start_requested = true;
            state.snapshot.state = ProcessState::Starting;

            tracing::debug!(token = %self.token, program = %request.program, "Requesting start");
            self.commands.send(Command::Start {
                token: self.token,
                request,
            })
        };
        if sent.is_err() {
            self.cell.deliver(SignalRecord::Failure {
                kind: FailureKind::Transport,
                error: LAUNCHER_NOT_RUNNING.to_string(),
            });
        }
        Ok(())
    }

    /// Queue bytes for the process's stdin. Returns how many were accepted.
    pub fn write(&self, data: &[u8]) -> Result<usize, UsageError> {
        if self.mode != ProcessMode::Writer {
            return Err(UsageError::NotWriter);
        }
        if self.cell.lock().snapshot.state != ProcessState::Running {
            return Err(UsageError::NotRunning);
        }
        if self
            .commands
            .send(Command::Write {
                token: self.token,
                data: data.to_vec(),
            })
            .is_err()
        {
            return Err(UsageError::NotRunning);
        }
        Ok(data.len())
    }

    /// Stop caring about the process. Idempotent, never blocks.
    ///
    /// Any pending or later `wait_for` returns false. A starting or running
    /// process is asked to stop and still produces one terminal record.
    pub fn cancel(&self) {
        let stop = {
            let mut state = self.cell.lock();
            if state.canceled {
                return;
            }
            state.canceled = true;
            let active = matches!(
                state.snapshot.state,
                ProcessState::Starting | ProcessState::Running
            );
            if active {
                state.snapshot.state = ProcessState::Canceling;
            }
            active
        };
        self.cell.condvar().notify_all();

        if stop {
            tracing::debug!(token = %self.token, "Canceling process");
            let _ = self.commands.send(Command::Stop { token: self.token });
        }
    }

    /// Block until a record of `kind` (or a terminal record) is available, the
    /// handle is canceled, or `timeout` passes.
    ///
    /// Must not be called on the launcher thread.
    pub fn wait_for(&self, kind: SignalKind, timeout: Duration) -> Result<bool, UsageError> {
        if std::thread::current().id() == self.worker_thread {
            tracing::error!(token = %self.token, "wait_for called on the launcher thread");
            return Err(UsageError::WorkerThread);
        }
        if kind == SignalKind::None {
            return Err(UsageError::NoSignal);
        }

        let deadline = Instant::now() + timeout;
        let mut state = self.cell.lock();
        if state.waiting_for != SignalKind::None {
            return Err(UsageError::ConcurrentWait);
        }

        loop {
            if state.canceled {
                return Ok(false);
            }
            if state.satisfies(kind) {
                return Ok(true);
            }
            if state.snapshot.state == ProcessState::NotRunning {
                return Ok(false);
            }
            if kind == SignalKind::Started && state.snapshot.state != ProcessState::Starting {
                return Ok(false);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }

            state.waiting_for = kind;
            state = match self.cell.condvar().wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => {
                    tracing::error!(token = %self.token, "Token cell mutex poisoned during wait");
                    poisoned.into_inner().0
                }
            };
            state.waiting_for = SignalKind::None;
        }
    }

    /// Take every queued record, in arrival order.
    pub fn drain(&self) -> Vec<SignalRecord> {
        self.cell.lock().queue.drain(..).collect()
    }

    /// Poked after every delivered record, for owners on an async runtime.
    pub fn signals(&self) -> Arc<Notify> {
        self.cell.signals()
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        self.cell.lock().snapshot.clone()
    }

    pub fn state(&self) -> ProcessState {
        self.cell.lock().snapshot.state
    }

    pub fn exit_code(&self) -> i32 {
        self.cell.lock().snapshot.exit_code
    }

    pub fn exit_status(&self) -> ExitStatus {
        self.cell.lock().snapshot.exit_status
    }

    pub fn last_error(&self) -> Option<String> {
        self.cell.lock().snapshot.error.clone()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.cell.lock().snapshot.failure_kind
    }

    pub fn pid(&self) -> Option<u32> {
        self.cell.lock().snapshot.pid
    }

    pub fn is_terminal(&self) -> bool {
        self.cell.lock().snapshot.terminal
    }

    /// Take all stdout received so far.
    pub fn read_all_stdout(&self) -> Vec<u8> {
        std::mem::take(&mut self.cell.lock().snapshot.stdout)
    }

    /// Take all stderr received so far.
    pub fn read_all_stderr(&self) -> Vec<u8> {
        std::mem::take(&mut self.cell.lock().snapshot.stderr)
    }
}

impl std::fmt::Debug for OwnerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerHandle")
            .field("token", &self.token)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for OwnerHandle {
    fn drop(&mut self) {
        self.cell.detach();
        self.cell.condvar().notify_all();
        let _ = self.commands.send(Command::Unregister { token: self.token });
    }
}
