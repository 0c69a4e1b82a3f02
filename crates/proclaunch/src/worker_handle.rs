//! Launcher-thread side of one process instance.
//!
//! Turns owner commands into helper requests and helper responses into
//! signal records on the owner's cell.

use std::sync::Arc;

use crate::bridge::codec::MAX_FRAME_LENGTH;
use crate::bridge::protocol::{
    HelperRequest, HelperResponse, ProcessFault, ProcessMode, StartRequest, Token,
};
use crate::cell::{FailureKind, ProcessState, SignalKind, SignalRecord, TokenCell};
use crate::channel::Channel;

pub const CANCELED_BEFORE_START: &str = "Process was canceled before it was started.";
pub const PAYLOAD_TOO_LARGE: &str = "Initial input for the process is too large.";

/// Stdin writes go out in frames of at most this many bytes.
const STDIN_CHUNK_SIZE: usize = 1024 * 1024;

/// The initial payload travels base64-encoded inside a single StartProcess
/// frame.
const MAX_START_PAYLOAD: usize = MAX_FRAME_LENGTH / 2;

/// Whether a record of kind `arrived` ends a wait for `awaited`.
///
/// Terminal kinds satisfy every wait: nothing else will ever arrive.
pub fn wake_for(awaited: SignalKind, arrived: SignalKind) -> bool {
    arrived == awaited || arrived.is_terminal()
}

pub(crate) struct WorkerHandle {
    token: Token,
    mode: ProcessMode,
    /// Back-reference to the owner's cell; cleared on unregister.
    owner: Option<Arc<TokenCell>>,
    lifecycle: ProcessState,
    terminal: bool,
    /// StartProcess queued or sent, StartedAck not yet seen.
    start_in_flight: bool,
    /// Stop requested while the start was in flight, or before it arrived.
    stop_pending: bool,
}

impl WorkerHandle {
    pub fn new(token: Token, mode: ProcessMode, owner: Arc<TokenCell>) -> Self {
        Self {
            token,
            mode,
            owner: Some(owner),
            lifecycle: ProcessState::NotRunning,
            terminal: false,
            start_in_flight: false,
            stop_pending: false,
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn lifecycle(&self) -> ProcessState {
        self.lifecycle
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Started and not yet finished.
    pub fn is_active(&self) -> bool {
        !self.terminal && self.lifecycle != ProcessState::NotRunning
    }

    pub fn submit_start(&mut self, channel: &mut Channel, mut request: StartRequest) {
        if self.terminal || self.lifecycle != ProcessState::NotRunning {
            tracing::warn!(token = %self.token, lifecycle = ?self.lifecycle, "Ignoring duplicate start");
            return;
        }
        self.lifecycle = ProcessState::Starting;

        if self.stop_pending {
            tracing::debug!(token = %self.token, "Stop arrived before start, not starting");
            self.deliver(SignalRecord::Failure {
                kind: FailureKind::StartFailure,
                error: CANCELED_BEFORE_START.to_string(),
            });
            return;
        }
        if request.write_data.len() > MAX_START_PAYLOAD {
            tracing::warn!(token = %self.token, bytes = request.write_data.len(), "Start payload too large");
            self.deliver(SignalRecord::Failure {
                kind: FailureKind::StartFailure,
                error: PAYLOAD_TOO_LARGE.to_string(),
            });
            return;
        }
        if channel.is_closed() {
            self.deliver(SignalRecord::Failure {
                kind: FailureKind::Transport,
                error: "Launcher socket is not connected.".to_string(),
            });
            return;
        }

        request.mode = self.mode;
        tracing::debug!(token = %self.token, program = %request.program, "Submitting start");
        self.start_in_flight = true;
        channel.send(HelperRequest::StartProcess {
            token: self.token,
            request,
        });
    }

    pub fn submit_write(&mut self, channel: &mut Channel, data: Vec<u8>) {
        if self.terminal || self.lifecycle != ProcessState::Running {
            tracing::debug!(token = %self.token, lifecycle = ?self.lifecycle, "Dropping write, process not running");
            return;
        }
        if self.mode != ProcessMode::Writer {
            tracing::warn!(token = %self.token, "Dropping write in reader mode");
            return;
        }
        if data.len() <= STDIN_CHUNK_SIZE {
            channel.send(HelperRequest::WriteStdin {
                token: self.token,
                data,
            });
            return;
        }
        for chunk in data.chunks(STDIN_CHUNK_SIZE) {
            channel.send(HelperRequest::WriteStdin {
                token: self.token,
                data: chunk.to_vec(),
            });
        }
    }

    pub fn submit_stop(&mut self, channel: &mut Channel) {
        if self.terminal {
            return;
        }
        match self.lifecycle {
            ProcessState::NotRunning => {
                tracing::debug!(token = %self.token, "Stop before start, remembering");
                self.stop_pending = true;
            }
            ProcessState::Canceling => {}
            ProcessState::Starting => {
                if self.start_in_flight && channel.retract_start(self.token) {
                    tracing::debug!(token = %self.token, "Start retracted before transmission");
                    self.start_in_flight = false;
                    self.deliver(SignalRecord::Failure {
                        kind: FailureKind::StartFailure,
                        error: CANCELED_BEFORE_START.to_string(),
                    });
                } else {
                    tracing::debug!(token = %self.token, "Start in flight, deferring stop");
                    self.stop_pending = true;
                    self.lifecycle = ProcessState::Canceling;
                }
            }
            ProcessState::Running => {
                self.lifecycle = ProcessState::Canceling;
                channel.send(HelperRequest::StopProcess { token: self.token });
            }
        }
    }

    pub fn on_message(&mut self, channel: &mut Channel, message: HelperResponse) {
        if self.is_terminal() {
            tracing::trace!(token = %self.token, ?message, "Discarding message after terminal");
            return;
        }

        let record = match message {
            HelperResponse::StartedAck { pid, .. } => {
                self.start_in_flight = false;
                if self.stop_pending {
                    self.stop_pending = false;
                    tracing::debug!(token = %self.token, pid, "Sending deferred stop");
                    channel.send(HelperRequest::StopProcess { token: self.token });
                } else if self.lifecycle == ProcessState::Starting {
                    self.lifecycle = ProcessState::Running;
                }
                SignalRecord::Started { pid }
            }
            HelperResponse::StdoutChunk { data, .. } => SignalRecord::DataAvailable {
                stdout: data,
                stderr: Vec::new(),
            },
            HelperResponse::StderrChunk { data, .. } => SignalRecord::DataAvailable {
                stdout: Vec::new(),
                stderr: data,
            },
            HelperResponse::ExitNotice {
                exit_code,
                exit_status,
                ..
            } => SignalRecord::Completed {
                exit_code,
                exit_status,
            },
            HelperResponse::ErrorAck { error, message, .. } => SignalRecord::Failure {
                kind: match error {
                    ProcessFault::FailedToStart => FailureKind::StartFailure,
                    ProcessFault::Crashed | ProcessFault::ReadFailed => FailureKind::Runtime,
                },
                error: message,
            },
        };
        self.deliver(record);
    }

    /// The connection is gone. Active processes get one synthesized failure.
    /// Returns whether a record was produced.
    pub fn on_transport_failure(&mut self, kind: FailureKind, error: &str) -> bool {
        if !self.is_active() {
            return false;
        }
        self.deliver(SignalRecord::Failure {
            kind,
            error: error.to_string(),
        });
        true
    }

    /// Clear the back-reference so nothing more reaches the owner.
    pub fn detach(&mut self) {
        self.owner = None;
    }

    fn deliver(&mut self, record: SignalRecord) {
        if record.is_terminal() {
            self.terminal = true;
            self.lifecycle = ProcessState::NotRunning;
            self.start_in_flight = false;
            self.stop_pending = false;
        }
        if let Some(owner) = &self.owner {
            owner.deliver(record);
        }
    }
}
