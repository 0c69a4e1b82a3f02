//! Launcher thread event loop.
//!
//! Flow:
//! 1. Start connecting to the helper; owner commands are accepted right away
//!    and their requests buffered in the channel
//! 2. Route decoded helper messages to worker handles by token
//! 3. On connection loss or a bad frame: fail every active process
//! 4. On Shutdown: fail what is still active, stop the helper, exit

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::bridge::codec::CodecError;
use crate::bridge::protocol::{HelperResponse, ProcessMode, StartRequest, Token};
use crate::cell::{FailureKind, TokenCell};
use crate::channel::Channel;
use crate::error::SpawnError;
use crate::registry::Registry;
use crate::spawner::{HelperConnection, HelperSpawner};

pub const SOCKET_CLOSED: &str = "Launcher socket closed unexpectedly.";
pub const INVALID_PACKET: &str = "Internal protocol error: invalid packet.";
pub const OVERSIZED_PACKET: &str = "Internal protocol error: packet too large.";
pub const LAUNCHER_SHUT_DOWN: &str = "Process launcher was shut down.";

/// Requests from owner threads to the launcher thread.
pub(crate) enum Command {
    Register {
        token: Token,
        mode: ProcessMode,
        cell: Arc<TokenCell>,
    },
    Unregister {
        token: Token,
    },
    Start {
        token: Token,
        request: StartRequest,
    },
    Write {
        token: Token,
        data: Vec<u8>,
    },
    Stop {
        token: Token,
    },
    Shutdown,
}

enum Event {
    Connected(Result<HelperConnection, SpawnError>),
    Message(Option<Result<HelperResponse, CodecError>>),
    Command(Option<Command>),
}

type Connecting = BoxFuture<'static, Result<HelperConnection, SpawnError>>;

pub(crate) struct Dispatcher {
    channel: Channel,
    registry: Registry,
    commands: mpsc::UnboundedReceiver<Command>,
    spawner: Arc<dyn HelperSpawner>,
    connect_timeout: Duration,
    shutdown_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        channel: Channel,
        commands: mpsc::UnboundedReceiver<Command>,
        spawner: Arc<dyn HelperSpawner>,
        connect_timeout: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            registry: Registry::new(),
            commands,
            spawner,
            connect_timeout,
            shutdown_timeout,
        }
    }

    pub async fn run(mut self) {
        self.channel.begin_connect();
        let mut connecting = Some(self.connect());

        loop {
            let event = tokio::select! {
                result = poll_connecting(&mut connecting) => Event::Connected(result),
                message = self.channel.recv() => Event::Message(message),
                command = self.commands.recv() => Event::Command(command),
            };

            match event {
                Event::Connected(Ok(connection)) => {
                    connecting = None;
                    tracing::info!("Helper connected");
                    self.channel.attach(connection);
                }
                Event::Connected(Err(e)) => {
                    connecting = None;
                    tracing::error!(error = %e, "Failed to connect to helper");
                    self.fail_channel(
                        FailureKind::Transport,
                        &format!("Failed to start process launcher: {e}"),
                    );
                }
                Event::Message(Some(Ok(message))) => self.route(message),
                Event::Message(Some(Err(e))) if e.is_protocol() => {
                    tracing::error!(error = %e, "Invalid frame from helper");
                    let description = match e {
                        CodecError::Oversized => OVERSIZED_PACKET,
                        _ => INVALID_PACKET,
                    };
                    self.fail_channel(FailureKind::Protocol, description);
                }
                Event::Message(Some(Err(e))) => {
                    tracing::error!(error = %e, "Helper socket error");
                    self.fail_channel(FailureKind::Transport, SOCKET_CLOSED);
                }
                Event::Message(None) => {
                    tracing::warn!("Helper closed connection (helper crashed?)");
                    self.fail_channel(FailureKind::Transport, SOCKET_CLOSED);
                }
                Event::Command(Some(Command::Shutdown)) => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                Event::Command(None) => {
                    tracing::debug!("All command senders dropped");
                    break;
                }
                Event::Command(Some(command)) => self.handle_command(command),
            }

            if let Err(e) = self.channel.flush().await {
                tracing::error!(error = %e, "Failed to write to helper");
                self.fail_channel(FailureKind::Transport, SOCKET_CLOSED);
            }
        }

        drop(connecting);
        // Later sends fail on the owner side; whatever is already queued is
        // applied so its handles get the shutdown failure below.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if !matches!(command, Command::Shutdown) {
                self.handle_command(command);
            }
        }
        self.registry
            .broadcast_failure(FailureKind::Transport, LAUNCHER_SHUT_DOWN);
        tracing::debug!(registered = self.registry.len(), "Clearing registry");
        self.registry.clear();
        self.channel.shutdown(self.shutdown_timeout).await;
        tracing::info!("Event loop exiting");
    }

    fn connect(&self) -> Connecting {
        let spawner = Arc::clone(&self.spawner);
        let timeout = self.connect_timeout;
        Box::pin(async move {
            match tokio::time::timeout(timeout, spawner.connect()).await {
                Ok(result) => result,
                Err(_) => Err(SpawnError::Timeout(timeout)),
            }
        })
    }

    fn route(&mut self, message: HelperResponse) {
        let token = message.token();
        match self.registry.get_mut(token) {
            Some(handle) => handle.on_message(&mut self.channel, message),
            None => tracing::trace!(%token, "Discarding message for unknown token"),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register { token, mode, cell } => {
                self.registry.register(token, mode, cell);
            }
            Command::Unregister { token } => {
                self.registry.unregister(token, &mut self.channel);
            }
            Command::Start { token, request } => match self.registry.get_mut(token) {
                Some(handle) => handle.submit_start(&mut self.channel, request),
                None => tracing::warn!(%token, "Start for unregistered token"),
            },
            Command::Write { token, data } => match self.registry.get_mut(token) {
                Some(handle) => handle.submit_write(&mut self.channel, data),
                None => tracing::warn!(%token, "Write for unregistered token"),
            },
            Command::Stop { token } => match self.registry.get_mut(token) {
                Some(handle) => handle.submit_stop(&mut self.channel),
                None => tracing::debug!(%token, "Stop for unregistered token"),
            },
            Command::Shutdown => {}
        }
    }

    /// Close the channel and fail every active process once.
    fn fail_channel(&mut self, kind: FailureKind, error: &str) {
        self.channel.close();
        self.registry.broadcast_failure(kind, error);
    }
}

async fn poll_connecting(
    connecting: &mut Option<Connecting>,
) -> Result<HelperConnection, SpawnError> {
    match connecting {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}
