//! The single duplex connection to the helper.
//!
//! Outgoing requests are buffered until the connection is ready and flushed
//! in FIFO order. Only the launcher thread touches a Channel.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::Child;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{CodecError, JsonCodec};
use crate::bridge::protocol::{HelperRequest, HelperResponse, Token};
use crate::spawner::HelperConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    NotConnected = 0,
    Connecting = 1,
    Ready = 2,
    /// Terminal.
    Closed = 3,
}

impl ConnectionState {
    pub(crate) fn load(shared: &AtomicU8) -> Self {
        match shared.load(Ordering::Acquire) {
            0 => Self::NotConnected,
            1 => Self::Connecting,
            2 => Self::Ready,
            _ => Self::Closed,
        }
    }
}

pub(crate) struct Channel {
    state: Arc<AtomicU8>,
    outgoing: VecDeque<HelperRequest>,
    writer: Option<FramedWrite<OwnedWriteHalf, JsonCodec<HelperRequest>>>,
    reader: Option<FramedRead<OwnedReadHalf, JsonCodec<HelperResponse>>>,
    child: Option<Child>,
}

impl Channel {
    pub fn new(state: Arc<AtomicU8>) -> Self {
        state.store(ConnectionState::NotConnected as u8, Ordering::Release);
        Self {
            state,
            outgoing: VecDeque::new(),
            writer: None,
            reader: None,
            child: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::load(&self.state)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn begin_connect(&mut self) {
        if self.state() == ConnectionState::NotConnected {
            self.set_state(ConnectionState::Connecting);
        }
    }

    /// Install a live connection. Buffered requests go out on the next flush.
    pub fn attach(&mut self, connection: HelperConnection) {
        if self.is_closed() {
            tracing::warn!("Ignoring helper connection on closed channel");
            return;
        }
        let (read_half, write_half) = connection.stream.into_split();
        self.reader = Some(FramedRead::new(read_half, JsonCodec::new()));
        self.writer = Some(FramedWrite::new(write_half, JsonCodec::new()));
        self.child = connection.child;
        self.set_state(ConnectionState::Ready);
        tracing::debug!(buffered = self.pending(), "Helper channel ready");
    }

    /// Queue a request. Returns false if the channel is closed.
    pub fn send(&mut self, request: HelperRequest) -> bool {
        if self.is_closed() {
            tracing::debug!(?request, "Dropping request on closed channel");
            return false;
        }
        self.outgoing.push_back(request);
        true
    }

    /// Remove a start request that has not been transmitted yet.
    pub fn retract_start(&mut self, token: Token) -> bool {
        let position = self.outgoing.iter().position(
            |r| matches!(r, HelperRequest::StartProcess { token: t, .. } if *t == token),
        );
        match position {
            Some(index) => {
                self.outgoing.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.outgoing.len()
    }

    /// Write all buffered requests. No-op until the connection is ready.
    pub async fn flush(&mut self) -> io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        if self.outgoing.is_empty() {
            return Ok(());
        }
        while let Some(request) = self.outgoing.pop_front() {
            writer.feed(request).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Next decoded message. Pending forever while not connected.
    pub async fn recv(&mut self) -> Option<Result<HelperResponse, CodecError>> {
        match self.reader.as_mut() {
            Some(reader) => reader.next().await,
            None => std::future::pending().await,
        }
    }

    /// Drop the connection for good. The helper, if we own it, is killed.
    pub fn close(&mut self) {
        self.set_state(ConnectionState::Closed);
        self.outgoing.clear();
        self.reader = None;
        self.writer = None;
        if let Some(child) = self.child.as_mut()
            && let Err(e) = child.start_kill()
        {
            tracing::debug!(error = %e, "Helper already gone");
        }
    }

    /// Ask the helper to shut down and wait for it, killing it on timeout.
    pub async fn shutdown(&mut self, timeout: Duration) {
        if self.state() == ConnectionState::Ready {
            self.outgoing.clear();
            self.outgoing.push_back(HelperRequest::Shutdown);
            if let Err(e) = self.flush().await {
                tracing::warn!(error = %e, "Failed to send shutdown to helper");
            }
        }
        self.outgoing.clear();
        self.writer = None;

        let reader = self.reader.take();
        let child = self.child.take();
        let graceful = tokio::time::timeout(timeout, async {
            if let Some(mut reader) = reader {
                while let Some(message) = reader.next().await {
                    if let Ok(message) = message {
                        tracing::trace!(?message, "Discarding message during shutdown");
                    }
                }
            }
            if let Some(mut child) = child {
                match child.wait().await {
                    Ok(status) => tracing::debug!(%status, "Helper exited"),
                    Err(e) => tracing::warn!(error = %e, "Failed to wait for helper"),
                }
            }
        })
        .await;

        if graceful.is_err() {
            // The timed-out future owned the child; kill_on_drop reaps it.
            tracing::warn!(?timeout, "Helper did not shut down in time, killed");
        }
        self.set_state(ConnectionState::Closed);
    }
}
