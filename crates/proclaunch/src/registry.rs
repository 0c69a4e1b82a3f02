//! Token → WorkerHandle map, owned by the launcher thread.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use crate::bridge::protocol::{ProcessMode, Token};
use crate::cell::{FailureKind, TokenCell};
use crate::channel::Channel;
use crate::worker_handle::WorkerHandle;

#[derive(Default)]
pub(crate) struct Registry {
    handles: HashMap<Token, WorkerHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle for `token`. A live token is never replaced.
    pub fn register(&mut self, token: Token, mode: ProcessMode, owner: Arc<TokenCell>) -> bool {
        match self.handles.entry(token) {
            Entry::Occupied(_) => {
                tracing::error!(%token, "Token already registered, rejecting");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(WorkerHandle::new(token, mode, owner));
                tracing::trace!(%token, ?mode, "Registered token");
                true
            }
        }
    }

    /// Remove a handle and stop its process if still running.
    ///
    /// Unknown tokens are ignored; messages still in flight for the token are
    /// discarded on arrival.
    pub fn unregister(&mut self, token: Token, channel: &mut Channel) {
        let Some(mut handle) = self.handles.remove(&token) else {
            tracing::trace!(%token, "Unregister for unknown token");
            return;
        };
        handle.detach();
        if handle.is_active() {
            tracing::debug!(%token, lifecycle = ?handle.lifecycle(), "Owner dropped with process active, stopping");
            handle.submit_stop(channel);
        }
        tracing::trace!(%token, "Unregistered token");
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut WorkerHandle> {
        self.handles.get_mut(&token)
    }

    /// Synthesize a failure for every active token. Returns how many.
    pub fn broadcast_failure(&mut self, kind: FailureKind, error: &str) -> usize {
        let failed = self
            .handles
            .values_mut()
            .filter_map(|h| h.on_transport_failure(kind, error).then_some(h.token()))
            .inspect(|token| tracing::warn!(%token, ?kind, "Failing process: {}", error))
            .count();
        if failed > 0 {
            tracing::info!(failed, ?kind, "Broadcast failure to active processes");
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn clear(&mut self) {
        for handle in self.handles.values_mut() {
            handle.detach();
        }
        self.handles.clear();
    }
}
