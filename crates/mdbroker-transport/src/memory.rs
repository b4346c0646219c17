//! In-memory transport
//!
//! Clones share state, so a test can keep one handle while the broker owns
//! another: push inbound messages on one side, inspect sent messages on the
//! other.

use async_trait::async_trait;
use mdbroker_core::{BrokerError, BrokerResult, Multipart, PeerAddress};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::traits::Transport;

#[derive(Debug, Default)]
struct MemoryState {
    bound: Vec<String>,
    inbound: VecDeque<Multipart>,
    sent: Vec<Multipart>,
    unreachable: HashSet<PeerAddress>,
}

/// Transport backed by shared in-process queues
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a message as if a peer had sent it; the first frame is the sender
    pub fn push_inbound(&self, frames: Multipart) {
        self.state().inbound.push_back(frames);
    }

    /// Drain every message sent so far
    pub fn take_sent(&self) -> Vec<Multipart> {
        std::mem::take(&mut self.state().sent)
    }

    /// Number of inbound messages not yet received
    pub fn inbound_len(&self) -> usize {
        self.state().inbound.len()
    }

    /// Endpoints passed to `bind`
    pub fn bound_endpoints(&self) -> Vec<String> {
        self.state().bound.clone()
    }

    /// Make sends to `peer` fail as if it were not connected
    pub fn mark_unreachable(&self, peer: PeerAddress) {
        self.state().unreachable.insert(peer);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn bind(&mut self, endpoint: &str) -> BrokerResult<()> {
        self.state().bound.push(endpoint.to_string());
        Ok(())
    }

    async fn send_multipart(&mut self, frames: Multipart) -> BrokerResult<()> {
        let mut state = self.state();
        let destination = frames
            .first()
            .map(|f| PeerAddress::new(f.clone()))
            .ok_or_else(|| BrokerError::Transport("Cannot send an empty message".to_string()))?;
        if state.unreachable.contains(&destination) {
            return Err(BrokerError::PeerNotFound(destination.to_string()));
        }
        state.sent.push(frames);
        Ok(())
    }

    async fn recv_multipart(&mut self) -> BrokerResult<Option<Multipart>> {
        Ok(self.state().inbound.pop_front())
    }

    async fn poll_readable(&mut self, timeout: Duration) -> BrokerResult<bool> {
        let ready = !self.state().inbound.is_empty();
        if ready {
            return Ok(true);
        }
        tokio::time::sleep(timeout).await;
        let ready = !self.state().inbound.is_empty();
        Ok(ready)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
