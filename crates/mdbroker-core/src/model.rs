//! Worker, Service and snapshot type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::protocol::{Multipart, PeerAddress};

/// A worker registered with the broker for one service
#[derive(Debug, Clone)]
pub struct Worker {
    /// Address the worker sends from; also where control frames are routed
    pub identity: PeerAddress,
    /// Address the worker receives work on
    pub inbound_address: PeerAddress,
    /// Service this worker is attached to
    pub service_name: String,
    /// Length of one heartbeat window
    pub lifetime: Duration,
    /// When the current heartbeat window ends
    pub expiry_at: Instant,
    /// Last heartbeat (or registration) time
    pub last_heartbeat_at: Instant,
    /// Health counter, `0..=max_liveness`
    pub liveness: u32,
    /// Liveness ceiling; a worker is healthy only at this value
    pub max_liveness: u32,
    /// Registration timestamp
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    /// Create a new worker at full liveness
    pub fn new(
        identity: PeerAddress,
        receiver_suffix: &str,
        service_name: String,
        lifetime: Duration,
        max_liveness: u32,
        now: Instant,
    ) -> Self {
        let inbound_address = identity.with_suffix(receiver_suffix);
        Self {
            identity,
            inbound_address,
            service_name,
            lifetime,
            expiry_at: now + lifetime,
            last_heartbeat_at: now,
            liveness: max_liveness,
            max_liveness,
            registered_at: Utc::now(),
        }
    }

    /// Check if the worker may receive new work
    pub fn is_healthy(&self) -> bool {
        self.liveness == self.max_liveness
    }

    /// Derived health state
    pub fn state(&self) -> WorkerState {
        if self.liveness == 0 {
            WorkerState::Expired
        } else if self.is_healthy() {
            WorkerState::Healthy
        } else {
            WorkerState::Degraded
        }
    }

    /// Whether the current heartbeat window has elapsed
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expiry_at
    }

    /// Record a heartbeat: regain one liveness point and open a new window
    pub fn record_heartbeat(&mut self, now: Instant) {
        self.liveness = (self.liveness + 1).min(self.max_liveness);
        self.last_heartbeat_at = now;
        self.extend_expiry(now);
    }

    /// Record a missed window: lose one liveness point and grant another window
    pub fn miss_window(&mut self, now: Instant) {
        self.liveness = self.liveness.saturating_sub(1);
        self.extend_expiry(now);
    }

    fn extend_expiry(&mut self, now: Instant) {
        self.expiry_at = self.expiry_at.max(now + self.lifetime);
    }
}

/// Worker health as derived from liveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Full liveness, eligible for work
    Healthy,
    /// Missed at least one window
    Degraded,
    /// No liveness left; removed on the next expiry check
    Expired,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Healthy => write!(f, "Healthy"),
            WorkerState::Degraded => write!(f, "Degraded"),
            WorkerState::Expired => write!(f, "Expired"),
        }
    }
}

/// A named service: queued requests plus workers in rotation order
#[derive(Debug, Clone)]
pub struct Service {
    /// Service name
    pub name: String,
    /// Request envelopes in arrival order
    pub pending_requests: VecDeque<Multipart>,
    /// Worker identities; the front is offered work first
    pub workers: VecDeque<PeerAddress>,
}

impl Service {
    /// Create an empty service
    pub fn new(name: String) -> Self {
        Self {
            name,
            pending_requests: VecDeque::new(),
            workers: VecDeque::new(),
        }
    }

    /// Append a worker to the rotation
    pub fn attach_worker(&mut self, identity: PeerAddress) {
        if !self.workers.contains(&identity) {
            self.workers.push_back(identity);
        }
    }

    /// Remove a worker from the rotation
    pub fn detach_worker(&mut self, identity: &PeerAddress) -> bool {
        let before = self.workers.len();
        self.workers.retain(|w| w != identity);
        self.workers.len() != before
    }

    /// Queue a request envelope
    pub fn enqueue(&mut self, envelope: Multipart) {
        self.pending_requests.push_back(envelope);
    }
}

/// Worker summary for status reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub identity: String,
    pub service: String,
    pub liveness: u32,
    pub state: WorkerState,
    pub registered_at: DateTime<Utc>,
}

impl From<&Worker> for WorkerSnapshot {
    fn from(worker: &Worker) -> Self {
        Self {
            identity: worker.identity.to_string(),
            service: worker.service_name.clone(),
            liveness: worker.liveness,
            state: worker.state(),
            registered_at: worker.registered_at,
        }
    }
}

/// Service summary for status reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub pending_requests: usize,
    pub workers: Vec<String>,
}

impl From<&Service> for ServiceSnapshot {
    fn from(service: &Service) -> Self {
        Self {
            name: service.name.clone(),
            pending_requests: service.pending_requests.len(),
            workers: service.workers.iter().map(|w| w.to_string()).collect(),
        }
    }
}

/// Point-in-time view of broker state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSnapshot {
    pub identity: String,
    pub services: Vec<ServiceSnapshot>,
    pub workers: Vec<WorkerSnapshot>,
}
