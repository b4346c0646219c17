//! Worker and service registries with liveness bookkeeping

use mdbroker_core::{
    BrokerSettings, BrokerSnapshot, Multipart, PeerAddress, Service, ServiceSnapshot, Worker,
    WorkerSnapshot,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::dispatcher::{self, Assignment};

type WorkersMap = HashMap<PeerAddress, Worker>;
type ServicesMap = HashMap<String, Service>;

/// Result of a worker verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    /// A new worker was attached to the service
    Registered,
    /// The identity was already registered with this service
    AlreadyRegistered { service: String },
}

/// Result of a heartbeat from a known worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    /// Service the worker is attached to
    pub service: String,
    /// Liveness after the heartbeat
    pub liveness: u32,
    /// Whether the heartbeat made a degraded worker healthy again
    pub restored: bool,
}

/// Registry of workers and services owned by one broker
///
/// Workers are stored by identity; every service keeps the identities of
/// its workers in rotation order. Both sides are updated together so each
/// registered worker appears in exactly one service.
pub struct Registry {
    /// Workers indexed by identity
    workers: WorkersMap,
    /// Services indexed by name
    services: ServicesMap,
    /// Liveness a worker needs to receive work
    max_liveness: u32,
    /// Heartbeat window per worker
    lifetime: Duration,
    /// Suffix of the address workers receive on
    receiver_suffix: String,
}

impl Registry {
    /// Create an empty registry
    pub fn new(settings: &BrokerSettings) -> Self {
        Self {
            workers: HashMap::new(),
            services: HashMap::new(),
            max_liveness: settings.max_liveness,
            lifetime: settings.heartbeat_expiry(),
            receiver_suffix: settings.receiver_suffix.clone(),
        }
    }

    /// Resolve a service by name, creating it on first reference
    pub fn service_mut(&mut self, name: &str) -> &mut Service {
        self.services.entry(name.to_string()).or_insert_with(|| {
            debug!(service = %name, "Created service");
            Service::new(name.to_string())
        })
    }

    /// Get a service by name
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    /// Get a worker by identity
    pub fn worker(&self, identity: &PeerAddress) -> Option<&Worker> {
        self.workers.get(identity)
    }

    /// Number of registered workers
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Number of known services
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Number of requests waiting for a service
    pub fn pending_count(&self, service: &str) -> usize {
        self.services
            .get(service)
            .map(|s| s.pending_requests.len())
            .unwrap_or(0)
    }

    /// Attach a worker to a service, unless the identity is already known
    pub fn register_worker(
        &mut self,
        identity: PeerAddress,
        service_name: &str,
        now: Instant,
    ) -> Registration {
        if let Some(existing) = self.workers.get(&identity) {
            return Registration::AlreadyRegistered {
                service: existing.service_name.clone(),
            };
        }

        let worker = Worker::new(
            identity.clone(),
            &self.receiver_suffix,
            service_name.to_string(),
            self.lifetime,
            self.max_liveness,
            now,
        );
        self.service_mut(service_name).attach_worker(identity.clone());
        self.workers.insert(identity.clone(), worker);

        info!(worker = %identity, service = %service_name, "Worker registered");
        Registration::Registered
    }

    /// Apply a heartbeat; `None` if the worker is unknown
    pub fn heartbeat(&mut self, identity: &PeerAddress, now: Instant) -> Option<Heartbeat> {
        let worker = self.workers.get_mut(identity)?;
        let was_healthy = worker.is_healthy();
        worker.record_heartbeat(now);

        Some(Heartbeat {
            service: worker.service_name.clone(),
            liveness: worker.liveness,
            restored: !was_healthy && worker.is_healthy(),
        })
    }

    /// Remove a worker from its service and the registry
    pub fn remove_worker(&mut self, identity: &PeerAddress) -> Option<Worker> {
        let worker = self.workers.remove(identity)?;
        if let Some(service) = self.services.get_mut(&worker.service_name) {
            service.detach_worker(identity);
        }
        Some(worker)
    }

    /// Decay workers whose heartbeat window has passed and remove the ones
    /// already at zero liveness. Returns the removed workers.
    pub fn purge(&mut self, now: Instant) -> Vec<Worker> {
        let mut expired = Vec::new();

        for worker in self.workers.values_mut() {
            if !worker.is_expired(now) {
                continue;
            }
            if worker.liveness == 0 {
                expired.push(worker.identity.clone());
            } else {
                worker.miss_window(now);
                debug!(
                    worker = %worker.identity,
                    service = %worker.service_name,
                    liveness = worker.liveness,
                    "Worker missed heartbeat window"
                );
            }
        }

        expired
            .iter()
            .filter_map(|identity| self.remove_worker(identity))
            .collect()
    }

    /// Queue a request envelope for a service; returns the queue length
    pub fn enqueue(&mut self, service: &str, envelope: Multipart) -> usize {
        let service = self.service_mut(service);
        service.enqueue(envelope);
        service.pending_requests.len()
    }

    /// Put envelopes back at the head of a service queue, keeping their order
    pub fn requeue_front(&mut self, service: &str, envelopes: Vec<Multipart>) {
        let service = self.service_mut(service);
        for envelope in envelopes.into_iter().rev() {
            service.pending_requests.push_front(envelope);
        }
    }

    /// Pop pending requests of a service onto healthy workers
    pub fn assign(&mut self, service: &str) -> Vec<Assignment> {
        match self.services.get_mut(service) {
            Some(svc) => dispatcher::assign(svc, &self.workers),
            None => Vec::new(),
        }
    }

    /// Point-in-time view for status reporting
    pub fn snapshot(&self, identity: &str) -> BrokerSnapshot {
        let mut services: Vec<ServiceSnapshot> =
            self.services.values().map(ServiceSnapshot::from).collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));

        let mut workers: Vec<WorkerSnapshot> =
            self.workers.values().map(WorkerSnapshot::from).collect();
        workers.sort_by(|a, b| a.identity.cmp(&b.identity));

        BrokerSnapshot {
            identity: identity.to_string(),
            services,
            workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdbroker_core::WorkerState;

    const WINDOW: Duration = Duration::from_millis(7500);

    fn registry() -> Registry {
        Registry::new(&BrokerSettings::default())
    }

    fn addr(name: &str) -> PeerAddress {
        PeerAddress::from(name)
    }

    #[test]
    fn test_register_worker() {
        let mut registry = registry();
        let now = Instant::now();

        let result = registry.register_worker(addr("w1"), "echo", now);
        assert_eq!(result, Registration::Registered);
        assert_eq!(registry.worker_count(), 1);
        assert_eq!(registry.service_count(), 1);

        let worker = registry.worker(&addr("w1")).unwrap();
        assert_eq!(worker.inbound_address, addr("w1_receiver"));
        assert_eq!(worker.liveness, 3);
        assert_eq!(worker.expiry_at, now + WINDOW);
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = registry();
        let now = Instant::now();

        registry.register_worker(addr("w1"), "echo", now);
        let again = registry.register_worker(addr("w1"), "echo", now);

        assert_eq!(
            again,
            Registration::AlreadyRegistered {
                service: "echo".to_string()
            }
        );
        assert_eq!(registry.service("echo").unwrap().workers.len(), 1);
        assert_eq!(registry.worker_count(), 1);
    }

    #[test]
    fn test_heartbeat_never_exceeds_max() {
        let mut registry = registry();
        let now = Instant::now();
        registry.register_worker(addr("w1"), "echo", now);

        for _ in 0..5 {
            let heartbeat = registry.heartbeat(&addr("w1"), now).unwrap();
            assert_eq!(heartbeat.liveness, 3);
            assert!(!heartbeat.restored);
        }
    }

    #[test]
    fn test_heartbeat_from_unknown_worker() {
        let mut registry = registry();
        assert!(registry.heartbeat(&addr("ghost"), Instant::now()).is_none());
        assert_eq!(registry.worker_count(), 0);
    }

    #[test]
    fn test_silent_worker_decays_then_is_removed() {
        let mut registry = registry();
        let start = Instant::now();
        registry.register_worker(addr("w1"), "echo", start);

        let mut now = start;
        for expected in [2, 1, 0] {
            now += WINDOW + Duration::from_millis(1);
            assert!(registry.purge(now).is_empty());
            assert_eq!(registry.worker(&addr("w1")).unwrap().liveness, expected);
        }
        assert_eq!(
            registry.worker(&addr("w1")).unwrap().state(),
            WorkerState::Expired
        );

        now += WINDOW + Duration::from_millis(1);
        let removed = registry.purge(now);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].identity, addr("w1"));
        assert!(registry.worker(&addr("w1")).is_none());
        assert!(registry.service("echo").unwrap().workers.is_empty());
    }

    #[test]
    fn test_purge_before_expiry_changes_nothing() {
        let mut registry = registry();
        let start = Instant::now();
        registry.register_worker(addr("w1"), "echo", start);

        assert!(registry.purge(start + WINDOW).is_empty());
        assert_eq!(registry.worker(&addr("w1")).unwrap().liveness, 3);
    }

    #[test]
    fn test_heartbeat_restores_degraded_worker() {
        let mut registry = registry();
        let start = Instant::now();
        registry.register_worker(addr("w1"), "echo", start);

        let now = start + WINDOW + Duration::from_millis(1);
        registry.purge(now);
        assert_eq!(registry.worker(&addr("w1")).unwrap().liveness, 2);

        let heartbeat = registry.heartbeat(&addr("w1"), now).unwrap();
        assert!(heartbeat.restored);
        assert_eq!(heartbeat.service, "echo");
    }

    #[test]
    fn test_remove_worker_detaches_from_service() {
        let mut registry = registry();
        let now = Instant::now();
        registry.register_worker(addr("w1"), "echo", now);
        registry.register_worker(addr("w2"), "echo", now);

        assert!(registry.remove_worker(&addr("w1")).is_some());
        assert!(registry.remove_worker(&addr("w1")).is_none());
        assert_eq!(
            registry.service("echo").unwrap().workers,
            std::collections::VecDeque::from(vec![addr("w2")])
        );
        // services outlive their workers
        registry.remove_worker(&addr("w2"));
        assert_eq!(registry.service_count(), 1);
    }

    #[test]
    fn test_requeue_front_keeps_order() {
        let mut registry = registry();
        registry.enqueue("echo", vec![b"c".to_vec()]);
        registry.requeue_front("echo", vec![vec![b"a".to_vec()], vec![b"b".to_vec()]]);

        let pending: Vec<_> = registry
            .service("echo")
            .unwrap()
            .pending_requests
            .iter()
            .cloned()
            .collect();
        assert_eq!(
            pending,
            vec![vec![b"a".to_vec()], vec![b"b".to_vec()], vec![b"c".to_vec()]]
        );
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let mut registry = registry();
        let now = Instant::now();
        registry.register_worker(addr("w2"), "beta", now);
        registry.register_worker(addr("w1"), "alpha", now);
        registry.enqueue("alpha", vec![b"client".to_vec()]);

        let snapshot = registry.snapshot("broker-1");
        assert_eq!(snapshot.identity, "broker-1");
        assert_eq!(snapshot.services[0].name, "alpha");
        assert_eq!(snapshot.services[0].pending_requests, 1);
        assert_eq!(snapshot.workers[0].identity, "w1");
        assert_eq!(snapshot.workers[1].state, WorkerState::Healthy);
    }
}
