//! Broker event loop
//!
//! One loop iteration waits for the transport to become readable (at most one
//! heartbeat interval), handles at most one inbound message, runs the purge
//! pass and gives the registrator a chance to announce the broker. All
//! registry mutation happens on this loop.

use futures::FutureExt;
use mdbroker_core::{
    encode_routed, parse, BrokerError, BrokerResult, BrokerSettings, BrokerSnapshot, Command,
    Multipart, PeerAddress, Role,
};
use mdbroker_network::Registrator;
use mdbroker_transport::Transport;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatcher::correlation_id;
use crate::registry::Registry;

/// Outcome of one dispatch pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DispatchReport {
    /// Requests handed to the transport
    pub sent: usize,
    /// Requests put back after a failed send
    pub requeued: usize,
}

/// Majordomo broker owning its transport, registrator and registries
pub struct Broker<T, R> {
    /// Random token identifying this broker instance
    pub(crate) identity: String,
    /// Loop settings
    pub(crate) settings: BrokerSettings,
    /// Transport peers connect through
    pub(crate) transport: T,
    /// Discovery registrator
    registrator: R,
    /// Workers and services
    pub(crate) registry: Registry,
}

impl<T, R> Broker<T, R>
where
    T: Transport,
    R: Registrator,
{
    /// Create a new broker with a random identity
    pub fn new(settings: BrokerSettings, transport: T, registrator: R) -> Self {
        let identity = Uuid::new_v4().to_string();
        let registry = Registry::new(&settings);

        Self {
            identity,
            settings,
            transport,
            registrator,
            registry,
        }
    }

    /// Replace the generated identity
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    /// Broker identity token
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Worker and service registries
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Transport the broker owns
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Point-in-time view of services and workers
    pub fn snapshot(&self) -> BrokerSnapshot {
        self.registry.snapshot(&self.identity)
    }

    /// Bind the transport to the configured endpoint
    pub async fn bind(&mut self) -> BrokerResult<()> {
        let endpoint = self.settings.endpoint.clone();
        self.transport.bind(&endpoint).await
    }

    /// Run until `shutdown` completes
    ///
    /// Shutdown is only observed while waiting on the transport, so a
    /// message that is being handled is always handled to completion.
    pub async fn run<F>(&mut self, shutdown: F) -> BrokerResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let interval = self.settings.heartbeat_interval();

        info!(
            identity = %self.identity,
            endpoint = %self.settings.endpoint,
            transport = self.transport.name(),
            registrator = self.registrator.name(),
            max_liveness = self.settings.max_liveness,
            heartbeat_interval_ms = self.settings.heartbeat_interval_ms,
            "Broker running"
        );

        loop {
            let ready = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                ready = self.transport.poll_readable(interval) => ready?,
            };
            self.iterate(ready).await;
        }

        info!(
            identity = %self.identity,
            workers = self.registry.worker_count(),
            services = self.registry.service_count(),
            "Broker stopped"
        );
        Ok(())
    }

    /// Run a single loop iteration
    pub async fn run_once(&mut self) -> BrokerResult<()> {
        let ready = self
            .transport
            .poll_readable(self.settings.heartbeat_interval())
            .await?;
        self.iterate(ready).await;
        Ok(())
    }

    async fn iterate(&mut self, ready: bool) {
        if ready {
            self.handle_next().await;
        }
        self.purge_workers().await;
        self.registrator.register();
        tokio::task::yield_now().await;
    }

    /// Receive and process one message, containing any failure to it
    async fn handle_next(&mut self) {
        let frames = match self.transport.recv_multipart().await {
            Ok(Some(frames)) => frames,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Failed to receive message");
                return;
            }
        };

        match AssertUnwindSafe(self.process_message(frames))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(BrokerError::Protocol(e))) => {
                warn!(error = %e, "Discarding invalid message");
            }
            Ok(Err(e)) => {
                error!(error = %e, "Failed to process message");
            }
            Err(panic) => {
                error!(panic = %panic_message(panic.as_ref()), "Message handler panicked");
            }
        }
    }

    /// Validate a raw frame list and route it to the client or worker handler
    pub async fn process_message(&mut self, frames: Multipart) -> BrokerResult<()> {
        let message = parse(frames)?;
        debug!(
            sender = %message.sender,
            role = %message.role,
            command = %message.command,
            frames = message.body.len(),
            "Received message"
        );

        match message.role {
            Role::Client => {
                self.handle_client(message.sender, message.command, message.body)
                    .await
            }
            Role::Worker => {
                self.handle_worker(message.sender, message.command, message.body)
                    .await
            }
        }
    }

    /// Decay silent workers and disconnect the ones that expired
    pub(crate) async fn purge_workers(&mut self) {
        let expired = self.registry.purge(Instant::now());
        for worker in expired {
            info!(
                worker = %worker.identity,
                service = %worker.service_name,
                "Worker expired, removing"
            );
            let frames = encode_routed(
                &worker.inbound_address,
                Role::Worker,
                Command::Disconnect,
                Vec::new(),
            );
            if let Err(e) = self.transport.send_multipart(frames).await {
                debug!(worker = %worker.identity, error = %e, "Final disconnect not delivered");
            }
        }
    }

    /// Forward queued requests of a service to healthy workers
    ///
    /// Sending stops at the first request the transport cannot deliver. That
    /// request and every assignment after it go back to the head of the
    /// queue in their original order.
    pub(crate) async fn dispatch(&mut self, service: &str) -> DispatchReport {
        self.purge_workers().await;

        let mut report = DispatchReport::default();
        let mut undelivered = Vec::new();
        let mut assignments = self.registry.assign(service).into_iter();
        while let Some(assignment) = assignments.next() {
            let correlation = correlation_id(&assignment.envelope);
            let frames = encode_routed(
                &assignment.inbound_address,
                Role::Worker,
                Command::Request,
                assignment.envelope.clone(),
            );
            match self.transport.send_multipart(frames).await {
                Ok(()) => {
                    report.sent += 1;
                    debug!(
                        service = %service,
                        worker = %assignment.worker,
                        correlation_id = %correlation,
                        "Forwarded request"
                    );
                }
                Err(e) => {
                    warn!(
                        service = %service,
                        worker = %assignment.worker,
                        correlation_id = %correlation,
                        error = %e,
                        "Failed to forward request, keeping it queued"
                    );
                    undelivered.push(assignment.envelope);
                    undelivered.extend(assignments.by_ref().map(|a| a.envelope));
                    break;
                }
            }
        }

        if !undelivered.is_empty() {
            report.requeued = undelivered.len();
            self.registry.requeue_front(service, undelivered);
        }
        report
    }

    /// Address a peer receives on
    pub(crate) fn inbound_address(&self, peer: &PeerAddress) -> PeerAddress {
        peer.with_suffix(&self.settings.receiver_suffix)
    }

    /// Send a control message, logging instead of failing when undeliverable
    pub(crate) async fn send_control(
        &mut self,
        destination: &PeerAddress,
        role: Role,
        command: Command,
        payload: Multipart,
    ) {
        let frames = encode_routed(destination, role, command, payload);
        if let Err(e) = self.transport.send_multipart(frames).await {
            debug!(
                destination = %destination,
                command = %command,
                error = %e,
                "Control message not delivered"
            );
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
