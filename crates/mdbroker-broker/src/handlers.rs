//! Client and worker message handlers

use mdbroker_core::{
    encode_routed, unwrap_envelope, wrap_envelope, BrokerResult, Command, Frame, PeerAddress,
    ProtocolError, Role,
};
use mdbroker_network::Registrator;
use mdbroker_transport::Transport;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::dispatcher::correlation_id;
use crate::registry::Registration;

impl<T, R> Broker<T, R>
where
    T: Transport,
    R: Registrator,
{
    pub(crate) async fn handle_client(
        &mut self,
        sender: PeerAddress,
        command: Command,
        body: Vec<Frame>,
    ) -> BrokerResult<()> {
        match command {
            Command::Request => self.client_request(sender, body).await,
            Command::VerificationRequest => {
                let inbound = self.inbound_address(&sender);
                let identity = self.identity.as_bytes().to_vec();
                self.send_control(
                    &inbound,
                    Role::Client,
                    Command::VerificationResponse,
                    vec![identity],
                )
                .await;
                debug!(client = %sender, "Answered client verification");
                Ok(())
            }
            other => Err(ProtocolError::UnexpectedCommand {
                role: Role::Client,
                command: other,
            }
            .into()),
        }
    }

    async fn client_request(&mut self, sender: PeerAddress, body: Vec<Frame>) -> BrokerResult<()> {
        let mut body = body.into_iter();
        let service = body
            .next()
            .map(|f| String::from_utf8_lossy(&f).into_owned())
            .ok_or(ProtocolError::MissingServiceName)?;
        let body: Vec<Frame> = body.collect();
        if body.is_empty() {
            return Err(ProtocolError::EmptyRequestBody(service).into());
        }

        let envelope = wrap_envelope(&sender, body);
        let correlation = correlation_id(&envelope);
        self.registry.enqueue(&service, envelope);
        debug!(
            service = %service,
            client = %sender,
            correlation_id = %correlation,
            "Accepted request"
        );

        let report = self.dispatch(&service).await;

        let pending = self.registry.pending_count(&service);
        if report.requeued > 0 {
            warn!(
                service = %service,
                correlation_id = %correlation,
                requeued = report.requeued,
                pending = pending,
                "Worker unreachable, request queued"
            );
        } else if pending > 0 {
            info!(
                service = %service,
                correlation_id = %correlation,
                pending = pending,
                "No healthy worker, request queued"
            );
        }
        Ok(())
    }

    pub(crate) async fn handle_worker(
        &mut self,
        sender: PeerAddress,
        command: Command,
        body: Vec<Frame>,
    ) -> BrokerResult<()> {
        match command {
            Command::VerificationRequest => self.worker_verification(sender, body).await,
            Command::Reply => self.worker_reply(sender, body).await,
            Command::Heartbeat => {
                match self.registry.heartbeat(&sender, Instant::now()) {
                    Some(heartbeat) => {
                        debug!(
                            worker = %sender,
                            service = %heartbeat.service,
                            liveness = heartbeat.liveness,
                            "Heartbeat"
                        );
                        if heartbeat.restored {
                            info!(worker = %sender, service = %heartbeat.service, "Worker healthy again");
                            self.dispatch(&heartbeat.service).await;
                        }
                    }
                    None => {
                        warn!(worker = %sender, "Heartbeat from unknown worker, asking it to re-announce");
                        let inbound = self.inbound_address(&sender);
                        self.send_control(&inbound, Role::Worker, Command::Disconnect, Vec::new())
                            .await;
                    }
                }
                Ok(())
            }
            Command::Disconnect => {
                match self.registry.remove_worker(&sender) {
                    Some(worker) => {
                        info!(worker = %sender, service = %worker.service_name, "Worker disconnected");
                    }
                    None => debug!(worker = %sender, "Disconnect from unknown worker"),
                }
                Ok(())
            }
            other => Err(ProtocolError::UnexpectedCommand {
                role: Role::Worker,
                command: other,
            }
            .into()),
        }
    }

    async fn worker_verification(
        &mut self,
        sender: PeerAddress,
        body: Vec<Frame>,
    ) -> BrokerResult<()> {
        let service = body
            .into_iter()
            .next()
            .filter(|f| !f.is_empty())
            .map(|f| String::from_utf8_lossy(&f).into_owned())
            .ok_or(ProtocolError::MissingServiceName)?;

        let service = match self
            .registry
            .register_worker(sender.clone(), &service, Instant::now())
        {
            Registration::Registered => service,
            Registration::AlreadyRegistered { service: current } => {
                if current != service {
                    warn!(
                        worker = %sender,
                        service = %current,
                        requested = %service,
                        "Worker already registered with another service"
                    );
                }
                current
            }
        };

        let inbound = self.inbound_address(&sender);
        let identity = self.identity.as_bytes().to_vec();
        self.send_control(
            &inbound,
            Role::Worker,
            Command::VerificationResponse,
            vec![identity],
        )
        .await;

        self.dispatch(&service).await;
        Ok(())
    }

    async fn worker_reply(&mut self, sender: PeerAddress, body: Vec<Frame>) -> BrokerResult<()> {
        let (client, reply) = unwrap_envelope(body)?;
        let payload = wrap_envelope(&client, reply);
        let correlation = correlation_id(&payload);

        let inbound = self.inbound_address(&client);
        let frames = encode_routed(&inbound, Role::Client, Command::Reply, payload);
        self.transport.send_multipart(frames).await?;

        debug!(
            worker = %sender,
            client = %client,
            correlation_id = %correlation,
            "Forwarded reply"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdbroker_core::{encode, BrokerError, BrokerSettings, Multipart, WorkerState};
    use mdbroker_network::NoopRegistrator;
    use mdbroker_transport::MemoryTransport;
    use std::time::Duration;

    const BROKER_ID: &str = "broker-test";

    fn broker() -> (Broker<MemoryTransport, NoopRegistrator>, MemoryTransport) {
        let handle = MemoryTransport::new();
        let broker = Broker::new(BrokerSettings::default(), handle.clone(), NoopRegistrator)
            .with_identity(BROKER_ID);
        (broker, handle)
    }

    fn from(sender: &str, role: Role, command: Command, payload: &[&str]) -> Multipart {
        let mut frames = vec![sender.as_bytes().to_vec()];
        frames.extend(encode(
            role,
            command,
            payload.iter().map(|p| p.as_bytes().to_vec()).collect(),
        ));
        frames
    }

    fn frames(parts: &[&str]) -> Multipart {
        parts.iter().map(|p| p.as_bytes().to_vec()).collect()
    }

    async fn register(broker: &mut Broker<MemoryTransport, NoopRegistrator>, worker: &str) {
        broker
            .process_message(from(worker, Role::Worker, Command::VerificationRequest, &["echo"]))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_without_workers_is_queued() {
        let (mut broker, handle) = broker();

        broker
            .process_message(from("c1", Role::Client, Command::Request, &["echo", "id-1", "hi"]))
            .await
            .unwrap();

        assert_eq!(broker.registry().pending_count("echo"), 1);
        assert!(handle.take_sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_worker_drains_queue() {
        let (mut broker, handle) = broker();
        broker
            .process_message(from("c1", Role::Client, Command::Request, &["echo", "id-1", "hi"]))
            .await
            .unwrap();

        register(&mut broker, "w1").await;

        assert_eq!(broker.registry().pending_count("echo"), 0);
        assert_eq!(
            handle.take_sent(),
            vec![
                frames(&["w1_receiver", "", "WORKER", "VERIFICATION_RESPONSE", BROKER_ID]),
                frames(&["w1_receiver", "", "WORKER", "REQUEST", "c1", "", "id-1", "hi"]),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_alternate_between_workers() {
        let (mut broker, handle) = broker();
        register(&mut broker, "a").await;
        register(&mut broker, "b").await;
        handle.take_sent();

        for id in ["id-1", "id-2"] {
            broker
                .process_message(from("c1", Role::Client, Command::Request, &["echo", id, "x"]))
                .await
                .unwrap();
        }

        let sent = handle.take_sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0][0], b"a_receiver".to_vec());
        assert_eq!(sent[0][6], b"id-1".to_vec());
        assert_eq!(sent[1][0], b"b_receiver".to_vec());
        assert_eq!(sent[1][6], b"id-2".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_needs_service_and_body() {
        let (mut broker, _handle) = broker();

        let result = broker
            .process_message(from("c1", Role::Client, Command::Request, &["echo"]))
            .await;
        assert!(matches!(
            result,
            Err(BrokerError::Protocol(ProtocolError::EmptyRequestBody(ref s))) if s == "echo"
        ));

        let result = broker
            .process_message(from("c1", Role::Client, Command::Request, &[]))
            .await;
        assert!(matches!(
            result,
            Err(BrokerError::Protocol(ProtocolError::MissingServiceName))
        ));
        assert_eq!(broker.registry().service_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_verification() {
        let (mut broker, handle) = broker();

        broker
            .process_message(from("c1", Role::Client, Command::VerificationRequest, &[]))
            .await
            .unwrap();

        assert_eq!(
            handle.take_sent(),
            vec![frames(&["c1_receiver", "", "CLIENT", "VERIFICATION_RESPONSE", BROKER_ID])]
        );
        assert_eq!(broker.registry().service_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_may_not_send_heartbeat() {
        let (mut broker, handle) = broker();

        let result = broker
            .process_message(from("c1", Role::Client, Command::Heartbeat, &[]))
            .await;
        assert!(matches!(
            result,
            Err(BrokerError::Protocol(ProtocolError::UnexpectedCommand { .. }))
        ));
        assert!(handle.take_sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_verification_is_idempotent() {
        let (mut broker, handle) = broker();
        register(&mut broker, "w1").await;
        register(&mut broker, "w1").await;

        assert_eq!(broker.registry().worker_count(), 1);
        assert_eq!(broker.registry().service("echo").unwrap().workers.len(), 1);
        assert_eq!(handle.take_sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_without_service_is_rejected() {
        let (mut broker, handle) = broker();

        let result = broker
            .process_message(from("w1", Role::Worker, Command::VerificationRequest, &[]))
            .await;
        assert!(matches!(
            result,
            Err(BrokerError::Protocol(ProtocolError::MissingServiceName))
        ));
        assert_eq!(broker.registry().worker_count(), 0);
        assert!(handle.take_sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_is_forwarded_to_client() {
        let (mut broker, handle) = broker();
        register(&mut broker, "w1").await;
        handle.take_sent();

        broker
            .process_message(from(
                "w1",
                Role::Worker,
                Command::Reply,
                &["c1", "", "id-1", "pong"],
            ))
            .await
            .unwrap();

        assert_eq!(
            handle.take_sent(),
            vec![frames(&["c1_receiver", "", "CLIENT", "REPLY", "c1", "", "id-1", "pong"])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_to_unreachable_client_is_an_error() {
        let (mut broker, handle) = broker();
        handle.mark_unreachable(PeerAddress::from("c1_receiver"));

        let result = broker
            .process_message(from("w1", Role::Worker, Command::Reply, &["c1", "", "id-1"]))
            .await;
        assert!(matches!(result, Err(BrokerError::PeerNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_heartbeat_gets_disconnect() {
        let (mut broker, handle) = broker();

        broker
            .process_message(from("ghost", Role::Worker, Command::Heartbeat, &[]))
            .await
            .unwrap();

        assert_eq!(broker.registry().worker_count(), 0);
        assert_eq!(
            handle.take_sent(),
            vec![frames(&["ghost_receiver", "", "WORKER", "DISCONNECT"])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_disconnect_removes_worker() {
        let (mut broker, handle) = broker();
        register(&mut broker, "w1").await;
        handle.take_sent();

        broker
            .process_message(from("w1", Role::Worker, Command::Disconnect, &[]))
            .await
            .unwrap();

        assert_eq!(broker.registry().worker_count(), 0);
        assert!(broker.registry().service("echo").unwrap().workers.is_empty());
        assert!(handle.take_sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restored_worker_picks_up_queued_request() {
        let (mut broker, handle) = broker();
        register(&mut broker, "w1").await;

        tokio::time::advance(Duration::from_millis(7501)).await;
        broker.purge_workers().await;
        assert_eq!(
            broker.registry().worker(&PeerAddress::from("w1")).unwrap().state(),
            WorkerState::Degraded
        );

        broker
            .process_message(from("c1", Role::Client, Command::Request, &["echo", "id-1", "x"]))
            .await
            .unwrap();
        assert_eq!(broker.registry().pending_count("echo"), 1);
        handle.take_sent();

        broker
            .process_message(from("w1", Role::Worker, Command::Heartbeat, &[]))
            .await
            .unwrap();

        assert_eq!(broker.registry().pending_count("echo"), 0);
        assert_eq!(
            handle.take_sent(),
            vec![frames(&["w1_receiver", "", "WORKER", "REQUEST", "c1", "", "id-1", "x"])]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_undeliverable_request_stays_queued() {
        let (mut broker, handle) = broker();
        register(&mut broker, "w1").await;
        handle.mark_unreachable(PeerAddress::from("w1_receiver"));

        broker
            .process_message(from("c1", Role::Client, Command::Request, &["echo", "id-1", "x"]))
            .await
            .unwrap();

        assert_eq!(broker.registry().pending_count("echo"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_keeps_request_order() {
        let (mut broker, handle) = broker();
        for id in ["r1", "r2"] {
            broker
                .process_message(from("c1", Role::Client, Command::Request, &["echo", id, "x"]))
                .await
                .unwrap();
        }
        handle.mark_unreachable(PeerAddress::from("a_receiver"));

        register(&mut broker, "a").await;
        register(&mut broker, "b").await;

        // r1 is stuck on a, so r2 must not overtake it on b
        let forwarded: Vec<Multipart> = handle
            .take_sent()
            .into_iter()
            .filter(|f| f.get(3).map(Vec::as_slice) == Some(b"REQUEST".as_slice()))
            .collect();
        assert!(forwarded.is_empty());

        let pending: Vec<String> = broker
            .registry()
            .service("echo")
            .unwrap()
            .pending_requests
            .iter()
            .map(|envelope| correlation_id(envelope))
            .collect();
        assert_eq!(pending, vec!["r1".to_string(), "r2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_reports_requeued_requests() {
        let (mut broker, handle) = broker();
        register(&mut broker, "w1").await;
        handle.mark_unreachable(PeerAddress::from("w1_receiver"));
        for id in ["id-1", "id-2"] {
            broker
                .registry
                .enqueue("echo", frames(&["c1", "", id, "x"]));
        }

        let report = broker.dispatch("echo").await;

        assert_eq!(report.sent, 0);
        assert_eq!(report.requeued, 2);
        assert_eq!(broker.registry().pending_count("echo"), 2);
    }
}
