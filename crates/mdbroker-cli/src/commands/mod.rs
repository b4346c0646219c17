//! CLI commands implementation

use anyhow::{anyhow, bail, Context, Result};
use mdbroker_core::{
    encode, parse_delivery, unwrap_envelope, Command, Delivery, Frame, PeerAddress, Role,
    DEFAULT_RECEIVER_SUFFIX,
};
use mdbroker_transport::TcpPeer;
use std::future::Future;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How often an unanswered verification is repeated
const VERIFY_RETRY: Duration = Duration::from_millis(250);

/// Minimum time a worker waits for its registration to be confirmed
const WORKER_VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// Pair of connections a peer holds to the broker
///
/// The broker answers on `<identity>_receiver`, so every peer connects
/// twice: once under its own identity to send, once under the receiver
/// identity to receive.
pub struct Session {
    role: Role,
    control: TcpPeer,
    inbound: TcpPeer,
}

impl Session {
    /// Connect both halves of a session under a fresh identity
    pub async fn connect(endpoint: &str, role: Role, prefix: &str) -> Result<Self> {
        let identity = PeerAddress::from(format!("{}-{}", prefix, Uuid::new_v4()));
        let inbound = TcpPeer::connect(endpoint, identity.with_suffix(DEFAULT_RECEIVER_SUFFIX))
            .await
            .with_context(|| format!("connecting to {}", endpoint))?;
        let control = TcpPeer::connect(endpoint, identity)
            .await
            .with_context(|| format!("connecting to {}", endpoint))?;

        Ok(Self {
            role,
            control,
            inbound,
        })
    }

    /// Identity the session sends under
    pub fn identity(&self) -> &PeerAddress {
        self.control.identity()
    }

    /// Send a command under the session's role
    pub async fn send(&mut self, command: Command, payload: Vec<Frame>) -> Result<()> {
        self.control
            .send(encode(self.role, command, payload))
            .await
            .context("sending to broker")
    }

    /// Wait for the next valid message from the broker
    pub async fn recv(&mut self) -> Result<Delivery> {
        loop {
            let frames = self
                .inbound
                .recv()
                .await?
                .ok_or_else(|| anyhow!("broker closed the connection"))?;
            match parse_delivery(frames) {
                Ok(delivery) => return Ok(delivery),
                Err(e) => warn!(error = %e, "Ignoring invalid message from broker"),
            }
        }
    }

    /// Send `VERIFICATION_REQUEST` until the broker answers; returns the
    /// broker identity
    ///
    /// The broker only learns about the receiving connection once its
    /// handshake has been processed, so early verifications may go
    /// unanswered.
    pub async fn verify(&mut self, payload: Vec<Frame>, deadline: Duration) -> Result<String> {
        let give_up = Instant::now() + deadline;
        loop {
            self.send(Command::VerificationRequest, payload.clone()).await?;

            let wait = VERIFY_RETRY.min(give_up.saturating_duration_since(Instant::now()));
            match timeout(wait, self.recv()).await {
                Ok(delivery) => {
                    let delivery = delivery?;
                    if delivery.command == Command::VerificationResponse {
                        let identity = delivery
                            .body
                            .first()
                            .map(|f| String::from_utf8_lossy(f).into_owned())
                            .unwrap_or_default();
                        debug!(broker = %identity, "Verified");
                        return Ok(identity);
                    }
                    debug!(command = %delivery.command, "Ignoring message while verifying");
                }
                Err(_) if Instant::now() >= give_up => {
                    bail!("broker did not answer within {:?}", deadline)
                }
                Err(_) => {}
            }
        }
    }
}

/// Ask the broker for its identity
pub async fn ping(endpoint: &str, deadline: Duration) -> Result<String> {
    let mut session = Session::connect(endpoint, Role::Client, "mdcli").await?;
    session.verify(Vec::new(), deadline).await
}

/// Send one request to a service and wait for its reply
pub async fn request(
    endpoint: &str,
    service: &str,
    body: Vec<String>,
    deadline: Duration,
) -> Result<Vec<String>> {
    if body.is_empty() {
        bail!("request body must not be empty");
    }

    let mut session = Session::connect(endpoint, Role::Client, "mdcli").await?;
    session.verify(Vec::new(), deadline).await?;

    let correlation = Uuid::new_v4().to_string();
    let mut payload = vec![service.as_bytes().to_vec(), correlation.as_bytes().to_vec()];
    payload.extend(body.into_iter().map(String::into_bytes));
    session.send(Command::Request, payload).await?;
    debug!(service = %service, correlation_id = %correlation, "Request sent");

    let wait = async {
        loop {
            let delivery = session.recv().await?;
            if delivery.command != Command::Reply {
                continue;
            }
            let (_, mut reply) = unwrap_envelope(delivery.body)?;
            if reply.first().map(Vec::as_slice) != Some(correlation.as_bytes()) {
                debug!("Ignoring reply for another request");
                continue;
            }
            reply.remove(0);
            return Ok::<_, anyhow::Error>(
                reply
                    .into_iter()
                    .map(|f| String::from_utf8_lossy(&f).into_owned())
                    .collect(),
            );
        }
    };

    timeout(deadline, wait)
        .await
        .map_err(|_| anyhow!("no reply from service '{}' within {:?}", service, deadline))?
}

/// Echo worker: replies to every request with its own body until `shutdown`
/// completes; returns the number of requests served
pub async fn worker<F>(
    endpoint: &str,
    service: &str,
    heartbeat: Duration,
    shutdown: F,
) -> Result<u64>
where
    F: Future<Output = ()>,
{
    let mut session = Session::connect(endpoint, Role::Worker, "worker").await?;
    let announce = vec![service.as_bytes().to_vec()];
    let broker = session
        .verify(announce.clone(), WORKER_VERIFY_TIMEOUT.max(heartbeat * 4))
        .await?;
    info!(service = %service, worker = %session.identity(), broker = %broker, "Worker ready");

    let mut ticker = tokio::time::interval(heartbeat);
    let mut served = 0u64;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                session.send(Command::Disconnect, Vec::new()).await?;
                info!(service = %service, served, "Worker stopped");
                return Ok(served);
            }
            _ = ticker.tick() => {
                session.send(Command::Heartbeat, Vec::new()).await?;
            }
            delivery = session.recv() => {
                let delivery = delivery?;
                match delivery.command {
                    Command::Request => {
                        // the request envelope doubles as the reply route
                        session.send(Command::Reply, delivery.body).await?;
                        served += 1;
                    }
                    Command::Disconnect => {
                        warn!(service = %service, "Broker asked to re-announce");
                        session.send(Command::VerificationRequest, announce.clone()).await?;
                    }
                    Command::VerificationResponse => {
                        debug!("Registration confirmed");
                    }
                    other => debug!(command = %other, "Ignoring command"),
                }
            }
        }
    }
}
