//! TCP router transport
//!
//! Each connected peer announces its identity in a single-frame handshake.
//! Inbound messages are prefixed with that identity; outbound messages are
//! routed to the connection registered under their first frame.

use async_trait::async_trait;
use mdbroker_core::{BrokerError, BrokerResult, Multipart, PeerAddress};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::traits::Transport;
use crate::wire::{endpoint_addr, read_multipart, write_multipart};

type PeersMap = HashMap<PeerAddress, PeerHandle>;

/// Outbound queue of one connected peer
struct PeerHandle {
    /// Connection id, so a stale connection never unregisters its replacement
    connection_id: u64,
    tx: mpsc::UnboundedSender<Multipart>,
}

/// TCP transport with router semantics
pub struct TcpTransport {
    peers: Arc<RwLock<PeersMap>>,
    inbound_tx: mpsc::UnboundedSender<Multipart>,
    inbound_rx: mpsc::UnboundedReceiver<Multipart>,
    /// Message pulled off the channel by `poll_readable`
    ready: Option<Multipart>,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
    next_connection_id: Arc<AtomicU64>,
}

impl TcpTransport {
    /// Create an unbound transport
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            inbound_tx,
            inbound_rx,
            ready: None,
            local_addr: None,
            accept_task: None,
            next_connection_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Address the transport is listening on, once bound
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of peers currently connected
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    async fn accept_loop(
        listener: TcpListener,
        peers: Arc<RwLock<PeersMap>>,
        inbound_tx: mpsc::UnboundedSender<Multipart>,
        next_connection_id: Arc<AtomicU64>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    let connection_id = next_connection_id.fetch_add(1, Ordering::Relaxed);
                    debug!(remote = %remote, connection_id, "Accepted connection");
                    tokio::spawn(Self::serve_connection(
                        stream,
                        connection_id,
                        peers.clone(),
                        inbound_tx.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn serve_connection(
        stream: TcpStream,
        connection_id: u64,
        peers: Arc<RwLock<PeersMap>>,
        inbound_tx: mpsc::UnboundedSender<Multipart>,
    ) {
        let (mut reader, mut writer) = stream.into_split();

        let identity = match read_multipart(&mut reader).await {
            Ok(Some(frames)) if frames.len() == 1 && !frames[0].is_empty() => {
                PeerAddress::from(frames.into_iter().next().unwrap_or_default())
            }
            Ok(Some(frames)) => {
                warn!(
                    connection_id,
                    frames = frames.len(),
                    "Invalid handshake, closing connection"
                );
                return;
            }
            Ok(None) => return,
            Err(e) => {
                warn!(connection_id, error = %e, "Handshake failed");
                return;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Multipart>();
        let replaced = peers
            .write()
            .await
            .insert(identity.clone(), PeerHandle { connection_id, tx })
            .is_some();
        debug!(peer = %identity, connection_id, replaced, "Peer registered");

        let writer_identity = identity.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(frames) = rx.recv().await {
                if let Err(e) = write_multipart(&mut writer, &frames).await {
                    debug!(peer = %writer_identity, error = %e, "Write failed");
                    break;
                }
            }
        });

        loop {
            match read_multipart(&mut reader).await {
                Ok(Some(frames)) => {
                    let mut routed = Vec::with_capacity(frames.len() + 1);
                    routed.push(identity.as_bytes().to_vec());
                    routed.extend(frames);
                    if inbound_tx.send(routed).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(peer = %identity, error = %e, "Closing connection after read error");
                    break;
                }
            }
        }

        {
            let mut peers = peers.write().await;
            if peers
                .get(&identity)
                .is_some_and(|handle| handle.connection_id == connection_id)
            {
                peers.remove(&identity);
            }
        }
        writer_task.abort();
        debug!(peer = %identity, connection_id, "Peer disconnected");
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn bind(&mut self, endpoint: &str) -> BrokerResult<()> {
        if self.accept_task.is_some() {
            return Err(BrokerError::Transport(format!(
                "Transport already bound to {:?}",
                self.local_addr
            )));
        }

        let addr = endpoint_addr(endpoint)?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| BrokerError::Transport(format!("Failed to bind {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;

        info!(endpoint = %endpoint, local_addr = %local_addr, "Transport bound");

        self.local_addr = Some(local_addr);
        self.accept_task = Some(tokio::spawn(Self::accept_loop(
            listener,
            self.peers.clone(),
            self.inbound_tx.clone(),
            self.next_connection_id.clone(),
        )));
        Ok(())
    }

    async fn send_multipart(&mut self, frames: Multipart) -> BrokerResult<()> {
        let mut frames = frames.into_iter();
        let destination = frames
            .next()
            .map(PeerAddress::from)
            .ok_or_else(|| BrokerError::Transport("Cannot send an empty message".to_string()))?;

        let peers = self.peers.read().await;
        let handle = peers
            .get(&destination)
            .ok_or_else(|| BrokerError::PeerNotFound(destination.to_string()))?;
        handle
            .tx
            .send(frames.collect())
            .map_err(|_| BrokerError::PeerNotFound(destination.to_string()))
    }

    async fn recv_multipart(&mut self) -> BrokerResult<Option<Multipart>> {
        if let Some(frames) = self.ready.take() {
            return Ok(Some(frames));
        }
        match self.inbound_rx.try_recv() {
            Ok(frames) => Ok(Some(frames)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(BrokerError::Transport("Inbound channel closed".to_string()))
            }
        }
    }

    async fn poll_readable(&mut self, timeout: Duration) -> BrokerResult<bool> {
        if self.ready.is_some() {
            return Ok(true);
        }
        match tokio::time::timeout(timeout, self.inbound_rx.recv()).await {
            Ok(Some(frames)) => {
                self.ready = Some(frames);
                Ok(true)
            }
            Ok(None) => Err(BrokerError::Transport("Inbound channel closed".to_string())),
            Err(_) => Ok(false),
        }
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}
