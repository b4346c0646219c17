//! Peer-side TCP connection used by clients and workers

use mdbroker_core::{BrokerError, BrokerResult, Multipart, PeerAddress};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::wire::{endpoint_addr, read_multipart, write_multipart};

/// A connection to a `TcpTransport` under a fixed identity
///
/// Inbound messages are read on a background task, so `recv` is safe to use
/// inside `tokio::select!`.
pub struct TcpPeer {
    identity: PeerAddress,
    writer: OwnedWriteHalf,
    inbound_rx: mpsc::UnboundedReceiver<Multipart>,
    reader_task: JoinHandle<()>,
}

impl TcpPeer {
    /// Connect and announce `identity`
    pub async fn connect(endpoint: &str, identity: PeerAddress) -> BrokerResult<Self> {
        let addr = endpoint_addr(endpoint)?;
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| BrokerError::Transport(format!("Failed to connect to {}: {}", addr, e)))?;
        stream.set_nodelay(true)?;

        let (mut reader, mut writer) = stream.into_split();
        write_multipart(&mut writer, &[identity.as_bytes().to_vec()]).await?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let reader_identity = identity.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_multipart(&mut reader).await {
                    Ok(Some(frames)) => {
                        if inbound_tx.send(frames).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(peer = %reader_identity, "Connection closed by remote");
                        break;
                    }
                    Err(e) => {
                        warn!(peer = %reader_identity, error = %e, "Read failed");
                        break;
                    }
                }
            }
        });

        debug!(peer = %identity, endpoint = %endpoint, "Connected");

        Ok(Self {
            identity,
            writer,
            inbound_rx,
            reader_task,
        })
    }

    /// Identity announced on connect
    pub fn identity(&self) -> &PeerAddress {
        &self.identity
    }

    /// Send one message
    pub async fn send(&mut self, frames: Multipart) -> BrokerResult<()> {
        write_multipart(&mut self.writer, &frames).await
    }

    /// Receive the next message; `Ok(None)` once the connection is closed
    pub async fn recv(&mut self) -> BrokerResult<Option<Multipart>> {
        Ok(self.inbound_rx.recv().await)
    }
}

impl Drop for TcpPeer {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
