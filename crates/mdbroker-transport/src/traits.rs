//! Transport trait definitions

use async_trait::async_trait;
use mdbroker_core::{BrokerResult, Multipart};
use std::time::Duration;

/// Addressable multi-peer socket used by the broker
///
/// Inbound messages carry the sender's address as their first frame;
/// outbound messages are routed by their first frame, which is stripped
/// before delivery.
#[async_trait]
pub trait Transport: Send {
    /// Start accepting peers on an endpoint such as `tcp://0.0.0.0:5555`
    async fn bind(&mut self, endpoint: &str) -> BrokerResult<()>;

    /// Queue a message for the peer named by its first frame; never blocks
    async fn send_multipart(&mut self, frames: Multipart) -> BrokerResult<()>;

    /// Take the next inbound message if one is ready; never blocks
    async fn recv_multipart(&mut self) -> BrokerResult<Option<Multipart>>;

    /// Wait up to `timeout` for an inbound message to become ready
    async fn poll_readable(&mut self, timeout: Duration) -> BrokerResult<bool>;

    /// Get the transport name
    fn name(&self) -> &'static str;
}
