//! mdbroker-transport: Multi-peer message transports
//!
//! This crate provides the addressable socket abstraction the broker runs on:
//! - The `Transport` trait consumed by the broker loop
//! - A TCP router transport that routes by peer identity
//! - A TCP peer connection for clients and workers
//! - An in-memory transport for embedding and tests

pub mod memory;
pub mod peer;
pub mod tcp;
pub mod traits;
pub mod wire;

pub use memory::MemoryTransport;
pub use peer::TcpPeer;
pub use tcp::TcpTransport;
pub use traits::Transport;
