//! mdbroker-broker: Majordomo broker for mdbroker
//!
//! This crate provides the broker that sits between clients and workers:
//! - The single-threaded event loop
//! - Client and worker message handling
//! - Worker liveness tracking and purging
//! - Round-robin dispatch of queued requests

pub mod broker;
pub mod dispatcher;
mod handlers;
pub mod registry;

pub use broker::Broker;
pub use dispatcher::Assignment;
pub use registry::{Heartbeat, Registration, Registry};
