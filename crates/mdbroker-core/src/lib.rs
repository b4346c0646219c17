//! mdbroker-core: Core types for the mdbroker request/reply broker
//!
//! This crate provides the fundamental types used throughout mdbroker:
//! - Wire protocol roles, commands and the frame codec
//! - Worker and service records with liveness bookkeeping
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod model;
pub mod protocol;

pub use config::*;
pub use error::*;
pub use model::*;
pub use protocol::*;
