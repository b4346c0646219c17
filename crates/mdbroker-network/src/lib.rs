//! mdbroker-network: Service discovery registration
//!
//! This crate provides the registrator the broker calls once per loop
//! iteration to announce itself:
//! - The `Registrator` trait
//! - An HTTP registrator posting announcements to a discovery URL
//! - A no-op registrator for standalone brokers

pub mod registrator;

pub use registrator::{Announcement, HttpRegistrator, NoopRegistrator, Registrator};
