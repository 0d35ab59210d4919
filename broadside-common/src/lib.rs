//! Shared types and interfaces for the broadside campaign dispatch engine
//!
//! This crate holds everything the engine and the surrounding application
//! agree on: the campaign/subscriber data model, the `Store` and
//! `Messenger` seams, configuration types, and logging initialisation.

pub mod campaign;
pub mod config;
pub mod logging;
pub mod message;
pub mod messenger;
pub mod store;
pub mod subscriber;
pub mod template;

pub use tracing;

/// A tenant identifier. Tenant *identification* (subdomain parsing etc.)
/// happens upstream; the engine only ever carries the resolved id.
pub type TenantId = u64;

/// Control signal broadcast to the engine's long-lived tasks.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
}
