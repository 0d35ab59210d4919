//! Bulk-campaign dispatch engine.
//!
//! The engine turns due campaigns from a [`Store`] into rendered,
//! rate-limited deliveries through pluggable [`Messenger`] backends. A
//! single-tenant deployment drives one [`Manager`]; a multi-tenant one
//! puts a [`TenantManager`] in front, which runs an isolated manager per
//! active tenant.
//!
//! [`Store`]: broadside_common::store::Store
//! [`Messenger`]: broadside_common::messenger::Messenger

pub mod completion;
pub mod error;
pub mod manager;
pub mod pipe;
pub mod rate;
pub mod tenant;

mod worker;

pub use error::{ConfigError, EngineError, QueueError};
pub use manager::{CampStats, Manager};
pub use pipe::{CompiledCampaign, Pipe, PipeState};
pub use tenant::{MessengerProvider, TenantManager};
