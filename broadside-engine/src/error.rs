//! Typed error handling for the dispatch engine.
//!
//! The taxonomy mirrors how failures are acted on:
//! - Configuration errors are permanent: the campaign is cancelled, never
//!   retried.
//! - Render errors affect one subscriber: logged, that subscriber skipped.
//! - Store errors abandon the current tick and are retried on the next
//!   scheduled one.
//! - Queue errors cover push timeouts and closed queues during shutdown.

use thiserror::Error;

use broadside_common::{TenantId, store::StoreError, template::RenderError};

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Permanent configuration failure. Cancels the affected campaign.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Template failure for a single subscriber. Skip them, continue the
    /// batch.
    #[error("render error: {0}")]
    Render(#[from] RenderError),

    /// Store failure. The attempt is abandoned for this tick and retried
    /// on the next one.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Queue failure while pushing or during shutdown.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Permanent failures that cancel a campaign or abort instance creation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The campaign names a delivery backend this instance doesn't have.
    #[error("unknown messenger '{messenger}' on campaign '{campaign}'")]
    UnknownMessenger { messenger: String, campaign: String },

    /// A messenger with this name is already registered.
    #[error("messenger '{0}' is already loaded")]
    DuplicateMessenger(String),

    /// A tenant has no delivery credentials configured.
    #[error("missing delivery credentials for tenant {0}")]
    MissingCredentials(TenantId),
}

/// Failures on the engine's internal queues.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue stayed full past the configured push timeout.
    #[error("message push timed out: '{0}'")]
    PushTimeout(String),

    /// The queue was closed; the instance is shutting down.
    #[error("queue closed")]
    Closed,
}

impl EngineError {
    /// `true` for failures that must not be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// `true` for failures scoped to a single subscriber.
    #[must_use]
    pub const fn is_render(&self) -> bool {
        matches!(self, Self::Render(_))
    }
}
