//! The delivery and notification seams.

use async_trait::async_trait;

use crate::{TenantId, campaign::CampaignStatus, message::Message};

/// A delivery backend (outbound mail transport, SMS gateway, ...).
///
/// The engine selects a messenger by the campaign's declared backend
/// name; an unresolvable name permanently cancels the campaign.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Identifier campaigns select this backend by.
    fn name(&self) -> &str;

    /// Attempt delivery of one fully assembled message.
    async fn push(&self, message: Message) -> anyhow::Result<()>;

    /// Flush any buffered deliveries.
    async fn flush(&self) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// Structured payload accompanying a campaign status notification.
#[derive(Debug, Clone)]
pub struct CampaignNotification {
    pub tenant_id: Option<TenantId>,
    pub campaign_id: u64,
    pub campaign_name: String,
    pub status: CampaignStatus,
    pub sent: u64,
    pub to_send: u64,
    /// Human-readable reason, e.g. "Too many errors". Empty on natural
    /// completion.
    pub reason: String,
}

/// Sink for operator-facing campaign notifications (pause on error
/// threshold, natural completion). Failures to notify are logged by the
/// engine, never fatal.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, subject: &str, data: &CampaignNotification) -> anyhow::Result<()>;
}

/// A sink that drops every notification. Useful as a default and in
/// instances that should stay silent.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotificationSink;

#[async_trait]
impl NotificationSink for NullNotificationSink {
    async fn notify(&self, _subject: &str, _data: &CampaignNotification) -> anyhow::Result<()> {
        Ok(())
    }
}
