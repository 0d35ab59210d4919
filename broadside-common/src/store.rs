//! The persistence seam.
//!
//! The engine never talks to a database directly; it consumes a [`Store`]
//! (or, multi-tenant, a [`TenantStore`]) that supplies due campaigns,
//! subscriber batches and attachments, and receives status and counter
//! updates. [`BoundStore`] adapts a tenant-aware store to the
//! single-tenant shape by binding a fixed tenant id — that adapter is also
//! how each tenant instance is pinned to its own data partition.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    TenantId,
    campaign::{Attachment, Campaign, CampaignStatus},
    config::TenantSettings,
    subscriber::Subscriber,
};

/// An error surfaced by a Store implementation.
///
/// The engine treats these as transient: a failed batch fetch is logged
/// and retried on the next tick, never escalated into campaign state.
#[derive(Debug, Clone, Error)]
#[error("store error: {0}")]
pub struct StoreError(String);

impl StoreError {
    #[must_use]
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

/// Campaign and subscriber persistence, single-tenant shape.
#[async_trait]
pub trait Store: Send + Sync {
    /// Campaigns that are due to run, excluding `running` ids. `sent_counts`
    /// carries the *delta* sent count per running campaign so the store can
    /// accumulate rather than overwrite.
    async fn next_campaigns(
        &self,
        running: &[u64],
        sent_counts: &[u64],
    ) -> Result<Vec<Campaign>, StoreError>;

    /// Up to `limit` subscribers for `campaign_id` after the campaign's
    /// current watermark. An empty result ends batching.
    async fn next_subscribers(
        &self,
        campaign_id: u64,
        limit: usize,
    ) -> Result<Vec<Subscriber>, StoreError>;

    async fn campaign(&self, campaign_id: u64) -> Result<Campaign, StoreError>;

    async fn attachment(&self, media_id: u64) -> Result<Attachment, StoreError>;

    async fn update_campaign_status(
        &self,
        campaign_id: u64,
        status: CampaignStatus,
    ) -> Result<(), StoreError>;

    async fn update_campaign_counts(
        &self,
        campaign_id: u64,
        to_send: u64,
        sent: u64,
        last_subscriber_id: u64,
    ) -> Result<(), StoreError>;

    /// Register a URL for click tracking, returning its token.
    async fn create_tracking_link(&self, url: &str) -> Result<String, StoreError>;

    async fn blocklist_subscriber(&self, subscriber_id: u64) -> Result<(), StoreError>;

    async fn delete_subscriber(&self, subscriber_id: u64) -> Result<(), StoreError>;
}

/// Tenant-aware persistence: every operation is scoped to one tenant's
/// isolated data partition, plus tenant discovery and settings lookup.
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Tenants that currently have runnable work.
    async fn active_tenants(&self) -> Result<Vec<TenantId>, StoreError>;

    /// Per-tenant configuration overrides and delivery credentials.
    async fn tenant_settings(&self, tenant_id: TenantId) -> Result<TenantSettings, StoreError>;

    async fn next_campaigns(
        &self,
        tenant_id: TenantId,
        running: &[u64],
        sent_counts: &[u64],
    ) -> Result<Vec<Campaign>, StoreError>;

    async fn next_subscribers(
        &self,
        tenant_id: TenantId,
        campaign_id: u64,
        limit: usize,
    ) -> Result<Vec<Subscriber>, StoreError>;

    async fn campaign(&self, tenant_id: TenantId, campaign_id: u64)
    -> Result<Campaign, StoreError>;

    async fn attachment(
        &self,
        tenant_id: TenantId,
        media_id: u64,
    ) -> Result<Attachment, StoreError>;

    async fn update_campaign_status(
        &self,
        tenant_id: TenantId,
        campaign_id: u64,
        status: CampaignStatus,
    ) -> Result<(), StoreError>;

    async fn update_campaign_counts(
        &self,
        tenant_id: TenantId,
        campaign_id: u64,
        to_send: u64,
        sent: u64,
        last_subscriber_id: u64,
    ) -> Result<(), StoreError>;

    async fn create_tracking_link(
        &self,
        tenant_id: TenantId,
        url: &str,
    ) -> Result<String, StoreError>;

    async fn blocklist_subscriber(
        &self,
        tenant_id: TenantId,
        subscriber_id: u64,
    ) -> Result<(), StoreError>;

    async fn delete_subscriber(
        &self,
        tenant_id: TenantId,
        subscriber_id: u64,
    ) -> Result<(), StoreError>;
}

/// A [`TenantStore`] with a fixed tenant id bound, satisfying the
/// single-tenant [`Store`] shape.
#[derive(Clone)]
pub struct BoundStore {
    store: Arc<dyn TenantStore>,
    tenant_id: TenantId,
}

impl BoundStore {
    #[must_use]
    pub fn new(store: Arc<dyn TenantStore>, tenant_id: TenantId) -> Self {
        Self { store, tenant_id }
    }

    #[must_use]
    pub const fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

#[async_trait]
impl Store for BoundStore {
    async fn next_campaigns(
        &self,
        running: &[u64],
        sent_counts: &[u64],
    ) -> Result<Vec<Campaign>, StoreError> {
        self.store
            .next_campaigns(self.tenant_id, running, sent_counts)
            .await
    }

    async fn next_subscribers(
        &self,
        campaign_id: u64,
        limit: usize,
    ) -> Result<Vec<Subscriber>, StoreError> {
        self.store
            .next_subscribers(self.tenant_id, campaign_id, limit)
            .await
    }

    async fn campaign(&self, campaign_id: u64) -> Result<Campaign, StoreError> {
        self.store.campaign(self.tenant_id, campaign_id).await
    }

    async fn attachment(&self, media_id: u64) -> Result<Attachment, StoreError> {
        self.store.attachment(self.tenant_id, media_id).await
    }

    async fn update_campaign_status(
        &self,
        campaign_id: u64,
        status: CampaignStatus,
    ) -> Result<(), StoreError> {
        self.store
            .update_campaign_status(self.tenant_id, campaign_id, status)
            .await
    }

    async fn update_campaign_counts(
        &self,
        campaign_id: u64,
        to_send: u64,
        sent: u64,
        last_subscriber_id: u64,
    ) -> Result<(), StoreError> {
        self.store
            .update_campaign_counts(self.tenant_id, campaign_id, to_send, sent, last_subscriber_id)
            .await
    }

    async fn create_tracking_link(&self, url: &str) -> Result<String, StoreError> {
        self.store.create_tracking_link(self.tenant_id, url).await
    }

    async fn blocklist_subscriber(&self, subscriber_id: u64) -> Result<(), StoreError> {
        self.store
            .blocklist_subscriber(self.tenant_id, subscriber_id)
            .await
    }

    async fn delete_subscriber(&self, subscriber_id: u64) -> Result<(), StoreError> {
        self.store
            .delete_subscriber(self.tenant_id, subscriber_id)
            .await
    }
}
