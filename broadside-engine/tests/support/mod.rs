//! In-memory store, messenger and notification doubles for engine tests.
#![allow(dead_code)] // Test utility module - not all helpers used in every test
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

use broadside_common::{
    TenantId,
    campaign::{Attachment, Campaign, CampaignStatus, ContentType},
    config::TenantSettings,
    message::Message,
    messenger::{CampaignNotification, Messenger, NotificationSink},
    store::{Store, StoreError, TenantStore},
    subscriber::Subscriber,
};

/// Poll `cond` until it holds, panicking after a generous virtual-time
/// deadline. Meant for `start_paused` tests where sleeps are instant.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

pub fn subscriber(id: u64) -> Subscriber {
    Subscriber {
        id,
        uuid: Uuid::new_v4(),
        email: format!("sub{id}@example.com"),
        name: format!("Subscriber {id}"),
        attribs: AHashMap::new(),
    }
}

pub fn campaign(id: u64, name: &str) -> Campaign {
    Campaign {
        id,
        uuid: Uuid::new_v4(),
        name: name.to_string(),
        subject: "Hello {{ name }}".to_string(),
        body: "Hi {{ name }}, unsubscribe at {{ unsubscribe_url }}".to_string(),
        alt_body: None,
        from_email: None,
        messenger: "email".to_string(),
        content_type: ContentType::Html,
        media_ids: Vec::new(),
        attachments: Vec::new(),
        to_send: 0,
        sent: 0,
        last_subscriber_id: 0,
        status: CampaignStatus::Running,
        headers: Vec::new(),
    }
}

#[derive(Default)]
struct StoreState {
    campaigns: Vec<Campaign>,
    subscribers: AHashMap<u64, VecDeque<Subscriber>>,
    status_log: Vec<(u64, CampaignStatus)>,
    sent_total: AHashMap<u64, u64>,
    watermarks: AHashMap<u64, u64>,
    links: Vec<String>,
    batch_sizes: AHashMap<u64, Vec<usize>>,
}

/// In-memory [`Store`]: campaigns with a queue of pending subscribers
/// each, plus a log of every status transition the engine writes.
#[derive(Default)]
pub struct MockStore {
    state: Mutex<StoreState>,
}

impl MockStore {
    pub fn add_campaign(&self, camp: Campaign, subscribers: Vec<Subscriber>) {
        let mut state = self.state.lock();
        state.subscribers.insert(camp.id, subscribers.into());
        state.campaigns.push(camp);
    }

    pub fn status_log(&self, campaign_id: u64) -> Vec<CampaignStatus> {
        self.state
            .lock()
            .status_log
            .iter()
            .filter(|(id, _)| *id == campaign_id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn sent_total(&self, campaign_id: u64) -> u64 {
        self.state
            .lock()
            .sent_total
            .get(&campaign_id)
            .copied()
            .unwrap_or(0)
    }

    /// Sizes of the subscriber batches handed out for a campaign, in
    /// fetch order.
    pub fn batch_sizes(&self, campaign_id: u64) -> Vec<usize> {
        self.state
            .lock()
            .batch_sizes
            .get(&campaign_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn watermark(&self, campaign_id: u64) -> u64 {
        self.state
            .lock()
            .watermarks
            .get(&campaign_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Store for MockStore {
    async fn next_campaigns(
        &self,
        running: &[u64],
        sent_counts: &[u64],
    ) -> Result<Vec<Campaign>, StoreError> {
        let mut state = self.state.lock();

        for (id, delta) in running.iter().zip(sent_counts) {
            *state.sent_total.entry(*id).or_insert(0) += delta;
        }

        Ok(state
            .campaigns
            .iter()
            .filter(|camp| {
                matches!(
                    camp.status,
                    CampaignStatus::Running | CampaignStatus::Scheduled
                ) && !running.contains(&camp.id)
            })
            .cloned()
            .collect())
    }

    async fn next_subscribers(
        &self,
        campaign_id: u64,
        limit: usize,
    ) -> Result<Vec<Subscriber>, StoreError> {
        let mut state = self.state.lock();
        let queue = state
            .subscribers
            .get_mut(&campaign_id)
            .ok_or_else(|| StoreError::new("unknown campaign"))?;

        let n = queue.len().min(limit);
        let batch: Vec<Subscriber> = queue.drain(..n).collect();
        state
            .batch_sizes
            .entry(campaign_id)
            .or_default()
            .push(batch.len());
        Ok(batch)
    }

    async fn campaign(&self, campaign_id: u64) -> Result<Campaign, StoreError> {
        let state = self.state.lock();
        let mut camp = state
            .campaigns
            .iter()
            .find(|camp| camp.id == campaign_id)
            .cloned()
            .ok_or_else(|| StoreError::new("unknown campaign"))?;
        camp.sent = state.sent_total.get(&campaign_id).copied().unwrap_or(0);
        Ok(camp)
    }

    async fn attachment(&self, media_id: u64) -> Result<Attachment, StoreError> {
        Ok(Attachment {
            name: format!("media-{media_id}.pdf"),
            content_type: "application/pdf".to_string(),
            content: vec![0x25, 0x50, 0x44, 0x46],
        })
    }

    async fn update_campaign_status(
        &self,
        campaign_id: u64,
        status: CampaignStatus,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.status_log.push((campaign_id, status));
        if let Some(camp) = state
            .campaigns
            .iter_mut()
            .find(|camp| camp.id == campaign_id)
        {
            camp.status = status;
        }
        Ok(())
    }

    async fn update_campaign_counts(
        &self,
        campaign_id: u64,
        _to_send: u64,
        sent: u64,
        last_subscriber_id: u64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        *state.sent_total.entry(campaign_id).or_insert(0) += sent;
        let watermark = state.watermarks.entry(campaign_id).or_insert(0);
        *watermark = (*watermark).max(last_subscriber_id);
        Ok(())
    }

    async fn create_tracking_link(&self, url: &str) -> Result<String, StoreError> {
        let mut state = self.state.lock();
        state.links.push(url.to_string());
        Ok(format!("tok{}", state.links.len()))
    }

    async fn blocklist_subscriber(&self, _subscriber_id: u64) -> Result<(), StoreError> {
        Ok(())
    }

    async fn delete_subscriber(&self, _subscriber_id: u64) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Messenger double: records pushed messages, optionally fails every
/// push, optionally blocks pushes behind a gate until the test opens it.
pub struct RecordingMessenger {
    name: String,
    pub sent: Mutex<Vec<Message>>,
    fail: AtomicBool,
    attempts: AtomicUsize,
    gate: Option<watch::Receiver<bool>>,
}

impl RecordingMessenger {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            sent: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            gate: None,
        }
    }

    /// Every push fails with a permanent-looking delivery error.
    pub fn failing(name: &str) -> Self {
        let mut messenger = Self::new(name);
        messenger.fail.store(true, Ordering::Release);
        messenger
    }

    /// Pushes block until the returned sender publishes `true`.
    pub fn gated(name: &str) -> (Self, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let mut messenger = Self::new(name);
        messenger.gate = Some(rx);
        (messenger, tx)
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, message: Message) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::AcqRel);

        if let Some(gate) = &self.gate {
            let mut gate = gate.clone();
            while !*gate.borrow() {
                gate.changed().await?;
            }
        }

        if self.fail.load(Ordering::Acquire) {
            anyhow::bail!("recipient refused");
        }

        self.sent.lock().push(message);
        Ok(())
    }

    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Notification sink double recording every (subject, payload) pair.
#[derive(Default)]
pub struct RecordingSink {
    pub notifications: Mutex<Vec<(String, CampaignNotification)>>,
}

impl RecordingSink {
    pub fn count(&self) -> usize {
        self.notifications.lock().len()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, subject: &str, data: &CampaignNotification) -> anyhow::Result<()> {
        self.notifications
            .lock()
            .push((subject.to_string(), data.clone()));
        Ok(())
    }
}

/// Tenant store double: one [`MockStore`] per tenant plus a mutable list
/// of active tenants.
#[derive(Default)]
pub struct MockTenantStore {
    tenants: Mutex<AHashMap<TenantId, Arc<MockStore>>>,
    settings: Mutex<AHashMap<TenantId, TenantSettings>>,
    active: Mutex<Vec<TenantId>>,
}

impl MockTenantStore {
    pub fn add_tenant(&self, tenant_id: TenantId, settings: TenantSettings) -> Arc<MockStore> {
        let store = Arc::new(MockStore::default());
        self.tenants.lock().insert(tenant_id, Arc::clone(&store));
        self.settings.lock().insert(tenant_id, settings);
        self.active.lock().push(tenant_id);
        store
    }

    pub fn deactivate(&self, tenant_id: TenantId) {
        self.active.lock().retain(|id| *id != tenant_id);
    }

    fn tenant(&self, tenant_id: TenantId) -> Result<Arc<MockStore>, StoreError> {
        self.tenants
            .lock()
            .get(&tenant_id)
            .cloned()
            .ok_or_else(|| StoreError::new(format!("unknown tenant {tenant_id}")))
    }
}

#[async_trait]
impl TenantStore for MockTenantStore {
    async fn active_tenants(&self) -> Result<Vec<TenantId>, StoreError> {
        Ok(self.active.lock().clone())
    }

    async fn tenant_settings(&self, tenant_id: TenantId) -> Result<TenantSettings, StoreError> {
        self.settings
            .lock()
            .get(&tenant_id)
            .cloned()
            .ok_or_else(|| StoreError::new(format!("unknown tenant {tenant_id}")))
    }

    async fn next_campaigns(
        &self,
        tenant_id: TenantId,
        running: &[u64],
        sent_counts: &[u64],
    ) -> Result<Vec<Campaign>, StoreError> {
        self.tenant(tenant_id)?
            .next_campaigns(running, sent_counts)
            .await
    }

    async fn next_subscribers(
        &self,
        tenant_id: TenantId,
        campaign_id: u64,
        limit: usize,
    ) -> Result<Vec<Subscriber>, StoreError> {
        self.tenant(tenant_id)?
            .next_subscribers(campaign_id, limit)
            .await
    }

    async fn campaign(
        &self,
        tenant_id: TenantId,
        campaign_id: u64,
    ) -> Result<Campaign, StoreError> {
        self.tenant(tenant_id)?.campaign(campaign_id).await
    }

    async fn attachment(
        &self,
        tenant_id: TenantId,
        media_id: u64,
    ) -> Result<Attachment, StoreError> {
        self.tenant(tenant_id)?.attachment(media_id).await
    }

    async fn update_campaign_status(
        &self,
        tenant_id: TenantId,
        campaign_id: u64,
        status: CampaignStatus,
    ) -> Result<(), StoreError> {
        self.tenant(tenant_id)?
            .update_campaign_status(campaign_id, status)
            .await
    }

    async fn update_campaign_counts(
        &self,
        tenant_id: TenantId,
        campaign_id: u64,
        to_send: u64,
        sent: u64,
        last_subscriber_id: u64,
    ) -> Result<(), StoreError> {
        self.tenant(tenant_id)?
            .update_campaign_counts(campaign_id, to_send, sent, last_subscriber_id)
            .await
    }

    async fn create_tracking_link(
        &self,
        tenant_id: TenantId,
        url: &str,
    ) -> Result<String, StoreError> {
        self.tenant(tenant_id)?.create_tracking_link(url).await
    }

    async fn blocklist_subscriber(
        &self,
        tenant_id: TenantId,
        subscriber_id: u64,
    ) -> Result<(), StoreError> {
        self.tenant(tenant_id)?
            .blocklist_subscriber(subscriber_id)
            .await
    }

    async fn delete_subscriber(
        &self,
        tenant_id: TenantId,
        subscriber_id: u64,
    ) -> Result<(), StoreError> {
        self.tenant(tenant_id)?.delete_subscriber(subscriber_id).await
    }
}
