//! The dispatch manager: one engine instance.
//!
//! A [`Manager`] owns the scan loop that picks due campaigns off the
//! store, the batch loop that drives each campaign's [`Pipe`] through its
//! subscriber pages, and the pool of delivery workers that rate-limit and
//! push rendered messages. Everything a campaign run needs lives behind
//! one [`Shared`] handle so pipes, workers and loops observe the same
//! registries.

use std::{sync::Arc, time::Duration};

use ahash::AHashMap;
use async_channel::{Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use broadside_common::{
    Signal, TenantId,
    campaign::{Campaign, CampaignStatus},
    config::Config,
    message::Message,
    messenger::{CampaignNotification, Messenger, NotificationSink},
    store::Store,
};

use crate::{
    error::{ConfigError, EngineError, QueueError},
    pipe::{CampaignMessage, CompiledCampaign, Pipe},
    rate::SlidingWindow,
    worker,
};

/// Capacity of the pipe resubmission queue.
const NEXT_PIPES_CAP: usize = 1000;

/// Live statistics for one running campaign.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CampStats {
    /// Messages per minute over the last rate window.
    pub send_rate: u64,
}

/// State shared between the manager's loops, its workers and its pipes.
pub(crate) struct Shared {
    pub(crate) cfg: Config,
    pub(crate) tenant_id: Option<TenantId>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) notifier: Arc<dyn NotificationSink>,

    pub(crate) messengers: RwLock<AHashMap<String, Arc<dyn Messenger>>>,
    pub(crate) pipes: RwLock<AHashMap<u64, Arc<Pipe>>>,
    pub(crate) templates: RwLock<AHashMap<u64, Arc<CompiledCampaign>>>,
    links: RwLock<AHashMap<String, String>>,

    pub(crate) sliding: Mutex<SlidingWindow>,

    next_pipes_tx: Sender<Arc<Pipe>>,
    next_pipes_rx: Receiver<Arc<Pipe>>,
    pub(crate) camp_tx: Sender<CampaignMessage>,
    pub(crate) camp_rx: Receiver<CampaignMessage>,
    msg_tx: Sender<Message>,
    pub(crate) msg_rx: Receiver<Message>,

    shutdown: broadcast::Sender<Signal>,
}

impl Shared {
    /// Deliver a campaign status notification, logging (never propagating)
    /// sink failures.
    pub(crate) async fn notify(&self, camp: &Campaign, status: CampaignStatus, reason: &str) {
        let mut subject = format!("{}: {}", title(status), camp.name);
        if let Some(tenant_id) = self.tenant_id {
            subject = format!("[tenant {tenant_id}] {subject}");
        }

        let data = CampaignNotification {
            tenant_id: self.tenant_id,
            campaign_id: camp.id,
            campaign_name: camp.name.clone(),
            status,
            sent: camp.sent,
            to_send: camp.to_send,
            reason: reason.to_string(),
        };

        if let Err(err) = self.notifier.notify(&subject, &data).await {
            warn!(campaign = %camp.name, error = %err, "error sending campaign notification");
        }
    }
}

fn title(status: CampaignStatus) -> String {
    let s = status.as_str();
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// One engine instance. Cheap to clone; all clones drive the same state.
#[derive(Clone)]
pub struct Manager {
    shared: Arc<Shared>,
}

impl Manager {
    #[must_use]
    pub fn new(
        cfg: Config,
        store: Arc<dyn Store>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self::with_tenant(None, cfg, store, notifier)
    }

    /// Create an instance bound to one tenant. Campaign messages carry the
    /// tenant id header and notifications name the tenant.
    #[must_use]
    pub fn with_tenant(
        tenant_id: Option<TenantId>,
        cfg: Config,
        store: Arc<dyn Store>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let cfg = cfg.normalised();

        // Queue depth absorbs one rate-window worth of messages per
        // worker without blocking the producer.
        let depth = cfg.concurrency * cfg.message_rate * 2;
        let (camp_tx, camp_rx) = async_channel::bounded(depth);
        let (msg_tx, msg_rx) = async_channel::bounded(depth);
        let (next_pipes_tx, next_pipes_rx) = async_channel::bounded(NEXT_PIPES_CAP);

        let sliding_rate = if cfg.sliding_window {
            cfg.sliding_window_rate
        } else {
            0
        };
        let sliding = Mutex::new(SlidingWindow::new(
            sliding_rate,
            Duration::from_secs(cfg.sliding_window_duration_secs),
        ));

        let (shutdown, _) = broadcast::channel(1);

        Self {
            shared: Arc::new(Shared {
                cfg,
                tenant_id,
                store,
                notifier,
                messengers: RwLock::new(AHashMap::new()),
                pipes: RwLock::new(AHashMap::new()),
                templates: RwLock::new(AHashMap::new()),
                links: RwLock::new(AHashMap::new()),
                sliding,
                next_pipes_tx,
                next_pipes_rx,
                camp_tx,
                camp_rx,
                msg_tx,
                msg_rx,
                shutdown,
            }),
        }
    }

    /// Register a delivery backend under its own name.
    pub fn add_messenger(&self, messenger: Arc<dyn Messenger>) -> Result<(), EngineError> {
        let name = messenger.name().to_string();
        let mut messengers = self.shared.messengers.write();
        if messengers.contains_key(&name) {
            return Err(ConfigError::DuplicateMessenger(name).into());
        }

        debug!(messenger = %name, "messenger loaded");
        messengers.insert(name, messenger);
        Ok(())
    }

    #[must_use]
    pub fn has_messenger(&self, name: &str) -> bool {
        self.shared.messengers.read().contains_key(name)
    }

    /// Run the instance until [`Manager::close`] is called: spawns the
    /// campaign scanner and the delivery workers, then drives campaign
    /// batching until the pipe queue closes.
    pub async fn run(&self) {
        let mut workers = Vec::with_capacity(self.shared.cfg.concurrency);
        for _ in 0..self.shared.cfg.concurrency {
            workers.push(tokio::spawn(worker::run(Arc::clone(&self.shared))));
        }

        if self.shared.cfg.scan_campaigns {
            let manager = self.clone();
            tokio::spawn(async move { manager.scan_loop().await });
        }

        while let Ok(pipe) = self.shared.next_pipes_rx.recv().await {
            match pipe.next_subscribers().await {
                Ok(true) => self.resubmit(pipe),
                Ok(false) => pipe.completion.finish_producing(),
                Err(err) => {
                    warn!(
                        campaign = %pipe.camp.name,
                        error = %err,
                        "error fetching subscriber batch, rescheduling"
                    );
                    self.resubmit_later(pipe);
                }
            }
        }

        for worker in workers {
            let _ = worker.await;
        }
    }

    /// Stop the instance: the scanner exits, the queues close, in-flight
    /// messages on the queues drain as discards when their pipes stop.
    pub fn close(&self) {
        let _ = self.shared.shutdown.send(Signal::Shutdown);
        self.shared.next_pipes_rx.close();
        self.shared.camp_rx.close();
        self.shared.msg_rx.close();
        info!(tenant = ?self.shared.tenant_id, "dispatch manager closed");
    }

    async fn scan_loop(&self) {
        let mut shutdown = self.shared.shutdown.subscribe();
        let mut tick =
            tokio::time::interval(Duration::from_secs(self.shared.cfg.scan_interval_secs));

        loop {
            tokio::select! {
                _ = tick.tick() => self.scan().await,
                _ = shutdown.recv() => break,
            }
        }
    }

    /// One scan tick: report delta sent counts for running campaigns,
    /// pick up newly due ones and start a pipe each.
    async fn scan(&self) {
        let (running, sent_counts) = self.running_deltas();

        let campaigns = match self
            .shared
            .store
            .next_campaigns(&running, &sent_counts)
            .await
        {
            Ok(campaigns) => campaigns,
            Err(err) => {
                error!(error = %err, "error scanning for campaigns");
                return;
            }
        };

        for camp in campaigns {
            // One live pipe per campaign id. The store query excludes
            // running ids, but the registry is the authority.
            if self.shared.pipes.read().contains_key(&camp.id) {
                debug!(campaign = %camp.name, "campaign already being processed, skipping");
                continue;
            }

            let camp_id = camp.id;
            let camp_name = camp.name.clone();
            let pipe = match Pipe::build(&self.shared, camp).await {
                Ok(pipe) => pipe,
                Err(err) => {
                    error!(
                        campaign = %camp_name,
                        error = %err,
                        "error creating pipe, cancelling campaign"
                    );
                    if let Err(err) = self
                        .shared
                        .store
                        .update_campaign_status(camp_id, CampaignStatus::Cancelled)
                        .await
                    {
                        error!(campaign = %camp_name, error = %err, "error cancelling campaign");
                    }
                    continue;
                }
            };

            info!(campaign = %camp_name, "start processing campaign");

            // Best-effort submission. On a full queue the pipe is torn
            // down again so the next scan can retry the campaign.
            if self.shared.next_pipes_tx.try_send(Arc::clone(&pipe)).is_ok() {
                pipe.spawn_cleanup();
            } else {
                warn!(campaign = %camp_name, "pipe queue full, deferring campaign to next scan");
                self.shared.pipes.write().remove(&camp_id);
            }
        }
    }

    /// Ids of the campaigns currently being processed, with the sent-count
    /// delta per campaign since the previous scan.
    fn running_deltas(&self) -> (Vec<u64>, Vec<u64>) {
        let pipes = self.shared.pipes.read();
        let mut ids = Vec::with_capacity(pipes.len());
        let mut deltas = Vec::with_capacity(pipes.len());
        for (id, pipe) in pipes.iter() {
            ids.push(*id);
            deltas.push(pipe.take_sent_delta());
        }
        (ids, deltas)
    }

    /// Requeue a pipe for its next batch. Falls back to a background send
    /// when the queue is momentarily full so a batching campaign never
    /// starves.
    fn resubmit(&self, pipe: Arc<Pipe>) {
        if let Err(async_channel::TrySendError::Full(pipe)) =
            self.shared.next_pipes_tx.try_send(pipe)
        {
            let tx = self.shared.next_pipes_tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(pipe).await;
            });
        }
    }

    /// Requeue a pipe after a store failure, one scan interval later.
    fn resubmit_later(&self, pipe: Arc<Pipe>) {
        let tx = self.shared.next_pipes_tx.clone();
        let delay = Duration::from_secs(self.shared.cfg.scan_interval_secs);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(pipe).await;
        });
    }

    /// Push an arbitrary (non-campaign) message onto the delivery queue,
    /// timing out rather than blocking the caller when the queue stays
    /// full.
    pub async fn push_message(&self, message: Message) -> Result<(), EngineError> {
        let timeout = Duration::from_secs(self.shared.cfg.push_timeout_secs);
        let subject = message.subject.clone();
        match tokio::time::timeout(timeout, self.shared.msg_tx.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(QueueError::Closed.into()),
            Err(_) => Err(QueueError::PushTimeout(subject).into()),
        }
    }

    /// Stop a running campaign. Its queued messages become discards and
    /// its status is left to whatever the store recorded.
    pub fn stop_campaign(&self, campaign_id: u64) {
        if let Some(pipe) = self.shared.pipes.read().get(&campaign_id) {
            pipe.stop();
        }
    }

    #[must_use]
    pub fn has_running_campaigns(&self) -> bool {
        !self.shared.pipes.read().is_empty()
    }

    /// Live statistics for one campaign, zeroed when it isn't running
    /// here.
    #[must_use]
    pub fn campaign_stats(&self, campaign_id: u64) -> CampStats {
        self.shared
            .pipes
            .read()
            .get(&campaign_id)
            .map(|pipe| CampStats {
                send_rate: pipe.rate.rate(),
            })
            .unwrap_or_default()
    }

    /// Swap a URL in campaign content for its tracking redirect. Tokens
    /// are registered with the store once and cached; on a store failure
    /// the original URL is returned untouched so content keeps rendering.
    pub async fn track_link(
        &self,
        url: &str,
        campaign_uuid: Uuid,
        subscriber_uuid: Uuid,
    ) -> String {
        let subscriber_uuid = if self.shared.cfg.individual_tracking {
            subscriber_uuid
        } else {
            Uuid::nil()
        };

        if let Some(token) = self.shared.links.read().get(url) {
            return self
                .shared
                .cfg
                .tracking_url(token, campaign_uuid, subscriber_uuid);
        }

        match self.shared.store.create_tracking_link(url).await {
            Ok(token) => {
                self.shared
                    .links
                    .write()
                    .insert(url.to_string(), token.clone());
                self.shared
                    .cfg
                    .tracking_url(&token, campaign_uuid, subscriber_uuid)
            }
            Err(err) => {
                warn!(url, error = %err, "error registering tracking link");
                url.to_string()
            }
        }
    }

    /// Pre-populate the compiled-template cache for a campaign. Pipes
    /// compile lazily, so this is only needed to push an updated template
    /// ahead of the next run.
    pub fn cache_template(&self, campaign_id: u64, tpls: Arc<CompiledCampaign>) {
        self.shared.templates.write().insert(campaign_id, tpls);
    }

    #[must_use]
    pub fn template(&self, campaign_id: u64) -> Option<Arc<CompiledCampaign>> {
        self.shared.templates.read().get(&campaign_id).cloned()
    }

    /// Drop a campaign's cached compiled templates, forcing a recompile on
    /// its next pipe.
    pub fn delete_template(&self, campaign_id: u64) {
        self.shared.templates.write().remove(&campaign_id);
    }
}
