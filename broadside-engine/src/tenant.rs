//! Multi-tenant orchestration.
//!
//! A [`TenantManager`] periodically discovers active tenants and runs one
//! fully isolated [`Manager`] instance per tenant: own config snapshot,
//! own queues, workers and rate limits, own messengers built from the
//! tenant's delivery credentials. A tenant that disappears from the store
//! has its instance closed and torn down on the next discovery pass.

use std::{sync::Arc, time::Duration};

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{error, info, warn};

use broadside_common::{
    Signal, TenantId,
    config::{Config, TenantConfig},
    messenger::{Messenger, NotificationSink},
    store::{BoundStore, TenantStore},
};

use crate::{
    error::EngineError,
    manager::{CampStats, Manager},
};

const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(300);

/// Builds the delivery backends for one tenant from its derived
/// configuration (credentials included). Called once per instance
/// creation; a failure skips the tenant until the next discovery pass.
#[async_trait]
pub trait MessengerProvider: Send + Sync {
    async fn messengers(
        &self,
        config: &TenantConfig,
    ) -> Result<Vec<Arc<dyn Messenger>>, EngineError>;
}

struct TenantInstance {
    manager: Manager,
    handle: JoinHandle<()>,
}

/// Supervisor owning one engine instance per active tenant.
pub struct TenantManager {
    cfg: Config,
    store: Arc<dyn TenantStore>,
    provider: Arc<dyn MessengerProvider>,
    notifier: Arc<dyn NotificationSink>,
    discovery_interval: Duration,

    instances: RwLock<AHashMap<TenantId, TenantInstance>>,
    shutdown: broadcast::Sender<Signal>,
}

impl TenantManager {
    #[must_use]
    pub fn new(
        cfg: Config,
        store: Arc<dyn TenantStore>,
        provider: Arc<dyn MessengerProvider>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            cfg,
            store,
            provider,
            notifier,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            instances: RwLock::new(AHashMap::new()),
            shutdown,
        }
    }

    /// Override the tenant discovery interval.
    #[must_use]
    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    /// Run discovery until [`TenantManager::close`] is called. The first
    /// pass runs immediately so instances exist before the first campaigns
    /// come due.
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut tick = tokio::time::interval(self.discovery_interval);

        loop {
            tokio::select! {
                _ = tick.tick() => self.discover().await,
                _ = shutdown.recv() => break,
            }
        }
    }

    /// One discovery pass: create instances for new tenants, tear down
    /// instances whose tenant is no longer active.
    async fn discover(&self) {
        let active = match self.store.active_tenants().await {
            Ok(ids) => ids,
            Err(err) => {
                error!(error = %err, "error discovering tenants");
                return;
            }
        };

        for tenant_id in &active {
            if self.instances.read().contains_key(tenant_id) {
                continue;
            }
            if let Err(err) = self.create_instance(*tenant_id).await {
                error!(tenant = tenant_id, error = %err, "error creating tenant instance");
            }
        }

        let stale: Vec<TenantId> = self
            .instances
            .read()
            .keys()
            .filter(|id| !active.contains(id))
            .copied()
            .collect();

        for tenant_id in stale {
            info!(tenant = tenant_id, "tenant no longer active, closing instance");
            self.remove_instance(tenant_id).await;
        }
    }

    async fn create_instance(&self, tenant_id: TenantId) -> Result<(), EngineError> {
        let settings = self.store.tenant_settings(tenant_id).await?;
        let tenant_cfg = TenantConfig::derive(&self.cfg, tenant_id, &settings);

        let messengers = self.provider.messengers(&tenant_cfg).await?;

        let store = Arc::new(BoundStore::new(Arc::clone(&self.store), tenant_id));
        let manager = Manager::with_tenant(
            Some(tenant_id),
            tenant_cfg.config,
            store,
            Arc::clone(&self.notifier),
        );
        for messenger in messengers {
            manager.add_messenger(messenger)?;
        }

        let runner = manager.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        info!(tenant = tenant_id, "tenant instance started");
        self.instances
            .write()
            .insert(tenant_id, TenantInstance { manager, handle });
        Ok(())
    }

    async fn remove_instance(&self, tenant_id: TenantId) {
        let instance = self.instances.write().remove(&tenant_id);
        if let Some(instance) = instance {
            instance.manager.close();
            if let Err(err) = instance.handle.await {
                warn!(tenant = tenant_id, error = %err, "tenant instance exited abnormally");
            }
        }
    }

    /// Stop a campaign on whichever tenant instance is running it.
    pub fn stop_campaign(&self, tenant_id: TenantId, campaign_id: u64) {
        if let Some(instance) = self.instances.read().get(&tenant_id) {
            instance.manager.stop_campaign(campaign_id);
        }
    }

    /// Live statistics for one tenant's campaign; zeroed when the tenant
    /// or campaign isn't running.
    #[must_use]
    pub fn campaign_stats(&self, tenant_id: TenantId, campaign_id: u64) -> CampStats {
        self.instances
            .read()
            .get(&tenant_id)
            .map(|instance| instance.manager.campaign_stats(campaign_id))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_running_campaigns(&self) -> bool {
        self.instances
            .read()
            .values()
            .any(|instance| instance.manager.has_running_campaigns())
    }

    /// Tenants with a live instance.
    #[must_use]
    pub fn tenant_ids(&self) -> Vec<TenantId> {
        self.instances.read().keys().copied().collect()
    }

    /// Stop discovery and close every tenant instance, waiting for each
    /// instance's loops and workers to drain.
    pub async fn close(&self) {
        let _ = self.shutdown.send(Signal::Shutdown);

        let ids = self.tenant_ids();
        for tenant_id in ids {
            self.remove_instance(tenant_id).await;
        }
        info!("tenant manager closed");
    }
}
