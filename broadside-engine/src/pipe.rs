//! The per-campaign state machine.
//!
//! A [`Pipe`] is created when the manager picks up a due campaign and is
//! destroyed once every in-flight message for it has been accounted for.
//! It moves through: batching (fetching and enqueuing subscriber pages) →
//! draining (waiting on in-flight messages) → one terminal outcome:
//! finished, paused (error threshold) or stopped (manual cancel).

use std::sync::{
    Arc,
    atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering},
};

use tracing::{debug, error, info, warn};

use broadside_common::{
    campaign::{Campaign, CampaignStatus},
    subscriber::Subscriber,
    template::{RenderContext, Template},
};

use crate::{
    completion::Completion,
    error::{ConfigError, EngineError},
    manager::Shared,
    rate::RateCounter,
};

/// Halt state of a pipe. `Running` transitions at most once, to either
/// `Stopped` (manual cancel, no alert) or `Halted` (error threshold
/// exceeded, pauses the campaign and alerts). Keeping these as one
/// explicit state removes any ambiguity when both could apply in the
/// same tick: the first transition wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipeState {
    Running = 0,
    Stopped = 1,
    Halted = 2,
}

impl PipeState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Stopped,
            2 => Self::Halted,
            _ => Self::Running,
        }
    }
}

/// A campaign's lazily-compiled templates, cached per instance.
#[derive(Debug)]
pub struct CompiledCampaign {
    pub subject: Template,
    pub body: Template,
    pub alt_body: Option<Template>,
}

impl CompiledCampaign {
    pub fn compile(campaign: &Campaign) -> Result<Self, EngineError> {
        let alt_body = match (&campaign.alt_body, campaign.content_type) {
            // Plain campaigns have no separate alternative body.
            (_, broadside_common::campaign::ContentType::Plain) | (None, _) => None,
            (Some(source), _) => Some(Template::compile(source)?),
        };

        Ok(Self {
            subject: Template::compile(&campaign.subject)?,
            body: Template::compile(&campaign.body)?,
            alt_body,
        })
    }
}

/// One rendered (campaign, subscriber) message travelling from the
/// batching producer to a delivery worker. Never persisted.
pub(crate) struct CampaignMessage {
    pub(crate) pipe: Arc<Pipe>,
    pub(crate) subscriber: Subscriber,
    pub(crate) from: String,
    pub(crate) to: String,
    pub(crate) subject: String,
    pub(crate) body: Vec<u8>,
    pub(crate) alt_body: Option<Vec<u8>>,
    pub(crate) unsub_url: String,
}

/// Runtime state for one running campaign.
pub struct Pipe {
    pub(crate) camp: Campaign,
    pub(crate) tpls: Arc<CompiledCampaign>,
    pub(crate) rate: RateCounter,
    pub(crate) completion: Completion,

    /// Messages delivered since the last scan reported a delta.
    sent: AtomicU64,
    /// Watermark: highest subscriber id confirmed processed. Only ever
    /// advances, even across concurrently-completing workers.
    last_id: AtomicU64,
    errors: AtomicUsize,
    state: AtomicU8,

    shared: Arc<Shared>,
}

impl Pipe {
    /// Build a pipe for a due campaign: resolve its messenger, compile its
    /// templates, load its attachments and register it in the instance's
    /// pipe registry. Any failure here is permanent for this run — the
    /// caller cancels the campaign.
    pub(crate) async fn build(
        shared: &Arc<Shared>,
        mut camp: Campaign,
    ) -> Result<Arc<Self>, EngineError> {
        if !shared.messengers.read().contains_key(&camp.messenger) {
            return Err(ConfigError::UnknownMessenger {
                messenger: camp.messenger.clone(),
                campaign: camp.name.clone(),
            }
            .into());
        }

        let tpls = {
            let cached = shared.templates.read().get(&camp.id).cloned();
            match cached {
                Some(tpls) => tpls,
                None => {
                    let tpls = Arc::new(CompiledCampaign::compile(&camp)?);
                    shared
                        .templates
                        .write()
                        .insert(camp.id, Arc::clone(&tpls));
                    tpls
                }
            }
        };

        for media_id in camp.media_ids.clone() {
            let attachment = shared.store.attachment(media_id).await?;
            camp.attachments.push(attachment);
        }

        let pipe = Arc::new(Self {
            camp,
            tpls,
            rate: RateCounter::new(std::time::Duration::from_secs(60)),
            completion: Completion::new(),
            sent: AtomicU64::new(0),
            last_id: AtomicU64::new(0),
            errors: AtomicUsize::new(0),
            state: AtomicU8::new(PipeState::Running as u8),
            shared: Arc::clone(shared),
        });

        shared
            .pipes
            .write()
            .insert(pipe.camp.id, Arc::clone(&pipe));

        Ok(pipe)
    }

    /// Spawn the waiter that runs cleanup exactly once, when batching has
    /// finished and every in-flight message has been retired.
    pub(crate) fn spawn_cleanup(self: &Arc<Self>) {
        let pipe = Arc::clone(self);
        tokio::spawn(async move {
            pipe.completion.wait().await;
            pipe.cleanup().await;
        });
    }

    /// Fetch and enqueue the next subscriber batch.
    ///
    /// Returns `Ok(true)` when there may be more subscribers (resubmit),
    /// `Ok(false)` when batching is over. A store failure abandons the
    /// attempt; the caller reschedules.
    pub(crate) async fn next_subscribers(self: &Arc<Self>) -> Result<bool, EngineError> {
        let subs = self
            .shared
            .store
            .next_subscribers(self.camp.id, self.shared.cfg.batch_size)
            .await?;

        if subs.is_empty() {
            return Ok(false);
        }

        for sub in subs {
            let msg = match self.render_message(sub) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(
                        campaign = %self.camp.name,
                        error = %err,
                        "error rendering message, skipping subscriber"
                    );
                    continue;
                }
            };

            self.completion.add_work();
            if self.shared.camp_tx.send(msg).await.is_err() {
                // Instance is shutting down; undo the accounting for the
                // message that never made it onto the queue.
                self.completion.complete_one();
                return Ok(false);
            }

            // Aggregate sliding-window throttle, distinct from the
            // per-worker rate slice.
            let wait = self.shared.sliding.lock().record();
            if let Some(wait) = wait {
                info!(
                    campaign = %self.camp.name,
                    wait_secs = wait.as_secs(),
                    "sliding window ceiling reached, sleeping until window resets"
                );
                tokio::time::sleep(wait).await;
            }
        }

        Ok(true)
    }

    fn render_message(self: &Arc<Self>, sub: Subscriber) -> Result<CampaignMessage, EngineError> {
        let unsub_url = self
            .shared
            .cfg
            .unsubscribe_url(self.camp.uuid, sub.uuid);

        let ctx = RenderContext {
            subscriber: &sub,
            campaign_name: &self.camp.name,
            campaign_uuid: self.camp.uuid,
            unsubscribe_url: &unsub_url,
        };

        let subject = self.tpls.subject.render(&ctx)?;
        let body = self.tpls.body.render(&ctx)?.into_bytes();
        let alt_body = match &self.tpls.alt_body {
            Some(tpl) => Some(tpl.render(&ctx)?.into_bytes()),
            None => None,
        };

        let from = self
            .camp
            .from_email
            .clone()
            .filter(|from| !from.is_empty())
            .unwrap_or_else(|| self.shared.cfg.from_email.clone());

        Ok(CampaignMessage {
            pipe: Arc::clone(self),
            to: sub.email.clone(),
            subscriber: sub,
            from,
            subject,
            body,
            alt_body,
            unsub_url,
        })
    }

    /// Record one successful delivery: advance the sent counter, the live
    /// rate counter, and the watermark (monotonically — completions arrive
    /// out of order across workers).
    pub(crate) fn record_sent(&self, subscriber_id: u64) {
        self.sent.fetch_add(1, Ordering::AcqRel);
        self.rate.incr();
        self.last_id.fetch_max(subscriber_id, Ordering::AcqRel);
    }

    /// Record one delivery failure and evaluate the error threshold.
    pub(crate) fn on_error(&self) {
        let budget = self.shared.cfg.max_send_errors;
        if budget == 0 {
            return;
        }

        let count = self.errors.fetch_add(1, Ordering::AcqRel) + 1;
        if count < budget {
            return;
        }

        if self.halt(PipeState::Halted) {
            warn!(
                campaign = %self.camp.name,
                errors = count,
                "error count exceeded threshold, pausing campaign"
            );
        }
    }

    /// Manual stop: queued messages become discards, no alert fires.
    pub fn stop(&self) {
        if self.halt(PipeState::Stopped) {
            info!(campaign = %self.camp.name, "campaign stopped");
        }
    }

    /// Transition out of `Running` exactly once. Returns whether this call
    /// performed the transition.
    fn halt(&self, target: PipeState) -> bool {
        self.state
            .compare_exchange(
                PipeState::Running as u8,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    #[must_use]
    pub fn state(&self) -> PipeState {
        PipeState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state() != PipeState::Running
    }

    /// Watermark of the highest processed subscriber id.
    #[must_use]
    pub fn watermark(&self) -> u64 {
        self.last_id.load(Ordering::Acquire)
    }

    /// Take the delta sent count since the last report. The store
    /// accumulates these, so the counter resets on every read.
    pub(crate) fn take_sent_delta(&self) -> u64 {
        self.sent.swap(0, Ordering::AcqRel)
    }

    /// Finalize the campaign. Runs exactly once, when batching is done and
    /// all in-flight messages are accounted for.
    async fn cleanup(self: &Arc<Self>) {
        let delta = self.take_sent_delta();
        if let Err(err) = self
            .shared
            .store
            .update_campaign_counts(self.camp.id, 0, delta, self.watermark())
            .await
        {
            error!(campaign = %self.camp.name, error = %err, "error updating campaign counts");
        }

        match self.state() {
            PipeState::Halted => {
                if let Err(err) = self
                    .shared
                    .store
                    .update_campaign_status(self.camp.id, CampaignStatus::Paused)
                    .await
                {
                    error!(
                        campaign = %self.camp.name,
                        error = %err,
                        "error pausing campaign"
                    );
                } else {
                    info!(campaign = %self.camp.name, "campaign paused");
                }

                self.shared
                    .notify(&self.camp, CampaignStatus::Paused, "Too many errors")
                    .await;
            }
            PipeState::Stopped => {
                // User-initiated stop: leave the status as the store set it
                // and alert nobody.
                info!(campaign = %self.camp.name, "stopped processing campaign");
            }
            PipeState::Running => self.finish_naturally().await,
        }

        self.shared.pipes.write().remove(&self.camp.id);
        self.shared.templates.write().remove(&self.camp.id);
        debug!(campaign = %self.camp.name, "pipe destroyed");
    }

    /// Natural completion: re-fetch the campaign's current status and mark
    /// it finished if it was still running or scheduled.
    async fn finish_naturally(self: &Arc<Self>) {
        let camp = match self.shared.store.campaign(self.camp.id).await {
            Ok(camp) => camp,
            Err(err) => {
                error!(
                    campaign = %self.camp.name,
                    error = %err,
                    "error fetching campaign for finalization"
                );
                return;
            }
        };

        let mut status = camp.status;
        if matches!(status, CampaignStatus::Running | CampaignStatus::Scheduled) {
            status = CampaignStatus::Finished;
            if let Err(err) = self
                .shared
                .store
                .update_campaign_status(self.camp.id, CampaignStatus::Finished)
                .await
            {
                error!(campaign = %self.camp.name, error = %err, "error finishing campaign");
            } else {
                info!(campaign = %self.camp.name, "campaign finished");
            }
        } else {
            info!(campaign = %self.camp.name, status = %status, "finished processing campaign");
        }

        self.shared.notify(&camp, status, "").await;
    }
}
