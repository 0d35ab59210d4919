//! Delivery workers.
//!
//! Each worker drains the campaign and generic message queues, enforces
//! the per-second rate slice, assembles the final wire message and hands
//! it to the campaign's messenger. Accounting (sent counters, watermark,
//! error threshold, completion) happens here, per message.

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{error, warn};

use broadside_common::message::{
    HEADER_CAMPAIGN_UUID, HEADER_SUBSCRIBER_UUID, HEADER_TENANT_ID, Headers, Message,
};

use crate::{manager::Shared, pipe::CampaignMessage};

/// Per-worker token bucket: `limit` sends per wall-clock second, sleeping
/// out the remainder of the second once spent.
struct RateSlice {
    limit: usize,
    sent: usize,
    started: Instant,
}

impl RateSlice {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            sent: 0,
            started: Instant::now(),
        }
    }

    async fn throttle(&mut self) {
        const SECOND: Duration = Duration::from_secs(1);

        if self.started.elapsed() >= SECOND {
            self.sent = 0;
            self.started = Instant::now();
        }

        if self.sent >= self.limit {
            tokio::time::sleep(SECOND.saturating_sub(self.started.elapsed())).await;
            self.sent = 0;
            self.started = Instant::now();
        }

        self.sent += 1;
    }
}

/// Worker loop. Runs until both queues are closed and drained.
pub(crate) async fn run(shared: Arc<Shared>) {
    let mut slice = RateSlice::new(shared.cfg.message_rate);

    loop {
        tokio::select! {
            msg = shared.camp_rx.recv() => match msg {
                Ok(msg) => deliver_campaign(&shared, msg, &mut slice).await,
                Err(_) => break,
            },
            msg = shared.msg_rx.recv() => match msg {
                Ok(msg) => deliver(&shared, msg).await,
                Err(_) => break,
            },
        }
    }
}

async fn deliver_campaign(shared: &Arc<Shared>, msg: CampaignMessage, slice: &mut RateSlice) {
    let pipe = Arc::clone(&msg.pipe);

    // A stopped or halted pipe's queued messages are discarded, but still
    // retired so the completion count reaches zero.
    if pipe.is_stopped() {
        pipe.completion.complete_one();
        return;
    }

    slice.throttle().await;

    let out = assemble(shared, &msg);
    match push(shared, out).await {
        Ok(()) => pipe.record_sent(msg.subscriber.id),
        Err(err) => {
            warn!(
                campaign = %pipe.camp.name,
                subscriber = %msg.subscriber.email,
                error = %err,
                "error sending message"
            );
            pipe.on_error();
        }
    }

    pipe.completion.complete_one();
}

async fn deliver(shared: &Arc<Shared>, msg: Message) {
    let subject = msg.subject.clone();
    if let Err(err) = push(shared, msg).await {
        warn!(subject = %subject, error = %err, "error sending message");
    }
}

async fn push(shared: &Arc<Shared>, msg: Message) -> anyhow::Result<()> {
    let messenger = shared.messengers.read().get(&msg.messenger).cloned();
    match messenger {
        Some(messenger) => messenger.push(msg).await,
        None => {
            // Pipes validate the messenger at construction; hitting this
            // means a generic message named an unknown backend.
            error!(messenger = %msg.messenger, "unknown messenger on message");
            anyhow::bail!("unknown messenger '{}'", msg.messenger)
        }
    }
}

/// Build the final wire message for one (campaign, subscriber) pair:
/// identifying headers, the tenant header on tenant instances, the
/// one-click unsubscribe pair, then the campaign's own headers.
fn assemble(shared: &Arc<Shared>, msg: &CampaignMessage) -> Message {
    let camp = &msg.pipe.camp;

    let mut headers = Headers::new();
    headers.set(HEADER_CAMPAIGN_UUID, camp.uuid.to_string());
    headers.set(HEADER_SUBSCRIBER_UUID, msg.subscriber.uuid.to_string());
    if let Some(tenant_id) = shared.tenant_id {
        headers.set(HEADER_TENANT_ID, tenant_id.to_string());
    }
    if shared.cfg.unsub_header {
        headers.set("List-Unsubscribe-Post", "List-Unsubscribe=One-Click");
        headers.set("List-Unsubscribe", format!("<{}>", msg.unsub_url));
    }
    for (name, value) in &camp.headers {
        headers.add(name.clone(), value.clone());
    }

    Message {
        from: msg.from.clone(),
        to: vec![msg.to.clone()],
        subject: msg.subject.clone(),
        content_type: camp.content_type,
        body: msg.body.clone(),
        alt_body: msg.alt_body.clone(),
        messenger: camp.messenger.clone(),
        headers,
        attachments: camp.attachments.clone(),
    }
}
