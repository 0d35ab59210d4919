//! Campaign records and their lifecycle states.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a campaign as recorded by the [`Store`].
///
/// The engine only ever writes the running-to-terminal transitions
/// (`Running`/`Scheduled` → `Finished`, `Paused`, `Cancelled`); everything
/// else is driven by the surrounding application.
///
/// [`Store`]: crate::store::Store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Running,
    Paused,
    Cancelled,
    Finished,
}

impl CampaignStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Finished => "finished",
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body content type of a campaign.
///
/// The engine only distinguishes `Plain` from the rest (alt-body handling);
/// everything else is the renderer's concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Richtext,
    Html,
    Plain,
    Markdown,
}

/// A file attached to every message of a campaign, fetched from the Store
/// by media id when the campaign's pipe is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// An in-memory snapshot of a queued bulk-send job.
///
/// Owned by the Store; the engine holds this snapshot only while the
/// campaign is running. Counters here are the values at pickup time — the
/// live counters during a run belong to the campaign's pipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: u64,
    pub uuid: Uuid,
    pub name: String,

    /// Subject template source. Compiled lazily when the pipe is built.
    pub subject: String,
    /// Body template source.
    pub body: String,
    /// Optional plain-text alternative body template source.
    #[serde(default)]
    pub alt_body: Option<String>,

    /// Sender address; falls back to the instance configuration when empty.
    #[serde(default)]
    pub from_email: Option<String>,

    /// Name of the delivery backend this campaign is sent through. An
    /// unresolvable name permanently cancels the campaign.
    pub messenger: String,
    pub content_type: ContentType,

    /// Media ids resolved into [`Attachment`]s at pipe construction.
    #[serde(default)]
    pub media_ids: Vec<u64>,
    #[serde(skip)]
    pub attachments: Vec<Attachment>,

    /// Per-run counters as last persisted by the Store.
    #[serde(default)]
    pub to_send: u64,
    #[serde(default)]
    pub sent: u64,
    #[serde(default)]
    pub last_subscriber_id: u64,

    pub status: CampaignStatus,

    /// Custom headers attached to every message of this campaign.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}
