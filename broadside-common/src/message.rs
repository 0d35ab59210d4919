//! Outbound messages and their headers.
//!
//! A [`Message`] is ephemeral: it exists between render and delivery and
//! is never persisted.

use serde::{Deserialize, Serialize};

use crate::campaign::{Attachment, ContentType};

/// Well-known header names the engine sets on campaign messages.
pub const HEADER_CAMPAIGN_UUID: &str = "X-Broadside-Campaign";
pub const HEADER_SUBSCRIBER_UUID: &str = "X-Broadside-Subscriber";
pub const HEADER_TENANT_ID: &str = "X-Tenant-ID";

/// An ordered multi-map of message headers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Replace any existing values for `name` with `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.0.push((name, value.into()));
    }

    /// Append a value for `name`, keeping existing ones.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn iter(&self) -> std::slice::Iter<'_, (String, String)> {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a (String, String);
    type IntoIter = std::slice::Iter<'a, (String, String)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A fully assembled message handed to a [`Messenger`].
///
/// [`Messenger`]: crate::messenger::Messenger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Resolved sender address.
    pub from: String,
    /// Recipient addresses.
    pub to: Vec<String>,
    pub subject: String,
    pub content_type: ContentType,
    pub body: Vec<u8>,
    #[serde(default)]
    pub alt_body: Option<Vec<u8>>,
    /// Name of the delivery backend this message is routed through.
    pub messenger: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}
