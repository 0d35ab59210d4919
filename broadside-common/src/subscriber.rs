//! Subscriber records. Read-only to the engine.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A recipient of campaign messages.
///
/// `attribs` carries the per-subscriber attribute set used for template
/// personalisation; its keys are addressable from templates as
/// `attribs.<key>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: u64,
    pub uuid: Uuid,
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub attribs: AHashMap<String, String>,
}

impl Subscriber {
    /// Look up a template-addressable field on this subscriber.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<String> {
        match name {
            "email" => Some(self.email.clone()),
            "name" => Some(self.name.clone()),
            "uuid" => Some(self.uuid.to_string()),
            _ => name
                .strip_prefix("attribs.")
                .and_then(|key| self.attribs.get(key).cloned()),
        }
    }
}
