//! Engine configuration.
//!
//! [`Config`] drives one engine instance. In multi-tenant mode each
//! tenant's instance gets its own immutable [`TenantConfig`] derived from
//! the global config plus the tenant's stored settings — changing a
//! tenant's configuration means recreating its instance, never mutating a
//! live one.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::TenantId;

const fn default_batch_size() -> usize {
    1000
}

const fn default_concurrency() -> usize {
    10
}

const fn default_message_rate() -> usize {
    10
}

const fn default_max_send_errors() -> usize {
    1000
}

const fn default_scan_interval() -> u64 {
    5
}

const fn default_sliding_window_duration() -> u64 {
    3600
}

const fn default_push_timeout() -> u64 {
    3
}

const fn default_true() -> bool {
    true
}

/// Parameters for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Number of subscribers pulled from the store per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Number of concurrent delivery workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Messages each worker may send per second before sleeping the
    /// remainder of the second.
    #[serde(default = "default_message_rate")]
    pub message_rate: usize,

    /// Delivery failures tolerated before a campaign is paused.
    /// Zero disables the error threshold.
    #[serde(default = "default_max_send_errors")]
    pub max_send_errors: usize,

    /// Enable the aggregate sliding-window throttle.
    #[serde(default)]
    pub sliding_window: bool,

    /// Sends allowed inside one sliding window.
    #[serde(default)]
    pub sliding_window_rate: usize,

    /// Sliding window length in seconds. Must exceed one second to take
    /// effect.
    #[serde(default = "default_sliding_window_duration")]
    pub sliding_window_duration_secs: u64,

    /// How often to scan the store for due campaigns (seconds).
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Whether this instance scans for campaigns at all. Disable to run a
    /// worker-only instance while another deployment does the scanning.
    #[serde(default = "default_true")]
    pub scan_campaigns: bool,

    /// Timeout for pushing onto a busy message queue (seconds).
    #[serde(default = "default_push_timeout")]
    pub push_timeout_secs: u64,

    /// Default sender address when a campaign declares none.
    #[serde(default)]
    pub from_email: String,

    /// Attach `List-Unsubscribe` headers to campaign messages.
    #[serde(default = "default_true")]
    pub unsub_header: bool,

    /// Track link clicks per individual subscriber rather than campaign-wide.
    #[serde(default)]
    pub individual_tracking: bool,

    /// URL templates. `{campaign_uuid}` / `{subscriber_uuid}` /
    /// `{token}` placeholders are substituted where applicable.
    #[serde(default)]
    pub root_url: String,
    #[serde(default)]
    pub unsub_url: String,
    #[serde(default)]
    pub optin_url: String,
    #[serde(default)]
    pub link_track_url: String,
    #[serde(default)]
    pub archive_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            message_rate: default_message_rate(),
            max_send_errors: default_max_send_errors(),
            sliding_window: false,
            sliding_window_rate: 0,
            sliding_window_duration_secs: default_sliding_window_duration(),
            scan_interval_secs: default_scan_interval(),
            scan_campaigns: true,
            push_timeout_secs: default_push_timeout(),
            from_email: String::new(),
            unsub_header: true,
            individual_tracking: false,
            root_url: String::new(),
            unsub_url: String::new(),
            optin_url: String::new(),
            link_track_url: String::new(),
            archive_url: String::new(),
        }
    }
}

impl Config {
    /// Clamp degenerate values the way the engine expects them.
    #[must_use]
    pub fn normalised(mut self) -> Self {
        self.batch_size = self.batch_size.max(1);
        self.concurrency = self.concurrency.max(1);
        self.message_rate = self.message_rate.max(1);
        self
    }

    /// Expand the unsubscribe URL template for one (campaign, subscriber)
    /// pair.
    #[must_use]
    pub fn unsubscribe_url(&self, campaign_uuid: Uuid, subscriber_uuid: Uuid) -> String {
        self.unsub_url
            .replace("{campaign_uuid}", &campaign_uuid.to_string())
            .replace("{subscriber_uuid}", &subscriber_uuid.to_string())
    }

    /// Expand the link-tracking URL template for a registered link token.
    #[must_use]
    pub fn tracking_url(
        &self,
        token: &str,
        campaign_uuid: Uuid,
        subscriber_uuid: Uuid,
    ) -> String {
        self.link_track_url
            .replace("{token}", token)
            .replace("{campaign_uuid}", &campaign_uuid.to_string())
            .replace("{subscriber_uuid}", &subscriber_uuid.to_string())
    }
}

/// Delivery credentials for one tenant's messaging backend. Opaque to the
/// engine; handed to the messenger factory when a tenant instance is
/// created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryCredentials {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_true")]
    pub tls: bool,
}

/// Per-tenant overrides as stored by the [`TenantStore`]. Absent fields
/// fall back to the global configuration.
///
/// [`TenantStore`]: crate::store::TenantStore
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantSettings {
    #[serde(default)]
    pub from_email: Option<String>,
    #[serde(default)]
    pub max_batch_size: Option<usize>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub message_rate: Option<usize>,
    #[serde(default)]
    pub max_send_errors: Option<usize>,
    #[serde(default)]
    pub credentials: Option<DeliveryCredentials>,
}

/// The immutable configuration snapshot one tenant instance runs with.
#[derive(Debug, Clone)]
pub struct TenantConfig {
    pub tenant_id: TenantId,
    pub config: Config,
    pub credentials: Option<DeliveryCredentials>,
}

impl TenantConfig {
    /// Derive a tenant's config from the global one plus its stored
    /// settings: limits are overridden where present, and URL templates
    /// are rebased onto the tenant's path prefix.
    #[must_use]
    pub fn derive(global: &Config, tenant_id: TenantId, settings: &TenantSettings) -> Self {
        let mut config = global.clone();

        if let Some(from) = &settings.from_email {
            config.from_email.clone_from(from);
        }
        if let Some(batch) = settings.max_batch_size {
            config.batch_size = batch;
        }
        if let Some(conc) = settings.max_concurrency {
            config.concurrency = conc;
        }
        if let Some(rate) = settings.message_rate {
            config.message_rate = rate;
        }
        if let Some(errors) = settings.max_send_errors {
            config.max_send_errors = errors;
        }

        let root = format!("{}/tenant/{tenant_id}", global.root_url);
        config.unsub_url =
            format!("{root}/subscription/{{campaign_uuid}}/{{subscriber_uuid}}");
        config.optin_url = format!("{root}/subscription/optin/{{subscriber_uuid}}");
        config.archive_url = format!("{root}/archive");
        config.root_url = root;

        Self {
            tenant_id,
            config: config.normalised(),
            credentials: settings.credentials.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn normalised_clamps_zeroes() {
        let cfg = Config {
            batch_size: 0,
            concurrency: 0,
            message_rate: 0,
            ..Config::default()
        }
        .normalised();

        assert_eq!(cfg.batch_size, 1);
        assert_eq!(cfg.concurrency, 1);
        assert_eq!(cfg.message_rate, 1);
    }

    #[test]
    fn unsubscribe_url_substitutes_uuids() {
        let cfg = Config {
            unsub_url: "https://lists.example.com/u/{campaign_uuid}/{subscriber_uuid}".to_string(),
            ..Config::default()
        };

        let camp = Uuid::nil();
        let sub = Uuid::nil();
        assert_eq!(
            cfg.unsubscribe_url(camp, sub),
            format!("https://lists.example.com/u/{camp}/{sub}")
        );
    }

    #[test]
    fn tenant_config_applies_overrides_and_rebases_urls() {
        let global = Config {
            root_url: "https://lists.example.com".to_string(),
            batch_size: 500,
            ..Config::default()
        };

        let settings = TenantSettings {
            from_email: Some("news@tenant7.example.com".to_string()),
            max_batch_size: Some(50),
            message_rate: Some(2),
            ..TenantSettings::default()
        };

        let tc = TenantConfig::derive(&global, 7, &settings);
        assert_eq!(tc.tenant_id, 7);
        assert_eq!(tc.config.batch_size, 50);
        assert_eq!(tc.config.message_rate, 2);
        assert_eq!(tc.config.concurrency, global.concurrency);
        assert_eq!(tc.config.from_email, "news@tenant7.example.com");
        assert_eq!(tc.config.root_url, "https://lists.example.com/tenant/7");
        assert!(tc.config.unsub_url.starts_with("https://lists.example.com/tenant/7/"));
    }

    #[test]
    fn serde_defaults_fill_missing_fields() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.batch_size, 1000);
        assert_eq!(cfg.scan_interval_secs, 5);
        assert!(cfg.scan_campaigns);
        assert!(!cfg.sliding_window);
    }
}
