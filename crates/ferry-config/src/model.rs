//! Typed configuration document.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;

/// Root configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StagingConfig {
    /// Slot capacity per stage.
    pub slots: SlotConfig,
    /// Transfer share classification and weights.
    pub shares: ShareConfig,
    /// Retry limits and backoff curve.
    pub retry: RetryConfig,
    /// Throughput limits for deliveries.
    pub transfer: TransferConfig,
    /// Milliseconds a last-retry request waits before using an emergency slot.
    pub emergency_threshold_ms: u64,
    /// Cache directories (may contain per-user placeholders).
    pub cache: CacheConfig,
    /// Sub-share assigned to generator requests.
    pub sub_share: String,
    /// Source prefixes served from locally reachable replicas, first match wins.
    pub url_mappings: Vec<UrlMappingConfig>,
    /// File the scheduler rewrites with its queue contents every few seconds.
    pub dump_location: Option<String>,
    /// Directory successful downloads are moved to, keyed by the path below the job id.
    pub scratch_dir: Option<String>,
    /// Logging output.
    pub logging: LoggingSettings,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            slots: SlotConfig::default(),
            shares: ShareConfig::default(),
            retry: RetryConfig::default(),
            transfer: TransferConfig::default(),
            emergency_threshold_ms: defaults::EMERGENCY_THRESHOLD_MS,
            cache: CacheConfig::default(),
            sub_share: defaults::SUB_SHARE.to_string(),
            url_mappings: Vec::new(),
            dump_location: None,
            scratch_dir: None,
            logging: LoggingSettings::default(),
        }
    }
}

impl StagingConfig {
    /// Emergency threshold as a duration.
    #[must_use]
    pub const fn emergency_threshold(&self) -> Duration {
        Duration::from_millis(self.emergency_threshold_ms)
    }
}

/// Slot capacity per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SlotConfig {
    /// Concurrent pre-processing operations.
    pub pre_processor: usize,
    /// Concurrent deliveries.
    pub delivery: usize,
    /// Concurrent post-processing operations.
    pub post_processor: usize,
    /// Emergency slots shared by every stage.
    pub emergency: usize,
    /// Requests a share may have waiting for delivery before pre-processing pauses.
    pub staged_prepared: usize,
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            pre_processor: defaults::PRE_PROCESSOR_SLOTS,
            delivery: defaults::DELIVERY_SLOTS,
            post_processor: defaults::POST_PROCESSOR_SLOTS,
            emergency: defaults::EMERGENCY_SLOTS,
            staged_prepared: defaults::STAGED_PREPARED,
        }
    }
}

/// Rule mapping a request to its share name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareType {
    /// One share per owning user.
    #[default]
    User,
    /// One share per virtual organisation.
    Vo,
    /// Everything in the default share.
    None,
}

impl ShareType {
    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Vo => "vo",
            Self::None => "none",
        }
    }

    /// Parse a label.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" | "dn" => Some(Self::User),
            "vo" => Some(Self::Vo),
            "none" | "" => Some(Self::None),
            _ => None,
        }
    }
}

/// Transfer share settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShareConfig {
    /// Classification rule.
    pub share_type: ShareType,
    /// Weight of shares without a reference entry.
    pub default_weight: u32,
    /// Explicit weights by share name.
    pub reference_weights: BTreeMap<String, u32>,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            share_type: ShareType::default(),
            default_weight: defaults::SHARE_WEIGHT,
            reference_weights: BTreeMap::new(),
        }
    }
}

/// Retry limits and backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries granted after the first attempt.
    pub max_retries: u32,
    /// First retry delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Growth factor applied per consumed retry.
    pub multiplier: f64,
    /// Upper bound on a retry delay in milliseconds.
    pub max_delay_ms: u64,
    /// Random spread applied to each delay, as a fraction in `[0, 1)`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::MAX_RETRIES,
            initial_delay_ms: defaults::RETRY_INITIAL_DELAY_MS,
            multiplier: defaults::RETRY_MULTIPLIER,
            max_delay_ms: defaults::RETRY_MAX_DELAY_MS,
            jitter: 0.0,
        }
    }
}

/// Throughput limits for deliveries. Zero disables a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    /// Minimum whole-transfer throughput in bytes per second.
    pub min_average_speed: u64,
    /// Seconds without progress before a delivery is aborted.
    pub max_inactivity_time_secs: u64,
    /// Minimum throughput over the averaging window in bytes per second.
    pub min_current_speed: u64,
    /// Averaging window and grace period in seconds.
    pub averaging_time_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            min_average_speed: 0,
            max_inactivity_time_secs: defaults::MAX_INACTIVITY_SECS,
            min_current_speed: 0,
            averaging_time_secs: 0,
        }
    }
}

/// Cache directories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Writable cache directories.
    pub dirs: Vec<String>,
    /// Read-only cache directories.
    pub readonly_dirs: Vec<String>,
    /// Directories being drained.
    pub draining_dirs: Vec<String>,
}

/// One source URL mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UrlMappingConfig {
    /// Source prefix to match.
    pub template: String,
    /// Prefix substituted for the template.
    pub replacement: String,
    /// Local prefix where the replacement must exist for the mapping to apply.
    #[serde(default)]
    pub access: Option<String>,
}

/// Logging output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    /// Level or filter directive.
    pub level: String,
    /// `pretty` or `json`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: defaults::LOG_LEVEL.to_string(),
            format: defaults::LOG_FORMAT.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: StagingConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(config, StagingConfig::default());
        assert_eq!(config.slots.delivery, 10);
        assert_eq!(config.slots.emergency, 2);
        assert_eq!(config.emergency_threshold(), Duration::from_secs(30));
        assert_eq!(config.sub_share, "candypond-download");
    }

    #[test]
    fn share_type_labels_round_trip() {
        for share_type in [ShareType::User, ShareType::Vo, ShareType::None] {
            assert_eq!(ShareType::parse(share_type.as_str()), Some(share_type));
        }
        assert_eq!(ShareType::parse("dn"), Some(ShareType::User));
        assert_eq!(ShareType::parse("group"), None);
    }

    #[test]
    fn url_mappings_parse_in_order() {
        let config: StagingConfig = serde_json::from_str(
            r#"{"url_mappings": [
                {"template": "gsiftp://se/atlas/", "replacement": "link:///mnt/atlas/", "access": "/mnt/atlas/"},
                {"template": "gsiftp://se/", "replacement": "file:///mnt/se/"}
            ]}"#,
        )
        .expect("parse");
        assert_eq!(config.url_mappings.len(), 2);
        assert_eq!(config.url_mappings[0].access.as_deref(), Some("/mnt/atlas/"));
        assert_eq!(config.url_mappings[1].access, None);
        assert_eq!(config.dump_location, None);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_str::<StagingConfig>(r#"{"slots": {"transfers": 3}}"#);
        assert!(err.is_err());
    }
}
