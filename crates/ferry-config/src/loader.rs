//! Loading the configuration document from disk and the environment.

use std::path::Path;

use tracing::{debug, info};

use crate::error::{ConfigError, ConfigResult};
use crate::model::{ShareType, StagingConfig};
use crate::validate::validate;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "FERRY_";

/// Load, override, and validate the configuration.
///
/// With no `path` the defaults are used as the base document.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, an override is
/// malformed, or the final document fails validation.
pub async fn load(path: Option<&Path>) -> ConfigResult<StagingConfig> {
    let mut config = match path {
        Some(path) => StagingConfig::load_from_file(path).await?,
        None => StagingConfig::default(),
    };
    config.apply_env_overrides()?;
    validate(&config)?;
    info!(
        pre = config.slots.pre_processor,
        delivery = config.slots.delivery,
        post = config.slots.post_processor,
        emergency = config.slots.emergency,
        share_type = config.shares.share_type.as_str(),
        "staging configuration loaded"
    );
    Ok(config)
}

impl StagingConfig {
    /// Parse a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed documents or unknown fields.
    pub fn from_json_str(document: &str) -> ConfigResult<Self> {
        serde_json::from_str(document).map_err(|source| ConfigError::Parse { path: None, source })
    }

    /// Read and parse a JSON document from disk.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub async fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let document = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        serde_json::from_str(&document).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })
    }

    /// Apply overrides from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] when a variable cannot be parsed.
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides resolved through `lookup` (keys include [`ENV_PREFIX`]).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidField`] when a value cannot be parsed.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| value.trim().to_string())
        };

        if let Some(value) = var("PRE_SLOTS") {
            self.slots.pre_processor = parse_number(&value, "slots", "pre_processor")?;
        }
        if let Some(value) = var("DELIVERY_SLOTS") {
            self.slots.delivery = parse_number(&value, "slots", "delivery")?;
        }
        if let Some(value) = var("POST_SLOTS") {
            self.slots.post_processor = parse_number(&value, "slots", "post_processor")?;
        }
        if let Some(value) = var("EMERGENCY_SLOTS") {
            self.slots.emergency = parse_number(&value, "slots", "emergency")?;
        }
        if let Some(value) = var("MAX_RETRIES") {
            self.retry.max_retries = parse_number(&value, "retry", "max_retries")?;
        }
        if let Some(value) = var("SHARE_TYPE") {
            self.shares.share_type = ShareType::parse(&value).ok_or_else(|| {
                ConfigError::invalid("shares", "share_type", &value, "unknown share type")
            })?;
        }
        if let Some(value) = var("LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Some(value) = var("LOG_FORMAT") {
            self.logging.format = value;
        }
        if let Some(value) = var("DUMP_LOCATION") {
            self.dump_location = (!value.is_empty()).then_some(value);
        }
        if let Some(value) = var("SCRATCH_DIR") {
            self.scratch_dir = (!value.is_empty()).then_some(value);
        }
        if let Some(value) = var("CACHE_DIR") {
            debug!(cache_dir = %value, "cache directory overridden from environment");
            self.cache.dirs = if value.is_empty() {
                Vec::new()
            } else {
                vec![value]
            };
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(
    value: &str,
    section: &'static str,
    field: &'static str,
) -> ConfigResult<T> {
    value
        .parse()
        .map_err(|_| ConfigError::invalid(section, field, value, "not a non-negative integer"))
}
