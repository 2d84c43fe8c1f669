//! Validation of a fully assembled configuration document.

use crate::error::{ConfigError, ConfigResult};
use crate::model::StagingConfig;

/// Check cross-field constraints that serde cannot express.
///
/// # Errors
///
/// Returns the first [`ConfigError::InvalidField`] encountered.
pub fn validate(config: &StagingConfig) -> ConfigResult<()> {
    if config.slots.delivery == 0 && config.slots.emergency == 0 {
        return Err(ConfigError::invalid(
            "slots",
            "delivery",
            config.slots.delivery,
            "delivery needs at least one normal or emergency slot",
        ));
    }
    if config.slots.pre_processor == 0 {
        return Err(ConfigError::invalid(
            "slots",
            "pre_processor",
            0,
            "must be positive",
        ));
    }
    if config.slots.post_processor == 0 {
        return Err(ConfigError::invalid(
            "slots",
            "post_processor",
            0,
            "must be positive",
        ));
    }
    if config.slots.staged_prepared == 0 {
        return Err(ConfigError::invalid(
            "slots",
            "staged_prepared",
            0,
            "must be positive",
        ));
    }

    if config.shares.default_weight == 0 {
        return Err(ConfigError::invalid(
            "shares",
            "default_weight",
            0,
            "weights must be positive",
        ));
    }
    if let Some(name) = config
        .shares
        .reference_weights
        .iter()
        .find_map(|(name, weight)| (*weight == 0).then_some(name))
    {
        return Err(ConfigError::invalid(
            "shares",
            "reference_weights",
            name,
            "weights must be positive",
        ));
    }

    let retry = &config.retry;
    if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
        return Err(ConfigError::invalid(
            "retry",
            "multiplier",
            retry.multiplier,
            "must be a finite value of at least 1.0",
        ));
    }
    if !(0.0..1.0).contains(&retry.jitter) {
        return Err(ConfigError::invalid(
            "retry",
            "jitter",
            retry.jitter,
            "must be within [0, 1)",
        ));
    }
    if retry.max_delay_ms < retry.initial_delay_ms {
        return Err(ConfigError::invalid(
            "retry",
            "max_delay_ms",
            retry.max_delay_ms,
            "must not be below initial_delay_ms",
        ));
    }

    if let Some(mapping) = config
        .url_mappings
        .iter()
        .find(|mapping| mapping.template.trim().is_empty() || mapping.replacement.trim().is_empty())
    {
        return Err(ConfigError::invalid(
            "url_mappings",
            "template",
            &mapping.template,
            "template and replacement must not be empty",
        ));
    }
    if let Some(dir) = config.scratch_dir.as_deref().filter(|dir| !dir.starts_with('/')) {
        return Err(ConfigError::invalid(
            "staging",
            "scratch_dir",
            dir,
            "must be an absolute path",
        ));
    }

    if config.sub_share.trim().is_empty() {
        return Err(ConfigError::InvalidField {
            section: "staging",
            field: "sub_share",
            value: None,
            reason: "must not be empty",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_of(err: &ConfigError) -> &'static str {
        match err {
            ConfigError::InvalidField { field, .. } => *field,
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn defaults_are_valid() {
        validate(&StagingConfig::default()).expect("defaults validate");
    }

    #[test]
    fn zero_delivery_is_allowed_with_emergency_slots() {
        let mut config = StagingConfig::default();
        config.slots.delivery = 0;
        config.slots.emergency = 1;
        validate(&config).expect("emergency-only delivery is valid");

        config.slots.emergency = 0;
        let err = validate(&config).expect_err("no delivery capacity");
        assert_eq!(field_of(&err), "delivery");
    }

    #[test]
    fn non_positive_weights_are_rejected() {
        let mut config = StagingConfig::default();
        config
            .shares
            .reference_weights
            .insert("atlas".to_string(), 0);
        let err = validate(&config).expect_err("zero weight");
        assert_eq!(field_of(&err), "reference_weights");
    }

    #[test]
    fn retry_curve_is_checked() {
        let mut config = StagingConfig::default();
        config.retry.multiplier = 0.5;
        assert_eq!(
            field_of(&validate(&config).expect_err("shrinking curve")),
            "multiplier"
        );

        let mut config = StagingConfig::default();
        config.retry.max_delay_ms = 1;
        assert_eq!(
            field_of(&validate(&config).expect_err("max below initial")),
            "max_delay_ms"
        );

        let mut config = StagingConfig::default();
        config.retry.jitter = 1.5;
        assert_eq!(field_of(&validate(&config).expect_err("jitter")), "jitter");
    }

    #[test]
    fn url_mappings_and_scratch_dir_are_checked() {
        let mut config = StagingConfig::default();
        config.url_mappings.push(crate::model::UrlMappingConfig {
            template: "gsiftp://se/".to_string(),
            replacement: " ".to_string(),
            access: None,
        });
        assert_eq!(field_of(&validate(&config).expect_err("empty replacement")), "template");

        let mut config = StagingConfig::default();
        config.scratch_dir = Some("scratch".to_string());
        assert_eq!(field_of(&validate(&config).expect_err("relative scratch")), "scratch_dir");
        config.scratch_dir = Some("/scratch".to_string());
        validate(&config).expect("absolute scratch");
    }

    #[test]
    fn empty_sub_share_is_rejected() {
        let mut config = StagingConfig::default();
        config.sub_share = "  ".to_string();
        assert_eq!(
            field_of(&validate(&config).expect_err("empty sub-share")),
            "sub_share"
        );
    }
}
