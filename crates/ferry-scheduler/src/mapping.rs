//! Source URL mappings onto locally reachable replicas.
//!
//! A mapping rewrites every source starting with its template so delivery
//! reads from the replacement instead. When an access location is given the
//! mapping only applies if the rewritten file exists there.

use std::path::PathBuf;

use ferry_config::UrlMappingConfig;
use ferry_core::{local_path, parse_location};

use crate::error::{SchedulerError, SchedulerResult};

const LINK_SCHEME: &str = "link://";

#[derive(Debug, Clone, PartialEq, Eq)]
struct UrlMapping {
    template: String,
    replacement: String,
    access: Option<String>,
}

/// Where a mapped source is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedSource {
    /// Location handed to the protocol mover.
    pub location: String,
    /// Local file that must exist for the mapping to be used.
    pub access_path: Option<PathBuf>,
}

/// Ordered template to replacement rules. The first matching template wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlMap {
    mappings: Vec<UrlMapping>,
}

impl UrlMap {
    /// Map without rules.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mappings: Vec::new(),
        }
    }

    /// Build a map from configured rules, in order.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidMapping`] for the first malformed rule.
    pub fn from_config(rules: &[UrlMappingConfig]) -> SchedulerResult<Self> {
        rules.iter().try_fold(Self::new(), |map, rule| {
            map.with(&rule.template, &rule.replacement, rule.access.as_deref())
        })
    }

    /// Append a rule.
    ///
    /// `link://` replacements are delivered as plain file copies.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidMapping`] when the template or the
    /// replacement is not a URL, or the access location is not local.
    pub fn with(mut self, template: &str, replacement: &str, access: Option<&str>) -> SchedulerResult<Self> {
        let invalid = |source| SchedulerError::InvalidMapping {
            template: template.to_string(),
            source,
        };
        parse_location(template).map_err(invalid)?;
        parse_location(replacement).map_err(invalid)?;
        if let Some(access) = access {
            local_path(access).map_err(invalid)?;
        }
        self.mappings.push(UrlMapping {
            template: template.to_string(),
            replacement: replacement.to_string(),
            access: access.map(str::to_string),
        });
        Ok(self)
    }

    /// Whether no rule is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Rewrite `source` with the first rule whose template prefixes it.
    #[must_use]
    pub fn map(&self, source: &str) -> Option<MappedSource> {
        self.mappings.iter().find_map(|mapping| {
            let rest = source.strip_prefix(mapping.template.as_str())?;
            let replaced = format!("{}{rest}", mapping.replacement);
            let location = if replaced.starts_with(LINK_SCHEME) {
                format!("file://{}", &replaced[LINK_SCHEME.len()..])
            } else {
                replaced
            };
            let access_path = match &mapping.access {
                Some(access) => Some(local_path(&format!("{access}{rest}")).ok()?),
                None => None,
            };
            Some(MappedSource {
                location,
                access_path,
            })
        })
    }
}
