//! Cache parameters, cache outcome tracking, and the local-user mapping they are
//! substituted against.

use serde::{Deserialize, Serialize};

/// Local account a transfer runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    /// Account name.
    pub name: String,
    /// Numeric user id.
    pub uid: u32,
    /// Numeric group id.
    pub gid: u32,
    /// Home directory when known.
    #[serde(default)]
    pub home: Option<String>,
}

impl LocalUser {
    /// Build a user mapping without a home directory.
    #[must_use]
    pub fn new(name: impl Into<String>, uid: u32, gid: u32) -> Self {
        Self {
            name: name.into(),
            uid,
            gid,
            home: None,
        }
    }

    /// Attach a home directory.
    #[must_use]
    pub fn with_home(mut self, home: impl Into<String>) -> Self {
        self.home = Some(home.into());
        self
    }
}

/// Cache directories handed to the cache layer for one request.
///
/// Paths may carry `%U` (user name), `%u` (uid), `%g` (gid) and `%H` (home)
/// placeholders that [`CacheParameters::substitute`] expands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheParameters {
    /// Writable cache directories; the first one receives new entries.
    #[serde(default)]
    pub cache_dirs: Vec<String>,
    /// Directories consulted for hits but never written.
    #[serde(default)]
    pub readonly_dirs: Vec<String>,
    /// Directories being emptied; hits are served but nothing new is stored.
    #[serde(default)]
    pub draining_dirs: Vec<String>,
}

impl CacheParameters {
    /// Whether any cache directory is configured.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.cache_dirs.is_empty()
    }

    /// Expand per-user placeholders in every directory.
    #[must_use]
    pub fn substitute(&self, user: &LocalUser) -> Self {
        let expand = |dirs: &[String]| {
            dirs.iter()
                .map(|dir| substitute_path(dir, user))
                .collect::<Vec<_>>()
        };
        Self {
            cache_dirs: expand(&self.cache_dirs),
            readonly_dirs: expand(&self.readonly_dirs),
            draining_dirs: expand(&self.draining_dirs),
        }
    }

    /// Directories searched for existing entries, writable ones first.
    pub fn lookup_dirs(&self) -> impl Iterator<Item = &str> {
        self.cache_dirs
            .iter()
            .chain(&self.readonly_dirs)
            .chain(&self.draining_dirs)
            .map(String::as_str)
    }
}

fn substitute_path(path: &str, user: &LocalUser) -> String {
    let mut out = String::with_capacity(path.len());
    let mut chars = path.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match chars.peek().copied() {
            Some('U') => out.push_str(&user.name),
            Some('u') => out.push_str(&user.uid.to_string()),
            Some('g') => out.push_str(&user.gid.to_string()),
            Some('H') => match user.home.as_deref() {
                Some(home) => out.push_str(home),
                None => out.push_str("%H"),
            },
            _ => {
                out.push('%');
                continue;
            }
        }
        let _ = chars.next();
    }
    out
}

/// Cache outcome recorded on a request as it moves through the stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    /// Caching is not in use for this request.
    #[default]
    NotUsed,
    /// The source may be cached after delivery.
    Cacheable,
    /// The source must not be cached.
    NonCacheable,
    /// A cached copy was found and is used as the delivery source.
    AlreadyPresent,
    /// The delivered file was stored in the cache.
    Downloaded,
    /// Caching was attempted but skipped after an error.
    Skip,
}

impl CacheState {
    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotUsed => "not_used",
            Self::Cacheable => "cacheable",
            Self::NonCacheable => "non_cacheable",
            Self::AlreadyPresent => "already_present",
            Self::Downloaded => "downloaded",
            Self::Skip => "skip",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_expands_user_placeholders() {
        let user = LocalUser::new("alice", 1001, 100).with_home("/home/alice");
        let params = CacheParameters {
            cache_dirs: vec!["/var/cache/%U".into(), "/scratch/%u-%g".into()],
            readonly_dirs: vec!["%H/.cache".into()],
            draining_dirs: vec!["/old/100%".into()],
        };

        let expanded = params.substitute(&user);
        assert_eq!(
            expanded.cache_dirs,
            vec!["/var/cache/alice".to_string(), "/scratch/1001-100".to_string()]
        );
        assert_eq!(expanded.readonly_dirs, vec!["/home/alice/.cache".to_string()]);
        assert_eq!(expanded.draining_dirs, vec!["/old/100%".to_string()]);
    }

    #[test]
    fn substitute_does_not_rescan_inserted_text() {
        let user = LocalUser::new("%u", 7, 8);
        let params = CacheParameters {
            cache_dirs: vec!["/c/%U".into()],
            ..CacheParameters::default()
        };
        assert_eq!(params.substitute(&user).cache_dirs, vec!["/c/%u".to_string()]);
    }

    #[test]
    fn missing_home_leaves_placeholder() {
        let user = LocalUser::new("bob", 1, 1);
        let params = CacheParameters {
            cache_dirs: vec!["%H/cache".into()],
            ..CacheParameters::default()
        };
        let expanded = params.substitute(&user);
        assert_eq!(expanded.cache_dirs, vec!["%H/cache".to_string()]);
        assert!(expanded.is_enabled());
        assert!(!CacheParameters::default().is_enabled());
    }
}
