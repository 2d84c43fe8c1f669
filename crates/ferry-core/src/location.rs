//! URL parsing helpers shared by the scheduler and the movers.

use std::path::{Path, PathBuf};

use url::Url;

use crate::error::{TransferError, TransferResult};

/// Parse a source or destination location.
///
/// Absolute filesystem paths are accepted and treated as `file://` URLs.
///
/// # Errors
///
/// Returns a permanent error when the location is not a valid absolute URL.
pub fn parse_location(value: &str) -> TransferResult<Url> {
    if value.starts_with('/') {
        return Url::from_file_path(value)
            .map_err(|()| TransferError::permanent(format!("invalid local path '{value}'")));
    }
    Url::parse(value).map_err(|err| TransferError::permanent(format!("malformed URL '{value}': {err}")))
}

/// Lowercase scheme of a location.
///
/// # Errors
///
/// Returns a permanent error when the location cannot be parsed.
pub fn scheme_of(value: &str) -> TransferResult<String> {
    parse_location(value).map(|url| url.scheme().to_ascii_lowercase())
}

/// Whether the location refers to the local filesystem.
#[must_use]
pub fn is_local(value: &str) -> bool {
    scheme_of(value).is_ok_and(|scheme| scheme == "file")
}

/// Filesystem path of a local location.
///
/// # Errors
///
/// Returns a permanent error when the location is not a local file URL.
pub fn local_path(value: &str) -> TransferResult<PathBuf> {
    let url = parse_location(value)?;
    if url.scheme() != "file" {
        return Err(TransferError::permanent(format!(
            "location '{value}' is not on the local filesystem"
        )));
    }
    url.to_file_path()
        .map_err(|()| TransferError::permanent(format!("location '{value}' has no local path")))
}

/// `file://` URL for an absolute local path.
///
/// # Errors
///
/// Returns a permanent error for relative paths.
pub fn file_url(path: &Path) -> TransferResult<String> {
    Url::from_file_path(path).map(String::from).map_err(|()| {
        TransferError::permanent(format!("path '{}' is not absolute", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn bare_paths_are_file_urls() {
        assert_eq!(scheme_of("/data/in.dat").expect("scheme"), "file");
        assert!(is_local("/data/in.dat"));
        assert_eq!(
            local_path("file:///data/in.dat").expect("path"),
            PathBuf::from("/data/in.dat")
        );
    }

    #[test]
    fn file_url_requires_absolute_paths() {
        assert_eq!(
            file_url(Path::new("/cache/ab/cdef")).expect("url"),
            "file:///cache/ab/cdef"
        );
        assert!(file_url(Path::new("relative/file")).is_err());
    }

    #[test]
    fn malformed_locations_are_permanent() {
        let err = parse_location("not a url").expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(err.message().contains("not a url"));
    }

    #[test]
    fn remote_locations_have_no_local_path() {
        assert_eq!(scheme_of("GSIFTP://host/f").expect("scheme"), "gsiftp");
        assert!(!is_local("https://host/f"));
        let err = local_path("https://host/f").expect_err("remote");
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }
}
