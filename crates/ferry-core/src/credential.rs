//! Opaque credential handle passed through to protocol movers.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

/// Validated identity handle supplied by a credential provider.
///
/// The scheduler never inspects the secret material; it only hands the
/// handle to the mover that performs the transfer.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    identity: String,
    material: Arc<[u8]>,
}

impl Credential {
    /// Wrap raw credential material for the given identity.
    #[must_use]
    pub fn new(identity: impl Into<String>, material: impl Into<Vec<u8>>) -> Self {
        Self {
            identity: identity.into(),
            material: Arc::from(material.into()),
        }
    }

    /// Identity (subject) the credential belongs to.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Raw credential material.
    #[must_use]
    pub fn material(&self) -> &[u8] {
        &self.material
    }
}

impl Debug for Credential {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Credential")
            .field("identity", &self.identity)
            .field("material", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_material() {
        let credential = Credential::new("/DC=org/CN=alice", b"secret-proxy".to_vec());
        let rendered = format!("{credential:?}");
        assert!(rendered.contains("/DC=org/CN=alice"));
        assert!(!rendered.contains("secret-proxy"));
        assert_eq!(credential.material(), b"secret-proxy");
    }
}
