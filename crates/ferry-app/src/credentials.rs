//! Credentials read from a proxy file on disk.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use ferry_core::{Credential, CredentialProvider, LocalUser};
use tracing::debug;

/// Environment variable naming the proxy file.
pub const PROXY_ENV: &str = "FERRY_PROXY_FILE";

/// Hands every request the contents of one proxy file.
///
/// `%u` in the path expands to the requesting user's uid, so per-user proxies
/// such as `/tmp/x509up_u%u` work. A missing file means the transfer runs
/// without a credential.
#[derive(Debug, Clone)]
pub struct ProxyFileCredentials {
    path: String,
}

impl ProxyFileCredentials {
    /// Provider reading `path`.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Provider for the path in [`PROXY_ENV`], when set.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        std::env::var(PROXY_ENV)
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(Self::new)
    }

    fn path_for(&self, user: &LocalUser) -> PathBuf {
        PathBuf::from(self.path.replace("%u", &user.uid.to_string()))
    }
}

#[async_trait]
impl CredentialProvider for ProxyFileCredentials {
    async fn credential_for(&self, user: &LocalUser) -> anyhow::Result<Option<Credential>> {
        let path = self.path_for(user);
        match tokio::fs::read(&path).await {
            Ok(material) => Ok(Some(Credential::new(path.display().to_string(), material))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no proxy file, transferring without credential");
                Ok(None)
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("failed to read proxy file {}", path.display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_per_user_proxy() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("x509up_u1000"), b"proxy-bytes")?;
        let pattern = dir.path().join("x509up_u%u").display().to_string();
        let provider = ProxyFileCredentials::new(pattern);

        let credential = provider
            .credential_for(&LocalUser::new("alice", 1000, 1000))
            .await?
            .expect("proxy present");
        assert_eq!(credential.material(), b"proxy-bytes");
        assert!(credential.identity().ends_with("x509up_u1000"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_proxy_is_anonymous() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let provider = ProxyFileCredentials::new(dir.path().join("absent").display().to_string());
        let credential = provider
            .credential_for(&LocalUser::new("bob", 1001, 1001))
            .await?;
        assert!(credential.is_none());
        Ok(())
    }
}
