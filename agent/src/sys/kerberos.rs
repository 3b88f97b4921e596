// agent/src/sys/kerberos.rs

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

use crate::sys::traits::CredentialCache;

/// Initializes a Kerberos credential cache from a keytab with `kinit -k`.
pub struct KinitCredentialCache {
    kinit_path: String,
    ccache: String, // Injected via AgentConfig, e.g. "FILE:/var/run/realm-ad/krb5cc"
}

impl KinitCredentialCache {
    pub fn new(kinit_path: String, ccache: String) -> Self {
        Self { kinit_path, ccache }
    }
}

#[async_trait]
impl CredentialCache for KinitCredentialCache {
    async fn init(&self, keytab_path: &Path, principal: &str) -> Result<(), String> {
        // 🛡️ Zero-Trust Guard: Argument Injection Protection
        if principal.is_empty() || principal.starts_with('-') {
            return Err(format!("SECURITY VIOLATION: Invalid principal '{}'", principal));
        }

        debug!("Initializing credential cache {} for {}", self.ccache, principal);

        let output = Command::new(&self.kinit_path)
            .env("KRB5CCNAME", &self.ccache)
            .arg("-k")
            .arg("-t")
            .arg(keytab_path)
            .arg("-c")
            .arg(&self.ccache)
            .arg("--")
            .arg(principal)
            .output()
            .await
            .map_err(|e| format!("Failed to spawn kinit: {}", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "kinit for {} failed with code {}: {}",
                principal,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_option_like_principal_before_spawning() {
        let cache = KinitCredentialCache::new("/nonexistent/kinit".into(), "MEMORY:test".into());
        let err = cache
            .init(Path::new("/etc/krb5.keytab"), "-V")
            .await
            .unwrap_err();
        assert!(err.contains("SECURITY VIOLATION"));
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let cache = KinitCredentialCache::new("/nonexistent/kinit".into(), "MEMORY:test".into());
        let err = cache
            .init(Path::new("/etc/krb5.keytab"), "realm-proxy@EXAMPLE.COM")
            .await
            .unwrap_err();
        assert!(err.contains("Failed to spawn kinit"));
    }
}
