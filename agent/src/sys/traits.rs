// agent/src/sys/traits.rs
//
// Global contracts for the external collaborators the realm provider drives.
// Everything behind these traits (Kerberos, the directory client) is swappable.

use async_trait::async_trait;
use std::path::Path;

use crate::sys::secrets::ComputerPassword;

// ==============================================================================
// 1. Kerberos Credential Cache
// ==============================================================================

#[async_trait]
pub trait CredentialCache: Send + Sync {
    /// Populates the credential cache for `principal` from `keytab_path`.
    /// A valid cache MUST exist before [`DirectoryConnector::connect`] is called.
    async fn init(&self, keytab_path: &Path, principal: &str) -> Result<(), String>;
}

// ==============================================================================
// 2. Directory Connection
// ==============================================================================

/// Where to connect: the lowercase DNS domain, the Kerberos realm and an optional
/// pinned domain controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainTarget {
    pub domain: String,
    pub realm: String,
    pub domain_controller: Option<String>,
}

#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    /// Opens an authenticated session using the previously initialized credential cache.
    async fn connect(&self, target: &DomainTarget) -> Result<Box<dyn DirectorySession>, String>;
}

// ==============================================================================
// 3. Enrollment Primitives
// ==============================================================================

/// The attributes set on an enroll request before it is executed.
/// 🛡️ The password is borrowed, never copied into the request.
#[derive(Debug)]
pub struct Enrollment<'a> {
    pub computer_name: &'a str,
    pub host_fqdn: Option<&'a str>,
    pub domain_ou: Option<&'a str>,
    pub password: Option<&'a ComputerPassword>,
}

/// An authenticated directory session. Failures are opaque strings: callers
/// treat every error from this boundary the same way.
#[async_trait]
pub trait DirectorySession: Send + Sync {
    /// Creates the computer account and sets its password.
    async fn join(&self, enrollment: &Enrollment<'_>) -> Result<(), String>;

    /// Resets the password of an existing computer account.
    async fn set_password(&self, enrollment: &Enrollment<'_>) -> Result<(), String>;

    /// Deletes the computer account.
    async fn delete(&self, enrollment: &Enrollment<'_>) -> Result<(), String>;
}
