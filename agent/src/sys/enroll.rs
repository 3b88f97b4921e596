// agent/src/sys/enroll.rs

use tracing::debug;

use crate::sys::secrets::ComputerPassword;
use crate::sys::traits::{DirectorySession, Enrollment};

/// AccountEnroller builds enroll requests against one directory session,
/// scoped to the configured organizational unit.
pub struct AccountEnroller<'a> {
    session: &'a dyn DirectorySession,
    domain_ou: Option<&'a str>,
}

impl<'a> AccountEnroller<'a> {
    pub fn new(session: &'a dyn DirectorySession, domain_ou: Option<&'a str>) -> Self {
        Self { session, domain_ou }
    }

    pub async fn join(
        &self,
        host_fqdn: &str,
        computer_name: &str,
        password: &ComputerPassword,
    ) -> Result<(), String> {
        let enrollment = Enrollment {
            computer_name,
            host_fqdn: Some(host_fqdn),
            domain_ou: self.domain_ou,
            password: Some(password),
        };
        self.session.join(&enrollment).await
    }

    pub async fn set_password(
        &self,
        computer_name: &str,
        password: &ComputerPassword,
    ) -> Result<(), String> {
        let enrollment = Enrollment {
            computer_name,
            host_fqdn: None,
            domain_ou: self.domain_ou,
            password: Some(password),
        };
        self.session.set_password(&enrollment).await
    }

    pub async fn delete(&self, computer_name: &str) -> Result<(), String> {
        let enrollment = Enrollment {
            computer_name,
            host_fqdn: None,
            domain_ou: self.domain_ou,
            password: None,
        };
        self.session.delete(&enrollment).await
    }

    /// Best-effort delete used as cleanup. A failure here never propagates;
    /// the return value only reports whether the account was removed.
    pub async fn try_delete(&self, computer_name: &str) -> bool {
        match self.delete(computer_name).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Ignoring cleanup delete failure for {}: {}", computer_name, e);
                false
            }
        }
    }
}
