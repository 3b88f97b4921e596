// agent/src/sys/adcli.rs
//
// Directory adapter backed by the `adcli` command line tool. The agent never
// speaks LDAP/Kerberos itself; adcli authenticates with the credential cache.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::sys::traits::{DirectoryConnector, DirectorySession, DomainTarget, Enrollment};

/// 🛡️ Zero-Trust: Computer and host names end up on an argv, so anything that
/// could be read as an option or carries shell-ish characters is refused.
fn validate_account_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Computer name cannot be empty".to_string());
    }
    if name.starts_with('-') {
        return Err(format!("SECURITY VIOLATION: Option-like account name: '{}'", name));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_') {
        return Err(format!("SECURITY VIOLATION: Invalid characters in account name: '{}'", name));
    }
    Ok(())
}

fn common_args(target: &DomainTarget, ccache: &str) -> Vec<String> {
    let mut args = vec![
        format!("--domain={}", target.domain),
        format!("--domain-realm={}", target.realm),
    ];
    if let Some(dc) = &target.domain_controller {
        args.push(format!("--domain-controller={}", dc));
    }
    args.push(format!("--login-ccache={}", ccache));
    args
}

fn discovery_args(target: &DomainTarget) -> Vec<String> {
    let mut args = vec!["info".to_string()];
    if let Some(dc) = &target.domain_controller {
        args.push(format!("--domain-controller={}", dc));
    }
    args.push("--".to_string());
    args.push(target.domain.clone());
    args
}

/// `klist -s` exits non-zero unless the cache holds unexpired tickets.
fn credential_check_args(ccache: &str) -> Vec<String> {
    vec!["-s".to_string(), "-c".to_string(), ccache.to_string()]
}

async fn run_checked(program: &str, args: &[String], what: &str) -> Result<(), String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| format!("Failed to spawn {}: {}", program, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "{} failed with code {}: {}",
            what,
            output.status.code().unwrap_or(-1),
            stderr.trim()
        ));
    }
    Ok(())
}

// ==============================================================================
// 1. Connector
// ==============================================================================

pub struct AdcliConnector {
    adcli_path: String,
    klist_path: String,
    ccache: String,
}

impl AdcliConnector {
    pub fn new(adcli_path: String, klist_path: String, ccache: String) -> Self {
        Self {
            adcli_path,
            klist_path,
            ccache,
        }
    }
}

#[async_trait]
impl DirectoryConnector for AdcliConnector {
    /// Discovers a reachable DC, then proves the credential cache holds valid
    /// tickets. Either failure surfaces here, before any account is touched.
    async fn connect(&self, target: &DomainTarget) -> Result<Box<dyn DirectorySession>, String> {
        validate_account_name(&target.domain)?;

        let what = format!("Discovery of domain {}", target.domain);
        run_checked(&self.adcli_path, &discovery_args(target), &what).await?;

        let what = format!("Credential check of {} for realm {}", self.ccache, target.realm);
        run_checked(&self.klist_path, &credential_check_args(&self.ccache), &what).await?;

        debug!("Connected to domain {} ({})", target.domain, target.realm);

        Ok(Box::new(AdcliSession {
            adcli_path: self.adcli_path.clone(),
            common_args: common_args(target, &self.ccache),
        }))
    }
}

// ==============================================================================
// 2. Session
// ==============================================================================

pub struct AdcliSession {
    adcli_path: String,
    common_args: Vec<String>,
}

impl AdcliSession {
    fn scoped_args(&self, enrollment: &Enrollment<'_>) -> Result<Vec<String>, String> {
        validate_account_name(enrollment.computer_name)?;

        let mut args = self.common_args.clone();
        if let Some(ou) = enrollment.domain_ou {
            args.push(format!("--domain-ou={}", ou));
        }
        Ok(args)
    }

    /// `preset-computer`: creates the account, records the real host name as
    /// its dNSHostName and sets the one-time password.
    fn join_args(&self, enrollment: &Enrollment<'_>) -> Result<Vec<String>, String> {
        let fqdn = enrollment
            .host_fqdn
            .ok_or("A host FQDN is required to join a computer account")?;
        validate_account_name(fqdn)?;
        let password = enrollment
            .password
            .ok_or("A password is required to join a computer account")?;

        let mut args = vec!["preset-computer".to_string()];
        args.extend(self.scoped_args(enrollment)?);
        args.push(format!("--host-fqdn={}", fqdn));
        args.push(password.use_secret(|p| format!("--one-time-password={}", p)));
        Ok(args)
    }

    /// `reset-computer`: rewrites the password of an account that already exists.
    fn reset_args(&self, enrollment: &Enrollment<'_>) -> Result<Vec<String>, String> {
        let password = enrollment
            .password
            .ok_or("A password is required to reset a computer account")?;

        let mut args = vec!["reset-computer".to_string()];
        args.extend(self.scoped_args(enrollment)?);
        args.push(password.use_secret(|p| format!("--one-time-password={}", p)));
        Ok(args)
    }

    fn delete_args(&self, enrollment: &Enrollment<'_>) -> Result<Vec<String>, String> {
        validate_account_name(enrollment.computer_name)?;
        // delete-computer locates the account by name; the OU is not an input.
        let mut args = vec!["delete-computer".to_string()];
        args.extend(self.common_args.iter().cloned());
        Ok(args)
    }

    async fn run(&self, args: Vec<String>, computer_name: &str) -> Result<(), String> {
        let subcommand = args.first().cloned().unwrap_or_default();
        let output = Command::new(&self.adcli_path)
            .args(&args)
            .arg("--")
            .arg(computer_name)
            .output()
            .await
            .map_err(|e| format!("Failed to spawn adcli {}: {}", subcommand, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "adcli {} for {} exited with code {}: {}",
                subcommand,
                computer_name,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ));
        }

        Ok(())
    }
}

#[async_trait]
impl DirectorySession for AdcliSession {
    async fn join(&self, enrollment: &Enrollment<'_>) -> Result<(), String> {
        let args = self.join_args(enrollment)?;
        debug!(
            "Presetting computer account {} for {}",
            enrollment.computer_name,
            enrollment.host_fqdn.unwrap_or_default()
        );
        self.run(args, enrollment.computer_name).await
    }

    async fn set_password(&self, enrollment: &Enrollment<'_>) -> Result<(), String> {
        let args = self.reset_args(enrollment)?;
        debug!("Resetting password of computer account {}", enrollment.computer_name);
        self.run(args, enrollment.computer_name).await
    }

    async fn delete(&self, enrollment: &Enrollment<'_>) -> Result<(), String> {
        let args = self.delete_args(enrollment)?;
        debug!("Deleting computer account {}", enrollment.computer_name);
        self.run(args, enrollment.computer_name).await
    }
}
