// agent/src/provider.rs
//
// Realm orchestration: realm check, computer-name derivation and the
// create/reset/delete workflow with its self-healing retry state machine.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::RealmConfig;
use crate::sys::enroll::AccountEnroller;
use crate::sys::password::generate_password;
use crate::sys::secrets::ComputerPassword;
use crate::sys::traits::{CredentialCache, DirectoryConnector, DirectorySession, DomainTarget};

#[derive(Debug, Error)]
pub enum RealmError {
    #[error("Unknown realm {requested} (configured: {configured})")]
    RealmMismatch { requested: String, configured: String },

    #[error("Credential cache initialization failed: {0}")]
    CredentialCache(String),

    #[error("Directory operation failed: {0}")]
    DirectoryOperation(String),
}

/// Bounds of the password-reset loop entered when a join fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 7,
            base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateParams {
    /// The account is asserted to exist already; only its password is refreshed.
    pub rebuild: bool,
}

/// How a create request ended. Every variant still hands the password back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JoinOutcome {
    Joined,
    PasswordReset,
    RecoveredAfterRetry { attempts: u32 },
    RejoinedAfterDelete,
    FailedFinalAttempt { error: String },
}

#[derive(Debug)]
pub struct JoinResult {
    pub password: ComputerPassword,
    pub outcome: JoinOutcome,
}

/// Outcome of one iteration of the reset loop.
enum ResetStep {
    Done,
    Retryable(String),
    Exhausted(String),
}

pub struct RealmProvider {
    config: Arc<RealmConfig>,
    ccache: Box<dyn CredentialCache>,
    connector: Box<dyn DirectoryConnector>,
}

impl RealmProvider {
    pub fn new(
        config: Arc<RealmConfig>,
        ccache: Box<dyn CredentialCache>,
        connector: Box<dyn DirectoryConnector>,
    ) -> Self {
        info!("🔑 Realm provider initialized for {}", config.realm);
        Self {
            config,
            ccache,
            connector,
        }
    }

    pub fn check_realm(&self, realm: &str) -> Result<(), RealmError> {
        if !self.config.matches_realm(realm) {
            return Err(RealmError::RealmMismatch {
                requested: realm.to_string(),
                configured: self.config.realm.clone(),
            });
        }
        Ok(())
    }

    /// Placeholder existence check: every host is reported as present.
    pub fn find(&self, _host_fqdn: &str) -> bool {
        true
    }

    pub fn computer_name(&self, host_fqdn: &str) -> String {
        self.config.naming.derive(host_fqdn)
    }

    pub async fn create(
        &self,
        realm: &str,
        host_fqdn: &str,
        params: &CreateParams,
    ) -> Result<JoinResult, RealmError> {
        info!("Create requested for {} in {} (rebuild: {})", host_fqdn, realm, params.rebuild);
        self.check_realm(realm)?;

        let session = self.open_session().await?;
        let password = generate_password();
        let computer_name = self.computer_name(host_fqdn);
        let enroller = AccountEnroller::new(session.as_ref(), self.config.ou.as_deref());

        if params.rebuild {
            enroller
                .set_password(&computer_name, &password)
                .await
                .map_err(RealmError::DirectoryOperation)?;
            info!("Password of {} reset for rebuild of {}", computer_name, host_fqdn);
            return Ok(JoinResult {
                password,
                outcome: JoinOutcome::PasswordReset,
            });
        }

        let outcome = match enroller.join(host_fqdn, &computer_name, &password).await {
            Ok(()) => {
                info!("✅ Computer {} joined for {}", computer_name, host_fqdn);
                JoinOutcome::Joined
            }
            Err(e) => {
                warn!("Join of {} for {} failed: {}", computer_name, host_fqdn, e);
                self.recover(session.as_ref(), host_fqdn, &computer_name, &password)
                    .await
            }
        };

        Ok(JoinResult { password, outcome })
    }

    pub async fn delete(&self, realm: &str, host_fqdn: &str) -> Result<(), RealmError> {
        info!("Delete requested for {} in {}", host_fqdn, realm);
        let session = self.open_session().await?;
        self.check_realm(realm)?;

        let computer_name = self.computer_name(host_fqdn);
        AccountEnroller::new(session.as_ref(), self.config.ou.as_deref())
            .delete(&computer_name)
            .await
            .map_err(RealmError::DirectoryOperation)?;

        info!("🗑️ Computer {} deleted for {}", computer_name, host_fqdn);
        Ok(())
    }

    /// Kerberos init + directory connect. A fresh session per call, never cached.
    async fn open_session(&self) -> Result<Box<dyn DirectorySession>, RealmError> {
        self.ccache
            .init(&self.config.keytab_path, &self.config.principal)
            .await
            .map_err(RealmError::CredentialCache)?;

        let target = DomainTarget {
            domain: self.config.domain(),
            realm: self.config.realm.clone(),
            domain_controller: self.config.domain_controller.clone(),
        };
        self.connector
            .connect(&target)
            .await
            .map_err(RealmError::DirectoryOperation)
    }

    /// Recovery after a failed join: the account probably exists from an earlier
    /// partial join, so keep resetting its password with exponential backoff.
    /// Once the attempts are exhausted, delete it and join one last time.
    async fn recover(
        &self,
        session: &dyn DirectorySession,
        host_fqdn: &str,
        computer_name: &str,
        password: &ComputerPassword,
    ) -> JoinOutcome {
        let retry = self.config.retry;
        let enroller = AccountEnroller::new(session, self.config.ou.as_deref());
        info!(
            "Resetting password of {} up to {} times",
            computer_name, retry.max_attempts
        );

        let mut attempt: u32 = 0;
        let mut delay = retry.base_delay;

        loop {
            attempt += 1;
            let step = match enroller.set_password(computer_name, password).await {
                Ok(()) => ResetStep::Done,
                Err(e) if attempt <= retry.max_attempts => ResetStep::Retryable(e),
                Err(e) => ResetStep::Exhausted(e),
            };

            match step {
                ResetStep::Done => {
                    info!("Password of {} reset after {} attempt(s)", computer_name, attempt);
                    return JoinOutcome::RecoveredAfterRetry { attempts: attempt };
                }
                ResetStep::Retryable(e) => {
                    warn!(
                        "Attempt {}/{} to reset password failed with error: {}. Retrying in {:?}.",
                        attempt, retry.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                ResetStep::Exhausted(e) => {
                    warn!(
                        "Max attempts to reset password of {} reached ({}). Trying 1 last attempt",
                        computer_name, e
                    );
                    return self.rejoin(session, host_fqdn, computer_name, password).await;
                }
            }
        }
    }

    /// Last resort: best-effort delete of the account followed by exactly one join.
    /// A fresh session is tried first; if that fails the current one is reused.
    async fn rejoin(
        &self,
        session: &dyn DirectorySession,
        host_fqdn: &str,
        computer_name: &str,
        password: &ComputerPassword,
    ) -> JoinOutcome {
        let fresh = match self.open_session().await {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("Reconnect before final attempt failed, reusing session: {}", e);
                None
            }
        };
        let session: &dyn DirectorySession = match fresh.as_deref() {
            Some(fresh) => fresh,
            None => session,
        };
        let enroller = AccountEnroller::new(session, self.config.ou.as_deref());

        enroller.try_delete(computer_name).await;

        match enroller.join(host_fqdn, computer_name, password).await {
            Ok(()) => {
                info!("Final attempt for {} joined {}", host_fqdn, computer_name);
                JoinOutcome::RejoinedAfterDelete
            }
            Err(e) => {
                error!("Final attempt for {} failed: {}", host_fqdn, e);
                JoinOutcome::FailedFinalAttempt { error: e }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sys::naming::ComputerNamePolicy;
    use crate::sys::traits::Enrollment;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Shared record of every collaborator call, in order.
    #[derive(Default)]
    pub(crate) struct Script {
        pub calls: Mutex<Vec<String>>,
        pub join_results: Mutex<VecDeque<Result<(), String>>>,
        pub password_results: Mutex<VecDeque<Result<(), String>>>,
        pub delete_results: Mutex<VecDeque<Result<(), String>>>,
        pub connect_results: Mutex<VecDeque<Result<(), String>>>,
        pub cache_results: Mutex<VecDeque<Result<(), String>>>,
        pub password_times: Mutex<Vec<Instant>>,
        pub seen_passwords: Mutex<Vec<String>>,
    }

    impl Script {
        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn next(queue: &Mutex<VecDeque<Result<(), String>>>) -> Result<(), String> {
            queue.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }
    }

    pub(crate) struct FakeCache(pub Arc<Script>);

    #[async_trait]
    impl CredentialCache for FakeCache {
        async fn init(&self, keytab_path: &Path, principal: &str) -> Result<(), String> {
            self.0.log(format!("kinit {} {}", keytab_path.display(), principal));
            Script::next(&self.0.cache_results)
        }
    }

    pub(crate) struct FakeConnector(pub Arc<Script>);

    #[async_trait]
    impl DirectoryConnector for FakeConnector {
        async fn connect(&self, target: &DomainTarget) -> Result<Box<dyn DirectorySession>, String> {
            self.0.log(format!("connect {} {}", target.domain, target.realm));
            Script::next(&self.0.connect_results)?;
            Ok(Box::new(FakeSession(self.0.clone())))
        }
    }

    struct FakeSession(Arc<Script>);

    impl FakeSession {
        fn remember_password(&self, e: &Enrollment<'_>) {
            if let Some(p) = e.password {
                p.use_secret(|p| self.0.seen_passwords.lock().unwrap().push(p.to_string()));
            }
        }
    }

    #[async_trait]
    impl DirectorySession for FakeSession {
        async fn join(&self, e: &Enrollment<'_>) -> Result<(), String> {
            self.remember_password(e);
            self.0.log(format!("join {} {}", e.computer_name, e.host_fqdn.unwrap_or_default()));
            Script::next(&self.0.join_results)
        }

        async fn set_password(&self, e: &Enrollment<'_>) -> Result<(), String> {
            self.remember_password(e);
            self.0.password_times.lock().unwrap().push(Instant::now());
            self.0.log(format!("password {}", e.computer_name));
            Script::next(&self.0.password_results)
        }

        async fn delete(&self, e: &Enrollment<'_>) -> Result<(), String> {
            self.0.log(format!("delete {}", e.computer_name));
            Script::next(&self.0.delete_results)
        }
    }

    pub(crate) fn realm_config() -> RealmConfig {
        let mut config = RealmConfig::new("example.com", "/etc/realm-ad/realm.keytab", "realm-proxy@EXAMPLE.COM");
        config.ou = Some("OU=Linux,DC=example,DC=com".to_string());
        config
    }

    pub(crate) fn provider_with(config: RealmConfig, script: &Arc<Script>) -> RealmProvider {
        RealmProvider::new(
            Arc::new(config),
            Box::new(FakeCache(script.clone())),
            Box::new(FakeConnector(script.clone())),
        )
    }

    fn failures(n: usize) -> VecDeque<Result<(), String>> {
        (0..n).map(|i| Err(format!("ldap error {}", i))).collect()
    }

    #[tokio::test]
    async fn create_matches_realm_case_insensitively_and_joins() {
        let script = Arc::new(Script::default());
        let provider = provider_with(realm_config(), &script);

        let result = provider
            .create("EXAMPLE.COM", "host1.example.com", &CreateParams::default())
            .await
            .unwrap();

        assert_eq!(result.outcome, JoinOutcome::Joined);
        assert_eq!(result.password.use_secret(str::len), 20);
        assert_eq!(
            script.calls(),
            vec![
                "kinit /etc/realm-ad/realm.keytab realm-proxy@EXAMPLE.COM",
                "connect example.com example.com",
                "join HOST1 host1.example.com",
            ]
        );
        // The password handed to the directory is the one returned to the caller.
        let returned = result.password.use_secret(str::to_string);
        assert_eq!(script.seen_passwords.lock().unwrap().as_slice(), [returned]);
    }

    #[tokio::test]
    async fn create_with_wrong_realm_makes_no_directory_calls() {
        let script = Arc::new(Script::default());
        let provider = provider_with(realm_config(), &script);

        let err = provider
            .create("OTHER.ORG", "host1.example.com", &CreateParams::default())
            .await
            .unwrap_err();

        assert!(matches!(err, RealmError::RealmMismatch { .. }));
        assert!(script.calls().is_empty());
    }

    #[tokio::test]
    async fn create_surfaces_connect_failures() {
        let script = Arc::new(Script::default());
        script.connect_results.lock().unwrap().push_back(Err("no DC".into()));
        let provider = provider_with(realm_config(), &script);

        let err = provider
            .create("example.com", "host1.example.com", &CreateParams::default())
            .await
            .unwrap_err();

        assert!(matches!(err, RealmError::DirectoryOperation(ref m) if m == "no DC"));
        assert_eq!(script.count("join"), 0);
    }

    #[tokio::test]
    async fn create_stops_when_credential_cache_fails() {
        let script = Arc::new(Script::default());
        script.cache_results.lock().unwrap().push_back(Err("keytab unreadable".into()));
        let provider = provider_with(realm_config(), &script);

        let err = provider
            .create("example.com", "host1.example.com", &CreateParams::default())
            .await
            .unwrap_err();

        assert!(matches!(err, RealmError::CredentialCache(ref m) if m == "keytab unreadable"));
        assert_eq!(
            script.calls(),
            vec!["kinit /etc/realm-ad/realm.keytab realm-proxy@EXAMPLE.COM"]
        );
        assert!(script.seen_passwords.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rebuild_skips_join_and_resets_password() {
        let script = Arc::new(Script::default());
        let provider = provider_with(realm_config(), &script);

        let result = provider
            .create("example.com", "host1.example.com", &CreateParams { rebuild: true })
            .await
            .unwrap();

        assert_eq!(result.outcome, JoinOutcome::PasswordReset);
        assert_eq!(script.count("join"), 0);
        assert_eq!(script.count("password HOST1"), 1);
    }

    #[tokio::test]
    async fn rebuild_failure_is_propagated() {
        let script = Arc::new(Script::default());
        *script.password_results.lock().unwrap() = failures(1);
        let provider = provider_with(realm_config(), &script);

        let err = provider
            .create("example.com", "host1.example.com", &CreateParams { rebuild: true })
            .await
            .unwrap_err();

        assert!(matches!(err, RealmError::DirectoryOperation(_)));
        assert_eq!(script.count("password"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_join_recovers_on_first_reset() {
        let script = Arc::new(Script::default());
        *script.join_results.lock().unwrap() = failures(1);
        let provider = provider_with(realm_config(), &script);

        let started = Instant::now();
        let result = provider
            .create("example.com", "host1.example.com", &CreateParams::default())
            .await
            .unwrap();

        assert_eq!(result.outcome, JoinOutcome::RecoveredAfterRetry { attempts: 1 });
        assert_eq!(script.count("password"), 1);
        assert_eq!(script.count("delete"), 0);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_retries_back_off_exponentially() {
        let script = Arc::new(Script::default());
        *script.join_results.lock().unwrap() = failures(1);
        *script.password_results.lock().unwrap() = failures(3);
        let provider = provider_with(realm_config(), &script);

        let started = Instant::now();
        let result = provider
            .create("example.com", "host1.example.com", &CreateParams::default())
            .await
            .unwrap();

        assert_eq!(result.outcome, JoinOutcome::RecoveredAfterRetry { attempts: 4 });
        let offsets: Vec<u64> = script
            .password_times
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.duration_since(started).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 1, 3, 7]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_delete_then_rejoin_once() {
        let script = Arc::new(Script::default());
        // Initial join fails, every reset fails, the final join succeeds.
        *script.join_results.lock().unwrap() = failures(1);
        *script.password_results.lock().unwrap() = failures(8);
        let provider = provider_with(realm_config(), &script);

        let started = Instant::now();
        let result = provider
            .create("example.com", "host1.example.com", &CreateParams::default())
            .await
            .unwrap();

        assert_eq!(result.outcome, JoinOutcome::RejoinedAfterDelete);
        // Seven backoff sleeps (1+2+...+64) precede the eighth, exhausting failure.
        assert_eq!(script.count("password"), 8);
        assert_eq!(started.elapsed().as_secs(), 127);
        assert_eq!(script.count("delete"), 1);
        assert_eq!(script.count("join"), 2);

        let calls = script.calls();
        let tail = &calls[calls.len() - 4..];
        assert_eq!(
            tail,
            [
                "kinit /etc/realm-ad/realm.keytab realm-proxy@EXAMPLE.COM",
                "connect example.com example.com",
                "delete HOST1",
                "join HOST1 host1.example.com",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_delete_errors_are_swallowed_and_final_failure_reported() {
        let script = Arc::new(Script::default());
        let mut config = realm_config();
        config.retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_secs(1),
        };
        *script.join_results.lock().unwrap() = failures(2);
        *script.password_results.lock().unwrap() = failures(3);
        *script.delete_results.lock().unwrap() = failures(1);
        let provider = provider_with(config, &script);

        let result = provider
            .create("example.com", "host1.example.com", &CreateParams::default())
            .await
            .unwrap();

        assert_eq!(
            result.outcome,
            JoinOutcome::FailedFinalAttempt {
                error: "ldap error 1".to_string()
            }
        );
        assert_eq!(result.password.use_secret(str::len), 20);
        assert_eq!(script.count("password"), 3);
        assert_eq!(script.count("delete"), 1);
        assert_eq!(script.count("join"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn final_attempt_reuses_session_when_reconnect_fails() {
        let script = Arc::new(Script::default());
        let mut config = realm_config();
        config.retry = RetryPolicy {
            max_attempts: 0,
            base_delay: Duration::from_secs(1),
        };
        *script.join_results.lock().unwrap() = failures(1);
        *script.password_results.lock().unwrap() = failures(1);
        script.connect_results.lock().unwrap().extend([Ok(()), Err("dc gone".to_string())]);
        let provider = provider_with(config, &script);

        let result = provider
            .create("example.com", "host1.example.com", &CreateParams::default())
            .await
            .unwrap();

        assert_eq!(result.outcome, JoinOutcome::RejoinedAfterDelete);
        assert_eq!(script.count("connect"), 2);
        assert_eq!(script.count("delete"), 1);
    }

    #[tokio::test]
    async fn all_calls_use_the_same_generated_password() {
        let script = Arc::new(Script::default());
        let mut config = realm_config();
        config.retry = RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        };
        *script.join_results.lock().unwrap() = failures(1);
        *script.password_results.lock().unwrap() = failures(2);
        let provider = provider_with(config, &script);

        let result = provider
            .create("example.com", "host1.example.com", &CreateParams::default())
            .await
            .unwrap();

        let returned = result.password.use_secret(str::to_string);
        let seen = script.seen_passwords.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|p| *p == returned));
    }

    #[tokio::test]
    async fn delete_derives_name_and_propagates_errors() {
        let script = Arc::new(Script::default());
        let mut config = realm_config();
        config.naming = ComputerNamePolicy {
            prefix: "lab-".to_string(),
            hash: false,
            use_fqdn: false,
        };
        *script.delete_results.lock().unwrap() = failures(1);
        let provider = provider_with(config, &script);

        let err = provider.delete("EXAMPLE.COM", "node1.example.com").await.unwrap_err();
        assert!(matches!(err, RealmError::DirectoryOperation(ref m) if m == "ldap error 0"));
        assert_eq!(script.calls().last().map(String::as_str), Some("delete LAB-NODE1"));
        assert_eq!(script.count("delete"), 1);

        provider.delete("example.com", "node1.example.com").await.unwrap();
        assert_eq!(script.count("delete"), 2);
    }

    #[tokio::test]
    async fn delete_connects_before_checking_realm() {
        let script = Arc::new(Script::default());
        let provider = provider_with(realm_config(), &script);

        let err = provider.delete("OTHER.ORG", "node1.example.com").await.unwrap_err();
        assert!(matches!(err, RealmError::RealmMismatch { .. }));
        assert_eq!(script.count("connect"), 1);
        assert_eq!(script.count("delete"), 0);
    }

    #[tokio::test]
    async fn delete_stops_when_credential_cache_fails() {
        let script = Arc::new(Script::default());
        script.cache_results.lock().unwrap().push_back(Err("ticket expired".into()));
        let provider = provider_with(realm_config(), &script);

        let err = provider.delete("example.com", "node1.example.com").await.unwrap_err();
        assert!(matches!(err, RealmError::CredentialCache(ref m) if m == "ticket expired"));
        assert_eq!(script.count("connect"), 0);
        assert_eq!(script.count("delete"), 0);
    }

    #[test]
    fn find_always_reports_present() {
        let script = Arc::new(Script::default());
        let provider = provider_with(realm_config(), &script);
        assert!(provider.find("anything.example.com"));
        assert!(script.calls().is_empty());
    }
}
