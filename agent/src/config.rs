// agent/src/config.rs

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::provider::RetryPolicy;
use crate::sys::naming::ComputerNamePolicy;

const ENV_PREFIX: &str = "REALM_AD_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting REALM_AD_{0}")]
    Missing(&'static str),

    #[error("invalid value for REALM_AD_{name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Immutable realm settings, built once at startup and shared read-only by every request.
#[derive(Clone, Debug)]
pub struct RealmConfig {
    pub realm: String,
    pub keytab_path: PathBuf,
    pub principal: String,
    pub domain_controller: Option<String>,
    pub ou: Option<String>,
    pub naming: ComputerNamePolicy,
    pub retry: RetryPolicy,
}

impl RealmConfig {
    pub fn new(
        realm: impl Into<String>,
        keytab_path: impl Into<PathBuf>,
        principal: impl Into<String>,
    ) -> Self {
        Self {
            realm: realm.into(),
            keytab_path: keytab_path.into(),
            principal: principal.into(),
            domain_controller: None,
            ou: None,
            naming: ComputerNamePolicy::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// The DNS domain is always the lowercase realm.
    pub fn domain(&self) -> String {
        self.realm.to_lowercase()
    }

    pub fn matches_realm(&self, realm: &str) -> bool {
        realm.eq_ignore_ascii_case(&self.realm)
    }
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    // 🛡️ SLA Boundary: Network & Identity
    pub socket_path: String,
    pub expected_api_uid: u32,

    // 🔑 Kerberos & Directory Tooling
    pub ccache: String,
    pub kinit_path: String,
    pub adcli_path: String,
    pub klist_path: String,

    pub realm: RealmConfig,
}

impl AgentConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Keys are the unprefixed
    /// setting names (`REALM`, `KEYTAB_PATH`, ...) and are prefixed with `REALM_AD_`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parse_or(get("JOIN_MAX_ATTEMPTS"), "JOIN_MAX_ATTEMPTS", defaults.max_attempts)?,
            base_delay: Duration::from_secs(parse_or(
                get("JOIN_BASE_DELAY_SECS"),
                "JOIN_BASE_DELAY_SECS",
                defaults.base_delay.as_secs(),
            )?),
        };

        let naming = ComputerNamePolicy {
            prefix: get("COMPUTERNAME_PREFIX").unwrap_or_default(),
            hash: parse_flag(get("COMPUTERNAME_HASH"), "COMPUTERNAME_HASH")?,
            use_fqdn: parse_flag(get("COMPUTERNAME_USE_FQDN"), "COMPUTERNAME_USE_FQDN")?,
        };

        let mut realm = RealmConfig::new(
            required("REALM")?,
            required("KEYTAB_PATH")?,
            required("PRINCIPAL")?,
        );
        realm.domain_controller = get("DOMAIN_CONTROLLER");
        realm.ou = get("OU");
        realm.naming = naming;
        realm.retry = retry;

        // 🛡️ Zero-Trust Identity Parsing: a non-numeric UID refuses startup rather
        // than silently widening who may talk to the socket.
        let expected_api_uid = parse_or(get("API_UID"), "API_UID", 0u32)?;

        Ok(Self {
            socket_path: get("SOCKET_PATH")
                .unwrap_or_else(|| "/var/run/realm-ad/agent.sock".to_string()),
            expected_api_uid,
            ccache: get("CCACHE").unwrap_or_else(|| "FILE:/var/run/realm-ad/krb5cc".to_string()),
            kinit_path: get("KINIT_PATH").unwrap_or_else(|| "kinit".to_string()),
            adcli_path: get("ADCLI_PATH").unwrap_or_else(|| "adcli".to_string()),
            klist_path: get("KLIST_PATH").unwrap_or_else(|| "klist".to_string()),
            realm,
        })
    }
}

fn parse_or<T: FromStr>(value: Option<String>, name: &'static str, default: T) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(v) => v.parse::<T>().map_err(|_| ConfigError::Invalid { name, value: v }),
    }
}

fn parse_flag(value: Option<String>, name: &'static str) -> Result<bool, ConfigError> {
    let Some(v) = value else {
        return Ok(false);
    };
    match v.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid { name, value: v }),
    }
}
