// agent/src/sys/naming.rs
//
// Hostname -> Active Directory computer name derivation. Pure, no I/O.

use sha2::{Digest, Sha256};

/// NetBIOS computer names are capped at 15 characters (KB909264).
pub const COMPUTER_NAME_MAX_LEN: usize = 15;

/// Policy knobs for turning a host FQDN into a bounded computer account name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputerNamePolicy {
    pub prefix: String,
    pub hash: bool,
    pub use_fqdn: bool,
}

impl ComputerNamePolicy {
    /// Derives the computer name for `host_fqdn`.
    ///
    /// 1. Keep only the first DNS label unless `use_fqdn` is set.
    /// 2. Replace the value with its hex SHA-256 digest when `hash` is set.
    /// 3. Prepend `prefix` unless the value already starts with it (hashing always re-applies it).
    /// 4. Uppercase and cut to [`COMPUTER_NAME_MAX_LEN`] characters.
    pub fn derive(&self, host_fqdn: &str) -> String {
        let mut name = if self.use_fqdn {
            host_fqdn.to_string()
        } else {
            host_fqdn.split('.').next().unwrap_or_default().to_string()
        };

        if self.hash {
            name = hex::encode(Sha256::digest(name.as_bytes()));
        }

        if self.should_apply_prefix(&name) {
            name = format!("{}{}", self.prefix, name);
        }

        // Uppercasing first keeps the bound in characters even for non-ASCII input.
        name.to_uppercase()
            .chars()
            .take(COMPUTER_NAME_MAX_LEN)
            .collect()
    }

    fn should_apply_prefix(&self, name: &str) -> bool {
        if name.is_empty() || self.prefix.is_empty() {
            return false;
        }

        let head: String = name.chars().take(self.prefix.chars().count()).collect();
        let already_prefixed = head.eq_ignore_ascii_case(&self.prefix);

        self.hash || !already_prefixed
    }
}
