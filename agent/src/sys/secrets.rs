// agent/src/sys/secrets.rs

use secrecy::{ExposeSecret, Secret};

/// ComputerPassword is the ephemeral one-time credential provisioned for a
/// computer account. It exists only for the duration of a create/reset call.
///
/// 1. It cannot be accidentally logged (`{:?}` prints `[REDACTED]`).
/// 2. When the struct goes out of scope, the heap buffer is zeroized.
#[derive(Debug)]
pub struct ComputerPassword {
    value: Secret<String>,
}

impl ComputerPassword {
    /// Takes ownership of the plaintext so no second copy outlives this call.
    pub fn new(raw: String) -> Self {
        Self {
            value: Secret::new(raw),
        }
    }

    /// Exposes the plaintext to `action` only. The borrow cannot escape the closure.
    pub fn use_secret<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&str) -> R,
    {
        action(self.value.expose_secret())
    }
}
