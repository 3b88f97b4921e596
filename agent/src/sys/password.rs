// agent/src/sys/password.rs

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;

use crate::sys::secrets::ComputerPassword;

pub const PASSWORD_LENGTH: usize = 20;

/// Generates a one-time computer password drawn uniformly from `[A-Za-z0-9]`.
/// 🛡️ Uses `OsRng` (the operating system CSPRNG), never a seeded PRNG.
pub fn generate_password() -> ComputerPassword {
    let raw: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect();

    ComputerPassword::new(raw)
}
