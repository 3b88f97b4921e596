// 🛡️ Zero-Trust Architecture: Modules are private, traits and managers are public.

pub mod traits;     // Collaborator contracts
pub mod secrets;    // Memory hygiene (ComputerPassword)
pub mod naming;     // Hostname -> computer name policy
pub mod password;   // One-time password generation
pub mod enroll;     // Enroll requests against a session
pub mod kerberos;   // Credential cache initialization
pub mod adcli;      // Directory client adapter
