// agent/src/main.rs

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnixListenerStream;
use tracing_subscriber::EnvFilter;

mod config;
mod provider;
mod server;
mod sys;

use crate::config::AgentConfig;
use crate::provider::RealmProvider;
use crate::server::RealmAgentService;
use crate::sys::adcli::AdcliConnector;
use crate::sys::kerberos::KinitCredentialCache;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ==============================================================================
    // 1. Configuration & Environment (SLA Layer)
    // ==============================================================================

    // Structured JSON logs; RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AgentConfig::load()?;
    let socket_path = config.socket_path.as_str();
    let socket_dir = Path::new(socket_path)
        .parent()
        .ok_or("Socket path has no parent directory")?;

    // ==============================================================================
    // 2. Secure Socket Initialization
    // ==============================================================================

    if !socket_dir.exists() {
        fs::create_dir_all(socket_dir)?;
    }

    // Clean up existing socket file if it exists from a previous crash/run
    if Path::new(socket_path).exists() {
        fs::remove_file(socket_path)?;
    }

    let uds = UnixListener::bind(socket_path)?;

    // 🛡️ SECURITY BOUNDARY: Restrict socket permissions
    // 0o660 (rw-rw----): the agent and the API group only. Peer UIDs are checked again per connection.
    let mut perms = fs::metadata(socket_path)?.permissions();
    perms.set_mode(0o660);
    fs::set_permissions(socket_path, perms)?;

    // ==============================================================================
    // 3. Dependency Injection & Service Start
    // ==============================================================================

    let provider = RealmProvider::new(
        Arc::new(config.realm.clone()),
        Box::new(KinitCredentialCache::new(config.kinit_path.clone(), config.ccache.clone())),
        Box::new(AdcliConnector::new(
            config.adcli_path.clone(),
            config.klist_path.clone(),
            config.ccache.clone(),
        )),
    );
    let service = Arc::new(RealmAgentService::new(provider, config.expected_api_uid));

    tracing::info!("⚙️ Realm AD agent starting on {}", socket_path);

    let mut incoming = UnixListenerStream::new(uds);
    while let Some(stream) = incoming.next().await {
        match stream {
            Ok(stream) => {
                let service = Arc::clone(&service);
                // One task per client: a create stuck in backoff never blocks other hosts.
                tokio::spawn(async move { service.serve_connection(stream).await });
            }
            Err(e) => tracing::warn!("Failed to accept connection: {}", e),
        }
    }

    Ok(())
}
