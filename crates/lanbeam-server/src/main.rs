use tracing::info;
use tracing_subscriber::EnvFilter;

use lanbeam_net::connect::local_address;
use lanbeam_server::{registry::RegistryNotification, spawn_registry, ServerConfig};
use lanbeam_shared::types::DeviceIdentity;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lanbeam_server=debug")),
        )
        .init();

    info!("Starting Lanbeam registry v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration and host identity
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let address = config.advertise_addr.clone().unwrap_or_else(local_address);
    let host = DeviceIdentity::generate(config.device_name.clone(), address);
    info!(id = %host.id, name = %host.name, address = %host.address, "Host identity");

    // -----------------------------------------------------------------------
    // 3. Run the registry until Ctrl+C
    // -----------------------------------------------------------------------
    let (addr, mut notifications) = spawn_registry(config, host).await?;
    info!(addr = %addr, "Registry listening");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            notification = notifications.recv() => {
                match notification {
                    Some(RegistryNotification::DeviceAnnounced(record)) => {
                        info!(device = %record.id, name = %record.name, address = %record.address, "Device online");
                    }
                    Some(RegistryNotification::SessionClosed(key)) => {
                        info!(session = %key.short(), "Session closed");
                    }
                    None => {
                        tracing::error!("Registry task ended");
                        break;
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    Ok(())
}
