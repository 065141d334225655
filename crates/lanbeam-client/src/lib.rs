pub mod config;
pub mod events;
pub mod node;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use lanbeam_net::connect::{candidate_endpoints, local_address, local_ipv4};
use lanbeam_net::storage::{DirectoryTarget, OutgoingFile};
use lanbeam_server::{spawn_registry, ServerConfig};
use lanbeam_shared::types::{DeviceIdentity, DeviceRecord};

use crate::config::NodeConfig;
use crate::events::NodeEvent;
use crate::node::{spawn_node, NodeHandle, NodeOptions};

/// Run a headless node until Ctrl+C.
///
/// Files named on the command line are offered to the first reachable
/// device matching `LANBEAM_SEND_TO`. Incoming requests are accepted into
/// `LANBEAM_INBOX` when it is set and rejected otherwise.
pub async fn run() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("lanbeam_client_lib=debug,lanbeam_net=debug,lanbeam_server=info,warn")
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("Starting Lanbeam node v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::from_env();
    info!(?config, "Loaded configuration");

    let address = config.advertise_addr.clone().unwrap_or_else(local_address);
    let advertise_ip: IpAddr = address
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let identity = DeviceIdentity::generate(config.device_name.clone(), address.clone());
    info!(id = %identity.id, name = %identity.name, address = %identity.address, "Local identity");

    if config.embed_registry {
        start_embedded_registry(&config, &identity).await;
    }

    let mut outgoing = load_files(std::env::args().skip(1).map(PathBuf::from)).await;

    let mut options = NodeOptions::new(
        identity,
        advertise_ip,
        candidate_endpoints(config.registry_port, local_ipv4().map(IpAddr::V4)),
    );
    options.session.chunk_delay = config.chunk_delay;
    options.session.accept_timeout = config.accept_timeout;

    let (handle, mut events, task) = spawn_node(options);
    handle.scan().await?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    warn!("Node task ended");
                    break;
                };
                log_event(&event);
                if let Err(e) = react(&handle, &config, &mut outgoing, event).await {
                    warn!(error = %e, "Failed to act on event");
                }
            }
            _ = &mut shutdown => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    let _ = handle.shutdown().await;
    task.await?;
    Ok(())
}

async fn start_embedded_registry(config: &NodeConfig, identity: &DeviceIdentity) {
    let server_config = ServerConfig {
        bind_addr: SocketAddr::from(([0, 0, 0, 0], config.registry_port)),
        device_name: Some(identity.name.clone()),
        advertise_addr: Some(identity.address.clone()),
        ..ServerConfig::default()
    };

    match spawn_registry(server_config, identity.clone()).await {
        Ok((addr, mut notifications)) => {
            info!(addr = %addr, "Embedded registry listening");
            tokio::spawn(async move {
                while let Some(notification) = notifications.recv().await {
                    debug!(?notification, "Registry notification");
                }
            });
        }
        // Another node on this machine already hosts one.
        Err(e) => warn!(error = %e, "Embedded registry not started, joining as client"),
    }
}

async fn load_files(paths: impl Iterator<Item = PathBuf>) -> Vec<OutgoingFile> {
    let mut files = Vec::new();
    for path in paths {
        match OutgoingFile::from_path(&path).await {
            Ok(file) => files.push(file),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping file"),
        }
    }
    files
}

fn log_event(event: &NodeEvent) {
    match serde_json::to_string(event) {
        Ok(json) => info!(event = event.name(), "{json}"),
        Err(e) => warn!(event = event.name(), error = %e, "Failed to serialize event"),
    }
}

async fn react(
    handle: &NodeHandle,
    config: &NodeConfig,
    outgoing: &mut Vec<OutgoingFile>,
    event: NodeEvent,
) -> anyhow::Result<()> {
    match event {
        NodeEvent::TransferRequested { from, .. } => match &config.inbox_dir {
            Some(inbox) => {
                handle
                    .accept(from, Arc::new(DirectoryTarget::new(inbox.clone())))
                    .await?
            }
            None => handle.reject(from).await?,
        },
        NodeEvent::DeviceDiscovered(record)
            if !outgoing.is_empty() && is_send_target(&record, config.send_to.as_deref()) =>
        {
            info!(device = %record.id, name = %record.name, files = outgoing.len(), "Offering files");
            handle
                .send_files(record.id, std::mem::take(outgoing))
                .await?;
        }
        _ => {}
    }
    Ok(())
}

/// Whether `record` is a routable device matching `wanted` (an id or a
/// display name). Without a filter any routable device matches.
fn is_send_target(record: &DeviceRecord, wanted: Option<&str>) -> bool {
    if record.session_key.is_none() {
        return false;
    }
    match wanted {
        Some(wanted) => record.id.as_str() == wanted || record.name == wanted,
        None => true,
    }
}
