//! Node configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use lanbeam_shared::constants::{CHUNK_DELAY_MS, DEFAULT_REGISTRY_PORT};

/// Headless node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Port the registry listens on (locally and on the LAN).
    /// Env: `LANBEAM_REGISTRY_PORT`
    /// Default: `3000`
    pub registry_port: u16,

    /// Start a registry inside this process. A failed bind (another
    /// registry already owns the port) is logged and the node carries on as
    /// a plain client.
    /// Env: `LANBEAM_EMBED_REGISTRY` (true/false)
    /// Default: `true`
    pub embed_registry: bool,

    /// Display name. Env: `LANBEAM_DEVICE_NAME`. Default: generated.
    pub device_name: Option<String>,

    /// Address announced to peers and used for data-channel offers.
    /// Env: `LANBEAM_ADVERTISE_ADDR`. Default: detected LAN address.
    pub advertise_addr: Option<String>,

    /// Directory incoming files are written to. When set, every request is
    /// accepted; when unset, every request is rejected.
    /// Env: `LANBEAM_INBOX`
    pub inbox_dir: Option<PathBuf>,

    /// Device id or name to send the command-line files to. Default: the
    /// first reachable device.
    /// Env: `LANBEAM_SEND_TO`
    pub send_to: Option<String>,

    /// Pause after each chunk on the send path.
    /// Env: `LANBEAM_CHUNK_DELAY_MS`
    /// Default: `5`
    pub chunk_delay: Duration,

    /// How long an accepted transfer waits for the sender to dial in.
    /// Env: `LANBEAM_ACCEPT_TIMEOUT_SECS`
    /// Default: `60`
    pub accept_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            registry_port: DEFAULT_REGISTRY_PORT,
            embed_registry: true,
            device_name: None,
            advertise_addr: None,
            inbox_dir: None,
            send_to: None,
            chunk_delay: Duration::from_millis(CHUNK_DELAY_MS),
            accept_timeout: Duration::from_secs(lanbeam_net::session::ACCEPT_TIMEOUT_SECS),
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup("LANBEAM_REGISTRY_PORT") {
            match val.parse::<u16>() {
                Ok(port) if port != 0 => config.registry_port = port,
                _ => tracing::warn!(value = %val, "Invalid LANBEAM_REGISTRY_PORT, using default"),
            }
        }

        if let Some(val) = lookup("LANBEAM_EMBED_REGISTRY") {
            config.embed_registry = val != "false" && val != "0";
        }

        if let Some(name) = lookup("LANBEAM_DEVICE_NAME").filter(|n| !n.trim().is_empty()) {
            config.device_name = Some(name);
        }

        if let Some(addr) = lookup("LANBEAM_ADVERTISE_ADDR").filter(|a| !a.trim().is_empty()) {
            config.advertise_addr = Some(addr);
        }

        if let Some(dir) = lookup("LANBEAM_INBOX").filter(|d| !d.trim().is_empty()) {
            config.inbox_dir = Some(PathBuf::from(dir));
        }

        if let Some(peer) = lookup("LANBEAM_SEND_TO").filter(|p| !p.trim().is_empty()) {
            config.send_to = Some(peer);
        }

        if let Some(val) = lookup("LANBEAM_CHUNK_DELAY_MS") {
            match val.parse::<u64>() {
                Ok(ms) => config.chunk_delay = Duration::from_millis(ms),
                Err(_) => tracing::warn!(value = %val, "Invalid LANBEAM_CHUNK_DELAY_MS, using default"),
            }
        }

        if let Some(val) = lookup("LANBEAM_ACCEPT_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.accept_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid LANBEAM_ACCEPT_TIMEOUT_SECS, using default"),
            }
        }

        config
    }
}
