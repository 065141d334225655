//! Registry configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the registry can start with zero
//! configuration on a LAN.

use std::net::SocketAddr;

use lanbeam_shared::constants::{APP_NAME, DEFAULT_REGISTRY_PORT};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `LANBEAM_BIND_ADDR`
    /// Default: `0.0.0.0:3000`
    pub bind_addr: SocketAddr,

    /// Display name announced as the registry host's identity.
    /// Env: `LANBEAM_DEVICE_NAME`
    /// Default: generated `User-xxxx`
    pub device_name: Option<String>,

    /// Address announced for the host. Detected from the routing table when
    /// unset.
    /// Env: `LANBEAM_ADVERTISE_ADDR`
    pub advertise_addr: Option<String>,

    /// Human-readable name reported by `/info`.
    /// Env: `LANBEAM_INSTANCE_NAME`
    /// Default: `"Lanbeam Registry"`
    pub instance_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], DEFAULT_REGISTRY_PORT).into(),
            device_name: None,
            advertise_addr: None,
            instance_name: format!("{APP_NAME} Registry"),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("LANBEAM_BIND_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.bind_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid LANBEAM_BIND_ADDR, using default");
            }
        }

        if let Some(name) = lookup("LANBEAM_DEVICE_NAME") {
            if !name.trim().is_empty() {
                config.device_name = Some(name);
            }
        }

        if let Some(addr) = lookup("LANBEAM_ADVERTISE_ADDR") {
            if !addr.trim().is_empty() {
                config.advertise_addr = Some(addr);
            }
        }

        if let Some(name) = lookup("LANBEAM_INSTANCE_NAME") {
            config.instance_name = name;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}
