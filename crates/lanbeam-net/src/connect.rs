//! Registry endpoint candidates and bounded connection attempts.
//!
//! A node tries the registry on loopback first, then on the machine's own
//! LAN address. Each attempt is capped by an explicit timeout; a timed-out
//! attempt drops its half-open socket and the next candidate is tried.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use lanbeam_shared::constants::{
    CONNECT_TIMEOUT_MS, RECONNECT_ATTEMPTS, RECONNECT_DELAY_MS, REGISTRY_WS_PATH,
};

use crate::error::ConnectivityError;

/// WebSocket to the presence registry.
pub type RegistryStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One place the registry might be listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Short label for logs ("loopback", "lan").
    pub label: String,
    /// Full `ws://` URL.
    pub url: String,
}

impl Endpoint {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
        }
    }

    /// Registry WebSocket URL on `ip:port`.
    pub fn registry(label: impl Into<String>, ip: IpAddr, port: u16) -> Self {
        Self::new(label, format!("ws://{ip}:{port}{REGISTRY_WS_PATH}"))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.url, self.label)
    }
}

/// Timing knobs for registry connections.
#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    /// Deadline for one connection attempt.
    pub connect_timeout: Duration,
    /// How many times an established link is re-dialled after dropping.
    pub reconnect_attempts: u32,
    /// Fixed pause between re-dials.
    pub reconnect_delay: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            reconnect_attempts: RECONNECT_ATTEMPTS,
            reconnect_delay: Duration::from_millis(RECONNECT_DELAY_MS),
        }
    }
}

/// Ordered candidates: loopback first, then the LAN address if it differs.
pub fn candidate_endpoints(port: u16, lan_ip: Option<IpAddr>) -> Vec<Endpoint> {
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let mut candidates = vec![Endpoint::registry("loopback", loopback, port)];

    if let Some(ip) = lan_ip.filter(|ip| !ip.is_loopback()) {
        candidates.push(Endpoint::registry("lan", ip, port));
    }

    candidates
}

/// Determine the LAN IPv4 address of this machine.
///
/// "Connects" a UDP socket to a public address so the OS picks the outgoing
/// interface; no packet is sent. Returns `None` when only loopback is
/// available.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;

    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// LAN address as a string, falling back to loopback.
pub fn local_address() -> String {
    local_ipv4()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| Ipv4Addr::LOCALHOST.to_string())
}

/// Open a WebSocket to `endpoint`, giving up after `timeout`.
pub async fn connect_endpoint(
    endpoint: &Endpoint,
    timeout: Duration,
) -> Result<RegistryStream, ConnectivityError> {
    debug!(endpoint = %endpoint, "Connecting to registry");

    match tokio::time::timeout(timeout, connect_async(endpoint.url.as_str())).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(ConnectivityError::WebSocket(e)),
        // Dropping the pending handshake closes the half-open socket.
        Err(_) => Err(ConnectivityError::Timeout {
            endpoint: endpoint.url.clone(),
            after_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Try candidates in order and return the first that connects.
pub async fn connect_first(
    candidates: &[Endpoint],
    timeout: Duration,
) -> Result<(Endpoint, RegistryStream), ConnectivityError> {
    for endpoint in candidates {
        match connect_endpoint(endpoint, timeout).await {
            Ok(stream) => {
                info!(endpoint = %endpoint, "Connected to registry");
                return Ok((endpoint.clone(), stream));
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "Registry candidate failed");
            }
        }
    }

    Err(ConnectivityError::AllCandidatesFailed)
}
