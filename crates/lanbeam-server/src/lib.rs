//! # lanbeam-server
//!
//! Presence registry for Lanbeam nodes on a local network.
//!
//! - **WebSocket presence** on `/ws`: identity announcements, device
//!   discovery broadcasts and point-to-point relay of transfer handshakes
//! - **REST API** (axum) for health checks and instance info
//!
//! The registry can run standalone (the `lanbeam-server` binary) or be
//! embedded in a node process through [`spawn_registry`].

pub mod api;
pub mod config;
pub mod error;
pub mod registry;

pub use api::{build_router, serve, spawn_registry, AppState};
pub use config::ServerConfig;
pub use error::ServerError;
pub use registry::{Registry, RegistryEvent, RegistryInfo, RegistryNotification};
