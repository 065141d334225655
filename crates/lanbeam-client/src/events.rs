use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::mpsc;

use lanbeam_net::progress::ProgressSnapshot;
use lanbeam_net::session::{SessionRole, SessionState};
use lanbeam_shared::types::{DeviceId, DeviceIdentity, DeviceRecord, FileManifestEntry, TransferId};

/// Everything a node reports to the embedding application.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum NodeEvent {
    RegistryConnected {
        url: String,
    },
    RegistryDisconnected,
    RegistryUnreachable {
        reason: String,
    },
    RegistryHost(DeviceIdentity),

    DeviceDiscovered(DeviceRecord),
    DeviceLost(DeviceRecord),
    NoDevicesFound,
    Renamed {
        name: String,
    },

    TransferRequested {
        from: DeviceId,
        from_name: String,
        files: Vec<FileManifestEntry>,
        total_size: u64,
    },
    TransferAccepted {
        peer: DeviceId,
        transfer_id: TransferId,
    },
    TransferRejected {
        peer: DeviceId,
    },
    TransferState {
        peer: DeviceId,
        transfer_id: TransferId,
        role: SessionRole,
        state: SessionState,
    },
    FileStarted {
        transfer_id: TransferId,
        name: String,
        size: u64,
        index: u32,
        total: u32,
    },
    Progress(ProgressSnapshot),
    FileSaved {
        transfer_id: TransferId,
        name: String,
        path: PathBuf,
    },
    FileDiscarded {
        transfer_id: TransferId,
        name: String,
    },
    FileWriteFailed {
        transfer_id: TransferId,
        name: String,
        path: PathBuf,
    },
    PartialDiscarded {
        transfer_id: TransferId,
        bytes: u64,
    },
    TransferCompleted {
        peer: DeviceId,
        transfer_id: TransferId,
    },
    TransferFailed {
        peer: DeviceId,
        transfer_id: TransferId,
        reason: String,
    },

    /// Text from another device, either addressed to this one or broadcast.
    MessageReceived {
        from: DeviceId,
        message: String,
        direct: bool,
    },

    Error {
        message: String,
    },
}

impl NodeEvent {
    /// Wire name of the event, as serialized in the `event` field.
    pub fn name(&self) -> &'static str {
        match self {
            NodeEvent::RegistryConnected { .. } => "registry-connected",
            NodeEvent::RegistryDisconnected => "registry-disconnected",
            NodeEvent::RegistryUnreachable { .. } => "registry-unreachable",
            NodeEvent::RegistryHost(_) => "registry-host",
            NodeEvent::DeviceDiscovered(_) => "device-discovered",
            NodeEvent::DeviceLost(_) => "device-lost",
            NodeEvent::NoDevicesFound => "no-devices-found",
            NodeEvent::Renamed { .. } => "renamed",
            NodeEvent::TransferRequested { .. } => "transfer-requested",
            NodeEvent::TransferAccepted { .. } => "transfer-accepted",
            NodeEvent::TransferRejected { .. } => "transfer-rejected",
            NodeEvent::TransferState { .. } => "transfer-state",
            NodeEvent::FileStarted { .. } => "file-started",
            NodeEvent::Progress(_) => "progress",
            NodeEvent::FileSaved { .. } => "file-saved",
            NodeEvent::FileDiscarded { .. } => "file-discarded",
            NodeEvent::FileWriteFailed { .. } => "file-write-failed",
            NodeEvent::PartialDiscarded { .. } => "partial-discarded",
            NodeEvent::TransferCompleted { .. } => "transfer-completed",
            NodeEvent::TransferFailed { .. } => "transfer-failed",
            NodeEvent::MessageReceived { .. } => "message-received",
            NodeEvent::Error { .. } => "error",
        }
    }
}

pub async fn emit_event(events: &mpsc::Sender<NodeEvent>, event: NodeEvent) {
    let name = event.name();
    if events.send(event).await.is_err() {
        tracing::debug!(event = name, "Event dropped: no listener");
    }
}
