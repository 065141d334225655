use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::{ConnectionOffer, DeviceId, DeviceIdentity, DeviceRecord, FileManifestEntry, SessionKey};

/// Messages a node sends to the presence registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Announce (or re-announce) the local identity
    IdentityAnnounce(DeviceIdentity),

    /// Ask the registry to forward a handshake message to one session
    #[serde(rename_all = "camelCase")]
    Relay { to: SessionKey, payload: RelayPayload },

    /// Text for every other connected session
    Broadcast { message: String },
}

/// Messages the presence registry sends to a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Identity of the registry host, sent once per new session
    IdentityAnnounce(DeviceIdentity),

    /// A device announced itself on another session
    DeviceDiscovered(DeviceRecord),

    /// A session went away
    #[serde(rename_all = "camelCase")]
    DeviceDisconnected { session_key: SessionKey },

    /// Handshake message forwarded from another session
    #[serde(rename_all = "camelCase")]
    Relayed {
        from_session: SessionKey,
        payload: RelayPayload,
    },

    /// Broadcast text, stamped with the announced id of its sender
    #[serde(rename_all = "camelCase")]
    BroadcastMessage {
        from: DeviceId,
        from_session: SessionKey,
        message: String,
    },
}

/// Point-to-point handshake messages carried by the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RelayPayload {
    TransferRequest(TransferRequest),
    TransferResponse(TransferResponse),
    DirectMessage(DirectMessage),
}

/// Free-form text for one peer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectMessage {
    pub from: DeviceId,
    pub message: String,
}

/// Offer to send files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub from: DeviceId,
    pub from_name: String,
    pub files: Vec<FileManifestEntry>,
}

impl TransferRequest {
    /// Reject requests a receiver could not act on.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.from.is_empty() {
            return Err(ValidationError::MissingDeviceId);
        }
        if self.files.is_empty() {
            return Err(ValidationError::EmptyManifest);
        }
        if self.files.iter().any(|f| f.name.trim().is_empty()) {
            return Err(ValidationError::EmptyFileName);
        }
        Ok(())
    }
}

/// Answer to a [`TransferRequest`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    pub from: DeviceId,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_offer: Option<ConnectionOffer>,
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Structured records interleaved with file data on a transfer channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    FileStart {
        name: String,
        size: u64,
        index: u32,
        total: u32,
    },
    FileEnd {
        index: u32,
    },
    TransferComplete,
}

impl ControlMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// One unit on a transfer channel.
///
/// The variant decides the frame kind at the serialization boundary:
/// control records travel as text frames, data as binary frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Control(ControlMessage),
    Data(Bytes),
}

impl Envelope {
    pub fn is_control(&self) -> bool {
        matches!(self, Envelope::Control(_))
    }

    /// Payload length for data units, zero for control records.
    pub fn data_len(&self) -> usize {
        match self {
            Envelope::Data(bytes) => bytes.len(),
            Envelope::Control(_) => 0,
        }
    }
}
