//! Request / accept / reject handshake, relayed through the registry.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use lanbeam_shared::protocol::{ClientMessage, RelayPayload, TransferRequest, TransferResponse};
use lanbeam_shared::types::{
    total_size, ConnectionOffer, DeviceId, DeviceIdentity, FileManifestEntry, SessionKey,
};

use crate::error::SessionError;
use crate::storage::{manifest, OutgoingFile};

/// Files waiting on a peer's answer.
#[derive(Debug, Clone)]
pub struct TransferIntent {
    pub peer_id: DeviceId,
    /// Registry session the request was addressed to. Only that session
    /// may answer.
    pub session_key: SessionKey,
    pub files: Vec<OutgoingFile>,
    pub total_size: u64,
}

/// A request from a peer waiting on a local decision.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    pub from: DeviceId,
    pub from_name: String,
    pub files: Vec<FileManifestEntry>,
    /// Registry session the request arrived from; the response goes there.
    pub session_key: SessionKey,
}

impl IncomingRequest {
    pub fn total_size(&self) -> u64 {
        total_size(&self.files)
    }
}

/// Result of handing a peer's response to the negotiator.
#[derive(Debug)]
pub enum ResponseOutcome {
    Accepted {
        intent: TransferIntent,
        offer: ConnectionOffer,
    },
    Rejected {
        peer_id: DeviceId,
    },
    /// No intent for that peer, an acceptance without an offer, or an
    /// answer arriving from a session other than the one asked.
    Unsolicited,
}

/// Pending intents (sender side) and pending requests (receiver side).
#[derive(Debug, Default)]
pub struct TransferNegotiator {
    intents: HashMap<DeviceId, TransferIntent>,
    incoming: HashMap<DeviceId, IncomingRequest>,
}

impl TransferNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an intent for `peer_id` and build the request addressed to
    /// `session_key`. A newer request to the same peer replaces the old
    /// intent. There is no response timeout.
    pub fn request(
        &mut self,
        local: &DeviceIdentity,
        peer_id: DeviceId,
        session_key: SessionKey,
        files: Vec<OutgoingFile>,
    ) -> Result<ClientMessage, SessionError> {
        if files.is_empty() {
            return Err(SessionError::EmptyTransfer);
        }

        let entries = manifest(&files);
        let intent = TransferIntent {
            peer_id: peer_id.clone(),
            session_key: session_key.clone(),
            total_size: total_size(&entries),
            files,
        };
        info!(
            peer = %peer_id,
            files = entries.len(),
            bytes = intent.total_size,
            "Requesting transfer"
        );
        if self.intents.insert(peer_id, intent).is_some() {
            debug!("Replaced an unanswered intent");
        }

        Ok(ClientMessage::Relay {
            to: session_key,
            payload: RelayPayload::TransferRequest(TransferRequest {
                from: local.id.clone(),
                from_name: local.name.clone(),
                files: entries,
            }),
        })
    }

    /// Drop the intent for `peer_id` (the request could not proceed).
    pub fn cancel_intent(&mut self, peer_id: &DeviceId) -> Option<TransferIntent> {
        self.intents.remove(peer_id)
    }

    pub fn has_intent(&self, peer_id: &DeviceId) -> bool {
        self.intents.contains_key(peer_id)
    }

    /// Record a request relayed from `from_session`.
    pub fn on_request(&mut self, from_session: SessionKey, request: TransferRequest) -> IncomingRequest {
        let incoming = IncomingRequest {
            from: request.from,
            from_name: request.from_name,
            files: request.files,
            session_key: from_session,
        };
        info!(
            peer = %incoming.from,
            name = %incoming.from_name,
            files = incoming.files.len(),
            "Incoming transfer request"
        );
        self.incoming.insert(incoming.from.clone(), incoming.clone());
        incoming
    }

    pub fn has_incoming(&self, from: &DeviceId) -> bool {
        self.incoming.contains_key(from)
    }

    /// Accept the pending request from `from`, answering with `offer`.
    pub fn accept(
        &mut self,
        local: &DeviceIdentity,
        from: &DeviceId,
        offer: ConnectionOffer,
    ) -> Result<(IncomingRequest, ClientMessage), SessionError> {
        let request = self
            .incoming
            .remove(from)
            .ok_or_else(|| SessionError::NoPendingRequest(from.clone()))?;

        info!(peer = %from, offer = %offer.address, "Accepting transfer");
        let message = response(local, &request.session_key, true, Some(offer));
        Ok((request, message))
    }

    /// Reject the pending request from `from`.
    pub fn reject(
        &mut self,
        local: &DeviceIdentity,
        from: &DeviceId,
    ) -> Result<(IncomingRequest, ClientMessage), SessionError> {
        let request = self
            .incoming
            .remove(from)
            .ok_or_else(|| SessionError::NoPendingRequest(from.clone()))?;

        info!(peer = %from, "Rejecting transfer");
        let message = response(local, &request.session_key, false, None);
        Ok((request, message))
    }

    /// Resolve a peer's answer, relayed from `from_session`, against the
    /// stored intent.
    pub fn on_response(&mut self, from_session: &SessionKey, response: TransferResponse) -> ResponseOutcome {
        if let Some(intent) = self.intents.get(&response.from) {
            if &intent.session_key != from_session {
                warn!(
                    peer = %response.from,
                    expected = %intent.session_key.short(),
                    got = %from_session.short(),
                    "Ignoring response from another session"
                );
                return ResponseOutcome::Unsolicited;
            }
        }

        if !response.accepted {
            if self.intents.remove(&response.from).is_none() {
                debug!(peer = %response.from, "Rejection for unknown intent");
            }
            info!(peer = %response.from, "Transfer rejected by peer");
            return ResponseOutcome::Rejected {
                peer_id: response.from,
            };
        }

        let Some(offer) = response.connection_offer else {
            warn!(peer = %response.from, "Acceptance without a connection offer");
            self.intents.remove(&response.from);
            return ResponseOutcome::Unsolicited;
        };

        match self.intents.remove(&response.from) {
            Some(intent) => ResponseOutcome::Accepted { intent, offer },
            None => {
                warn!(peer = %response.from, "Acceptance for unknown intent");
                ResponseOutcome::Unsolicited
            }
        }
    }
}

fn response(
    local: &DeviceIdentity,
    to: &SessionKey,
    accepted: bool,
    offer: Option<ConnectionOffer>,
) -> ClientMessage {
    ClientMessage::Relay {
        to: to.clone(),
        payload: RelayPayload::TransferResponse(TransferResponse {
            from: local.id.clone(),
            accepted,
            connection_offer: offer,
        }),
    }
}
