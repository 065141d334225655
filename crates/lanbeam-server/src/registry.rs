//! Presence registry with the tokio mpsc event/notification pattern.
//!
//! The registry state lives in one task. Connection handlers push
//! [`RegistryEvent`]s in; each session owns a bounded outbound queue the
//! registry writes [`ServerMessage`]s into; the hosting process receives
//! [`RegistryNotification`]s for announcements and disconnects.

use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use lanbeam_shared::protocol::{ClientMessage, RelayPayload, ServerMessage};
use lanbeam_shared::types::{DeviceIdentity, DeviceRecord, SessionKey};

// ---------------------------------------------------------------------------
// Event / notification types
// ---------------------------------------------------------------------------

/// Events sent *into* the registry task.
#[derive(Debug)]
pub enum RegistryEvent {
    /// A new WebSocket session was accepted.
    Connected {
        session_key: SessionKey,
        outbound: mpsc::Sender<ServerMessage>,
    },
    /// A parsed message arrived on a session.
    Message {
        session_key: SessionKey,
        message: ClientMessage,
    },
    /// A session went away.
    Disconnected { session_key: SessionKey },
    /// Request a snapshot for `/info`.
    Info(oneshot::Sender<RegistryInfo>),
}

/// Notifications sent *from* the registry task to the hosting process.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryNotification {
    /// A session announced a valid identity.
    DeviceAnnounced(DeviceRecord),
    /// A session disconnected.
    SessionClosed(SessionKey),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryInfo {
    pub host: DeviceIdentity,
    pub sessions: usize,
    pub devices: usize,
}

// ---------------------------------------------------------------------------
// Registry state
// ---------------------------------------------------------------------------

struct Session {
    outbound: mpsc::Sender<ServerMessage>,
    /// Last valid announcement on this session.
    announced: Option<DeviceRecord>,
}

/// Connected-session bookkeeping and message routing.
pub struct Registry {
    host: DeviceIdentity,
    sessions: HashMap<SessionKey, Session>,
    notify: mpsc::Sender<RegistryNotification>,
}

impl Registry {
    pub fn new(host: DeviceIdentity, notify: mpsc::Sender<RegistryNotification>) -> Self {
        Self {
            host,
            sessions: HashMap::new(),
            notify,
        }
    }

    /// Drive the registry until every event sender is dropped.
    pub async fn run(mut self, mut events: mpsc::Receiver<RegistryEvent>) {
        info!(host = %self.host.id, name = %self.host.name, "Presence registry running");

        while let Some(event) = events.recv().await {
            self.handle(event);
        }

        info!("Presence registry stopped");
    }

    pub fn handle(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::Connected {
                session_key,
                outbound,
            } => self.on_connected(session_key, outbound),
            RegistryEvent::Message {
                session_key,
                message,
            } => self.on_message(&session_key, message),
            RegistryEvent::Disconnected { session_key } => self.on_disconnected(session_key),
            RegistryEvent::Info(reply) => {
                let _ = reply.send(self.info());
            }
        }
    }

    pub fn info(&self) -> RegistryInfo {
        RegistryInfo {
            host: self.host.clone(),
            sessions: self.sessions.len(),
            devices: self
                .sessions
                .values()
                .filter(|s| s.announced.is_some())
                .count(),
        }
    }

    fn on_connected(&mut self, session_key: SessionKey, outbound: mpsc::Sender<ServerMessage>) {
        info!(session = %session_key.short(), "Session connected");

        let session = Session {
            outbound,
            announced: None,
        };

        deliver(&session_key, &session, ServerMessage::IdentityAnnounce(self.host.clone()));

        // Devices already announced on other sessions.
        for (key, other) in &self.sessions {
            if let Some(record) = &other.announced {
                debug!(session = %session_key.short(), from = %key.short(), "Replaying announcement");
                deliver(&session_key, &session, ServerMessage::DeviceDiscovered(record.clone()));
            }
        }

        let host_record = DeviceRecord::from_identity(self.host.clone(), None, Utc::now());
        self.broadcast_except(&session_key, ServerMessage::DeviceDiscovered(host_record));

        self.sessions.insert(session_key, session);
    }

    fn on_message(&mut self, session_key: &SessionKey, message: ClientMessage) {
        match message {
            ClientMessage::IdentityAnnounce(identity) => self.on_announce(session_key, identity),
            ClientMessage::Relay { to, payload } => self.on_relay(session_key, to, payload),
            ClientMessage::Broadcast { message } => self.on_broadcast(session_key, message),
        }
    }

    fn on_announce(&mut self, session_key: &SessionKey, identity: DeviceIdentity) {
        if let Err(e) = identity.validate() {
            warn!(session = %session_key.short(), error = %e, "Dropping invalid announcement");
            return;
        }

        let Some(session) = self.sessions.get_mut(session_key) else {
            warn!(session = %session_key.short(), "Announcement from unknown session");
            return;
        };

        let record = DeviceRecord::from_identity(identity, Some(session_key.clone()), Utc::now());
        info!(
            session = %session_key.short(),
            device = %record.id,
            name = %record.name,
            address = %record.address,
            "Device announced"
        );
        session.announced = Some(record.clone());

        if let Err(e) = self
            .notify
            .try_send(RegistryNotification::DeviceAnnounced(record.clone()))
        {
            warn!(error = %e, "Dropping announcement notification");
        }

        self.broadcast_except(session_key, ServerMessage::DeviceDiscovered(record));
    }

    fn on_relay(&mut self, from: &SessionKey, to: SessionKey, payload: RelayPayload) {
        let Some(target) = self.sessions.get(&to) else {
            warn!(from = %from.short(), to = %to.short(), "Relay target not connected");
            return;
        };

        debug!(from = %from.short(), to = %to.short(), "Relaying message");
        deliver(
            &to,
            target,
            ServerMessage::Relayed {
                from_session: from.clone(),
                payload,
            },
        );
    }

    /// Fan text out to every other session. The sender must have announced,
    /// so the message can be stamped with its device id.
    fn on_broadcast(&mut self, from: &SessionKey, message: String) {
        let Some(sender) = self
            .sessions
            .get(from)
            .and_then(|s| s.announced.as_ref())
            .map(|record| record.id.clone())
        else {
            warn!(session = %from.short(), "Dropping broadcast from unannounced session");
            return;
        };

        debug!(from = %from.short(), device = %sender, "Broadcasting message");
        self.broadcast_except(
            from,
            ServerMessage::BroadcastMessage {
                from: sender,
                from_session: from.clone(),
                message,
            },
        );
    }

    fn on_disconnected(&mut self, session_key: SessionKey) {
        if self.sessions.remove(&session_key).is_none() {
            return;
        }
        info!(session = %session_key.short(), "Session disconnected");

        if let Err(e) = self
            .notify
            .try_send(RegistryNotification::SessionClosed(session_key.clone()))
        {
            warn!(error = %e, "Dropping disconnect notification");
        }

        self.broadcast_except(
            &session_key,
            ServerMessage::DeviceDisconnected { session_key: session_key.clone() },
        );
    }

    fn broadcast_except(&self, skip: &SessionKey, message: ServerMessage) {
        for (key, session) in &self.sessions {
            if key != skip {
                deliver(key, session, message.clone());
            }
        }
    }
}

/// Queue a message for one session. A full or closed queue drops it.
fn deliver(key: &SessionKey, session: &Session, message: ServerMessage) {
    if let Err(e) = session.outbound.try_send(message) {
        warn!(session = %key.short(), error = %e, "Outbound queue unavailable, message dropped");
    }
}

/// Spawn the registry task. Returns the event sender and the notification
/// receiver.
pub fn spawn(
    host: DeviceIdentity,
) -> (mpsc::Sender<RegistryEvent>, mpsc::Receiver<RegistryNotification>) {
    let (event_tx, event_rx) = mpsc::channel::<RegistryEvent>(1024);
    let (notif_tx, notif_rx) = mpsc::channel::<RegistryNotification>(256);

    tokio::spawn(Registry::new(host, notif_tx).run(event_rx));

    (event_tx, notif_rx)
}
