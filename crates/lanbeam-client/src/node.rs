//! The node event loop.
//!
//! A [`Node`] owns every table a running device needs (presence, pending
//! handshakes, sessions, progress) and mutates them from a single task. The
//! application talks to it through a [`NodeHandle`] and listens on a
//! [`NodeEvent`] stream.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use lanbeam_net::connect::{ConnectPolicy, Endpoint};
use lanbeam_net::link::{spawn_link, LinkCommand, LinkNotification};
use lanbeam_net::negotiator::{ResponseOutcome, TransferNegotiator};
use lanbeam_net::presence::{PresenceTable, UpsertOutcome};
use lanbeam_net::progress::ProgressTracker;
use lanbeam_net::session::{
    prepare_receiver, run_receiver, run_sender, SessionConfig, SessionRegistry, SessionRole,
    SessionState, SessionUpdate, UpdateKind,
};
use lanbeam_net::storage::{OutgoingFile, SaveTarget};
use lanbeam_net::{ConnectivityError, SessionError};
use lanbeam_shared::constants::{PROGRESS_CLEANUP_SECS, SCAN_TIMEOUT_SECS};
use lanbeam_shared::protocol::{
    ClientMessage, DirectMessage, RelayPayload, ServerMessage, TransferRequest, TransferResponse,
};
use lanbeam_shared::types::{DeviceId, DeviceIdentity, DeviceRecord, SessionKey, TransferId};

use crate::events::{emit_event, NodeEvent};

// ---------------------------------------------------------------------------
// Commands and options
// ---------------------------------------------------------------------------

/// Commands sent *into* the node task.
pub enum NodeCommand {
    /// Clear the device table, re-announce and start the scan timer.
    Scan,
    /// Change the display name and re-announce.
    Rename(String),
    /// Ask `peer` to accept `files`.
    SendFiles {
        peer: DeviceId,
        files: Vec<OutgoingFile>,
    },
    /// Accept the pending request from `peer`, saving through `target`.
    Accept {
        peer: DeviceId,
        target: Arc<dyn SaveTarget>,
    },
    /// Reject the pending request from `peer`.
    Reject { peer: DeviceId },
    /// Text for every other device on the registry.
    Broadcast(String),
    /// Text for one device.
    SendMessage { peer: DeviceId, message: String },
    /// Snapshot of discovered devices.
    ListDevices(oneshot::Sender<Vec<DeviceRecord>>),
    /// Stop the node.
    Shutdown,
}

/// Everything needed to start a node.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub identity: DeviceIdentity,
    /// Address put into connection offers.
    pub advertise_ip: IpAddr,
    /// Registry endpoints, tried in order.
    pub candidates: Vec<Endpoint>,
    pub connect_policy: ConnectPolicy,
    pub session: SessionConfig,
    pub scan_timeout: Duration,
    pub progress_cleanup: Duration,
}

impl NodeOptions {
    pub fn new(identity: DeviceIdentity, advertise_ip: IpAddr, candidates: Vec<Endpoint>) -> Self {
        Self {
            identity,
            advertise_ip,
            candidates,
            connect_policy: ConnectPolicy::default(),
            session: SessionConfig::default(),
            scan_timeout: Duration::from_secs(SCAN_TIMEOUT_SECS),
            progress_cleanup: Duration::from_secs(PROGRESS_CLEANUP_SECS),
        }
    }
}

/// Cloneable handle to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<NodeCommand>,
}

impl NodeHandle {
    async fn send(&self, command: NodeCommand) -> anyhow::Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("node has stopped"))
    }

    pub async fn scan(&self) -> anyhow::Result<()> {
        self.send(NodeCommand::Scan).await
    }

    pub async fn rename(&self, name: impl Into<String>) -> anyhow::Result<()> {
        self.send(NodeCommand::Rename(name.into())).await
    }

    pub async fn send_files(&self, peer: DeviceId, files: Vec<OutgoingFile>) -> anyhow::Result<()> {
        self.send(NodeCommand::SendFiles { peer, files }).await
    }

    pub async fn accept(&self, peer: DeviceId, target: Arc<dyn SaveTarget>) -> anyhow::Result<()> {
        self.send(NodeCommand::Accept { peer, target }).await
    }

    pub async fn reject(&self, peer: DeviceId) -> anyhow::Result<()> {
        self.send(NodeCommand::Reject { peer }).await
    }

    pub async fn broadcast(&self, message: impl Into<String>) -> anyhow::Result<()> {
        self.send(NodeCommand::Broadcast(message.into())).await
    }

    pub async fn send_message(&self, peer: DeviceId, message: impl Into<String>) -> anyhow::Result<()> {
        self.send(NodeCommand::SendMessage {
            peer,
            message: message.into(),
        })
        .await
    }

    pub async fn devices(&self) -> anyhow::Result<Vec<DeviceRecord>> {
        let (tx, rx) = oneshot::channel();
        self.send(NodeCommand::ListDevices(tx)).await?;
        Ok(rx.await?)
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.send(NodeCommand::Shutdown).await
    }
}

/// Spawn a node task.
///
/// Returns the command handle, the event stream and the task handle.
pub fn spawn_node(options: NodeOptions) -> (NodeHandle, mpsc::Receiver<NodeEvent>, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<NodeCommand>(64);
    let (event_tx, event_rx) = mpsc::channel::<NodeEvent>(1024);

    let node = Node::new(options, event_tx);
    let task = tokio::spawn(node.run(cmd_rx));

    (NodeHandle { commands: cmd_tx }, event_rx, task)
}

// ---------------------------------------------------------------------------
// Node state
// ---------------------------------------------------------------------------

type LinkParts = (mpsc::Sender<LinkCommand>, mpsc::Receiver<LinkNotification>);

pub struct Node {
    options: NodeOptions,
    identity: DeviceIdentity,
    presence: PresenceTable,
    negotiator: TransferNegotiator,
    sessions: SessionRegistry,
    progress: ProgressTracker,

    link: Option<mpsc::Sender<LinkCommand>>,
    link_rx: Option<mpsc::Receiver<LinkNotification>>,
    /// A connect attempt is running in the background.
    connecting: bool,
    connected: bool,
    scan_deadline: Option<Instant>,

    events: mpsc::Sender<NodeEvent>,
    link_ready_tx: mpsc::Sender<Result<LinkParts, ConnectivityError>>,
    link_ready_rx: mpsc::Receiver<Result<LinkParts, ConnectivityError>>,
    updates_tx: mpsc::Sender<SessionUpdate>,
    updates_rx: mpsc::Receiver<SessionUpdate>,
    cleanup_tx: mpsc::Sender<TransferId>,
    cleanup_rx: mpsc::Receiver<TransferId>,
}

impl Node {
    pub fn new(options: NodeOptions, events: mpsc::Sender<NodeEvent>) -> Self {
        let (updates_tx, updates_rx) = mpsc::channel(1024);
        let (cleanup_tx, cleanup_rx) = mpsc::channel(64);
        let (link_ready_tx, link_ready_rx) = mpsc::channel(1);

        Self {
            identity: options.identity.clone(),
            presence: PresenceTable::new(options.identity.id.clone()),
            negotiator: TransferNegotiator::new(),
            sessions: SessionRegistry::new(),
            progress: ProgressTracker::default(),
            link: None,
            link_rx: None,
            connecting: false,
            connected: false,
            scan_deadline: None,
            events,
            link_ready_tx,
            link_ready_rx,
            updates_tx,
            updates_rx,
            cleanup_tx,
            cleanup_rx,
            options,
        }
    }

    /// Run until shutdown or until every handle is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<NodeCommand>) {
        info!(id = %self.identity.id, name = %self.identity.name, "Node started");
        self.open_link();

        loop {
            let deadline = self.scan_deadline;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(NodeCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },

                notification = next_notification(&mut self.link_rx) => match notification {
                    Some(notification) => self.handle_link(notification).await,
                    None => self.drop_link().await,
                },

                Some(result) = self.link_ready_rx.recv() => self.link_opened(result).await,

                Some(update) = self.updates_rx.recv() => self.handle_update(update).await,

                Some(transfer_id) = self.cleanup_rx.recv() => {
                    if self.progress.remove(&transfer_id) {
                        debug!(transfer = %transfer_id, "Progress record removed");
                    }
                },

                _ = sleep_until_opt(deadline), if deadline.is_some() => self.scan_expired().await,
            }
        }

        if let Some(link) = self.link.take() {
            let _ = link.send(LinkCommand::Shutdown).await;
        }
        info!("Node stopped");
    }

    // -- Registry link -------------------------------------------------------

    /// Try the candidates in a background task. The outcome comes back
    /// through `link_ready_rx`.
    fn open_link(&mut self) {
        if self.connecting {
            return;
        }
        self.connecting = true;

        let candidates = self.options.candidates.clone();
        let policy = self.options.connect_policy.clone();
        let ready = self.link_ready_tx.clone();
        tokio::spawn(async move {
            let result = spawn_link(&candidates, policy).await;
            let _ = ready.send(result).await;
        });
    }

    async fn link_opened(&mut self, result: Result<LinkParts, ConnectivityError>) {
        self.connecting = false;
        match result {
            Ok((link, link_rx)) => {
                self.link = Some(link);
                self.link_rx = Some(link_rx);
            }
            Err(e) => {
                warn!(error = %e, "Registry unreachable");
                self.emit(NodeEvent::RegistryUnreachable {
                    reason: e.to_string(),
                })
                .await;
            }
        }
    }

    /// Forget the link for good. Devices seen through it are no longer
    /// reachable, so they are reported lost.
    async fn drop_link(&mut self) {
        self.link = None;
        self.link_rx = None;
        self.connected = false;

        let lost = self.presence.devices();
        self.presence.clear();
        for record in lost {
            self.emit(NodeEvent::DeviceLost(record)).await;
        }
    }

    async fn announce(&self) {
        let message = ClientMessage::IdentityAnnounce(self.identity.clone());
        if let Err(e) = self.send_registry(message).await {
            debug!(error = %e, "Announcement not sent");
        }
    }

    async fn send_registry(&self, message: ClientMessage) -> Result<(), ConnectivityError> {
        let link = match &self.link {
            Some(link) if self.connected => link,
            _ => return Err(ConnectivityError::LinkDown),
        };
        link.send(LinkCommand::Send(message))
            .await
            .map_err(|_| ConnectivityError::LinkDown)
    }

    async fn handle_link(&mut self, notification: LinkNotification) {
        match notification {
            LinkNotification::Connected { endpoint } => {
                self.connected = true;
                self.emit(NodeEvent::RegistryConnected { url: endpoint.url }).await;
                self.announce().await;
            }
            LinkNotification::Message(message) => self.handle_server_message(message).await,
            LinkNotification::Disconnected => {
                self.connected = false;
                self.emit(NodeEvent::RegistryDisconnected).await;
            }
            LinkNotification::GaveUp => {
                self.drop_link().await;
                self.emit(NodeEvent::RegistryUnreachable {
                    reason: "reconnection attempts exhausted".into(),
                })
                .await;
            }
        }
    }

    async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::IdentityAnnounce(host) => {
                debug!(host = %host.id, name = %host.name, "Registry host identity");
                self.emit(NodeEvent::RegistryHost(host)).await;
            }
            ServerMessage::DeviceDiscovered(record) => self.on_device(record).await,
            ServerMessage::DeviceDisconnected { session_key } => {
                for record in self.presence.evict_session(&session_key) {
                    info!(device = %record.id, name = %record.name, "Device left");
                    self.emit(NodeEvent::DeviceLost(record)).await;
                }
            }
            ServerMessage::Relayed {
                from_session,
                payload,
            } => match payload {
                RelayPayload::TransferRequest(request) => {
                    self.on_transfer_request(from_session, request).await
                }
                RelayPayload::TransferResponse(response) => {
                    self.on_transfer_response(from_session, response).await
                }
                RelayPayload::DirectMessage(DirectMessage { from, message }) => {
                    debug!(from = %from, session = %from_session.short(), "Direct message");
                    self.emit(NodeEvent::MessageReceived {
                        from,
                        message,
                        direct: true,
                    })
                    .await;
                }
            },
            ServerMessage::BroadcastMessage {
                from,
                from_session,
                message,
            } => {
                debug!(from = %from, session = %from_session.short(), "Broadcast message");
                self.emit(NodeEvent::MessageReceived {
                    from,
                    message,
                    direct: false,
                })
                .await;
            }
        }
    }

    async fn on_device(&mut self, record: DeviceRecord) {
        match self.presence.upsert(record.clone()) {
            UpsertOutcome::Inserted | UpsertOutcome::Refreshed => {
                self.scan_deadline = None;
                let stored = self.presence.get(&record.id).cloned().unwrap_or(record);
                self.emit(NodeEvent::DeviceDiscovered(stored)).await;
            }
            UpsertOutcome::Stale | UpsertOutcome::SelfRecord => {}
            UpsertOutcome::Invalid => warn!("Dropping device record without id"),
        }
    }

    // -- Handshake -----------------------------------------------------------

    async fn on_transfer_request(&mut self, from_session: SessionKey, request: TransferRequest) {
        if let Err(e) = request.validate() {
            warn!(session = %from_session.short(), error = %e, "Dropping invalid transfer request");
            return;
        }

        let incoming = self.negotiator.on_request(from_session, request);
        let total_size = incoming.total_size();
        self.emit(NodeEvent::TransferRequested {
            from: incoming.from,
            from_name: incoming.from_name,
            files: incoming.files,
            total_size,
        })
        .await;
    }

    async fn on_transfer_response(&mut self, from_session: SessionKey, response: TransferResponse) {
        match self.negotiator.on_response(&from_session, response) {
            ResponseOutcome::Rejected { peer_id } => {
                self.emit(NodeEvent::TransferRejected { peer: peer_id }).await;
            }
            ResponseOutcome::Accepted { intent, offer } => {
                let session = match self.sessions.try_insert(intent.peer_id.clone(), SessionRole::Sender) {
                    Ok(session) => session,
                    Err(e) => {
                        self.emit_error(e).await;
                        return;
                    }
                };

                info!(
                    peer = %intent.peer_id,
                    transfer = %session.transfer_id,
                    offer = %offer.address,
                    "Peer accepted, starting sender session"
                );
                self.emit(NodeEvent::TransferAccepted {
                    peer: intent.peer_id.clone(),
                    transfer_id: session.transfer_id,
                })
                .await;

                tokio::spawn(run_sender(
                    session,
                    offer,
                    intent.files,
                    self.options.session.clone(),
                    self.updates_tx.clone(),
                ));
            }
            ResponseOutcome::Unsolicited => {}
        }
    }

    async fn send_files(&mut self, peer: DeviceId, files: Vec<OutgoingFile>) -> Result<(), SessionError> {
        if self.sessions.is_active(&peer) {
            return Err(SessionError::AlreadyActive(peer));
        }
        if !self.presence.contains(&peer) {
            return Err(SessionError::UnknownPeer(peer));
        }
        let session_key = self
            .presence
            .session_key_of(&peer)
            .cloned()
            .ok_or_else(|| SessionError::NotRoutable(peer.clone()))?;

        let message = self
            .negotiator
            .request(&self.identity, peer.clone(), session_key, files)?;
        if let Err(e) = self.send_registry(message).await {
            self.negotiator.cancel_intent(&peer);
            return Err(e.into());
        }
        Ok(())
    }

    async fn accept(&mut self, peer: DeviceId, target: Arc<dyn SaveTarget>) -> Result<(), SessionError> {
        if !self.negotiator.has_incoming(&peer) {
            return Err(SessionError::NoPendingRequest(peer));
        }
        if self.sessions.is_active(&peer) {
            warn!(peer = %peer, "Session already active, answering with a rejection");
            self.reject(peer.clone()).await?;
            return Err(SessionError::AlreadyActive(peer));
        }

        let (listener, offer) = match prepare_receiver(self.options.advertise_ip).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.reject(peer).await?;
                return Err(e);
            }
        };

        let (_request, message) = self.negotiator.accept(&self.identity, &peer, offer)?;
        let session = self.sessions.try_insert(peer.clone(), SessionRole::Receiver)?;
        if let Err(e) = self.send_registry(message).await {
            self.sessions.remove(&peer, session.transfer_id);
            return Err(e.into());
        }

        self.emit(NodeEvent::TransferAccepted {
            peer,
            transfer_id: session.transfer_id,
        })
        .await;

        tokio::spawn(run_receiver(
            session,
            listener,
            target,
            self.options.session.clone(),
            self.updates_tx.clone(),
        ));
        Ok(())
    }

    async fn reject(&mut self, peer: DeviceId) -> Result<(), SessionError> {
        let (_request, message) = self.negotiator.reject(&self.identity, &peer)?;
        self.send_registry(message).await?;
        Ok(())
    }

    async fn send_message(&mut self, peer: DeviceId, message: String) -> Result<(), SessionError> {
        let to = match self.presence.get(&peer) {
            None => return Err(SessionError::UnknownPeer(peer)),
            Some(record) => record
                .session_key
                .clone()
                .ok_or_else(|| SessionError::NotRoutable(peer.clone()))?,
        };

        let payload = RelayPayload::DirectMessage(DirectMessage {
            from: self.identity.id.clone(),
            message,
        });
        self.send_registry(ClientMessage::Relay { to, payload }).await?;
        Ok(())
    }

    // -- Commands ------------------------------------------------------------

    async fn handle_command(&mut self, command: NodeCommand) {
        let result = match command {
            NodeCommand::Scan => {
                self.scan().await;
                Ok(())
            }
            NodeCommand::Rename(name) => {
                if self.identity.rename(&name) {
                    info!(name = %self.identity.name, "Renamed");
                    self.emit(NodeEvent::Renamed {
                        name: self.identity.name.clone(),
                    })
                    .await;
                    if self.connected {
                        self.announce().await;
                    }
                }
                Ok(())
            }
            NodeCommand::SendFiles { peer, files } => self.send_files(peer, files).await,
            NodeCommand::Accept { peer, target } => self.accept(peer, target).await,
            NodeCommand::Reject { peer } => self.reject(peer).await,
            NodeCommand::Broadcast(message) => self
                .send_registry(ClientMessage::Broadcast { message })
                .await
                .map_err(SessionError::from),
            NodeCommand::SendMessage { peer, message } => self.send_message(peer, message).await,
            NodeCommand::ListDevices(reply) => {
                let _ = reply.send(self.presence.devices());
                Ok(())
            }
            NodeCommand::Shutdown => Ok(()),
        };

        if let Err(e) = result {
            self.emit_error(e).await;
        }
    }

    async fn scan(&mut self) {
        info!("Scanning for devices");
        self.presence.clear();
        self.scan_deadline = Some(Instant::now() + self.options.scan_timeout);

        if self.link.is_none() {
            // A fresh link announces on connect.
            self.open_link();
        } else if self.connected {
            self.announce().await;
        }
    }

    async fn scan_expired(&mut self) {
        self.scan_deadline = None;
        if self.presence.is_empty() {
            info!("Scan finished without finding devices");
            self.emit(NodeEvent::NoDevicesFound).await;
        }
    }

    // -- Session updates -----------------------------------------------------

    async fn handle_update(&mut self, update: SessionUpdate) {
        let SessionUpdate {
            peer_id,
            transfer_id,
            role,
            kind,
        } = update;
        let now = std::time::Instant::now();

        match kind {
            UpdateKind::State(state) => {
                self.sessions.set_state(&peer_id, transfer_id, state);
                self.emit(NodeEvent::TransferState {
                    peer: peer_id.clone(),
                    transfer_id,
                    role,
                    state,
                })
                .await;

                match state {
                    SessionState::Complete => {
                        self.sessions.remove(&peer_id, transfer_id);
                        if let Some(elapsed) = self.progress.elapsed(&transfer_id, now) {
                            info!(
                                transfer = %transfer_id,
                                elapsed_ms = elapsed.as_millis() as u64,
                                "Transfer finished"
                            );
                        }
                        if let Some(snapshot) = self.progress.complete(transfer_id) {
                            self.emit(NodeEvent::Progress(snapshot)).await;
                        }
                        self.emit(NodeEvent::TransferCompleted {
                            peer: peer_id,
                            transfer_id,
                        })
                        .await;
                        self.schedule_cleanup(transfer_id);
                    }
                    SessionState::Failed => {
                        self.sessions.remove(&peer_id, transfer_id);
                        self.progress.remove(&transfer_id);
                    }
                    _ => {}
                }
            }
            UpdateKind::FileStarted {
                name,
                size,
                index,
                total,
            } => {
                self.progress.begin_file(transfer_id, size, now);
                self.emit(NodeEvent::FileStarted {
                    transfer_id,
                    name,
                    size,
                    index,
                    total,
                })
                .await;
            }
            UpdateKind::Progress { bytes, total } => {
                if let Some(snapshot) = self.progress.update(transfer_id, bytes, total, now) {
                    self.emit(NodeEvent::Progress(snapshot)).await;
                }
            }
            UpdateKind::FileFinished { .. } => {
                if let Some(snapshot) = self.progress.finish_file(transfer_id) {
                    self.emit(NodeEvent::Progress(snapshot)).await;
                }
            }
            UpdateKind::FileSaved { name, path } => {
                self.emit(NodeEvent::FileSaved {
                    transfer_id,
                    name,
                    path,
                })
                .await;
            }
            UpdateKind::FileDiscarded { name } => {
                self.emit(NodeEvent::FileDiscarded { transfer_id, name }).await;
            }
            UpdateKind::FileWriteFailed { name, path } => {
                self.emit(NodeEvent::FileWriteFailed {
                    transfer_id,
                    name,
                    path,
                })
                .await;
            }
            UpdateKind::PartialDiscarded { bytes } => {
                self.emit(NodeEvent::PartialDiscarded { transfer_id, bytes }).await;
            }
            UpdateKind::Failed { reason } => {
                self.emit(NodeEvent::TransferFailed {
                    peer: peer_id,
                    transfer_id,
                    reason,
                })
                .await;
            }
        }
    }

    fn schedule_cleanup(&self, transfer_id: TransferId) {
        let cleanup = self.cleanup_tx.clone();
        let delay = self.options.progress_cleanup;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = cleanup.send(transfer_id).await;
        });
    }

    async fn emit(&self, event: NodeEvent) {
        emit_event(&self.events, event).await;
    }

    async fn emit_error(&self, error: SessionError) {
        warn!(error = %error, "Node command failed");
        self.emit(NodeEvent::Error {
            message: error.to_string(),
        })
        .await;
    }
}

async fn next_notification(rx: &mut Option<mpsc::Receiver<LinkNotification>>) -> Option<LinkNotification> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;
    use std::net::Ipv4Addr;

    use lanbeam_net::progress::Rate;
    use lanbeam_net::storage::DirectoryTarget;
    use lanbeam_server::{spawn_registry, ServerConfig};

    fn options(id: &str, registry: std::net::SocketAddr) -> NodeOptions {
        let identity = DeviceIdentity {
            id: DeviceId::new(id),
            name: format!("node-{id}"),
            address: "127.0.0.1".into(),
        };
        let mut options = NodeOptions::new(
            identity,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            vec![Endpoint::registry("test", registry.ip(), registry.port())],
        );
        options.session.chunk_delay = Duration::ZERO;
        options.scan_timeout = Duration::from_millis(300);
        options.progress_cleanup = Duration::from_millis(50);
        options
    }

    async fn start_registry() -> std::net::SocketAddr {
        let config = ServerConfig {
            bind_addr: ([127, 0, 0, 1], 0).into(),
            ..ServerConfig::default()
        };
        let host = DeviceIdentity {
            id: DeviceId::new("registry"),
            name: "registry".into(),
            address: "127.0.0.1".into(),
        };
        let (addr, _notifications) = spawn_registry(config, host).await.unwrap();
        addr
    }

    async fn wait_for<F>(events: &mut mpsc::Receiver<NodeEvent>, mut predicate: F) -> NodeEvent
    where
        F: FnMut(&NodeEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(event) if predicate(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event stream ended"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Everything emitted within `window`.
    async fn collect_for(events: &mut mpsc::Receiver<NodeEvent>, window: Duration) -> Vec<NodeEvent> {
        let mut seen = Vec::new();
        let _ = tokio::time::timeout(window, async {
            while let Some(event) = events.recv().await {
                seen.push(event);
            }
        })
        .await;
        seen
    }

    /// A node that is never run, for driving its handlers directly.
    fn idle_node(id: &str) -> (Node, mpsc::Receiver<NodeEvent>) {
        let (event_tx, event_rx) = mpsc::channel(64);
        let node = Node::new(options(id, ([127, 0, 0, 1], 9).into()), event_tx);
        (node, event_rx)
    }

    fn routable(id: &str, session: &str) -> DeviceRecord {
        DeviceRecord {
            id: DeviceId::new(id),
            name: format!("node-{id}"),
            address: "127.0.0.1".into(),
            last_seen: Utc::now(),
            session_key: Some(SessionKey::from(session)),
        }
    }

    #[tokio::test]
    async fn test_scan_reports_no_devices() {
        let registry = start_registry().await;
        let (handle, mut events, task) = spawn_node(options("a1", registry));

        wait_for(&mut events, |e| matches!(e, NodeEvent::RegistryConnected { .. })).await;
        handle.scan().await.unwrap();
        wait_for(&mut events, |e| matches!(e, NodeEvent::NoDevicesFound)).await;

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_reported() {
        let closed = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);

        let mut opts = options("a1", addr);
        opts.connect_policy.connect_timeout = Duration::from_millis(200);
        let (handle, mut events, task) = spawn_node(opts);

        wait_for(&mut events, |e| matches!(e, NodeEvent::RegistryUnreachable { .. })).await;
        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails_locally() {
        let registry = start_registry().await;
        let (handle, mut events, task) = spawn_node(options("a1", registry));
        wait_for(&mut events, |e| matches!(e, NodeEvent::RegistryConnected { .. })).await;

        let files = vec![OutgoingFile::in_memory("a.txt", Bytes::from_static(b"a"))];
        handle.send_files(DeviceId::new("nobody"), files).await.unwrap();
        match wait_for(&mut events, |e| matches!(e, NodeEvent::Error { .. })).await {
            NodeEvent::Error { message } => assert!(message.contains("nobody")),
            other => panic!("unexpected {other:?}"),
        }

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reject_leaves_no_session() {
        let registry = start_registry().await;
        let (alice, mut alice_events, alice_task) = spawn_node(options("a1", registry));
        let (bob, mut bob_events, bob_task) = spawn_node(options("b2", registry));

        wait_for(&mut alice_events, |e| {
            matches!(e, NodeEvent::DeviceDiscovered(r) if r.id == DeviceId::new("b2"))
        })
        .await;

        let files = vec![OutgoingFile::in_memory("a.txt", Bytes::from_static(b"hello"))];
        alice.send_files(DeviceId::new("b2"), files).await.unwrap();

        wait_for(&mut bob_events, |e| matches!(e, NodeEvent::TransferRequested { .. })).await;
        bob.reject(DeviceId::new("a1")).await.unwrap();

        match wait_for(&mut alice_events, |e| {
            matches!(e, NodeEvent::TransferRejected { .. } | NodeEvent::TransferAccepted { .. })
        })
        .await
        {
            NodeEvent::TransferRejected { peer } => assert_eq!(peer, DeviceId::new("b2")),
            other => panic!("unexpected {other:?}"),
        }

        alice.shutdown().await.unwrap();
        bob.shutdown().await.unwrap();
        alice_task.await.unwrap();
        bob_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_accepted_transfer_writes_files() {
        let inbox = tempfile::tempdir().unwrap();
        let registry = start_registry().await;
        let (alice, mut alice_events, alice_task) = spawn_node(options("a1", registry));
        let (bob, mut bob_events, bob_task) = spawn_node(options("b2", registry));

        wait_for(&mut alice_events, |e| {
            matches!(e, NodeEvent::DeviceDiscovered(r) if r.id == DeviceId::new("b2"))
        })
        .await;

        let first: Bytes = (0..20_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
        let second: Bytes = (0..5_000u32).map(|i| (i % 13) as u8).collect::<Vec<_>>().into();
        let files = vec![
            OutgoingFile::in_memory("first.bin", first.clone()),
            OutgoingFile::in_memory("second.bin", second.clone()),
        ];
        alice.send_files(DeviceId::new("b2"), files).await.unwrap();

        match wait_for(&mut bob_events, |e| matches!(e, NodeEvent::TransferRequested { .. })).await {
            NodeEvent::TransferRequested {
                from, total_size, ..
            } => {
                assert_eq!(from, DeviceId::new("a1"));
                assert_eq!(total_size, 25_000);
            }
            other => panic!("unexpected {other:?}"),
        }
        bob.accept(DeviceId::new("a1"), Arc::new(DirectoryTarget::new(inbox.path())))
            .await
            .unwrap();

        wait_for(&mut alice_events, |e| matches!(e, NodeEvent::TransferCompleted { .. })).await;
        wait_for(&mut bob_events, |e| matches!(e, NodeEvent::TransferCompleted { .. })).await;

        assert_eq!(std::fs::read(inbox.path().join("first.bin")).unwrap(), first.to_vec());
        assert_eq!(std::fs::read(inbox.path().join("second.bin")).unwrap(), second.to_vec());

        alice.shutdown().await.unwrap();
        bob.shutdown().await.unwrap();
        alice_task.await.unwrap();
        bob_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_is_settled_by_first_arrival() {
        let registry = start_registry().await;
        let mut alice_opts = options("a1", registry);
        alice_opts.scan_timeout = Duration::from_millis(1500);
        let (alice, mut alice_events, alice_task) = spawn_node(alice_opts);
        wait_for(&mut alice_events, |e| matches!(e, NodeEvent::RegistryConnected { .. })).await;

        alice.scan().await.unwrap();
        let (bob, _bob_events, bob_task) = spawn_node(options("b2", registry));
        wait_for(&mut alice_events, |e| {
            matches!(e, NodeEvent::DeviceDiscovered(r) if r.id == DeviceId::new("b2"))
        })
        .await;

        let later = collect_for(&mut alice_events, Duration::from_millis(2000)).await;
        assert!(!later.iter().any(|e| matches!(e, NodeEvent::NoDevicesFound)));

        alice.shutdown().await.unwrap();
        bob.shutdown().await.unwrap();
        alice_task.await.unwrap();
        bob_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_arrival_cancels_scan_timer() {
        let (mut node, _events) = idle_node("a1");
        node.scan().await;
        assert!(node.scan_deadline.is_some());

        node.on_device(routable("b2", "s2")).await;
        assert!(node.scan_deadline.is_none());

        // Leaving again does not re-arm it.
        node.handle_server_message(ServerMessage::DeviceDisconnected {
            session_key: SessionKey::from("s2"),
        })
        .await;
        assert!(node.presence.is_empty());
        assert!(node.scan_deadline.is_none());
    }

    #[tokio::test]
    async fn test_rename_reaches_peers() {
        let registry = start_registry().await;
        let (alice, mut alice_events, alice_task) = spawn_node(options("a1", registry));
        let (bob, mut bob_events, bob_task) = spawn_node(options("b2", registry));

        wait_for(&mut alice_events, |e| {
            matches!(e, NodeEvent::DeviceDiscovered(r) if r.id == DeviceId::new("b2"))
        })
        .await;

        bob.rename("kitchen").await.unwrap();
        wait_for(&mut bob_events, |e| matches!(e, NodeEvent::Renamed { .. })).await;
        match wait_for(&mut alice_events, |e| {
            matches!(e, NodeEvent::DeviceDiscovered(r) if r.name == "kitchen")
        })
        .await
        {
            NodeEvent::DeviceDiscovered(record) => {
                assert_eq!(record.id, DeviceId::new("b2"));
                assert!(record.session_key.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }

        let devices = alice.devices().await.unwrap();
        let bob_record = devices.iter().find(|d| d.id == DeviceId::new("b2")).unwrap();
        assert_eq!(bob_record.name, "kitchen");

        alice.shutdown().await.unwrap();
        bob.shutdown().await.unwrap();
        alice_task.await.unwrap();
        bob_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_direct_and_broadcast_messages() {
        let registry = start_registry().await;
        let (alice, mut alice_events, alice_task) = spawn_node(options("a1", registry));
        let (bob, mut bob_events, bob_task) = spawn_node(options("b2", registry));

        wait_for(&mut alice_events, |e| {
            matches!(e, NodeEvent::DeviceDiscovered(r) if r.id == DeviceId::new("b2"))
        })
        .await;

        alice.send_message(DeviceId::new("b2"), "psst").await.unwrap();
        match wait_for(&mut bob_events, |e| matches!(e, NodeEvent::MessageReceived { .. })).await {
            NodeEvent::MessageReceived { from, message, direct } => {
                assert_eq!(from, DeviceId::new("a1"));
                assert_eq!(message, "psst");
                assert!(direct);
            }
            other => panic!("unexpected {other:?}"),
        }

        bob.broadcast("hello all").await.unwrap();
        match wait_for(&mut alice_events, |e| matches!(e, NodeEvent::MessageReceived { .. })).await {
            NodeEvent::MessageReceived { from, message, direct } => {
                assert_eq!(from, DeviceId::new("b2"));
                assert_eq!(message, "hello all");
                assert!(!direct);
            }
            other => panic!("unexpected {other:?}"),
        }

        alice.shutdown().await.unwrap();
        bob.shutdown().await.unwrap();
        alice_task.await.unwrap();
        bob_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_answer_while_registry_connect_hangs() {
        // Accepts TCP but never completes the WebSocket upgrade.
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut opts = options("a1", silent.local_addr().unwrap());
        opts.connect_policy.connect_timeout = Duration::from_secs(3);
        let (handle, _events, task) = spawn_node(opts);

        handle.scan().await.unwrap();
        let devices = tokio::time::timeout(Duration::from_millis(500), handle.devices())
            .await
            .expect("node loop blocked by connect")
            .unwrap();
        assert!(devices.is_empty());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        drop(silent);
    }

    #[tokio::test]
    async fn test_send_without_registry_fails_and_drops_intent() {
        let (mut node, mut events) = idle_node("a1");
        node.on_device(routable("b2", "s2")).await;
        assert!(matches!(events.try_recv(), Ok(NodeEvent::DeviceDiscovered(_))));

        let files = vec![OutgoingFile::in_memory("a.txt", Bytes::from_static(b"a"))];
        node.handle_command(NodeCommand::SendFiles {
            peer: DeviceId::new("b2"),
            files,
        })
        .await;

        match events.try_recv() {
            Ok(NodeEvent::Error { message }) => assert!(message.contains("registry")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!node.negotiator.has_intent(&DeviceId::new("b2")));
    }

    #[tokio::test]
    async fn test_lost_registry_forgets_devices() {
        let (mut node, mut events) = idle_node("a1");
        node.on_device(routable("b2", "s2")).await;
        node.on_device(routable("c3", "s3")).await;
        while events.try_recv().is_ok() {}

        node.handle_link(LinkNotification::GaveUp).await;

        let mut lost = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let NodeEvent::DeviceLost(record) = event {
                lost.push(record.id);
            }
        }
        lost.sort();
        assert_eq!(lost, vec![DeviceId::new("b2"), DeviceId::new("c3")]);
        assert!(node.presence.is_empty());
    }

    #[tokio::test]
    async fn test_rate_carries_across_files() {
        let (mut node, mut events) = idle_node("a1");
        let transfer_id = TransferId::new();
        let update = |kind| SessionUpdate {
            peer_id: DeviceId::new("b2"),
            transfer_id,
            role: SessionRole::Receiver,
            kind,
        };

        for index in 0..3u32 {
            node.handle_update(update(UpdateKind::FileStarted {
                name: format!("f{index}.bin"),
                size: 100_000,
                index,
                total: 3,
            }))
            .await;
            tokio::time::sleep(Duration::from_millis(700)).await;
            node.handle_update(update(UpdateKind::Progress {
                bytes: 100_000,
                total: 100_000,
            }))
            .await;
            node.handle_update(update(UpdateKind::FileFinished { index })).await;
        }

        let mut rates = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let NodeEvent::Progress(snapshot) = event {
                rates.push(snapshot.rate);
            }
        }
        assert!(rates
            .iter()
            .any(|rate| matches!(rate, Rate::BytesPerSecond(bps) if *bps > 0)));
    }
}
