//! Transfer sessions: the per-peer state machine, chunk framing, receive-side
//! reassembly and the async drivers that run one session over a channel.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use lanbeam_shared::constants::{CHUNK_DELAY_MS, CHUNK_SIZE, CONNECT_TIMEOUT_MS};
use lanbeam_shared::protocol::{ControlMessage, Envelope};
use lanbeam_shared::types::{ConnectionOffer, DeviceId, TransferId};

use crate::channel::{self, ChannelEvent, PeerChannel, PeerListener};
use crate::error::SessionError;
use crate::storage::{persist, OutgoingFile, SaveTarget};

/// How long a receiver waits for the sender to dial in.
pub const ACCEPT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Transferring,
    Complete,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Failed)
    }
}

/// State machine for one peer data channel.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub peer_id: DeviceId,
    pub role: SessionRole,
    pub transfer_id: TransferId,
    pub state: SessionState,
}

impl TransferSession {
    pub fn new(peer_id: DeviceId, role: SessionRole, transfer_id: TransferId) -> Self {
        Self {
            peer_id,
            role,
            transfer_id,
            state: SessionState::Idle,
        }
    }

    /// Start establishing the channel.
    pub fn dial(&mut self) -> SessionState {
        if self.state == SessionState::Idle {
            self.transition(SessionState::Connecting);
        }
        self.state
    }

    /// Feed a channel event through the state machine.
    pub fn on_channel(&mut self, event: &ChannelEvent) -> SessionState {
        use SessionState::*;

        let next = match (self.state, event) {
            (Connecting, ChannelEvent::Ready) => match self.role {
                SessionRole::Sender => Transferring,
                SessionRole::Receiver => Connected,
            },
            (Connected, ChannelEvent::Envelope(Envelope::Control(ControlMessage::FileStart { .. }))) => {
                Transferring
            }
            (
                Connected | Transferring,
                ChannelEvent::Envelope(Envelope::Control(ControlMessage::TransferComplete)),
            ) if self.role == SessionRole::Receiver => Complete,
            (state, ChannelEvent::Error(_) | ChannelEvent::Closed) if !state.is_terminal() => Failed,
            (state, _) => state,
        };

        if next != self.state {
            self.transition(next);
        }
        self.state
    }

    /// Sender finished writing `transfer-complete`.
    pub fn mark_sent(&mut self) -> SessionState {
        if self.state == SessionState::Transferring {
            self.transition(SessionState::Complete);
        }
        self.state
    }

    /// Abort from any state. Terminal states are kept.
    pub fn fail(&mut self) -> SessionState {
        if !self.state.is_terminal() {
            self.transition(SessionState::Failed);
        }
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug!(
            peer = %self.peer_id,
            role = ?self.role,
            from = ?self.state,
            to = ?next,
            "Session state change"
        );
        self.state = next;
    }
}

/// Frame one file: `file-start`, its data chunks, `file-end`.
///
/// Chunks are zero-copy slices of `data`; the last one may be short. An
/// empty file produces no data chunks.
pub fn file_frames(
    index: u32,
    total: u32,
    name: &str,
    data: &Bytes,
    chunk_size: usize,
) -> Vec<Envelope> {
    let chunk_size = chunk_size.max(1);
    let mut frames = Vec::with_capacity(data.len() / chunk_size + 3);

    frames.push(Envelope::Control(ControlMessage::FileStart {
        name: name.to_string(),
        size: data.len() as u64,
        index,
        total,
    }));

    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + chunk_size).min(data.len());
        frames.push(Envelope::Data(data.slice(offset..end)));
        offset = end;
    }

    frames.push(Envelope::Control(ControlMessage::FileEnd { index }));
    frames
}

/// A file fully reassembled on the receive side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub index: u32,
    pub declared_size: u64,
    pub data: Bytes,
}

/// What one incoming envelope did to the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyEvent {
    FileStarted {
        name: String,
        size: u64,
        index: u32,
        total: u32,
    },
    Chunk {
        received: u64,
        declared: u64,
    },
    FileReady(ReceivedFile),
    TransferComplete,
    Ignored,
}

#[derive(Debug)]
struct OpenFile {
    name: String,
    declared_size: u64,
    index: u32,
    chunks: Vec<Bytes>,
    received: u64,
}

/// Receive-side reassembly. Makes no assumption about chunk sizes.
#[derive(Debug, Default)]
pub struct FileAssembler {
    open: Option<OpenFile>,
}

impl FileAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_envelope(&mut self, envelope: Envelope) -> AssemblyEvent {
        match envelope {
            Envelope::Control(ControlMessage::FileStart {
                name,
                size,
                index,
                total,
            }) => {
                if let Some(bytes) = self.discard() {
                    warn!(bytes, "New file started before the previous one ended");
                }
                self.open = Some(OpenFile {
                    name: name.clone(),
                    declared_size: size,
                    index,
                    chunks: Vec::new(),
                    received: 0,
                });
                AssemblyEvent::FileStarted {
                    name,
                    size,
                    index,
                    total,
                }
            }

            Envelope::Data(bytes) => match self.open.as_mut() {
                Some(file) => {
                    file.received += bytes.len() as u64;
                    file.chunks.push(bytes);
                    AssemblyEvent::Chunk {
                        received: file.received,
                        declared: file.declared_size,
                    }
                }
                None => {
                    warn!(bytes = bytes.len(), "Data chunk outside of a file");
                    AssemblyEvent::Ignored
                }
            },

            Envelope::Control(ControlMessage::FileEnd { index }) => {
                let Some(file) = self.open.take() else {
                    warn!(index, "file-end without an open file");
                    return AssemblyEvent::Ignored;
                };
                if file.index != index {
                    warn!(expected = file.index, got = index, "file-end index mismatch");
                }
                if file.received != file.declared_size {
                    warn!(
                        name = %file.name,
                        declared = file.declared_size,
                        received = file.received,
                        "Received size differs from declared size"
                    );
                }

                let mut buf = BytesMut::with_capacity(file.received as usize);
                for chunk in &file.chunks {
                    buf.extend_from_slice(chunk);
                }

                AssemblyEvent::FileReady(ReceivedFile {
                    name: file.name,
                    index: file.index,
                    declared_size: file.declared_size,
                    data: buf.freeze(),
                })
            }

            Envelope::Control(ControlMessage::TransferComplete) => {
                if let Some(bytes) = self.discard() {
                    warn!(bytes, "Transfer completed with a file still open");
                }
                AssemblyEvent::TransferComplete
            }
        }
    }

    /// Drop any partially received file, returning how many bytes it held.
    pub fn discard(&mut self) -> Option<u64> {
        self.open.take().map(|f| f.received)
    }

    pub fn has_open_file(&self) -> bool {
        self.open.is_some()
    }
}

/// Entry in the [`SessionRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEntry {
    pub transfer_id: TransferId,
    pub role: SessionRole,
    pub state: SessionState,
}

/// Active sessions keyed by peer id. At most one live session per peer.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<DeviceId, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session with `peer_id`.
    ///
    /// Fails with [`SessionError::AlreadyActive`] while a non-terminal
    /// session exists; terminal entries are replaced.
    pub fn try_insert(
        &mut self,
        peer_id: DeviceId,
        role: SessionRole,
    ) -> Result<TransferSession, SessionError> {
        if self.is_active(&peer_id) {
            return Err(SessionError::AlreadyActive(peer_id));
        }

        let session = TransferSession::new(peer_id.clone(), role, TransferId::new());
        self.sessions.insert(
            peer_id,
            SessionEntry {
                transfer_id: session.transfer_id,
                role,
                state: session.state,
            },
        );
        Ok(session)
    }

    /// Record a state reported by the session's driver. Ignores reports
    /// from a session that has since been replaced.
    pub fn set_state(&mut self, peer_id: &DeviceId, transfer_id: TransferId, state: SessionState) -> bool {
        match self.sessions.get_mut(peer_id) {
            Some(entry) if entry.transfer_id == transfer_id => {
                entry.state = state;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, peer_id: &DeviceId, transfer_id: TransferId) -> Option<SessionEntry> {
        match self.sessions.get(peer_id) {
            Some(entry) if entry.transfer_id == transfer_id => self.sessions.remove(peer_id),
            _ => None,
        }
    }

    pub fn get(&self, peer_id: &DeviceId) -> Option<&SessionEntry> {
        self.sessions.get(peer_id)
    }

    pub fn is_active(&self, peer_id: &DeviceId) -> bool {
        self.sessions
            .get(peer_id)
            .is_some_and(|entry| !entry.state.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Tunables for the session drivers.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub chunk_size: usize,
    /// Pause after every chunk on the send path.
    pub chunk_delay: Duration,
    /// Deadline for the sender to open the peer channel.
    pub connect_timeout: Duration,
    /// Deadline for the receiver to see the sender dial in.
    pub accept_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            chunk_delay: Duration::from_millis(CHUNK_DELAY_MS),
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            accept_timeout: Duration::from_secs(ACCEPT_TIMEOUT_SECS),
        }
    }
}

/// Progress and lifecycle report from a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUpdate {
    pub peer_id: DeviceId,
    pub transfer_id: TransferId,
    pub role: SessionRole,
    pub kind: UpdateKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    State(SessionState),
    FileStarted {
        name: String,
        size: u64,
        index: u32,
        total: u32,
    },
    /// Bytes moved within the current file.
    Progress {
        bytes: u64,
        total: u64,
    },
    FileFinished {
        index: u32,
    },
    FileSaved {
        name: String,
        path: PathBuf,
    },
    /// No destination was given; the file was dropped.
    FileDiscarded {
        name: String,
    },
    FileWriteFailed {
        name: String,
        path: PathBuf,
    },
    /// The channel closed mid-file; the partial data was dropped.
    PartialDiscarded {
        bytes: u64,
    },
    /// Emitted right before the final `State(Failed)`.
    Failed {
        reason: String,
    },
}

struct Reporter {
    peer_id: DeviceId,
    transfer_id: TransferId,
    role: SessionRole,
    tx: mpsc::Sender<SessionUpdate>,
}

impl Reporter {
    fn new(session: &TransferSession, tx: mpsc::Sender<SessionUpdate>) -> Self {
        Self {
            peer_id: session.peer_id.clone(),
            transfer_id: session.transfer_id,
            role: session.role,
            tx,
        }
    }

    async fn emit(&self, kind: UpdateKind) {
        let update = SessionUpdate {
            peer_id: self.peer_id.clone(),
            transfer_id: self.transfer_id,
            role: self.role,
            kind,
        };
        if self.tx.send(update).await.is_err() {
            debug!(peer = %self.peer_id, "Session update dropped: owner gone");
        }
    }

    async fn fail(&self, session: &mut TransferSession, reason: String) -> SessionState {
        warn!(peer = %self.peer_id, reason = %reason, "Transfer session failed");
        let state = session.fail();
        self.emit(UpdateKind::Failed { reason }).await;
        self.emit(UpdateKind::State(state)).await;
        state
    }
}

/// Dial the receiver named in `offer` and send `files` in order.
pub async fn run_sender(
    mut session: TransferSession,
    offer: ConnectionOffer,
    files: Vec<OutgoingFile>,
    config: SessionConfig,
    updates: mpsc::Sender<SessionUpdate>,
) -> SessionState {
    let reporter = Reporter::new(&session, updates.clone());
    let state = session.dial();
    reporter.emit(UpdateKind::State(state)).await;

    match channel::connect(&offer, config.connect_timeout).await {
        Ok(channel) => send_over(session, channel, files, config, updates).await,
        Err(e) => reporter.fail(&mut session, e.to_string()).await,
    }
}

/// Send `files` over an already-open channel.
pub async fn send_over<S>(
    mut session: TransferSession,
    mut channel: PeerChannel<S>,
    files: Vec<OutgoingFile>,
    config: SessionConfig,
    updates: mpsc::Sender<SessionUpdate>,
) -> SessionState
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reporter = Reporter::new(&session, updates);
    session.dial();
    let state = session.on_channel(&ChannelEvent::Ready);
    reporter.emit(UpdateKind::State(state)).await;

    match send_files(&mut channel, &files, &config, &reporter).await {
        Ok(()) => {
            let state = session.mark_sent();
            info!(peer = %session.peer_id, files = files.len(), "All files sent");
            reporter.emit(UpdateKind::State(state)).await;
            channel.close().await;
            state
        }
        Err(e) => {
            channel.close().await;
            reporter.fail(&mut session, e.to_string()).await
        }
    }
}

async fn send_files<S>(
    channel: &mut PeerChannel<S>,
    files: &[OutgoingFile],
    config: &SessionConfig,
    reporter: &Reporter,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let total = files.len() as u32;

    for (index, file) in files.iter().enumerate() {
        let index = index as u32;
        let data = file.source.load().await.map_err(|source| SessionError::Read {
            name: file.entry.name.clone(),
            source,
        })?;
        if data.len() as u64 != file.entry.size {
            warn!(
                name = %file.entry.name,
                declared = file.entry.size,
                actual = data.len(),
                "File size changed since the request was made"
            );
        }

        let size = data.len() as u64;
        reporter
            .emit(UpdateKind::FileStarted {
                name: file.entry.name.clone(),
                size,
                index,
                total,
            })
            .await;

        let mut sent = 0u64;
        for frame in file_frames(index, total, &file.entry.name, &data, config.chunk_size) {
            channel.send(&frame).await?;

            if let Envelope::Data(chunk) = &frame {
                sent += chunk.len() as u64;
                reporter.emit(UpdateKind::Progress { bytes: sent, total: size }).await;
                if !config.chunk_delay.is_zero() {
                    tokio::time::sleep(config.chunk_delay).await;
                }
            }
        }

        reporter.emit(UpdateKind::FileFinished { index }).await;
    }

    channel
        .send(&Envelope::Control(ControlMessage::TransferComplete))
        .await?;
    Ok(())
}

/// Wait for the sender on `listener`, then receive into `target`.
pub async fn run_receiver(
    mut session: TransferSession,
    listener: PeerListener,
    target: Arc<dyn SaveTarget>,
    config: SessionConfig,
    updates: mpsc::Sender<SessionUpdate>,
) -> SessionState {
    let reporter = Reporter::new(&session, updates.clone());
    let state = session.dial();
    reporter.emit(UpdateKind::State(state)).await;

    match listener.accept(config.accept_timeout).await {
        Ok(channel) => receive_over(session, channel, target, updates).await,
        Err(e) => reporter.fail(&mut session, e.to_string()).await,
    }
}

/// Receive files over an already-open channel.
pub async fn receive_over<S>(
    mut session: TransferSession,
    mut channel: PeerChannel<S>,
    target: Arc<dyn SaveTarget>,
    updates: mpsc::Sender<SessionUpdate>,
) -> SessionState
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reporter = Reporter::new(&session, updates);
    let mut assembler = FileAssembler::new();

    session.dial();
    let state = session.on_channel(&ChannelEvent::Ready);
    reporter.emit(UpdateKind::State(state)).await;

    loop {
        let event = channel.next_event().await;
        let before = session.state;
        let after = session.on_channel(&event);
        if after != before && after != SessionState::Failed {
            reporter.emit(UpdateKind::State(after)).await;
        }

        match event {
            ChannelEvent::Envelope(envelope) => match assembler.on_envelope(envelope) {
                AssemblyEvent::FileStarted {
                    name,
                    size,
                    index,
                    total,
                } => {
                    debug!(peer = %session.peer_id, name = %name, size, index, total, "Receiving file");
                    reporter
                        .emit(UpdateKind::FileStarted {
                            name,
                            size,
                            index,
                            total,
                        })
                        .await;
                }
                AssemblyEvent::Chunk { received, declared } => {
                    reporter
                        .emit(UpdateKind::Progress {
                            bytes: received,
                            total: declared,
                        })
                        .await;
                }
                AssemblyEvent::FileReady(file) => {
                    reporter.emit(UpdateKind::FileFinished { index: file.index }).await;
                    store(&file, target.as_ref(), &reporter).await;
                }
                AssemblyEvent::TransferComplete => {
                    info!(peer = %session.peer_id, "Transfer complete");
                    channel.close().await;
                    return session.state;
                }
                AssemblyEvent::Ignored => {}
            },
            ChannelEvent::Ready => {}
            ChannelEvent::Error(reason) => {
                return abort_receive(&mut session, &mut assembler, &reporter, reason).await;
            }
            ChannelEvent::Closed => {
                let reason = "peer closed the channel".to_string();
                return abort_receive(&mut session, &mut assembler, &reporter, reason).await;
            }
        }
    }
}

async fn store(file: &ReceivedFile, target: &dyn SaveTarget, reporter: &Reporter) {
    let name = file.name.clone();
    match target.destination_for(&file.name) {
        Some(path) => {
            let kind = if persist(&path, &file.data).await {
                UpdateKind::FileSaved { name, path }
            } else {
                UpdateKind::FileWriteFailed { name, path }
            };
            reporter.emit(kind).await;
        }
        None => {
            debug!(name = %file.name, "No destination, discarding file");
            reporter.emit(UpdateKind::FileDiscarded { name }).await;
        }
    }
}

async fn abort_receive(
    session: &mut TransferSession,
    assembler: &mut FileAssembler,
    reporter: &Reporter,
    reason: String,
) -> SessionState {
    if let Some(bytes) = assembler.discard() {
        error!(peer = %session.peer_id, bytes, "Discarding partially received file");
        reporter.emit(UpdateKind::PartialDiscarded { bytes }).await;
    }
    reporter.fail(session, reason).await
}

/// Bind a listener for an accepted request and return it with its offer.
pub async fn prepare_receiver(advertise_ip: IpAddr) -> Result<(PeerListener, ConnectionOffer), SessionError> {
    let listener = PeerListener::bind(advertise_ip).await?;
    let offer = listener.offer().clone();
    Ok((listener, offer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio_tungstenite::tungstenite::protocol::Role;

    use crate::storage::{DirectoryTarget, DiscardTarget};

    fn patterned(len: usize, seed: u8) -> Bytes {
        Bytes::from((0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect::<Vec<_>>())
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            chunk_delay: Duration::ZERO,
            ..SessionConfig::default()
        }
    }

    fn describe(frames: &[Envelope]) -> Vec<String> {
        frames
            .iter()
            .map(|f| match f {
                Envelope::Control(ControlMessage::FileStart { index, size, .. }) => {
                    format!("start({index},{size})")
                }
                Envelope::Control(ControlMessage::FileEnd { index }) => format!("end({index})"),
                Envelope::Control(ControlMessage::TransferComplete) => "complete".to_string(),
                Envelope::Data(b) => format!("chunk({})", b.len()),
            })
            .collect()
    }

    fn reassemble(frames: Vec<Envelope>) -> Vec<ReceivedFile> {
        let mut assembler = FileAssembler::new();
        frames
            .into_iter()
            .filter_map(|f| match assembler.on_envelope(f) {
                AssemblyEvent::FileReady(file) => Some(file),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_two_file_wire_sequence() {
        let a = patterned(20_000, 1);
        let b = patterned(5_000, 2);

        let mut frames = file_frames(0, 2, "a.bin", &a, CHUNK_SIZE);
        frames.extend(file_frames(1, 2, "b.bin", &b, CHUNK_SIZE));
        frames.push(Envelope::Control(ControlMessage::TransferComplete));

        assert_eq!(
            describe(&frames),
            vec![
                "start(0,20000)",
                "chunk(16384)",
                "chunk(3616)",
                "end(0)",
                "start(1,5000)",
                "chunk(5000)",
                "end(1)",
                "complete",
            ]
        );

        let files = reassemble(frames);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].data, a);
        assert_eq!(files[1].data, b);
    }

    #[test]
    fn test_reconstruction_edge_sizes() {
        for len in [0, CHUNK_SIZE, 3 * CHUNK_SIZE, CHUNK_SIZE + 1, 7] {
            let data = patterned(len, 9);
            let frames = file_frames(0, 1, "f", &data, CHUNK_SIZE);
            let chunks = frames.iter().filter(|f| !f.is_control()).count();
            assert_eq!(chunks, len.div_ceil(CHUNK_SIZE));
            assert!(frames.iter().all(|f| f.data_len() <= CHUNK_SIZE));

            let files = reassemble(frames);
            assert_eq!(files.len(), 1);
            assert_eq!(files[0].data, data, "len {len}");
        }
    }

    #[test]
    fn test_assembler_accepts_any_chunking() {
        let mut assembler = FileAssembler::new();
        assembler.on_envelope(Envelope::Control(ControlMessage::FileStart {
            name: "x".into(),
            size: 6,
            index: 0,
            total: 1,
        }));
        for piece in [&b"a"[..], b"bcd", b"ef"] {
            assembler.on_envelope(Envelope::Data(Bytes::copy_from_slice(piece)));
        }
        match assembler.on_envelope(Envelope::Control(ControlMessage::FileEnd { index: 0 })) {
            AssemblyEvent::FileReady(file) => assert_eq!(&file.data[..], b"abcdef"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_assembler_ignores_stray_data_and_discards() {
        let mut assembler = FileAssembler::new();
        assert_eq!(
            assembler.on_envelope(Envelope::Data(Bytes::from_static(b"zz"))),
            AssemblyEvent::Ignored
        );
        assert_eq!(assembler.discard(), None);

        assembler.on_envelope(Envelope::Control(ControlMessage::FileStart {
            name: "x".into(),
            size: 100,
            index: 0,
            total: 1,
        }));
        assembler.on_envelope(Envelope::Data(Bytes::from_static(b"1234")));
        assert!(assembler.has_open_file());
        assert_eq!(assembler.discard(), Some(4));
        assert!(!assembler.has_open_file());
    }

    #[test]
    fn test_sender_state_transitions() {
        let mut session = TransferSession::new("b2".into(), SessionRole::Sender, TransferId::new());
        assert_eq!(session.state, SessionState::Idle);
        assert_eq!(session.dial(), SessionState::Connecting);
        assert_eq!(session.on_channel(&ChannelEvent::Ready), SessionState::Transferring);
        assert_eq!(session.mark_sent(), SessionState::Complete);
        // A close after completion does not fail the session.
        assert_eq!(session.on_channel(&ChannelEvent::Closed), SessionState::Complete);
    }

    #[test]
    fn test_receiver_state_transitions() {
        let mut session = TransferSession::new("a1".into(), SessionRole::Receiver, TransferId::new());
        session.dial();
        assert_eq!(session.on_channel(&ChannelEvent::Ready), SessionState::Connected);
        let start = ChannelEvent::Envelope(Envelope::Control(ControlMessage::FileStart {
            name: "x".into(),
            size: 1,
            index: 0,
            total: 1,
        }));
        assert_eq!(session.on_channel(&start), SessionState::Transferring);
        assert_eq!(
            session.on_channel(&ChannelEvent::Error("reset".into())),
            SessionState::Failed
        );
        assert_eq!(session.fail(), SessionState::Failed);
    }

    #[test]
    fn test_registry_rejects_second_active_session() {
        let mut registry = SessionRegistry::new();
        let peer = DeviceId::new("b2");

        let first = registry.try_insert(peer.clone(), SessionRole::Sender).unwrap();
        assert!(matches!(
            registry.try_insert(peer.clone(), SessionRole::Receiver),
            Err(SessionError::AlreadyActive(_))
        ));

        assert!(registry.set_state(&peer, first.transfer_id, SessionState::Complete));
        let second = registry.try_insert(peer.clone(), SessionRole::Receiver).unwrap();
        assert_ne!(first.transfer_id, second.transfer_id);

        // Stale reports from the replaced session are ignored.
        assert!(!registry.set_state(&peer, first.transfer_id, SessionState::Failed));
        assert!(registry.remove(&peer, first.transfer_id).is_none());
        assert!(registry.remove(&peer, second.transfer_id).is_some());
        assert!(registry.is_empty());
    }

    async fn drain(mut rx: mpsc::Receiver<SessionUpdate>) -> Vec<UpdateKind> {
        let mut kinds = Vec::new();
        while let Some(update) = rx.recv().await {
            kinds.push(update.kind);
        }
        kinds
    }

    #[tokio::test]
    async fn test_end_to_end_over_duplex() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b) = tokio::io::duplex(256 * 1024);
        let sender_channel = PeerChannel::from_raw(a, Role::Client, "receiver").await;
        let receiver_channel = PeerChannel::from_raw(b, Role::Server, "sender").await;

        let first = patterned(20_000, 3);
        let second = patterned(5_000, 4);
        let empty = Bytes::new();
        let files = vec![
            OutgoingFile::in_memory("first.bin", first.clone()),
            OutgoingFile::in_memory("second.bin", second.clone()),
            OutgoingFile::in_memory("empty.txt", empty.clone()),
        ];

        let (send_tx, send_rx) = mpsc::channel(1024);
        let (recv_tx, recv_rx) = mpsc::channel(1024);
        let sender = TransferSession::new("b2".into(), SessionRole::Sender, TransferId::new());
        let receiver = TransferSession::new("a1".into(), SessionRole::Receiver, TransferId::new());
        let target: Arc<dyn SaveTarget> = Arc::new(DirectoryTarget::new(dir.path()));

        let send_task = tokio::spawn(send_over(sender, sender_channel, files, fast_config(), send_tx));
        let recv_task = tokio::spawn(receive_over(receiver, receiver_channel, target, recv_tx));

        assert_eq!(send_task.await.unwrap(), SessionState::Complete);
        assert_eq!(recv_task.await.unwrap(), SessionState::Complete);

        assert_eq!(std::fs::read(dir.path().join("first.bin")).unwrap(), first.to_vec());
        assert_eq!(std::fs::read(dir.path().join("second.bin")).unwrap(), second.to_vec());
        assert!(std::fs::read(dir.path().join("empty.txt")).unwrap().is_empty());

        let received = drain(recv_rx).await;
        let saved = received
            .iter()
            .filter(|k| matches!(k, UpdateKind::FileSaved { .. }))
            .count();
        assert_eq!(saved, 3);
        assert_eq!(received.last(), Some(&UpdateKind::State(SessionState::Complete)));

        let sent = drain(send_rx).await;
        assert_eq!(sent.first(), Some(&UpdateKind::State(SessionState::Transferring)));
        assert!(sent.contains(&UpdateKind::Progress { bytes: 20_000, total: 20_000 }));
        assert_eq!(sent.last(), Some(&UpdateKind::State(SessionState::Complete)));
    }

    #[tokio::test]
    async fn test_receiver_without_destination_discards_silently() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let sender_channel = PeerChannel::from_raw(a, Role::Client, "receiver").await;
        let receiver_channel = PeerChannel::from_raw(b, Role::Server, "sender").await;

        let (send_tx, _send_rx) = mpsc::channel(1024);
        let (recv_tx, recv_rx) = mpsc::channel(1024);
        let files = vec![OutgoingFile::in_memory("x.bin", patterned(100, 0))];

        let send_task = tokio::spawn(send_over(
            TransferSession::new("b2".into(), SessionRole::Sender, TransferId::new()),
            sender_channel,
            files,
            fast_config(),
            send_tx,
        ));
        let state = receive_over(
            TransferSession::new("a1".into(), SessionRole::Receiver, TransferId::new()),
            receiver_channel,
            Arc::new(DiscardTarget),
            recv_tx,
        )
        .await;

        assert_eq!(state, SessionState::Complete);
        assert_eq!(send_task.await.unwrap(), SessionState::Complete);
        assert!(drain(recv_rx)
            .await
            .contains(&UpdateKind::FileDiscarded { name: "x.bin".into() }));
    }

    #[tokio::test]
    async fn test_close_mid_file_discards_partial_data() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut raw_sender = PeerChannel::from_raw(a, Role::Client, "receiver").await;
        let receiver_channel = PeerChannel::from_raw(b, Role::Server, "sender").await;

        let data = patterned(20_000, 5);
        let frames = file_frames(0, 1, "cut.bin", &data, CHUNK_SIZE);
        // file-start and the first chunk only.
        for frame in &frames[..2] {
            raw_sender.send(frame).await.unwrap();
        }
        raw_sender.close().await;

        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel(1024);
        let state = receive_over(
            TransferSession::new("a1".into(), SessionRole::Receiver, TransferId::new()),
            receiver_channel,
            Arc::new(DirectoryTarget::new(dir.path())),
            tx,
        )
        .await;

        assert_eq!(state, SessionState::Failed);
        assert!(!dir.path().join("cut.bin").exists());

        let kinds = drain(rx).await;
        assert!(kinds.contains(&UpdateKind::PartialDiscarded { bytes: CHUNK_SIZE as u64 }));
        assert_eq!(kinds.last(), Some(&UpdateKind::State(SessionState::Failed)));
    }

    #[tokio::test]
    async fn test_sender_fails_on_unreachable_offer() {
        let (tx, rx) = mpsc::channel(16);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let state = run_sender(
            TransferSession::new("b2".into(), SessionRole::Sender, TransferId::new()),
            ConnectionOffer { address },
            vec![OutgoingFile::in_memory("a", Bytes::from_static(b"a"))],
            SessionConfig {
                connect_timeout: Duration::from_millis(500),
                ..fast_config()
            },
            tx,
        )
        .await;

        assert_eq!(state, SessionState::Failed);
        let kinds = drain(rx).await;
        assert_eq!(kinds.first(), Some(&UpdateKind::State(SessionState::Connecting)));
        assert!(kinds.iter().any(|k| matches!(k, UpdateKind::Failed { .. })));
    }

    #[tokio::test]
    async fn test_run_receiver_and_sender_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let (listener, offer) = prepare_receiver(IpAddr::V4(Ipv4Addr::LOCALHOST)).await.unwrap();
        let (tx, _rx) = mpsc::channel(1024);
        let (tx2, _rx2) = mpsc::channel(1024);

        let recv = tokio::spawn(run_receiver(
            TransferSession::new("a1".into(), SessionRole::Receiver, TransferId::new()),
            listener,
            Arc::new(DirectoryTarget::new(dir.path())),
            fast_config(),
            tx,
        ));
        let data = patterned(40_000, 6);
        let sent = run_sender(
            TransferSession::new("b2".into(), SessionRole::Sender, TransferId::new()),
            offer,
            vec![OutgoingFile::in_memory("tcp.bin", data.clone())],
            fast_config(),
            tx2,
        )
        .await;

        assert_eq!(sent, SessionState::Complete);
        assert_eq!(recv.await.unwrap(), SessionState::Complete);
        assert_eq!(std::fs::read(dir.path().join("tcp.bin")).unwrap(), data.to_vec());
    }
}
