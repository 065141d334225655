// Presence client, handshake and peer-to-peer transfer layer over WebSockets.

pub mod channel;
pub mod connect;
pub mod error;
pub mod link;
pub mod negotiator;
pub mod presence;
pub mod progress;
pub mod session;
pub mod storage;

pub use channel::{ChannelEvent, PeerChannel, PeerListener};
pub use connect::{candidate_endpoints, connect_first, local_address, local_ipv4, ConnectPolicy, Endpoint};
pub use error::{ConnectivityError, SessionError};
pub use link::{spawn_link, LinkCommand, LinkNotification};
pub use negotiator::{IncomingRequest, ResponseOutcome, TransferIntent, TransferNegotiator};
pub use presence::{PresenceTable, UpsertOutcome};
pub use progress::{ProgressSnapshot, ProgressTracker, Rate};
pub use session::{
    SessionConfig, SessionRegistry, SessionRole, SessionState, SessionUpdate, TransferSession, UpdateKind,
};
pub use storage::{DirectoryTarget, DiscardTarget, FileSource, OutgoingFile, SaveTarget};
