//! Peer-to-peer data channel.
//!
//! One WebSocket carries both control records and file data. The
//! [`Envelope`] variant decides the frame kind: control records become text
//! frames holding JSON, data becomes binary frames holding raw bytes. The
//! receiver therefore never inspects binary payloads for a tag.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use lanbeam_shared::protocol::{ControlMessage, Envelope};
use lanbeam_shared::types::ConnectionOffer;

use crate::error::ConnectivityError;

/// Everything a session can observe on its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel is open and ordered delivery can begin.
    Ready,
    /// A control record or a data chunk arrived.
    Envelope(Envelope),
    /// Transport error; the channel is unusable afterwards.
    Error(String),
    /// The peer closed the channel (or the stream ended).
    Closed,
}

/// Map an envelope onto its WebSocket frame.
pub fn encode(envelope: &Envelope) -> Result<Message, serde_json::Error> {
    match envelope {
        Envelope::Control(control) => Ok(Message::Text(control.to_json()?.into())),
        Envelope::Data(bytes) => Ok(Message::Binary(bytes.clone())),
    }
}

/// Map a WebSocket frame back onto an envelope.
///
/// Returns `None` for frames that carry no envelope (ping, pong, close,
/// raw frames).
pub fn decode(message: Message) -> Option<Result<Envelope, serde_json::Error>> {
    match message {
        Message::Text(text) => Some(ControlMessage::from_json(text.as_str()).map(Envelope::Control)),
        Message::Binary(bytes) => Some(Ok(Envelope::Data(bytes))),
        _ => None,
    }
}

/// An open data channel over any byte stream.
pub struct PeerChannel<S> {
    ws: WebSocketStream<S>,
    peer: String,
}

/// Channel dialled by the sender.
pub type OutboundChannel = PeerChannel<MaybeTlsStream<TcpStream>>;

/// Channel accepted by the receiver.
pub type InboundChannel = PeerChannel<TcpStream>;

impl<S> PeerChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ws: WebSocketStream<S>, peer: impl Into<String>) -> Self {
        Self {
            ws,
            peer: peer.into(),
        }
    }

    /// Wrap an already-connected stream without an HTTP upgrade.
    pub async fn from_raw(stream: S, role: Role, peer: impl Into<String>) -> Self {
        let ws = WebSocketStream::from_raw_socket(stream, role, None).await;
        Self::new(ws, peer)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send one envelope. Resolves once the frame has been flushed.
    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), ConnectivityError> {
        let message = encode(envelope)?;
        self.ws.send(message).await?;
        Ok(())
    }

    /// Wait for the next envelope or terminal event.
    ///
    /// Malformed text frames are logged and skipped.
    pub async fn next_event(&mut self) -> ChannelEvent {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Close(_))) | None => return ChannelEvent::Closed,
                Some(Ok(message)) => match decode(message) {
                    Some(Ok(envelope)) => return ChannelEvent::Envelope(envelope),
                    Some(Err(e)) => {
                        warn!(peer = %self.peer, error = %e, "Skipping malformed control record");
                    }
                    None => {}
                },
                Some(Err(e)) => return ChannelEvent::Error(e.to_string()),
            }
        }
    }

    /// Close the channel, ignoring errors from an already-closed peer.
    pub async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!(peer = %self.peer, error = %e, "Close on finished channel");
        }
    }
}

/// Receiver side of channel setup: a bound listener plus the offer that
/// tells the sender where to dial.
pub struct PeerListener {
    listener: TcpListener,
    offer: ConnectionOffer,
}

impl PeerListener {
    /// Bind an ephemeral port on all interfaces and advertise it on
    /// `advertise_ip`.
    pub async fn bind(advertise_ip: IpAddr) -> Result<Self, ConnectivityError> {
        let listener = TcpListener::bind(SocketAddr::new(unspecified_like(advertise_ip), 0)).await?;
        let port = listener.local_addr()?.port();
        let offer = ConnectionOffer {
            address: SocketAddr::new(advertise_ip, port).to_string(),
        };
        debug!(address = %offer.address, "Listening for peer channel");
        Ok(Self { listener, offer })
    }

    pub fn offer(&self) -> &ConnectionOffer {
        &self.offer
    }

    /// Accept exactly one peer and complete the WebSocket handshake.
    pub async fn accept(self, timeout: Duration) -> Result<InboundChannel, ConnectivityError> {
        let pending = async {
            let (stream, remote) = self.listener.accept().await?;
            let ws = tokio_tungstenite::accept_async(stream).await?;
            Ok::<_, ConnectivityError>(PeerChannel::new(ws, remote.to_string()))
        };

        match tokio::time::timeout(timeout, pending).await {
            Ok(result) => {
                let channel = result?;
                info!(peer = %channel.peer(), "Peer channel accepted");
                Ok(channel)
            }
            Err(_) => Err(ConnectivityError::Timeout {
                endpoint: self.offer.address.clone(),
                after_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

fn unspecified_like(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    }
}

/// Sender side of channel setup: dial the address in `offer`.
pub async fn connect(
    offer: &ConnectionOffer,
    timeout: Duration,
) -> Result<OutboundChannel, ConnectivityError> {
    let address: SocketAddr = offer
        .address
        .parse()
        .map_err(|_| ConnectivityError::InvalidOffer(offer.address.clone()))?;
    let url = format!("ws://{address}/");

    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str())).await {
        Ok(Ok((ws, _response))) => {
            info!(peer = %address, "Peer channel connected");
            Ok(PeerChannel::new(ws, address.to_string()))
        }
        Ok(Err(e)) => Err(ConnectivityError::WebSocket(e)),
        Err(_) => Err(ConnectivityError::Timeout {
            endpoint: url,
            after_ms: timeout.as_millis() as u64,
        }),
    }
}
