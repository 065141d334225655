//! Presence link to the registry with the tokio mpsc command/notification
//! pattern.
//!
//! The WebSocket runs in a dedicated task. The owning event loop sends
//! [`LinkCommand`]s in and receives [`LinkNotification`]s out. When the link
//! drops, the task re-dials the same endpoint a bounded number of times with
//! a fixed backoff and reports every successful (re)connect so the owner can
//! re-announce.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use lanbeam_shared::protocol::{ClientMessage, ServerMessage};

use crate::connect::{connect_endpoint, connect_first, ConnectPolicy, Endpoint, RegistryStream};
use crate::error::ConnectivityError;

/// Commands sent *into* the link task.
#[derive(Debug)]
pub enum LinkCommand {
    /// Send a message to the registry.
    Send(ClientMessage),
    /// Close the link and stop the task.
    Shutdown,
}

/// Notifications sent *from* the link task.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkNotification {
    /// The link is up (first connect or any reconnect).
    Connected { endpoint: Endpoint },
    /// A message arrived from the registry.
    Message(ServerMessage),
    /// The link dropped; reconnection is being attempted.
    Disconnected,
    /// Reconnection attempts are exhausted; the task has ended.
    GaveUp,
}

/// Connect to the first reachable candidate and spawn the link task.
///
/// Returns the command sender and the notification receiver. The first
/// notification is always `Connected`.
pub async fn spawn_link(
    candidates: &[Endpoint],
    policy: ConnectPolicy,
) -> Result<(mpsc::Sender<LinkCommand>, mpsc::Receiver<LinkNotification>), ConnectivityError> {
    let (endpoint, stream) = connect_first(candidates, policy.connect_timeout).await?;

    let (cmd_tx, cmd_rx) = mpsc::channel::<LinkCommand>(256);
    let (notif_tx, notif_rx) = mpsc::channel::<LinkNotification>(256);

    tokio::spawn(run_link(endpoint, stream, policy, cmd_rx, notif_tx));

    Ok((cmd_tx, notif_rx))
}

enum Exit {
    Dropped,
    Shutdown,
}

async fn run_link(
    endpoint: Endpoint,
    mut stream: RegistryStream,
    policy: ConnectPolicy,
    mut cmd_rx: mpsc::Receiver<LinkCommand>,
    notif_tx: mpsc::Sender<LinkNotification>,
) {
    loop {
        let _ = notif_tx
            .send(LinkNotification::Connected {
                endpoint: endpoint.clone(),
            })
            .await;

        match pump(&mut stream, &mut cmd_rx, &notif_tx).await {
            Exit::Shutdown => {
                let _ = stream.close(None).await;
                info!("Presence link shut down");
                return;
            }
            Exit::Dropped => {
                warn!(endpoint = %endpoint, "Presence link dropped");
                let _ = notif_tx.send(LinkNotification::Disconnected).await;
            }
        }

        match redial(&endpoint, &policy).await {
            Some(fresh) => stream = fresh,
            None => {
                error!(
                    endpoint = %endpoint,
                    attempts = policy.reconnect_attempts,
                    "Giving up on presence link"
                );
                let _ = notif_tx.send(LinkNotification::GaveUp).await;
                return;
            }
        }
    }
}

/// Shuttle messages until the socket drops or a shutdown is requested.
async fn pump(
    stream: &mut RegistryStream,
    cmd_rx: &mut mpsc::Receiver<LinkCommand>,
    notif_tx: &mpsc::Sender<LinkNotification>,
) -> Exit {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(LinkCommand::Send(message)) => {
                        let text = match message.to_json() {
                            Ok(t) => t,
                            Err(e) => {
                                error!(error = %e, "Failed to encode registry message");
                                continue;
                            }
                        };
                        if let Err(e) = stream.send(Message::Text(text.into())).await {
                            warn!(error = %e, "Registry send failed");
                            return Exit::Dropped;
                        }
                    }
                    Some(LinkCommand::Shutdown) | None => return Exit::Shutdown,
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match ServerMessage::from_json(text.as_str()) {
                            Ok(message) => {
                                let _ = notif_tx.send(LinkNotification::Message(message)).await;
                            }
                            Err(e) => {
                                warn!(error = %e, "Dropping malformed registry message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Exit::Dropped,
                    Some(Ok(_)) => {
                        debug!("Ignoring non-text registry frame");
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Registry socket error");
                        return Exit::Dropped;
                    }
                }
            }
        }
    }
}

async fn redial(endpoint: &Endpoint, policy: &ConnectPolicy) -> Option<RegistryStream> {
    for attempt in 1..=policy.reconnect_attempts {
        tokio::time::sleep(policy.reconnect_delay).await;

        match connect_endpoint(endpoint, policy.connect_timeout).await {
            Ok(stream) => {
                info!(endpoint = %endpoint, attempt, "Presence link re-established");
                return Some(stream);
            }
            Err(e) => {
                debug!(endpoint = %endpoint, attempt, error = %e, "Reconnect attempt failed");
            }
        }
    }
    None
}
