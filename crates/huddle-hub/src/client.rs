//! One WebSocket connection as seen by the Hub, and the two pumps that move
//! frames between the socket and the Hub actor.

use crate::hub::HubHandle;
use crate::HubSettings;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use huddle_common::protocol::{SFU_CHANNEL, SFU_USER_ID};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{timeout, Instant};
use uuid::Uuid;

/// Who is on the other end of a connection. Resolved before the Hub sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub project_id: String,
    pub role: String,
}

impl Identity {
    /// The internal SFU connection.
    pub fn sfu() -> Self {
        Self {
            user_id: SFU_USER_ID.to_owned(),
            username: "SFU Server".to_owned(),
            project_id: SFU_CHANNEL.to_owned(),
            role: "sfu".to_owned(),
        }
    }

    pub fn is_sfu(&self) -> bool {
        self.project_id == SFU_CHANNEL
    }
}

/// Addresses one specific connection. Two connections of the same user
/// differ by `conn_id`, which is how stale events are told apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientKey {
    pub conn_id: Uuid,
    pub user_id: String,
    pub project_id: String,
}

/// Hub-side record of a live connection.
///
/// Owns the only sender of the connection's outbound queue: dropping the
/// `Client` closes the queue, and the writer answers with a Close frame.
#[derive(Debug)]
pub struct Client {
    pub conn_id: Uuid,
    pub identity: Identity,
    outbound: mpsc::Sender<String>,
}

impl Client {
    pub fn new(identity: Identity, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let client = Self {
            conn_id: Uuid::new_v4(),
            identity,
            outbound,
        };
        (client, rx)
    }

    pub fn key(&self) -> ClientKey {
        ClientKey {
            conn_id: self.conn_id,
            user_id: self.identity.user_id.clone(),
            project_id: self.identity.project_id.clone(),
        }
    }

    /// Non-blocking enqueue. A full queue means the peer cannot keep up.
    pub fn try_deliver(&self, frame: String) -> Result<(), TrySendError<String>> {
        self.outbound.try_send(frame)
    }
}

/// Run a connection until either side gives up, then unregister it.
pub async fn serve(socket: WebSocket, identity: Identity, hub: HubHandle, settings: Arc<HubSettings>) {
    let (client, outbound) = Client::new(identity, settings.send_queue_capacity);
    let key = client.key();
    let is_sfu = client.identity.is_sfu();

    if !hub.register(client).await {
        tracing::warn!(user = %key.user_id, "Hub is not running, dropping connection");
        return;
    }

    let (sink, stream) = socket.split();
    let mut write_task = tokio::spawn(write_pump(sink, outbound, key.clone(), settings.clone()));

    tokio::select! {
        _ = read_pump(stream, &key, is_sfu, &hub, settings.pong_wait) => {}
        _ = &mut write_task => {}
    }

    write_task.abort();
    hub.unregister(key.clone()).await;
    tracing::debug!(user = %key.user_id, conn = %key.conn_id, "Connection closed");
}

/// Drain the outbound queue onto the socket and keep the peer pinged.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    key: ClientKey,
    settings: Arc<HubSettings>,
) {
    let mut ping = tokio::time::interval_at(
        Instant::now() + settings.ping_period,
        settings.ping_period,
    );

    loop {
        let message = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(text) => Message::Text(text.into()),
                None => {
                    // The Hub let go of this connection.
                    let _ = timeout(settings.write_wait, sink.send(Message::Close(None))).await;
                    return;
                }
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        match timeout(settings.write_wait, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(user = %key.user_id, error = %e, "Write failed");
                return;
            }
            Err(_) => {
                tracing::warn!(user = %key.user_id, "Write deadline exceeded");
                return;
            }
        }
    }
}

/// Forward inbound text frames to the Hub. Any frame resets the deadline.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    key: &ClientKey,
    is_sfu: bool,
    hub: &HubHandle,
    pong_wait: Duration,
) {
    loop {
        let message = match timeout(pong_wait, stream.next()).await {
            Err(_) => {
                tracing::warn!(user = %key.user_id, "Read deadline exceeded");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                tracing::debug!(user = %key.user_id, error = %e, "Read failed");
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                let text = text.as_str().to_owned();
                let accepted = if is_sfu {
                    hub.sfu_message(key.conn_id, text).await
                } else {
                    hub.broadcast(key.clone(), text).await
                };
                if !accepted {
                    return;
                }
            }
            Message::Binary(_) => {
                tracing::debug!(user = %key.user_id, "Ignoring binary frame");
            }
            Message::Close(_) => return,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}
