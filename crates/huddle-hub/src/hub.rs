//! The Hub actor.
//!
//! Room membership, presence, ICE buffering and the project cache are owned
//! by one task that drains a single inbox. Nothing else touches that state;
//! other tasks go through [`HubHandle`].

use crate::client::{Client, ClientKey};
use crate::ice::IceBuffer;
use crate::project_state::ProjectState;
use huddle_common::protocol::{
    self, ConnectRequest, DisconnectNotice, Envelope, MessageKind, PresenceUpdate, SignalPayload,
    UserPresence,
};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Everything the Hub reacts to.
#[derive(Debug)]
pub enum HubEvent {
    Register(Client),
    Unregister(ClientKey),
    /// A text frame from a room member.
    Broadcast { from: ClientKey, text: String },
    /// A text frame from the SFU connection.
    Sfu { conn_id: Uuid, text: String },
}

/// A user left their project (connection closed or evicted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub user_id: String,
    pub project_id: String,
}

/// Cheap handle used by connection pumps and other features.
#[derive(Clone)]
pub struct HubHandle {
    inbox: mpsc::Sender<HubEvent>,
    departures: broadcast::Sender<Departure>,
}

impl HubHandle {
    /// Returns `false` once the Hub has stopped.
    pub async fn send(&self, event: HubEvent) -> bool {
        self.inbox.send(event).await.is_ok()
    }

    pub async fn register(&self, client: Client) -> bool {
        self.send(HubEvent::Register(client)).await
    }

    pub async fn unregister(&self, key: ClientKey) -> bool {
        self.send(HubEvent::Unregister(key)).await
    }

    pub async fn broadcast(&self, from: ClientKey, text: String) -> bool {
        self.send(HubEvent::Broadcast { from, text }).await
    }

    pub async fn sfu_message(&self, conn_id: Uuid, text: String) -> bool {
        self.send(HubEvent::Sfu { conn_id, text }).await
    }

    /// Notified once per departed user, after the Hub has removed them.
    pub fn subscribe_departures(&self) -> broadcast::Receiver<Departure> {
        self.departures.subscribe()
    }
}

pub struct Hub {
    /// project → user → client
    rooms: HashMap<String, HashMap<String, Client>>,
    /// user → project, for addressing signals by user alone
    user_index: HashMap<String, String>,
    sfu: Option<Client>,
    ice: HashMap<String, IceBuffer>,
    states: HashMap<String, ProjectState>,
    departures: broadcast::Sender<Departure>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        let (departures, _) = broadcast::channel(256);
        Self {
            rooms: HashMap::new(),
            user_index: HashMap::new(),
            sfu: None,
            ice: HashMap::new(),
            states: HashMap::new(),
            departures,
        }
    }

    /// Start the actor and return the handle that feeds it.
    pub fn spawn(inbox_capacity: usize) -> HubHandle {
        let hub = Self::new();
        let (inbox, rx) = mpsc::channel(inbox_capacity.max(1));
        let handle = HubHandle {
            inbox,
            departures: hub.departures.clone(),
        };
        tokio::spawn(hub.run(rx));
        handle
    }

    pub async fn run(mut self, mut inbox: mpsc::Receiver<HubEvent>) {
        tracing::info!("Hub started");
        while let Some(event) = inbox.recv().await {
            self.handle(event);
        }
        tracing::info!("Hub stopped");
    }

    pub fn handle(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register(client) => self.register(client),
            HubEvent::Unregister(key) => self.unregister(key),
            HubEvent::Broadcast { from, text } => self.handle_room_message(from, text),
            HubEvent::Sfu { conn_id, text } => self.handle_sfu_message(conn_id, text),
        }
    }

    // ── Membership ──────────────────────────────────────────────────────────

    fn register(&mut self, client: Client) {
        if client.identity.is_sfu() {
            if self.sfu.replace(client).is_some() {
                tracing::info!("New SFU connected, closing previous SFU connection");
            }
            tracing::info!("SFU connected");
            return;
        }

        let user_id = client.identity.user_id.clone();
        let project_id = client.identity.project_id.clone();

        // At most one session per user: the old queue closes when it is dropped.
        if let Some(old_project) = self.user_index.get(&user_id).cloned() {
            tracing::info!(user = %user_id, "User reconnecting, closing previous connection");
            if old_project == project_id {
                self.detach(&old_project, &user_id);
            } else {
                // Leaving the old project ends the call there as well.
                self.end_session(&old_project, &user_id);
            }
        }

        tracing::info!(
            user = %user_id,
            username = %client.identity.username,
            project = %project_id,
            role = %client.identity.role,
            "Client registered"
        );
        self.rooms
            .entry(project_id.clone())
            .or_default()
            .insert(user_id.clone(), client);
        self.user_index.insert(user_id, project_id.clone());
        self.broadcast_presence(&project_id);
    }

    fn unregister(&mut self, key: ClientKey) {
        if self.sfu.as_ref().is_some_and(|sfu| sfu.conn_id == key.conn_id) {
            self.sfu = None;
            tracing::info!("SFU disconnected");
            return;
        }

        let current = self
            .rooms
            .get(&key.project_id)
            .and_then(|room| room.get(&key.user_id))
            .is_some_and(|client| client.conn_id == key.conn_id);
        if !current {
            tracing::debug!(user = %key.user_id, conn = %key.conn_id, "Ignoring stale unregister");
            return;
        }

        tracing::info!(user = %key.user_id, project = %key.project_id, "Client left");
        self.end_session(&key.project_id, &key.user_id);
    }

    /// Remove a member from its room and the user index. Closes its queue.
    fn detach(&mut self, project_id: &str, user_id: &str) -> Option<Client> {
        let client = self.rooms.get_mut(project_id)?.remove(user_id)?;
        if self.user_index.get(user_id).is_some_and(|p| p == project_id) {
            self.user_index.remove(user_id);
        }
        Some(client)
    }

    /// Full teardown of a member: unregister and eviction both land here.
    fn end_session(&mut self, project_id: &str, user_id: &str) {
        if self.detach(project_id, user_id).is_none() {
            return;
        }
        if let Some(buf) = self.ice.get_mut(user_id) {
            buf.end_session();
        }
        if self.sfu.is_some() {
            let notice = DisconnectNotice {
                user_id: user_id.to_owned(),
            };
            if let Some(frame) = encode(MessageKind::WebrtcDisconnect, &notice) {
                self.send_to_sfu(frame);
            }
        }
        let _ = self.departures.send(Departure {
            user_id: user_id.to_owned(),
            project_id: project_id.to_owned(),
        });
        self.close_room_if_empty_or_announce(project_id);
    }

    fn close_room_if_empty_or_announce(&mut self, project_id: &str) {
        if self.rooms.get(project_id).is_some_and(HashMap::is_empty) {
            self.rooms.remove(project_id);
            tracing::info!(project = %project_id, "Room closed");
        } else {
            self.broadcast_presence(project_id);
        }
    }

    /// Presence is informational: a full queue here is skipped, not evicted.
    fn broadcast_presence(&self, project_id: &str) {
        let Some(room) = self.rooms.get(project_id) else {
            return;
        };
        let mut users: Vec<UserPresence> = room
            .values()
            .map(|c| UserPresence {
                user_id: c.identity.user_id.clone(),
                username: c.identity.username.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));

        let Some(frame) = encode(MessageKind::PresenceUpdate, &PresenceUpdate { users }) else {
            return;
        };
        for client in room.values() {
            if client.try_deliver(frame.clone()).is_err() {
                tracing::debug!(user = %client.identity.user_id, "Skipping presence for busy client");
            }
        }
    }

    // ── Delivery ────────────────────────────────────────────────────────────

    fn client(&self, user_id: &str) -> Option<&Client> {
        let project_id = self.user_index.get(user_id)?;
        self.rooms.get(project_id)?.get(user_id)
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.client(user_id).is_some()
    }

    /// Enqueue to one member. A full or closed queue evicts the member.
    fn deliver_to_user(&mut self, user_id: &str, frame: String) -> bool {
        let Some(client) = self.client(user_id) else {
            return false;
        };
        match client.try_deliver(frame) {
            Ok(()) => true,
            Err(e) => {
                let project_id = client.identity.project_id.clone();
                tracing::warn!(user = %user_id, error = %e, "Outbound queue unavailable, evicting client");
                self.end_session(&project_id, user_id);
                false
            }
        }
    }

    /// Enqueue to the SFU. A full queue drops the SFU; it will reconnect.
    fn send_to_sfu(&mut self, frame: String) -> bool {
        let Some(sfu) = &self.sfu else {
            return false;
        };
        match sfu.try_deliver(frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "SFU queue unavailable, dropping SFU connection");
                self.sfu = None;
                false
            }
        }
    }

    /// Send an offer and everything that was waiting for it.
    fn deliver_offer(&mut self, user_id: &str, frame: String) {
        self.ice
            .entry(user_id.to_owned())
            .or_default()
            .mark_offer_sent();
        if !self.deliver_to_user(user_id, frame) {
            return;
        }
        let pending = self
            .ice
            .get_mut(user_id)
            .map(IceBuffer::drain_for_client)
            .unwrap_or_default();
        if !pending.is_empty() {
            tracing::debug!(user = %user_id, count = pending.len(), "Flushing buffered ICE candidates to client");
        }
        for frame in pending {
            if !self.deliver_to_user(user_id, frame) {
                break;
            }
        }
    }

    fn flush_to_sfu(&mut self, user_id: &str) {
        let pending = self
            .ice
            .get_mut(user_id)
            .map(IceBuffer::drain_for_sfu)
            .unwrap_or_default();
        if !pending.is_empty() {
            tracing::debug!(user = %user_id, count = pending.len(), "Flushing buffered ICE candidates to SFU");
        }
        for frame in pending {
            if !self.send_to_sfu(frame) {
                break;
            }
        }
    }

    /// Fan a frame out to every member of `project_id` except `sender`.
    fn relay(&mut self, project_id: &str, sender: &str, frame: &str) {
        let Some(room) = self.rooms.get(project_id) else {
            return;
        };
        let dead: Vec<String> = room
            .values()
            .filter(|c| c.identity.user_id != sender)
            .filter_map(|c| match c.try_deliver(frame.to_owned()) {
                Ok(()) => None,
                Err(e) => {
                    tracing::warn!(user = %c.identity.user_id, error = %e, "Outbound queue unavailable, evicting client");
                    Some(c.identity.user_id.clone())
                }
            })
            .collect();
        for user_id in dead {
            self.end_session(project_id, &user_id);
        }
    }

    // ── SFU → clients ───────────────────────────────────────────────────────

    fn handle_sfu_message(&mut self, conn_id: Uuid, text: String) {
        if !self.sfu.as_ref().is_some_and(|sfu| sfu.conn_id == conn_id) {
            tracing::debug!(conn = %conn_id, "Ignoring message from replaced SFU connection");
            return;
        }
        let envelope = match Envelope::parse(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed SFU message");
                return;
            }
        };
        let signal: SignalPayload = match envelope.payload_as() {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(error = %e, kind = ?envelope.kind, "Malformed SFU payload");
                return;
            }
        };
        let target = signal.target;
        if target.is_empty() {
            tracing::warn!(kind = ?envelope.kind, "SFU message without target");
            return;
        }

        match envelope.kind {
            MessageKind::WebrtcOffer => {
                if self.is_connected(&target) {
                    tracing::debug!(user = %target, "Forwarding offer");
                    self.deliver_offer(&target, text);
                } else {
                    tracing::debug!(user = %target, "Buffering offer until the user joins");
                    self.ice.entry(target).or_default().stash_offer(text);
                }
            }
            MessageKind::WebrtcIceCandidate => {
                let ready = self.is_connected(&target)
                    && self.ice.get(&target).is_some_and(IceBuffer::negotiated);
                if ready {
                    self.deliver_to_user(&target, text);
                } else {
                    tracing::debug!(user = %target, "Buffering ICE candidate for client");
                    self.ice.entry(target).or_default().buffer_for_client(text);
                }
            }
            _ => {
                if !self.deliver_to_user(&target, text) {
                    tracing::debug!(user = %target, kind = ?envelope.kind, "Dropping SFU message for absent user");
                }
            }
        }
    }

    // ── Clients → SFU / room ────────────────────────────────────────────────

    fn handle_room_message(&mut self, from: ClientKey, text: String) {
        let current = self
            .client(&from.user_id)
            .is_some_and(|c| c.conn_id == from.conn_id);
        if !current {
            tracing::debug!(user = %from.user_id, "Dropping message from superseded connection");
            return;
        }
        let envelope = match Envelope::parse(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(user = %from.user_id, error = %e, "Malformed client message");
                return;
            }
        };

        match envelope.kind {
            MessageKind::WebrtcJoin => self.join_call(&from),
            MessageKind::WebrtcAnswer => self.forward_answer(&from, &envelope),
            MessageKind::WebrtcIceCandidate => self.forward_client_candidate(&from, &envelope),
            MessageKind::WebrtcOffer
            | MessageKind::WebrtcConnectRequest
            | MessageKind::WebrtcDisconnect
            | MessageKind::PresenceUpdate => {
                tracing::warn!(user = %from.user_id, kind = ?envelope.kind, "Client sent a server-only message");
            }
            MessageKind::RequestFileContent => self.answer_file_request(&from, &envelope),
            kind => {
                let state = self.states.entry(from.project_id.clone()).or_default();
                match kind {
                    MessageKind::EditorUpdate => state.apply_editor_update(&envelope.payload),
                    MessageKind::WhiteboardUpdate => state.apply_whiteboard_update(&envelope.payload),
                    MessageKind::WhiteboardObjectRemove => {
                        state.remove_whiteboard_object(&envelope.payload)
                    }
                    MessageKind::FileDeleted => state.forget_file(&envelope.payload),
                    _ => {}
                }
                self.relay(&from.project_id, &from.user_id, &text);
            }
        }
    }

    fn join_call(&mut self, from: &ClientKey) {
        if self.sfu.is_none() {
            tracing::warn!(user = %from.user_id, "No SFU available, cannot join call");
            return;
        }
        tracing::info!(user = %from.user_id, project = %from.project_id, "Join call requested");

        let pending = self.ice.entry(from.user_id.clone()).or_default().take_offer();
        match pending {
            Some(offer) => {
                tracing::debug!(user = %from.user_id, "Sending buffered offer");
                self.deliver_offer(&from.user_id, offer);
            }
            // New negotiation: hold candidates until its offer goes out.
            None => {
                if let Some(buf) = self.ice.get_mut(&from.user_id) {
                    buf.end_session();
                }
            }
        }

        let request = ConnectRequest {
            user_id: from.user_id.clone(),
            project_id: from.project_id.clone(),
        };
        if let Some(frame) = encode(MessageKind::WebrtcConnectRequest, &request) {
            self.send_to_sfu(frame);
        }
    }

    fn forward_answer(&mut self, from: &ClientKey, envelope: &Envelope) {
        if self.sfu.is_none() {
            tracing::debug!(user = %from.user_id, "No SFU, dropping answer");
            return;
        }
        let Some(frame) = rewrite_sender(MessageKind::WebrtcAnswer, from, envelope) else {
            return;
        };
        self.ice
            .entry(from.user_id.clone())
            .or_default()
            .mark_answer_sent();
        if self.send_to_sfu(frame) {
            tracing::debug!(user = %from.user_id, "Forwarded answer to SFU");
            self.flush_to_sfu(&from.user_id);
        }
    }

    fn forward_client_candidate(&mut self, from: &ClientKey, envelope: &Envelope) {
        if self.sfu.is_none() {
            return;
        }
        let Some(frame) = rewrite_sender(MessageKind::WebrtcIceCandidate, from, envelope) else {
            return;
        };
        let buf = self.ice.entry(from.user_id.clone()).or_default();
        if !buf.negotiated() {
            tracing::debug!(user = %from.user_id, "Buffering ICE candidate for SFU");
            buf.buffer_for_sfu(frame);
            return;
        }
        self.send_to_sfu(frame);
    }

    fn answer_file_request(&mut self, from: &ClientKey, envelope: &Envelope) {
        let Some(file_id) = envelope.payload.get("fileId").and_then(|v| v.as_str()) else {
            tracing::warn!(user = %from.user_id, "request_file_content without fileId");
            return;
        };
        let content = self
            .states
            .get(&from.project_id)
            .and_then(|state| state.file_content(file_id))
            .map(str::to_owned);
        let Some(content) = content else {
            tracing::debug!(project = %from.project_id, file = %file_id, "No live content cached");
            return;
        };
        let reply = serde_json::json!({ "fileId": file_id, "content": content });
        if let Some(frame) = encode(MessageKind::EditorUpdate, &reply) {
            self.deliver_to_user(&from.user_id, frame);
        }
    }

    // ── Introspection ───────────────────────────────────────────────────────

    pub fn has_sfu(&self) -> bool {
        self.sfu.is_some()
    }

    /// Sorted user ids of a room.
    pub fn members(&self, project_id: &str) -> Vec<String> {
        let mut users: Vec<String> = self
            .rooms
            .get(project_id)
            .map(|room| room.keys().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    pub fn project_state(&self, project_id: &str) -> Option<&ProjectState> {
        self.states.get(project_id)
    }

    pub fn ice_buffer(&self, user_id: &str) -> Option<&IceBuffer> {
        self.ice.get(user_id)
    }

    pub fn subscribe_departures(&self) -> broadcast::Receiver<Departure> {
        self.departures.subscribe()
    }
}

/// Re-address a client signal to the SFU, taking the sender from the
/// connection rather than from the payload.
fn rewrite_sender(kind: MessageKind, from: &ClientKey, envelope: &Envelope) -> Option<String> {
    let signal: SignalPayload = match envelope.payload_as() {
        Ok(signal) => signal,
        Err(e) => {
            tracing::warn!(user = %from.user_id, error = %e, "Malformed signal payload");
            return None;
        }
    };
    let signal = SignalPayload {
        target: String::new(),
        sender: from.user_id.clone(),
        data: signal.data,
    };
    encode(kind, &signal)
}

fn encode<T: Serialize>(kind: MessageKind, payload: &T) -> Option<String> {
    match protocol::encode(kind, payload) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!(error = %e, kind = ?kind, "Failed to encode message");
            None
        }
    }
}
