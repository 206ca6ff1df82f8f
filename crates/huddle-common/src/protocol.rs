//! Signaling wire format shared by browser clients, the Hub and the SFU.
//!
//! Every frame is a JSON envelope `{"type": <kind>, "payload": <kind-specific>}`.
//! Only the WebRTC kinds and presence are interpreted by the signaling core;
//! the editor/whiteboard/file kinds are relayed to the rest of the room.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Reserved room name the SFU process connects to. Exempt from user auth.
pub const SFU_CHANNEL: &str = "sfu-internal-channel";

/// Identity the SFU uses on the Hub and as `sender` of its own signals.
pub const SFU_USER_ID: &str = "sfu";

/// Message kinds carried in the envelope's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Client → Hub: join the project's voice call. Empty payload.
    WebrtcJoin,
    /// Hub → SFU: `{userId, projectId}`
    WebrtcConnectRequest,
    /// SFU → client (through the Hub): `{target, sender, data: SessionDescription}`
    WebrtcOffer,
    /// Client → SFU (through the Hub): `{target, sender, data: SessionDescription}`
    WebrtcAnswer,
    /// Both directions: `{target, sender, data: IceCandidateInit}`
    WebrtcIceCandidate,
    /// Hub → SFU: `{userId}`
    WebrtcDisconnect,
    /// Hub → room: `{users: [{userId, username}]}`
    PresenceUpdate,
    EditorUpdate,
    RequestFileContent,
    WhiteboardUpdate,
    WhiteboardObjectRemove,
    FileCreated,
    FileDeleted,
    FileRenamed,
    /// Any kind this build does not know about. Relayed as-is, never sent.
    #[serde(other)]
    Other,
}

/// Outer frame of every signaling message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Decode the payload into the shape expected for this kind.
    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.payload)
    }
}

/// Serialize a complete envelope for `kind` around `payload`.
pub fn encode<T: Serialize>(kind: MessageKind, payload: &T) -> serde_json::Result<String> {
    let envelope = Envelope {
        kind,
        payload: serde_json::to_value(payload)?,
    };
    serde_json::to_string(&envelope)
}

/// Payload of offers, answers and ICE candidates.
///
/// `data` is opaque to the Hub: a session description or candidate init
/// exactly as produced by the sending endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalPayload {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub user_id: String,
    pub project_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectNotice {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub users: Vec<UserPresence>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_without_payload_parses() {
        let env = Envelope::parse(r#"{"type":"webrtc_join"}"#).unwrap();
        assert_eq!(env.kind, MessageKind::WebrtcJoin);
        assert!(env.payload.is_null());
    }

    #[test]
    fn unknown_kinds_are_kept_as_other() {
        let env = Envelope::parse(r#"{"type":"cursor_move","payload":{"x":1}}"#).unwrap();
        assert_eq!(env.kind, MessageKind::Other);
        assert_eq!(env.payload["x"], 1);
    }

    #[test]
    fn connect_request_uses_camel_case_on_the_wire() {
        let text = encode(
            MessageKind::WebrtcConnectRequest,
            &ConnectRequest {
                user_id: "u1".into(),
                project_id: "p1".into(),
            },
        )
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "webrtc_connect_request");
        assert_eq!(value["payload"]["userId"], "u1");
        assert_eq!(value["payload"]["projectId"], "p1");
    }

    #[test]
    fn signal_payload_omits_empty_routing_fields() {
        let payload = SignalPayload {
            sender: "u1".into(),
            data: serde_json::json!({"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host"}),
            ..Default::default()
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert!(value.get("target").is_none());
        assert_eq!(value["sender"], "u1");

        let env = Envelope::parse(
            r#"{"type":"webrtc_answer","payload":{"data":{"type":"answer","sdp":"v=0"}}}"#,
        )
        .unwrap();
        let signal: SignalPayload = env.payload_as().unwrap();
        assert!(signal.sender.is_empty());
        assert_eq!(signal.data["type"], "answer");
    }
}
