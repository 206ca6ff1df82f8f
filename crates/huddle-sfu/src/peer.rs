//! Per-user media session held by the SFU.

use crate::forwarding::{ForwardedTrack, Subscriptions};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

/// Lifecycle of a peer session. `Absent` is simply "not in the map".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerPhase {
    /// Offer created and sent, no answer yet.
    Connecting = 0,
    /// Answer applied.
    Negotiating = 1,
    /// ICE/DTLS up, media can flow.
    Active = 2,
    Closed = 3,
}

impl PeerPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Negotiating,
            2 => Self::Active,
            _ => Self::Closed,
        }
    }
}

/// Mutable part of a peer, guarded by the context lock.
#[derive(Default)]
pub struct PeerState {
    /// Forwarded copies of what this user publishes.
    pub published: Vec<ForwardedTrack>,
    /// What this user receives from others.
    pub subscriptions: Subscriptions<Arc<RTCRtpSender>>,
    /// An offer has been created at least once.
    pub offered: bool,
    /// The last offer has not been answered yet.
    pub offer_outstanding: bool,
    /// Senders changed while an offer was outstanding.
    pub renegotiation_pending: bool,
}

pub struct PeerContext {
    pub user_id: String,
    pub project_id: String,
    /// Distinguishes this session from earlier ones of the same user.
    pub session_id: Uuid,
    pub pc: Arc<RTCPeerConnection>,
    phase: AtomicU8,
    pub state: Mutex<PeerState>,
}

impl PeerContext {
    pub fn new(user_id: &str, project_id: &str, pc: Arc<RTCPeerConnection>) -> Self {
        Self {
            user_id: user_id.to_owned(),
            project_id: project_id.to_owned(),
            session_id: Uuid::new_v4(),
            pc,
            phase: AtomicU8::new(PeerPhase::Connecting as u8),
            state: Mutex::new(PeerState::default()),
        }
    }

    pub fn phase(&self) -> PeerPhase {
        PeerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Move forward only; `Closed` is terminal.
    pub fn advance(&self, next: PeerPhase) -> bool {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            if next as u8 <= current {
                return false;
            }
            match self.phase.compare_exchange(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.phase() == PeerPhase::Closed
    }
}

impl std::fmt::Debug for PeerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerContext")
            .field("user_id", &self.user_id)
            .field("project_id", &self.project_id)
            .field("session_id", &self.session_id)
            .field("phase", &self.phase())
            .finish()
    }
}
