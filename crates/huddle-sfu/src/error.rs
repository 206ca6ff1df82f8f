//! SFU-specific errors.

/// Everything an SFU operation can fail with. None of these are fatal to the
/// process; the dispatcher logs them and carries on.
#[derive(Debug, thiserror::Error)]
pub enum SfuError {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Hub transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Peer {0} was replaced by a newer session")]
    Replaced(String),

    #[error("Hub link {0} deadline exceeded")]
    Timeout(&'static str),
}

pub type SfuResult<T> = Result<T, SfuError>;
