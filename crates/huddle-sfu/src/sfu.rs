//! Audio forwarding core.
//!
//! One `RTCPeerConnection` per user. Every audio track a user publishes is
//! re-served as a local track and attached to every other peer of the same
//! project; whenever the set of senders on a peer changes, the SFU sends that
//! peer a fresh offer through the Hub.
//!
//! Locking: the peer map lock is always taken before a context lock, and at
//! most one context lock is held at a time.

use crate::error::{SfuError, SfuResult};
use crate::forwarding::{ForwardedTrack, ForwardedTrackId};
use crate::peer::{PeerContext, PeerPhase, PeerState};
use huddle_common::config::SfuConfig;
use huddle_common::protocol::{
    self, ConnectRequest, DisconnectNotice, Envelope, MessageKind, SignalPayload, SFU_USER_ID,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

/// ICE configuration for every peer connection the SFU creates.
#[derive(Debug, Clone)]
pub struct SfuSettings {
    pub stun_urls: Vec<String>,
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
}

impl Default for SfuSettings {
    fn default() -> Self {
        Self::from(&SfuConfig::default())
    }
}

impl From<&SfuConfig> for SfuSettings {
    fn from(config: &SfuConfig) -> Self {
        Self {
            stun_urls: config.stun_urls.clone(),
            turn_urls: config.turn_urls.clone(),
            turn_username: config.turn_username.clone(),
            turn_credential: config.turn_credential.clone(),
        }
    }
}

impl SfuSettings {
    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(RTCIceServer {
                urls: self.stun_urls.clone(),
                ..Default::default()
            });
        }
        if !self.turn_urls.is_empty() {
            servers.push(RTCIceServer {
                urls: self.turn_urls.clone(),
                username: self.turn_username.clone().unwrap_or_default(),
                credential: self.turn_credential.clone().unwrap_or_default(),
                ..Default::default()
            });
        }
        servers
    }
}

/// Snapshot of what the SFU is currently holding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SfuStats {
    pub peers: usize,
    pub published_tracks: usize,
    pub subscriptions: usize,
}

pub(crate) fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![],
    }
}

struct Inner {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    peers: RwLock<HashMap<String, Arc<PeerContext>>>,
    /// Frames for the Hub. Never awaited on: the link that drains this
    /// queue is the same task that calls into the SFU.
    outbound: mpsc::Sender<String>,
}

/// Cheap, cloneable handle to the forwarding core.
#[derive(Clone)]
pub struct Sfu {
    inner: Arc<Inner>,
}

impl Sfu {
    /// Build the media stack. Signals for the Hub are pushed to `outbound`.
    pub fn new(settings: &SfuSettings, outbound: mpsc::Sender<String>) -> SfuResult<Self> {
        let mut media = MediaEngine::default();
        media.register_codec(
            RTCRtpCodecParameters {
                capability: opus_capability(),
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            inner: Arc::new(Inner {
                api,
                ice_servers: settings.ice_servers(),
                peers: RwLock::new(HashMap::new()),
                outbound,
            }),
        })
    }

    /// Dispatch one frame received from the Hub.
    pub async fn handle_message(&self, text: &str) -> SfuResult<()> {
        let envelope = Envelope::parse(text)?;
        match envelope.kind {
            MessageKind::WebrtcConnectRequest => {
                let request: ConnectRequest = envelope.payload_as()?;
                self.on_connect_request(&request.user_id, &request.project_id).await
            }
            MessageKind::WebrtcAnswer => {
                let signal: SignalPayload = envelope.payload_as()?;
                self.on_answer(&signal.sender, signal.data).await
            }
            MessageKind::WebrtcIceCandidate => {
                let signal: SignalPayload = envelope.payload_as()?;
                self.on_ice_candidate(&signal.sender, signal.data).await
            }
            MessageKind::WebrtcDisconnect => {
                let notice: DisconnectNotice = envelope.payload_as()?;
                self.on_disconnect(&notice.user_id).await;
                Ok(())
            }
            other => {
                debug!(kind = ?other, "Ignoring hub message");
                Ok(())
            }
        }
    }

    pub async fn peer(&self, user_id: &str) -> Option<Arc<PeerContext>> {
        self.inner.peers.read().await.get(user_id).cloned()
    }

    pub async fn stats(&self) -> SfuStats {
        let peers = self.inner.peers.read().await;
        let mut stats = SfuStats {
            peers: peers.len(),
            ..Default::default()
        };
        for ctx in peers.values() {
            let state = ctx.state.lock().await;
            stats.published_tracks += state.published.len();
            stats.subscriptions += state.subscriptions.len();
        }
        stats
    }

    /// Start (or restart) a user's media session and send the initial offer.
    pub async fn on_connect_request(&self, user_id: &str, project_id: &str) -> SfuResult<()> {
        info!(user = %user_id, project = %project_id, "Connect request");

        let previous = self.inner.peers.write().await.remove(user_id);
        if let Some(previous) = previous {
            info!(user = %user_id, "Closing previous peer connection");
            self.teardown(&previous).await;
        }

        let ctx = self.create_peer(user_id, project_id).await?;
        if let Err(e) = self.start_session(&ctx).await {
            {
                let mut peers = self.inner.peers.write().await;
                if peers
                    .get(user_id)
                    .is_some_and(|current| current.session_id == ctx.session_id)
                {
                    peers.remove(user_id);
                }
            }
            self.teardown(&ctx).await;
            return Err(e);
        }

        let stats = self.stats().await;
        info!(user = %user_id, peers = stats.peers, "Peer session started");
        Ok(())
    }

    async fn create_peer(&self, user_id: &str, project_id: &str) -> SfuResult<Arc<PeerContext>> {
        let config = RTCConfiguration {
            ice_servers: self.inner.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.inner.api.new_peer_connection(config).await?);
        let ctx = Arc::new(PeerContext::new(user_id, project_id, Arc::clone(&pc)));
        self.install_callbacks(&ctx);

        let recv_audio = RTCRtpTransceiverInit {
            direction: RTCRtpTransceiverDirection::Recvonly,
            send_encodings: vec![],
        };
        if let Err(e) = pc
            .add_transceiver_from_kind(RTPCodecType::Audio, Some(recv_audio))
            .await
        {
            let _ = pc.close().await;
            return Err(e.into());
        }
        Ok(ctx)
    }

    fn install_callbacks(&self, ctx: &Arc<PeerContext>) {
        let outbound = self.inner.outbound.clone();
        let user_id = ctx.user_id.clone();
        ctx.pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                forward_local_candidate(&outbound, &user_id, &candidate);
            }
            Box::pin(async {})
        }));

        let weak: Weak<PeerContext> = Arc::downgrade(ctx);
        ctx.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                if let Some(ctx) = weak.upgrade() {
                    match state {
                        RTCPeerConnectionState::Connected => {
                            if ctx.advance(PeerPhase::Active) {
                                info!(user = %ctx.user_id, "Peer connection established");
                            }
                        }
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => {
                            if ctx.advance(PeerPhase::Closed) {
                                info!(user = %ctx.user_id, state = %state, "Peer connection ended");
                            }
                        }
                        other => debug!(user = %ctx.user_id, state = %other, "Peer connection state"),
                    }
                }
                Box::pin(async {})
            }));

        let sfu = Arc::downgrade(&self.inner);
        let user_id = ctx.user_id.clone();
        let session_id = ctx.session_id;
        ctx.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            if let Some(inner) = sfu.upgrade() {
                let sfu = Sfu { inner };
                let user_id = user_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = sfu.on_remote_track(&user_id, session_id, track).await {
                        warn!(user = %user_id, error = %e, "Dropping remote track");
                    }
                });
            }
            Box::pin(async {})
        }));
    }

    async fn start_session(&self, ctx: &Arc<PeerContext>) -> SfuResult<()> {
        let stale = self
            .inner
            .peers
            .write()
            .await
            .insert(ctx.user_id.clone(), Arc::clone(ctx));
        if let Some(stale) = stale {
            // A concurrent connect for the same user got in first.
            self.teardown(&stale).await;
        }

        {
            let peers = self.inner.peers.read().await;
            let others = peers
                .values()
                .filter(|p| p.project_id == ctx.project_id && p.user_id != ctx.user_id);
            for publisher in others {
                let tracks = publisher.state.lock().await.published.clone();
                for track in &tracks {
                    if let Err(e) = self.subscribe(ctx, track).await {
                        warn!(
                            user = %ctx.user_id,
                            track = %track.id.track_id,
                            error = %e,
                            "Failed to attach existing track"
                        );
                    }
                }
            }
        }

        let mut state = ctx.state.lock().await;
        if ctx.is_closed() {
            return Err(SfuError::Replaced(ctx.user_id.clone()));
        }
        self.offer_locked(ctx, &mut state).await
    }

    async fn on_remote_track(
        &self,
        publisher_id: &str,
        session_id: uuid::Uuid,
        remote: Arc<TrackRemote>,
    ) -> SfuResult<()> {
        if remote.kind() != RTPCodecType::Audio {
            debug!(user = %publisher_id, kind = %remote.kind(), "Ignoring non-audio track");
            return Ok(());
        }

        let mut remote_id = remote.id();
        if remote_id.is_empty() {
            remote_id = remote.ssrc().to_string();
        }
        let id = ForwardedTrackId::new(publisher_id, session_id, &remote_id, &remote.stream_id());
        let local = Arc::new(TrackLocalStaticRTP::new(
            remote.codec().capability,
            id.track_id.clone(),
            id.stream_id.clone(),
        ));
        let track = ForwardedTrack { id, local };
        info!(user = %publisher_id, track = %track.id.track_id, "Received audio track");

        self.publish(publisher_id, session_id, track.clone()).await?;
        self.spawn_forwarding(remote, track);
        Ok(())
    }

    /// Record `track` as published by `publisher_id` and attach it to every
    /// other peer of the same project.
    pub(crate) async fn publish(
        &self,
        publisher_id: &str,
        session_id: uuid::Uuid,
        track: ForwardedTrack,
    ) -> SfuResult<()> {
        let peers = self.inner.peers.read().await;
        let publisher = peers
            .get(publisher_id)
            .filter(|p| p.session_id == session_id)
            .ok_or_else(|| SfuError::Replaced(publisher_id.to_owned()))?;
        publisher.state.lock().await.published.push(track.clone());

        let subscribers = peers
            .values()
            .filter(|p| p.project_id == publisher.project_id && p.user_id != publisher_id);
        for sub in subscribers {
            match self.subscribe(sub, &track).await {
                Ok(true) => {
                    if let Err(e) = self.renegotiate(sub).await {
                        warn!(user = %sub.user_id, error = %e, "Renegotiation failed");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(
                    user = %sub.user_id,
                    track = %track.id.track_id,
                    error = %e,
                    "Failed to forward track"
                ),
            }
        }
        Ok(())
    }

    fn spawn_forwarding(&self, remote: Arc<TrackRemote>, track: ForwardedTrack) {
        let sfu = self.clone();
        tokio::spawn(async move {
            loop {
                let packet = match remote.read_rtp().await {
                    Ok((packet, _)) => packet,
                    Err(e) => {
                        debug!(track = %track.id.track_id, error = %e, "Remote track ended");
                        break;
                    }
                };
                if let Err(e) = track.local.write_rtp(&packet).await {
                    warn!(track = %track.id.track_id, error = %e, "Forwarding write failed");
                    break;
                }
            }
            sfu.retire_track(&track.id).await;
        });
    }

    /// Detach a forwarded track from every subscriber once its source is gone.
    async fn retire_track(&self, id: &ForwardedTrackId) {
        let peers = self.inner.peers.read().await;
        if let Some(publisher) = peers
            .get(&id.publisher_id)
            .filter(|p| p.session_id == id.publisher_session)
        {
            publisher.state.lock().await.published.retain(|t| &t.id != id);
        }

        for sub in peers.values() {
            let removed = {
                let mut state = sub.state.lock().await;
                let senders = state.subscriptions.remove_track(id);
                detach_senders(sub, &senders).await
            };
            if removed > 0 {
                if let Err(e) = self.renegotiate(sub).await {
                    warn!(user = %sub.user_id, error = %e, "Renegotiation failed");
                }
            }
        }
        debug!(track = %id.track_id, "Forwarded track retired");
    }

    /// Attach `track` to `sub`. `Ok(false)` when nothing changed.
    async fn subscribe(&self, sub: &PeerContext, track: &ForwardedTrack) -> SfuResult<bool> {
        let mut state = sub.state.lock().await;
        if sub.is_closed() || state.subscriptions.contains(&track.id) {
            return Ok(false);
        }
        let local = Arc::clone(&track.local) as Arc<dyn TrackLocal + Send + Sync>;
        let sender = sub.pc.add_track(local).await?;
        state.subscriptions.insert(track.id.clone(), Arc::clone(&sender));
        drop(state);

        // RTCP has to be read for the interceptors to run.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        debug!(user = %sub.user_id, track = %track.id.track_id, "Subscribed");
        Ok(true)
    }

    /// Send `ctx` a fresh offer, or defer it if one is still unanswered.
    async fn renegotiate(&self, ctx: &PeerContext) -> SfuResult<()> {
        let mut state = ctx.state.lock().await;
        if ctx.is_closed() || !state.offered {
            return Ok(());
        }
        if state.offer_outstanding {
            state.renegotiation_pending = true;
            debug!(user = %ctx.user_id, "Offer outstanding, renegotiation deferred");
            return Ok(());
        }
        self.offer_locked(ctx, &mut state).await
    }

    async fn offer_locked(&self, ctx: &PeerContext, state: &mut PeerState) -> SfuResult<()> {
        let offer = ctx.pc.create_offer(None).await?;
        ctx.pc.set_local_description(offer.clone()).await?;
        state.offered = true;
        state.offer_outstanding = true;
        state.renegotiation_pending = false;

        emit(
            &self.inner.outbound,
            MessageKind::WebrtcOffer,
            &ctx.user_id,
            serde_json::to_value(&offer)?,
        );
        debug!(user = %ctx.user_id, "Sent offer");
        Ok(())
    }

    pub async fn on_answer(&self, user_id: &str, data: Value) -> SfuResult<()> {
        let ctx = self
            .peer(user_id)
            .await
            .ok_or_else(|| SfuError::PeerNotFound(user_id.to_owned()))?;
        let answer: RTCSessionDescription = serde_json::from_value(data)?;

        let mut state = ctx.state.lock().await;
        if let Err(e) = ctx.pc.set_remote_description(answer).await {
            // A rejected answer still settles the outstanding offer.
            state.offer_outstanding = false;
            if state.renegotiation_pending {
                if let Err(reoffer) = self.offer_locked(&ctx, &mut state).await {
                    warn!(user = %user_id, error = %reoffer, "Re-offer after rejected answer failed");
                }
            }
            return Err(e.into());
        }
        state.offer_outstanding = false;
        ctx.advance(PeerPhase::Negotiating);
        debug!(user = %user_id, "Applied answer");

        if state.renegotiation_pending {
            self.offer_locked(&ctx, &mut state).await?;
        }
        Ok(())
    }

    pub async fn on_ice_candidate(&self, user_id: &str, data: Value) -> SfuResult<()> {
        let ctx = self
            .peer(user_id)
            .await
            .ok_or_else(|| SfuError::PeerNotFound(user_id.to_owned()))?;
        let candidate: RTCIceCandidateInit = serde_json::from_value(data)?;

        // Ordered against description changes on the same peer.
        let _state = ctx.state.lock().await;
        ctx.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    pub async fn on_disconnect(&self, user_id: &str) {
        let removed = self.inner.peers.write().await.remove(user_id);
        match removed {
            Some(ctx) => {
                info!(user = %user_id, "Disconnecting peer");
                self.teardown(&ctx).await;
                let stats = self.stats().await;
                info!(peers = stats.peers, subscriptions = stats.subscriptions, "Peer removed");
            }
            None => debug!(user = %user_id, "Disconnect for unknown peer"),
        }
    }

    /// Release everything `ctx` holds. The context must already be out of the map.
    async fn teardown(&self, ctx: &PeerContext) {
        ctx.advance(PeerPhase::Closed);
        {
            let mut state = ctx.state.lock().await;
            let senders = state.subscriptions.drain();
            detach_senders(ctx, &senders).await;
            state.published.clear();
            state.offer_outstanding = false;
            state.renegotiation_pending = false;
        }
        if let Err(e) = ctx.pc.close().await {
            warn!(user = %ctx.user_id, error = %e, "Error closing peer connection");
        }

        let peers = self.inner.peers.read().await;
        for sub in peers.values() {
            let removed = {
                let mut state = sub.state.lock().await;
                let senders = state.subscriptions.remove_publisher(&ctx.user_id, ctx.session_id);
                detach_senders(sub, &senders).await
            };
            if removed > 0 {
                if let Err(e) = self.renegotiate(sub).await {
                    warn!(user = %sub.user_id, error = %e, "Renegotiation failed");
                }
            }
        }
    }
}

async fn detach_senders(ctx: &PeerContext, senders: &[Arc<RTCRtpSender>]) -> usize {
    for sender in senders {
        if let Err(e) = ctx.pc.remove_track(sender).await {
            debug!(user = %ctx.user_id, error = %e, "remove_track failed");
        }
    }
    senders.len()
}

fn forward_local_candidate(outbound: &mpsc::Sender<String>, user_id: &str, candidate: &RTCIceCandidate) {
    let data = candidate
        .to_json()
        .map_err(SfuError::from)
        .and_then(|init| serde_json::to_value(init).map_err(SfuError::from));
    match data {
        Ok(data) => emit(outbound, MessageKind::WebrtcIceCandidate, user_id, data),
        Err(e) => warn!(user = %user_id, error = %e, "Failed to encode local candidate"),
    }
}

fn emit(outbound: &mpsc::Sender<String>, kind: MessageKind, target: &str, data: Value) {
    let signal = SignalPayload {
        target: target.to_owned(),
        sender: SFU_USER_ID.to_owned(),
        data,
    };
    match protocol::encode(kind, &signal) {
        Ok(frame) => {
            if let Err(e) = outbound.try_send(frame) {
                warn!(user = %target, kind = ?kind, error = %e, "Hub queue unavailable, dropping signal");
            }
        }
        Err(e) => warn!(user = %target, error = %e, "Failed to encode signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sfu() -> (Sfu, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(1024);
        let settings = SfuSettings {
            stun_urls: vec![],
            ..SfuSettings::default()
        };
        (Sfu::new(&settings, tx).unwrap(), rx)
    }

    async fn publish_mic(sfu: &Sfu, user: &str) -> ForwardedTrack {
        let ctx = sfu.peer(user).await.unwrap();
        let id = ForwardedTrackId::new(user, ctx.session_id, "mic", "mic-stream");
        let local = Arc::new(TrackLocalStaticRTP::new(
            opus_capability(),
            id.track_id.clone(),
            id.stream_id.clone(),
        ));
        let track = ForwardedTrack { id, local };
        sfu.publish(user, ctx.session_id, track.clone()).await.unwrap();
        track
    }

    /// SDPs of every offer sent to `user` so far.
    fn offers_for(rx: &mut mpsc::Receiver<String>, user: &str) -> Vec<String> {
        let mut offers = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let env = Envelope::parse(&frame).unwrap();
            let signal: SignalPayload = env.payload_as().unwrap();
            if env.kind == MessageKind::WebrtcOffer && signal.target == user {
                assert_eq!(signal.sender, SFU_USER_ID);
                offers.push(signal.data["sdp"].as_str().unwrap().to_owned());
            }
        }
        offers
    }

    /// SDPs of every offer sent so far, grouped by target.
    fn offers_by_target(rx: &mut mpsc::Receiver<String>) -> HashMap<String, Vec<String>> {
        let mut offers: HashMap<String, Vec<String>> = HashMap::new();
        while let Ok(frame) = rx.try_recv() {
            let env = Envelope::parse(&frame).unwrap();
            if env.kind == MessageKind::WebrtcOffer {
                let signal: SignalPayload = env.payload_as().unwrap();
                let sdp = signal.data["sdp"].as_str().unwrap().to_owned();
                offers.entry(signal.target).or_default().push(sdp);
            }
        }
        offers
    }

    async fn subscribed_publishers(sfu: &Sfu, user: &str) -> Vec<String> {
        let ctx = sfu.peer(user).await.unwrap();
        let state = ctx.state.lock().await;
        let mut publishers: Vec<String> =
            state.subscriptions.tracks().map(|t| t.publisher_id.clone()).collect();
        publishers.sort();
        publishers
    }

    async fn answer(offer_sdp: &str) -> Value {
        let mut media = MediaEngine::default();
        media.register_default_codecs().unwrap();
        let api = APIBuilder::new().with_media_engine(media).build();
        let pc = api.new_peer_connection(RTCConfiguration::default()).await.unwrap();
        pc.set_remote_description(RTCSessionDescription::offer(offer_sdp.to_owned()).unwrap())
            .await
            .unwrap();
        let answer = pc.create_answer(None).await.unwrap();
        pc.set_local_description(answer.clone()).await.unwrap();
        let _ = pc.close().await;
        serde_json::to_value(answer).unwrap()
    }

    #[tokio::test]
    async fn connect_request_sends_an_offer() {
        let (sfu, mut rx) = sfu();
        sfu.on_connect_request("a", "p1").await.unwrap();

        let offers = offers_for(&mut rx, "a");
        assert_eq!(offers.len(), 1);
        assert!(offers[0].contains("m=audio"));
        assert_eq!(sfu.peer("a").await.unwrap().phase(), PeerPhase::Connecting);
    }

    #[tokio::test]
    async fn late_joiner_is_offered_existing_audio() {
        let (sfu, mut rx) = sfu();
        sfu.on_connect_request("a", "p1").await.unwrap();
        publish_mic(&sfu, "a").await;

        sfu.on_connect_request("b", "p1").await.unwrap();
        let offers = offers_for(&mut rx, "b");
        assert_eq!(offers.len(), 1);
        assert!(offers[0].contains("mic-a"));
        assert_eq!(subscribed_publishers(&sfu, "b").await, vec!["a"]);
    }

    #[tokio::test]
    async fn published_audio_reaches_every_other_peer_in_the_project() {
        let (sfu, _rx) = sfu();
        for user in ["a", "b", "c"] {
            sfu.on_connect_request(user, "p1").await.unwrap();
        }
        sfu.on_connect_request("d", "p2").await.unwrap();
        publish_mic(&sfu, "a").await;

        assert!(subscribed_publishers(&sfu, "a").await.is_empty());
        assert_eq!(subscribed_publishers(&sfu, "b").await, vec!["a"]);
        assert_eq!(subscribed_publishers(&sfu, "c").await, vec!["a"]);
        assert!(subscribed_publishers(&sfu, "d").await.is_empty());

        let stats = sfu.stats().await;
        assert_eq!(stats.peers, 4);
        assert_eq!(stats.published_tracks, 1);
        assert_eq!(stats.subscriptions, 2);
    }

    #[tokio::test]
    async fn disconnect_removes_only_that_publishers_audio() {
        let (sfu, _rx) = sfu();
        for user in ["a", "ab", "b"] {
            sfu.on_connect_request(user, "p1").await.unwrap();
        }
        publish_mic(&sfu, "a").await;
        publish_mic(&sfu, "ab").await;
        let gone = sfu.peer("a").await.unwrap();

        sfu.on_disconnect("a").await;

        assert!(sfu.peer("a").await.is_none());
        assert!(gone.is_closed());
        assert!(gone.state.lock().await.subscriptions.is_empty());
        assert_eq!(subscribed_publishers(&sfu, "b").await, vec!["ab"]);
        assert!(subscribed_publishers(&sfu, "ab").await.is_empty());
        assert_eq!(sfu.stats().await.published_tracks, 1);
    }

    #[tokio::test]
    async fn reconnect_replaces_the_previous_session() {
        let (sfu, mut rx) = sfu();
        sfu.on_connect_request("a", "p1").await.unwrap();
        let first = sfu.peer("a").await.unwrap();

        sfu.on_connect_request("a", "p1").await.unwrap();
        let second = sfu.peer("a").await.unwrap();

        assert!(first.is_closed());
        assert_ne!(first.session_id, second.session_id);
        assert!(!second.is_closed());
        assert_eq!(offers_for(&mut rx, "a").len(), 2);
        assert_eq!(sfu.stats().await.peers, 1);
    }

    #[tokio::test]
    async fn answers_for_unknown_or_malformed_peers_are_rejected() {
        let (sfu, _rx) = sfu();
        let missing = sfu.on_answer("ghost", serde_json::json!({"type": "answer", "sdp": ""})).await;
        assert!(matches!(missing, Err(SfuError::PeerNotFound(_))));

        sfu.on_connect_request("a", "p1").await.unwrap();
        let malformed = sfu.on_answer("a", serde_json::json!({"nope": 1})).await;
        assert!(matches!(malformed, Err(SfuError::Json(_))));

        let candidate = sfu.on_ice_candidate("ghost", serde_json::json!({"candidate": ""})).await;
        assert!(matches!(candidate, Err(SfuError::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn renegotiation_waits_for_the_outstanding_answer() {
        let (sfu, mut rx) = sfu();
        sfu.on_connect_request("b", "p1").await.unwrap();
        sfu.on_connect_request("a", "p1").await.unwrap();
        let initial = offers_for(&mut rx, "b");
        assert_eq!(initial.len(), 1);

        publish_mic(&sfu, "a").await;
        assert!(offers_for(&mut rx, "b").is_empty());
        assert!(sfu.peer("b").await.unwrap().state.lock().await.renegotiation_pending);

        sfu.on_answer("b", answer(&initial[0]).await).await.unwrap();
        let followup = offers_for(&mut rx, "b");
        assert_eq!(followup.len(), 1);
        assert!(followup[0].contains("mic-a"));
        assert_eq!(sfu.peer("b").await.unwrap().phase(), PeerPhase::Negotiating);
    }

    #[tokio::test]
    async fn ended_track_is_retired_everywhere_and_renegotiated() {
        let (sfu, mut rx) = sfu();
        for user in ["b", "c", "a"] {
            sfu.on_connect_request(user, "p1").await.unwrap();
        }
        let track = publish_mic(&sfu, "a").await;

        // Settle b and c: answer the initial offer, then the deferred follow-up.
        let initial = offers_by_target(&mut rx);
        for user in ["b", "c"] {
            sfu.on_answer(user, answer(&initial[user][0]).await).await.unwrap();
        }
        let followups = offers_by_target(&mut rx);
        for user in ["b", "c"] {
            let sdp = &followups[user][0];
            assert!(sdp.contains("mic-a"));
            sfu.on_answer(user, answer(sdp).await).await.unwrap();
        }
        assert_eq!(
            sfu.stats().await,
            SfuStats { peers: 3, published_tracks: 1, subscriptions: 2 }
        );

        sfu.retire_track(&track.id).await;

        assert_eq!(
            sfu.stats().await,
            SfuStats { peers: 3, published_tracks: 0, subscriptions: 0 }
        );
        let reoffers = offers_by_target(&mut rx);
        assert_eq!(reoffers["b"].len(), 1);
        assert_eq!(reoffers["c"].len(), 1);
        assert!(!reoffers.contains_key("a"));
    }

    #[tokio::test]
    async fn rejected_answer_does_not_block_later_offers() {
        let (sfu, mut rx) = sfu();
        sfu.on_connect_request("b", "p1").await.unwrap();
        assert_eq!(offers_for(&mut rx, "b").len(), 1);

        let bogus = serde_json::json!({"type": "answer", "sdp": "not an sdp"});
        assert!(matches!(sfu.on_answer("b", bogus).await, Err(SfuError::WebRtc(_))));
        assert!(!sfu.peer("b").await.unwrap().state.lock().await.offer_outstanding);

        sfu.on_connect_request("a", "p1").await.unwrap();
        publish_mic(&sfu, "a").await;
        let offers = offers_for(&mut rx, "b");
        assert_eq!(offers.len(), 1);
        assert!(offers[0].contains("mic-a"));
    }

    #[tokio::test]
    async fn hub_messages_are_dispatched_by_kind() {
        let (sfu, mut rx) = sfu();
        let connect = protocol::encode(
            MessageKind::WebrtcConnectRequest,
            &ConnectRequest {
                user_id: "a".into(),
                project_id: "p1".into(),
            },
        )
        .unwrap();
        sfu.handle_message(&connect).await.unwrap();
        assert_eq!(offers_for(&mut rx, "a").len(), 1);

        sfu.handle_message(r#"{"type":"editor_update","payload":{}}"#)
            .await
            .unwrap();

        let disconnect = protocol::encode(
            MessageKind::WebrtcDisconnect,
            &DisconnectNotice { user_id: "a".into() },
        )
        .unwrap();
        sfu.handle_message(&disconnect).await.unwrap();
        assert!(sfu.peer("a").await.is_none());

        assert!(sfu.handle_message("not json").await.is_err());
    }
}
