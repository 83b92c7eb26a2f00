use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::signal::{IceCandidate, Sdp, SdpKind};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer transport: {0}")]
    Rtc(#[from] webrtc::Error),
    #[error("local description missing after negotiation")]
    NoLocalDescription,
}

/// Connection lifecycle as observed by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events a peer link reports back to its owning manager.
pub enum PeerEvent {
    Candidate(IceCandidate),
    State(LinkState),
    Track(Arc<TrackRemote>),
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::Candidate(c) => f.debug_tuple("Candidate").field(&c.candidate).finish(),
            PeerEvent::State(s) => f.debug_tuple("State").field(s).finish(),
            PeerEvent::Track(t) => f.debug_tuple("Track").field(&t.kind()).finish(),
        }
    }
}

/// Sink for link events, invoked from transport callbacks.
pub type EventSink = Box<dyn Fn(PeerEvent) + Send + Sync>;

/// One direct media connection, opaque except for the commands the
/// coordinator issues and the events it observes.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<Sdp, PeerError>;

    /// Apply a remote offer and produce the local answer.
    async fn accept_offer(&self, offer: Sdp) -> Result<Sdp, PeerError>;

    async fn accept_answer(&self, answer: Sdp) -> Result<(), PeerError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Share local media with the far end, read-only at the track level.
    async fn attach_tracks(
        &self,
        tracks: &[Arc<dyn TrackLocal + Send + Sync>],
    ) -> Result<(), PeerError>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, events: EventSink) -> Result<Arc<dyn PeerLink>, PeerError>;
}

/// Produces peer connections backed by the webrtc stack.
pub struct WebRtcFactory {
    api: API,
    config: RTCConfiguration,
}

impl WebRtcFactory {
    pub fn new() -> Result<Self, PeerError> {
        // Media engine with the default codecs and the default RTP/RTCP
        // interceptor pipeline (NACKs, reports).
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media)?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_owned()],
                ..Default::default()
            }],
            ..Default::default()
        };

        Ok(Self { api, config })
    }
}

#[async_trait]
impl PeerFactory for WebRtcFactory {
    async fn create(&self, events: EventSink) -> Result<Arc<dyn PeerLink>, PeerError> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        let events = Arc::new(events);

        let sink = Arc::clone(&events);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            log::debug!("Peer connection state changed: {state}");
            if let Some(state) = map_state(state) {
                (*sink)(PeerEvent::State(state));
            }
            Box::pin(async {})
        }));

        let sink = Arc::clone(&events);
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => (*sink)(PeerEvent::Candidate(from_init(init))),
                    Err(e) => log::warn!("Failed to serialize local candidate: {e}"),
                }
            }
            Box::pin(async {})
        }));

        let sink = Arc::clone(&events);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            log::info!("Remote track arrived: kind={}", track.kind());
            (*sink)(PeerEvent::Track(track));
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcLink { pc }))
    }
}

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<Sdp, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or(PeerError::NoLocalDescription)?;
        Ok(to_sdp(&desc))
    }

    async fn accept_offer(&self, offer: Sdp) -> Result<Sdp, PeerError> {
        self.pc.set_remote_description(to_rtc(&offer)?).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or(PeerError::NoLocalDescription)?;
        Ok(to_sdp(&desc))
    }

    async fn accept_answer(&self, answer: Sdp) -> Result<(), PeerError> {
        self.pc.set_remote_description(to_rtc(&answer)?).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc.add_ice_candidate(to_init(candidate)).await?;
        Ok(())
    }

    async fn attach_tracks(
        &self,
        tracks: &[Arc<dyn TrackLocal + Send + Sync>],
    ) -> Result<(), PeerError> {
        for track in tracks {
            let sender = self.pc.add_track(Arc::clone(track)).await?;
            // Read incoming RTCP packets so the interceptors (NACK etc.)
            // get to process them.
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
            });
        }
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            log::warn!("Error closing peer connection: {e}");
        }
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::New => Some(LinkState::New),
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        _ => None,
    }
}

fn to_sdp(desc: &RTCSessionDescription) -> Sdp {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        _ => SdpKind::Answer,
    };
    Sdp {
        kind,
        sdp: desc.sdp.clone(),
    }
}

fn to_rtc(sdp: &Sdp) -> Result<RTCSessionDescription, PeerError> {
    let desc = match sdp.kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp.sdp.clone())?,
        SdpKind::Answer => RTCSessionDescription::answer(sdp.sdp.clone())?,
    };
    Ok(desc)
}

fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
    }
}
