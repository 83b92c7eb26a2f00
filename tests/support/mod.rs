#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::media_engine::MIME_TYPE_VP8;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use lectern::broadcast::Broadcaster;
use lectern::capture::{CaptureError, CaptureSource, LocalMedia};
use lectern::peer::{EventSink, PeerError, PeerEvent, PeerFactory, PeerLink};
use lectern::session::SessionSignal;
use lectern::signal::{Envelope, IceCandidate, Sdp, SdpKind, SignalError, Signaling};
use lectern::viewer::Viewer;

/// Signaling stub that records every publish for inspection.
pub struct RecordingSignal {
    online: AtomicBool,
    fail_publishes: AtomicBool,
    sent: Mutex<VecDeque<(String, Envelope)>>,
}

impl RecordingSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(true),
            fail_publishes: AtomicBool::new(false),
            sent: Mutex::new(VecDeque::new()),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Simulate the relay dropping between the liveness check and the send.
    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub fn take_sent(&self) -> Vec<(String, Envelope)> {
        self.sent.lock().unwrap().drain(..).collect()
    }
}

#[async_trait]
impl Signaling for RecordingSignal {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(), SignalError> {
        if !self.is_online() || self.fail_publishes.load(Ordering::SeqCst) {
            return Err(SignalError::Offline);
        }
        self.sent
            .lock()
            .unwrap()
            .push_back((topic.to_owned(), envelope.clone()));
        Ok(())
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Peer link double; records commands and lets tests fire events into
/// the owning manager.
pub struct MockLink {
    events: EventSink,
    closed: AtomicBool,
    attached: AtomicUsize,
    remote_candidates: AtomicUsize,
    answers: AtomicUsize,
}

impl MockLink {
    pub fn fire(&self, event: PeerEvent) {
        (self.events)(event);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn attached_tracks(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    pub fn remote_candidates(&self) -> usize {
        self.remote_candidates.load(Ordering::SeqCst)
    }

    pub fn answers_applied(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn create_offer(&self) -> Result<Sdp, PeerError> {
        Ok(sdp_offer())
    }

    async fn accept_offer(&self, _offer: Sdp) -> Result<Sdp, PeerError> {
        Ok(sdp_answer())
    }

    async fn accept_answer(&self, _answer: Sdp) -> Result<(), PeerError> {
        self.answers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: IceCandidate) -> Result<(), PeerError> {
        self.remote_candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn attach_tracks(
        &self,
        tracks: &[Arc<dyn TrackLocal + Send + Sync>],
    ) -> Result<(), PeerError> {
        self.attached.store(tracks.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockPeerFactory {
    links: Mutex<Vec<Arc<MockLink>>>,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            links: Mutex::new(Vec::new()),
        })
    }

    pub fn created(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn link(&self, index: usize) -> Arc<MockLink> {
        Arc::clone(&self.links.lock().unwrap()[index])
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn create(&self, events: EventSink) -> Result<Arc<dyn PeerLink>, PeerError> {
        let link = Arc::new(MockLink {
            events,
            closed: AtomicBool::new(false),
            attached: AtomicUsize::new(0),
            remote_candidates: AtomicUsize::new(0),
            answers: AtomicUsize::new(0),
        });
        self.links.lock().unwrap().push(Arc::clone(&link));
        Ok(link)
    }
}

/// Capture double: grants or denies, and can end the stream externally
/// as if the user stopped sharing from the OS.
pub struct TestCapture {
    deny: bool,
    enders: Mutex<Vec<mpsc::Sender<()>>>,
}

impl TestCapture {
    pub fn granted() -> Arc<Self> {
        Arc::new(Self {
            deny: false,
            enders: Mutex::new(Vec::new()),
        })
    }

    pub fn denied() -> Arc<Self> {
        Arc::new(Self {
            deny: true,
            enders: Mutex::new(Vec::new()),
        })
    }

    pub fn end_capture(&self) {
        for tx in self.enders.lock().unwrap().iter() {
            let _ = tx.try_send(());
        }
    }
}

#[async_trait]
impl CaptureSource for TestCapture {
    async fn acquire(&self) -> Result<LocalMedia, CaptureError> {
        if self.deny {
            return Err(CaptureError::Denied);
        }
        let (stop_tx, _stop_rx) = mpsc::channel(1);
        let (ended_tx, ended_rx) = mpsc::channel(1);
        self.enders.lock().unwrap().push(ended_tx);
        let track: Arc<dyn TrackLocal + Send + Sync> = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "display".to_owned(),
            "test-stream".to_owned(),
        ));
        Ok(LocalMedia::new(vec![track], stop_tx, Some(ended_rx)))
    }
}

pub struct BroadcastRig {
    pub broadcaster: Arc<Broadcaster<RecordingSignal>>,
    pub events: mpsc::UnboundedReceiver<SessionSignal>,
    pub signal: Arc<RecordingSignal>,
    pub peers: Arc<MockPeerFactory>,
    pub capture: Arc<TestCapture>,
}

pub fn broadcast_rig(instructor_id: &str) -> BroadcastRig {
    let signal = RecordingSignal::new();
    let peers = MockPeerFactory::new();
    let capture = TestCapture::granted();
    let (broadcaster, events) = Broadcaster::new(
        instructor_id,
        Arc::clone(&signal),
        peers.clone(),
        capture.clone(),
    );
    BroadcastRig {
        broadcaster,
        events,
        signal,
        peers,
        capture,
    }
}

pub struct ViewerRig {
    pub viewer: Arc<Viewer<RecordingSignal>>,
    pub events: mpsc::UnboundedReceiver<SessionSignal>,
    pub signal: Arc<RecordingSignal>,
    pub peers: Arc<MockPeerFactory>,
}

pub fn viewer_rig(student_id: &str) -> ViewerRig {
    let signal = RecordingSignal::new();
    let peers = MockPeerFactory::new();
    let (viewer, events) = Viewer::new(student_id, Arc::clone(&signal), peers.clone());
    ViewerRig {
        viewer,
        events,
        signal,
        peers,
    }
}

/// Apply every queued peer event, in order.
pub async fn drain_broadcaster(
    broadcaster: &Broadcaster<RecordingSignal>,
    events: &mut mpsc::UnboundedReceiver<SessionSignal>,
) {
    while let Ok(signal) = events.try_recv() {
        broadcaster.handle_peer_event(signal).await;
    }
}

pub async fn drain_viewer(
    viewer: &Viewer<RecordingSignal>,
    events: &mut mpsc::UnboundedReceiver<SessionSignal>,
) {
    while let Ok(signal) = events.try_recv() {
        viewer.handle_peer_event(signal).await;
    }
}

pub fn sdp_offer() -> Sdp {
    Sdp {
        kind: SdpKind::Offer,
        sdp: "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n".to_owned(),
    }
}

pub fn sdp_answer() -> Sdp {
    Sdp {
        kind: SdpKind::Answer,
        sdp: "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\n".to_owned(),
    }
}

pub fn candidate() -> IceCandidate {
    IceCandidate {
        candidate: "candidate:1 1 UDP 2122252543 192.0.2.7 50000 typ host".to_owned(),
        sdp_mid: Some("0".to_owned()),
        sdp_mline_index: Some(0),
    }
}
