use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::capture::{CaptureError, CaptureSource, LocalMedia};
use crate::peer::{EventSink, LinkState, PeerError, PeerEvent, PeerFactory};
use crate::session::{Session, SessionEvent, SessionSignal, SessionState};
use crate::signal::{
    personal, AvailabilityAction, Envelope, IceCandidate, Sdp, Signaling, AVAILABILITY,
};

/// A session still negotiating after this long is failed and reclaimed.
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between availability re-announcements while live, so clients
/// that attach to the relay mid-broadcast converge on the same view.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("screen capture denied")]
    CaptureDenied,
    #[error("capture failed: {0}")]
    Capture(#[source] CaptureError),
    #[error("signaling relay unavailable")]
    TransportUnavailable,
    #[error("peer setup: {0}")]
    Peer(#[from] PeerError),
}

struct Shared {
    media: Option<LocalMedia>,
    registry: HashMap<String, Session>,
}

/// Instructor-side coordinator: owns the captured stream and one peer
/// session per connected viewer, keyed by viewer id. All registry
/// mutation funnels through these methods.
pub struct Broadcaster<S: Signaling> {
    instructor_id: String,
    signaling: Arc<S>,
    peers: Arc<dyn PeerFactory>,
    capture: Arc<dyn CaptureSource>,
    shared: Mutex<Shared>,
    viewer_count: AtomicUsize,
    sharing: AtomicBool,
    next_seq: AtomicU64,
    last_error: std::sync::Mutex<Option<String>>,
    events_tx: mpsc::UnboundedSender<SessionSignal>,
    self_ref: OnceLock<Weak<Self>>,
}

impl<S: Signaling> Broadcaster<S> {
    pub fn new(
        instructor_id: impl Into<String>,
        signaling: Arc<S>,
        peers: Arc<dyn PeerFactory>,
        capture: Arc<dyn CaptureSource>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionSignal>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let broadcaster = Arc::new(Self {
            instructor_id: instructor_id.into(),
            signaling,
            peers,
            capture,
            shared: Mutex::new(Shared {
                media: None,
                registry: HashMap::new(),
            }),
            viewer_count: AtomicUsize::new(0),
            sharing: AtomicBool::new(false),
            next_seq: AtomicU64::new(1),
            last_error: std::sync::Mutex::new(None),
            events_tx,
            self_ref: OnceLock::new(),
        });
        let _ = broadcaster.self_ref.set(Arc::downgrade(&broadcaster));
        (broadcaster, events_rx)
    }

    fn arc(&self) -> Option<Arc<Self>> {
        self.self_ref.get().and_then(Weak::upgrade)
    }

    /// Drives peer events into the manager. Spawn once per instance.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<SessionSignal>) {
        while let Some(signal) = events.recv().await {
            self.handle_peer_event(signal).await;
        }
    }

    pub fn is_sharing(&self) -> bool {
        self.sharing.load(Ordering::SeqCst)
    }

    /// Connected viewers. Eventually consistent with the registry: a
    /// viewer mid-negotiation is not yet counted.
    pub fn viewer_count(&self) -> usize {
        self.viewer_count.load(Ordering::SeqCst)
    }

    pub async fn session_count(&self) -> usize {
        self.shared.lock().await.registry.len()
    }

    pub async fn session_state(&self, viewer_id: &str) -> Option<SessionState> {
        self.shared
            .lock()
            .await
            .registry
            .get(viewer_id)
            .map(|s| s.state())
    }

    /// Informational only, surfaced for display.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    /// Acquire the capture stream and go live. No side effects on
    /// denial; a no-op when already broadcasting.
    pub async fn start_broadcast(&self) -> Result<(), BroadcastError> {
        if !self.signaling.is_online() {
            return Err(BroadcastError::TransportUnavailable);
        }
        let mut shared = self.shared.lock().await;
        if shared.media.is_some() {
            return Ok(());
        }
        let mut media = self.capture.acquire().await.map_err(|e| match e {
            CaptureError::Denied => BroadcastError::CaptureDenied,
            other => BroadcastError::Capture(other),
        })?;
        let ended = media.take_ended();
        shared.media = Some(media);
        drop(shared);
        self.sharing.store(true, Ordering::SeqCst);
        log::info!("Broadcast started as {}", self.instructor_id);

        // Capture ending from outside (OS chrome) folds into the normal
        // stop path.
        if let (Some(mut ended), Some(this)) = (ended, self.arc()) {
            tokio::spawn(async move {
                if ended.recv().await.is_some() {
                    log::info!("Capture ended externally, stopping broadcast");
                    this.stop_broadcast().await;
                }
            });
        }

        self.publish_availability(AvailabilityAction::Start).await;
        if let Some(this) = self.arc() {
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(ANNOUNCE_INTERVAL).await;
                    if !this.is_sharing() {
                        break;
                    }
                    this.publish_availability(AvailabilityAction::Start).await;
                }
            });
        }
        Ok(())
    }

    /// Close every session, stop the capture, announce stop. Idempotent;
    /// safe to call when already stopped.
    pub async fn stop_broadcast(&self) {
        let mut shared = self.shared.lock().await;
        let Some(media) = shared.media.take() else {
            return;
        };
        let registry = std::mem::take(&mut shared.registry);
        drop(shared);
        self.sharing.store(false, Ordering::SeqCst);

        // Sessions are independent; order does not matter.
        for (_, mut session) in registry {
            session.close().await;
        }
        media.stop();
        self.viewer_count.store(0, Ordering::SeqCst);
        self.publish_availability(AvailabilityAction::Stop).await;
        log::info!("Broadcast stopped");
    }

    /// A viewer asked to join. Ignored unless live; a duplicate join
    /// closes and replaces the existing session.
    pub async fn on_join_request(&self, viewer_id: &str) {
        if !self.is_sharing() {
            log::debug!("Join from {viewer_id} ignored, not broadcasting");
            return;
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let link = match self.peers.create(self.event_sink(viewer_id, seq)).await {
            Ok(link) => link,
            Err(e) => {
                self.record_error(format!("peer setup for {viewer_id} failed: {e}"));
                return;
            }
        };

        let mut shared = self.shared.lock().await;
        let tracks = match shared.media.as_ref() {
            Some(media) => media.tracks().to_vec(),
            None => {
                // Stopped while the link was being set up.
                drop(shared);
                link.close().await;
                return;
            }
        };
        if let Err(e) = link.attach_tracks(&tracks).await {
            drop(shared);
            self.record_error(format!("attaching tracks for {viewer_id} failed: {e}"));
            link.close().await;
            return;
        }
        let offer = match link.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                drop(shared);
                self.record_error(format!("offer for {viewer_id} failed: {e}"));
                link.close().await;
                return;
            }
        };
        let previous = shared.registry.remove(viewer_id);
        let mut session = Session::new(viewer_id, seq, link);
        session.apply(SessionEvent::OfferIssued);
        shared.registry.insert(viewer_id.to_owned(), session);
        drop(shared);

        if let Some(mut previous) = previous {
            log::debug!("Replacing existing session for {viewer_id}");
            if previous.counted() {
                self.uncount();
            }
            previous.close().await;
        }

        self.send_to(viewer_id, Envelope::Offer { offer }).await;
        self.watch_negotiation(viewer_id.to_owned(), seq);
    }

    /// Remote answer arrived. An unknown viewer id is an expected race
    /// and ignored.
    pub async fn on_answer(&self, viewer_id: &str, answer: Sdp) {
        let (link, seq) = {
            let shared = self.shared.lock().await;
            match shared.registry.get(viewer_id) {
                Some(session) => (session.link().cloned(), session.seq()),
                None => {
                    log::debug!("Answer from {viewer_id} ignored, no session");
                    return;
                }
            }
        };
        let Some(link) = link else { return };
        if let Err(e) = link.accept_answer(answer).await {
            self.record_error(format!("applying answer from {viewer_id} failed: {e}"));
            return;
        }
        let mut shared = self.shared.lock().await;
        if let Some(session) = shared.registry.get_mut(viewer_id) {
            if session.seq() == seq {
                session.apply(SessionEvent::AnswerAccepted);
            }
        }
    }

    /// Remote candidate arrived. Dropped silently when the session is
    /// gone; candidates are never an error.
    pub async fn on_remote_candidate(&self, viewer_id: &str, candidate: IceCandidate) {
        let link = {
            let shared = self.shared.lock().await;
            shared
                .registry
                .get(viewer_id)
                .and_then(|session| session.link().cloned())
        };
        let Some(link) = link else {
            log::debug!("Candidate from {viewer_id} dropped, no session");
            return;
        };
        if let Err(e) = link.add_remote_candidate(candidate).await {
            log::debug!("Candidate from {viewer_id} rejected: {e}");
        }
    }

    /// A viewer left; close and forget its session if present.
    pub async fn on_viewer_leave(&self, viewer_id: &str) {
        let session = self.shared.lock().await.registry.remove(viewer_id);
        let Some(mut session) = session else { return };
        if session.counted() {
            self.uncount();
        }
        session.close().await;
        log::info!("Viewer {viewer_id} left, {} watching", self.viewer_count());
    }

    /// Exhaustive dispatch of inbound signaling for this role.
    pub async fn handle_envelope(&self, envelope: Envelope) {
        match envelope {
            Envelope::Join { student_id, .. } => self.on_join_request(&student_id).await,
            Envelope::Answer { student_id, answer } => self.on_answer(&student_id, answer).await,
            Envelope::Ice {
                from, candidate, ..
            } => self.on_remote_candidate(&from, candidate).await,
            Envelope::Leave { student_id, .. } => self.on_viewer_leave(&student_id).await,
            Envelope::Offer { .. } | Envelope::Availability { .. } => {
                log::debug!("Envelope not addressed to the broadcaster role, ignored");
            }
        }
    }

    /// Applies one peer event to the session it belongs to. Events from
    /// a replaced or removed session are dropped via the seq tag.
    pub async fn handle_peer_event(&self, signal: SessionSignal) {
        match signal.event {
            PeerEvent::Candidate(candidate) => {
                let current = {
                    let shared = self.shared.lock().await;
                    shared
                        .registry
                        .get(&signal.remote)
                        .is_some_and(|s| s.seq() == signal.seq)
                };
                if !current {
                    return;
                }
                let envelope = Envelope::Ice {
                    from: self.instructor_id.clone(),
                    to: signal.remote.clone(),
                    candidate,
                };
                self.send_to(&signal.remote, envelope).await;
            }
            PeerEvent::State(LinkState::Connected) => {
                let mut shared = self.shared.lock().await;
                let Some(session) = shared.registry.get_mut(&signal.remote) else {
                    return;
                };
                if session.seq() != signal.seq {
                    return;
                }
                if session.apply(SessionEvent::TransportUp) == SessionState::Connected
                    && session.mark_counted()
                {
                    let count = self.viewer_count.fetch_add(1, Ordering::SeqCst) + 1;
                    log::info!("Viewer {} connected, {count} watching", signal.remote);
                }
            }
            PeerEvent::State(LinkState::Disconnected | LinkState::Failed) => {
                let session = {
                    let mut shared = self.shared.lock().await;
                    let current = shared
                        .registry
                        .get(&signal.remote)
                        .is_some_and(|s| s.seq() == signal.seq);
                    if current {
                        shared.registry.remove(&signal.remote)
                    } else {
                        None
                    }
                };
                let Some(mut session) = session else { return };
                if session.counted() {
                    self.uncount();
                }
                self.record_error(format!("connection to {} lost", signal.remote));
                session.fail().await;
            }
            PeerEvent::State(_) => {}
            // The broadcaster only sends media.
            PeerEvent::Track(_) => {}
        }
    }

    fn event_sink(&self, viewer_id: &str, seq: u64) -> EventSink {
        let tx = self.events_tx.clone();
        let remote = viewer_id.to_owned();
        Box::new(move |event| {
            let _ = tx.send(SessionSignal {
                remote: remote.clone(),
                seq,
                event,
            });
        })
    }

    fn watch_negotiation(&self, viewer_id: String, seq: u64) {
        let Some(this) = self.arc() else { return };
        tokio::spawn(async move {
            tokio::time::sleep(NEGOTIATION_TIMEOUT).await;
            this.fail_if_stalled(&viewer_id, seq).await;
        });
    }

    async fn fail_if_stalled(&self, viewer_id: &str, seq: u64) {
        let session = {
            let mut shared = self.shared.lock().await;
            let stalled = shared.registry.get(viewer_id).is_some_and(|s| {
                s.seq() == seq && !s.state().is_terminal() && s.state() != SessionState::Connected
            });
            if !stalled {
                return;
            }
            shared.registry.remove(viewer_id)
        };
        let Some(mut session) = session else { return };
        self.record_error(format!("negotiation with {viewer_id} timed out"));
        session.fail().await;
    }

    async fn publish_availability(&self, action: AvailabilityAction) {
        let envelope = Envelope::Availability {
            action,
            instructor_id: self.instructor_id.clone(),
        };
        if let Err(e) = self.signaling.publish(AVAILABILITY, &envelope).await {
            log::warn!("Availability announce skipped: {e}");
        }
    }

    async fn send_to(&self, user: &str, envelope: Envelope) {
        // Not queued, not retried; the far end re-attempts if it cares.
        if let Err(e) = self.signaling.publish(&personal(user), &envelope).await {
            log::warn!("Send to {user} skipped: {e}");
        }
    }

    fn uncount(&self) {
        let _ = self
            .viewer_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            });
    }

    fn record_error(&self, message: String) {
        log::warn!("{message}");
        *self.last_error.lock().unwrap() = Some(message);
    }
}
