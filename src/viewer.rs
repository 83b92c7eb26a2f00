use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use webrtc::track::track_remote::TrackRemote;

use crate::broadcast::NEGOTIATION_TIMEOUT;
use crate::peer::{EventSink, LinkState, PeerError, PeerEvent, PeerFactory};
use crate::session::{Session, SessionEvent, SessionSignal, SessionState};
use crate::signal::{personal, AvailabilityAction, Envelope, IceCandidate, Sdp, Signaling};

#[derive(Debug, Error)]
pub enum ViewError {
    #[error("already receiving a broadcast")]
    AlreadyReceiving,
    #[error("signaling relay unavailable")]
    TransportUnavailable,
    #[error("peer setup: {0}")]
    Peer(#[from] PeerError),
}

/// Media received from the broadcaster, exposed for the rendering layer.
#[derive(Clone, Default)]
pub struct RemoteStream {
    pub tracks: Vec<Arc<TrackRemote>>,
}

struct Shared {
    session: Option<Session>,
}

/// Student-side coordinator: at most one peer session to a designated
/// broadcaster, plus the availability view over every known broadcaster.
pub struct Viewer<S: Signaling> {
    student_id: String,
    signaling: Arc<S>,
    peers: Arc<dyn PeerFactory>,
    shared: Mutex<Shared>,
    availability: std::sync::Mutex<HashMap<String, bool>>,
    stream: std::sync::Mutex<Option<RemoteStream>>,
    receiving: AtomicBool,
    next_seq: AtomicU64,
    last_error: std::sync::Mutex<Option<String>>,
    events_tx: mpsc::UnboundedSender<SessionSignal>,
    self_ref: OnceLock<Weak<Self>>,
}

impl<S: Signaling> Viewer<S> {
    pub fn new(
        student_id: impl Into<String>,
        signaling: Arc<S>,
        peers: Arc<dyn PeerFactory>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionSignal>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let viewer = Arc::new(Self {
            student_id: student_id.into(),
            signaling,
            peers,
            shared: Mutex::new(Shared { session: None }),
            availability: std::sync::Mutex::new(HashMap::new()),
            stream: std::sync::Mutex::new(None),
            receiving: AtomicBool::new(false),
            next_seq: AtomicU64::new(1),
            last_error: std::sync::Mutex::new(None),
            events_tx,
            self_ref: OnceLock::new(),
        });
        let _ = viewer.self_ref.set(Arc::downgrade(&viewer));
        (viewer, events_rx)
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

    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::SeqCst)
    }

    /// The received media, once the transport has delivered tracks.
    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.stream.lock().unwrap().clone()
    }

    pub fn is_live(&self, instructor_id: &str) -> bool {
        self.availability
            .lock()
            .unwrap()
            .get(instructor_id)
            .copied()
            .unwrap_or(false)
    }

    /// Snapshot of every known broadcaster's availability.
    pub fn availability(&self) -> HashMap<String, bool> {
        self.availability.lock().unwrap().clone()
    }

    pub async fn session_state(&self) -> Option<SessionState> {
        self.shared.lock().await.session.as_ref().map(|s| s.state())
    }

    /// Informational only, surfaced for display.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    /// Ask `instructor_id` for its stream. The media arrives
    /// asynchronously via the track event once the transport connects.
    pub async fn start_receiving(&self, instructor_id: &str) -> Result<(), ViewError> {
        if !self.signaling.is_online() {
            return Err(ViewError::TransportUnavailable);
        }
        let mut shared = self.shared.lock().await;
        if shared.session.is_some() {
            return Err(ViewError::AlreadyReceiving);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let link = self.peers.create(self.event_sink(instructor_id, seq)).await?;
        let mut session = Session::new(instructor_id, seq, link);
        session.apply(SessionEvent::JoinIssued);
        shared.session = Some(session);
        drop(shared);
        self.receiving.store(true, Ordering::SeqCst);

        let join = Envelope::Join {
            student_id: self.student_id.clone(),
            instructor_id: instructor_id.to_owned(),
        };
        if let Err(e) = self
            .signaling
            .publish(&personal(instructor_id), &join)
            .await
        {
            // The whole operation has to be re-attempted by the caller.
            log::warn!("Join request to {instructor_id} skipped: {e}");
            self.abandon_session(seq).await;
            return Err(ViewError::TransportUnavailable);
        }
        log::info!("Requested stream from {instructor_id}");
        self.watch_negotiation(seq);
        Ok(())
    }

    /// Leave the broadcast and release the session. Idempotent; safe
    /// when nothing is being received.
    pub async fn stop_receiving(&self) {
        let session = self.shared.lock().await.session.take();
        let Some(mut session) = session else { return };
        self.receiving.store(false, Ordering::SeqCst);
        self.stream.lock().unwrap().take();

        let leave = Envelope::Leave {
            student_id: self.student_id.clone(),
            instructor_id: session.remote().to_owned(),
        };
        if let Err(e) = self
            .signaling
            .publish(&personal(session.remote()), &leave)
            .await
        {
            log::warn!("Leave notice skipped: {e}");
        }
        session.close().await;
        log::info!("Stopped receiving");
    }

    /// The broadcaster's offer arrived; answer it. Ignored unless a
    /// session is waiting for one (defends against stale offers).
    pub async fn on_offer(&self, offer: Sdp) {
        let (link, seq, remote) = {
            let shared = self.shared.lock().await;
            match shared.session.as_ref() {
                Some(s) if s.state() == SessionState::AwaitingRemoteDescription => {
                    (s.link().cloned(), s.seq(), s.remote().to_owned())
                }
                _ => {
                    log::debug!("Offer ignored, not awaiting one");
                    return;
                }
            }
        };
        let Some(link) = link else { return };
        let answer = match link.accept_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                self.record_error(format!("applying offer failed: {e}"));
                return;
            }
        };
        {
            let mut shared = self.shared.lock().await;
            match shared.session.as_mut() {
                Some(s) if s.seq() == seq => {
                    s.apply(SessionEvent::OfferAccepted);
                }
                _ => return,
            }
        }
        let envelope = Envelope::Answer {
            student_id: self.student_id.clone(),
            answer,
        };
        if let Err(e) = self.signaling.publish(&personal(&remote), &envelope).await {
            log::warn!("Answer to {remote} skipped: {e}");
        }
    }

    /// Remote candidate arrived. Dropped silently without a matching
    /// active session.
    pub async fn on_remote_candidate(&self, from: &str, candidate: IceCandidate) {
        let link = {
            let shared = self.shared.lock().await;
            shared
                .session
                .as_ref()
                .filter(|s| s.remote() == from)
                .and_then(|s| s.link().cloned())
        };
        let Some(link) = link else {
            log::debug!("Candidate from {from} dropped, no session");
            return;
        };
        if let Err(e) = link.add_remote_candidate(candidate).await {
            log::debug!("Candidate from {from} rejected: {e}");
        }
    }

    /// The broadcaster went offline. Always updates availability; also
    /// tears down the session when it was the one being watched.
    pub async fn on_broadcaster_stop(&self, instructor_id: &str) {
        self.availability
            .lock()
            .unwrap()
            .insert(instructor_id.to_owned(), false);
        let watching = {
            let shared = self.shared.lock().await;
            shared
                .session
                .as_ref()
                .is_some_and(|s| s.remote() == instructor_id)
        };
        if watching {
            log::info!("Broadcaster {instructor_id} stopped");
            self.stop_receiving().await;
        }
    }

    /// Pure availability update; joining stays an explicit action.
    pub fn on_availability_start(&self, instructor_id: &str) {
        self.availability
            .lock()
            .unwrap()
            .insert(instructor_id.to_owned(), true);
    }

    /// Exhaustive dispatch of inbound signaling for this role.
    pub async fn handle_envelope(&self, envelope: Envelope) {
        match envelope {
            Envelope::Offer { offer } => self.on_offer(offer).await,
            Envelope::Ice {
                from, candidate, ..
            } => self.on_remote_candidate(&from, candidate).await,
            Envelope::Availability {
                action: AvailabilityAction::Start,
                instructor_id,
            } => self.on_availability_start(&instructor_id),
            Envelope::Availability {
                action: AvailabilityAction::Stop,
                instructor_id,
            } => self.on_broadcaster_stop(&instructor_id).await,
            Envelope::Join { .. } | Envelope::Answer { .. } | Envelope::Leave { .. } => {
                log::debug!("Envelope not addressed to the viewer role, ignored");
            }
        }
    }

    /// Applies one peer event to the active session; events from a
    /// replaced session are dropped via the seq tag.
    pub async fn handle_peer_event(&self, signal: SessionSignal) {
        match signal.event {
            PeerEvent::Candidate(candidate) => {
                let current = {
                    let shared = self.shared.lock().await;
                    shared
                        .session
                        .as_ref()
                        .is_some_and(|s| s.seq() == signal.seq)
                };
                if !current {
                    return;
                }
                let envelope = Envelope::Ice {
                    from: self.student_id.clone(),
                    to: signal.remote.clone(),
                    candidate,
                };
                if let Err(e) = self
                    .signaling
                    .publish(&personal(&signal.remote), &envelope)
                    .await
                {
                    log::warn!("Candidate to {} skipped: {e}", signal.remote);
                }
            }
            PeerEvent::State(LinkState::Connected) => {
                let mut shared = self.shared.lock().await;
                if let Some(session) = shared.session.as_mut() {
                    if session.seq() == signal.seq
                        && session.apply(SessionEvent::TransportUp) == SessionState::Connected
                    {
                        log::info!("Receiving from {}", session.remote());
                    }
                }
            }
            PeerEvent::State(LinkState::Disconnected | LinkState::Failed) => {
                let session = {
                    let mut shared = self.shared.lock().await;
                    let current = shared
                        .session
                        .as_ref()
                        .is_some_and(|s| s.seq() == signal.seq);
                    if current {
                        shared.session.take()
                    } else {
                        None
                    }
                };
                let Some(mut session) = session else { return };
                self.receiving.store(false, Ordering::SeqCst);
                self.stream.lock().unwrap().take();
                self.record_error(format!("connection to {} lost", session.remote()));
                session.fail().await;
            }
            PeerEvent::State(_) => {}
            PeerEvent::Track(track) => {
                let current = {
                    let shared = self.shared.lock().await;
                    shared
                        .session
                        .as_ref()
                        .is_some_and(|s| s.seq() == signal.seq)
                };
                if !current {
                    return;
                }
                let mut stream = self.stream.lock().unwrap();
                stream.get_or_insert_with(RemoteStream::default).tracks.push(track);
            }
        }
    }

    fn event_sink(&self, instructor_id: &str, seq: u64) -> EventSink {
        let tx = self.events_tx.clone();
        let remote = instructor_id.to_owned();
        Box::new(move |event| {
            let _ = tx.send(SessionSignal {
                remote: remote.clone(),
                seq,
                event,
            });
        })
    }

    fn watch_negotiation(&self, seq: u64) {
        let Some(this) = self.arc() else { return };
        tokio::spawn(async move {
            tokio::time::sleep(NEGOTIATION_TIMEOUT).await;
            this.fail_if_stalled(seq).await;
        });
    }

    async fn fail_if_stalled(&self, seq: u64) {
        let session = {
            let mut shared = self.shared.lock().await;
            let stalled = shared.session.as_ref().is_some_and(|s| {
                s.seq() == seq && !s.state().is_terminal() && s.state() != SessionState::Connected
            });
            if !stalled {
                return;
            }
            shared.session.take()
        };
        let Some(mut session) = session else { return };
        self.receiving.store(false, Ordering::SeqCst);
        self.record_error(format!("negotiation with {} timed out", session.remote()));
        session.fail().await;
    }

    async fn abandon_session(&self, seq: u64) {
        let session = {
            let mut shared = self.shared.lock().await;
            let current = shared.session.as_ref().is_some_and(|s| s.seq() == seq);
            if current {
                shared.session.take()
            } else {
                None
            }
        };
        if let Some(mut session) = session {
            self.receiving.store(false, Ordering::SeqCst);
            session.close().await;
        }
    }

    fn record_error(&self, message: String) {
        log::warn!("{message}");
        *self.last_error.lock().unwrap() = Some(message);
    }
}
