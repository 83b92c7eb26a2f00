use std::sync::Arc;

use crate::peer::{PeerEvent, PeerLink};

/// Lifecycle of one instructor↔viewer peer session. The vocabulary is
/// shared by both roles; `Closed` and `Failed` are terminal and a new
/// negotiation always allocates a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingAnswer,
    AwaitingRemoteDescription,
    Connected,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Local offer generated and sent (broadcaster side).
    OfferIssued,
    /// Join request sent (viewer side).
    JoinIssued,
    /// Remote answer applied; the session is not usable yet.
    AnswerAccepted,
    /// Remote offer applied and answer returned; not usable yet.
    OfferAccepted,
    /// Transport reports connected.
    TransportUp,
    /// Transport reports disconnected or failed.
    TransportDown,
    /// Local stop or remote leave/stop.
    Stop,
}

/// Pure transition function. Signaling-level acceptance alone never
/// reaches `Connected`; only the transport-level connected signal does.
pub fn transition(state: SessionState, event: SessionEvent) -> SessionState {
    use SessionEvent::*;
    use SessionState::*;

    match (state, event) {
        // Terminal states absorb everything.
        (Closed, _) => Closed,
        (Failed, _) => Failed,

        (_, Stop) => Closed,
        (_, TransportDown) => Failed,

        (Idle, OfferIssued) => AwaitingAnswer,
        (Idle, JoinIssued) => AwaitingRemoteDescription,

        (AwaitingAnswer, TransportUp) => Connected,
        (AwaitingRemoteDescription, TransportUp) => Connected,
        (AwaitingAnswer, AnswerAccepted) => AwaitingAnswer,
        (AwaitingRemoteDescription, OfferAccepted) => AwaitingRemoteDescription,

        // Anything else is a stale or out-of-order signal.
        (state, _) => state,
    }
}

/// A peer event tagged with the session it belongs to. `seq` identifies
/// the session generation so events from a replaced session are dropped.
#[derive(Debug)]
pub struct SessionSignal {
    pub remote: String,
    pub seq: u64,
    pub event: PeerEvent,
}

/// One negotiated (or negotiating) peer session. Owns the peer handle
/// exclusively; the handle is released exactly once.
pub struct Session {
    remote: String,
    seq: u64,
    state: SessionState,
    link: Option<Arc<dyn PeerLink>>,
    counted: bool,
}

impl Session {
    pub fn new(remote: impl Into<String>, seq: u64, link: Arc<dyn PeerLink>) -> Self {
        Self {
            remote: remote.into(),
            seq,
            state: SessionState::Idle,
            link: Some(link),
            counted: false,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn link(&self) -> Option<&Arc<dyn PeerLink>> {
        self.link.as_ref()
    }

    pub fn apply(&mut self, event: SessionEvent) -> SessionState {
        let next = transition(self.state, event);
        if next != self.state {
            log::debug!("Session with {}: {:?} -> {next:?}", self.remote, self.state);
            self.state = next;
        }
        next
    }

    /// Whether this session has been counted as a connected viewer.
    pub fn counted(&self) -> bool {
        self.counted
    }

    /// Marks the session counted; true only on the first call.
    pub fn mark_counted(&mut self) -> bool {
        !std::mem::replace(&mut self.counted, true)
    }

    /// Idempotent teardown on explicit stop or remote leave.
    pub async fn close(&mut self) {
        self.apply(SessionEvent::Stop);
        if let Some(link) = self.link.take() {
            link.close().await;
        }
    }

    /// Teardown after a transport failure; same reclaim path, terminal
    /// state `Failed` instead of `Closed`.
    pub async fn fail(&mut self) {
        self.apply(SessionEvent::TransportDown);
        if let Some(link) = self.link.take() {
            link.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerError;
    use crate::signal::{IceCandidate, Sdp, SdpKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use webrtc::track::track_local::TrackLocal;

    use SessionEvent::*;
    use SessionState::*;

    const ALL_EVENTS: [SessionEvent; 7] = [
        OfferIssued,
        JoinIssued,
        AnswerAccepted,
        OfferAccepted,
        TransportUp,
        TransportDown,
        Stop,
    ];

    #[test]
    fn broadcaster_happy_path() {
        let mut state = Idle;
        state = transition(state, OfferIssued);
        assert_eq!(state, AwaitingAnswer);
        state = transition(state, AnswerAccepted);
        assert_eq!(state, AwaitingAnswer);
        state = transition(state, TransportUp);
        assert_eq!(state, Connected);
        state = transition(state, Stop);
        assert_eq!(state, Closed);
    }

    #[test]
    fn viewer_happy_path() {
        let mut state = Idle;
        state = transition(state, JoinIssued);
        assert_eq!(state, AwaitingRemoteDescription);
        state = transition(state, OfferAccepted);
        assert_eq!(state, AwaitingRemoteDescription);
        state = transition(state, TransportUp);
        assert_eq!(state, Connected);
    }

    #[test]
    fn transport_down_fails_every_live_state() {
        for state in [Idle, AwaitingAnswer, AwaitingRemoteDescription, Connected] {
            assert_eq!(transition(state, TransportDown), Failed);
        }
    }

    #[test]
    fn stop_closes_every_live_state() {
        for state in [Idle, AwaitingAnswer, AwaitingRemoteDescription, Connected] {
            assert_eq!(transition(state, Stop), Closed);
        }
    }

    #[test]
    fn terminal_states_absorb_every_event() {
        for event in ALL_EVENTS {
            assert_eq!(transition(Closed, event), Closed);
            assert_eq!(transition(Failed, event), Failed);
        }
    }

    #[test]
    fn stale_signals_keep_state() {
        assert_eq!(transition(Idle, AnswerAccepted), Idle);
        assert_eq!(transition(Idle, TransportUp), Idle);
        assert_eq!(transition(AwaitingAnswer, JoinIssued), AwaitingAnswer);
        assert_eq!(transition(Connected, TransportUp), Connected);
        assert_eq!(transition(Connected, AnswerAccepted), Connected);
    }

    struct StubLink {
        closes: AtomicUsize,
    }

    #[async_trait]
    impl PeerLink for StubLink {
        async fn create_offer(&self) -> Result<Sdp, PeerError> {
            Ok(Sdp {
                kind: SdpKind::Offer,
                sdp: String::new(),
            })
        }
        async fn accept_offer(&self, _offer: Sdp) -> Result<Sdp, PeerError> {
            Ok(Sdp {
                kind: SdpKind::Answer,
                sdp: String::new(),
            })
        }
        async fn accept_answer(&self, _answer: Sdp) -> Result<(), PeerError> {
            Ok(())
        }
        async fn add_remote_candidate(&self, _candidate: IceCandidate) -> Result<(), PeerError> {
            Ok(())
        }
        async fn attach_tracks(
            &self,
            _tracks: &[Arc<dyn TrackLocal + Send + Sync>],
        ) -> Result<(), PeerError> {
            Ok(())
        }
        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn close_releases_the_handle_exactly_once() {
        let link = Arc::new(StubLink {
            closes: AtomicUsize::new(0),
        });
        let mut session = Session::new("amy", 1, link.clone());
        session.apply(OfferIssued);

        session.close().await;
        session.close().await;

        assert_eq!(session.state(), Closed);
        assert_eq!(link.closes.load(Ordering::SeqCst), 1);
        assert!(session.link().is_none());
    }

    #[tokio::test]
    async fn close_after_failure_stays_failed() {
        let link = Arc::new(StubLink {
            closes: AtomicUsize::new(0),
        });
        let mut session = Session::new("amy", 1, link.clone());
        session.apply(OfferIssued);

        session.fail().await;
        session.close().await;

        assert_eq!(session.state(), Failed);
        assert_eq!(link.closes.load(Ordering::SeqCst), 1);
    }
}
