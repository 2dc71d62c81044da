//! Connection state machine.
//!
//! A [`ConnectionSession`] owns one peer-transport attempt. The role is
//! assigned at construction and never changes; state only moves through the
//! [`transition`] function, so every mutation is a checked step on a
//! snapshot. Transport events are pumped by a single task per session.

pub mod relay;

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use paircast_token::{BootstrapToken, CandidateInit, SdpKind, SessionDescription, TokenMetadata};
use paircast_transport::{
    PeerConnectionState, PeerTransport, TransportError, TransportEvent, TransportEvents,
};

use crate::message::MessageSink;
use relay::{ChannelFrame, SignalingEnvelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    CreatingOffer,
    AwaitingAnswer,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl SessionState {
    /// Terminal states accept no further inputs apart from close.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }
}

/// Inputs to the state-transition function.
#[derive(Debug, Clone, Copy)]
pub(crate) enum StateInput {
    BeginOffer,
    OfferReady,
    BeginJoin,
    AnswerApplied,
    Transport(PeerConnectionState),
    Close,
}

/// Pure transition function: `None` means the input does not move the
/// session from `state` (either invalid or a no-op).
pub(crate) fn transition(state: SessionState, input: StateInput) -> Option<SessionState> {
    use SessionState::*;
    if state.is_terminal() && !matches!(input, StateInput::Close) {
        return None;
    }
    match input {
        StateInput::BeginOffer => (state == Idle).then_some(CreatingOffer),
        StateInput::OfferReady => (state == CreatingOffer).then_some(AwaitingAnswer),
        StateInput::BeginJoin => (state == Idle).then_some(Connecting),
        StateInput::AnswerApplied => (state == AwaitingAnswer).then_some(Connecting),
        StateInput::Close => (state != Closed).then_some(Closed),
        StateInput::Transport(transport) => match transport {
            PeerConnectionState::Connected => (state != Connected).then_some(Connected),
            PeerConnectionState::Failed => Some(Failed),
            PeerConnectionState::Disconnected => (state != Disconnected).then_some(Disconnected),
            PeerConnectionState::Closed => Some(Closed),
            // Session-level Connecting is driven by the handshake
            // operations, not the engine.
            PeerConnectionState::New | PeerConnectionState::Connecting => None,
        },
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("operation not valid for {role:?} session in state {state:?}")]
    InvalidRoleOrState { role: SessionRole, state: SessionState },
    #[error("invalid token: {0}")]
    InvalidToken(&'static str),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Clone)]
pub struct SessionConfig {
    /// Label of the application data channel.
    pub channel_label: String,
    /// Bound on the local candidate-gathering wait in non-trickle mode.
    pub gathering_timeout: Duration,
    /// Cap on candidates returned by the responder for the reverse exchange.
    pub max_return_candidates: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_label: "paircast".to_string(),
            gathering_timeout: Duration::from_secs(5),
            max_return_candidates: 3,
        }
    }
}

/// Answer plus bounded candidate batch the responder returns for the
/// non-trickle reverse exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponderAnswer {
    pub answer: SessionDescription,
    pub candidates: Vec<CandidateInit>,
}

/// Events surfaced to the session's owner.
#[derive(Debug)]
pub enum SessionEvent {
    StateChanged(SessionState),
    ChannelOpen,
    /// One application frame, already separated from signaling.
    ApplicationFrame(serde_json::Value),
    TransportFailure(String),
}

pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

struct Shared {
    id: String,
    role: SessionRole,
    config: SessionConfig,
    transport: Arc<dyn PeerTransport>,
    state: Mutex<SessionState>,
    trickle: AtomicBool,
    channel_open: AtomicBool,
    answer_applied: AtomicBool,
    pending_candidates: Mutex<Vec<CandidateInit>>,
    pending_answer: Mutex<Option<SessionDescription>>,
    gathering_tx: watch::Sender<bool>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Applies one input through the transition function, emitting a state
    /// event when the session actually moved.
    fn apply(&self, input: StateInput) -> Option<SessionState> {
        let next = {
            let mut state = self.state.lock();
            let next = transition(*state, input)?;
            if next == *state {
                return None;
            }
            *state = next;
            next
        };
        let _ = self.events.send(SessionEvent::StateChanged(next));
        Some(next)
    }

    fn invalid(&self) -> SessionError {
        SessionError::InvalidRoleOrState {
            role: self.role,
            state: self.state(),
        }
    }

    fn fail(&self, reason: &str) {
        warn!(target: "paircast::session", session = %self.id, reason, "session failed");
        self.apply(StateInput::Transport(PeerConnectionState::Failed));
        let _ = self
            .events
            .send(SessionEvent::TransportFailure(reason.to_string()));
    }

    async fn wait_for_gathering(&self) {
        let mut gathered = self.gathering_tx.subscribe();
        let result =
            tokio::time::timeout(self.config.gathering_timeout, gathered.wait_for(|done| *done))
                .await;
        match result {
            Ok(Ok(_)) | Ok(Err(_)) => {}
            Err(_) => {
                debug!(
                    target: "paircast::session",
                    session = %self.id,
                    "gathering wait expired, proceeding with candidates gathered so far"
                );
            }
        }
    }

    fn drain_pending_candidates(&self) -> Vec<CandidateInit> {
        std::mem::take(&mut *self.pending_candidates.lock())
    }

    async fn send_candidate(&self, candidate: CandidateInit) {
        let envelope = SignalingEnvelope::IceCandidate { candidate };
        match relay::encode_signal(&envelope) {
            Ok(frame) => {
                if let Err(err) = self.transport.send(Bytes::from(frame)).await {
                    warn!(target: "paircast::relay", session = %self.id, error = %err, "candidate relay failed, re-buffering");
                    if let SignalingEnvelope::IceCandidate { candidate } = envelope {
                        self.pending_candidates.lock().push(candidate);
                    }
                }
            }
            Err(err) => {
                warn!(target: "paircast::relay", session = %self.id, error = %err, "candidate envelope encode failed");
            }
        }
    }

    /// Channel just opened: in trickle mode the queued answer goes out
    /// first, then the buffered candidates, relying on ordered delivery.
    async fn flush_signaling(&self) {
        let pending = self.pending_answer.lock().take();
        if let Some(answer) = pending {
            match relay::encode_signal(&SignalingEnvelope::Answer { sdp: answer.sdp }) {
                Ok(frame) => {
                    if let Err(err) = self.transport.send(Bytes::from(frame)).await {
                        warn!(target: "paircast::relay", session = %self.id, error = %err, "answer relay failed");
                    }
                }
                Err(err) => {
                    warn!(target: "paircast::relay", session = %self.id, error = %err, "answer envelope encode failed");
                }
            }
        }
        for candidate in self.drain_pending_candidates() {
            self.send_candidate(candidate).await;
        }
    }

    async fn apply_answer(
        &self,
        answer: SessionDescription,
        candidates: Vec<CandidateInit>,
    ) -> Result<(), SessionError> {
        self.transport.set_remote_description(answer).await?;
        for candidate in candidates {
            self.transport.add_ice_candidate(candidate).await?;
        }
        self.apply(StateInput::AnswerApplied);
        Ok(())
    }

    async fn handle_envelope(&self, envelope: SignalingEnvelope) {
        match envelope {
            SignalingEnvelope::Answer { sdp } => {
                if self.role != SessionRole::Initiator {
                    warn!(target: "paircast::relay", session = %self.id, "ignoring answer envelope on responder session");
                    return;
                }
                if self.state() != SessionState::AwaitingAnswer {
                    warn!(
                        target: "paircast::relay",
                        session = %self.id,
                        state = ?self.state(),
                        "ignoring answer envelope out of order"
                    );
                    return;
                }
                if self
                    .answer_applied
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    warn!(target: "paircast::relay", session = %self.id, "ignoring duplicate answer envelope");
                    return;
                }
                if let Err(err) = self
                    .apply_answer(SessionDescription::answer(sdp), Vec::new())
                    .await
                {
                    self.fail(&format!("relayed answer could not be applied: {err}"));
                }
            }
            SignalingEnvelope::IceCandidate { candidate } => {
                let state = self.state();
                if !matches!(
                    state,
                    SessionState::Connecting | SessionState::Connected | SessionState::Disconnected
                ) {
                    warn!(
                        target: "paircast::relay",
                        session = %self.id,
                        ?state,
                        "ignoring candidate envelope outside connecting states"
                    );
                    return;
                }
                // Stragglers after Connected are still applied; they can
                // improve the selected path.
                if let Err(err) = self.transport.add_ice_candidate(candidate).await {
                    warn!(target: "paircast::relay", session = %self.id, error = %err, "relayed candidate rejected");
                }
            }
        }
    }

    async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if self.trickle.load(Ordering::Acquire) && self.channel_open.load(Ordering::Acquire)
                {
                    self.send_candidate(candidate).await;
                } else {
                    self.pending_candidates.lock().push(candidate);
                }
            }
            TransportEvent::GatheringComplete => {
                let _ = self.gathering_tx.send(true);
            }
            TransportEvent::ConnectionStateChanged(transport_state) => {
                self.apply(StateInput::Transport(transport_state));
                if transport_state == PeerConnectionState::Failed {
                    let _ = self.events.send(SessionEvent::TransportFailure(
                        "ice connection failed".to_string(),
                    ));
                }
            }
            TransportEvent::IncomingDataChannel { label } => {
                debug!(target: "paircast::session", session = %self.id, %label, "remote data channel announced");
            }
            TransportEvent::DataChannelOpen { label } => {
                debug!(target: "paircast::session", session = %self.id, %label, "data channel open");
                self.channel_open.store(true, Ordering::Release);
                let _ = self.events.send(SessionEvent::ChannelOpen);
                if self.trickle.load(Ordering::Acquire) {
                    self.flush_signaling().await;
                }
            }
            TransportEvent::DataChannelClosed => {
                self.channel_open.store(false, Ordering::Release);
            }
            TransportEvent::DataChannelMessage(raw) => match relay::decode_frame(&raw) {
                Ok(ChannelFrame::Signal(envelope)) => self.handle_envelope(envelope).await,
                Ok(ChannelFrame::Application(value)) => {
                    let _ = self.events.send(SessionEvent::ApplicationFrame(value));
                }
                Err(err) => {
                    warn!(target: "paircast::session", session = %self.id, error = %err, "dropping undecodable frame");
                }
            },
        }
    }
}

/// One peer-transport attempt.
pub struct ConnectionSession {
    shared: Arc<Shared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSession {
    pub fn new(
        role: SessionRole,
        transport: Arc<dyn PeerTransport>,
        transport_events: TransportEvents,
        config: SessionConfig,
    ) -> (Arc<Self>, SessionEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (gathering_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            id: Uuid::new_v4().to_string(),
            role,
            config,
            transport,
            state: Mutex::new(SessionState::Idle),
            trickle: AtomicBool::new(false),
            channel_open: AtomicBool::new(false),
            answer_applied: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
            pending_answer: Mutex::new(None),
            gathering_tx,
            events: events_tx,
        });
        let pump_shared = shared.clone();
        let pump = tokio::spawn(async move {
            let mut events = transport_events;
            while let Some(event) = events.recv().await {
                pump_shared.handle_event(event).await;
            }
        });
        (
            Arc::new(Self {
                shared,
                pump: Mutex::new(Some(pump)),
            }),
            events_rx,
        )
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn role(&self) -> SessionRole {
        self.shared.role
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_trickle(&self) -> bool {
        self.shared.trickle.load(Ordering::Acquire)
    }

    fn require(&self, input: StateInput) -> Result<SessionState, SessionError> {
        self.shared.apply(input).ok_or_else(|| self.shared.invalid())
    }

    /// Starts the handshake as the initiating side and returns the bootstrap
    /// token to transmit out-of-band. The session is in `AwaitingAnswer`
    /// when this returns.
    pub async fn begin_as_initiator(
        &self,
        use_trickle: bool,
    ) -> Result<BootstrapToken, SessionError> {
        if self.shared.role != SessionRole::Initiator {
            return Err(self.shared.invalid());
        }
        self.require(StateInput::BeginOffer)?;
        self.shared.trickle.store(use_trickle, Ordering::Release);
        match self.drive_offer(use_trickle).await {
            Ok(token) => {
                self.require(StateInput::OfferReady)?;
                Ok(token)
            }
            Err(err) => {
                self.shared.fail("offer bootstrap failed");
                Err(err)
            }
        }
    }

    async fn drive_offer(&self, use_trickle: bool) -> Result<BootstrapToken, SessionError> {
        let shared = &self.shared;
        // Channel first, so the offer announces it to the responder.
        shared
            .transport
            .create_data_channel(&shared.config.channel_label)
            .await?;
        let offer = shared.transport.create_offer().await?;
        shared.transport.set_local_description(offer.clone()).await?;
        let candidates = if use_trickle {
            Vec::new()
        } else {
            shared.wait_for_gathering().await;
            shared.drain_pending_candidates()
        };
        let metadata = TokenMetadata::new(shared.id.clone(), use_trickle);
        Ok(BootstrapToken::new(offer, candidates, metadata))
    }

    /// Joins a handshake seeded by a scanned or looked-up token.
    ///
    /// Non-trickle tokens yield the answer plus a bounded candidate batch
    /// for the reverse out-of-band exchange; trickle tokens yield `None`
    /// and the answer rides the data channel once it opens.
    pub async fn begin_as_responder(
        &self,
        token: &BootstrapToken,
    ) -> Result<Option<ResponderAnswer>, SessionError> {
        if self.shared.role != SessionRole::Responder || self.state() != SessionState::Idle {
            return Err(self.shared.invalid());
        }
        if token.offer.sdp.is_empty() {
            return Err(SessionError::InvalidToken("empty offer"));
        }
        if token.offer.kind != SdpKind::Offer {
            return Err(SessionError::InvalidToken("token must carry an offer"));
        }
        if token.is_trickle() && !token.ice_candidates.is_empty() {
            return Err(SessionError::InvalidToken(
                "trickle token with embedded candidates",
            ));
        }
        let trickle = token.is_trickle();
        self.shared.trickle.store(trickle, Ordering::Release);
        match self.drive_answer(token, trickle).await {
            Ok(answer) => {
                self.require(StateInput::BeginJoin)?;
                if trickle {
                    Ok(None)
                } else {
                    self.shared.wait_for_gathering().await;
                    let mut candidates = self.shared.drain_pending_candidates();
                    candidates.truncate(self.shared.config.max_return_candidates);
                    Ok(Some(ResponderAnswer { answer, candidates }))
                }
            }
            Err(err) => {
                self.shared.fail("join bootstrap failed");
                Err(err)
            }
        }
    }

    async fn drive_answer(
        &self,
        token: &BootstrapToken,
        trickle: bool,
    ) -> Result<SessionDescription, SessionError> {
        let shared = &self.shared;
        shared
            .transport
            .set_remote_description(token.offer.clone())
            .await?;
        for candidate in &token.ice_candidates {
            shared.transport.add_ice_candidate(candidate.clone()).await?;
        }
        let answer = shared.transport.create_answer().await?;
        if trickle {
            // Queue before applying locally: the channel can open the moment
            // the local description lands.
            *shared.pending_answer.lock() = Some(answer.clone());
        }
        shared.transport.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Applies the out-of-band answer on the initiating side. Only valid in
    /// `AwaitingAnswer`; in trickle mode the relay invokes the equivalent
    /// path internally.
    pub async fn complete_as_initiator(
        &self,
        answer: SessionDescription,
        candidates: Vec<CandidateInit>,
    ) -> Result<(), SessionError> {
        if self.shared.role != SessionRole::Initiator
            || self.state() != SessionState::AwaitingAnswer
        {
            return Err(self.shared.invalid());
        }
        if self
            .shared
            .answer_applied
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(self.shared.invalid());
        }
        match self.shared.apply_answer(answer, candidates).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.shared.fail("answer could not be applied");
                Err(err)
            }
        }
    }

    /// Closes the session: data channel and transport first, then buffers,
    /// then listeners. Safe to call from any state, any number of times.
    pub async fn close(&self) {
        let _ = self.shared.transport.close().await;
        self.shared.pending_candidates.lock().clear();
        *self.shared.pending_answer.lock() = None;
        self.shared.channel_open.store(false, Ordering::Release);
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.shared.apply(StateInput::Close);
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

#[async_trait::async_trait]
impl MessageSink for ConnectionSession {
    fn is_open(&self) -> bool {
        self.shared.channel_open.load(Ordering::Acquire)
    }

    async fn deliver(&self, frame: Bytes) -> Result<(), TransportError> {
        self.shared.transport.send(frame).await
    }
}
