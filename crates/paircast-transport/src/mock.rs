//! Deterministic in-memory transport pair for tests.
//!
//! Two linked [`MockTransport`] ends simulate the engine's negotiation
//! sequence without touching the network: setting a local description
//! "gathers" a configurable number of synthetic candidates, the data channel
//! opens once the channel-creating side holds a local description and its
//! peer holds both, and the pair reports connected once all four
//! descriptions are in place. Frames sent on one end surface as
//! [`TransportEvent::DataChannelMessage`] on the other.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use paircast_token::{CandidateInit, SessionDescription};

use crate::{
    PeerConnectionState, PeerTransport, TransportError, TransportEvent, TransportEvents,
    TransportFactory,
};

const DEFAULT_CANDIDATE_BUDGET: u8 = 3;

pub struct MockTransport {
    name: &'static str,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<TransportEvent>,
    peer: Mutex<Option<Weak<MockTransport>>>,
}

struct Inner {
    state: PeerConnectionState,
    local_desc: Option<SessionDescription>,
    remote_desc: Option<SessionDescription>,
    /// Label of the channel this side created, if any.
    channel_label: Option<String>,
    channel_open: bool,
    applied_candidates: Vec<CandidateInit>,
    candidate_budget: u8,
    closed: bool,
}

impl Inner {
    fn new(candidate_budget: u8) -> Self {
        Self {
            state: PeerConnectionState::New,
            local_desc: None,
            remote_desc: None,
            channel_label: None,
            channel_open: false,
            applied_candidates: Vec::new(),
            candidate_budget,
            closed: false,
        }
    }
}

impl MockTransport {
    /// Builds a linked pair with the default candidate budget.
    pub fn pair() -> ((Arc<Self>, TransportEvents), (Arc<Self>, TransportEvents)) {
        Self::pair_with_budget(DEFAULT_CANDIDATE_BUDGET)
    }

    /// Builds a linked pair whose sides each gather `budget` synthetic
    /// candidates per local description.
    pub fn pair_with_budget(
        budget: u8,
    ) -> ((Arc<Self>, TransportEvents), (Arc<Self>, TransportEvents)) {
        let (a, a_events) = Self::new_end("mock-a", budget);
        let (b, b_events) = Self::new_end("mock-b", budget);
        *a.peer.lock() = Some(Arc::downgrade(&b));
        *b.peer.lock() = Some(Arc::downgrade(&a));
        ((a, a_events), (b, b_events))
    }

    fn new_end(name: &'static str, budget: u8) -> (Arc<Self>, TransportEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                name,
                inner: Mutex::new(Inner::new(budget)),
                events: tx,
                peer: Mutex::new(None),
            }),
            rx,
        )
    }

    fn peer(&self) -> Option<Arc<MockTransport>> {
        self.peer.lock().as_ref().and_then(Weak::upgrade)
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Candidates applied on this end via `add_ice_candidate`.
    pub fn applied_candidates(&self) -> Vec<CandidateInit> {
        self.inner.lock().applied_candidates.clone()
    }

    pub fn is_channel_open(&self) -> bool {
        self.inner.lock().channel_open
    }

    /// Forces the connection into the failed state, as an ICE failure would.
    pub fn inject_failure(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.state = PeerConnectionState::Failed;
        inner.channel_open = false;
        drop(inner);
        self.emit(TransportEvent::ConnectionStateChanged(
            PeerConnectionState::Failed,
        ));
    }

    fn snapshot(&self) -> (bool, bool, Option<String>) {
        let inner = self.inner.lock();
        (
            inner.local_desc.is_some() && !inner.closed,
            inner.local_desc.is_some() && inner.remote_desc.is_some() && !inner.closed,
            inner.channel_label.clone(),
        )
    }

    /// Re-evaluates the pair after a description changed on either end.
    fn sync_pair(&self) {
        let Some(peer) = self.peer() else { return };
        let (self_local, self_both, self_label) = self.snapshot();
        let (peer_local, peer_both, peer_label) = peer.snapshot();

        // The channel opens once its creator holds a local description and
        // the other end has applied both. The creator's remote description
        // may arrive later, relayed through the channel itself.
        if let Some(label) = self_label {
            if self_local && peer_both {
                self.open_channel(&label, false);
                peer.open_channel(&label, true);
            }
        } else if let Some(label) = peer_label {
            if peer_local && self_both {
                peer.open_channel(&label, false);
                self.open_channel(&label, true);
            }
        }

        if self_both && peer_both {
            self.mark_connected();
            peer.mark_connected();
        }
    }

    fn open_channel(&self, label: &str, incoming: bool) {
        let mut inner = self.inner.lock();
        if inner.closed || inner.channel_open {
            return;
        }
        if inner.state == PeerConnectionState::New {
            inner.state = PeerConnectionState::Connecting;
            self.emit(TransportEvent::ConnectionStateChanged(
                PeerConnectionState::Connecting,
            ));
        }
        inner.channel_open = true;
        drop(inner);
        if incoming {
            self.emit(TransportEvent::IncomingDataChannel {
                label: label.to_string(),
            });
        }
        self.emit(TransportEvent::DataChannelOpen {
            label: label.to_string(),
        });
    }

    fn mark_connected(&self) {
        let mut inner = self.inner.lock();
        if inner.closed || inner.state == PeerConnectionState::Connected {
            return;
        }
        if inner.state == PeerConnectionState::New {
            self.emit(TransportEvent::ConnectionStateChanged(
                PeerConnectionState::Connecting,
            ));
        }
        inner.state = PeerConnectionState::Connected;
        drop(inner);
        self.emit(TransportEvent::ConnectionStateChanged(
            PeerConnectionState::Connected,
        ));
    }

    fn gather(&self) {
        let budget = self.inner.lock().candidate_budget;
        for index in 0..budget {
            self.emit(TransportEvent::LocalCandidate(CandidateInit {
                candidate: format!(
                    "candidate:{index} 1 udp 2122260223 10.0.0.{} 5{index}000 typ host",
                    index + 1
                ),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: 0,
            }));
        }
        self.emit(TransportEvent::GatheringComplete);
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        if self.inner.lock().closed {
            return Err(TransportError::Closed);
        }
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\ns=-\r\n",
            self.name
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(TransportError::Closed);
        }
        if inner.remote_desc.is_none() {
            return Err(TransportError::Engine(
                "create_answer before remote description".into(),
            ));
        }
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\n",
            self.name
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(TransportError::Closed);
            }
            inner.local_desc = Some(desc);
        }
        self.gather();
        self.sync_pair();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(TransportError::Closed);
            }
            inner.remote_desc = Some(desc);
        }
        self.sync_pair();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TransportError::Closed);
        }
        inner.applied_candidates.push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TransportError::Closed);
        }
        inner.channel_label = Some(label.to_string());
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        {
            let inner = self.inner.lock();
            if inner.closed {
                return Err(TransportError::Closed);
            }
            if !inner.channel_open {
                return Err(TransportError::NotReady);
            }
        }
        let peer = self.peer().ok_or(TransportError::ChannelClosed)?;
        peer.emit(TransportEvent::DataChannelMessage(payload));
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.inner.lock().state
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            if inner.channel_open {
                inner.channel_open = false;
                self.emit(TransportEvent::DataChannelClosed);
            }
            inner.state = PeerConnectionState::Closed;
        }
        self.emit(TransportEvent::ConnectionStateChanged(
            PeerConnectionState::Closed,
        ));
        if let Some(peer) = self.peer() {
            let mut inner = peer.inner.lock();
            if !inner.closed {
                if inner.channel_open {
                    inner.channel_open = false;
                    peer.emit(TransportEvent::DataChannelClosed);
                }
                inner.state = PeerConnectionState::Disconnected;
                drop(inner);
                peer.emit(TransportEvent::ConnectionStateChanged(
                    PeerConnectionState::Disconnected,
                ));
            }
        }
        Ok(())
    }
}

/// Factory handing out pre-linked mock ends, one per `create` call.
#[derive(Default)]
pub struct MockTransportFactory {
    queued: Mutex<VecDeque<(Arc<dyn PeerTransport>, TransportEvents)>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, transport: Arc<MockTransport>, events: TransportEvents) {
        let transport: Arc<dyn PeerTransport> = transport;
        self.queued.lock().push_back((transport, events));
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(&self) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError> {
        self.queued
            .lock()
            .pop_front()
            .ok_or_else(|| TransportError::Engine("no mock transport queued".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(events: &mut TransportEvents) -> Vec<TransportEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    #[tokio::test]
    async fn gathering_emits_budgeted_candidates_then_complete() {
        let ((a, mut a_events), _b) = MockTransport::pair_with_budget(2);
        let offer = a.create_offer().await.expect("offer");
        a.set_local_description(offer).await.expect("set local");
        let events = drain(&mut a_events);
        let candidates = events
            .iter()
            .filter(|e| matches!(e, TransportEvent::LocalCandidate(_)))
            .count();
        assert_eq!(candidates, 2);
        assert!(matches!(
            events.last(),
            Some(TransportEvent::GatheringComplete)
        ));
    }

    #[tokio::test]
    async fn channel_opens_before_creator_has_remote_description() {
        let ((a, mut a_events), (b, mut b_events)) = MockTransport::pair_with_budget(0);
        a.create_data_channel("data").await.expect("channel");
        let offer = a.create_offer().await.expect("offer");
        a.set_local_description(offer.clone()).await.expect("local");
        b.set_remote_description(offer).await.expect("remote");
        let answer = b.create_answer().await.expect("answer");
        b.set_local_description(answer).await.expect("local");

        assert!(a.is_channel_open());
        assert!(b.is_channel_open());
        let b_drained = drain(&mut b_events);
        assert!(b_drained
            .iter()
            .any(|e| matches!(e, TransportEvent::IncomingDataChannel { .. })));
        let a_drained = drain(&mut a_events);
        assert!(a_drained
            .iter()
            .any(|e| matches!(e, TransportEvent::DataChannelOpen { .. })));
        // Not connected yet: the creator never applied an answer.
        assert_ne!(a.connection_state(), PeerConnectionState::Connected);
    }

    #[tokio::test]
    async fn full_exchange_reaches_connected_and_passes_frames() {
        let ((a, mut a_events), (b, mut b_events)) = MockTransport::pair_with_budget(1);
        a.create_data_channel("data").await.expect("channel");
        let offer = a.create_offer().await.expect("offer");
        a.set_local_description(offer.clone()).await.expect("local");
        b.set_remote_description(offer).await.expect("remote");
        let answer = b.create_answer().await.expect("answer");
        b.set_local_description(answer.clone()).await.expect("local");
        a.set_remote_description(answer).await.expect("remote");

        assert_eq!(a.connection_state(), PeerConnectionState::Connected);
        assert_eq!(b.connection_state(), PeerConnectionState::Connected);

        a.send(Bytes::from_static(b"ping")).await.expect("send");
        let received = drain(&mut b_events)
            .into_iter()
            .find_map(|e| match e {
                TransportEvent::DataChannelMessage(data) => Some(data),
                _ => None,
            })
            .expect("frame delivered");
        assert_eq!(&received[..], b"ping");
        drain(&mut a_events);
    }

    #[tokio::test]
    async fn send_before_open_is_not_ready() {
        let ((a, _a_events), _b) = MockTransport::pair();
        let err = a.send(Bytes::from_static(b"early")).await.expect_err("not open");
        assert!(matches!(err, TransportError::NotReady));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_notifies_peer() {
        let ((a, _a_events), (b, mut b_events)) = MockTransport::pair_with_budget(0);
        a.close().await.expect("close");
        a.close().await.expect("close again");
        assert_eq!(a.connection_state(), PeerConnectionState::Closed);
        assert!(drain(&mut b_events).iter().any(|e| matches!(
            e,
            TransportEvent::ConnectionStateChanged(PeerConnectionState::Disconnected)
        )));
        assert_eq!(b.connection_state(), PeerConnectionState::Disconnected);
    }
}
