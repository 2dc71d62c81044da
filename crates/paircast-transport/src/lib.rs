//! Peer transport capability interface.
//!
//! The connection state machine consumes the transport engine through the
//! [`PeerTransport`] trait plus an event stream, never through the engine's
//! own types. Two implementations ship here: [`webrtc::WebRtcTransport`]
//! over the `webrtc` crate, and [`mock::MockTransport`] as a deterministic
//! in-memory pair for tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use paircast_token::{CandidateInit, SessionDescription};

pub mod mock;
pub mod webrtc;

/// Connection-level state reported by the underlying engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events emitted by a transport instance over its event channel.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Local ICE gathering produced a candidate.
    LocalCandidate(CandidateInit),
    /// Local ICE gathering finished.
    GatheringComplete,
    ConnectionStateChanged(PeerConnectionState),
    /// The remote side announced a data channel (responder path).
    IncomingDataChannel { label: String },
    DataChannelOpen { label: String },
    DataChannelClosed,
    DataChannelMessage(Bytes),
}

/// Receiving half of a transport's event channel.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport engine error: {0}")]
    Engine(String),
    #[error("data channel is not open")]
    NotReady,
    #[error("data channel closed")]
    ChannelClosed,
    #[error("transport closed")]
    Closed,
}

/// Capability interface over one peer-connection attempt.
///
/// One instance owns exactly one peer connection and at most one data
/// channel. All methods are safe to call from any task; event delivery is
/// serialized through the single event channel handed out at construction.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), TransportError>;
    /// Creates the application data channel. Must be called before the offer
    /// so the channel is announced in it.
    async fn create_data_channel(&self, label: &str) -> Result<(), TransportError>;
    /// Sends one frame over the open data channel.
    async fn send(&self, payload: Bytes) -> Result<(), TransportError>;
    fn connection_state(&self) -> PeerConnectionState;
    /// Closes the data channel and the peer connection. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Mints one fresh transport per connection attempt.
///
/// The orchestrator goes through this seam so retry attempts and tests can
/// control what engine backs each session.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError>;
}
