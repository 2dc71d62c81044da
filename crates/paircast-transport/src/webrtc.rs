//! `webrtc`-crate backed implementation of [`PeerTransport`].

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{RwLock as AsyncRwLock, mpsc};
use tracing::{debug, warn};

use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use paircast_token::{CandidateInit, SdpKind, SessionDescription};

use crate::{
    PeerConnectionState, PeerTransport, TransportError, TransportEvent, TransportEvents,
    TransportFactory,
};

const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
const ENV_LOCALHOST_ONLY: &str = "PAIRCAST_LOCALHOST_ONLY";

/// Configuration for the WebRTC-backed transport.
#[derive(Clone)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<RTCIceServer>,
    /// Whether the data channel should guarantee ordered delivery. The
    /// signaling relay depends on ordering, so this defaults to true.
    pub ordered: bool,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        let ice_servers = if std::env::var(ENV_LOCALHOST_ONLY).is_ok() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                ..Default::default()
            }]
        };
        Self {
            ice_servers,
            ordered: true,
        }
    }
}

impl WebRtcConfig {
    /// Configuration without any STUN/TURN servers (same-host testing).
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            ordered: true,
        }
    }
}

pub struct WebRtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    data_channel: Arc<AsyncRwLock<Option<Arc<RTCDataChannel>>>>,
    state: Arc<parking_lot::Mutex<PeerConnectionState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    ordered: bool,
}

impl WebRtcTransport {
    pub async fn new(config: WebRtcConfig) -> Result<(Arc<Self>, TransportEvents), TransportError> {
        let api = APIBuilder::new().build();
        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers,
            ..Default::default()
        };
        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(engine_err)?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(parking_lot::Mutex::new(PeerConnectionState::New));
        let data_channel = Arc::new(AsyncRwLock::new(None));

        let tx = events_tx.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(TransportEvent::LocalCandidate(CandidateInit {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                            }));
                        }
                        Err(err) => {
                            warn!(target: "paircast::transport", error = %err, "dropping unserializable candidate");
                        }
                    },
                    // End-of-candidates sentinel.
                    None => {
                        let _ = tx.send(TransportEvent::GatheringComplete);
                    }
                }
            })
        }));

        let tx = events_tx.clone();
        let state_for_cb = state.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |new_state: RTCPeerConnectionState| {
                let tx = tx.clone();
                let state = state_for_cb.clone();
                Box::pin(async move {
                    if let Some(mapped) = map_connection_state(new_state) {
                        *state.lock() = mapped;
                        let _ = tx.send(TransportEvent::ConnectionStateChanged(mapped));
                    }
                })
            },
        ));

        // Responder side: the initiator's channel arrives through the engine.
        let tx = events_tx.clone();
        let slot = data_channel.clone();
        peer_connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            let slot = slot.clone();
            Box::pin(async move {
                debug!(target: "paircast::transport", label = %dc.label(), "incoming data channel");
                let _ = tx.send(TransportEvent::IncomingDataChannel {
                    label: dc.label().to_string(),
                });
                attach_channel_handlers(&dc, tx.clone());
                *slot.write().await = Some(dc);
            })
        }));

        let transport = Arc::new(Self {
            peer_connection,
            data_channel,
            state,
            events: events_tx,
            ordered: config.ordered,
        });
        Ok((transport, events_rx))
    }
}

fn attach_channel_handlers(dc: &Arc<RTCDataChannel>, tx: mpsc::UnboundedSender<TransportEvent>) {
    let label = dc.label().to_string();
    let tx_open = tx.clone();
    dc.on_open(Box::new(move || {
        let tx = tx_open.clone();
        let label = label.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::DataChannelOpen { label });
        })
    }));

    let tx_close = tx.clone();
    dc.on_close(Box::new(move || {
        let tx = tx_close.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::DataChannelClosed);
        })
    }));

    dc.on_message(Box::new(move |message: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::DataChannelMessage(message.data));
        })
    }));
}

fn map_connection_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn engine_err(err: webrtc::Error) -> TransportError {
    TransportError::Engine(err.to_string())
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()).map_err(engine_err),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()).map_err(engine_err),
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(engine_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(engine_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let desc = to_rtc_description(&desc)?;
        self.peer_connection
            .set_local_description(desc)
            .await
            .map_err(engine_err)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let desc = to_rtc_description(&desc)?;
        self.peer_connection
            .set_remote_description(desc)
            .await
            .map_err(engine_err)
    }

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), TransportError> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: Some(candidate.sdp_mline_index),
                username_fragment: None,
            })
            .await
            .map_err(engine_err)
    }

    async fn create_data_channel(&self, label: &str) -> Result<(), TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(self.ordered),
            ..Default::default()
        };
        let dc = self
            .peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(engine_err)?;
        attach_channel_handlers(&dc, self.events.clone());
        *self.data_channel.write().await = Some(dc);
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        let guard = self.data_channel.read().await;
        let dc = guard.as_ref().ok_or(TransportError::NotReady)?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::NotReady);
        }
        dc.send(&payload).await.map_err(engine_err)?;
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        *self.state.lock()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(dc) = self.data_channel.write().await.take() {
            let _ = dc.close().await;
        }
        self.peer_connection.close().await.map_err(engine_err)?;
        *self.state.lock() = PeerConnectionState::Closed;
        Ok(())
    }
}

/// Factory handing out one fresh WebRTC transport per connection attempt.
pub struct WebRtcFactory {
    config: WebRtcConfig,
}

impl WebRtcFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(&self) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError> {
        let (transport, events) = WebRtcTransport::new(self.config.clone()).await?;
        let transport: Arc<dyn PeerTransport> = transport;
        Ok((transport, events))
    }
}
