//! Signaling relay sub-protocol carried inside the data channel.
//!
//! Every data-channel frame is JSON. Signaling frames carry a boolean
//! `signal` discriminator plus a `type` tag; everything else is an opaque
//! application frame. The split happens exactly once, here, so nothing
//! deeper in the stack branches on ad hoc marker fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use paircast_token::CandidateInit;

/// Internal handshake-completion message, never surfaced to application
/// handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingEnvelope {
    Answer {
        sdp: String,
    },
    IceCandidate {
        #[serde(flatten)]
        candidate: CandidateInit,
    },
}

/// One decoded data-channel frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelFrame {
    Signal(SignalingEnvelope),
    Application(Value),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    NotJson(serde_json::Error),
    #[error("malformed signaling frame: {0}")]
    BadSignal(serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct SignalFrame {
    signal: bool,
    #[serde(flatten)]
    envelope: SignalingEnvelope,
}

/// Decodes one raw frame into the signaling/application sum type.
pub fn decode_frame(raw: &[u8]) -> Result<ChannelFrame, FrameError> {
    let value: Value = serde_json::from_slice(raw).map_err(FrameError::NotJson)?;
    if value.get("signal").and_then(Value::as_bool).unwrap_or(false) {
        let frame: SignalFrame = serde_json::from_value(value).map_err(FrameError::BadSignal)?;
        Ok(ChannelFrame::Signal(frame.envelope))
    } else {
        Ok(ChannelFrame::Application(value))
    }
}

/// Encodes one signaling envelope into its wire frame.
pub fn encode_signal(envelope: &SignalingEnvelope) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&SignalFrame {
        signal: true,
        envelope: envelope.clone(),
    })
}
