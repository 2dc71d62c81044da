use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

/// Current wall-clock instant as unix epoch milliseconds.
pub fn now_ms() -> u64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description: type tag plus the opaque SDP text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One ICE candidate descriptor as exchanged during the handshake.
///
/// `sdp_mid = None` encodes as a zero-length mid on the wire; the transport
/// engine always assigns a mid, so an empty-but-present mid does not occur.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: u16,
}

/// Token metadata: creation instant, connection identifier, trickle flag and
/// an open extension map.
///
/// The extension map only travels on the legacy JSON form; the binary layout
/// has no slot for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenMetadata {
    #[serde(rename = "createdAt")]
    pub created_at_ms: u64,
    #[serde(rename = "connectionId")]
    pub connection_id: String,
    #[serde(rename = "trickleIce", default)]
    pub trickle_ice: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl TokenMetadata {
    pub fn new(connection_id: impl Into<String>, trickle_ice: bool) -> Self {
        Self {
            created_at_ms: now_ms(),
            connection_id: connection_id.into(),
            trickle_ice,
            extensions: BTreeMap::new(),
        }
    }

    /// Returns `Ok(())` if the token is no older than `max_age`.
    ///
    /// A creation instant in the future (clock skew between the two devices)
    /// counts as fresh.
    pub fn ensure_fresh(&self, now_ms: u64, max_age: Duration) -> Result<(), TokenValidationError> {
        let age_ms = now_ms.saturating_sub(self.created_at_ms);
        let max_ms = max_age.whole_milliseconds().max(0) as u64;
        if age_ms > max_ms {
            Err(TokenValidationError::Expired {
                age_ms,
                max_age_ms: max_ms,
            })
        } else {
            Ok(())
        }
    }
}

/// The handshake seed: offer, optional embedded candidates, metadata.
///
/// Created once by the initiating side per handshake attempt and never
/// mutated or reused afterwards. When `metadata.trickle_ice` is set the
/// candidate list must be empty; the codec encodes whatever it is given and
/// the state machine upholds the invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootstrapToken {
    pub offer: SessionDescription,
    #[serde(rename = "iceCandidates", default)]
    pub ice_candidates: Vec<CandidateInit>,
    pub metadata: TokenMetadata,
}

impl BootstrapToken {
    pub fn new(
        offer: SessionDescription,
        ice_candidates: Vec<CandidateInit>,
        metadata: TokenMetadata,
    ) -> Self {
        Self {
            offer,
            ice_candidates,
            metadata,
        }
    }

    pub fn is_trickle(&self) -> bool {
        self.metadata.trickle_ice
    }
}

/// Errors returned while validating a decoded token.
#[derive(Debug, Error)]
pub enum TokenValidationError {
    #[error("token expired: {age_ms}ms old, max age {max_age_ms}ms")]
    Expired { age_ms: u64, max_age_ms: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_accepts_recent_and_future_tokens() {
        let mut meta = TokenMetadata::new("conn-1", false);
        meta.created_at_ms = 10_000;
        assert!(meta.ensure_fresh(10_500, Duration::seconds(5)).is_ok());
        // Future creation instant: clock skew, still fresh.
        assert!(meta.ensure_fresh(9_000, Duration::seconds(5)).is_ok());
    }

    #[test]
    fn freshness_rejects_stale_tokens() {
        let mut meta = TokenMetadata::new("conn-1", false);
        meta.created_at_ms = 10_000;
        let err = meta
            .ensure_fresh(20_001, Duration::seconds(10))
            .expect_err("stale token");
        assert!(matches!(err, TokenValidationError::Expired { .. }));
    }

    #[test]
    fn legacy_json_field_names_round_trip() {
        let token = BootstrapToken::new(
            SessionDescription::offer("v=0\r\n"),
            vec![CandidateInit {
                candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: 0,
            }],
            TokenMetadata::new("conn-legacy", false),
        );
        let json = serde_json::to_string(&token).expect("serialize");
        assert!(json.contains("\"iceCandidates\""));
        assert!(json.contains("\"sdpMid\""));
        assert!(json.contains("\"sdpMLineIndex\""));
        assert!(json.contains("\"trickleIce\""));
        let back: BootstrapToken = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(token, back);
    }
}
