//! Binary codec for [`BootstrapToken`].
//!
//! Layout (fixed order, no field names on the wire):
//! version(1) · flags(1, bit0 = trickle) · timestamp(8 BE) ·
//! connId-len(1) + connId · sdp-len(2 BE) + sdp · candidate-count(1) ·
//! per candidate: cand-len(2 BE) + cand · mid-len(1) + mid · mline(2 BE).
//!
//! Decoding tries this form first and falls back to the legacy JSON form
//! before declaring failure.

use crate::token::{BootstrapToken, CandidateInit, SessionDescription, TokenMetadata};
use std::collections::BTreeMap;

pub const TOKEN_WIRE_VERSION: u8 = 1;

const FLAG_TRICKLE: u8 = 0b0000_0001;

const MAX_CONN_ID_LEN: usize = u8::MAX as usize;
const MAX_SDP_LEN: usize = u16::MAX as usize;
const MAX_CANDIDATE_LEN: usize = u16::MAX as usize;
const MAX_MID_LEN: usize = u8::MAX as usize;
const MAX_CANDIDATES: usize = u8::MAX as usize;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenDecodeError {
    #[error("unsupported token version: {0}")]
    UnsupportedVersion(u8),
    #[error("truncated token")]
    Truncated,
    #[error("malformed token: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenEncodeError {
    #[error("{field} is {len} bytes, exceeds wire capacity of {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("too many candidates: {0}, wire capacity is {MAX_CANDIDATES}")]
    TooManyCandidates(usize),
    #[error("token offer must not be empty")]
    EmptyOffer,
}

/// Encodes a token to its binary wire form.
///
/// Oversized variable-length fields are a hard error, never truncated. The
/// trickle/empty-candidates invariant is not enforced here; the token is
/// encoded faithfully.
pub fn encode_token(token: &BootstrapToken) -> Result<Vec<u8>, TokenEncodeError> {
    if token.offer.sdp.is_empty() {
        return Err(TokenEncodeError::EmptyOffer);
    }
    check_len("connection id", token.metadata.connection_id.len(), MAX_CONN_ID_LEN)?;
    check_len("offer sdp", token.offer.sdp.len(), MAX_SDP_LEN)?;
    if token.ice_candidates.len() > MAX_CANDIDATES {
        return Err(TokenEncodeError::TooManyCandidates(token.ice_candidates.len()));
    }
    for candidate in &token.ice_candidates {
        check_len("candidate", candidate.candidate.len(), MAX_CANDIDATE_LEN)?;
        if let Some(mid) = &candidate.sdp_mid {
            check_len("candidate mid", mid.len(), MAX_MID_LEN)?;
        }
    }

    let mut buf = Vec::with_capacity(16 + token.offer.sdp.len());
    buf.push(TOKEN_WIRE_VERSION);
    buf.push(if token.metadata.trickle_ice { FLAG_TRICKLE } else { 0 });
    buf.extend_from_slice(&token.metadata.created_at_ms.to_be_bytes());
    buf.push(token.metadata.connection_id.len() as u8);
    buf.extend_from_slice(token.metadata.connection_id.as_bytes());
    buf.extend_from_slice(&(token.offer.sdp.len() as u16).to_be_bytes());
    buf.extend_from_slice(token.offer.sdp.as_bytes());
    buf.push(token.ice_candidates.len() as u8);
    for candidate in &token.ice_candidates {
        buf.extend_from_slice(&(candidate.candidate.len() as u16).to_be_bytes());
        buf.extend_from_slice(candidate.candidate.as_bytes());
        let mid = candidate.sdp_mid.as_deref().unwrap_or("");
        buf.push(mid.len() as u8);
        buf.extend_from_slice(mid.as_bytes());
        buf.extend_from_slice(&candidate.sdp_mline_index.to_be_bytes());
    }
    Ok(buf)
}

/// Decodes a token, trying the binary form first and the legacy JSON form
/// second.
///
/// The legacy fallback only engages when the input cannot be binary at all
/// (empty, or an unrecognized leading version byte); a recognized binary
/// token that fails mid-decode reports its own error.
pub fn decode_token(bytes: &[u8]) -> Result<BootstrapToken, TokenDecodeError> {
    match bytes.first() {
        Some(&TOKEN_WIRE_VERSION) => decode_binary(bytes),
        Some(&version) => decode_legacy(bytes).map_err(|_| TokenDecodeError::UnsupportedVersion(version)),
        None => Err(TokenDecodeError::Truncated),
    }
}

fn decode_binary(bytes: &[u8]) -> Result<BootstrapToken, TokenDecodeError> {
    let mut cursor = Cursor::new(bytes);
    let version = cursor.read_u8()?;
    if version != TOKEN_WIRE_VERSION {
        return Err(TokenDecodeError::UnsupportedVersion(version));
    }
    let flags = cursor.read_u8()?;
    let created_at_ms = cursor.read_u64()?;
    let conn_id_len = cursor.read_u8()? as usize;
    let connection_id = cursor.read_string(conn_id_len)?;
    let sdp_len = cursor.read_u16()? as usize;
    if sdp_len == 0 {
        return Err(TokenDecodeError::Malformed("empty offer"));
    }
    let sdp = cursor.read_string(sdp_len)?;
    let candidate_count = cursor.read_u8()? as usize;
    let mut ice_candidates = Vec::with_capacity(candidate_count);
    for _ in 0..candidate_count {
        let cand_len = cursor.read_u16()? as usize;
        let candidate = cursor.read_string(cand_len)?;
        let mid_len = cursor.read_u8()? as usize;
        let mid = cursor.read_string(mid_len)?;
        let sdp_mline_index = cursor.read_u16()?;
        ice_candidates.push(CandidateInit {
            candidate,
            sdp_mid: if mid.is_empty() { None } else { Some(mid) },
            sdp_mline_index,
        });
    }
    Ok(BootstrapToken {
        offer: SessionDescription::offer(sdp),
        ice_candidates,
        metadata: TokenMetadata {
            created_at_ms,
            connection_id,
            trickle_ice: flags & FLAG_TRICKLE != 0,
            extensions: BTreeMap::new(),
        },
    })
}

fn decode_legacy(bytes: &[u8]) -> Result<BootstrapToken, TokenDecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| TokenDecodeError::Malformed("invalid utf-8"))?;
    let token: BootstrapToken =
        serde_json::from_str(text).map_err(|_| TokenDecodeError::Malformed("invalid legacy token"))?;
    if token.offer.sdp.is_empty() {
        return Err(TokenDecodeError::Malformed("empty offer"));
    }
    Ok(token)
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<(), TokenEncodeError> {
    if len > max {
        Err(TokenEncodeError::FieldTooLong { field, len, max })
    } else {
        Ok(())
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, TokenDecodeError> {
        if self.pos >= self.bytes.len() {
            return Err(TokenDecodeError::Truncated);
        }
        let value = self.bytes[self.pos];
        self.pos += 1;
        Ok(value)
    }

    fn read_u16(&mut self) -> Result<u16, TokenDecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u64(&mut self) -> Result<u64, TokenDecodeError> {
        let bytes = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], TokenDecodeError> {
        if self.pos + len > self.bytes.len() {
            return Err(TokenDecodeError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_string(&mut self, len: usize) -> Result<String, TokenDecodeError> {
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(|s| s.to_string())
            .map_err(|_| TokenDecodeError::Malformed("invalid utf-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::SdpKind;

    fn sample_token(trickle: bool, candidates: Vec<CandidateInit>) -> BootstrapToken {
        let mut metadata = TokenMetadata::new("conn-abc123", trickle);
        metadata.created_at_ms = 1_722_000_000_123;
        BootstrapToken::new(
            SessionDescription::offer("v=0\r\no=- 46117 2 IN IP4 127.0.0.1\r\ns=-\r\n"),
            candidates,
            metadata,
        )
    }

    fn sample_candidate(index: u16) -> CandidateInit {
        CandidateInit {
            candidate: format!("candidate:{index} 1 udp 2130706431 192.0.2.{index} 54321 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: index,
        }
    }

    #[test]
    fn round_trip_without_candidates() {
        let token = sample_token(true, Vec::new());
        let encoded = encode_token(&token).expect("encode");
        let decoded = decode_token(&encoded).expect("decode");
        assert_eq!(token, decoded);
        assert!(decoded.is_trickle());
    }

    #[test]
    fn round_trip_with_candidates() {
        let token = sample_token(false, vec![sample_candidate(1), sample_candidate(2)]);
        let encoded = encode_token(&token).expect("encode");
        let decoded = decode_token(&encoded).expect("decode");
        assert_eq!(token, decoded);
        assert_eq!(decoded.offer.kind, SdpKind::Offer);
    }

    #[test]
    fn round_trip_none_mid() {
        let mut token = sample_token(false, vec![sample_candidate(1)]);
        token.ice_candidates[0].sdp_mid = None;
        let encoded = encode_token(&token).expect("encode");
        let decoded = decode_token(&encoded).expect("decode");
        assert_eq!(token, decoded);
    }

    #[test]
    fn round_trip_max_length_fields() {
        let mut token = sample_token(false, Vec::new());
        token.metadata.connection_id = "c".repeat(MAX_CONN_ID_LEN);
        token.offer.sdp = "s".repeat(MAX_SDP_LEN);
        token.ice_candidates.push(CandidateInit {
            candidate: "a".repeat(MAX_CANDIDATE_LEN),
            sdp_mid: Some("m".repeat(MAX_MID_LEN)),
            sdp_mline_index: u16::MAX,
        });
        let encoded = encode_token(&token).expect("encode");
        let decoded = decode_token(&encoded).expect("decode");
        assert_eq!(token, decoded);
    }

    #[test]
    fn encode_rejects_oversized_sdp() {
        let mut token = sample_token(false, Vec::new());
        token.offer.sdp = "s".repeat(MAX_SDP_LEN + 1);
        let err = encode_token(&token).expect_err("oversized sdp");
        assert_eq!(
            err,
            TokenEncodeError::FieldTooLong {
                field: "offer sdp",
                len: MAX_SDP_LEN + 1,
                max: MAX_SDP_LEN,
            }
        );
    }

    #[test]
    fn encode_rejects_oversized_candidate() {
        let mut token = sample_token(false, vec![sample_candidate(1)]);
        token.ice_candidates[0].candidate = "a".repeat(MAX_CANDIDATE_LEN + 1);
        assert!(matches!(
            encode_token(&token),
            Err(TokenEncodeError::FieldTooLong { field: "candidate", .. })
        ));
    }

    #[test]
    fn encode_rejects_empty_offer() {
        let mut token = sample_token(false, Vec::new());
        token.offer.sdp.clear();
        assert_eq!(encode_token(&token), Err(TokenEncodeError::EmptyOffer));
    }

    #[test]
    fn encode_keeps_trickle_candidate_combination_faithful() {
        // Contract violation by the caller; the codec still encodes it as-is.
        let token = sample_token(true, vec![sample_candidate(7)]);
        let encoded = encode_token(&token).expect("encode");
        let decoded = decode_token(&encoded).expect("decode");
        assert!(decoded.is_trickle());
        assert_eq!(decoded.ice_candidates.len(), 1);
    }

    #[test]
    fn decode_rejects_unknown_version() {
        let token = sample_token(false, Vec::new());
        let mut encoded = encode_token(&token).expect("encode");
        encoded[0] = 9;
        assert_eq!(
            decode_token(&encoded),
            Err(TokenDecodeError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let token = sample_token(false, vec![sample_candidate(1)]);
        let encoded = encode_token(&token).expect("encode");
        for cut in [1usize, 2, 10, encoded.len() / 2, encoded.len() - 1] {
            assert_eq!(
                decode_token(&encoded[..cut]),
                Err(TokenDecodeError::Truncated),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn decode_rejects_declared_length_past_end() {
        let token = sample_token(false, Vec::new());
        let mut encoded = encode_token(&token).expect("encode");
        // Inflate the sdp length prefix past the actual payload.
        let sdp_len_at = 1 + 1 + 8 + 1 + token.metadata.connection_id.len();
        encoded[sdp_len_at] = 0xFF;
        encoded[sdp_len_at + 1] = 0xFF;
        assert_eq!(decode_token(&encoded), Err(TokenDecodeError::Truncated));
    }

    #[test]
    fn decode_rejects_invalid_utf8() {
        let token = sample_token(false, Vec::new());
        let mut encoded = encode_token(&token).expect("encode");
        let sdp_at = 1 + 1 + 8 + 1 + token.metadata.connection_id.len() + 2;
        encoded[sdp_at] = 0xFF;
        encoded[sdp_at + 1] = 0xFE;
        assert_eq!(
            decode_token(&encoded),
            Err(TokenDecodeError::Malformed("invalid utf-8"))
        );
    }

    #[test]
    fn decode_falls_back_to_legacy_json() {
        let json = r#"{
            "offer": {"type": "offer", "sdp": "v=0\r\n"},
            "iceCandidates": [
                {"candidate": "candidate:1 1 udp 1 192.0.2.1 1 typ host", "sdpMid": "0", "sdpMLineIndex": 0}
            ],
            "metadata": {"createdAt": 1722000000123, "connectionId": "legacy-1", "trickleIce": false}
        }"#;
        let decoded = decode_token(json.as_bytes()).expect("legacy decode");
        assert_eq!(decoded.metadata.connection_id, "legacy-1");
        assert_eq!(decoded.ice_candidates.len(), 1);
        assert!(!decoded.is_trickle());
    }

    #[test]
    fn legacy_fallback_still_reports_unknown_version() {
        // Not JSON and not version 1: the binary error wins.
        let bytes = [42u8, 0, 0, 0];
        assert_eq!(
            decode_token(&bytes),
            Err(TokenDecodeError::UnsupportedVersion(42))
        );
    }

    #[test]
    fn legacy_extension_map_survives_json_round_trip() {
        let mut token = sample_token(false, Vec::new());
        token
            .metadata
            .extensions
            .insert("displayName".into(), serde_json::json!("till"));
        let json = serde_json::to_vec(&token).expect("serialize");
        let decoded = decode_token(&json).expect("legacy decode");
        assert_eq!(decoded.metadata.extensions, token.metadata.extensions);
    }
}
