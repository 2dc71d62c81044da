//! Bootstrap token types and codec for paircast handshakes.
//!
//! A [`BootstrapToken`] seeds one connection attempt: it carries the
//! initiator's offer, optionally a batch of pre-gathered ICE candidates, and
//! metadata (creation instant, connection id, trickle flag). Tokens are
//! encoded to a compact binary form for transmission; decoding falls back to
//! the legacy JSON form older senders still produce.

pub mod token;
pub mod wire;

pub use token::{
    BootstrapToken, CandidateInit, SdpKind, SessionDescription, TokenMetadata,
    TokenValidationError, now_ms,
};
pub use wire::{TokenDecodeError, TokenEncodeError, decode_token, encode_token};
