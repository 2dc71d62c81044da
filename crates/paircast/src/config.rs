//! Orchestrator configuration with environment overrides.

use std::time::Duration;

use crate::message::MessageLayerConfig;
use crate::session::SessionConfig;

const ENV_GATHERING_TIMEOUT_MS: &str = "PAIRCAST_GATHERING_TIMEOUT_MS";
const ENV_TOKEN_MAX_AGE_MS: &str = "PAIRCAST_TOKEN_MAX_AGE_MS";
const ENV_PUBLISH_TTL_SECS: &str = "PAIRCAST_PUBLISH_TTL_SECS";
const ENV_AUTO_RETRY: &str = "PAIRCAST_AUTO_RETRY";
const ENV_MAX_RETRIES: &str = "PAIRCAST_MAX_RETRIES";

pub const DEFAULT_TOKEN_MAX_AGE: time::Duration = time::Duration::minutes(5);
pub const DEFAULT_PUBLISH_TTL: Duration = Duration::from_secs(300);

/// Whether a retry attempt re-runs the bootstrap exchange by itself.
///
/// `Automatic` only applies to the remote-lookup path; a local-code
/// bootstrap has no transmission channel the orchestrator could re-use
/// unattended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBootstrap {
    Manual,
    Automatic,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub auto_retry: bool,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub rebootstrap: RetryBootstrap,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            auto_retry: false,
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            rebootstrap: RetryBootstrap::Manual,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given 1-based attempt, capped at
    /// `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exponent));
        delay.min(self.max_delay)
    }
}

#[derive(Clone)]
pub struct ManagerConfig {
    pub session: SessionConfig,
    pub messages: MessageLayerConfig,
    /// Maximum age a token may have when joining.
    pub token_max_age: time::Duration,
    /// TTL handed to the directory service on publish.
    pub publish_ttl: Duration,
    pub retry: RetryPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            messages: MessageLayerConfig::default(),
            token_max_age: DEFAULT_TOKEN_MAX_AGE,
            publish_ttl: DEFAULT_PUBLISH_TTL,
            retry: RetryPolicy::default(),
        }
    }
}

impl ManagerConfig {
    /// Defaults with `PAIRCAST_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = parse_u64_env(ENV_GATHERING_TIMEOUT_MS) {
            config.session.gathering_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64_env(ENV_TOKEN_MAX_AGE_MS) {
            config.token_max_age = time::Duration::milliseconds(ms as i64);
        }
        if let Some(secs) = parse_u64_env(ENV_PUBLISH_TTL_SECS) {
            config.publish_ttl = Duration::from_secs(secs);
        }
        if let Ok(value) = std::env::var(ENV_AUTO_RETRY) {
            config.retry.auto_retry = parse_flag(&value);
        }
        if let Some(count) = parse_u64_env(ENV_MAX_RETRIES) {
            config.retry.max_retries = count as u32;
        }
        config
    }
}

fn parse_u64_env(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(4), Duration::from_secs(8));
        assert_eq!(policy.backoff_delay(5), Duration::from_secs(10));
        assert_eq!(policy.backoff_delay(30), Duration::from_secs(10));
    }

    #[test]
    fn flag_parsing_accepts_common_truthy_values() {
        assert!(parse_flag("true"));
        assert!(parse_flag("YES"));
        assert!(parse_flag("1"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(""));
    }
}
