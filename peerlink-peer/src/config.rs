//! Session runtime configuration

use std::time::Duration;

use peerlink_core::resilience::retry::RetryPolicy;

use crate::recovery::RecoveryPolicy;

/// Timing and retry settings for one [`crate::Session`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Mailbox poll interval
    pub poll_interval: Duration,
    /// Delay before the Initiator offers after seeing the peer's join
    pub offer_delay: Duration,
    /// Retry policy for outbound signaling messages
    pub append_retry: RetryPolicy,
    /// Retry policy within one poll cycle; a cycle that still fails is skipped
    pub poll_retry: RetryPolicy,
    pub recovery: RecoveryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            offer_delay: Duration::from_millis(500),
            append_retry: RetryPolicy::default(),
            poll_retry: RetryPolicy {
                max_attempts: 2,
                min_delay: Duration::from_millis(100),
                max_delay: Duration::from_millis(200),
            },
            recovery: RecoveryPolicy::default(),
        }
    }
}

impl From<&peerlink_core::Config> for SessionConfig {
    fn from(config: &peerlink_core::Config) -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: config.signaling.poll_interval(),
            offer_delay: Duration::from_millis(config.negotiation.offer_delay_ms),
            append_retry: defaults
                .append_retry
                .with_max_attempts(config.signaling.append_max_attempts),
            poll_retry: defaults.poll_retry,
            recovery: RecoveryPolicy::from(&config.recovery),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_app_config() {
        let mut config = peerlink_core::Config::default();
        config.signaling.poll_interval_ms = 250;
        config.signaling.append_max_attempts = 5;
        config.negotiation.offer_delay_ms = 800;
        config.recovery.disconnected_grace_ms = 3000;

        let session = SessionConfig::from(&config);
        assert_eq!(session.poll_interval, Duration::from_millis(250));
        assert_eq!(session.offer_delay, Duration::from_millis(800));
        assert_eq!(session.append_retry.max_attempts, 5);
        assert_eq!(session.recovery.disconnected_grace, Duration::from_secs(3));
    }

    #[test]
    fn test_defaults_match_app_defaults() {
        let from_app = SessionConfig::from(&peerlink_core::Config::default());
        assert_eq!(from_app, SessionConfig::default());
    }
}
