//! Connectivity recovery policy
//!
//! The controller is a pure decision table over the ICE and connection state
//! axes. It never touches the peer connection; the session carries out the
//! returned [`RecoveryAction`] and reports timer expiry back.
//!
//! | Observed                    | Action                                                  |
//! |-----------------------------|---------------------------------------------------------|
//! | ICE `disconnected`          | one delayed check; still disconnected at expiry → restart |
//! | ICE `failed`                | ICE restart, or reinitialize once the restart budget is spent |
//! | connection `failed`         | reinitialize after a jittered backoff, or give up        |
//! | ICE `connected`/`completed` | reset all budgets                                        |

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::state::{ConnectionState, IceConnectionState};

/// Identifies one scheduled disconnected check
pub type CheckToken = u64;

/// Recovery limits and delays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// How long ICE may stay `disconnected` before an ICE restart
    pub disconnected_grace: Duration,
    /// Consecutive ICE restarts before escalating to reinitialization
    pub max_ice_restarts: usize,
    /// Consecutive reinitializations before the call is ended
    pub max_reinitializations: usize,
    pub reinit_min_delay: Duration,
    pub reinit_max_delay: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::from(&peerlink_core::config::RecoveryConfig::default())
    }
}

impl From<&peerlink_core::config::RecoveryConfig> for RecoveryPolicy {
    fn from(config: &peerlink_core::config::RecoveryConfig) -> Self {
        Self {
            disconnected_grace: Duration::from_millis(config.disconnected_grace_ms),
            max_ice_restarts: config.max_ice_restarts,
            max_reinitializations: config.max_reinitializations,
            reinit_min_delay: Duration::from_millis(config.reinit_min_delay_ms),
            reinit_max_delay: Duration::from_millis(config.reinit_max_delay_ms),
        }
    }
}

impl RecoveryPolicy {
    /// Jittered delays before each reinitialization attempt
    fn reinit_backoff(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.reinit_min_delay)
            .with_max_delay(self.reinit_max_delay)
            .with_max_times(self.max_reinitializations)
            .with_jitter()
            .build()
    }
}

/// What the session should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    None,
    /// Call [`RecoveryController::on_check_expired`] with `token` after `after`
    ScheduleCheck { token: CheckToken, after: Duration },
    /// Renegotiate with fresh ICE credentials
    RestartIce,
    /// Discard the peer connection, create a new one, and offer again after `after`
    Reinitialize { after: Duration },
    /// Budget exhausted; end the call
    GiveUp,
}

/// Tracks recovery budgets for one session
#[derive(Debug)]
pub struct RecoveryController {
    policy: RecoveryPolicy,
    ice: IceConnectionState,
    ice_restarts: usize,
    reinit_delays: Option<ExponentialBackoff>,
    next_token: CheckToken,
    pending_check: Option<CheckToken>,
}

impl RecoveryController {
    #[must_use]
    pub fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy,
            ice: IceConnectionState::New,
            ice_restarts: 0,
            reinit_delays: None,
            next_token: 0,
            pending_check: None,
        }
    }

    #[must_use]
    pub const fn ice_restarts(&self) -> usize {
        self.ice_restarts
    }

    #[must_use]
    pub const fn has_pending_check(&self) -> bool {
        self.pending_check.is_some()
    }

    pub fn on_ice_state(&mut self, state: IceConnectionState) -> RecoveryAction {
        self.ice = state;
        match state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                if self.ice_restarts > 0 || self.reinit_delays.is_some() {
                    info!(state = %state, "Connectivity restored, recovery budgets reset");
                }
                self.ice_restarts = 0;
                self.reinit_delays = None;
                self.pending_check = None;
                RecoveryAction::None
            }
            IceConnectionState::Disconnected => {
                if self.pending_check.is_some() {
                    return RecoveryAction::None;
                }
                self.next_token += 1;
                self.pending_check = Some(self.next_token);
                debug!(
                    grace = ?self.policy.disconnected_grace,
                    "ICE disconnected, scheduling check"
                );
                RecoveryAction::ScheduleCheck {
                    token: self.next_token,
                    after: self.policy.disconnected_grace,
                }
            }
            IceConnectionState::Failed => {
                self.pending_check = None;
                self.restart_or_escalate()
            }
            IceConnectionState::Closed => {
                self.pending_check = None;
                RecoveryAction::None
            }
            IceConnectionState::New | IceConnectionState::Checking => RecoveryAction::None,
        }
    }

    /// A scheduled disconnected check fired
    pub fn on_check_expired(&mut self, token: CheckToken) -> RecoveryAction {
        if self.pending_check != Some(token) {
            return RecoveryAction::None;
        }
        self.pending_check = None;
        if self.ice == IceConnectionState::Disconnected {
            info!("ICE still disconnected after grace period");
            self.restart_or_escalate()
        } else {
            RecoveryAction::None
        }
    }

    pub fn on_connection_state(&mut self, state: ConnectionState) -> RecoveryAction {
        match state {
            ConnectionState::Failed => {
                self.pending_check = None;
                self.reinitialize()
            }
            _ => RecoveryAction::None,
        }
    }

    /// The session replaced its peer connection; the reinitialization budget carries over
    pub fn reset_for_new_handle(&mut self) {
        self.ice = IceConnectionState::New;
        self.ice_restarts = 0;
        self.pending_check = None;
    }

    fn restart_or_escalate(&mut self) -> RecoveryAction {
        if self.ice_restarts < self.policy.max_ice_restarts {
            self.ice_restarts += 1;
            info!(
                attempt = self.ice_restarts,
                max = self.policy.max_ice_restarts,
                "Restarting ICE"
            );
            RecoveryAction::RestartIce
        } else {
            warn!("ICE restart budget exhausted, reinitializing peer connection");
            self.reinitialize()
        }
    }

    fn reinitialize(&mut self) -> RecoveryAction {
        let policy = self.policy;
        let delays = self
            .reinit_delays
            .get_or_insert_with(|| policy.reinit_backoff());
        match delays.next() {
            Some(after) => {
                info!(delay = ?after, "Reinitializing peer connection");
                RecoveryAction::Reinitialize { after }
            }
            None => {
                warn!("Reinitialization budget exhausted");
                RecoveryAction::GiveUp
            }
        }
    }
}
