//! Initiator/responder assignment without a coordinator

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use peerlink_signaling::UserId;

use crate::error::{Error, Result};

/// Which side of the pair originates offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initiator => f.write_str("initiator"),
            Self::Responder => f.write_str("responder"),
        }
    }
}

/// The participant whose id sorts first is the Initiator.
///
/// Both sides evaluate this independently and always agree. Equal ids have no
/// valid assignment and yield a protocol error.
pub fn resolve_role(local: &UserId, remote: &UserId) -> Result<Role> {
    match local.cmp(remote) {
        Ordering::Less => Ok(Role::Initiator),
        Ordering::Greater => Ok(Role::Responder),
        Ordering::Equal => Err(Error::Protocol(format!(
            "cannot resolve role: local and remote id are both {local}"
        ))),
    }
}
