use std::fmt;

use jmproxy_protocol::upstream::SessionId;
use tracing::{debug, warn};

/// Lifecycle of one backend session.
///
/// ```text
/// Provisioning -> Standby -> Claimed -> Configuring -> Active -> PendingDeletion -> Deleted
///                    ^                      |            |
///                    +----------------------+------------+   (configure failure / protected id)
///
/// HeartbeatStandby <-> Configuring                            (heartbeat session only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Provisioning,
    Standby,
    Claimed,
    Configuring,
    Active,
    PendingDeletion,
    Deleted,
    HeartbeatStandby,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Provisioning => "provisioning",
            SessionState::Standby => "standby",
            SessionState::Claimed => "claimed",
            SessionState::Configuring => "configuring",
            SessionState::Active => "active",
            SessionState::PendingDeletion => "pending_deletion",
            SessionState::Deleted => "deleted",
            SessionState::HeartbeatStandby => "heartbeat_standby",
        }
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Provisioning, Standby)
                | (Provisioning, Configuring)
                | (Provisioning, HeartbeatStandby)
                | (Standby, Claimed)
                | (Claimed, Configuring)
                | (Configuring, Standby)
                | (Configuring, Active)
                | (Configuring, PendingDeletion)
                | (Configuring, HeartbeatStandby)
                | (HeartbeatStandby, Configuring)
                | (Active, PendingDeletion)
                | (Active, Standby)
                | (PendingDeletion, Deleted)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("session {id}: illegal transition {from} -> {to}")]
pub struct InvalidTransition {
    pub id: SessionId,
    pub from: SessionState,
    pub to: SessionState,
}

/// Logs a transition for a session whose state is held elsewhere (pool, cleanup queue).
pub fn record_transition(id: &SessionId, from: SessionState, to: SessionState) {
    if from.can_transition_to(to) {
        debug!(event = "session_transition", session_id = %id, from = %from, to = %to);
    } else {
        warn!(event = "session_transition_invalid", session_id = %id, from = %from, to = %to);
    }
}

/// A session id together with the state its current owner holds it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedSession {
    id: SessionId,
    state: SessionState,
}

impl TrackedSession {
    pub fn new(id: SessionId, state: SessionState) -> Self {
        Self { id, state }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn advance(&mut self, next: SessionState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        record_transition(&self.id, self.state, next);
        self.state = next;
        Ok(())
    }
}
