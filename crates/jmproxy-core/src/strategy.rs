use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use jmproxy_common::SessionStrategyKind;
use jmproxy_protocol::upstream::SessionId;

use crate::cleanup::{CleanupQueue, ScheduleOutcome};
use crate::error::ClaimError;
use crate::gateway::{SessionGateway, SessionSpec};
use crate::pool::SessionPool;
use crate::session::{SessionState, TrackedSession};

/// How a request obtains its configured session.
#[derive(Clone)]
pub enum SessionStrategy {
    Pool {
        pool: Arc<SessionPool>,
        acquire_timeout: Duration,
    },
    PerRequest,
    Fixed(SessionId),
}

impl SessionStrategy {
    pub fn kind(&self) -> SessionStrategyKind {
        match self {
            SessionStrategy::Pool { .. } => SessionStrategyKind::Pool,
            SessionStrategy::PerRequest => SessionStrategyKind::PerRequest,
            SessionStrategy::Fixed(_) => SessionStrategyKind::Fixed,
        }
    }

    pub fn pool(&self) -> Option<&Arc<SessionPool>> {
        match self {
            SessionStrategy::Pool { pool, .. } => Some(pool),
            _ => None,
        }
    }

    /// Returns a session already saved with `spec`'s name and parameters.
    pub async fn claim(
        &self,
        gateway: &dyn SessionGateway,
        spec: &SessionSpec,
        cleanup: &CleanupQueue,
    ) -> Result<SessionLease, ClaimError> {
        match self {
            SessionStrategy::Pool {
                pool,
                acquire_timeout,
            } => {
                let id = pool.acquire(*acquire_timeout).await?;
                pool.replenish();
                let mut session = TrackedSession::new(id, SessionState::Claimed);
                let _ = session.advance(SessionState::Configuring);
                if let Err(err) = gateway.save_session(spec, Some(session.id())).await {
                    let _ = session.advance(SessionState::Standby);
                    pool.release(session.id().clone());
                    return Err(err.into());
                }
                Ok(SessionLease::new(session, Disposition::Delete, cleanup.clone()))
            }
            SessionStrategy::PerRequest => {
                // Creation already carries this request's name and parameters.
                let id = gateway.save_session(spec, None).await?;
                let mut session = TrackedSession::new(id, SessionState::Provisioning);
                let _ = session.advance(SessionState::Configuring);
                Ok(SessionLease::new(session, Disposition::Delete, cleanup.clone()))
            }
            SessionStrategy::Fixed(id) => {
                let mut session = TrackedSession::new(id.clone(), SessionState::Claimed);
                let _ = session.advance(SessionState::Configuring);
                if let Err(err) = gateway.save_session(spec, Some(session.id())).await {
                    let _ = session.advance(SessionState::Standby);
                    return Err(err.into());
                }
                Ok(SessionLease::new(session, Disposition::Keep, cleanup.clone()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Delete,
    Keep,
}

/// A configured session held by one request.
///
/// Releasing the lease (explicitly or on drop) ends the request's hold:
/// deletable sessions move to PendingDeletion and are handed to the cleanup
/// queue, kept and protected ones go back to Standby. Release it only after
/// the stream has fully terminated.
pub struct SessionLease {
    session: TrackedSession,
    disposition: Disposition,
    cleanup: CleanupQueue,
    released: bool,
}

impl SessionLease {
    fn new(session: TrackedSession, disposition: Disposition, cleanup: CleanupQueue) -> Self {
        Self {
            session,
            disposition,
            cleanup,
            released: false,
        }
    }

    pub fn id(&self) -> &SessionId {
        self.session.id()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// The prompt was accepted and the completion stream is open.
    pub fn activate(&mut self) {
        let _ = self.session.advance(SessionState::Active);
    }

    /// Ends the hold now and returns the state the session was left in.
    pub fn release(mut self) -> SessionState {
        self.finish()
    }

    fn finish(&mut self) -> SessionState {
        if std::mem::replace(&mut self.released, true) {
            return self.session.state();
        }
        let id = self.session.id().clone();
        if self.disposition == Disposition::Keep {
            let _ = self.session.advance(SessionState::Standby);
            return self.session.state();
        }
        // The heartbeat session never enters PendingDeletion.
        if self.cleanup.skip_protected(&id) {
            let _ = self.session.advance(SessionState::Standby);
            return self.session.state();
        }
        if !self.cleanup.is_enabled() {
            info!(event = "session_retained", session_id = %id, reason = "auto_delete_disabled");
            return self.session.state();
        }
        let _ = self.session.advance(SessionState::PendingDeletion);
        let outcome = self.cleanup.schedule(id.clone());
        debug!(event = "session_released", session_id = %id, outcome = ?outcome);
        if outcome == ScheduleOutcome::Queued {
            info!(event = "session_delete_scheduled", session_id = %id);
        }
        self.session.state()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.finish();
    }
}
