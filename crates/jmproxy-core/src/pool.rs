use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use jmproxy_protocol::upstream::SessionId;

use crate::cleanup::CleanupQueue;
use crate::error::PoolError;
use crate::gateway::{SessionGateway, SessionSpec};
use crate::session::{SessionState, record_transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub standby: usize,
    pub provisioning: usize,
    pub capacity: usize,
}

#[derive(Debug, Default)]
struct Slots {
    standby: VecDeque<SessionId>,
    provisioning: usize,
    closed: bool,
}

/// Bounded FIFO of pre-created Standby sessions.
///
/// `standby.len() <= capacity` always holds; replenishment only starts while
/// `standby + provisioning < capacity`. A session that finds the pool full
/// (or closed) when it arrives is handed to the cleanup queue.
pub struct SessionPool {
    slots: Mutex<Slots>,
    notify: Notify,
    capacity: usize,
    template: SessionSpec,
    gateway: Arc<dyn SessionGateway>,
    cleanup: CleanupQueue,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionPool {
    /// `template` is the name/model new sessions are created with; each
    /// request renames them when it claims one.
    pub fn new(
        capacity: usize,
        template: SessionSpec,
        gateway: Arc<dyn SessionGateway>,
        cleanup: CleanupQueue,
    ) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(Slots::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            template,
            gateway,
            cleanup,
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PoolStats {
        let slots = self.slots();
        PoolStats {
            standby: slots.standby.len(),
            provisioning: slots.provisioning,
            capacity: self.capacity,
        }
    }

    /// Takes one Standby session, waiting at most `timeout` for one to arrive.
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<SessionId, PoolError> {
        let deadline = Instant::now() + timeout;
        // At most one creation per call; a failing backend is not retried here.
        let mut kicked = false;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let idle = {
                let mut slots = self.slots();
                if let Some(id) = slots.standby.pop_front() {
                    drop(slots);
                    record_transition(&id, SessionState::Standby, SessionState::Claimed);
                    return Ok(id);
                }
                slots.provisioning == 0
            };
            if idle && !kicked {
                // Nothing in flight would ever wake us.
                kicked = self.replenish();
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(event = "pool_exhausted", waited_ms = timeout.as_millis() as u64);
                return Err(PoolError::PoolExhausted { waited: timeout });
            }
        }
    }

    /// Returns a claimed session whose configuration failed.
    pub fn release(&self, id: SessionId) {
        let accepted = {
            let mut slots = self.slots();
            if !slots.closed && slots.standby.len() < self.capacity {
                slots.standby.push_back(id.clone());
                true
            } else {
                false
            }
        };
        if accepted {
            debug!(event = "pool_released", session_id = %id);
            self.notify.notify_one();
        } else {
            self.cleanup.schedule(id);
        }
    }

    /// Starts creating one session in the background if there is room.
    /// Returns whether a creation was started.
    pub fn replenish(self: &Arc<Self>) -> bool {
        {
            let mut slots = self.slots();
            if slots.closed || slots.standby.len() + slots.provisioning >= self.capacity {
                return false;
            }
            slots.provisioning += 1;
        }

        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let created = pool.gateway.save_session(&pool.template, None).await;
            pool.finish_provisioning(created.map_err(|err| err.to_string()));
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        true
    }

    fn finish_provisioning(&self, created: Result<SessionId, String>) {
        let id = {
            let mut slots = self.slots();
            slots.provisioning = slots.provisioning.saturating_sub(1);
            match created {
                Ok(id) => {
                    if !slots.closed && slots.standby.len() < self.capacity {
                        slots.standby.push_back(id.clone());
                        drop(slots);
                        record_transition(&id, SessionState::Provisioning, SessionState::Standby);
                        info!(event = "pool_replenished", session_id = %id);
                        self.notify.notify_one();
                        return;
                    }
                    id
                }
                Err(err) => {
                    drop(slots);
                    warn!(event = "pool_replenish_failed", error = %err);
                    // Only a waiter that has not kicked a creation yet starts another.
                    self.notify.notify_one();
                    return;
                }
            }
        };
        debug!(event = "pool_overflow", session_id = %id);
        self.cleanup.schedule(id);
    }

    /// Fills the pool up to capacity in the background.
    pub fn prefill(self: &Arc<Self>) {
        while self.replenish() {}
    }

    /// Closes the pool, waits (bounded) for in-flight creations and returns
    /// every Standby id. Sessions created after this point go to cleanup.
    pub async fn drain(&self, wait: Duration) -> Vec<SessionId> {
        self.slots().closed = true;

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if tokio::time::timeout(wait, task).await.is_err() {
                warn!(event = "pool_drain_timeout");
            }
        }

        let drained: Vec<SessionId> = self.slots().standby.drain(..).collect();
        info!(event = "pool_drained", sessions = drained.len());
        drained
    }
}
