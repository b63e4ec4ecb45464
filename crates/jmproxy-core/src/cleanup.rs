use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use jmproxy_common::GlobalConfig;
use jmproxy_protocol::upstream::SessionId;

use crate::gateway::SessionGateway;
use crate::session::{SessionState, record_transition};

/// Session ids that must never be deleted (heartbeat, fixed session).
#[derive(Debug, Default)]
pub struct ProtectedSessions {
    ids: ArcSwap<Vec<SessionId>>,
}

impl ProtectedSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protect(&self, id: SessionId) {
        self.ids.rcu(|current| {
            let mut next = Vec::clone(current);
            if !next.contains(&id) {
                next.push(id.clone());
            }
            next
        });
    }

    pub fn is_protected(&self, id: &SessionId) -> bool {
        self.ids.load().iter().any(|protected| protected == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Queued,
    Protected,
    Disabled,
    QueueFull,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupCounters {
    pub scheduled: u64,
    pub protected: u64,
    pub deleted: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct CleanupStats {
    scheduled: AtomicU64,
    protected: AtomicU64,
    deleted: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl CleanupStats {
    fn snapshot(&self) -> CleanupCounters {
        CleanupCounters {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            protected: self.protected.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub grace: Duration,
    pub concurrency: usize,
    pub queue_capacity: usize,
}

impl CleanupConfig {
    pub fn from_global(global: &GlobalConfig) -> Self {
        Self {
            enabled: global.auto_delete,
            grace: global.delete_grace(),
            concurrency: global.cleanup_concurrency,
            queue_capacity: global.cleanup_queue_capacity,
        }
    }
}

/// Producer side of the deferred-deletion queue. Cheap to clone.
#[derive(Clone)]
pub struct CleanupQueue {
    tx: mpsc::Sender<SessionId>,
    enabled: bool,
    protected: Arc<ProtectedSessions>,
    stats: Arc<CleanupStats>,
}

impl CleanupQueue {
    /// Never blocks; a full queue drops the id and counts it.
    pub fn schedule(&self, id: SessionId) -> ScheduleOutcome {
        if self.skip_protected(&id) {
            return ScheduleOutcome::Protected;
        }
        if !self.enabled {
            return ScheduleOutcome::Disabled;
        }
        match self.tx.try_send(id) {
            Ok(()) => {
                self.stats.scheduled.fetch_add(1, Ordering::Relaxed);
                ScheduleOutcome::Queued
            }
            Err(mpsc::error::TrySendError::Full(id)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event = "session_delete_dropped", session_id = %id, reason = "queue_full");
                ScheduleOutcome::QueueFull
            }
            Err(mpsc::error::TrySendError::Closed(id)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event = "session_delete_dropped", session_id = %id, reason = "closed");
                ScheduleOutcome::Closed
            }
        }
    }

    /// Counts and logs a skipped deletion when `id` is protected.
    pub fn skip_protected(&self, id: &SessionId) -> bool {
        if !self.protected.is_protected(id) {
            return false;
        }
        self.stats.protected.fetch_add(1, Ordering::Relaxed);
        info!(event = "session_delete_skipped", session_id = %id, reason = "protected");
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn counters(&self) -> CleanupCounters {
        self.stats.snapshot()
    }
}

/// Consumer side: one worker running deletions as tracked tasks.
pub struct CleanupWorker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    stats: Arc<CleanupStats>,
}

impl CleanupWorker {
    /// Skips remaining grace delays, deletes everything still queued and
    /// waits for every in-flight deletion.
    pub async fn shutdown(self) -> CleanupCounters {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.handle.await {
            warn!(event = "cleanup_worker_join_failed", error = %err);
        }
        let counters = self.stats.snapshot();
        info!(
            event = "cleanup_drained",
            deleted = counters.deleted,
            failed = counters.failed,
            dropped = counters.dropped
        );
        counters
    }
}

pub fn spawn_cleanup(
    gateway: Arc<dyn SessionGateway>,
    config: CleanupConfig,
    protected: Arc<ProtectedSessions>,
) -> (CleanupQueue, CleanupWorker) {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stats = Arc::new(CleanupStats::default());

    let handle = tokio::spawn(run_worker(
        rx,
        shutdown_rx,
        gateway,
        config.clone(),
        protected.clone(),
        stats.clone(),
    ));

    let queue = CleanupQueue {
        tx,
        enabled: config.enabled,
        protected,
        stats: stats.clone(),
    };
    let worker = CleanupWorker {
        shutdown_tx,
        handle,
        stats,
    };
    (queue, worker)
}

async fn run_worker(
    mut rx: mpsc::Receiver<SessionId>,
    mut shutdown_rx: watch::Receiver<bool>,
    gateway: Arc<dyn SessionGateway>,
    config: CleanupConfig,
    protected: Arc<ProtectedSessions>,
    stats: Arc<CleanupStats>,
) {
    let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut tasks = JoinSet::new();
    let task_shutdown = shutdown_rx.clone();
    let spawn_delete = |tasks: &mut JoinSet<()>, id: SessionId| {
        tasks.spawn(delete_after_grace(
            id,
            gateway.clone(),
            permits.clone(),
            protected.clone(),
            stats.clone(),
            config.grace,
            task_shutdown.clone(),
        ));
    };

    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(id) => spawn_delete(&mut tasks, id),
                None => break,
            },
            _ = shutdown_rx.changed() => break,
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    rx.close();
    while let Some(id) = rx.recv().await {
        spawn_delete(&mut tasks, id);
    }
    while tasks.join_next().await.is_some() {}
}

async fn delete_after_grace(
    id: SessionId,
    gateway: Arc<dyn SessionGateway>,
    permits: Arc<Semaphore>,
    protected: Arc<ProtectedSessions>,
    stats: Arc<CleanupStats>,
    grace: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if !*shutdown_rx.borrow() {
        tokio::select! {
            _ = tokio::time::sleep(grace) => {}
            _ = shutdown_rx.changed() => {}
        }
    }

    let Ok(_permit) = permits.acquire_owned().await else {
        return;
    };

    // Protection may have been granted after the id was queued.
    if protected.is_protected(&id) {
        stats.protected.fetch_add(1, Ordering::Relaxed);
        info!(event = "session_delete_skipped", session_id = %id, reason = "protected");
        return;
    }

    match gateway.delete_session(&id).await {
        Ok(()) => {
            stats.deleted.fetch_add(1, Ordering::Relaxed);
            record_transition(&id, SessionState::PendingDeletion, SessionState::Deleted);
            info!(event = "session_deleted", session_id = %id);
        }
        Err(err) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(event = "session_delete_failed", session_id = %id, error = %err);
        }
    }
}
