mod store;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use serde::Serialize;
use time::OffsetDateTime;
use time::macros::format_description;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use jmproxy_common::GlobalConfig;
use jmproxy_protocol::upstream::SessionId;

use crate::cleanup::ProtectedSessions;
use crate::error::GatewayError;
use crate::gateway::{SessionGateway, SessionSpec};
use crate::session::{SessionState, TrackedSession};

pub use store::{HEARTBEAT_FILE, HeartbeatStore, HeartbeatStoreError};

/// Outcome of the most recent heartbeat call; doubles as the credential
/// validity signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatReport {
    pub ok: bool,
    /// Unix seconds.
    pub at: i64,
    pub error: Option<String>,
}

/// Shared between the request handler (activity) and the scheduler.
#[derive(Debug)]
pub struct HeartbeatState {
    enabled: bool,
    idle_threshold: Duration,
    check_interval: Duration,
    base: Instant,
    last_activity_ms: AtomicU64,
    session_id: ArcSwapOption<SessionId>,
    last_report: ArcSwapOption<HeartbeatReport>,
}

impl HeartbeatState {
    pub fn new(enabled: bool, idle_threshold: Duration, check_interval: Duration) -> Self {
        Self {
            enabled,
            idle_threshold,
            check_interval,
            base: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            session_id: ArcSwapOption::empty(),
            last_report: ArcSwapOption::empty(),
        }
    }

    pub fn from_global(global: &GlobalConfig) -> Self {
        Self::new(
            global.heartbeat_enabled,
            global.heartbeat_idle(),
            global.heartbeat_check(),
        )
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Records caller activity now.
    pub fn touch(&self) {
        let now = self.base.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.base.elapsed().saturating_sub(last)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.load_full().map(|id| SessionId::clone(&id))
    }

    pub fn set_session_id(&self, id: SessionId) {
        self.session_id.store(Some(Arc::new(id)));
    }

    pub fn last_report(&self) -> Option<HeartbeatReport> {
        self.last_report.load_full().map(|report| HeartbeatReport::clone(&report))
    }

    fn record(&self, report: HeartbeatReport) {
        self.last_report.store(Some(Arc::new(report)));
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub session_name: String,
    pub model: String,
}

impl HeartbeatConfig {
    pub fn from_global(global: &GlobalConfig) -> Self {
        Self {
            session_name: global.heartbeat_session_name.clone(),
            model: global.heartbeat_model.clone(),
        }
    }
}

/// Background loop keeping the heartbeat session warm during idle periods.
pub struct HeartbeatScheduler {
    state: Arc<HeartbeatState>,
    gateway: Arc<dyn SessionGateway>,
    store: HeartbeatStore,
    protected: Arc<ProtectedSessions>,
    config: HeartbeatConfig,
}

impl HeartbeatScheduler {
    pub fn new(
        state: Arc<HeartbeatState>,
        gateway: Arc<dyn SessionGateway>,
        store: HeartbeatStore,
        protected: Arc<ProtectedSessions>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            state,
            gateway,
            store,
            protected,
            config,
        }
    }

    pub fn spawn(self) -> HeartbeatHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(shutdown_rx));
        HeartbeatHandle {
            shutdown_tx,
            handle,
        }
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            event = "heartbeat_started",
            idle_threshold_secs = self.state.idle_threshold().as_secs(),
            check_interval_secs = self.state.check_interval().as_secs()
        );

        // Shutdown also cancels an in-flight backend call.
        tokio::select! {
            _ = self.cycle() => {}
            _ = shutdown_rx.changed() => {}
        }
        info!(event = "heartbeat_stopped");
    }

    async fn cycle(&self) {
        let check = self.state.check_interval();
        let mut session = self.resolve().await;
        let mut ticker = tokio::time::interval_at(Instant::now() + check, check);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            if session.is_none() {
                session = self.resolve().await;
            }
            let Some(tracked) = session.as_mut() else {
                continue;
            };
            if self.state.idle_for() < self.state.idle_threshold() {
                continue;
            }

            self.beat(tracked).await;
            // One call per threshold crossing, successful or not.
            self.state.touch();
        }
    }

    /// Reuses the persisted session or creates and persists a new one.
    async fn resolve(&self) -> Option<TrackedSession> {
        let persisted = match self.store.load().await {
            Ok(id) => id,
            Err(err) => {
                warn!(event = "heartbeat_store_failed", error = %err);
                None
            }
        };

        let id = match persisted {
            Some(id) => id,
            None => {
                let spec = SessionSpec::new(&self.config.session_name, &self.config.model);
                match self.gateway.save_session(&spec, None).await {
                    Ok(id) => {
                        if let Err(err) = self.store.save(&id).await {
                            warn!(event = "heartbeat_store_failed", error = %err);
                        }
                        info!(event = "heartbeat_session_created", session_id = %id);
                        id
                    }
                    Err(err) => {
                        warn!(event = "heartbeat_session_unavailable", error = %err);
                        self.report(Err(&err));
                        return None;
                    }
                }
            }
        };

        self.protected.protect(id.clone());
        self.state.set_session_id(id.clone());
        info!(event = "heartbeat_session_ready", session_id = %id);
        Some(TrackedSession::new(id, SessionState::HeartbeatStandby))
    }

    async fn beat(&self, session: &mut TrackedSession) {
        let _ = session.advance(SessionState::Configuring);
        let spec = SessionSpec::new(
            format!("{} (Last Check: {})", self.config.session_name, clock_label()),
            &self.config.model,
        );
        let result = self
            .gateway
            .save_session(&spec, Some(session.id()))
            .await
            .map(|_| ());
        let _ = session.advance(SessionState::HeartbeatStandby);

        match &result {
            Ok(()) => info!(event = "heartbeat_sent", session_id = %session.id()),
            Err(err) => warn!(event = "heartbeat_failed", session_id = %session.id(), error = %err),
        }
        self.report(result.as_ref().map(|_| ()));
    }

    fn report(&self, result: Result<(), &GatewayError>) {
        self.state.record(HeartbeatReport {
            ok: result.is_ok(),
            at: OffsetDateTime::now_utc().unix_timestamp(),
            error: result.err().map(|err| err.to_string()),
        });
    }
}

fn clock_label() -> String {
    let format = format_description!("[hour]:[minute]:[second]");
    OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| "--:--:--".to_string())
}

pub struct HeartbeatHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Signals the loop and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.handle.await {
            warn!(event = "heartbeat_join_failed", error = %err);
        }
    }
}
