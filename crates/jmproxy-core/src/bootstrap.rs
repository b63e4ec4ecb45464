use std::sync::Arc;

use axum::Router;
use time::OffsetDateTime;
use tracing::{info, warn};

use jmproxy_common::{GlobalConfig, SessionStrategyKind};
use jmproxy_protocol::upstream::SessionId;
use jmproxy_transform::PromptCompiler;

use crate::cleanup::{CleanupConfig, CleanupCounters, CleanupWorker, ProtectedSessions, spawn_cleanup};
use crate::core::{Core, CoreState, ModelCatalog};
use crate::credential::{
    CredentialProvider, CredentialStore, CredentialWatcher, EnvFileSource, refresh,
};
use crate::gateway::{GatewayConfig, SessionGateway, SessionSpec, WreqGateway};
use crate::heartbeat::{
    HeartbeatConfig, HeartbeatHandle, HeartbeatScheduler, HeartbeatState, HeartbeatStore,
};
use crate::pool::SessionPool;
use crate::strategy::SessionStrategy;

const STANDBY_SESSION_NAME: &str = "jmproxy standby";

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("build upstream client: {0}")]
    Client(#[from] wreq::Error),
    #[error("fixed session strategy needs fixed_session_id")]
    MissingFixedSession,
}

/// Everything the server needs, wired from one `GlobalConfig`.
pub struct Runtime {
    core: Core,
    pool: Option<Arc<SessionPool>>,
    cleanup: CleanupWorker,
    heartbeat: Option<HeartbeatHandle>,
    credential_watcher: Option<CredentialWatcher>,
    config: GlobalConfig,
}

impl Runtime {
    /// Loads credentials from the env file and talks to the real backend.
    pub async fn start(config: GlobalConfig) -> Result<Self, RuntimeError> {
        let store = Arc::new(CredentialStore::default());
        let source = EnvFileSource::new(&config.env_file);
        if !refresh(&store, &source) {
            warn!(
                event = "credentials_missing",
                path = %source.path().display(),
                "JM_TOKEN or SDP_SESSION not found; requests will be rejected until they appear"
            );
        }
        let watcher = CredentialWatcher::spawn(store.clone(), source, config.credential_poll());

        let credentials: Arc<dyn CredentialProvider> = store;
        let gateway: Arc<dyn SessionGateway> = Arc::new(WreqGateway::new(
            GatewayConfig::from_global(&config),
            credentials.clone(),
        )?);

        let mut runtime = Self::with_gateway(config, gateway, credentials)?;
        runtime.credential_watcher = Some(watcher);
        Ok(runtime)
    }

    /// Wires the runtime around an arbitrary gateway and credential source.
    /// Must be called inside a tokio runtime.
    pub fn with_gateway(
        config: GlobalConfig,
        gateway: Arc<dyn SessionGateway>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, RuntimeError> {
        let protected = Arc::new(ProtectedSessions::new());
        let (cleanup_queue, cleanup) = spawn_cleanup(
            gateway.clone(),
            CleanupConfig::from_global(&config),
            protected.clone(),
        );

        let strategy = match config.session_strategy {
            SessionStrategyKind::Pool => {
                let pool = SessionPool::new(
                    config.pool_capacity,
                    SessionSpec::new(STANDBY_SESSION_NAME, &config.default_model),
                    gateway.clone(),
                    cleanup_queue.clone(),
                );
                if credentials.current().is_some() {
                    pool.prefill();
                }
                SessionStrategy::Pool {
                    pool,
                    acquire_timeout: config.pool_acquire_timeout(),
                }
            }
            SessionStrategyKind::PerRequest => SessionStrategy::PerRequest,
            SessionStrategyKind::Fixed => {
                let id = config
                    .fixed_session_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(SessionId::new)
                    .ok_or(RuntimeError::MissingFixedSession)?;
                protected.protect(id.clone());
                SessionStrategy::Fixed(id)
            }
        };
        let pool = strategy.pool().cloned();

        let heartbeat_state = Arc::new(HeartbeatState::from_global(&config));
        let heartbeat = config.heartbeat_enabled.then(|| {
            HeartbeatScheduler::new(
                heartbeat_state.clone(),
                gateway.clone(),
                HeartbeatStore::in_data_dir(&config.data_dir),
                protected.clone(),
                HeartbeatConfig::from_global(&config),
            )
            .spawn()
        });

        let core = Core::new(CoreState {
            gateway,
            credentials,
            strategy,
            cleanup: cleanup_queue,
            heartbeat: heartbeat_state,
            compiler: PromptCompiler::new(config.truncation_ceiling),
            catalog: ModelCatalog::from_global(&config, OffsetDateTime::now_utc().unix_timestamp()),
            pacing_delay: config.pacing_delay(),
        });

        info!(
            event = "runtime_started",
            strategy = %config.session_strategy,
            pool_capacity = config.pool_capacity,
            auto_delete = config.auto_delete,
            heartbeat = config.heartbeat_enabled,
            models = config.models.len()
        );

        Ok(Self {
            core,
            pool,
            cleanup,
            heartbeat,
            credential_watcher: None,
            config,
        })
    }

    pub fn router(&self) -> Router {
        self.core.router()
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    /// Stops the heartbeat, hands Standby sessions to cleanup, drains the
    /// cleanup queue and stops the credential watcher, in that order.
    pub async fn shutdown(self) -> CleanupCounters {
        if let Some(heartbeat) = self.heartbeat {
            heartbeat.shutdown().await;
        }
        if let Some(pool) = &self.pool {
            let cleanup = self.core.state().cleanup.clone();
            for id in pool.drain(self.config.pool_acquire_timeout()).await {
                cleanup.schedule(id);
            }
        }
        let counters = self.cleanup.shutdown().await;
        if let Some(watcher) = self.credential_watcher {
            watcher.shutdown().await;
        }
        info!(event = "runtime_stopped");
        counters
    }
}
