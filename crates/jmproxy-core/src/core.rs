use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};

use jmproxy_common::GlobalConfig;
use jmproxy_transform::PromptCompiler;

use crate::cleanup::CleanupQueue;
use crate::credential::CredentialProvider;
use crate::gateway::SessionGateway;
use crate::handler::{chat_completions, heartbeat_status, list_models, root};
use crate::heartbeat::HeartbeatState;
use crate::strategy::SessionStrategy;

/// Advertised model list for `/v1/models`.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    pub models: Vec<String>,
    pub owned_by: String,
    pub default_model: String,
    /// Unix seconds reported as each model's `created`.
    pub created: i64,
}

impl ModelCatalog {
    pub fn from_global(global: &GlobalConfig, created: i64) -> Self {
        Self {
            models: global.models.clone(),
            owned_by: global.models_owned_by.clone(),
            default_model: global.default_model.clone(),
            created,
        }
    }
}

pub struct CoreState {
    pub gateway: Arc<dyn SessionGateway>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub strategy: SessionStrategy,
    pub cleanup: CleanupQueue,
    pub heartbeat: Arc<HeartbeatState>,
    pub compiler: PromptCompiler,
    pub catalog: ModelCatalog,
    pub pacing_delay: Duration,
}

pub struct Core {
    state: Arc<CoreState>,
}

impl Core {
    pub fn new(state: CoreState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(root))
            .route("/v1/models", get(list_models))
            .route("/v1/chat/completions", post(chat_completions))
            .route("/heartbeat/status", get(heartbeat_status))
            .with_state(self.state.clone())
    }

    pub fn state(&self) -> Arc<CoreState> {
        self.state.clone()
    }
}
