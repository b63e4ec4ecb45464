use clap::Parser;

use jmproxy_common::{
    GlobalConfigError, GlobalConfigPatch, parse_bool_env_value, parse_env_value,
    parse_list_env_value, sanitize_optional_env_value,
};

/// Every flag falls back to its `JMPROXY_*` variable, then to the built-in default.
#[derive(Parser, Debug, Default)]
#[command(name = "jmproxy", version, about)]
pub(crate) struct Cli {
    #[arg(long, env = "JMPROXY_HOST")]
    pub(crate) host: Option<String>,
    #[arg(long, env = "JMPROXY_PORT")]
    pub(crate) port: Option<String>,
    /// Outbound proxy for backend calls.
    #[arg(long, env = "JMPROXY_PROXY")]
    pub(crate) proxy: Option<String>,
    #[arg(long, env = "JMPROXY_DATA_DIR")]
    pub(crate) data_dir: Option<String>,
    /// Dotenv file holding JM_TOKEN and SDP_SESSION.
    #[arg(long, env = "JMPROXY_ENV_FILE")]
    pub(crate) env_file: Option<String>,
    #[arg(long, env = "JMPROXY_CREDENTIAL_POLL_SECS")]
    pub(crate) credential_poll_secs: Option<String>,

    #[arg(long, env = "JMPROXY_SAVE_SESSION_URL")]
    pub(crate) save_session_url: Option<String>,
    #[arg(long, env = "JMPROXY_DELETE_SESSION_URL")]
    pub(crate) delete_session_url: Option<String>,
    #[arg(long, env = "JMPROXY_COMPLETIONS_URL")]
    pub(crate) completions_url: Option<String>,
    #[arg(long, env = "JMPROXY_CONNECT_TIMEOUT_SECS")]
    pub(crate) connect_timeout_secs: Option<String>,
    #[arg(long, env = "JMPROXY_REQUEST_TIMEOUT_SECS")]
    pub(crate) request_timeout_secs: Option<String>,
    #[arg(long, env = "JMPROXY_STREAM_IDLE_TIMEOUT_SECS")]
    pub(crate) stream_idle_timeout_secs: Option<String>,
    /// Minimum gap between configuring a session and sending its prompt.
    #[arg(long, env = "JMPROXY_PACING_DELAY_MS")]
    pub(crate) pacing_delay_ms: Option<String>,
    #[arg(long, env = "JMPROXY_TRUNCATION_CEILING")]
    pub(crate) truncation_ceiling: Option<String>,

    #[arg(long, env = "JMPROXY_AUTO_DELETE")]
    pub(crate) auto_delete: Option<String>,
    #[arg(long, env = "JMPROXY_DELETE_GRACE_MS")]
    pub(crate) delete_grace_ms: Option<String>,
    #[arg(long, env = "JMPROXY_CLEANUP_CONCURRENCY")]
    pub(crate) cleanup_concurrency: Option<String>,
    #[arg(long, env = "JMPROXY_CLEANUP_QUEUE_CAPACITY")]
    pub(crate) cleanup_queue_capacity: Option<String>,

    #[arg(long, env = "JMPROXY_HEARTBEAT_ENABLED")]
    pub(crate) heartbeat_enabled: Option<String>,
    #[arg(long, env = "JMPROXY_HEARTBEAT_IDLE_SECS")]
    pub(crate) heartbeat_idle_secs: Option<String>,
    #[arg(long, env = "JMPROXY_HEARTBEAT_CHECK_SECS")]
    pub(crate) heartbeat_check_secs: Option<String>,
    #[arg(long, env = "JMPROXY_HEARTBEAT_SESSION_NAME")]
    pub(crate) heartbeat_session_name: Option<String>,
    #[arg(long, env = "JMPROXY_HEARTBEAT_MODEL")]
    pub(crate) heartbeat_model: Option<String>,

    /// pool, per-request or fixed.
    #[arg(long, env = "JMPROXY_SESSION_STRATEGY")]
    pub(crate) session_strategy: Option<String>,
    #[arg(long, env = "JMPROXY_FIXED_SESSION_ID")]
    pub(crate) fixed_session_id: Option<String>,
    #[arg(long, env = "JMPROXY_POOL_CAPACITY")]
    pub(crate) pool_capacity: Option<String>,
    #[arg(long, env = "JMPROXY_POOL_ACQUIRE_TIMEOUT_MS")]
    pub(crate) pool_acquire_timeout_ms: Option<String>,

    /// Comma-separated model ids advertised on /v1/models.
    #[arg(long, env = "JMPROXY_MODELS")]
    pub(crate) models: Option<String>,
    #[arg(long, env = "JMPROXY_MODELS_OWNED_BY")]
    pub(crate) models_owned_by: Option<String>,
    #[arg(long, env = "JMPROXY_DEFAULT_MODEL")]
    pub(crate) default_model: Option<String>,
}

impl Cli {
    pub(crate) fn into_patch(self) -> Result<GlobalConfigPatch, GlobalConfigError> {
        Ok(GlobalConfigPatch {
            host: sanitize_optional_env_value(self.host),
            port: parse_env_value(self.port, "port")?,
            proxy: sanitize_optional_env_value(self.proxy),
            data_dir: sanitize_optional_env_value(self.data_dir),
            env_file: sanitize_optional_env_value(self.env_file),
            credential_poll_secs: parse_env_value(self.credential_poll_secs, "credential_poll_secs")?,
            save_session_url: sanitize_optional_env_value(self.save_session_url),
            delete_session_url: sanitize_optional_env_value(self.delete_session_url),
            completions_url: sanitize_optional_env_value(self.completions_url),
            connect_timeout_secs: parse_env_value(self.connect_timeout_secs, "connect_timeout_secs")?,
            request_timeout_secs: parse_env_value(self.request_timeout_secs, "request_timeout_secs")?,
            stream_idle_timeout_secs: parse_env_value(
                self.stream_idle_timeout_secs,
                "stream_idle_timeout_secs",
            )?,
            pacing_delay_ms: parse_env_value(self.pacing_delay_ms, "pacing_delay_ms")?,
            truncation_ceiling: parse_env_value(self.truncation_ceiling, "truncation_ceiling")?,
            auto_delete: parse_bool_env_value(self.auto_delete, "auto_delete")?,
            delete_grace_ms: parse_env_value(self.delete_grace_ms, "delete_grace_ms")?,
            cleanup_concurrency: parse_env_value(self.cleanup_concurrency, "cleanup_concurrency")?,
            cleanup_queue_capacity: parse_env_value(
                self.cleanup_queue_capacity,
                "cleanup_queue_capacity",
            )?,
            heartbeat_enabled: parse_bool_env_value(self.heartbeat_enabled, "heartbeat_enabled")?,
            heartbeat_idle_secs: parse_env_value(self.heartbeat_idle_secs, "heartbeat_idle_secs")?,
            heartbeat_check_secs: parse_env_value(self.heartbeat_check_secs, "heartbeat_check_secs")?,
            heartbeat_session_name: sanitize_optional_env_value(self.heartbeat_session_name),
            heartbeat_model: sanitize_optional_env_value(self.heartbeat_model),
            session_strategy: parse_env_value(self.session_strategy, "session_strategy")?,
            fixed_session_id: sanitize_optional_env_value(self.fixed_session_id),
            pool_capacity: parse_env_value(self.pool_capacity, "pool_capacity")?,
            pool_acquire_timeout_ms: parse_env_value(
                self.pool_acquire_timeout_ms,
                "pool_acquire_timeout_ms",
            )?,
            models: parse_list_env_value(self.models),
            models_owned_by: sanitize_optional_env_value(self.models_owned_by),
            default_model: sanitize_optional_env_value(self.default_model),
        })
    }
}
