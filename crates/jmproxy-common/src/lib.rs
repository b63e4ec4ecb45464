use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SAVE_SESSION_URL: &str =
    "https://jmapi.xjtlu.edu.cn/api/chat/saveSession?sf_request_type=ajax";
pub const DEFAULT_DELETE_SESSION_URL: &str =
    "https://jmapi.xjtlu.edu.cn/api/chat/deleteSession?sf_request_type=ajax";
pub const DEFAULT_COMPLETIONS_URL: &str =
    "https://jmapi.xjtlu.edu.cn/api/chat/completions?sf_request_type=fetch";
pub const DEFAULT_MODELS: &[&str] = &["qwen-2.5-72b", "deepseek-v3", "deepseek-r1"];

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
    #[error("invalid global config: {0}")]
    Invalid(String),
    #[error("invalid {name} value: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// How the request handler obtains a backend session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStrategyKind {
    /// Pre-created sessions handed out from the session pool.
    #[default]
    Pool,
    /// A fresh session per request, created with the request's parameters.
    PerRequest,
    /// One configured session reused by every request.
    Fixed,
}

impl SessionStrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStrategyKind::Pool => "pool",
            SessionStrategyKind::PerRequest => "per-request",
            SessionStrategyKind::Fixed => "fixed",
        }
    }
}

impl fmt::Display for SessionStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStrategyKind {
    type Err = GlobalConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "pool" => Ok(SessionStrategyKind::Pool),
            "per-request" => Ok(SessionStrategyKind::PerRequest),
            "fixed" => Ok(SessionStrategyKind::Fixed),
            _ => Err(GlobalConfigError::InvalidValue {
                name: "session_strategy",
                value: value.to_string(),
            }),
        }
    }
}

/// Final, merged global configuration used by the running process.
///
/// Merge order: CLI > ENV > built-in defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    pub data_dir: String,
    /// Dotenv file holding `JM_TOKEN` / `SDP_SESSION`.
    pub env_file: String,
    pub credential_poll_secs: u64,

    pub save_session_url: String,
    pub delete_session_url: String,
    pub completions_url: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    /// Minimum gap between two backend calls of one request.
    pub pacing_delay_ms: u64,

    /// Per-message character ceiling before middle elision.
    pub truncation_ceiling: usize,

    pub auto_delete: bool,
    pub delete_grace_ms: u64,
    pub cleanup_concurrency: usize,
    pub cleanup_queue_capacity: usize,

    pub heartbeat_enabled: bool,
    pub heartbeat_idle_secs: u64,
    pub heartbeat_check_secs: u64,
    pub heartbeat_session_name: String,
    pub heartbeat_model: String,

    pub session_strategy: SessionStrategyKind,
    pub fixed_session_id: Option<String>,
    pub pool_capacity: usize,
    pub pool_acquire_timeout_ms: u64,

    /// Advertised model catalog, in order.
    pub models: Vec<String>,
    pub models_owned_by: String,
    pub default_model: String,
}

impl GlobalConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn pacing_delay(&self) -> Duration {
        Duration::from_millis(self.pacing_delay_ms)
    }

    pub fn delete_grace(&self) -> Duration {
        Duration::from_millis(self.delete_grace_ms)
    }

    pub fn pool_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_acquire_timeout_ms)
    }

    pub fn heartbeat_idle(&self) -> Duration {
        Duration::from_secs(self.heartbeat_idle_secs)
    }

    pub fn heartbeat_check(&self) -> Duration {
        Duration::from_secs(self.heartbeat_check_secs)
    }

    pub fn credential_poll(&self) -> Duration {
        Duration::from_secs(self.credential_poll_secs)
    }
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub proxy: Option<String>,
    pub data_dir: Option<String>,
    pub env_file: Option<String>,
    pub credential_poll_secs: Option<u64>,
    pub save_session_url: Option<String>,
    pub delete_session_url: Option<String>,
    pub completions_url: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub stream_idle_timeout_secs: Option<u64>,
    pub pacing_delay_ms: Option<u64>,
    pub truncation_ceiling: Option<usize>,
    pub auto_delete: Option<bool>,
    pub delete_grace_ms: Option<u64>,
    pub cleanup_concurrency: Option<usize>,
    pub cleanup_queue_capacity: Option<usize>,
    pub heartbeat_enabled: Option<bool>,
    pub heartbeat_idle_secs: Option<u64>,
    pub heartbeat_check_secs: Option<u64>,
    pub heartbeat_session_name: Option<String>,
    pub heartbeat_model: Option<String>,
    pub session_strategy: Option<SessionStrategyKind>,
    pub fixed_session_id: Option<String>,
    pub pool_capacity: Option<usize>,
    pub pool_acquire_timeout_ms: Option<u64>,
    pub models: Option<Vec<String>>,
    pub models_owned_by: Option<String>,
    pub default_model: Option<String>,
}

macro_rules! overlay_fields {
    ($target:expr, $other:expr, $($field:ident),+ $(,)?) => {
        $(
            if $other.$field.is_some() {
                $target.$field = $other.$field;
            }
        )+
    };
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        overlay_fields!(
            self,
            other,
            host,
            port,
            proxy,
            data_dir,
            env_file,
            credential_poll_secs,
            save_session_url,
            delete_session_url,
            completions_url,
            connect_timeout_secs,
            request_timeout_secs,
            stream_idle_timeout_secs,
            pacing_delay_ms,
            truncation_ceiling,
            auto_delete,
            delete_grace_ms,
            cleanup_concurrency,
            cleanup_queue_capacity,
            heartbeat_enabled,
            heartbeat_idle_secs,
            heartbeat_check_secs,
            heartbeat_session_name,
            heartbeat_model,
            session_strategy,
            fixed_session_id,
            pool_capacity,
            pool_acquire_timeout_ms,
            models,
            models_owned_by,
            default_model,
        );
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        let models = self
            .models
            .unwrap_or_else(|| DEFAULT_MODELS.iter().map(|m| m.to_string()).collect());
        let default_model = match self.default_model {
            Some(model) => model,
            None => models
                .first()
                .cloned()
                .ok_or(GlobalConfigError::MissingField("models"))?,
        };
        let session_strategy = self.session_strategy.unwrap_or_default();

        let config = GlobalConfig {
            host: self.host.unwrap_or_else(|| "127.0.0.1".to_string()),
            port: self.port.unwrap_or(8000),
            proxy: self.proxy,
            data_dir: self.data_dir.unwrap_or_else(|| "./data".to_string()),
            env_file: self.env_file.unwrap_or_else(|| ".env".to_string()),
            credential_poll_secs: self.credential_poll_secs.unwrap_or(5),
            save_session_url: self
                .save_session_url
                .unwrap_or_else(|| DEFAULT_SAVE_SESSION_URL.to_string()),
            delete_session_url: self
                .delete_session_url
                .unwrap_or_else(|| DEFAULT_DELETE_SESSION_URL.to_string()),
            completions_url: self
                .completions_url
                .unwrap_or_else(|| DEFAULT_COMPLETIONS_URL.to_string()),
            connect_timeout_secs: self.connect_timeout_secs.unwrap_or(10),
            request_timeout_secs: self.request_timeout_secs.unwrap_or(120),
            stream_idle_timeout_secs: self.stream_idle_timeout_secs.unwrap_or(60),
            pacing_delay_ms: self.pacing_delay_ms.unwrap_or(1000),
            truncation_ceiling: self.truncation_ceiling.unwrap_or(20_000),
            auto_delete: self.auto_delete.unwrap_or(true),
            delete_grace_ms: self.delete_grace_ms.unwrap_or(2000),
            cleanup_concurrency: self.cleanup_concurrency.unwrap_or(2),
            cleanup_queue_capacity: self.cleanup_queue_capacity.unwrap_or(256),
            heartbeat_enabled: self.heartbeat_enabled.unwrap_or(true),
            heartbeat_idle_secs: self.heartbeat_idle_secs.unwrap_or(600),
            heartbeat_check_secs: self.heartbeat_check_secs.unwrap_or(60),
            heartbeat_session_name: self
                .heartbeat_session_name
                .unwrap_or_else(|| "Persistent Heartbeat Session".to_string()),
            heartbeat_model: self
                .heartbeat_model
                .unwrap_or_else(|| "qwen-2.5-72b".to_string()),
            session_strategy,
            fixed_session_id: self.fixed_session_id,
            pool_capacity: self.pool_capacity.unwrap_or(1),
            pool_acquire_timeout_ms: self.pool_acquire_timeout_ms.unwrap_or(15_000),
            models,
            models_owned_by: self.models_owned_by.unwrap_or_else(|| "xjtlu".to_string()),
            default_model,
        };
        validate(&config)?;
        Ok(config)
    }
}

fn validate(config: &GlobalConfig) -> Result<(), GlobalConfigError> {
    let invalid = |msg: &str| Err(GlobalConfigError::Invalid(msg.to_string()));
    if config.models.is_empty() {
        return invalid("models must not be empty");
    }
    if config.pool_capacity == 0 {
        return invalid("pool_capacity must be at least 1");
    }
    if config.cleanup_concurrency == 0 {
        return invalid("cleanup_concurrency must be at least 1");
    }
    if config.cleanup_queue_capacity == 0 {
        return invalid("cleanup_queue_capacity must be at least 1");
    }
    if config.truncation_ceiling < 2 {
        return invalid("truncation_ceiling must be at least 2");
    }
    if config.credential_poll_secs == 0 {
        return invalid("credential_poll_secs must be positive");
    }
    if config.connect_timeout_secs == 0
        || config.request_timeout_secs == 0
        || config.stream_idle_timeout_secs == 0
    {
        return invalid("upstream timeouts must be positive");
    }
    if config.heartbeat_idle_secs == 0 || config.heartbeat_check_secs == 0 {
        return invalid("heartbeat_idle_secs and heartbeat_check_secs must be positive");
    }
    if config.heartbeat_check_secs >= config.heartbeat_idle_secs {
        return invalid("heartbeat_check_secs must be shorter than heartbeat_idle_secs");
    }
    if config.session_strategy == SessionStrategyKind::Fixed
        && config
            .fixed_session_id
            .as_deref()
            .is_none_or(|id| id.trim().is_empty())
    {
        return Err(GlobalConfigError::MissingField("fixed_session_id"));
    }
    Ok(())
}

/// Trims an env/CLI value; empty strings and unresolved `${VAR}` placeholders
/// count as unset.
pub fn sanitize_optional_env_value(value: Option<String>) -> Option<String> {
    let trimmed = value?.trim().to_string();
    if trimmed.is_empty() {
        return None;
    }
    // Some PaaS systems may inject unresolved placeholders like `${VAR}`.
    if trimmed.starts_with("${") && trimmed.ends_with('}') {
        return None;
    }
    Some(trimmed)
}

pub fn parse_bool_env_value(
    value: Option<String>,
    name: &'static str,
) -> Result<Option<bool>, GlobalConfigError> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    let parsed = match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => return Err(GlobalConfigError::InvalidValue { name, value: raw }),
    };
    Ok(Some(parsed))
}

pub fn parse_env_value<T: FromStr>(
    value: Option<String>,
    name: &'static str,
) -> Result<Option<T>, GlobalConfigError> {
    let Some(raw) = sanitize_optional_env_value(value) else {
        return Ok(None);
    };
    raw.parse::<T>()
        .map(Some)
        .map_err(|_| GlobalConfigError::InvalidValue { name, value: raw })
}

/// Comma-separated list; blank entries are dropped.
pub fn parse_list_env_value(value: Option<String>) -> Option<Vec<String>> {
    let raw = sanitize_optional_env_value(value)?;
    let items: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect();
    (!items.is_empty()).then_some(items)
}
