use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;
use tracing::{debug, warn};
use wreq::header::{ACCEPT, CONTENT_TYPE, ORIGIN, REFERER, USER_AGENT};
use wreq::{Client, Proxy};

use jmproxy_common::GlobalConfig;
use jmproxy_protocol::upstream::{
    BackendEnvelope, CompletionRequest, DeleteSessionRequest, SessionId,
};

use super::{CompletionStream, SessionGateway, SessionSpec};
use crate::credential::{CredentialProvider, Credentials};
use crate::error::{GatewayError, TransportErrorKind};

const ACCEPT_VALUE: &str = "application/json, text/plain, */*";
const ORIGIN_VALUE: &str = "https://xipuai.xjtlu.edu.cn";
const REFERER_VALUE: &str = "https://xipuai.xjtlu.edu.cn/";
const USER_AGENT_VALUE: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36";
const JM_TOKEN_HEADER: &str = "jm-token";
const SDP_SESSION_HEADER: &str = "sdp-app-session";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub save_session_url: String,
    pub delete_session_url: String,
    pub completions_url: String,
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl GatewayConfig {
    pub fn from_global(global: &GlobalConfig) -> Self {
        Self {
            save_session_url: global.save_session_url.clone(),
            delete_session_url: global.delete_session_url.clone(),
            completions_url: global.completions_url.clone(),
            proxy: global.proxy.clone(),
            connect_timeout: Duration::from_secs(global.connect_timeout_secs),
            request_timeout: Duration::from_secs(global.request_timeout_secs),
            stream_idle_timeout: Duration::from_secs(global.stream_idle_timeout_secs),
        }
    }
}

/// `SessionGateway` over HTTP.
pub struct WreqGateway {
    config: GatewayConfig,
    client: Client,
    credentials: Arc<dyn CredentialProvider>,
}

impl WreqGateway {
    pub fn new(
        config: GatewayConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, wreq::Error> {
        let proxy = normalize_proxy(config.proxy.clone());
        let client = build_client(&config, proxy.as_deref())?;
        Ok(Self {
            config,
            client,
            credentials,
        })
    }

    fn credentials(&self) -> Result<Arc<Credentials>, GatewayError> {
        self.credentials
            .current()
            .ok_or(GatewayError::CredentialMissing)
    }

    fn post<T: Serialize>(
        &self,
        url: &str,
        body: &T,
        credentials: &Credentials,
    ) -> Result<wreq::RequestBuilder, GatewayError> {
        let body = serde_json::to_vec(body).map_err(|err| GatewayError::Decode(err.to_string()))?;
        Ok(self
            .client
            .post(url)
            .header(ACCEPT, ACCEPT_VALUE)
            .header(CONTENT_TYPE, "application/json")
            .header(ORIGIN, ORIGIN_VALUE)
            .header(REFERER, REFERER_VALUE)
            .header(USER_AGENT, USER_AGENT_VALUE)
            .header(JM_TOKEN_HEADER, credentials.jm_token.as_str())
            .header(SDP_SESSION_HEADER, credentials.sdp_session.as_str())
            .body(body))
    }

    async fn post_envelope<T: Serialize>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<BackendEnvelope, GatewayError> {
        let credentials = self.credentials()?;
        let resp = self
            .post(url, body, &credentials)?
            .send()
            .await
            .map_err(map_wreq_error)?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await.map_err(map_wreq_error)?;
        if !(200..300).contains(&status) {
            return Err(GatewayError::UpstreamStatus {
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        let envelope: BackendEnvelope = serde_json::from_slice(&bytes)
            .map_err(|err| GatewayError::Decode(format!("{err}: {}", String::from_utf8_lossy(&bytes))))?;
        if !envelope.is_ok() {
            return Err(GatewayError::BackendRejected {
                code: envelope.code,
                message: envelope.message().to_string(),
            });
        }
        Ok(envelope)
    }
}

fn normalize_proxy(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

fn build_client(config: &GatewayConfig, proxy: Option<&str>) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .read_timeout(config.stream_idle_timeout);

    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }

    builder.build()
}

#[async_trait]
impl SessionGateway for WreqGateway {
    async fn save_session(
        &self,
        spec: &SessionSpec,
        existing: Option<&SessionId>,
    ) -> Result<SessionId, GatewayError> {
        let body = spec.to_save_request(existing);
        let envelope = self
            .post_envelope(&self.config.save_session_url, &body)
            .await?;
        // Updates may answer without an id; the caller's id stays valid.
        match (envelope.session_id(), existing) {
            (Some(id), _) => Ok(id),
            (None, Some(existing)) => Ok(existing.clone()),
            (None, None) => Err(GatewayError::Decode(
                "session-save response carried no session id".to_string(),
            )),
        }
    }

    async fn delete_session(&self, id: &SessionId) -> Result<(), GatewayError> {
        let body = DeleteSessionRequest {
            ids: vec![id.clone()],
        };
        self.post_envelope(&self.config.delete_session_url, &body)
            .await?;
        Ok(())
    }

    async fn stream_completion(
        &self,
        prompt: &str,
        session_id: &SessionId,
    ) -> Result<CompletionStream, GatewayError> {
        let credentials = self.credentials()?;
        let body = CompletionRequest::new(prompt, session_id);
        let resp = self
            .post(&self.config.completions_url, &body, &credentials)?
            .send()
            .await
            .map_err(map_wreq_error)?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let bytes = resp.bytes().await.map_err(map_wreq_error)?;
            return Err(GatewayError::UpstreamStatus {
                status,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        Ok(convert_stream(resp, self.config.stream_idle_timeout))
    }
}

fn convert_stream(resp: wreq::Response, stream_idle_timeout: Duration) -> CompletionStream {
    let (tx, stream) = CompletionStream::channel(16);
    tokio::spawn(async move {
        let mut body = resp.bytes_stream();
        loop {
            let item: Result<Bytes, GatewayError> =
                match tokio::time::timeout(stream_idle_timeout, body.next()).await {
                    Err(_) => Err(GatewayError::Transport {
                        kind: TransportErrorKind::ReadTimeout,
                        message: format!(
                            "no data from backend for {}s",
                            stream_idle_timeout.as_secs()
                        ),
                    }),
                    Ok(None) => break,
                    Ok(Some(Ok(chunk))) => Ok(chunk),
                    Ok(Some(Err(err))) => Err(map_wreq_error(err)),
                };
            let failed = item.is_err();
            if let Err(err) = &item {
                warn!(event = "upstream_stream_failed", error = %err);
            }
            if tx.send(item).await.is_err() {
                debug!(event = "upstream_stream_abandoned");
                break;
            }
            if failed {
                break;
            }
        }
    });
    stream
}

fn map_wreq_error(err: wreq::Error) -> GatewayError {
    let kind = classify_wreq_error(&err);
    GatewayError::Transport {
        kind,
        message: err.to_string(),
    }
}

fn classify_wreq_error(err: &wreq::Error) -> TransportErrorKind {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        if message.contains("read") || message.contains("idle") {
            return TransportErrorKind::ReadTimeout;
        }
        return TransportErrorKind::Timeout;
    }
    if err.is_connect() {
        if message.contains("dns") || message.contains("resolve") {
            return TransportErrorKind::Dns;
        }
        if message.contains("tls") || message.contains("ssl") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }
    if err.is_connection_reset() {
        return TransportErrorKind::Connect;
    }
    if message.contains("tls") || message.contains("ssl") {
        return TransportErrorKind::Tls;
    }
    TransportErrorKind::Other
}
