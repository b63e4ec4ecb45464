use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::State;
use axum::http::HeaderValue;
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use http::StatusCode;
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use jmproxy_protocol::openai::chat_completions::ChatCompletionRequestBody;
use jmproxy_protocol::openai::error::ErrorResponse;
use jmproxy_protocol::openai::models::ListModelsResponse;
use jmproxy_protocol::sse::LineDecoder;
use jmproxy_transform::{ChatStreamTranslator, sse_json_bytes};

use crate::core::CoreState;
use crate::error::{GatewayError, ProxyError};
use crate::gateway::{CompletionStream, Pacer, SessionSpec};
use crate::strategy::SessionLease;

pub const REQUEST_ID_HEADER: &str = "x-jmproxy-request-id";

pub async fn root(State(state): State<Arc<CoreState>>) -> Response {
    json_response(
        StatusCode::OK,
        &json!({
            "message": "jmproxy is running",
            "status": "ok",
            "strategy": state.strategy.kind(),
        }),
    )
}

pub async fn list_models(State(state): State<Arc<CoreState>>) -> Response {
    let catalog = &state.catalog;
    let body = ListModelsResponse::from_catalog(&catalog.models, catalog.created, &catalog.owned_by);
    json_response(StatusCode::OK, &body)
}

#[derive(Debug, Serialize)]
struct HeartbeatStatus {
    enabled: bool,
    idle_threshold_secs: u64,
    check_interval_secs: u64,
    session_id: Option<String>,
    seconds_since_activity: u64,
    last_heartbeat: Option<crate::heartbeat::HeartbeatReport>,
    credentials_present: bool,
    pool: Option<crate::pool::PoolStats>,
    cleanup: crate::cleanup::CleanupCounters,
}

pub async fn heartbeat_status(State(state): State<Arc<CoreState>>) -> Response {
    let heartbeat = &state.heartbeat;
    let status = HeartbeatStatus {
        enabled: heartbeat.enabled(),
        idle_threshold_secs: heartbeat.idle_threshold().as_secs(),
        check_interval_secs: heartbeat.check_interval().as_secs(),
        session_id: heartbeat.session_id().map(|id| id.to_string()),
        seconds_since_activity: heartbeat.idle_for().as_secs(),
        last_heartbeat: heartbeat.last_report(),
        credentials_present: state.credentials.current().is_some(),
        pool: state.strategy.pool().map(|pool| pool.stats()),
        cleanup: state.cleanup.counters(),
    };
    json_response(StatusCode::OK, &status)
}

pub async fn chat_completions(State(state): State<Arc<CoreState>>, body: Bytes) -> Response {
    state.heartbeat.touch();
    let trace_id = Uuid::new_v4().to_string();
    let started_at = Instant::now();

    let request: ChatCompletionRequestBody = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return reject(
                &trace_id,
                started_at,
                ProxyError::bad_request(format!("Invalid JSON in request body: {err}")),
            );
        }
    };
    let Some(messages) = request.messages.as_deref() else {
        return reject(
            &trace_id,
            started_at,
            ProxyError::bad_request("'messages' is required"),
        );
    };
    let model = if request.model.trim().is_empty() {
        state.catalog.default_model.clone()
    } else {
        request.model.clone()
    };
    info!(
        event = "downstream_received",
        trace_id = %trace_id,
        model = %model,
        messages = messages.len(),
        strategy = %state.strategy.kind()
    );

    if state.credentials.current().is_none() {
        return reject(
            &trace_id,
            started_at,
            ProxyError::from(&GatewayError::CredentialMissing),
        );
    }

    let spec = session_spec(&trace_id, &model, &request);
    let mut lease = match state
        .strategy
        .claim(state.gateway.as_ref(), &spec, &state.cleanup)
        .await
    {
        Ok(lease) => lease,
        Err(err) => return reject(&trace_id, started_at, ProxyError::from(&err)),
    };
    let mut pacer = Pacer::new(state.pacing_delay);
    pacer.mark();
    debug!(event = "session_configured", trace_id = %trace_id, session_id = %lease.id());

    let prompt = state.compiler.compile(messages);
    pacer.wait().await;

    let upstream = match state.gateway.stream_completion(&prompt, lease.id()).await {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!(
                event = "upstream_stream_rejected",
                trace_id = %trace_id,
                session_id = %lease.id(),
                error = %err
            );
            lease.release();
            return reject(&trace_id, started_at, ProxyError::from(&err));
        }
    };
    lease.activate();

    let created = OffsetDateTime::now_utc().unix_timestamp();
    let translator = ChatStreamTranslator::new(format!("chatcmpl-{trace_id}"), model, created);
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(pump_stream(upstream, translator, lease, tx, trace_id.clone()));

    info!(
        event = "downstream_responded",
        trace_id = %trace_id,
        status = 200,
        elapsed_ms = started_at.elapsed().as_millis(),
        is_stream = true
    );
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    sse_response(Body::from_stream(stream), &trace_id)
}

fn session_spec(trace_id: &str, model: &str, request: &ChatCompletionRequestBody) -> SessionSpec {
    let short = trace_id.split('-').next().unwrap_or(trace_id);
    let mut spec = SessionSpec::new(format!("jmproxy {short}"), model);
    if let Some(temperature) = request.temperature {
        spec.temperature = temperature;
    }
    if let Some(max_tokens) = request.max_tokens {
        spec.max_tokens = max_tokens;
    }
    if let Some(presence_penalty) = request.presence_penalty {
        spec.presence_penalty = presence_penalty;
    }
    if let Some(frequency_penalty) = request.frequency_penalty {
        spec.frequency_penalty = frequency_penalty;
    }
    spec
}

/// Re-frames the backend stream to the caller, then releases the session.
async fn pump_stream(
    mut upstream: CompletionStream,
    mut translator: ChatStreamTranslator,
    lease: SessionLease,
    tx: mpsc::Sender<Bytes>,
    trace_id: String,
) {
    let mut decoder = LineDecoder::new();
    let mut caller_gone = false;

    'read: while let Some(item) = upstream.next_chunk().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(
                    event = "upstream_stream_error",
                    trace_id = %trace_id,
                    session_id = %lease.id(),
                    error = %err
                );
                let notice = ErrorResponse::new("network_error", format!("Network error: {err}"), None);
                if let Some(frame) = sse_json_bytes(&notice)
                    && tx.send(frame).await.is_err()
                {
                    caller_gone = true;
                }
                break;
            }
        };
        for line in decoder.push_bytes(&chunk) {
            if let Some(frame) = translator.translate_line(&line)
                && tx.send(frame).await.is_err()
            {
                caller_gone = true;
                break 'read;
            }
        }
    }

    if !caller_gone {
        let tail = decoder.finish();
        let mut frames: Vec<Bytes> = tail
            .and_then(|line| translator.translate_line(&line))
            .into_iter()
            .collect();
        frames.extend(translator.finish());
        for frame in frames {
            if tx.send(frame).await.is_err() {
                caller_gone = true;
                break;
            }
        }
    }

    let stats = translator.stats();
    info!(
        event = "stream_completed",
        trace_id = %trace_id,
        session_id = %lease.id(),
        chunks = stats.text,
        skipped = stats.skipped,
        malformed = stats.malformed,
        caller_gone
    );
    drop(upstream);
    let released = lease.release();
    debug!(event = "session_lease_ended", trace_id = %trace_id, state = %released);
}

fn reject(trace_id: &str, started_at: Instant, err: ProxyError) -> Response {
    warn!(
        event = "downstream_responded",
        trace_id = %trace_id,
        status = %err.status.as_u16(),
        error_body = %String::from_utf8_lossy(&err.body),
        elapsed_ms = started_at.elapsed().as_millis(),
        is_stream = false
    );
    let mut resp = error_response(err);
    insert_request_id(&mut resp, trace_id);
    resp
}

fn error_response(err: ProxyError) -> Response {
    let mut resp = Response::new(Body::from(err.body));
    *resp.status_mut() = err.status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut resp = Response::new(Body::from(body));
            *resp.status_mut() = status;
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            resp
        }
        Err(err) => error_response(ProxyError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            err.to_string(),
            None,
        )),
    }
}

fn sse_response(body: Body, trace_id: &str) -> Response {
    let mut resp = Response::new(body);
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    insert_request_id(&mut resp, trace_id);
    resp
}

fn insert_request_id(resp: &mut Response, trace_id: &str) {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        resp.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
}
