mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use bytes::Bytes;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

use jmproxy_common::{GlobalConfig, GlobalConfigPatch, SessionStrategyKind};
use jmproxy_core::{
    CleanupCounters, CredentialProvider, CredentialStore, GatewayError, REQUEST_ID_HEADER,
    Runtime, SessionGateway, TransportErrorKind, handler,
};
use jmproxy_protocol::upstream::SessionId;

use common::{Call, FakeGateway, credentials, eventually, rejected, test_config};

const BACKEND_FRAMES: &[&str] = &[
    "data: {\"data\":\"Hel\"}\n\n",
    "data: {\"data\":\"lo\"}\n\ndata: [DONE]\n\n",
];

struct TestServer {
    addr: SocketAddr,
    runtime: Runtime,
    server: JoinHandle<()>,
    client: wreq::Client,
}

impl TestServer {
    async fn start(
        config: GlobalConfig,
        gateway: &Arc<FakeGateway>,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        let gateway: Arc<dyn SessionGateway> = gateway.clone();
        let credentials: Arc<dyn CredentialProvider> = credentials;
        let runtime = Runtime::with_gateway(config, gateway, credentials).unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = runtime.router();
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Self {
            addr,
            runtime,
            server,
            client: wreq::Client::builder().build().unwrap(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    fn standby(&self) -> usize {
        self.runtime
            .core()
            .state()
            .strategy
            .pool()
            .map(|pool| pool.stats().standby)
            .unwrap_or_default()
    }

    async fn chat(&self, body: Vec<u8>) -> (u16, wreq::header::HeaderMap, String) {
        let resp = self
            .client
            .post(self.url("/v1/chat/completions"))
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let text = resp.text().await.unwrap();
        (status, headers, text)
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn stop(self) -> CleanupCounters {
        self.server.abort();
        self.runtime.shutdown().await
    }
}

fn chat_body(content: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "model": "qwen-2.5-72b",
        "stream": true,
        "messages": [{"role": "user", "content": content}],
    }))
    .unwrap()
}

fn frames(body: &str) -> Vec<&str> {
    body.split("\n\n")
        .map(|frame| frame.trim())
        .filter(|frame| !frame.is_empty())
        .collect()
}

fn frame_json(frame: &str) -> Value {
    serde_json::from_str(frame.strip_prefix("data: ").unwrap()).unwrap()
}

fn error_type(body: &str) -> String {
    let value: Value = serde_json::from_str(body).unwrap();
    value["error"]["type"].as_str().unwrap().to_string()
}

fn pool_config(capacity: usize) -> GlobalConfig {
    test_config(GlobalConfigPatch {
        session_strategy: Some(SessionStrategyKind::Pool),
        pool_capacity: Some(capacity),
        ..Default::default()
    })
}

#[tokio::test]
async fn pooled_request_streams_and_recycles_session() {
    let gateway = FakeGateway::new(100);
    gateway.set_stream(BACKEND_FRAMES);
    let server = TestServer::start(pool_config(1), &gateway, credentials()).await;
    assert!(eventually(Duration::from_secs(2), || server.standby() == 1).await);

    let (status, headers, body) = server.chat(chat_body("hi")).await;
    assert_eq!(status, 200);
    assert_eq!(headers.get("content-type").unwrap(), "text/event-stream");
    assert_eq!(headers.get("cache-control").unwrap(), "no-cache");
    assert!(headers.get(REQUEST_ID_HEADER).is_some());

    let frames = frames(&body);
    assert_eq!(frames.len(), 4, "unexpected body {body}");
    let first = frame_json(frames[0]);
    assert_eq!(first["object"], "chat.completion.chunk");
    assert_eq!(first["model"], "qwen-2.5-72b");
    assert_eq!(first["choices"][0]["delta"]["content"], "Hel");
    assert_eq!(frame_json(frames[1])["choices"][0]["delta"]["content"], "lo");
    assert_eq!(frame_json(frames[2])["choices"][0]["finish_reason"], "stop");
    assert_eq!(frames[3], "data: [DONE]");

    let id = SessionId::from(100);
    assert_eq!(
        gateway.streams(),
        vec![("User: hi".to_string(), id.clone())]
    );
    let updates = gateway.updates_of(&id);
    assert_eq!(updates.len(), 1);
    assert!(matches!(&updates[0], Call::Save { name, .. } if name.starts_with("jmproxy ")));

    assert!(eventually(Duration::from_secs(2), || gateway.deletes().contains(&id)).await);
    let counters = server.stop().await;
    assert!(gateway.creates().len() >= 2, "pool was not replenished");
    assert!(counters.deleted >= 1);
}

#[tokio::test(start_paused = true)]
async fn prompt_waits_out_pacing_after_configuration() {
    let gateway = FakeGateway::new(300);
    gateway.set_stream(BACKEND_FRAMES);
    let config = test_config(GlobalConfigPatch {
        session_strategy: Some(SessionStrategyKind::Pool),
        pool_capacity: Some(1),
        pacing_delay_ms: Some(1500),
        ..Default::default()
    });
    let backend: Arc<dyn SessionGateway> = gateway.clone();
    let provider: Arc<dyn CredentialProvider> = credentials();
    let runtime = Runtime::with_gateway(config, backend, provider).unwrap();
    let state = runtime.core().state();
    assert!(
        eventually(Duration::from_secs(1), || {
            state.strategy.pool().is_some_and(|pool| pool.stats().standby == 1)
        })
        .await
    );

    let resp = handler::chat_completions(State(state.clone()), Bytes::from(chat_body("hi"))).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("data: [DONE]"));

    let calls = gateway.timed_calls();
    let configured = calls
        .iter()
        .find_map(|(at, call)| matches!(call, Call::Save { id: Some(_), .. }).then_some(*at))
        .unwrap();
    let streamed = calls
        .iter()
        .find_map(|(at, call)| matches!(call, Call::Stream { .. }).then_some(*at))
        .unwrap();
    assert!(streamed >= configured + Duration::from_millis(1500));

    runtime.shutdown().await;
}

#[tokio::test]
async fn missing_messages_is_rejected() {
    let gateway = FakeGateway::new(100);
    let server = TestServer::start(pool_config(1), &gateway, credentials()).await;

    let body = serde_json::to_vec(&json!({"model": "qwen-2.5-72b"})).unwrap();
    let (status, headers, body) = server.chat(body).await;
    assert_eq!(status, 400);
    assert_eq!(error_type(&body), "invalid_request_error");
    assert!(headers.get(REQUEST_ID_HEADER).is_some());

    let (status, _, body) = server.chat(b"{not json".to_vec()).await;
    assert_eq!(status, 400);
    assert!(body.contains("Invalid JSON"));

    assert!(gateway.streams().is_empty());
    server.stop().await;
}

#[tokio::test]
async fn missing_credentials_is_unauthorized() {
    let gateway = FakeGateway::new(100);
    let server = TestServer::start(
        pool_config(1),
        &gateway,
        Arc::new(CredentialStore::default()),
    )
    .await;

    let (status, _, body) = server.chat(chat_body("hi")).await;
    assert_eq!(status, 401);
    assert_eq!(error_type(&body), "authentication_error");
    assert!(gateway.calls().is_empty());
    server.stop().await;
}

#[tokio::test]
async fn exhausted_pool_is_service_unavailable() {
    let gateway = FakeGateway::new(100);
    gateway.set_create_delay(Duration::from_secs(60));
    let config = test_config(GlobalConfigPatch {
        pool_capacity: Some(1),
        pool_acquire_timeout_ms: Some(50),
        ..Default::default()
    });
    let server = TestServer::start(config, &gateway, credentials()).await;

    let (status, _, body) = server.chat(chat_body("hi")).await;
    assert_eq!(status, 503);
    assert_eq!(error_type(&body), "service_unavailable");
    assert!(gateway.streams().is_empty());
    server.stop().await;
}

#[tokio::test]
async fn failed_configuration_returns_session_to_pool() {
    let gateway = FakeGateway::new(100);
    gateway.set_stream(BACKEND_FRAMES);
    let server = TestServer::start(pool_config(1), &gateway, credentials()).await;
    assert!(eventually(Duration::from_secs(2), || server.standby() == 1).await);

    gateway.fail_next_update(rejected("rename refused"));
    let (status, _, body) = server.chat(chat_body("hi")).await;
    assert_eq!(status, 500);
    assert_eq!(error_type(&body), "upstream_error");
    assert!(body.contains("rename refused"));
    assert!(gateway.streams().is_empty());
    assert!(!gateway.deletes().contains(&SessionId::from(100)));

    // The same session serves the next request.
    let (status, _, _) = server.chat(chat_body("again")).await;
    assert_eq!(status, 200);
    assert_eq!(gateway.updates_of(&SessionId::from(100)).len(), 2);
    server.stop().await;
}

#[tokio::test]
async fn failed_stream_open_schedules_deletion() {
    let gateway = FakeGateway::new(100);
    gateway.fail_next_stream(GatewayError::Transport {
        kind: TransportErrorKind::Connect,
        message: "connection refused".to_string(),
    });
    let server = TestServer::start(pool_config(1), &gateway, credentials()).await;
    assert!(eventually(Duration::from_secs(2), || server.standby() == 1).await);

    let (status, _, body) = server.chat(chat_body("hi")).await;
    assert_eq!(status, 500);
    assert_eq!(error_type(&body), "network_error");
    assert!(
        eventually(Duration::from_secs(2), || gateway
            .deletes()
            .contains(&SessionId::from(100)))
        .await
    );
    server.stop().await;
}

#[tokio::test]
async fn mid_stream_failure_still_terminates_stream() {
    let gateway = FakeGateway::new(100);
    gateway.set_stream(&["data: {\"data\":\"partial\"}\n\n"]);
    gateway.set_stream_tail_error(GatewayError::Transport {
        kind: TransportErrorKind::ReadTimeout,
        message: "idle".to_string(),
    });
    let server = TestServer::start(pool_config(1), &gateway, credentials()).await;
    assert!(eventually(Duration::from_secs(2), || server.standby() == 1).await);

    let (status, _, body) = server.chat(chat_body("hi")).await;
    assert_eq!(status, 200);
    let frames = frames(&body);
    assert_eq!(frames.len(), 4, "unexpected body {body}");
    assert_eq!(frame_json(frames[0])["choices"][0]["delta"]["content"], "partial");
    assert_eq!(frame_json(frames[1])["error"]["type"], "network_error");
    assert_eq!(frame_json(frames[2])["choices"][0]["finish_reason"], "stop");
    assert_eq!(frames[3], "data: [DONE]");
    server.stop().await;
}

#[tokio::test]
async fn per_request_sessions_carry_request_parameters() {
    let gateway = FakeGateway::new(300);
    gateway.set_stream(BACKEND_FRAMES);
    let config = test_config(GlobalConfigPatch {
        session_strategy: Some(SessionStrategyKind::PerRequest),
        ..Default::default()
    });
    let server = TestServer::start(config, &gateway, credentials()).await;

    let body = serde_json::to_vec(&json!({
        "model": "deepseek-v3",
        "temperature": 0.2,
        "messages": [{"role": "user", "content": "hi"}],
    }))
    .unwrap();
    let (status, _, _) = server.chat(body).await;
    assert_eq!(status, 200);

    let creates = gateway.creates();
    assert_eq!(creates.len(), 1);
    let Call::Save {
        name,
        model,
        temperature,
        ..
    } = &creates[0]
    else {
        panic!("unexpected call {:?}", creates[0]);
    };
    assert!(name.starts_with("jmproxy "));
    assert_eq!(model, "deepseek-v3");
    assert_eq!(*temperature, 0.2);
    assert!(gateway.updates_of(&SessionId::from(300)).is_empty());

    server.stop().await;
    assert_eq!(gateway.deletes(), vec![SessionId::from(300)]);
}

#[tokio::test]
async fn fixed_session_is_reused_and_never_deleted() {
    let gateway = FakeGateway::new(1);
    gateway.set_stream(BACKEND_FRAMES);
    let config = test_config(GlobalConfigPatch {
        session_strategy: Some(SessionStrategyKind::Fixed),
        fixed_session_id: Some("555".to_string()),
        ..Default::default()
    });
    let server = TestServer::start(config, &gateway, credentials()).await;

    for _ in 0..2 {
        let (status, _, _) = server.chat(chat_body("hi")).await;
        assert_eq!(status, 200);
    }
    server.stop().await;

    assert_eq!(gateway.updates_of(&SessionId::from(555)).len(), 2);
    assert!(gateway.creates().is_empty());
    assert!(gateway.deletes().is_empty());
}

#[tokio::test]
async fn auto_delete_disabled_retains_sessions() {
    let gateway = FakeGateway::new(100);
    gateway.set_stream(BACKEND_FRAMES);
    let config = test_config(GlobalConfigPatch {
        pool_capacity: Some(1),
        auto_delete: Some(false),
        ..Default::default()
    });
    let server = TestServer::start(config, &gateway, credentials()).await;
    assert!(eventually(Duration::from_secs(2), || server.standby() == 1).await);

    let (status, _, _) = server.chat(chat_body("hi")).await;
    assert_eq!(status, 200);
    server.stop().await;
    assert!(gateway.deletes().is_empty());
}

#[tokio::test]
async fn info_endpoints_report_state() {
    let gateway = FakeGateway::new(100);
    let server = TestServer::start(pool_config(2), &gateway, credentials()).await;

    let (status, root) = server.get("/").await;
    assert_eq!(status, 200);
    assert_eq!(root["status"], "ok");
    assert_eq!(root["strategy"], "pool");

    let (status, models) = server.get("/v1/models").await;
    assert_eq!(status, 200);
    assert_eq!(models["object"], "list");
    let ids: Vec<&str> = models["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|model| model["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["qwen-2.5-72b", "deepseek-v3", "deepseek-r1"]);

    let (status, heartbeat) = server.get("/heartbeat/status").await;
    assert_eq!(status, 200);
    assert_eq!(heartbeat["enabled"], false);
    assert_eq!(heartbeat["credentials_present"], true);
    assert_eq!(heartbeat["pool"]["capacity"], 2);
    assert!(heartbeat["session_id"].is_null());

    server.stop().await;
}
