#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use jmproxy_common::{GlobalConfig, GlobalConfigPatch};
use jmproxy_core::{
    CompletionStream, CredentialStore, Credentials, GatewayError, SessionGateway, SessionSpec,
};
use jmproxy_protocol::upstream::SessionId;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Save {
        id: Option<SessionId>,
        name: String,
        model: String,
        temperature: f64,
    },
    Delete(SessionId),
    Stream {
        prompt: String,
        session_id: SessionId,
    },
}

/// Scripted in-memory backend.
pub struct FakeGateway {
    next_id: AtomicI64,
    calls: Mutex<Vec<(Instant, Call)>>,
    create_delay: Mutex<Duration>,
    create_failures: Mutex<VecDeque<GatewayError>>,
    update_failures: Mutex<VecDeque<GatewayError>>,
    stream_failures: Mutex<VecDeque<GatewayError>>,
    stream_chunks: Mutex<Vec<Bytes>>,
    stream_tail_error: Mutex<Option<GatewayError>>,
}

impl FakeGateway {
    pub fn new(first_id: i64) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(first_id),
            calls: Mutex::new(Vec::new()),
            create_delay: Mutex::new(Duration::ZERO),
            create_failures: Mutex::new(VecDeque::new()),
            update_failures: Mutex::new(VecDeque::new()),
            stream_failures: Mutex::new(VecDeque::new()),
            stream_chunks: Mutex::new(Vec::new()),
            stream_tail_error: Mutex::new(None),
        })
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn fail_next_create(&self, err: GatewayError) {
        self.create_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_next_update(&self, err: GatewayError) {
        self.update_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_next_stream(&self, err: GatewayError) {
        self.stream_failures.lock().unwrap().push_back(err);
    }

    pub fn set_stream(&self, chunks: &[&str]) {
        *self.stream_chunks.lock().unwrap() = chunks
            .iter()
            .map(|chunk| Bytes::copy_from_slice(chunk.as_bytes()))
            .collect();
    }

    pub fn set_stream_tail_error(&self, err: GatewayError) {
        *self.stream_tail_error.lock().unwrap() = Some(err);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.timed_calls().into_iter().map(|(_, call)| call).collect()
    }

    /// Calls with the (tokio) instant they reached the backend.
    pub fn timed_calls(&self) -> Vec<(Instant, Call)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn creates(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Save { id: None, .. }))
            .collect()
    }

    pub fn updates_of(&self, target: &SessionId) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Save { id: Some(id), .. } if id == target))
            .collect()
    }

    pub fn deletes(&self) -> Vec<SessionId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Delete(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn streams(&self) -> Vec<(String, SessionId)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Stream { prompt, session_id } => Some((prompt, session_id)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push((Instant::now(), call));
    }
}

#[async_trait]
impl SessionGateway for FakeGateway {
    async fn save_session(
        &self,
        spec: &SessionSpec,
        existing: Option<&SessionId>,
    ) -> Result<SessionId, GatewayError> {
        self.record(Call::Save {
            id: existing.cloned(),
            name: spec.name.clone(),
            model: spec.model.clone(),
            temperature: spec.temperature,
        });
        match existing {
            Some(id) => match self.update_failures.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok(id.clone()),
            },
            None => {
                let delay = *self.create_delay.lock().unwrap();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if let Some(err) = self.create_failures.lock().unwrap().pop_front() {
                    return Err(err);
                }
                Ok(SessionId::from(self.next_id.fetch_add(1, Ordering::SeqCst)))
            }
        }
    }

    async fn delete_session(&self, id: &SessionId) -> Result<(), GatewayError> {
        self.record(Call::Delete(id.clone()));
        Ok(())
    }

    async fn stream_completion(
        &self,
        prompt: &str,
        session_id: &SessionId,
    ) -> Result<CompletionStream, GatewayError> {
        self.record(Call::Stream {
            prompt: prompt.to_string(),
            session_id: session_id.clone(),
        });
        if let Some(err) = self.stream_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let chunks = self.stream_chunks.lock().unwrap().clone();
        let tail = self.stream_tail_error.lock().unwrap().clone();
        let (tx, stream) = CompletionStream::channel(chunks.len() + 1);
        for chunk in chunks {
            let _ = tx.try_send(Ok(chunk));
        }
        if let Some(err) = tail {
            let _ = tx.try_send(Err(err));
        }
        Ok(stream)
    }
}

pub fn rejected(message: &str) -> GatewayError {
    GatewayError::BackendRejected {
        code: 500,
        message: message.to_string(),
    }
}

pub fn credentials() -> Arc<CredentialStore> {
    Arc::new(CredentialStore::new(Some(Credentials::new(
        "test-jm-token",
        "test-sdp-session",
    ))))
}

pub fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "jmproxy-test-{}-{name}-{}",
        std::process::id(),
        uuid_like()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn uuid_like() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos()
}

/// Defaults tuned for tests: no pacing, no heartbeat, no grace delay.
pub fn test_config(patch: GlobalConfigPatch) -> GlobalConfig {
    let mut base = GlobalConfigPatch {
        data_dir: Some(temp_dir("data").display().to_string()),
        pacing_delay_ms: Some(0),
        delete_grace_ms: Some(0),
        heartbeat_enabled: Some(false),
        pool_acquire_timeout_ms: Some(2000),
        ..Default::default()
    };
    base.overlay(patch);
    base.into_config().unwrap()
}

/// Polls `check` until it holds or `timeout` elapses.
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
