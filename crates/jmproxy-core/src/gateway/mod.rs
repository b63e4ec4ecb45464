mod client;
mod pacer;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use jmproxy_protocol::upstream::{SaveSessionRequest, SessionId};

use crate::error::GatewayError;

pub use client::{GatewayConfig, WreqGateway};
pub use pacer::Pacer;

/// Name and sampling parameters a session is saved with.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSpec {
    pub name: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: i64,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
}

impl SessionSpec {
    pub const DEFAULT_TEMPERATURE: f64 = 0.7;

    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            temperature: Self::DEFAULT_TEMPERATURE,
            max_tokens: 0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }

    pub fn to_save_request(&self, existing: Option<&SessionId>) -> SaveSessionRequest {
        SaveSessionRequest {
            id: existing.cloned(),
            name: self.name.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            max_token: self.max_tokens,
            presence_penalty: self.presence_penalty,
            frequency_penalty: self.frequency_penalty,
        }
    }
}

/// Raw byte chunks of an open completion stream.
///
/// An `Err` item ends the stream; nothing follows it.
#[derive(Debug)]
pub struct CompletionStream {
    rx: mpsc::Receiver<Result<Bytes, GatewayError>>,
}

impl CompletionStream {
    pub fn new(rx: mpsc::Receiver<Result<Bytes, GatewayError>>) -> Self {
        Self { rx }
    }

    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<Bytes, GatewayError>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }

    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, GatewayError>> {
        self.rx.recv().await
    }
}

/// The three backend operations.
#[async_trait]
pub trait SessionGateway: Send + Sync {
    /// Creates a session when `existing` is `None`, otherwise renames/reconfigures it.
    async fn save_session(
        &self,
        spec: &SessionSpec,
        existing: Option<&SessionId>,
    ) -> Result<SessionId, GatewayError>;

    async fn delete_session(&self, id: &SessionId) -> Result<(), GatewayError>;

    async fn stream_completion(
        &self,
        prompt: &str,
        session_id: &SessionId,
    ) -> Result<CompletionStream, GatewayError>;
}
