use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::session::SessionId;

/// completion-stream body. The backend only accepts one flattened text blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    pub text: String,
    #[serde(default)]
    pub files: Vec<Value>,
    /// Sent as a string here, unlike the session endpoints.
    pub session_id: String,
}

impl CompletionRequest {
    pub fn new(text: impl Into<String>, session_id: &SessionId) -> Self {
        Self {
            text: text.into(),
            files: Vec::new(),
            session_id: session_id.as_str().to_string(),
        }
    }
}
