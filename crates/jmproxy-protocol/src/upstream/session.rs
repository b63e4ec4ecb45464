use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Backend session identifier.
///
/// The proxy treats it as an opaque string; on the wire the backend expects an
/// integer in session-save/delete bodies, so numeric ids serialize as numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for SessionId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0.parse::<i64>() {
            Ok(number) => serializer.serialize_i64(number),
            Err(_) => serializer.serialize_str(&self.0),
        }
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(i64),
            Str(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Int(value) => SessionId::from(value),
            Raw::Str(value) => SessionId(value),
        })
    }
}

/// session-save body. Omitting `id` creates a session, setting it updates one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SessionId>,
    pub name: String,
    pub model: String,
    pub temperature: f64,
    /// `0` lets the backend pick its default.
    pub max_token: i64,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteSessionRequest {
    pub ids: Vec<SessionId>,
}

/// Response envelope shared by the session endpoints. `code == 0` is success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendEnvelope {
    pub code: i64,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl BackendEnvelope {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    pub fn message(&self) -> &str {
        self.msg.as_deref().unwrap_or("no message")
    }

    /// Session id carried by a save response: `data.id`, or `data` itself.
    pub fn session_id(&self) -> Option<SessionId> {
        let data = self.data.as_ref()?;
        let raw = match data {
            Value::Object(map) => map.get("id")?,
            other => other,
        };
        match raw {
            Value::Number(number) => number.as_i64().map(SessionId::from),
            Value::String(text) if !text.trim().is_empty() => Some(SessionId::new(text.trim())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_request_uses_backend_field_names() {
        let req = SaveSessionRequest {
            id: Some(SessionId::new("68187")),
            name: "heartbeat".to_string(),
            model: "qwen-2.5-72b".to_string(),
            temperature: 0.7,
            max_token: 0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            serde_json::json!({
                "id": 68187,
                "name": "heartbeat",
                "model": "qwen-2.5-72b",
                "temperature": 0.7,
                "maxToken": 0,
                "presencePenalty": 0.0,
                "frequencyPenalty": 0.0
            })
        );
    }

    #[test]
    fn create_request_omits_id() {
        let req = SaveSessionRequest {
            id: None,
            name: "n".to_string(),
            model: "m".to_string(),
            temperature: 0.7,
            max_token: 0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert!(value.get("id").is_none());
    }

    #[test]
    fn envelope_extracts_id_from_object_or_scalar() {
        let nested: BackendEnvelope =
            serde_json::from_str(r#"{"code":0,"msg":"ok","data":{"id":100,"name":"x"}}"#).unwrap();
        assert_eq!(nested.session_id(), Some(SessionId::new("100")));

        let scalar: BackendEnvelope = serde_json::from_str(r#"{"code":0,"data":"101"}"#).unwrap();
        assert_eq!(scalar.session_id(), Some(SessionId::new("101")));

        let empty: BackendEnvelope = serde_json::from_str(r#"{"code":0}"#).unwrap();
        assert_eq!(empty.session_id(), None);
    }

    #[test]
    fn rejected_envelope_reports_message() {
        let env: BackendEnvelope =
            serde_json::from_str(r#"{"code":401,"msg":"token expired"}"#).unwrap();
        assert!(!env.is_ok());
        assert_eq!(env.message(), "token expired");
    }

    #[test]
    fn non_numeric_session_id_serializes_as_string() {
        let req = DeleteSessionRequest {
            ids: vec![SessionId::new("abc"), SessionId::from(7)],
        };
        assert_eq!(
            serde_json::to_string(&req).unwrap(),
            r#"{"ids":["abc",7]}"#
        );
    }
}
