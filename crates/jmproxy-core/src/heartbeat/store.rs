use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use jmproxy_protocol::upstream::SessionId;

pub const HEARTBEAT_FILE: &str = "heartbeat.json";

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatStoreError {
    #[error("heartbeat store io at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("heartbeat store at {path} is not valid json: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct HeartbeatRecord {
    session_id: String,
}

/// Persists the heartbeat session id so restarts reuse it.
#[derive(Debug, Clone)]
pub struct HeartbeatStore {
    path: PathBuf,
}

impl HeartbeatStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_data_dir(data_dir: impl AsRef<Path>) -> Self {
        Self::new(data_dir.as_ref().join(HEARTBEAT_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<SessionId>, HeartbeatStoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(self.io_error(source)),
        };
        let record: HeartbeatRecord =
            serde_json::from_slice(&bytes).map_err(|source| HeartbeatStoreError::Decode {
                path: self.path.display().to_string(),
                source,
            })?;
        let id = record.session_id.trim();
        Ok((!id.is_empty()).then(|| SessionId::new(id)))
    }

    pub async fn save(&self, id: &SessionId) -> Result<(), HeartbeatStoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| self.io_error(source))?;
        }
        let record = HeartbeatRecord {
            session_id: id.as_str().to_string(),
        };
        let bytes = serde_json::to_vec_pretty(&record).map_err(|source| {
            HeartbeatStoreError::Decode {
                path: self.path.display().to_string(),
                source,
            }
        })?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|source| self.io_error(source))
    }

    fn io_error(&self, source: std::io::Error) -> HeartbeatStoreError {
        HeartbeatStoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}
